use std::path::{Path, PathBuf};

use tracing::debug;

use crate::module::ModuleVersion;

/// File extension of module files.
pub const EXTENSION: &str = "ovm";

const VERSION_SEPARATOR: &str = "-";

/// Locates module files on disk. Only the startup module is opened by an
/// explicit path; every dependency goes through here. Three directories are
/// searched in order: `<startup>/lib`, the startup directory itself, and the
/// configured module library path. Within each, versioned layouts are probed
/// before unversioned ones:
///
/// ```text
///   $dir/$name-$version/$name.ovm
///   $dir/$name-$version.ovm
///   $dir/$name/$name.ovm
///   $dir/$name.ovm
/// ```
///
/// The first existing file wins.
#[derive(Debug)]
pub struct ModuleFinder {
	search_dirs: Vec<PathBuf>,
}

impl ModuleFinder {
	pub fn new(startup_path: &Path, module_path: Option<&Path>) -> Self {
		let mut search_dirs = vec![startup_path.join("lib"), startup_path.to_path_buf()];
		if let Some(path) = module_path {
			search_dirs.push(path.to_path_buf());
		}
		Self { search_dirs }
	}

	pub fn search_directories(&self) -> &[PathBuf] {
		&self.search_dirs
	}

	pub fn find_module_path(&self, name: &str, version: Option<&ModuleVersion>) -> Option<PathBuf> {
		for dir in &self.search_dirs {
			for candidate in candidate_paths(dir, name, version) {
				if candidate.is_file() {
					debug!(path = %candidate.display(), "located module file");
					return Some(candidate);
				}
			}
		}
		None
	}
}

/// The probe order within one directory. Versioned candidates are omitted
/// when no version is required.
fn candidate_paths(dir: &Path, name: &str, version: Option<&ModuleVersion>) -> Vec<PathBuf> {
	let mut candidates = Vec::with_capacity(4);
	if let Some(version) = version {
		let versioned = format!("{name}{VERSION_SEPARATOR}{}", version_string(version));
		candidates.push(dir.join(&versioned).join(format!("{name}.{EXTENSION}")));
		candidates.push(dir.join(format!("{versioned}.{EXTENSION}")));
	}
	candidates.push(dir.join(name).join(format!("{name}.{EXTENSION}")));
	candidates.push(dir.join(format!("{name}.{EXTENSION}")));
	candidates
}

/// Dot-separated decimal form used in versioned file names.
pub fn version_string(version: &ModuleVersion) -> String {
	format!(
		"{}.{}.{}.{}",
		version.major, version.minor, version.patch, version.revision
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	const VERSION: ModuleVersion = ModuleVersion { major: 2, minor: 3, patch: 0, revision: 0 };

	#[test]
	fn versioned_probe_order() {
		let candidates = candidate_paths(Path::new("/lib"), "acorn", Some(&VERSION));
		let expected: Vec<PathBuf> = vec![
			"/lib/acorn-2.3.0.0/acorn.ovm".into(),
			"/lib/acorn-2.3.0.0.ovm".into(),
			"/lib/acorn/acorn.ovm".into(),
			"/lib/acorn.ovm".into(),
		];
		assert_eq!(candidates, expected);
	}

	#[test]
	fn unversioned_probes_skip_versioned_layouts() {
		let candidates = candidate_paths(Path::new("/lib"), "acorn", None);
		let expected: Vec<PathBuf> =
			vec!["/lib/acorn/acorn.ovm".into(), "/lib/acorn.ovm".into()];
		assert_eq!(candidates, expected);
	}

	#[test]
	fn search_directory_order() {
		let finder = ModuleFinder::new(Path::new("/app"), Some(Path::new("/opt/modules")));
		let dirs: Vec<PathBuf> =
			vec!["/app/lib".into(), "/app".into(), "/opt/modules".into()];
		assert_eq!(finder.search_directories(), dirs.as_slice());
	}
}
