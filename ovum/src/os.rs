use std::ffi::CStr;
use std::fmt::Debug;
use std::os::raw::c_void;
use std::path::Path;

/// A symbol resolved from a native library.
pub type RawSymbol = *mut c_void;

/// A loaded native library. Released when dropped; the handle is owned by the
/// module that declared the library.
pub trait NativeLibrary: Debug {
	fn entry_point(&self, name: &CStr) -> Option<RawSymbol>;
}

/// The OS surface the loader needs for native extension modules. The embedder
/// supplies an implementation (dlopen/LoadLibrary shaped); the VM itself never
/// touches the platform APIs directly.
pub trait LibraryLoader: Debug {
	fn open(&self, path: &Path) -> std::io::Result<Box<dyn NativeLibrary>>;
}

/// The default loader for embeddings that load no native modules. Any module
/// that declares a native library fails to load under it.
#[derive(Debug, Default)]
pub struct NoNativeLibraries;

impl LibraryLoader for NoNativeLibraries {
	fn open(&self, path: &Path) -> std::io::Result<Box<dyn NativeLibrary>> {
		Err(std::io::Error::new(
			std::io::ErrorKind::Unsupported,
			format!("native libraries are not available in this embedding: {}", path.display()),
		))
	}
}
