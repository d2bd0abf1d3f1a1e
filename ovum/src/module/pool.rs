use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use crate::module::{Module, ModuleVersion};

/// The set of loaded (and currently loading) modules, keyed by name and
/// version. Modules are registered here before their body sections are read,
/// so a dependency cycle shows up as a pool hit on a module that is not yet
/// fully opened.
#[derive(Default)]
pub struct ModulePool {
	modules: RefCell<Vec<Rc<Module>>>,
}

impl ModulePool {
	pub fn new() -> Self {
		Self::default()
	}

	/// Finds a loaded module. With no version, any module with the name
	/// matches; with a version, only an exact match does.
	pub fn get(&self, name: &str, version: Option<&ModuleVersion>) -> Option<Rc<Module>> {
		self.modules
			.borrow()
			.iter()
			.find(|m| {
				m.name().as_str() == name
					&& version.map_or(true, |v| m.version() == *v)
			})
			.cloned()
	}

	/// Registers a module. Fails when an identical (name, version) pair is
	/// already present.
	pub fn add(&self, module: &Rc<Module>) -> bool {
		let mut modules = self.modules.borrow_mut();
		let duplicate = modules
			.iter()
			.any(|m| m.name() == module.name() && m.version() == module.version());
		if duplicate {
			return false;
		}
		modules.push(module.clone());
		true
	}

	/// Removes a partially loaded module after a failed open.
	pub fn remove(&self, module: &Rc<Module>) {
		self.modules.borrow_mut().retain(|m| !Rc::ptr_eq(m, module));
	}

	pub fn len(&self) -> usize {
		self.modules.borrow().len()
	}

	pub fn is_empty(&self) -> bool {
		self.modules.borrow().is_empty()
	}
}

impl Debug for ModulePool {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let modules = self.modules.borrow();
		let mut dbg = f.debug_list();
		for module in modules.iter() {
			dbg.entry(&format_args!("{} {}", module.name(), module.version()));
		}
		dbg.finish()
	}
}
