use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;

use derivative::Derivative;
use tracing::debug;

use crate::ee::refsignature::RefSignaturePool;
use crate::error::{ModuleLoadError, ModuleLoadErrorKind};
use crate::module::{Module, ModuleFinder, ModulePool, ModuleVersion};
use crate::object::r#type::Type;
use crate::os::{LibraryLoader, NoNativeLibraries, RawSymbol};
use crate::strings::{IStr, StringPool};
use crate::value::{StaticRef, Value};

/// Configuration for a new VM instance.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VmParams {
	/// The directory the startup module lives in.
	pub startup_path: PathBuf,
	/// An additional module library directory, searched after the startup
	/// directory.
	pub module_path: Option<PathBuf>,
	#[derivative(Debug = "ignore")]
	pub library_loader: Box<dyn LibraryLoader>,
	pub verbose: bool,
}

impl Default for VmParams {
	fn default() -> Self {
		Self {
			startup_path: PathBuf::from("."),
			module_path: None,
			library_loader: Box::new(NoNativeLibraries),
			verbose: false,
		}
	}
}

/// Named types with runtime-privileged semantics. The first loaded type whose
/// full name matches a slot is installed into it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(usize)]
pub enum StandardType {
	Object,
	Boolean,
	Int,
	UInt,
	Real,
	String,
	List,
	Hash,
	Method,
	Iterator,
	Type,
	Error,
	TypeError,
	MemoryError,
	OverflowError,
	DivideByZeroError,
	NullReferenceError,
	MemberNotFoundError,
}

const STANDARD_TYPE_COUNT: usize = 18;

/// Full names of the standard types, and the native symbol each of the
/// extended ones must export for its instance initializer.
const STANDARD_TYPE_NAMES: [(&str, StandardType, Option<&str>); STANDARD_TYPE_COUNT] = [
	("aves.Object", StandardType::Object, None),
	("aves.Boolean", StandardType::Boolean, None),
	("aves.Int", StandardType::Int, None),
	("aves.UInt", StandardType::UInt, None),
	("aves.Real", StandardType::Real, None),
	("aves.String", StandardType::String, None),
	("aves.List", StandardType::List, Some("InitListInstance")),
	("aves.Hash", StandardType::Hash, Some("InitHashInstance")),
	("aves.Method", StandardType::Method, None),
	("aves.Iterator", StandardType::Iterator, None),
	("aves.Type", StandardType::Type, Some("InitTypeToken")),
	("aves.Error", StandardType::Error, None),
	("aves.TypeError", StandardType::TypeError, None),
	("aves.MemoryError", StandardType::MemoryError, None),
	("aves.OverflowError", StandardType::OverflowError, None),
	("aves.DivideByZeroError", StandardType::DivideByZeroError, None),
	("aves.NullReferenceError", StandardType::NullReferenceError, None),
	("aves.MemberNotFoundError", StandardType::MemberNotFoundError, None),
];

pub struct StandardTypes {
	slots: RefCell<Vec<Option<Rc<Type>>>>,
}

impl StandardTypes {
	fn new() -> Self {
		Self { slots: RefCell::new(vec![None; STANDARD_TYPE_COUNT]) }
	}

	pub fn get(&self, kind: StandardType) -> Option<Rc<Type>> {
		self.slots.borrow()[kind as usize].clone()
	}

	fn set(&self, kind: StandardType, ty: Rc<Type>) -> bool {
		let mut slots = self.slots.borrow_mut();
		let slot = &mut slots[kind as usize];
		if slot.is_some() {
			return false;
		}
		*slot = Some(ty);
		true
	}
}

impl std::fmt::Debug for StandardTypes {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let filled = self.slots.borrow().iter().filter(|s| s.is_some()).count();
		write!(f, "StandardTypes[{filled}/{STANDARD_TYPE_COUNT}]")
	}
}

/// Native instance initializers for the extended standard types. The
/// interpreter invokes these when constructing the corresponding values.
#[derive(Debug, Default)]
pub struct StandardTypeIniters {
	pub init_list_instance: Cell<Option<RawSymbol>>,
	pub init_hash_instance: Cell<Option<RawSymbol>>,
	pub init_type_token: Cell<Option<RawSymbol>>,
}

/// The VM instance: the string intern pool, the ref-signature pool, the
/// module pool and finder, and the standard-type registry. A single `Rc<Vm>`
/// handle is shared by everything the VM owns.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Vm {
	strings: StringPool,
	#[derivative(Debug = "ignore")]
	ref_signatures: RefSignaturePool,
	module_pool: ModulePool,
	finder: ModuleFinder,
	types: StandardTypes,
	#[derivative(Debug = "ignore")]
	functions: StandardTypeIniters,
	#[derivative(Debug = "ignore")]
	library_loader: Box<dyn LibraryLoader>,
	#[derivative(Debug = "ignore")]
	static_roots: RefCell<Vec<Rc<StaticRef>>>,
	verbose: bool,
}

impl Vm {
	pub fn new(params: VmParams) -> Rc<Vm> {
		let finder = ModuleFinder::new(&params.startup_path, params.module_path.as_deref());
		Rc::new(Vm {
			strings: StringPool::new(),
			ref_signatures: RefSignaturePool::new(),
			module_pool: ModulePool::new(),
			finder,
			types: StandardTypes::new(),
			functions: StandardTypeIniters::default(),
			library_loader: params.library_loader,
			static_roots: RefCell::new(Vec::new()),
			verbose: params.verbose,
		})
	}

	#[inline]
	pub fn strings(&self) -> &StringPool {
		&self.strings
	}

	#[inline]
	pub fn ref_signatures(&self) -> &RefSignaturePool {
		&self.ref_signatures
	}

	#[inline]
	pub fn module_pool(&self) -> &ModulePool {
		&self.module_pool
	}

	#[inline]
	pub fn finder(&self) -> &ModuleFinder {
		&self.finder
	}

	#[inline]
	pub fn types(&self) -> &StandardTypes {
		&self.types
	}

	#[inline]
	pub fn functions(&self) -> &StandardTypeIniters {
		&self.functions
	}

	#[inline]
	pub fn library_loader(&self) -> &dyn LibraryLoader {
		&*self.library_loader
	}

	#[inline]
	pub fn verbose(&self) -> bool {
		self.verbose
	}

	pub fn intern(&self, value: &str) -> IStr {
		self.strings.intern(value)
	}

	/// Opens a module by name through the finder, or returns the loaded one.
	pub fn open_module(
		self: &Rc<Self>,
		name: &str,
		version: Option<&ModuleVersion>,
	) -> Result<Rc<Module>, ModuleLoadError> {
		Module::open_by_name(self, name, version)
	}

	/// Registers a GC static root holding `value`.
	pub fn add_static_reference(&self, value: Value) -> Rc<StaticRef> {
		let cell = Rc::new(StaticRef::new(value));
		self.static_roots.borrow_mut().push(cell.clone());
		cell
	}

	pub fn static_root_count(&self) -> usize {
		self.static_roots.borrow().len()
	}

	/// Installs `ty` into the standard-type registry if its full name names a
	/// standard type and the slot is still free. Extended standard types must
	/// export their instance initializer from the declaring module's native
	/// library.
	pub(crate) fn try_register_standard_type(
		&self,
		module: &Rc<Module>,
		ty: &Rc<Type>,
	) -> Result<(), ModuleLoadErrorKind> {
		let Some((_, kind, initer)) = STANDARD_TYPE_NAMES
			.iter()
			.find(|(name, _, _)| *name == ty.full_name().as_str())
		else {
			return Ok(());
		};

		if !self.types.set(*kind, ty.clone()) {
			// Another module got there first; this type is an ordinary type.
			return Ok(());
		}
		debug!(name = %ty.full_name(), "registered standard type");

		if let Some(initer) = initer {
			let symbol_name = std::ffi::CString::new(*initer)
				.expect("standard type initializer names contain no NUL");
			let symbol = module
				.find_native_entry_point(&symbol_name)
				.ok_or(ModuleLoadErrorKind::MissingStandardTypeIniter)?;
			match kind {
				StandardType::List => self.functions.init_list_instance.set(Some(symbol)),
				StandardType::Hash => self.functions.init_hash_instance.set(Some(symbol)),
				StandardType::Type => self.functions.init_type_token.set(Some(symbol)),
				_ => {}
			}
		}
		Ok(())
	}
}
