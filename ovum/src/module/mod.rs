use std::cell::{Cell, RefCell};
use std::ffi::CStr;
use std::fmt::{Debug, Display, Formatter};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use bitflags::bitflags;
use derivative::Derivative;
use fxhash::FxHashMap;
use tracing::debug;

use crate::error::{ModuleLoadError, ModuleLoadErrorKind};
use crate::ffi::{NativeModuleMain, TypeIniter};
use crate::object::field::{Field, Property};
use crate::object::member::{Member, MemberFlags};
use crate::object::method::{
	CatchClause, Method, MethodBody, MethodFlags, NativeMethod, OverloadDesc, TryBlock,
	TryBlockHandler,
};
use crate::object::r#type::{Operator, Type, TypeFlags};
use crate::object::special_names;
use crate::os::{NativeLibrary, RawSymbol};
use crate::strings::IStr;
use crate::token::{Token, TokenKind};
use crate::value::{Value, ValueData};
use crate::vm::{StandardType, Vm};

pub mod finder;
pub mod pool;
pub mod reader;

pub use finder::ModuleFinder;
pub use pool::ModulePool;
pub use reader::ModuleReader;

use reader::ModuleReader as Reader;

/// The magic number present in every module file.
pub const MAGIC: [u8; 4] = *b"OVMM";

/// The first byte of the data region; everything before it is the fixed
/// header.
pub const DATA_START: usize = 16;

pub const MIN_FILE_FORMAT_VERSION: u32 = 0x0000_0100;
pub const MAX_FILE_FORMAT_VERSION: u32 = 0x0000_0100;

/// Well-known symbol invoked when a module with a native library finishes
/// loading.
pub const NATIVE_MODULE_MAIN: &CStr = c"OvumModuleMain";

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ModuleVersion {
	pub major: i32,
	pub minor: i32,
	pub patch: i32,
	pub revision: i32,
}

impl ModuleVersion {
	pub const fn new(major: i32, minor: i32, patch: i32, revision: i32) -> Self {
		Self { major, minor, patch, revision }
	}
}

impl Display for ModuleVersion {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}.{}.{}.{}", self.major, self.minor, self.patch, self.revision)
	}
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub struct ModuleMemberFlags: u32 {
		const TYPE       = 0x0001;
		const FUNCTION   = 0x0002;
		const CONSTANT   = 0x0004;
		const KIND       = 0x000F;

		const PUBLIC     = 0x0010;
		const INTERNAL   = 0x0020;
		const PROTECTION = 0x00F0;
	}
}

/// A named member of a module's global namespace.
#[derive(Debug, Clone)]
pub struct GlobalMember {
	pub flags: ModuleMemberFlags,
	pub name: IStr,
	pub kind: GlobalMemberKind,
}

#[derive(Debug, Clone)]
pub enum GlobalMemberKind {
	Type(Rc<Type>),
	Function(Rc<Method>),
	Constant(Value),
}

// Flag sets as they appear in module files. Runtime representations use
// `MemberFlags`/`MethodFlags`; these exist only while reading.
mod file_flags {
	pub const FIELD_PUBLIC: u32 = 0x0001;
	pub const FIELD_INTERNAL: u32 = 0x0002;
	pub const FIELD_PROTECTED: u32 = 0x0004;
	pub const FIELD_PRIVATE: u32 = 0x0008;
	pub const FIELD_INSTANCE: u32 = 0x0100;
	pub const FIELD_HAS_VALUE: u32 = 0x0200;
	pub const FIELD_IMPL: u32 = 0x1000;

	pub const METHOD_PUBLIC: u32 = 0x0001;
	pub const METHOD_INTERNAL: u32 = 0x0002;
	pub const METHOD_PROTECTED: u32 = 0x0004;
	pub const METHOD_PRIVATE: u32 = 0x0008;
	pub const METHOD_INSTANCE: u32 = 0x0100;
	pub const METHOD_CTOR: u32 = 0x0200;
	pub const METHOD_IMPL: u32 = 0x1000;

	pub const OVERLOAD_VAR_END: u32 = 0x0001;
	pub const OVERLOAD_VAR_START: u32 = 0x0002;
	pub const OVERLOAD_VIRTUAL: u32 = 0x0100;
	pub const OVERLOAD_ABSTRACT: u32 = 0x0200;
	pub const OVERLOAD_NATIVE: u32 = 0x1000;
	pub const OVERLOAD_SHORT_HEADER: u32 = 0x2000;

	pub const PARAM_BY_REF: u32 = 0x0001;

	pub const CONSTANT_INTERNAL: u32 = 0x0002;

	pub const TRY_CATCH: u32 = 0x0001;
	pub const TRY_FINALLY: u32 = 0x0002;
}

/// Everything the header declares up front: enough to materialize the module
/// object and register it in the pool before the body sections are read.
struct ModuleMeta {
	name_token: u32,
	version: ModuleVersion,
	native_lib: Option<IStr>,
	type_count: usize,
	function_count: usize,
	constant_count: usize,
	field_count: usize,
	method_count: usize,
	method_start: u32,
}

/// A table of module members addressed by the low bits of their tokens
/// (1-based).
pub struct MemberTable<T> {
	entries: RefCell<Vec<T>>,
	capacity: Cell<usize>,
}

impl<T: Clone> MemberTable<T> {
	pub fn new() -> Self {
		Self { entries: RefCell::new(Vec::new()), capacity: Cell::new(0) }
	}

	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			entries: RefCell::new(Vec::with_capacity(capacity)),
			capacity: Cell::new(capacity),
		}
	}

	pub fn from_vec(entries: Vec<T>) -> Self {
		let capacity = entries.len();
		Self { entries: RefCell::new(entries), capacity: Cell::new(capacity) }
	}

	/// Reserves space once the entry count becomes known.
	pub fn init(&self, capacity: usize) {
		self.capacity.set(capacity);
		self.entries.borrow_mut().reserve(capacity);
	}

	pub fn push(&self, entry: T) {
		self.entries.borrow_mut().push(entry);
	}

	/// Fetches by 1-based token index.
	pub fn get(&self, index: usize) -> Option<T> {
		if index == 0 {
			return None;
		}
		self.entries.borrow().get(index - 1).cloned()
	}

	pub fn len(&self) -> usize {
		self.entries.borrow().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.borrow().is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.capacity.get()
	}

	/// The token the next pushed entry must carry.
	pub fn next_token(&self, kind: TokenKind) -> Token {
		Token::new(kind, self.len() + 1)
	}
}

impl<T: Clone> Default for MemberTable<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Debug for MemberTable<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "[{}/{}]", self.entries.borrow().len(), self.capacity.get())
	}
}

/// A loaded unit of code; corresponds 1:1 with a `.ovm` file. Modules own
/// their defined members; the ref tables point into other, previously loaded
/// modules. Modules live for the life of the VM.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Module {
	#[derivative(Debug = "ignore")]
	vm: Weak<Vm>,
	name: IStr,
	version: ModuleVersion,
	file_name: PathBuf,
	fully_opened: Cell<bool>,
	method_start: Cell<u32>,

	types: MemberTable<Rc<Type>>,
	functions: MemberTable<Rc<Method>>,
	fields: MemberTable<Rc<Field>>,
	methods: MemberTable<Rc<Method>>,
	strings: MemberTable<IStr>,
	#[derivative(Debug(format_with = "crate::utilities::fmt_debug_keys"))]
	members: RefCell<FxHashMap<IStr, GlobalMember>>,
	#[derivative(Debug = "ignore")]
	member_order: RefCell<Vec<IStr>>,

	module_refs: MemberTable<Rc<Module>>,
	type_refs: MemberTable<Rc<Type>>,
	function_refs: MemberTable<Rc<Method>>,
	field_refs: MemberTable<Rc<Field>>,
	method_refs: MemberTable<Rc<Method>>,

	#[derivative(Debug = "ignore")]
	main_method: RefCell<Option<Rc<Method>>>,
	#[derivative(Debug = "ignore")]
	native_lib: RefCell<Option<Box<dyn NativeLibrary>>>,
}

impl Module {
	fn from_meta(vm: &Rc<Vm>, meta: &ModuleMeta, name: IStr, file_name: &Path, strings: Vec<IStr>) -> Rc<Module> {
		Rc::new(Module {
			vm: Rc::downgrade(vm),
			name,
			version: meta.version,
			file_name: file_name.to_path_buf(),
			fully_opened: Cell::new(false),
			method_start: Cell::new(meta.method_start),
			types: MemberTable::with_capacity(meta.type_count),
			functions: MemberTable::with_capacity(meta.function_count),
			fields: MemberTable::with_capacity(meta.field_count),
			methods: MemberTable::with_capacity(meta.method_count),
			strings: MemberTable::from_vec(strings),
			members: RefCell::new(FxHashMap::with_capacity_and_hasher(
				meta.type_count + meta.function_count + meta.constant_count,
				Default::default(),
			)),
			member_order: RefCell::new(Vec::new()),
			module_refs: MemberTable::new(),
			type_refs: MemberTable::new(),
			function_refs: MemberTable::new(),
			field_refs: MemberTable::new(),
			method_refs: MemberTable::new(),
			main_method: RefCell::new(None),
			native_lib: RefCell::new(None),
		})
	}

	#[inline]
	pub fn name(&self) -> &IStr {
		&self.name
	}

	#[inline]
	pub fn version(&self) -> ModuleVersion {
		self.version
	}

	#[inline]
	pub fn file_name(&self) -> &Path {
		&self.file_name
	}

	pub fn vm(&self) -> Rc<Vm> {
		self.vm.upgrade().expect("VM dropped while module is alive")
	}

	/// False while the module is being read; a dependency resolving to a
	/// not-fully-opened module is a circular reference.
	pub fn is_fully_opened(&self) -> bool {
		self.fully_opened.get()
	}

	pub fn main_method(&self) -> Option<Rc<Method>> {
		self.main_method.borrow().clone()
	}

	pub fn global_member_count(&self) -> usize {
		self.member_order.borrow().len()
	}

	pub fn global_member_by_index(&self, index: usize) -> Option<GlobalMember> {
		let name = self.member_order.borrow().get(index).cloned()?;
		self.members.borrow().get(&name).cloned()
	}

	pub fn find_member(&self, name: &IStr, include_internal: bool) -> Option<GlobalMember> {
		let member = self.members.borrow().get(name).cloned()?;
		if !include_internal && member.flags.contains(ModuleMemberFlags::INTERNAL) {
			return None;
		}
		Some(member)
	}

	pub fn find_type(&self, name: &IStr, include_internal: bool) -> Option<Rc<Type>> {
		match self.find_member(name, include_internal)?.kind {
			GlobalMemberKind::Type(ty) => Some(ty),
			_ => None,
		}
	}

	pub fn find_global_function(&self, name: &IStr, include_internal: bool) -> Option<Rc<Method>> {
		match self.find_member(name, include_internal)?.kind {
			GlobalMemberKind::Function(f) => Some(f),
			_ => None,
		}
	}

	pub fn find_constant(&self, name: &IStr, include_internal: bool) -> Option<Value> {
		match self.find_member(name, include_internal)?.kind {
			GlobalMemberKind::Constant(value) => Some(value),
			_ => None,
		}
	}

	/// Finds a dependency module by name.
	pub fn find_module_ref(&self, name: &str) -> Option<Rc<Module>> {
		let refs = self.module_refs.entries.borrow();
		refs.iter().find(|m| m.name.as_str() == name).cloned()
	}

	pub fn module_ref_by_token(&self, token: Token) -> Option<Rc<Module>> {
		match token.kind() {
			TokenKind::ModuleRef => self.module_refs.get(token.index()),
			_ => None,
		}
	}

	pub fn type_by_token(&self, token: Token) -> Option<Rc<Type>> {
		match token.kind() {
			TokenKind::TypeDef => self.types.get(token.index()),
			TokenKind::TypeRef => self.type_refs.get(token.index()),
			_ => None,
		}
	}

	pub fn method_by_token(&self, token: Token) -> Option<Rc<Method>> {
		match token.kind() {
			TokenKind::MethodDef => self.methods.get(token.index()),
			TokenKind::MethodRef => self.method_refs.get(token.index()),
			TokenKind::FunctionDef => self.functions.get(token.index()),
			TokenKind::FunctionRef => self.function_refs.get(token.index()),
			_ => None,
		}
	}

	pub fn field_by_token(&self, token: Token) -> Option<Rc<Field>> {
		match token.kind() {
			TokenKind::FieldDef => self.fields.get(token.index()),
			TokenKind::FieldRef => self.field_refs.get(token.index()),
			_ => None,
		}
	}

	pub fn string_by_token(&self, token: Token) -> Option<IStr> {
		match token.kind() {
			TokenKind::String => self.strings.get(token.index()),
			_ => None,
		}
	}

	pub fn type_by_token_raw(&self, raw: u32) -> Option<Rc<Type>> {
		Token::try_from(raw).ok().and_then(|t| self.type_by_token(t))
	}

	pub fn method_by_token_raw(&self, raw: u32) -> Option<Rc<Method>> {
		Token::try_from(raw).ok().and_then(|t| self.method_by_token(t))
	}

	pub fn field_by_token_raw(&self, raw: u32) -> Option<Rc<Field>> {
		Token::try_from(raw).ok().and_then(|t| self.field_by_token(t))
	}

	pub fn string_by_token_raw(&self, raw: u32) -> Option<IStr> {
		Token::try_from(raw).ok().and_then(|t| self.string_by_token(t))
	}

	/// Resolves a symbol in the module's native library, if it has one.
	pub fn find_native_entry_point(&self, name: &CStr) -> Option<RawSymbol> {
		self.native_lib.borrow().as_ref().and_then(|lib| lib.entry_point(name))
	}

	pub fn has_native_library(&self) -> bool {
		self.native_lib.borrow().is_some()
	}

	/// Opens the module at `file_name`, loading its dependencies recursively.
	/// The module is registered in the pool before its body is read so that
	/// circular dependencies are detectable; it is removed again if any part
	/// of the load fails.
	pub fn open(
		vm: &Rc<Vm>,
		file_name: &Path,
		required_version: Option<&ModuleVersion>,
	) -> Result<Rc<Module>, ModuleLoadError> {
		let mut reader = Reader::open(file_name)?;

		if reader.read_array::<4>()? != MAGIC {
			return Err(reader.error(ModuleLoadErrorKind::BadMagic));
		}
		let format_version = reader.read_u32()?;
		if !(MIN_FILE_FORMAT_VERSION..=MAX_FILE_FORMAT_VERSION).contains(&format_version) {
			return Err(reader.error(ModuleLoadErrorKind::UnsupportedFormatVersion(format_version)));
		}

		reader.seek_to(DATA_START);
		let meta = Self::read_module_meta(vm, &mut reader)?;

		// The module's name is a token into its own string table, which
		// directly follows the header.
		let strings = Self::read_string_table(vm, &mut reader)?;
		let name = Token::try_from(meta.name_token)
			.ok()
			.filter(|t| t.kind() == TokenKind::String)
			.and_then(|t| strings.get(t.index().wrapping_sub(1)).cloned())
			.ok_or_else(|| reader.error(ModuleLoadErrorKind::InvalidToken(meta.name_token)))?;

		// Check the version before allocating anything further; a dependent
		// with the wrong version never enters the pool.
		if let Some(required) = required_version {
			if *required != meta.version {
				return Err(reader.error(ModuleLoadErrorKind::WrongDependencyVersion));
			}
		}

		let module = Self::from_meta(vm, &meta, name, file_name, strings);
		if !vm.module_pool().add(&module) {
			return Err(reader.error(ModuleLoadErrorKind::ModuleAlreadyLoaded));
		}

		match Self::load_body(vm, &module, &mut reader, &meta) {
			Ok(()) => {
				module.fully_opened.set(true);
				debug!(module = %module.name, version = %module.version, "module fully opened");
				Ok(module)
			}
			Err(err) => {
				vm.module_pool().remove(&module);
				Err(err)
			}
		}
	}

	/// Locates a module by name (see `ModuleFinder`) and opens it. A pool hit
	/// is returned as-is, including modules still being loaded; callers use
	/// `is_fully_opened` to detect cycles.
	pub fn open_by_name(
		vm: &Rc<Vm>,
		name: &str,
		required_version: Option<&ModuleVersion>,
	) -> Result<Rc<Module>, ModuleLoadError> {
		if let Some(module) = vm.module_pool().get(name, required_version) {
			return Ok(module);
		}

		let Some(path) = vm.finder().find_module_path(name, required_version) else {
			return Err(ModuleLoadError::new(
				Path::new(name),
				ModuleLoadErrorKind::ModuleNotFound { name: name.to_string() },
			));
		};

		debug!(module = name, path = %path.display(), "loading module");
		let module = Self::open(vm, &path, required_version)?;
		debug!(module = name, "successfully loaded module");
		Ok(module)
	}

	fn read_module_meta(vm: &Rc<Vm>, reader: &mut Reader) -> Result<ModuleMeta, ModuleLoadError> {
		let name_token = reader.read_u32()?;
		let version = reader.read_version()?;

		// The string map carries compiler metadata; the runtime skips it.
		reader.skip_collection()?;

		let native_lib = reader.read_string_or_null(vm.strings())?;

		let type_count = reader.read_i32()?;
		let function_count = reader.read_i32()?;
		let constant_count = reader.read_i32()?;
		let field_count = reader.read_i32()?;
		let method_count = reader.read_i32()?;
		if type_count < 0 || function_count < 0 || constant_count < 0 || field_count < 0
			|| method_count < 0
		{
			return Err(reader.error(ModuleLoadErrorKind::InvalidHeader));
		}
		// The stored offset points at the method block's size prefix.
		let method_start = reader.read_u32()? + 4;

		Ok(ModuleMeta {
			name_token,
			version,
			native_lib,
			type_count: type_count as usize,
			function_count: function_count as usize,
			constant_count: constant_count as usize,
			field_count: field_count as usize,
			method_count: method_count as usize,
			method_start,
		})
	}

	fn read_string_table(vm: &Rc<Vm>, reader: &mut Reader) -> Result<Vec<IStr>, ModuleLoadError> {
		let strings = reader.read_sized_section("String", |r| {
			let length = r.read_i32()?;
			if length < 0 {
				return Err(r.error(ModuleLoadErrorKind::InvalidHeader));
			}
			let mut strings = Vec::with_capacity(length as usize);
			for i in 0..length as usize {
				let token = r.read_token()?;
				if token != Token::new(TokenKind::String, i + 1) {
					return Err(r.error(ModuleLoadErrorKind::WrongTokenInTable("String")));
				}
				strings.push(r.read_string(vm.strings())?);
			}
			Ok(strings)
		})?;
		Ok(strings.unwrap_or_default())
	}

	fn load_body(
		vm: &Rc<Vm>,
		module: &Rc<Module>,
		reader: &mut Reader,
		meta: &ModuleMeta,
	) -> Result<(), ModuleLoadError> {
		if let Some(native_lib) = &meta.native_lib {
			module.load_native_library(vm, native_lib, reader)?;
		}

		// Section order is fixed; each table may refer to everything read
		// before it.
		module.read_module_refs(vm, reader)?;
		module.read_type_refs(reader)?;
		module.read_function_refs(reader)?;
		module.read_field_refs(reader)?;
		module.read_method_refs(reader)?;

		module.read_type_defs(vm, reader)?;
		module.read_function_defs(vm, reader)?;
		module.read_constant_defs(vm, reader, meta.constant_count)?;

		let main_token = reader.read_u32()?;
		if main_token != 0 {
			let token = Token::try_from(main_token)
				.map_err(|_| reader.error(ModuleLoadErrorKind::InvalidToken(main_token)))?;
			if !matches!(token.kind(), TokenKind::MethodDef | TokenKind::FunctionDef) {
				return Err(reader.error(ModuleLoadErrorKind::MainMethodNotDef));
			}
			let main = module
				.method_by_token(token)
				.ok_or_else(|| reader.error(ModuleLoadErrorKind::UnresolvedToken(token)))?;
			if main.flags().contains(MemberFlags::INSTANCE) {
				return Err(reader.error(ModuleLoadErrorKind::MainMethodIsInstance));
			}
			*module.main_method.borrow_mut() = Some(main);
		}

		if let Some(entry) = module.find_native_entry_point(NATIVE_MODULE_MAIN) {
			unsafe {
				let native_main: NativeModuleMain = std::mem::transmute(entry);
				native_main(Rc::as_ptr(module));
			}
		}

		Ok(())
	}

	fn load_native_library(
		&self,
		vm: &Rc<Vm>,
		native_lib: &IStr,
		reader: &Reader,
	) -> Result<(), ModuleLoadError> {
		// Native libraries are always loaded from the directory the module
		// file lives in.
		let mut path = self.file_name.clone();
		path.pop();
		path.push(native_lib.as_str());

		let lib = vm
			.library_loader()
			.open(&path)
			.map_err(|e| reader.error(ModuleLoadErrorKind::NativeLibraryLoad(e)))?;
		*self.native_lib.borrow_mut() = Some(lib);
		Ok(())
	}

	fn add_global_member(
		&self,
		reader: &Reader,
		member: GlobalMember,
	) -> Result<(), ModuleLoadError> {
		let mut members = self.members.borrow_mut();
		if members.contains_key(&member.name) {
			return Err(reader.error(ModuleLoadErrorKind::DuplicateGlobalMember(
				member.name.to_string(),
			)));
		}
		self.member_order.borrow_mut().push(member.name.clone());
		members.insert(member.name.clone(), member);
		Ok(())
	}

	fn read_module_refs(
		self: &Rc<Self>,
		vm: &Rc<Vm>,
		reader: &mut Reader,
	) -> Result<(), ModuleLoadError> {
		reader.read_sized_section("ModuleRef", |r| {
			let length = r.read_i32()?.max(0) as usize;
			self.module_refs.init(length);
			for _ in 0..length {
				let token = r.read_token()?;
				if token != self.module_refs.next_token(TokenKind::ModuleRef) {
					return Err(r.error(ModuleLoadErrorKind::WrongTokenInTable("ModuleRef")));
				}
				let name_token = r.read_token()?;
				let name = self
					.string_by_token(name_token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(name_token)))?;
				let version = r.read_version()?;

				let dependency = Module::open_by_name(vm, &name, Some(&version))?;
				if !dependency.is_fully_opened() {
					return Err(r.error(ModuleLoadErrorKind::CircularDependency));
				}
				if dependency.version() != version {
					return Err(r.error(ModuleLoadErrorKind::WrongDependencyVersion));
				}
				self.module_refs.push(dependency);
			}
			Ok(())
		})?;
		Ok(())
	}

	fn read_type_refs(self: &Rc<Self>, reader: &mut Reader) -> Result<(), ModuleLoadError> {
		reader.read_sized_section("TypeRef", |r| {
			let length = r.read_i32()?.max(0) as usize;
			self.type_refs.init(length);
			for _ in 0..length {
				let token = r.read_token()?;
				if token != self.type_refs.next_token(TokenKind::TypeRef) {
					return Err(r.error(ModuleLoadErrorKind::WrongTokenInTable("TypeRef")));
				}
				let name_token = r.read_token()?;
				let name = self
					.string_by_token(name_token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(name_token)))?;
				let owner_token = r.read_token()?;
				let owner = self
					.module_ref_by_token(owner_token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(owner_token)))?;

				let ty = owner.find_type(&name, false).ok_or_else(|| {
					r.error(ModuleLoadErrorKind::UnresolvedName {
						what: "TypeRef",
						name: name.to_string(),
					})
				})?;
				self.type_refs.push(ty);
			}
			Ok(())
		})?;
		Ok(())
	}

	fn read_function_refs(self: &Rc<Self>, reader: &mut Reader) -> Result<(), ModuleLoadError> {
		reader.read_sized_section("FunctionRef", |r| {
			let length = r.read_i32()?.max(0) as usize;
			self.function_refs.init(length);
			for _ in 0..length {
				let token = r.read_token()?;
				if token != self.function_refs.next_token(TokenKind::FunctionRef) {
					return Err(r.error(ModuleLoadErrorKind::WrongTokenInTable("FunctionRef")));
				}
				let name_token = r.read_token()?;
				let name = self
					.string_by_token(name_token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(name_token)))?;
				let owner_token = r.read_token()?;
				let owner = self
					.module_ref_by_token(owner_token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(owner_token)))?;

				let function = owner.find_global_function(&name, false).ok_or_else(|| {
					r.error(ModuleLoadErrorKind::UnresolvedName {
						what: "FunctionRef",
						name: name.to_string(),
					})
				})?;
				self.function_refs.push(function);
			}
			Ok(())
		})?;
		Ok(())
	}

	fn read_field_refs(self: &Rc<Self>, reader: &mut Reader) -> Result<(), ModuleLoadError> {
		reader.read_sized_section("FieldRef", |r| {
			let length = r.read_i32()?.max(0) as usize;
			self.field_refs.init(length);
			for _ in 0..length {
				let token = r.read_token()?;
				if token != self.field_refs.next_token(TokenKind::FieldRef) {
					return Err(r.error(ModuleLoadErrorKind::WrongTokenInTable("FieldRef")));
				}
				let name_token = r.read_token()?;
				let name = self
					.string_by_token(name_token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(name_token)))?;
				let type_token = r.read_token()?;
				if type_token.kind() != TokenKind::TypeRef {
					return Err(r.error(ModuleLoadErrorKind::WrongTokenInTable("FieldRef")));
				}
				let ty = self
					.type_by_token(type_token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(type_token)))?;

				let member = ty.get_member(&name).ok_or_else(|| {
					r.error(ModuleLoadErrorKind::UnresolvedName {
						what: "FieldRef",
						name: name.to_string(),
					})
				})?;
				let Member::Field(field) = member else {
					return Err(r.error(ModuleLoadErrorKind::WrongMemberKind {
						what: "FieldRef",
						name: name.to_string(),
					}));
				};
				self.field_refs.push(field);
			}
			Ok(())
		})?;
		Ok(())
	}

	fn read_method_refs(self: &Rc<Self>, reader: &mut Reader) -> Result<(), ModuleLoadError> {
		reader.read_sized_section("MethodRef", |r| {
			let length = r.read_i32()?.max(0) as usize;
			self.method_refs.init(length);
			for _ in 0..length {
				let token = r.read_token()?;
				if token != self.method_refs.next_token(TokenKind::MethodRef) {
					return Err(r.error(ModuleLoadErrorKind::WrongTokenInTable("MethodRef")));
				}
				let name_token = r.read_token()?;
				let name = self
					.string_by_token(name_token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(name_token)))?;
				let type_token = r.read_token()?;
				if type_token.kind() != TokenKind::TypeRef {
					return Err(r.error(ModuleLoadErrorKind::WrongTokenInTable("MethodRef")));
				}
				let ty = self
					.type_by_token(type_token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(type_token)))?;

				let member = ty.get_member(&name).ok_or_else(|| {
					r.error(ModuleLoadErrorKind::UnresolvedName {
						what: "MethodRef",
						name: name.to_string(),
					})
				})?;
				let Member::Method(method) = member else {
					return Err(r.error(ModuleLoadErrorKind::WrongMemberKind {
						what: "MethodRef",
						name: name.to_string(),
					}));
				};
				self.method_refs.push(method);
			}
			Ok(())
		})?;
		Ok(())
	}

	fn read_type_defs(
		self: &Rc<Self>,
		vm: &Rc<Vm>,
		reader: &mut Reader,
	) -> Result<(), ModuleLoadError> {
		let mut deferred = Vec::new();

		reader.read_sized_section("TypeDef", |r| {
			let length = r.read_i32()?;
			if length != self.types.capacity() as i32 {
				return Err(r.error(ModuleLoadErrorKind::TableCountMismatch("TypeDef")));
			}
			for _ in 0..length {
				let token = r.read_token()?;
				if token != self.types.next_token(TokenKind::TypeDef) {
					return Err(r.error(ModuleLoadErrorKind::WrongTokenInTable("TypeDef")));
				}

				let ty = self.read_single_type(vm, r, token, &mut deferred)?;
				self.types.push(ty.clone());

				let protection = if ty.flags().contains(TypeFlags::INTERNAL) {
					ModuleMemberFlags::INTERNAL
				} else {
					ModuleMemberFlags::PUBLIC
				};
				self.add_global_member(r, GlobalMember {
					flags: ModuleMemberFlags::TYPE | protection,
					name: ty.full_name().clone(),
					kind: GlobalMemberKind::Type(ty),
				})?;
			}

			// Constant fields whose type token pointed forwards are resolved
			// now that the whole table exists.
			for constant in deferred.drain(..) {
				let DeferredConstant { field, type_token, value } = constant;
				let ty = self.type_by_token_raw(type_token).ok_or_else(|| {
					match Token::try_from(type_token) {
						Ok(t) => r.error(ModuleLoadErrorKind::UnresolvedToken(t)),
						Err(_) => r.error(ModuleLoadErrorKind::InvalidToken(type_token)),
					}
				})?;
				self.set_constant_field_value(vm, r, &field, ty, value)?;
			}
			Ok(())
		})?;
		Ok(())
	}

	fn read_single_type(
		self: &Rc<Self>,
		vm: &Rc<Vm>,
		r: &mut Reader,
		type_token: Token,
		deferred: &mut Vec<DeferredConstant>,
	) -> Result<Rc<Type>, ModuleLoadError> {
		let flags = TypeFlags::from_bits_truncate(r.read_u32()? & 0xFFFF);
		let name_token = r.read_token()?;
		let name = self
			.string_by_token(name_token)
			.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(name_token)))?;

		let base_token = r.read_u32()?;
		let base_type = if base_token != 0 {
			let token = Token::try_from(base_token)
				.map_err(|_| r.error(ModuleLoadErrorKind::InvalidToken(base_token)))?;
			if token == type_token {
				return Err(r.error(ModuleLoadErrorKind::BaseTypeIsSelf));
			}
			Some(
				self.type_by_token(token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(token)))?,
			)
		} else {
			None
		};

		let shared_token = r.read_u32()?;
		let shared_type = if shared_token != 0 {
			let token = Token::try_from(shared_token)
				.map_err(|_| r.error(ModuleLoadErrorKind::InvalidToken(shared_token)))?;
			if token.kind() != TokenKind::TypeDef || token == type_token {
				return Err(r.error(ModuleLoadErrorKind::InvalidSharedType));
			}
			Some(
				self.type_by_token(token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(token)))?,
			)
		} else {
			None
		};

		let member_count = r.read_i32()?.max(0) as usize;
		let ty = Type::new(self, name, flags, base_type, shared_type, member_count);

		self.read_fields(vm, r, &ty, deferred)?;
		self.read_methods(r, &ty, vm)?;
		self.read_properties(r, &ty)?;
		self.read_operators(r, &ty)?;

		if let Some(new_name) = vm.strings().get(special_names::NEW) {
			ty.resolve_instance_ctor(&new_name);
		}

		// A native type initializer may adjust the instance layout, install a
		// finalizer or reference walker, or add native fields.
		if let Some(initer) = r.read_c_string()? {
			let symbol_name = std::ffi::CString::new(initer)
				.map_err(|_| r.error(ModuleLoadErrorKind::InvalidString))?;
			let initer_fn = self.find_native_entry_point(&symbol_name).ok_or_else(|| {
				r.error(ModuleLoadErrorKind::MissingNativeEntryPoint(
					symbol_name.to_string_lossy().into_owned(),
				))
			})?;
			unsafe {
				let initer_fn: TypeIniter = std::mem::transmute(initer_fn);
				initer_fn(Rc::as_ptr(&ty));
			}
		}

		if ty.base_type().is_some_and(|b| b.has_finalizer()) {
			// The initializer may have set this already; that's fine.
			ty.add_flags(TypeFlags::HAS_FINALIZER);
		}

		vm.try_register_standard_type(self, &ty).map_err(|kind| r.error(kind))?;
		Ok(ty)
	}

	fn read_fields(
		self: &Rc<Self>,
		vm: &Rc<Vm>,
		reader: &mut Reader,
		ty: &Rc<Type>,
		deferred: &mut Vec<DeferredConstant>,
	) -> Result<(), ModuleLoadError> {
		use file_flags::*;

		reader.read_sized_section("FieldDef", |r| {
			let length = r.read_i32()?.max(0);
			for _ in 0..length {
				let token = r.read_token()?;
				if token != self.fields.next_token(TokenKind::FieldDef) {
					return Err(r.error(ModuleLoadErrorKind::WrongTokenInTable("FieldDef")));
				}

				let raw_flags = r.read_u32()?;
				if raw_flags & FIELD_HAS_VALUE != 0 && raw_flags & FIELD_INSTANCE != 0 {
					return Err(r.error(ModuleLoadErrorKind::ConstantInstanceField));
				}

				let mut flags = MemberFlags::FIELD;
				if raw_flags & FIELD_PUBLIC != 0 {
					flags |= MemberFlags::PUBLIC;
				} else if raw_flags & FIELD_PRIVATE != 0 {
					flags |= MemberFlags::PRIVATE;
				} else if raw_flags & FIELD_PROTECTED != 0 {
					flags |= MemberFlags::PROTECTED;
				} else if raw_flags & FIELD_INTERNAL != 0 {
					flags |= MemberFlags::INTERNAL;
				}
				if raw_flags & FIELD_INSTANCE != 0 {
					flags |= MemberFlags::INSTANCE;
				}
				if raw_flags & FIELD_HAS_VALUE != 0 {
					flags |= MemberFlags::HAS_VALUE;
				}
				if raw_flags & FIELD_IMPL != 0 {
					flags |= MemberFlags::IMPL;
				}

				let name_token = r.read_token()?;
				let name = self
					.string_by_token(name_token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(name_token)))?;

				let field = Field::new(name.clone(), flags, ty, self);

				if raw_flags & FIELD_HAS_VALUE != 0 {
					let type_token = r.read_u32()?;
					let value = r.read_i64()?;
					match self.type_by_token_raw(type_token) {
						Some(constant_type) => {
							self.set_constant_field_value(vm, r, &field, constant_type, value)?
						}
						None => deferred.push(DeferredConstant {
							field: field.clone(),
							type_token,
							value,
						}),
					}
				}

				if !ty.add_member(name.clone(), Member::Field(field.clone())) {
					return Err(
						r.error(ModuleLoadErrorKind::DuplicateMemberName(name.to_string()))
					);
				}
				self.fields.push(field.clone());

				if !field.is_static() {
					field.set_offset(ty.add_instance_field());
				}
			}
			Ok(())
		})?;
		Ok(())
	}

	fn set_constant_field_value(
		self: &Rc<Self>,
		vm: &Rc<Vm>,
		reader: &Reader,
		field: &Rc<Field>,
		constant_type: Rc<Type>,
		value: i64,
	) -> Result<(), ModuleLoadError> {
		let constant = self.make_constant_value(vm, reader, constant_type, value)?;
		field.set_static_value(vm.add_static_reference(constant));
		Ok(())
	}

	/// Builds the value of a constant field or global constant. The type must
	/// be primitive or the standard String type; string constants store a
	/// String token in their value slot.
	fn make_constant_value(
		self: &Rc<Self>,
		vm: &Rc<Vm>,
		reader: &Reader,
		constant_type: Rc<Type>,
		value: i64,
	) -> Result<Value, ModuleLoadError> {
		let std_types = vm.types();
		let matches_std = |kind: StandardType| {
			std_types.get(kind).is_some_and(|t| Rc::ptr_eq(&t, &constant_type))
		};
		let is_string = matches_std(StandardType::String);
		let is_real = matches_std(StandardType::Real);
		let is_uint = matches_std(StandardType::UInt);

		if is_string {
			let string = self.string_by_token_raw(value as u32).ok_or_else(|| {
				match Token::try_from(value as u32) {
					Ok(t) => reader.error(ModuleLoadErrorKind::UnresolvedToken(t)),
					Err(_) => reader.error(ModuleLoadErrorKind::InvalidToken(value as u32)),
				}
			})?;
			return Ok(Value::string(constant_type, string));
		}
		if !constant_type.is_primitive() {
			return Err(reader.error(ModuleLoadErrorKind::InvalidConstantType));
		}

		let data = if is_real {
			ValueData::Real(f64::from_bits(value as u64))
		} else if is_uint {
			ValueData::UInt(value as u64)
		} else {
			ValueData::Int(value)
		};
		Ok(Value { ty: constant_type, data })
	}

	fn read_methods(
		self: &Rc<Self>,
		reader: &mut Reader,
		ty: &Rc<Type>,
		vm: &Rc<Vm>,
	) -> Result<(), ModuleLoadError> {
		reader.read_sized_section("MethodDef", |r| {
			let length = r.read_i32()?.max(0);
			for _ in 0..length {
				let token = r.read_token()?;
				if token != self.methods.next_token(TokenKind::MethodDef) {
					return Err(r.error(ModuleLoadErrorKind::WrongTokenInTable("MethodDef")));
				}

				let method = self.read_single_method(vm, r)?;
				let name = method.name().clone();

				if !ty.add_member(name.clone(), Member::Method(method.clone())) {
					return Err(
						r.error(ModuleLoadErrorKind::DuplicateMemberName(name.to_string()))
					);
				}
				self.methods.push(method.clone());
				method.set_decl_type(ty);

				self.wire_base_method(ty, &method);
			}
			Ok(())
		})?;
		Ok(())
	}

	/// Finds the overridden method up the base chain, if any. Reserved names
	/// never override, and only members matching on kind, accessibility and
	/// staticness count; a mismatch is not an error, it just leaves the base
	/// method unset.
	fn wire_base_method(&self, ty: &Rc<Type>, method: &Rc<Method>) {
		const MATCH_FLAGS: MemberFlags = MemberFlags::KIND
			.union(MemberFlags::ACCESS_LEVEL)
			.union(MemberFlags::INSTANCE);

		if ty.base_type().is_none() {
			return;
		}
		if method.flags() & MemberFlags::ACCESS_LEVEL == MemberFlags::PRIVATE {
			return;
		}
		let name = method.name();
		if matches!(
			name.as_str(),
			special_names::NEW | special_names::ITER | special_names::INIT
		) {
			return;
		}

		let mut current = ty.base_type().cloned();
		while let Some(base) = current {
			if let Some(member) = base.get_member(name) {
				if member.flags() & MATCH_FLAGS == method.flags() & MATCH_FLAGS {
					if let Member::Method(base_method) = member {
						method.set_base_method(base_method);
					}
				}
				break;
			}
			current = base.base_type().cloned();
		}
	}

	fn read_single_method(
		self: &Rc<Self>,
		vm: &Rc<Vm>,
		r: &mut Reader,
	) -> Result<Rc<Method>, ModuleLoadError> {
		use file_flags::*;

		let raw_method_flags = r.read_u32()?;

		let name_token = r.read_token()?;
		let name = self
			.string_by_token(name_token)
			.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(name_token)))?;

		let size = r.read_u32()?;
		if size == 0 {
			return Err(r.error(ModuleLoadErrorKind::MethodWithoutOverloads));
		}
		let before = r.position();

		let overload_count = r.read_i32()?;
		if overload_count <= 0 {
			return Err(r.error(ModuleLoadErrorKind::MethodWithoutOverloads));
		}

		let mut member_flags = MemberFlags::METHOD;
		if raw_method_flags & METHOD_PUBLIC != 0 {
			member_flags |= MemberFlags::PUBLIC;
		} else if raw_method_flags & METHOD_PRIVATE != 0 {
			member_flags |= MemberFlags::PRIVATE;
		} else if raw_method_flags & METHOD_PROTECTED != 0 {
			member_flags |= MemberFlags::PROTECTED;
		} else if raw_method_flags & METHOD_INTERNAL != 0 {
			member_flags |= MemberFlags::INTERNAL;
		}
		if raw_method_flags & METHOD_INSTANCE != 0 {
			member_flags |= MemberFlags::INSTANCE;
		}
		if raw_method_flags & METHOD_CTOR != 0 {
			member_flags |= MemberFlags::CTOR;
		}
		if raw_method_flags & METHOD_IMPL != 0 {
			member_flags |= MemberFlags::IMPL;
		}

		let mut descs = Vec::with_capacity(overload_count as usize);
		for _ in 0..overload_count {
			let raw_overload_flags = r.read_u32()?;

			let param_count = r.read_u16()?;
			let mut param_names = Vec::with_capacity(param_count as usize);
			// The signature always reserves slot 0 for the instance, even
			// when there isn't one.
			let mut ref_builder =
				crate::ee::refsignature::RefSignatureBuilder::new(param_count as u32 + 1);
			for p in 0..param_count {
				let param_name_token = r.read_token()?;
				let param_name = self.string_by_token(param_name_token).ok_or_else(|| {
					r.error(ModuleLoadErrorKind::UnresolvedToken(param_name_token))
				})?;
				let param_flags = r.read_u32()?;
				if param_flags & PARAM_BY_REF != 0 {
					ref_builder.set_param(p as u32 + 1, true);
				}
				param_names.push(param_name);
			}
			let ref_signature = ref_builder.commit(vm.ref_signatures());

			let mut flags = MethodFlags::empty();
			if raw_method_flags & METHOD_CTOR != 0 {
				flags |= MethodFlags::CTOR;
			}
			if raw_method_flags & METHOD_INSTANCE != 0 {
				flags |= MethodFlags::INSTANCE;
			}
			if raw_overload_flags & OVERLOAD_VAR_END != 0 {
				flags |= MethodFlags::VAR_END;
			}
			if raw_overload_flags & OVERLOAD_VAR_START != 0 {
				flags |= MethodFlags::VAR_START;
			}
			if raw_overload_flags & OVERLOAD_VIRTUAL != 0 {
				flags |= MethodFlags::VIRTUAL;
			}
			if raw_overload_flags & OVERLOAD_ABSTRACT != 0 {
				flags |= MethodFlags::ABSTRACT;
			}

			let (optional_param_count, locals, max_stack, try_blocks);
			if raw_overload_flags & OVERLOAD_SHORT_HEADER != 0 {
				optional_param_count = 0;
				locals = 0;
				max_stack = 8;
				try_blocks = Vec::new();
			} else {
				optional_param_count = r.read_u16()?;
				locals = r.read_u16()?;
				max_stack = r.read_u16()?;
				try_blocks = self.read_try_blocks(r)?;
			}

			let body;
			if raw_overload_flags & OVERLOAD_ABSTRACT != 0 {
				body = MethodBody::Missing;
			} else if raw_overload_flags & OVERLOAD_NATIVE != 0 {
				let entry_point_name = r.read_c_string()?.ok_or_else(|| {
					r.error(ModuleLoadErrorKind::MissingNativeEntryPoint(String::new()))
				})?;
				let symbol_name = std::ffi::CString::new(entry_point_name)
					.map_err(|_| r.error(ModuleLoadErrorKind::InvalidString))?;
				let entry = self.find_native_entry_point(&symbol_name).ok_or_else(|| {
					r.error(ModuleLoadErrorKind::MissingNativeEntryPoint(
						symbol_name.to_string_lossy().into_owned(),
					))
				})?;
				body = MethodBody::Native(unsafe {
					std::mem::transmute::<RawSymbol, NativeMethod>(entry)
				});
				flags |= MethodFlags::NATIVE;
			} else {
				// The body lives in the method block; read it out of line and
				// come back.
				let offset = r.read_u32()?;
				let length = r.read_u32()?;
				let resume = r.position();
				r.seek_to((self.method_start.get() + offset) as usize);
				let bytes = r.read_slice(length as usize)?.to_vec();
				r.seek_to(resume);
				body = MethodBody::Raw(bytes.into_boxed_slice());
			}

			descs.push(OverloadDesc {
				flags,
				param_count,
				optional_param_count,
				param_names,
				ref_signature,
				locals,
				max_stack,
				try_blocks,
				body,
			});
		}

		let after = r.position();
		if before + size as usize != after {
			return Err(r.error(ModuleLoadErrorKind::SectionSizeMismatch("overloads")));
		}

		Ok(Method::from_overload_descs(name, member_flags, self, descs))
	}

	fn read_try_blocks(
		self: &Rc<Self>,
		reader: &mut Reader,
	) -> Result<Vec<TryBlock>, ModuleLoadError> {
		use file_flags::{TRY_CATCH, TRY_FINALLY};

		let blocks = reader.read_sized_section("TryBlock", |r| {
			let length = r.read_i32()?.max(0);
			let mut blocks = Vec::with_capacity(length as usize);
			for _ in 0..length {
				let kind = r.read_u32()?;
				let try_start = r.read_u32()?;
				let try_end = r.read_u32()?;

				let handler = match kind {
					TRY_FINALLY => TryBlockHandler::Finally {
						finally_start: r.read_u32()?,
						finally_end: r.read_u32()?,
					},
					TRY_CATCH => {
						let clauses = r.read_sized_section("CatchClauses", |r| {
							let count = r.read_i32()?.max(0);
							let mut clauses = Vec::with_capacity(count as usize);
							for _ in 0..count {
								let caught_type_token = r.read_u32()?;
								// Resolve eagerly when possible; otherwise the
								// method initializer resolves (or rejects) it.
								let caught_type = self.type_by_token_raw(caught_type_token);
								clauses.push(CatchClause {
									caught_type_token,
									caught_type,
									catch_start: r.read_u32()?,
									catch_end: r.read_u32()?,
								});
							}
							Ok(clauses)
						})?;
						TryBlockHandler::Catch {
							clauses: clauses.unwrap_or_default().into_boxed_slice(),
						}
					}
					_ => return Err(r.error(ModuleLoadErrorKind::InvalidTryBlock)),
				};

				blocks.push(TryBlock { try_start, try_end, handler });
			}
			Ok(blocks)
		})?;
		Ok(blocks.unwrap_or_default())
	}

	fn read_properties(self: &Rc<Self>, reader: &mut Reader, ty: &Rc<Type>) -> Result<(), ModuleLoadError> {
		reader.read_sized_section("PropertyDef", |r| {
			let length = r.read_i32()?.max(0);
			for _ in 0..length {
				let name_token = r.read_token()?;
				let name = self
					.string_by_token(name_token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(name_token)))?;

				let mut flags: Option<MemberFlags> = None;
				let read_accessor = |r: &mut Reader,
				                         flags: &mut Option<MemberFlags>|
				 -> Result<Option<Rc<Method>>, ModuleLoadError> {
					let raw = r.read_u32()?;
					if raw == 0 {
						return Ok(None);
					}
					let token = Token::try_from(raw)
						.map_err(|_| r.error(ModuleLoadErrorKind::InvalidToken(raw)))?;
					if token.kind() != TokenKind::MethodDef {
						return Err(r.error(ModuleLoadErrorKind::InvalidPropertyAccessor));
					}
					let method = self
						.method_by_token(token)
						.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(token)))?;
					if method.decl_type().map_or(true, |t| !Rc::ptr_eq(&t, ty)) {
						return Err(r.error(ModuleLoadErrorKind::InvalidPropertyAccessor));
					}
					let accessor_flags =
						method.flags() & !(MemberFlags::IMPL | MemberFlags::KIND);
					match flags {
						Some(existing) if *existing != accessor_flags => {
							return Err(r.error(ModuleLoadErrorKind::PropertyAccessorMismatch))
						}
						Some(_) => {}
						None => *flags = Some(accessor_flags),
					}
					Ok(Some(method))
				};

				let getter = read_accessor(r, &mut flags)?;
				let setter = read_accessor(r, &mut flags)?;
				if getter.is_none() && setter.is_none() {
					return Err(r.error(ModuleLoadErrorKind::PropertyWithoutAccessors));
				}

				let flags = flags.unwrap_or(MemberFlags::empty()) | MemberFlags::PROPERTY;
				let property = Property::new(name.clone(), flags, ty, getter, setter);
				if !ty.add_member(name.clone(), Member::Property(property)) {
					return Err(
						r.error(ModuleLoadErrorKind::DuplicateMemberName(name.to_string()))
					);
				}
			}
			Ok(())
		})?;
		Ok(())
	}

	fn read_operators(self: &Rc<Self>, reader: &mut Reader, ty: &Rc<Type>) -> Result<(), ModuleLoadError> {
		reader.read_sized_section("OperatorDef", |r| {
			let length = r.read_i32()?.max(0);
			for _ in 0..length {
				let op_raw = r.read_u32()?;
				let op = Operator::try_from(op_raw)
					.map_err(|_| r.error(ModuleLoadErrorKind::InvalidOperator(op_raw)))?;
				let method_token = r.read_token()?;
				if method_token.kind() != TokenKind::MethodDef {
					return Err(r.error(ModuleLoadErrorKind::InvalidOperatorMethod));
				}
				let method = self
					.method_by_token(method_token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(method_token)))?;
				if method.decl_type().map_or(true, |t| !Rc::ptr_eq(&t, ty)) {
					return Err(r.error(ModuleLoadErrorKind::InvalidOperatorMethod));
				}
				let overload = method
					.resolve_overload(op.arity())
					.ok_or_else(|| r.error(ModuleLoadErrorKind::InvalidOperatorMethod))?;
				if !ty.set_operator(op, overload) {
					return Err(r.error(ModuleLoadErrorKind::DuplicateOperator));
				}
			}
			Ok(())
		})?;

		// Operator slots the type leaves empty dispatch to the base type.
		ty.init_operators();
		Ok(())
	}

	fn read_function_defs(
		self: &Rc<Self>,
		vm: &Rc<Vm>,
		reader: &mut Reader,
	) -> Result<(), ModuleLoadError> {
		reader.read_sized_section("FunctionDef", |r| {
			let length = r.read_i32()?;
			if length != self.functions.capacity() as i32 {
				return Err(r.error(ModuleLoadErrorKind::TableCountMismatch("FunctionDef")));
			}
			for _ in 0..length {
				let token = r.read_token()?;
				if token != self.functions.next_token(TokenKind::FunctionDef) {
					return Err(r.error(ModuleLoadErrorKind::WrongTokenInTable("FunctionDef")));
				}

				let function = self.read_single_method(vm, r)?;
				let protection = if function.flags().contains(MemberFlags::INTERNAL) {
					ModuleMemberFlags::INTERNAL
				} else {
					ModuleMemberFlags::PUBLIC
				};
				self.add_global_member(r, GlobalMember {
					flags: ModuleMemberFlags::FUNCTION | protection,
					name: function.name().clone(),
					kind: GlobalMemberKind::Function(function.clone()),
				})?;
				self.functions.push(function);
			}
			Ok(())
		})?;
		Ok(())
	}

	fn read_constant_defs(
		self: &Rc<Self>,
		vm: &Rc<Vm>,
		reader: &mut Reader,
		header_constant_count: usize,
	) -> Result<(), ModuleLoadError> {
		reader.read_sized_section("ConstantDef", |r| {
			let length = r.read_i32()?;
			if length != header_constant_count as i32 {
				return Err(r.error(ModuleLoadErrorKind::TableCountMismatch("ConstantDef")));
			}
			for i in 0..length as usize {
				let token = r.read_token()?;
				if token != Token::new(TokenKind::ConstantDef, i + 1) {
					return Err(r.error(ModuleLoadErrorKind::WrongTokenInTable("ConstantDef")));
				}

				let raw_flags = r.read_u32()?;
				let name_token = r.read_token()?;
				let name = self
					.string_by_token(name_token)
					.ok_or_else(|| r.error(ModuleLoadErrorKind::UnresolvedToken(name_token)))?;

				let type_token = r.read_u32()?;
				let constant_type = self.type_by_token_raw(type_token).ok_or_else(|| {
					match Token::try_from(type_token) {
						Ok(t) => r.error(ModuleLoadErrorKind::UnresolvedToken(t)),
						Err(_) => r.error(ModuleLoadErrorKind::InvalidToken(type_token)),
					}
				})?;
				let value = r.read_i64()?;
				let constant = self.make_constant_value(vm, r, constant_type, value)?;

				let protection = if raw_flags & file_flags::CONSTANT_INTERNAL != 0 {
					ModuleMemberFlags::INTERNAL
				} else {
					ModuleMemberFlags::PUBLIC
				};
				self.add_global_member(r, GlobalMember {
					flags: ModuleMemberFlags::CONSTANT | protection,
					name,
					kind: GlobalMemberKind::Constant(constant),
				})?;
			}
			Ok(())
		})?;
		Ok(())
	}
}

struct DeferredConstant {
	field: Rc<Field>,
	type_token: u32,
	value: i64,
}
