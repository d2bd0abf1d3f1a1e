use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::os::raw::c_void;
use std::rc::{Rc, Weak};

use bitflags::bitflags;

use crate::ee::refsignature::{RefSignature, RefSignaturePool};
use crate::module::Module;
use crate::object::member::MemberFlags;
use crate::object::r#type::Type;
use crate::strings::IStr;
use crate::value::{Value, VALUE_SIZE};

bitflags! {
	/// Per-overload runtime flags.
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub struct MethodFlags: u32 {
		const VAR_END  = 0x0001;
		const VAR_START = 0x0002;
		const VARIADIC = 0x0003;

		const VIRTUAL  = 0x0100;
		const ABSTRACT = 0x0200;
		const CTOR     = 0x0400;
		const INSTANCE = 0x0800;
		const NATIVE   = 0x1000;
		const INITED   = 0x2000;
	}
}

/// The native implementation of a method overload.
pub type NativeMethod =
	unsafe extern "C" fn(thread: *mut c_void, argc: u16, args: *mut Value) -> i32;

/// A method group: one named member holding one or more overloads. Global
/// functions are method groups without a declaring type.
pub struct Method {
	name: IStr,
	flags: Cell<MemberFlags>,
	decl_module: Weak<Module>,
	decl_type: RefCell<Option<Weak<Type>>>,
	base_method: RefCell<Option<Rc<Method>>>,
	overloads: Box<[Rc<MethodOverload>]>,
}

impl Method {
	/// Builds the method group and its overloads in one go, wiring the
	/// overloads' back-references to the group.
	pub fn from_overload_descs(
		name: IStr,
		flags: MemberFlags,
		decl_module: &Rc<Module>,
		descs: Vec<OverloadDesc>,
	) -> Rc<Method> {
		Rc::new_cyclic(|group: &Weak<Method>| Method {
			name,
			flags: Cell::new(flags),
			decl_module: Rc::downgrade(decl_module),
			decl_type: RefCell::new(None),
			base_method: RefCell::new(None),
			overloads: descs
				.into_iter()
				.map(|desc| {
					Rc::new(MethodOverload {
						group: group.clone(),
						flags: Cell::new(desc.flags),
						param_count: desc.param_count,
						optional_param_count: desc.optional_param_count,
						param_names: desc.param_names.into_boxed_slice(),
						ref_signature: desc.ref_signature,
						locals: desc.locals,
						max_stack: desc.max_stack,
						try_blocks: RefCell::new(desc.try_blocks.into_boxed_slice()),
						body: RefCell::new(desc.body),
						debug_symbols: RefCell::new(None),
					})
				})
				.collect(),
		})
	}

	#[inline]
	pub fn name(&self) -> &IStr {
		&self.name
	}

	#[inline]
	pub fn flags(&self) -> MemberFlags {
		self.flags.get()
	}

	pub fn add_flags(&self, flags: MemberFlags) {
		self.flags.set(self.flags.get() | flags);
	}

	pub fn is_static(&self) -> bool {
		!self.flags.get().contains(MemberFlags::INSTANCE)
	}

	pub fn is_ctor(&self) -> bool {
		self.flags.get().contains(MemberFlags::CTOR)
	}

	pub fn module(&self) -> Rc<Module> {
		self.decl_module.upgrade().expect("declaring module dropped while method is alive")
	}

	pub fn decl_type(&self) -> Option<Rc<Type>> {
		self.decl_type.borrow().as_ref().and_then(Weak::upgrade)
	}

	pub(crate) fn set_decl_type(&self, ty: &Rc<Type>) {
		*self.decl_type.borrow_mut() = Some(Rc::downgrade(ty));
	}

	pub fn base_method(&self) -> Option<Rc<Method>> {
		self.base_method.borrow().clone()
	}

	pub(crate) fn set_base_method(&self, base: Rc<Method>) {
		*self.base_method.borrow_mut() = Some(base);
	}

	#[inline]
	pub fn overload_count(&self) -> usize {
		self.overloads.len()
	}

	pub fn overload(&self, index: usize) -> Option<&Rc<MethodOverload>> {
		self.overloads.get(index)
	}

	pub fn overloads(&self) -> &[Rc<MethodOverload>] {
		&self.overloads
	}

	/// True if some overload here or up the base chain takes `argc` named
	/// arguments.
	pub fn accepts(&self, argc: u16) -> bool {
		self.resolve_overload(argc).is_some()
	}

	/// Finds the overload invoked with `argc` named arguments, walking up the
	/// base-method chain; the first match wins.
	pub fn resolve_overload(&self, argc: u16) -> Option<Rc<MethodOverload>> {
		for overload in self.overloads.iter() {
			if overload.accepts(argc) {
				return Some(overload.clone());
			}
		}
		let mut current = self.base_method();
		while let Some(method) = current {
			for overload in method.overloads.iter() {
				if overload.accepts(argc) {
					return Some(overload.clone());
				}
			}
			current = method.base_method();
		}
		None
	}

	pub fn is_accessible(
		&self,
		inst_type: Option<&Rc<Type>>,
		from_type: Option<&Rc<Type>>,
		from_module: Option<&Rc<Module>>,
	) -> bool {
		crate::object::member::is_accessible(
			self.flags.get(),
			self.decl_type().as_ref(),
			Some(&self.module()),
			inst_type,
			from_type,
			from_module,
		)
	}
}

impl Debug for Method {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "Method({:?}, {} overloads)", self.name, self.overloads.len())
	}
}

/// The raw ingredients of one overload, produced by the module reader.
pub struct OverloadDesc {
	pub flags: MethodFlags,
	pub param_count: u16,
	pub optional_param_count: u16,
	pub param_names: Vec<IStr>,
	pub ref_signature: u32,
	pub locals: u16,
	pub max_stack: u16,
	pub try_blocks: Vec<TryBlock>,
	pub body: MethodBody,
}

/// A single signature of a method. Exactly one of the native entry point and
/// the bytecode body is present, except for abstract overloads, which have
/// neither.
pub struct MethodOverload {
	group: Weak<Method>,
	flags: Cell<MethodFlags>,
	param_count: u16,
	optional_param_count: u16,
	param_names: Box<[IStr]>,
	ref_signature: u32,
	locals: u16,
	max_stack: u16,
	try_blocks: RefCell<Box<[TryBlock]>>,
	body: RefCell<MethodBody>,
	debug_symbols: RefCell<Option<DebugSymbols>>,
}

impl MethodOverload {
	pub fn group(&self) -> Rc<Method> {
		self.group.upgrade().expect("method group dropped while overload is alive")
	}

	pub fn name(&self) -> IStr {
		self.group().name().clone()
	}

	pub fn decl_type(&self) -> Option<Rc<Type>> {
		self.group().decl_type()
	}

	pub fn module(&self) -> Rc<Module> {
		self.group().module()
	}

	#[inline]
	pub fn flags(&self) -> MethodFlags {
		self.flags.get()
	}

	pub fn add_flags(&self, flags: MethodFlags) {
		self.flags.set(self.flags.get() | flags);
	}

	pub fn is_initialized(&self) -> bool {
		self.flags.get().contains(MethodFlags::INITED)
	}

	pub fn is_abstract(&self) -> bool {
		self.flags.get().contains(MethodFlags::ABSTRACT)
	}

	pub fn is_native(&self) -> bool {
		self.flags.get().contains(MethodFlags::NATIVE)
	}

	pub fn is_instance(&self) -> bool {
		self.flags.get().contains(MethodFlags::INSTANCE)
	}

	pub fn is_variadic(&self) -> bool {
		self.flags.get().intersects(MethodFlags::VARIADIC)
	}

	#[inline]
	pub fn param_count(&self) -> u16 {
		self.param_count
	}

	#[inline]
	pub fn optional_param_count(&self) -> u16 {
		self.optional_param_count
	}

	pub fn param_names(&self) -> &[IStr] {
		&self.param_names
	}

	#[inline]
	pub fn ref_signature(&self) -> u32 {
		self.ref_signature
	}

	#[inline]
	pub fn locals(&self) -> u16 {
		self.locals
	}

	#[inline]
	pub fn max_stack(&self) -> u16 {
		self.max_stack
	}

	/// 1 when the overload consumes an instance slot, 0 otherwise.
	pub fn instance_offset(&self) -> u16 {
		self.is_instance() as u16
	}

	pub fn accepts(&self, argc: u16) -> bool {
		let argc = argc as i32;
		let params = self.param_count as i32;
		let optional = self.optional_param_count as i32;
		if self.is_variadic() {
			argc >= params - 1 - optional
		} else {
			argc >= params - optional && argc <= params
		}
	}

	pub fn try_blocks(&self) -> std::cell::Ref<'_, Box<[TryBlock]>> {
		self.try_blocks.borrow()
	}

	pub(crate) fn set_try_blocks(&self, blocks: Box<[TryBlock]>) {
		*self.try_blocks.borrow_mut() = blocks;
	}

	pub fn body(&self) -> std::cell::Ref<'_, MethodBody> {
		self.body.borrow()
	}

	pub(crate) fn set_body(&self, body: MethodBody) {
		*self.body.borrow_mut() = body;
	}

	pub fn debug_symbols(&self) -> std::cell::Ref<'_, Option<DebugSymbols>> {
		self.debug_symbols.borrow()
	}

	pub fn set_debug_symbols(&self, symbols: Option<DebugSymbols>) {
		*self.debug_symbols.borrow_mut() = symbols;
	}

	/// Frame-relative byte offset of local slot `local`.
	pub fn local_offset(&self, local: u16) -> i32 {
		local as i32 * VALUE_SIZE as i32
	}

	/// Frame-relative byte offset of evaluation-stack slot `slot`; the stack
	/// lives directly above the locals.
	pub fn stack_offset(&self, slot: u16) -> i32 {
		(self.locals as i32 + slot as i32) * VALUE_SIZE as i32
	}

	/// Frame-relative byte offset of argument `arg`; arguments live below the
	/// frame base.
	pub fn arg_offset(&self, arg: u16) -> i32 {
		-((arg as i32 + 1) * VALUE_SIZE as i32)
	}

	/// Checks an invocation's argument ref signature against this overload's
	/// parameter ref signature. The fast path is the 32-bit comparison; when
	/// the codes differ (variadic packing, short/long boundary) parameters
	/// and arguments are walked pairwise. Returns the first mismatched
	/// argument index, or None when the call matches.
	pub fn verify_ref_signature(
		&self,
		pool: &RefSignaturePool,
		arg_signature: u32,
		argc: u16,
	) -> Option<u16> {
		if arg_signature == self.ref_signature {
			return None;
		}

		let params = RefSignature::new(self.ref_signature, pool);
		let args = RefSignature::new(arg_signature, pool);

		// Slot 0 is reserved for the instance and can never be by ref.
		if args.is_param_ref(0) {
			return Some(0);
		}

		// Named parameters and arguments both occupy bits 1..=count.
		let mut im = 1u16;
		let mut ia = 1u16;
		let upper = self.param_count + 1;

		if self.is_variadic() {
			if self.flags.get().contains(MethodFlags::VAR_START) {
				// Leading arguments are packed into a list; none of them may
				// be by ref.
				let mut packed = argc as i32 - self.param_count as i32 + 1;
				while packed > 0 {
					if args.is_param_ref(ia as u32) {
						return Some(ia);
					}
					ia += 1;
					packed -= 1;
				}
				im += 1;
				while im < upper {
					if params.is_param_ref(im as u32) != args.is_param_ref(ia as u32) {
						return Some(ia);
					}
					im += 1;
					ia += 1;
				}
			} else {
				while im < upper - 1 {
					if params.is_param_ref(im as u32) != args.is_param_ref(ia as u32) {
						return Some(ia);
					}
					im += 1;
					ia += 1;
				}
				// The remaining arguments are packed into a list; none of
				// them may be by ref.
				while ia < argc {
					if args.is_param_ref(ia as u32) {
						return Some(ia);
					}
					ia += 1;
				}
			}
		} else {
			while im < upper {
				if params.is_param_ref(im as u32) != args.is_param_ref(ia as u32) {
					return Some(ia);
				}
				im += 1;
				ia += 1;
			}
		}
		None
	}
}

impl Debug for MethodOverload {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"MethodOverload({:?}/{}, {:?})",
			self.group.upgrade().map(|g| g.name().to_string()),
			self.param_count,
			self.flags.get(),
		)
	}
}

/// A method body in one of its lifecycle states. The raw on-disk form is
/// replaced by the rewritten form the first time the overload is initialized.
pub enum MethodBody {
	/// Abstract overloads have no body at all.
	Missing,
	Raw(Box<[u8]>),
	Native(NativeMethod),
	Initialized(Box<[u8]>),
}

impl Debug for MethodBody {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			MethodBody::Missing => write!(f, "MethodBody::Missing"),
			MethodBody::Raw(b) => write!(f, "MethodBody::Raw({} bytes)", b.len()),
			MethodBody::Native(_) => write!(f, "MethodBody::Native"),
			MethodBody::Initialized(b) => write!(f, "MethodBody::Initialized({} bytes)", b.len()),
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TryBlockKind {
	Catch,
	Finally,
}

/// A protected region of a method body. Boundaries are byte offsets in the
/// on-disk body, instruction indices during rewriting and byte offsets into
/// the rewritten body afterwards.
#[derive(Debug, Clone)]
pub struct TryBlock {
	pub try_start: u32,
	pub try_end: u32,
	pub handler: TryBlockHandler,
}

#[derive(Debug, Clone)]
pub enum TryBlockHandler {
	Catch { clauses: Box<[CatchClause]> },
	Finally { finally_start: u32, finally_end: u32 },
}

impl TryBlock {
	pub fn kind(&self) -> TryBlockKind {
		match self.handler {
			TryBlockHandler::Catch { .. } => TryBlockKind::Catch,
			TryBlockHandler::Finally { .. } => TryBlockKind::Finally,
		}
	}
}

#[derive(Debug, Clone)]
pub struct CatchClause {
	pub caught_type_token: u32,
	pub caught_type: Option<Rc<Type>>,
	pub catch_start: u32,
	pub catch_end: u32,
}

/// Source ranges attached to an overload by the debug-symbol reader (an
/// external collaborator). The method initializer keeps the ranges aligned
/// with the rewritten body.
#[derive(Debug, Clone)]
pub struct DebugSymbols {
	pub symbols: Box<[SourceLocation]>,
}

#[derive(Debug, Copy, Clone)]
pub struct SourceLocation {
	pub start_offset: u32,
	pub end_offset: u32,
	pub line_number: u32,
	pub column: u32,
}
