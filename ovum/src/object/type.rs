use std::cell::{Cell, RefCell};
use std::os::raw::c_void;
use std::rc::{Rc, Weak};

use bitflags::bitflags;
use derivative::Derivative;
use fxhash::FxHashMap;

use crate::module::Module;
use crate::object::member::{Member, MemberFlags};
use crate::object::method::{Method, MethodOverload};
use crate::object::special_names;
use crate::strings::IStr;
use crate::value::{Value, VALUE_SIZE};

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub struct TypeFlags: u32 {
		const PUBLIC     = 0x0000_0001;
		const INTERNAL   = 0x0000_0002;
		const PROTECTION = 0x0000_0003;

		const ABSTRACT   = 0x0000_0100;
		const SEALED     = 0x0000_0200;
		const STATIC     = 0x0000_0300;
		const IMPL       = 0x0000_1000;
		// Primitives are sealed and carry their value inline.
		const PRIMITIVE  = 0x0000_2200;

		// Runtime-only flags; never present in module files.
		const CUSTOM_PTR          = 0x0001_0000;
		const CTOR_IS_ALLOCATOR   = 0x0002_0000;
		const INITED              = 0x0004_0000;
		const HAS_FINALIZER       = 0x0008_0000;
		const STATIC_CTOR_RUN     = 0x0010_0000;
		const STATIC_CTOR_RUNNING = 0x0020_0000;
	}
}

/// The operator dispatch table has one slot per entry here, in this order.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Operator {
	Add = 0,
	Sub = 1,
	Or = 2,
	Xor = 3,
	Mul = 4,
	Div = 5,
	Mod = 6,
	And = 7,
	Pow = 8,
	Shl = 9,
	Shr = 10,
	Hash = 11,
	Dollar = 12,
	Plus = 13,
	Neg = 14,
	Not = 15,
	Equals = 16,
	Compare = 17,
}

pub const OPERATOR_COUNT: usize = 18;

impl Operator {
	pub fn arity(&self) -> u16 {
		match self {
			Operator::Plus | Operator::Neg | Operator::Not => 1,
			_ => 2,
		}
	}
}

impl TryFrom<u32> for Operator {
	type Error = ();
	fn try_from(value: u32) -> Result<Self, Self::Error> {
		if value < OPERATOR_COUNT as u32 {
			// The discriminants are dense, starting at 0.
			Ok(unsafe { std::mem::transmute::<u32, Operator>(value) })
		} else {
			Err(())
		}
	}
}

/// Finalizer installed by a native type initializer; runs before the GC
/// releases an instance.
pub type Finalizer = unsafe extern "C" fn(instance: *mut c_void);

/// Walks the managed references inside a custom instance layout so the GC can
/// mark and forward them.
pub type ReferenceWalker =
	unsafe extern "C" fn(instance: *mut c_void, callback: unsafe extern "C" fn(*mut Value));

/// The kind of data stored in a native field, as declared to the GC.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NativeFieldKind {
	Value = 0,
	ValuePointer = 1,
	String = 2,
	GcArray = 3,
}

#[derive(Debug, Copy, Clone)]
pub struct NativeField {
	pub offset: usize,
	pub kind: NativeFieldKind,
}

/// A runtime type. Created structurally first (name, flags, bases) and
/// registered with its module before its members are populated, so member
/// payloads may refer back to the enclosing type.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Type {
	full_name: IStr,
	flags: Cell<TypeFlags>,
	base_type: Option<Rc<Type>>,
	shared_type: Option<Rc<Type>>,
	#[derivative(Debug = "ignore")]
	decl_module: Weak<Module>,
	#[derivative(Debug(format_with = "crate::utilities::fmt_debug_keys"))]
	members: RefCell<FxHashMap<IStr, Member>>,
	#[derivative(Debug = "ignore")]
	member_order: RefCell<Vec<IStr>>,
	#[derivative(Debug = "ignore")]
	operators: RefCell<[Option<Rc<MethodOverload>>; OPERATOR_COUNT]>,
	#[derivative(Debug = "ignore")]
	instance_ctor: RefCell<Option<Rc<Method>>>,
	fields_offset: Cell<u32>,
	size: Cell<u32>,
	field_count: Cell<u32>,
	#[derivative(Debug = "ignore")]
	finalizer: Cell<Option<Finalizer>>,
	#[derivative(Debug = "ignore")]
	reference_walker: Cell<Option<ReferenceWalker>>,
	#[derivative(Debug = "ignore")]
	native_fields: RefCell<Vec<NativeField>>,
}

impl Type {
	pub fn new(
		decl_module: &Rc<Module>,
		full_name: IStr,
		flags: TypeFlags,
		base_type: Option<Rc<Type>>,
		shared_type: Option<Rc<Type>>,
		member_capacity: usize,
	) -> Rc<Type> {
		let fields_offset = base_type.as_ref().map_or(0, |b| b.total_size());
		Rc::new(Type {
			full_name,
			flags: Cell::new(flags),
			base_type,
			shared_type,
			decl_module: Rc::downgrade(decl_module),
			members: RefCell::new(FxHashMap::with_capacity_and_hasher(
				member_capacity,
				Default::default(),
			)),
			member_order: RefCell::new(Vec::with_capacity(member_capacity)),
			operators: RefCell::new(std::array::from_fn(|_| None)),
			instance_ctor: RefCell::new(None),
			fields_offset: Cell::new(fields_offset),
			size: Cell::new(0),
			field_count: Cell::new(0),
			finalizer: Cell::new(None),
			reference_walker: Cell::new(None),
			native_fields: RefCell::new(Vec::new()),
		})
	}

	#[inline]
	pub fn full_name(&self) -> &IStr {
		&self.full_name
	}

	#[inline]
	pub fn flags(&self) -> TypeFlags {
		self.flags.get()
	}

	pub fn add_flags(&self, flags: TypeFlags) {
		self.flags.set(self.flags.get() | flags);
	}

	pub fn remove_flags(&self, flags: TypeFlags) {
		self.flags.set(self.flags.get() & !flags);
	}

	#[inline]
	pub fn base_type(&self) -> Option<&Rc<Type>> {
		self.base_type.as_ref()
	}

	#[inline]
	pub fn shared_type(&self) -> Option<&Rc<Type>> {
		self.shared_type.as_ref()
	}

	pub fn module(&self) -> Rc<Module> {
		self.decl_module.upgrade().expect("declaring module dropped while type is alive")
	}

	pub fn is_primitive(&self) -> bool {
		self.flags.get().contains(TypeFlags::PRIMITIVE)
	}

	pub fn is_abstract(&self) -> bool {
		self.flags.get().contains(TypeFlags::ABSTRACT)
	}

	pub fn is_static(&self) -> bool {
		self.flags.get().contains(TypeFlags::STATIC)
	}

	pub fn has_finalizer(&self) -> bool {
		self.flags.get().contains(TypeFlags::HAS_FINALIZER)
	}

	/// True if `self` is `ancestor` or inherits from it.
	pub fn derives_from(self: &Rc<Type>, ancestor: &Rc<Type>) -> bool {
		let mut current = Some(self.clone());
		while let Some(ty) = current {
			if Rc::ptr_eq(&ty, ancestor) {
				return true;
			}
			current = ty.base_type.clone();
		}
		false
	}

	pub fn add_member(&self, name: IStr, member: Member) -> bool {
		let mut members = self.members.borrow_mut();
		if members.contains_key(&name) {
			return false;
		}
		self.member_order.borrow_mut().push(name.clone());
		members.insert(name, member);
		true
	}

	pub fn get_member(&self, name: &IStr) -> Option<Member> {
		self.members.borrow().get(name).cloned()
	}

	/// Looks up a member anywhere along the inheritance chain.
	pub fn find_member(self: &Rc<Type>, name: &IStr) -> Option<Member> {
		let mut current = Some(self.clone());
		while let Some(ty) = current {
			if let Some(member) = ty.get_member(name) {
				return Some(member);
			}
			current = ty.base_type.clone();
		}
		None
	}

	pub fn member_count(&self) -> usize {
		self.member_order.borrow().len()
	}

	pub fn member_by_index(&self, index: usize) -> Option<Member> {
		let name = self.member_order.borrow().get(index).cloned()?;
		self.get_member(&name)
	}

	pub fn operator(&self, op: Operator) -> Option<Rc<MethodOverload>> {
		self.operators.borrow()[op as usize].clone()
	}

	pub fn set_operator(&self, op: Operator, overload: Rc<MethodOverload>) -> bool {
		let mut operators = self.operators.borrow_mut();
		let slot = &mut operators[op as usize];
		if slot.is_some() {
			return false;
		}
		*slot = Some(overload);
		true
	}

	/// Fills empty operator slots from the base type's dispatch table.
	pub fn init_operators(&self) {
		let Some(base) = &self.base_type else { return };
		let mut operators = self.operators.borrow_mut();
		let base_operators = base.operators.borrow();
		for (slot, inherited) in operators.iter_mut().zip(base_operators.iter()) {
			if slot.is_none() {
				*slot = inherited.clone();
			}
		}
	}

	pub fn instance_ctor(&self) -> Option<Rc<Method>> {
		self.instance_ctor.borrow().clone()
	}

	pub(crate) fn set_instance_ctor(&self, ctor: Rc<Method>) {
		*self.instance_ctor.borrow_mut() = Some(ctor);
	}

	/// Resolves the instance constructor from the freshly populated member
	/// table (`.new`, non-static, method).
	pub(crate) fn resolve_instance_ctor(&self, new_name: &IStr) {
		debug_assert_eq!(new_name.as_str(), special_names::NEW);
		if let Some(member) = self.get_member(new_name) {
			if !member.is_static() {
				if let Member::Method(ctor) = member {
					self.set_instance_ctor(ctor);
				}
			}
		}
	}

	/// The byte offset of this type's own fields within an instance.
	#[inline]
	pub fn fields_offset(&self) -> u32 {
		self.fields_offset.get()
	}

	/// The size of this type's own data (declared fields plus any native
	/// instance size set by a type initializer).
	#[inline]
	pub fn instance_size(&self) -> u32 {
		self.size.get()
	}

	pub fn set_instance_size(&self, size: u32) {
		self.size.set(size);
	}

	/// Base types' sizes plus this type's own.
	pub fn total_size(&self) -> u32 {
		self.fields_offset.get() + self.size.get()
	}

	#[inline]
	pub fn field_count(&self) -> u32 {
		self.field_count.get()
	}

	/// Reserves one value slot for a newly read instance field and returns
	/// its byte offset within the instance.
	pub(crate) fn add_instance_field(&self) -> u32 {
		let offset = self.total_size();
		self.field_count.set(self.field_count.get() + 1);
		self.size.set(self.size.get() + VALUE_SIZE as u32);
		offset
	}

	pub fn finalizer(&self) -> Option<Finalizer> {
		self.finalizer.get()
	}

	pub fn set_finalizer(&self, finalizer: Option<Finalizer>) {
		self.finalizer.set(finalizer);
		match finalizer {
			Some(_) => self.add_flags(TypeFlags::HAS_FINALIZER),
			None => self.remove_flags(TypeFlags::HAS_FINALIZER),
		}
	}

	pub fn reference_walker(&self) -> Option<ReferenceWalker> {
		self.reference_walker.get()
	}

	pub fn set_reference_walker(&self, walker: ReferenceWalker) {
		self.reference_walker.set(Some(walker));
		self.add_flags(TypeFlags::CUSTOM_PTR);
	}

	pub fn add_native_field(&self, offset: usize, kind: NativeFieldKind) {
		self.native_fields.borrow_mut().push(NativeField { offset, kind });
	}

	pub fn native_fields(&self) -> Vec<NativeField> {
		self.native_fields.borrow().clone()
	}

	/// The managed static constructor (`.init`), if the type declares one.
	pub fn static_ctor(&self, init_name: &IStr) -> Option<Rc<Method>> {
		debug_assert_eq!(init_name.as_str(), special_names::INIT);
		match self.get_member(init_name) {
			Some(Member::Method(m)) if m.is_static() => Some(m),
			_ => None,
		}
	}

	/// Marks the type's static constructor as running; returns false when it
	/// already ran or is running (re-entry).
	pub fn begin_static_ctor(&self) -> bool {
		let flags = self.flags.get();
		if flags.intersects(TypeFlags::STATIC_CTOR_RUN | TypeFlags::STATIC_CTOR_RUNNING) {
			return false;
		}
		self.add_flags(TypeFlags::STATIC_CTOR_RUNNING);
		true
	}

	pub fn finish_static_ctor(&self) {
		self.remove_flags(TypeFlags::STATIC_CTOR_RUNNING);
		self.add_flags(TypeFlags::STATIC_CTOR_RUN);
	}

	pub(crate) fn needs_static_init(&self) -> bool {
		!self.flags.get().intersects(TypeFlags::STATIC_CTOR_RUN | TypeFlags::STATIC_CTOR_RUNNING)
	}

	/// Whether `member_flags` is accessible from code declared in `from_type`
	/// / `from_module`, through an instance of `inst_type`.
	pub fn member_accessible(
		self: &Rc<Type>,
		member_flags: MemberFlags,
		inst_type: Option<&Rc<Type>>,
		from_type: Option<&Rc<Type>>,
		from_module: Option<&Rc<Module>>,
	) -> bool {
		crate::object::member::is_accessible(
			member_flags,
			Some(self),
			Some(&self.module()),
			inst_type,
			from_type,
			from_module,
		)
	}
}
