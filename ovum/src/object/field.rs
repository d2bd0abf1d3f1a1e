use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::rc::{Rc, Weak};

use crate::module::Module;
use crate::object::member::MemberFlags;
use crate::object::method::Method;
use crate::object::r#type::Type;
use crate::strings::IStr;
use crate::value::StaticRef;

/// A field of a type. Instance fields occupy one value slot at `offset`
/// within the instance; static fields (and constant fields) hold their value
/// in a GC-registered static cell.
pub struct Field {
	name: IStr,
	flags: MemberFlags,
	decl_type: Weak<Type>,
	decl_module: Weak<Module>,
	offset: Cell<u32>,
	static_value: RefCell<Option<Rc<StaticRef>>>,
}

impl Field {
	pub fn new(
		name: IStr,
		flags: MemberFlags,
		decl_type: &Rc<Type>,
		decl_module: &Rc<Module>,
	) -> Rc<Field> {
		Rc::new(Field {
			name,
			flags,
			decl_type: Rc::downgrade(decl_type),
			decl_module: Rc::downgrade(decl_module),
			offset: Cell::new(0),
			static_value: RefCell::new(None),
		})
	}

	#[inline]
	pub fn name(&self) -> &IStr {
		&self.name
	}

	#[inline]
	pub fn flags(&self) -> MemberFlags {
		self.flags
	}

	pub fn is_static(&self) -> bool {
		!self.flags.contains(MemberFlags::INSTANCE)
	}

	pub fn has_constant_value(&self) -> bool {
		self.flags.contains(MemberFlags::HAS_VALUE)
	}

	pub fn decl_type(&self) -> Rc<Type> {
		self.decl_type.upgrade().expect("declaring type dropped while field is alive")
	}

	pub fn module(&self) -> Rc<Module> {
		self.decl_module.upgrade().expect("declaring module dropped while field is alive")
	}

	/// Byte offset of this field within an instance. Meaningless for statics.
	#[inline]
	pub fn offset(&self) -> u32 {
		self.offset.get()
	}

	pub(crate) fn set_offset(&self, offset: u32) {
		self.offset.set(offset);
	}

	pub fn static_value(&self) -> Option<Rc<StaticRef>> {
		self.static_value.borrow().clone()
	}

	pub(crate) fn set_static_value(&self, value: Rc<StaticRef>) {
		*self.static_value.borrow_mut() = Some(value);
	}

	pub fn is_accessible(
		&self,
		inst_type: Option<&Rc<Type>>,
		from_type: Option<&Rc<Type>>,
		from_module: Option<&Rc<Module>>,
	) -> bool {
		crate::object::member::is_accessible(
			self.flags,
			Some(&self.decl_type()),
			Some(&self.module()),
			inst_type,
			from_type,
			from_module,
		)
	}
}

impl Debug for Field {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "Field({:?}, {:?})", self.name, self.flags)
	}
}

/// A property: a named pair of accessor methods. At least one accessor is
/// present, and the accessors agree on accessibility and staticness.
pub struct Property {
	name: IStr,
	flags: MemberFlags,
	decl_type: Weak<Type>,
	getter: Option<Rc<Method>>,
	setter: Option<Rc<Method>>,
}

impl Property {
	pub fn new(
		name: IStr,
		flags: MemberFlags,
		decl_type: &Rc<Type>,
		getter: Option<Rc<Method>>,
		setter: Option<Rc<Method>>,
	) -> Rc<Property> {
		debug_assert!(getter.is_some() || setter.is_some());
		Rc::new(Property {
			name,
			flags,
			decl_type: Rc::downgrade(decl_type),
			getter,
			setter,
		})
	}

	#[inline]
	pub fn name(&self) -> &IStr {
		&self.name
	}

	#[inline]
	pub fn flags(&self) -> MemberFlags {
		self.flags
	}

	pub fn decl_type(&self) -> Rc<Type> {
		self.decl_type.upgrade().expect("declaring type dropped while property is alive")
	}

	pub fn getter(&self) -> Option<&Rc<Method>> {
		self.getter.as_ref()
	}

	pub fn setter(&self) -> Option<&Rc<Method>> {
		self.setter.as_ref()
	}
}

impl Debug for Property {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"Property({:?}, get: {}, set: {})",
			self.name,
			self.getter.is_some(),
			self.setter.is_some(),
		)
	}
}
