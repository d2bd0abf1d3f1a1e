use std::cell::RefCell;
use std::rc::Rc;

use crate::object::r#type::Type;
use crate::strings::IStr;

/// The size of one value slot in a stack frame. All frame-relative offsets
/// computed by the method initializer are multiples of this.
pub const VALUE_SIZE: usize = std::mem::size_of::<Value>();

/// A managed value. The core only materializes the shapes that can appear in
/// module constants and static field cells; everything else belongs to the
/// interpreter and GC.
#[derive(Debug, Clone)]
pub struct Value {
	pub ty: Rc<Type>,
	pub data: ValueData,
}

#[derive(Debug, Clone)]
pub enum ValueData {
	Int(i64),
	UInt(u64),
	Real(f64),
	String(IStr),
}

impl Value {
	pub fn int(ty: Rc<Type>, value: i64) -> Self {
		Self { ty, data: ValueData::Int(value) }
	}

	pub fn string(ty: Rc<Type>, value: IStr) -> Self {
		Self { ty, data: ValueData::String(value) }
	}
}

/// A GC-registered static root. Static fields and constant cells hold one of
/// these; the GC walks the registry to mark the contained values.
#[derive(Debug)]
pub struct StaticRef {
	value: RefCell<Value>,
}

impl StaticRef {
	pub fn new(value: Value) -> Self {
		Self { value: RefCell::new(value) }
	}

	pub fn get(&self) -> Value {
		self.value.borrow().clone()
	}

	pub fn set(&self, value: Value) {
		*self.value.borrow_mut() = value;
	}
}
