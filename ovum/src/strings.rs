use std::cell::RefCell;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::rc::Rc;

use fxhash::FxHashMap;

use crate::utilities::impl_rc_identity;

/// An interned managed string. Two `IStr`s with the same contents obtained
/// from the same pool share storage, so equality and hashing are by pointer.
#[derive(Clone)]
pub struct IStr(Rc<str>);

impl_rc_identity!(IStr);

impl IStr {
	#[inline]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Deref for IStr {
	type Target = str;
	#[inline]
	fn deref(&self) -> &str {
		&self.0
	}
}

impl Display for IStr {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		Display::fmt(&self.0, f)
	}
}

impl Debug for IStr {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		Debug::fmt(&self.0, f)
	}
}

/// The VM-wide string intern pool. The GC proper is an external collaborator;
/// the pool is the part of it the loader depends on: every string read from a
/// module file is interned here, so identical literal contents across modules
/// share one allocation.
#[derive(Default)]
pub struct StringPool {
	strings: RefCell<FxHashMap<Box<str>, IStr>>,
}

impl StringPool {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn intern(&self, value: &str) -> IStr {
		let mut strings = self.strings.borrow_mut();
		if let Some(interned) = strings.get(value) {
			return interned.clone();
		}
		let interned = IStr(Rc::from(value));
		strings.insert(Box::from(value), interned.clone());
		interned
	}

	/// Looks up an already-interned string without inserting.
	pub fn get(&self, value: &str) -> Option<IStr> {
		self.strings.borrow().get(value).cloned()
	}

	pub fn len(&self) -> usize {
		self.strings.borrow().len()
	}

	pub fn is_empty(&self) -> bool {
		self.strings.borrow().is_empty()
	}
}

impl Debug for StringPool {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "StringPool[{}]", self.strings.borrow().len())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn interning_shares_storage() {
		let pool = StringPool::new();
		let a = pool.intern("aves.Object");
		let b = pool.intern("aves.Object");
		assert_eq!(a, b);
		assert!(Rc::ptr_eq(&a.0, &b.0));
		assert_eq!(pool.len(), 1);
	}

	#[test]
	fn distinct_contents_are_distinct() {
		let pool = StringPool::new();
		let a = pool.intern("x");
		let b = pool.intern("y");
		assert_ne!(a, b);
	}

	#[test]
	fn get_does_not_insert() {
		let pool = StringPool::new();
		assert!(pool.get("missing").is_none());
		let a = pool.intern("present");
		assert_eq!(pool.get("present"), Some(a));
		assert_eq!(pool.len(), 1);
	}
}
