use std::cell::RefCell;
use std::fmt::{Debug, Formatter};

#[inline]
pub(crate) const fn round_to_multiple_of<const MULTIPLE: usize>(value: usize) -> usize {
	((value + (MULTIPLE - 1)) / MULTIPLE) * MULTIPLE
}

pub(crate) fn fmt_debug_keys<K: Debug, V>(
	values: &RefCell<fxhash::FxHashMap<K, V>>,
	fmt: &mut Formatter,
) -> std::fmt::Result {
	let values = values.borrow();
	let mut dbg = fmt.debug_list();
	for key in values.keys() {
		dbg.entry(key);
	}
	dbg.finish()
}

/// Declares pointer-identity `Eq`/`Hash` for reference-counted handle types
/// whose contents are interned or otherwise unique per allocation.
macro_rules! impl_rc_identity {
	($($ty: ident),*) => {
		$(
			impl Eq for $ty {}

			impl PartialEq<Self> for $ty {
				#[inline]
				fn eq(&self, other: &Self) -> bool {
					std::rc::Rc::ptr_eq(&self.0, &other.0)
				}
			}

			impl std::hash::Hash for $ty {
				fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
					state.write_usize(std::rc::Rc::as_ptr(&self.0) as *const u8 as usize)
				}
			}
		)*
	};
}

pub(crate) use impl_rc_identity;
