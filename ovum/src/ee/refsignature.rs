//! Reference signatures encode which parameter or argument positions are
//! passed by reference, as a bit field where set bits mean "by reference".
//! Bit 0 is reserved for the instance (always clear, `this` cannot be passed
//! by ref). A short signature stores the bits in the low 31 bits of a `u32`
//! with the high bit clear; a long signature sets the high bit and stores an
//! index into the pool's table of interned variable-length bit masks. The
//! value 0 universally means "nothing by reference", even for methods with
//! more than 30 parameters.

use parking_lot::Mutex;
use std::sync::Arc;

pub const SIGNATURE_KIND_MASK: u32 = 0x8000_0000;
pub const SIGNATURE_DATA_MASK: u32 = 0x7FFF_FFFF;

/// Named parameters a short signature can encode (excluding the instance
/// slot, for which space is always reserved).
pub const MAX_SHORT_PARAM_COUNT: u32 = 31;

const PARAMS_PER_MASK: u32 = 32;

/// A variable-length by-ref bit mask, for signatures that do not fit the
/// short form.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LongRefSignature {
	param_count: u32,
	masks: Box<[u32]>,
}

impl LongRefSignature {
	pub fn new(param_count: u32) -> Self {
		let mask_count = (param_count + PARAMS_PER_MASK - 1) / PARAMS_PER_MASK;
		Self {
			param_count: mask_count * PARAMS_PER_MASK,
			masks: vec![0u32; mask_count as usize].into_boxed_slice(),
		}
	}

	pub fn is_param_ref(&self, index: u32) -> bool {
		if index >= self.param_count {
			return false;
		}
		let mask = self.masks[(index / PARAMS_PER_MASK) as usize];
		(mask >> (index % PARAMS_PER_MASK)) & 1 == 1
	}

	pub fn set_param(&mut self, index: u32, is_ref: bool) {
		let mask = &mut self.masks[(index / PARAMS_PER_MASK) as usize];
		let bit = 1u32 << (index % PARAMS_PER_MASK);
		if is_ref {
			*mask |= bit;
		} else {
			*mask &= !bit;
		}
	}

	pub fn has_refs(&self) -> bool {
		self.masks.iter().any(|m| *m != 0)
	}
}

/// Interning table for long signatures. Two long signatures are equal iff
/// their pool indices are equal.
#[derive(Debug, Default)]
pub struct RefSignaturePool {
	signatures: Mutex<Vec<Arc<LongRefSignature>>>,
}

impl RefSignaturePool {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, index: u32) -> Option<Arc<LongRefSignature>> {
		self.signatures.lock().get(index as usize).cloned()
	}

	/// Interns `signature`, returning its tagged index. An existing equal
	/// entry is reused.
	pub fn add(&self, signature: LongRefSignature) -> u32 {
		let mut signatures = self.signatures.lock();
		for (i, existing) in signatures.iter().enumerate() {
			if **existing == signature {
				return i as u32 | SIGNATURE_KIND_MASK;
			}
		}
		let index = signatures.len() as u32;
		signatures.push(Arc::new(signature));
		index | SIGNATURE_KIND_MASK
	}
}

/// Builds a signature while parameters are read; commits to the short form
/// when it fits and interns a long signature otherwise.
pub enum RefSignatureBuilder {
	Short(u32),
	Long(LongRefSignature),
}

impl RefSignatureBuilder {
	/// `param_count` must include the reserved instance slot.
	pub fn new(param_count: u32) -> Self {
		if param_count > MAX_SHORT_PARAM_COUNT {
			Self::Long(LongRefSignature::new(param_count))
		} else {
			Self::Short(0)
		}
	}

	pub fn is_param_ref(&self, index: u32) -> bool {
		match self {
			Self::Short(mask) => (mask >> index) & 1 == 1,
			Self::Long(sig) => sig.is_param_ref(index),
		}
	}

	pub fn set_param(&mut self, index: u32, is_ref: bool) {
		match self {
			Self::Short(mask) => {
				if is_ref {
					*mask |= 1 << index;
				} else {
					*mask &= !(1 << index);
				}
			}
			Self::Long(sig) => sig.set_param(index, is_ref),
		}
	}

	pub fn commit(self, pool: &RefSignaturePool) -> u32 {
		match self {
			Self::Short(mask) => mask,
			// 0 is reserved for "nothing by ref", even for long signatures.
			Self::Long(sig) if !sig.has_refs() => 0,
			Self::Long(sig) => pool.add(sig),
		}
	}
}

/// A resolved view over a committed signature code.
pub enum RefSignature {
	Short(u32),
	Long(Arc<LongRefSignature>),
}

impl RefSignature {
	pub fn new(code: u32, pool: &RefSignaturePool) -> Self {
		if code & SIGNATURE_KIND_MASK != 0 {
			match pool.get(code & SIGNATURE_DATA_MASK) {
				Some(sig) => Self::Long(sig),
				// An unknown index cannot come from this pool; treat it as
				// "nothing by ref" rather than indexing out of bounds.
				None => Self::Short(0),
			}
		} else {
			Self::Short(code & SIGNATURE_DATA_MASK)
		}
	}

	pub fn is_param_ref(&self, index: u32) -> bool {
		match self {
			// A short signature has MAX_SHORT_PARAM_COUNT usable bit
			// positions (0..=30); the high bit is the long-signature tag.
			Self::Short(mask) => index < MAX_SHORT_PARAM_COUNT && (mask >> index) & 1 == 1,
			Self::Long(sig) => sig.is_param_ref(index),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn commit(flags: &[bool], pool: &RefSignaturePool) -> u32 {
		let mut builder = RefSignatureBuilder::new(flags.len() as u32 + 1);
		for (i, by_ref) in flags.iter().enumerate() {
			builder.set_param(i as u32 + 1, *by_ref);
		}
		builder.commit(pool)
	}

	#[test]
	fn zero_means_nothing_by_ref() {
		let pool = RefSignaturePool::new();
		assert_eq!(commit(&[false; 4], &pool), 0);
		assert_eq!(commit(&[false; 60], &pool), 0);
	}

	#[test]
	fn committing_is_canonical() {
		let pool = RefSignaturePool::new();
		let flags: Vec<bool> = (0..40).map(|i| i % 3 == 0).collect();
		let a = commit(&flags, &pool);
		let b = commit(&flags, &pool);
		assert_eq!(a, b);
		assert_ne!(a & SIGNATURE_KIND_MASK, 0);
	}

	#[test]
	fn distinct_masks_get_distinct_indices() {
		let pool = RefSignaturePool::new();
		let mut a_flags = vec![false; 40];
		a_flags[5] = true;
		let mut b_flags = vec![false; 40];
		b_flags[6] = true;
		let a = commit(&a_flags, &pool);
		let b = commit(&b_flags, &pool);
		assert_ne!(a, b);
	}

	#[test]
	fn short_signatures_are_the_mask_itself() {
		let pool = RefSignaturePool::new();
		let code = commit(&[false, true, true, false], &pool);
		// Bit 0 is the instance; named params start at bit 1.
		assert_eq!(code, 0b0110_0);
		let sig = RefSignature::new(code, &pool);
		assert!(!sig.is_param_ref(0));
		assert!(!sig.is_param_ref(1));
		assert!(sig.is_param_ref(2));
		assert!(sig.is_param_ref(3));
		assert!(!sig.is_param_ref(4));
	}

	#[test]
	fn long_and_short_views_agree() {
		let pool = RefSignaturePool::new();
		// Same by-ref set, one committed short and one long.
		let mut long_flags = vec![false; 40];
		long_flags[1] = true;
		let short_code = commit(&long_flags[..8].to_vec(), &pool);
		let long_code = commit(&long_flags, &pool);
		assert_ne!(short_code, long_code);

		let short = RefSignature::new(short_code, &pool);
		let long = RefSignature::new(long_code, &pool);
		for i in 0..10 {
			assert_eq!(short.is_param_ref(i), long.is_param_ref(i), "slot {i}");
		}
	}

	#[test]
	fn indices_beyond_a_short_signature_are_not_refs() {
		let pool = RefSignaturePool::new();
		// All 31 usable bits set; bit 31 is the (clear) long-signature tag.
		let sig = RefSignature::new(0x7FFF_FFFF, &pool);
		assert!(sig.is_param_ref(30));
		assert!(!sig.is_param_ref(31));
		assert!(!sig.is_param_ref(32));
		assert!(!sig.is_param_ref(100));
	}
}
