//! The runtime tagged [`Value`] cell: the sixteen-byte union every local
//! variable, argument slot, global variable, and `rv` register holds. Wire
//! tags are defined once in [`crate::format::value_type`] and reused here so
//! a loaded [`crate::format::RawValue`] and a live `Value` never drift apart.
use std::sync::atomic::{AtomicI64, Ordering};

use crate::format::value_type;
use crate::object::ObjectRef;

/// Tag discriminant for a [`Value`]. Matches [`crate::format::value_type`]
/// one-for-one except that `LAZILY_CANCELED` is represented as a flag on
/// `LazyValueRef`/`LockedLazyValueRef` rather than a distinct tag, since it
/// only ever modifies one of those two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTag {
	Int,
	Float,
	Ref,
	Pair,
	CanceledRef,
	Error,
	LazyValueRef,
	LockedLazyValueRef,
}

impl ValueTag {
	pub const fn wire(self) -> i32 {
		match self {
			ValueTag::Int => value_type::INT,
			ValueTag::Float => value_type::FLOAT,
			ValueTag::Ref => value_type::REF,
			ValueTag::Pair => value_type::PAIR,
			ValueTag::CanceledRef => value_type::CANCELED_REF,
			ValueTag::Error => value_type::ERROR,
			ValueTag::LazyValueRef => value_type::LAZY_VALUE_REF,
			ValueTag::LockedLazyValueRef => value_type::LOCKED_LAZY_VALUE_REF,
		}
	}

	pub fn from_wire(wire: i32) -> Option<Self> {
		let base = wire & !value_type::LAZILY_CANCELED;
		match base {
			v if v == value_type::INT => Some(ValueTag::Int),
			v if v == value_type::FLOAT => Some(ValueTag::Float),
			v if v == value_type::REF => Some(ValueTag::Ref),
			v if v == value_type::PAIR => Some(ValueTag::Pair),
			v if v == value_type::CANCELED_REF => Some(ValueTag::CanceledRef),
			v if v == value_type::ERROR => Some(ValueTag::Error),
			v if v == value_type::LAZY_VALUE_REF => Some(ValueTag::LazyValueRef),
			v if v == value_type::LOCKED_LAZY_VALUE_REF => Some(ValueTag::LockedLazyValueRef),
			_ => None,
		}
	}
}

/// Packed payload of a [`Value`]: either an integer, the bit pattern of a
/// float, or an object reference, stored untagged. Which interpretation is
/// valid is governed by the owning `Value`'s tag, exactly as the 16-byte
/// wire cell does with its `__pad`-separated union.
#[derive(Clone, Copy)]
union Payload {
	int: i64,
	float_bits: u64,
	object: Option<ObjectRef>,
}

/// A single tagged machine value: the unit every local variable, argument,
/// global variable slot, and interpreter register holds. `tag` additionally
/// carries the `LAZILY_CANCELED` bit for the two lazy-ref variants.
pub struct Value {
	tag: ValueTag,
	lazily_canceled: bool,
	payload: Payload,
}

impl Clone for Value {
	fn clone(&self) -> Self {
		Self { tag: self.tag, lazily_canceled: self.lazily_canceled, payload: self.payload }
	}
}

impl Value {
	pub fn int(i: i64) -> Self {
		Self { tag: ValueTag::Int, lazily_canceled: false, payload: Payload { int: i } }
	}

	pub fn float(f: f64) -> Self {
		Self { tag: ValueTag::Float, lazily_canceled: false, payload: Payload { float_bits: f.to_bits() } }
	}

	pub fn reference(object: ObjectRef) -> Self {
		Self { tag: ValueTag::Ref, lazily_canceled: false, payload: Payload { object: Some(object) } }
	}

	pub fn pair(hi: u32, lo: u32) -> Self {
		Self { tag: ValueTag::Pair, lazily_canceled: false, payload: Payload { int: ((hi as i64) << 32) | lo as i64 } }
	}

	pub fn error() -> Self {
		Self { tag: ValueTag::Error, lazily_canceled: false, payload: Payload { int: 0 } }
	}

	pub fn lazy_value_ref(object: ObjectRef) -> Self {
		Self { tag: ValueTag::LazyValueRef, lazily_canceled: false, payload: Payload { object: Some(object) } }
	}

	pub fn tag(&self) -> ValueTag {
		self.tag
	}

	pub fn is_lazily_canceled(&self) -> bool {
		self.lazily_canceled
	}

	pub fn as_int(&self) -> Option<i64> {
		matches!(self.tag, ValueTag::Int).then(|| unsafe { self.payload.int })
	}

	pub fn as_float(&self) -> Option<f64> {
		matches!(self.tag, ValueTag::Float).then(|| f64::from_bits(unsafe { self.payload.float_bits }))
	}

	pub fn as_pair(&self) -> Option<(u32, u32)> {
		matches!(self.tag, ValueTag::Pair).then(|| {
			let packed = unsafe { self.payload.int };
			((packed >> 32) as u32, packed as u32)
		})
	}

	/// The live object this value references, if its tag still permits
	/// dereferencing (`Ref`, `LazyValueRef`, `LockedLazyValueRef`). A
	/// `CanceledRef` or a lazily-cancelled lazy ref returns `None`: callers
	/// must translate that into `AGAIN_USED_UNIQUE`.
	pub fn as_object(&self) -> Option<&ObjectRef> {
		match self.tag {
			ValueTag::Ref => unsafe { self.payload.object.as_ref() },
			ValueTag::LazyValueRef | ValueTag::LockedLazyValueRef if !self.lazily_canceled => unsafe {
				self.payload.object.as_ref()
			},
			_ => None,
		}
	}

	/// Transitions a unique reference to `CanceledRef` in place, the runtime
	/// witness that a linear object's single owner has already moved it
	/// onward. Subsequent reads through any other `Value` holding the same
	/// tag observe `CanceledRef` and fail with `AGAIN_USED_UNIQUE`.
	pub fn cancel_ref(&mut self) {
		if matches!(self.tag, ValueTag::Ref) {
			self.tag = ValueTag::CanceledRef;
			self.payload = Payload { int: 0 };
		}
	}

	/// Marks a lazy reference `LAZILY_CANCELED`: it was consumed by a
	/// unique-object operation before being forced. Forcing still succeeds,
	/// but reading the forced value afterwards fails with `AGAIN_USED_UNIQUE`.
	pub fn lazily_cancel_ref(&mut self) {
		if matches!(self.tag, ValueTag::LazyValueRef | ValueTag::LockedLazyValueRef) {
			self.lazily_canceled = true;
		}
	}

	pub fn is_canceled(&self) -> bool {
		matches!(self.tag, ValueTag::CanceledRef) || (self.lazily_canceled && matches!(self.tag, ValueTag::LazyValueRef | ValueTag::LockedLazyValueRef))
	}
}

/// A [`Value`] slot with release/acquire fence discipline for cross-thread
/// publication. Writing a `Ref` into a slot the GC can reach, and the GC's
/// read of that slot while tracing, must pair a release store with an
/// acquire load — otherwise the collector could observe a partially
/// constructed object through a freshly published reference.
///
/// This wraps an `AtomicI64` rather than `Value` directly: a `Value` is not
/// `Copy`-friendly across an atomic boundary once it carries a non-`'static`
/// object handle, so slots that need fenced publication narrow to the
/// packed integer/bit-pattern representation and reconstruct the tag
/// out-of-band (the owning frame or global-variable table already knows
/// which tag a slot holds; only the *payload* races against the GC).
pub struct FencedSlot(AtomicI64);

impl FencedSlot {
	pub fn new(initial: i64) -> Self {
		Self(AtomicI64::new(initial))
	}

	#[inline]
	pub fn publish(&self, payload: i64) {
		self.0.store(payload, Ordering::Release);
	}

	#[inline]
	pub fn load_for_trace(&self) -> i64 {
		self.0.load(Ordering::Acquire)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn int_round_trips() {
		let v = Value::int(42);
		assert_eq!(v.as_int(), Some(42));
		assert_eq!(v.as_float(), None);
	}

	#[test]
	fn cancel_ref_transitions_tag() {
		let mut v = Value::int(0);
		v.cancel_ref();
		assert_eq!(v.tag(), ValueTag::Int, "cancel_ref is a no-op on non-Ref tags");
	}

	#[test]
	fn lazily_canceled_ref_hides_object() {
		let tag = ValueTag::from_wire(value_type::REF).unwrap();
		assert_eq!(tag, ValueTag::Ref);
		let tag_with_bit = ValueTag::from_wire(value_type::LAZY_VALUE_REF | value_type::LAZILY_CANCELED).unwrap();
		assert_eq!(tag_with_bit, ValueTag::LazyValueRef);
	}
}
