//! Keyed result cache for functions flagged memoizable. A cache entry is
//! keyed by `(fun_index, canonical(args))`; canonicalization requires every
//! argument to be memoizable — INT/FLOAT directly, a shared object only if
//! its transitive closure contains no unique object and no lazy value.
//! Insertion is racy-safe: concurrent computations of the same key agree on
//! a winner and the loser's result is discarded.
use fxhash::FxHashMap;
use std::sync::Mutex;

use crate::object::{Object, ObjectPayload, ObjectRef, TupleElementType};
use crate::value::{Value, ValueTag};

/// Why an argument list could not be canonicalized, and therefore why the
/// call must run uncached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotMemoizable {
	ContainsUniqueObject,
	ContainsLazyValue,
}

/// The canonical hash of a memoizable argument list, paired with the values
/// themselves so a bucket collision can be resolved by equality rather than
/// trusting the hash alone.
#[derive(Clone)]
pub struct CacheKey {
	fun_index: u32,
	hash: u64,
	args: Vec<Value>,
}

fn hash_value(value: &Value, hasher: &mut fxhash::FxHasher) -> Result<(), NotMemoizable> {
	use std::hash::Hasher;
	match value.tag() {
		ValueTag::Int => hasher.write_i64(value.as_int().unwrap()),
		ValueTag::Float => hasher.write_u64(value.as_float().unwrap().to_bits()),
		ValueTag::Ref => hash_object(value.as_object().unwrap(), hasher)?,
		ValueTag::LazyValueRef | ValueTag::LockedLazyValueRef => return Err(NotMemoizable::ContainsLazyValue),
		ValueTag::CanceledRef | ValueTag::Pair | ValueTag::Error => hasher.write_u8(0xee),
	}
	Ok(())
}

fn hash_object(object: &ObjectRef, hasher: &mut fxhash::FxHasher) -> Result<(), NotMemoizable> {
	use std::hash::Hasher;
	let obj = object.get();
	if obj.unique {
		return Err(NotMemoizable::ContainsUniqueObject);
	}
	hasher.write_u8(obj.kind as u8);
	match &obj.payload {
		ObjectPayload::IArray8(s) => s.iter().for_each(|v| hasher.write_i8(*v)),
		ObjectPayload::IArray16(s) => s.iter().for_each(|v| hasher.write_i16(*v)),
		ObjectPayload::IArray32(s) => s.iter().for_each(|v| hasher.write_i32(*v)),
		ObjectPayload::IArray64(s) => s.iter().for_each(|v| hasher.write_i64(*v)),
		ObjectPayload::SfArray(s) => s.iter().for_each(|v| hasher.write_u32(v.to_bits())),
		ObjectPayload::DfArray(s) => s.iter().for_each(|v| hasher.write_u64(v.to_bits())),
		ObjectPayload::RArray(slots) => {
			for slot in slots.iter() {
				match slot.get() {
					Some(target) => hash_object(&target, hasher)?,
					None => hasher.write_u8(0),
				}
			}
		}
		ObjectPayload::Tuple(elems) => {
			for elem in elems.iter() {
				let Some((payload, ty)) = elem.read() else { continue };
				match ty {
					TupleElementType::Int => hasher.write_i64(payload as i64),
					TupleElementType::Float => hasher.write_u64(payload),
					TupleElementType::Ref => {
						if let Some(ptr) = std::ptr::NonNull::new(payload as *mut Object) {
							hash_object(&unsafe { ObjectRef::from_raw(ptr) }, hasher)?;
						}
					}
				}
			}
		}
		ObjectPayload::Io => {}
		ObjectPayload::LazyValue(_) => return Err(NotMemoizable::ContainsLazyValue),
		ObjectPayload::Native(_) => hasher.write_usize(object.as_ptr() as usize),
	}
	Ok(())
}

impl CacheKey {
	pub fn new(fun_index: u32, args: &[Value]) -> Result<Self, NotMemoizable> {
		use std::hash::Hasher;
		let mut hasher = fxhash::FxHasher::default();
		hasher.write_u32(fun_index);
		for arg in args {
			hash_value(arg, &mut hasher)?;
		}
		Ok(Self { fun_index, hash: hasher.finish(), args: args.to_vec() })
	}

	fn matches(&self, other_fun: u32, other_args: &[Value]) -> bool {
		self.fun_index == other_fun && self.args.len() == other_args.len() && self.args.iter().zip(other_args).all(|(a, b)| values_equal(a, b))
	}
}

fn values_equal(a: &Value, b: &Value) -> bool {
	match (a.tag(), b.tag()) {
		(ValueTag::Int, ValueTag::Int) => a.as_int() == b.as_int(),
		(ValueTag::Float, ValueTag::Float) => a.as_float() == b.as_float(),
		(ValueTag::Ref, ValueTag::Ref) => std::ptr::eq(a.as_object().unwrap().as_ptr(), b.as_object().unwrap().as_ptr()) || objects_equal(a.as_object().unwrap(), b.as_object().unwrap()),
		_ => false,
	}
}

fn objects_equal(a: &ObjectRef, b: &ObjectRef) -> bool {
	let (oa, ob) = (a.get(), b.get());
	if oa.kind != ob.kind || oa.unique || ob.unique {
		return false;
	}
	match (&oa.payload, &ob.payload) {
		(ObjectPayload::IArray8(x), ObjectPayload::IArray8(y)) => x == y,
		(ObjectPayload::IArray16(x), ObjectPayload::IArray16(y)) => x == y,
		(ObjectPayload::IArray32(x), ObjectPayload::IArray32(y)) => x == y,
		(ObjectPayload::IArray64(x), ObjectPayload::IArray64(y)) => x == y,
		(ObjectPayload::SfArray(x), ObjectPayload::SfArray(y)) => x == y,
		(ObjectPayload::DfArray(x), ObjectPayload::DfArray(y)) => x == y,
		_ => false,
	}
}

/// Bucketed, insertion-racy result cache. Buckets are hashed into by
/// `hash % bucket_count`; within a bucket, entries that share a 64-bit hash
/// are chained and resolved by key equality, so a hash collision degrades to
/// a short linear scan instead of one key silently shadowing another.
pub struct MemoizationCache {
	buckets: Vec<Mutex<FxHashMap<u64, Vec<(CacheKey, Value)>>>>,
}

impl MemoizationCache {
	pub fn new(bucket_count: usize) -> Self {
		let bucket_count = bucket_count.max(1);
		Self { buckets: (0..bucket_count).map(|_| Mutex::new(FxHashMap::default())).collect() }
	}

	fn bucket(&self, hash: u64) -> &Mutex<FxHashMap<u64, Vec<(CacheKey, Value)>>> {
		&self.buckets[(hash as usize) % self.buckets.len()]
	}

	pub fn get(&self, fun_index: u32, args: &[Value]) -> Result<Option<Value>, NotMemoizable> {
		let key = CacheKey::new(fun_index, args)?;
		let bucket = self.bucket(key.hash).lock().unwrap();
		Ok(bucket
			.get(&key.hash)
			.and_then(|chain| chain.iter().find(|(k, _)| k.matches(fun_index, args)))
			.map(|(_, v)| v.clone()))
	}

	/// Inserts `result` for `key` unless a concurrent winner already holds
	/// this slot, in which case that winner's value is returned instead and
	/// `result` is discarded — "one thread wins" from §4.6.
	pub fn get_or_insert(&self, fun_index: u32, args: &[Value], compute: impl FnOnce() -> Value) -> Result<Value, NotMemoizable> {
		let key = CacheKey::new(fun_index, args)?;
		let bucket = self.bucket(key.hash).lock().unwrap();
		if let Some(value) = bucket.get(&key.hash).and_then(|chain| chain.iter().find(|(k, _)| k.matches(fun_index, args))) {
			return Ok(value.1.clone());
		}
		drop(bucket);
		let computed = compute();
		let mut bucket = self.bucket(key.hash).lock().unwrap();
		let chain = bucket.entry(key.hash).or_default();
		if let Some((_, winner)) = chain.iter().find(|(k, _)| k.matches(fun_index, args)) {
			return Ok(winner.clone());
		}
		chain.push((key, computed.clone()));
		Ok(computed)
	}

	/// Every value currently cached, kept alive as GC roots per §3's
	/// lifetime rule ("any memoization cache entry").
	pub fn roots(&self) -> Vec<ObjectRef> {
		let mut roots = Vec::new();
		for bucket in &self.buckets {
			for chain in bucket.lock().unwrap().values() {
				for (_, value) in chain {
					if let Some(obj) = value.as_object() {
						roots.push(*obj);
					}
				}
			}
		}
		roots
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn repeated_lookup_returns_same_value_without_recomputing() {
		let cache = MemoizationCache::new(4);
		let calls = std::sync::atomic::AtomicUsize::new(0);
		let compute = || {
			calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			Value::int(55)
		};
		let first = cache.get_or_insert(0, &[Value::int(10)], compute).unwrap();
		assert_eq!(first.as_int(), Some(55));
		let second = cache.get_or_insert(0, &[Value::int(10)], || {
			calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			Value::int(999)
		});
		assert_eq!(second.unwrap().as_int(), Some(55));
		assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
	}

	#[test]
	fn distinct_argument_lists_key_separately() {
		let cache = MemoizationCache::new(4);
		let a = cache.get_or_insert(0, &[Value::int(1)], || Value::int(1)).unwrap();
		let b = cache.get_or_insert(0, &[Value::int(2)], || Value::int(4)).unwrap();
		assert_eq!(a.as_int(), Some(1));
		assert_eq!(b.as_int(), Some(4));
	}

	#[test]
	fn colliding_hashes_in_the_same_bucket_stay_distinct() {
		// Two keys that happen to share a 64-bit hash (forced here rather
		// than found, since a genuine fxhash collision isn't practical to
		// construct) must still be told apart by `CacheKey::matches`, not
		// merged into a single slot keyed on the hash alone.
		let cache = MemoizationCache::new(1);
		let key_a = CacheKey { fun_index: 0, hash: 7, args: vec![Value::int(1)] };
		let key_b = CacheKey { fun_index: 1, hash: 7, args: vec![Value::int(2)] };
		{
			let mut bucket = cache.bucket(7).lock().unwrap();
			bucket.entry(7).or_default().push((key_a, Value::int(111)));
			bucket.entry(7).or_default().push((key_b, Value::int(222)));
		}

		let bucket = cache.bucket(7).lock().unwrap();
		let chain = bucket.get(&7).unwrap();
		assert_eq!(chain.len(), 2);
		let found_a = chain.iter().find(|(k, _)| k.matches(0, &[Value::int(1)])).unwrap();
		let found_b = chain.iter().find(|(k, _)| k.matches(1, &[Value::int(2)])).unwrap();
		assert_eq!(found_a.1.as_int(), Some(111));
		assert_eq!(found_b.1.as_int(), Some(222));
	}

	#[test]
	fn lazy_value_argument_is_not_memoizable() {
		let cache = MemoizationCache::new(1);
		let lazy_obj = unsafe {
			ObjectRef::from_raw(std::ptr::NonNull::new(Box::into_raw(Box::new(Object {
				kind: crate::object::ObjectKind::LazyValue,
				unique: false,
				payload: ObjectPayload::LazyValue(crate::object::LazyValueState {
					fun_index: 0,
					args: Box::new([]),
					must_be_shared: false,
					mutex: Mutex::new(None),
					forcing_thread: std::sync::atomic::AtomicU64::new(0),
				}),
			})) as *mut Object).unwrap())
		};
		let result = cache.get_or_insert(0, &[Value::lazy_value_ref(lazy_obj)], Value::error);
		assert_eq!(result.err(), Some(NotMemoizable::ContainsLazyValue));
	}
}
