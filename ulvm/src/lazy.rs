//! Forcing protocol for `LAZY_VALUE` objects. A lazy value is created when
//! an eager call site runs under a lazy evaluation strategy: instead of
//! invoking the callee immediately, the interpreter wraps the call
//! (function index + captured arguments) in a [`crate::object::LazyValueState`]
//! and hands back a `LazyValueRef`. [`force`] and [`fully_force`] are the
//! only ways that wrapped call ever actually runs.
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex};

use crate::error::ErrorCode;
use crate::object::{LazyValueState, ObjectPayload, ObjectRef};
use crate::value::Value;

/// A counting semaphore limiting how many threads may simultaneously hold
/// any thunk's mutex, so mass-forcing cannot starve the collector: the GC
/// refuses to stop a thread that holds a thunk mutex, so an unbounded
/// number of concurrently-forcing threads could stall collection
/// indefinitely. `lazy_value_mutex_sem` is one instance of this, shared by
/// the whole process.
pub struct LockCount {
	available: Mutex<usize>,
	released: Condvar,
}

impl LockCount {
	pub fn new(capacity: usize) -> Self {
		Self { available: Mutex::new(capacity), released: Condvar::new() }
	}

	fn acquire(&self) -> LockCountGuard<'_> {
		let mut available = self.available.lock().unwrap();
		while *available == 0 {
			available = self.released.wait(available).unwrap();
		}
		*available -= 1;
		LockCountGuard { count: self }
	}
}

struct LockCountGuard<'a> {
	count: &'a LockCount,
}

impl Drop for LockCountGuard<'_> {
	fn drop(&mut self) {
		*self.count.available.lock().unwrap() += 1;
		self.count.released.notify_one();
	}
}

/// The function table entry a lazy thunk invokes when forced. Kept generic
/// over a closure so [`force`] does not need to know about
/// [`crate::interp`]'s frame machinery directly.
pub type Invoke<'a> = dyn Fn(u32, &[Value]) -> Result<Value, ErrorCode> + 'a;

/// Resolves a `LazyValueRef` to its payload. Takes the thunk's mutex (rate
/// limited by `lock_count`); if unset, invokes the captured call; stores the
/// result; releases. Re-entering `force` on the same thunk from the same
/// thread is rejected with `Exception` rather than deadlocking, since the
/// mutex alone cannot distinguish "still computing" from "being recomputed
/// by the same call stack".
pub fn force(thunk: ObjectRef, lock_count: &LockCount, invoke: &Invoke<'_>, thread_id: u64) -> Result<Value, ErrorCode> {
	let ObjectPayload::LazyValue(state) = &thunk.get().payload else {
		return Err(ErrorCode::IncorrectObject);
	};

	if state.forcing_thread.load(Ordering::Acquire) == thread_id {
		return Err(ErrorCode::Exception);
	}

	let _permit = lock_count.acquire();
	state.forcing_thread.store(thread_id, Ordering::Release);
	let result = force_locked(state, invoke);
	state.forcing_thread.store(0, Ordering::Release);
	result
}

fn force_locked(state: &LazyValueState, invoke: &Invoke<'_>) -> Result<Value, ErrorCode> {
	let mut slot = state.mutex.lock().unwrap();
	if let Some(value) = slot.as_ref() {
		return Ok(value.clone());
	}
	let computed = invoke(state.fun_index, &state.args)?;
	*slot = Some(computed.clone());
	Ok(computed)
}

/// Deep "fully force": like [`force`], but if the resolved value is itself a
/// reference into a tuple containing further lazy references, recursively
/// forces those too. Used by native functions and control constructs that
/// must observe a fully evaluated structure (e.g. printing, equality).
pub fn fully_force(thunk: ObjectRef, lock_count: &LockCount, invoke: &Invoke<'_>, thread_id: u64) -> Result<Value, ErrorCode> {
	let forced = force(thunk, lock_count, invoke, thread_id)?;
	if let Some(object) = forced.as_object() {
		if let ObjectPayload::Tuple(elems) = &object.get().payload {
			for elem in elems.iter() {
				if let Some((payload, crate::object::TupleElementType::Ref)) = elem.read() {
					if payload != 0 {
						let ptr = payload as *mut crate::object::Object;
						if let Some(nn) = std::ptr::NonNull::new(ptr) {
							let nested = unsafe { ObjectRef::from_raw(nn) };
							if matches!(nested.get().kind, crate::object::ObjectKind::LazyValue) {
								fully_force(nested, lock_count, invoke, thread_id)?;
							}
						}
					}
				}
			}
		}
	}
	Ok(forced)
}
