//! Stop-the-world mark-sweep collection over the heap of [`Object`]s. The
//! collector never runs concurrently with mutators: it asks every
//! [`ThreadContext`](crate::thread::ThreadContext) to reach a safepoint,
//! traces from the root set (globals, per-thread stacks up to `sec`,
//! registered references, the memoization cache), sweeps anything unmarked,
//! and resumes every thread. Unlike a signal-based stop-the-world, threads
//! here publish their own "I am at a safepoint" state cooperatively at each
//! instruction-fetch boundary; see `ThreadContext::poll_safepoint`.
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use bumpalo::Bump;

use crate::object::{Object, ObjectKind, ObjectPayload, ObjectRef, TupleElement};

/// Allocates heap objects and immortal (never-freed) objects. Implemented by
/// [`TracingGc`]; split out as a trait so the linker and interpreter depend
/// only on the allocation surface, not on collection internals.
pub trait Allocator {
	fn new_object(&self, kind: ObjectKind, payload: ObjectPayload, unique: bool) -> ObjectRef;

	/// Allocates an object that the collector will never trace for
	/// reachability and never free. Used for the data section's global
	/// object graph, which is reachable for the lifetime of the process
	/// regardless of whether any root still points to it.
	fn new_immortal_object(&self, kind: ObjectKind, payload: ObjectPayload, unique: bool) -> ObjectRef;
}

struct Allocation {
	ptr: NonNull<Object>,
	marked: AtomicBool,
	immortal: bool,
}

unsafe impl Send for Allocation {}

/// The registry of all live allocations plus the bump arena backing
/// immortal objects. Mutable heap objects are individually boxed and
/// tracked in `allocations`; immortal ones are carved out of `immortal_arena`
/// and never appear in the sweep pass.
pub struct TracingGc {
	allocations: Mutex<Vec<Allocation>>,
	immortal_arena: Mutex<Bump>,
	threads: Mutex<Vec<std::sync::Weak<crate::thread::ThreadContext>>>,
	gc_mutex: Mutex<()>,
	stop_requested: AtomicBool,
	threads_stopped: Condvar,
	live_bytes: AtomicUsize,
	/// Set for the duration of a fork cycle (see [`crate::fork`]); `collect`
	/// bails out early rather than racing a fork in progress.
	fork_in_progress: AtomicBool,
}

impl Default for TracingGc {
	fn default() -> Self {
		Self {
			allocations: Mutex::new(Vec::new()),
			immortal_arena: Mutex::new(Bump::new()),
			threads: Mutex::new(Vec::new()),
			gc_mutex: Mutex::new(()),
			stop_requested: AtomicBool::new(false),
			threads_stopped: Condvar::new(),
			live_bytes: AtomicUsize::new(0),
			fork_in_progress: AtomicBool::new(false),
		}
	}
}

impl TracingGc {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_thread(&self, ctx: &std::sync::Arc<crate::thread::ThreadContext>) {
		self.threads.lock().unwrap().push(std::sync::Arc::downgrade(ctx));
	}

	/// Returns `true` while the collector wants every mutator thread
	/// stopped at a safepoint. `ThreadContext::poll_safepoint` checks this
	/// on every instruction-fetch boundary.
	pub fn stop_requested(&self) -> bool {
		self.stop_requested.load(Ordering::Acquire)
	}

	/// Called by a mutator thread's [`crate::thread::ThreadContext::poll_safepoint`]
	/// once it has published itself parked, so the collector's blocking wait
	/// in [`Self::collect`] wakes promptly instead of polling.
	pub fn notify_parked(&self) {
		self.threads_stopped.notify_all();
	}

	/// Runs one full collection cycle: request a stop, wait for every
	/// non-interruptible thread to publish that it is parked, mark from
	/// roots, sweep, then release.
	#[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
	pub fn collect(&self) {
		if self.fork_in_progress.load(Ordering::Acquire) {
			return;
		}
		let _gc_guard = self.gc_mutex.lock().unwrap();
		self.stop_requested.store(true, Ordering::Release);

		let threads = self.threads.lock().unwrap();
		for weak in threads.iter() {
			if let Some(ctx) = weak.upgrade() {
				// An interruptible thread cannot reach a safepoint until its
				// blocking native call returns; its root set is instead
				// treated as frozen at the moment it entered that scope.
				if !ctx.is_interruptible() {
					ctx.wait_for_safepoint(&self.threads_stopped);
				}
			}
		}

		for weak in threads.iter() {
			if let Some(ctx) = weak.upgrade() {
				self.mark_from(&ctx);
			}
		}
		drop(threads);

		self.sweep();
		self.stop_requested.store(false, Ordering::Release);
	}

	fn mark_from(&self, ctx: &crate::thread::ThreadContext) {
		for root in ctx.root_set() {
			self.mark_object(root);
		}
	}

	fn mark_object(&self, root: ObjectRef) {
		let allocations = self.allocations.lock().unwrap();
		let mut stack = vec![root];
		while let Some(obj_ref) = stack.pop() {
			let Some(alloc) = allocations.iter().find(|a| a.ptr == obj_ref.0) else { continue };
			if alloc.marked.swap(true, Ordering::AcqRel) {
				continue;
			}
			let obj = unsafe { alloc.ptr.as_ref() };
			push_children(obj, &mut stack);
		}
	}

	fn sweep(&self) {
		let mut allocations = self.allocations.lock().unwrap();
		let mut freed = 0usize;
		allocations.retain(|alloc| {
			if alloc.immortal {
				return true;
			}
			let keep = alloc.marked.swap(false, Ordering::AcqRel);
			if !keep {
				freed += 1;
				unsafe {
					drop(Box::from_raw(alloc.ptr.as_ptr()));
				}
			}
			keep
		});
		self.live_bytes.fetch_sub(freed * std::mem::size_of::<Object>(), Ordering::Relaxed);
	}

	/// Called by the GC's [`crate::fork::ForkHandler`] before a fork:
	/// blocks until any in-progress collection drains, then gates `collect`
	/// out until [`Self::release_after_fork`] is called. Modeling "seize the
	/// GC mutex across the fork" as take-then-gate rather than holding the
	/// guard lets this run against an in-process simulated fork with no
	/// unsafe lifetime games over the mutex guard.
	pub fn seize_for_fork(&self) {
		let _guard = self.gc_mutex.lock().unwrap();
		self.fork_in_progress.store(true, Ordering::Release);
	}

	/// Parent-side post-fork: lift the gate installed by `seize_for_fork`.
	pub fn release_after_fork(&self) {
		self.fork_in_progress.store(false, Ordering::Release);
	}

	/// Child-side post-fork: every other thread's OS thread did not survive
	/// the (simulated) fork, so their registrations are stale and are
	/// dropped; the forking thread re-registers itself once it constructs a
	/// fresh `ThreadContext`.
	pub fn reset_after_fork(&self) {
		self.threads.lock().unwrap().clear();
		self.stop_requested.store(false, Ordering::Release);
		self.fork_in_progress.store(false, Ordering::Release);
	}
}

fn push_children(obj: &Object, stack: &mut Vec<ObjectRef>) {
	match &obj.payload {
		ObjectPayload::RArray(refs) => {
			for slot in refs.iter() {
				if let Some(r) = slot.get() {
					stack.push(r);
				}
			}
		}
		ObjectPayload::Tuple(elems) => {
			for elem in elems.iter() {
				if let Some((payload, crate::object::TupleElementType::Ref)) = elem_read(elem) {
					if let Some(ptr) = NonNull::new(payload as *mut Object) {
						stack.push(unsafe { ObjectRef::from_raw(ptr) });
					}
				}
			}
		}
		ObjectPayload::LazyValue(state) => {
			if let Some(value) = state.mutex.lock().unwrap().as_ref() {
				if let Some(object) = value.as_object() {
					stack.push(*object);
				}
			}
		}
		_ => {}
	}
}

fn elem_read(elem: &TupleElement) -> Option<(u64, crate::object::TupleElementType)> {
	elem.read()
}

impl Allocator for TracingGc {
	fn new_object(&self, kind: ObjectKind, payload: ObjectPayload, unique: bool) -> ObjectRef {
		let boxed = Box::new(Object { kind, unique, payload });
		let ptr = NonNull::from(Box::leak(boxed));
		self.live_bytes.fetch_add(std::mem::size_of::<Object>(), Ordering::Relaxed);
		self.allocations.lock().unwrap().push(Allocation { ptr, marked: AtomicBool::new(false), immortal: false });
		unsafe { ObjectRef::from_raw(ptr) }
	}

	fn new_immortal_object(&self, kind: ObjectKind, payload: ObjectPayload, unique: bool) -> ObjectRef {
		let arena = self.immortal_arena.lock().unwrap();
		let obj_ref: &mut Object = arena.alloc(Object { kind, unique, payload });
		let ptr = NonNull::from(obj_ref);
		drop(arena);
		self.allocations.lock().unwrap().push(Allocation { ptr, marked: AtomicBool::new(true), immortal: true });
		unsafe { ObjectRef::from_raw(ptr) }
	}
}

/// Runs the collector on its own OS thread, waking on `interval` and calling
/// [`TracingGc::collect`]. Stopped by dropping the returned handle's sender
/// half, which is simulated here with an atomic flag rather than a channel
/// since the collector only ever needs a single best-effort stop request.
pub struct GcThread {
	stop: std::sync::Arc<AtomicBool>,
	handle: Option<std::thread::JoinHandle<()>>,
}

impl GcThread {
	pub fn spawn(gc: std::sync::Arc<TracingGc>, interval: std::time::Duration) -> Self {
		let stop = std::sync::Arc::new(AtomicBool::new(false));
		let stop_clone = stop.clone();
		let handle = std::thread::Builder::new()
			.name("ulvm-gc".into())
			.spawn(move || {
				while !stop_clone.load(Ordering::Acquire) {
					std::thread::sleep(interval);
					if stop_clone.load(Ordering::Acquire) {
						break;
					}
					gc.collect();
				}
			})
			.expect("failed to spawn GC thread");
		Self { stop, handle: Some(handle) }
	}

	pub fn stop(mut self) {
		self.stop.store(true, Ordering::Release);
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn allocates_and_sweeps_unreachable_objects() {
		let gc = TracingGc::new();
		let _kept = gc.new_object(ObjectKind::IArray8, ObjectPayload::IArray8(Box::new([1])), false);
		let _unreached = gc.new_object(ObjectKind::IArray8, ObjectPayload::IArray8(Box::new([2])), false);
		assert_eq!(gc.allocations.lock().unwrap().len(), 2);
		// Nothing is rooted through a ThreadContext here; directly exercise sweep.
		gc.sweep();
		assert_eq!(gc.allocations.lock().unwrap().len(), 0);
	}

	#[test]
	fn immortal_objects_survive_sweep() {
		let gc = TracingGc::new();
		let _immortal = gc.new_immortal_object(ObjectKind::IArray8, ObjectPayload::IArray8(Box::new([1])), false);
		gc.sweep();
		assert_eq!(gc.allocations.lock().unwrap().len(), 1);
	}
}
