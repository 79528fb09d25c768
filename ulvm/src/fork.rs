//! Process-wide fork coordination. Forking is intrinsically global state:
//! every subsystem that owns a lock or a background thread (the GC first
//! among them) needs a chance to quiesce before the fork and to either
//! release (parent) or reset (child) afterward. A [`ForkCoordinator`] is the
//! registry those subsystems and any native library plug into, ordered by
//! integer priority exactly as a handler library would register with the
//! portable fork-handler mechanism this crate generalizes.
//!
//! This crate does not assume a Unix host and never calls `fork(2)` itself;
//! the coordinator is instead exercised against an in-process *simulated*
//! fork, which is enough to pin down hook ordering and child-side reset
//! behavior without taking a platform dependency. A real embedder calls
//! `pre_fork`/`post_fork_parent`/`post_fork_child` around its own `fork(2)`.
use std::sync::Arc;
use std::sync::Mutex;

use crate::gc::TracingGc;

/// One participant in a fork cycle. `pre_fork` runs, in priority order,
/// before the fork; `post_fork_parent` or `post_fork_child` runs afterward
/// depending on which side of the fork the calling process is on.
pub trait ForkHandler: Send + Sync {
	fn pre_fork(&self);
	fn post_fork_parent(&self);
	fn post_fork_child(&self);
}

/// The GC's own handler always registers at this priority, ahead of any
/// native library's handlers registered at a higher number, so the GC mutex
/// is seized before any native mutex and released only after every other
/// handler has run its own post-fork step.
pub const GC_FORK_PRIORITY: i32 = 0;

/// Seizes the GC mutex before a fork and either releases it (parent) or
/// resets the collector to a fresh state (child), per §5's fork semantics.
pub struct GcForkHandler {
	gc: Arc<TracingGc>,
}

impl GcForkHandler {
	pub fn new(gc: Arc<TracingGc>) -> Self {
		Self { gc }
	}
}

impl ForkHandler for GcForkHandler {
	fn pre_fork(&self) {
		self.gc.seize_for_fork();
	}

	fn post_fork_parent(&self) {
		self.gc.release_after_fork();
	}

	fn post_fork_child(&self) {
		self.gc.reset_after_fork();
	}
}

struct Registration {
	priority: i32,
	handler: Arc<dyn ForkHandler>,
}

/// The registry of all [`ForkHandler`]s, invoked in ascending-priority order
/// around a fork. Construction installs only what the caller registers;
/// callers that want GC quiescence register a [`GcForkHandler`] themselves
/// (typically at [`GC_FORK_PRIORITY`]) rather than this type assuming one.
#[derive(Default)]
pub struct ForkCoordinator {
	handlers: Mutex<Vec<Registration>>,
}

impl ForkCoordinator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `handler` at `priority`. Lower priorities run first on the
	/// pre-fork side; the same order is used for both post-fork sides, so a
	/// handler that must seize a resource before a later-priority handler's
	/// pre-fork step also releases or resets it before that handler does.
	pub fn register(&self, priority: i32, handler: Arc<dyn ForkHandler>) {
		let mut handlers = self.handlers.lock().unwrap();
		handlers.push(Registration { priority, handler });
		handlers.sort_by_key(|r| r.priority);
	}

	pub fn pre_fork(&self) {
		for registration in self.handlers.lock().unwrap().iter() {
			registration.handler.pre_fork();
		}
	}

	pub fn post_fork_parent(&self) {
		for registration in self.handlers.lock().unwrap().iter() {
			registration.handler.post_fork_parent();
		}
	}

	pub fn post_fork_child(&self) {
		for registration in self.handlers.lock().unwrap().iter() {
			registration.handler.post_fork_child();
		}
	}

	/// Runs one full fork cycle against an in-process simulated fork: every
	/// handler's `pre_fork` runs, then either every `post_fork_child` (if
	/// `in_child`) or every `post_fork_parent`. There is no real `fork(2)`
	/// call and no second process; this is the seam the crate's own tests
	/// exercise hook ordering and reset behavior through.
	pub fn simulate_fork(&self, in_child: bool) {
		self.pre_fork();
		if in_child {
			self.post_fork_child();
		} else {
			self.post_fork_parent();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex as StdMutex;

	struct RecordingHandler {
		name: &'static str,
		log: Arc<StdMutex<Vec<String>>>,
	}

	impl ForkHandler for RecordingHandler {
		fn pre_fork(&self) {
			self.log.lock().unwrap().push(format!("{}:pre", self.name));
		}
		fn post_fork_parent(&self) {
			self.log.lock().unwrap().push(format!("{}:parent", self.name));
		}
		fn post_fork_child(&self) {
			self.log.lock().unwrap().push(format!("{}:child", self.name));
		}
	}

	#[test]
	fn handlers_run_in_priority_order_regardless_of_registration_order() {
		let log = Arc::new(StdMutex::new(Vec::new()));
		let coordinator = ForkCoordinator::new();
		coordinator.register(10, Arc::new(RecordingHandler { name: "native", log: log.clone() }));
		coordinator.register(GC_FORK_PRIORITY, Arc::new(RecordingHandler { name: "gc", log: log.clone() }));

		coordinator.simulate_fork(false);

		assert_eq!(*log.lock().unwrap(), vec!["gc:pre", "native:pre", "gc:parent", "native:parent"]);
	}

	#[test]
	fn child_side_runs_post_fork_child_not_parent() {
		let log = Arc::new(StdMutex::new(Vec::new()));
		let coordinator = ForkCoordinator::new();
		coordinator.register(0, Arc::new(RecordingHandler { name: "gc", log: log.clone() }));

		coordinator.simulate_fork(true);

		assert_eq!(*log.lock().unwrap(), vec!["gc:pre", "gc:child"]);
	}

	#[test]
	fn gc_handler_gates_collection_across_the_fork_window() {
		let gc = Arc::new(TracingGc::new());
		let coordinator = ForkCoordinator::new();
		coordinator.register(GC_FORK_PRIORITY, Arc::new(GcForkHandler::new(gc.clone())));

		coordinator.pre_fork();
		// A collection requested mid-fork-window must be a no-op, not a deadlock.
		gc.collect();
		coordinator.post_fork_child();

		// Reset reopened the gate: a real collection now runs to completion.
		gc.collect();
	}
}
