//! Per-thread execution state: the register bundle an interpreter loop
//! drives, the value/expression stacks the GC scans up to `sec`/`esec`, the
//! registered-reference scan list, and the cooperative safepoint protocol a
//! mutator publishes through so the collector can ask it to park without a
//! signal-based stop.
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use crate::gc::TracingGc;
use crate::object::ObjectRef;
use crate::value::Value;

/// The register bundle a running interpreter loop reads and writes every
/// instruction. Field names follow the source system's register bundle
/// one-for-one so the frame-management code in [`crate::interp`] reads the
/// same as the design it generalizes.
pub struct Registers {
	pub abp: u32,
	pub ac: u32,
	pub lvc: u32,
	pub abp2: u32,
	pub ac2: u32,
	pub sec: u32,
	pub ebp: u32,
	pub ec: u32,
	pub esec: u32,
	pub nfbp: u32,
	pub enfbp: u32,
	/// Current function index, or `-1` once the thread has exited.
	pub fp: i64,
	pub ip: u32,
	pub rv: Value,
	/// Accumulator for a force's result payload before it is typed and
	/// pushed back onto the stack.
	pub ai: u64,
	pub tmp_r: Option<ObjectRef>,
	pub tmp_ptr: Option<ObjectRef>,
	pub tmp_ac2: u32,
	pub try_flag: bool,
	pub try_abp: u32,
	pub try_ac: u32,
	pub try_arg2: Value,
	pub try_io_r: Option<ObjectRef>,
}

impl Default for Registers {
	fn default() -> Self {
		Self {
			abp: 0,
			ac: 0,
			lvc: 0,
			abp2: 0,
			ac2: 0,
			sec: 0,
			ebp: 0,
			ec: 0,
			esec: 0,
			nfbp: 0,
			enfbp: 0,
			fp: -1,
			ip: 0,
			rv: Value::error(),
			ai: 0,
			tmp_r: None,
			tmp_ptr: None,
			tmp_ac2: 0,
			try_flag: false,
			try_abp: 0,
			try_ac: 0,
			try_arg2: Value::error(),
			try_io_r: None,
		}
	}
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// One thread's execution state: its own stacks, its own register bundle,
/// and the bookkeeping the GC needs to trace and to safepoint it. Shared
/// only with the GC thread, never with another mutator thread.
pub struct ThreadContext {
	pub id: u64,
	gc: std::sync::Arc<TracingGc>,
	/// Mutated only by the thread that owns this context; read by the GC
	/// thread only while `parked` is true (i.e. after this thread has
	/// published that it is stopped), which makes the cross-thread read
	/// safe despite `Vec` normally requiring exclusive access.
	stack: UnsafeCell<Vec<Value>>,
	expr_stack: UnsafeCell<Vec<Value>>,
	regs: UnsafeCell<Registers>,
	registered: Mutex<Vec<Option<ObjectRef>>>,
	parked: Mutex<bool>,
	interruptible: AtomicBool,
}

unsafe impl Sync for ThreadContext {}

impl ThreadContext {
	pub fn new(gc: std::sync::Arc<TracingGc>, stack_size: usize, expr_stack_size: usize) -> std::sync::Arc<Self> {
		let ctx = std::sync::Arc::new(Self {
			id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
			gc: gc.clone(),
			stack: UnsafeCell::new(vec![Value::error(); stack_size]),
			expr_stack: UnsafeCell::new(vec![Value::error(); expr_stack_size]),
			regs: UnsafeCell::new(Registers::default()),
			registered: Mutex::new(Vec::new()),
			parked: Mutex::new(false),
			interruptible: AtomicBool::new(false),
		});
		gc.register_thread(&ctx);
		ctx
	}

	/// # Safety
	/// Must only be called by the thread that owns this context, or by the
	/// GC thread while this context is parked at a safepoint.
	#[allow(clippy::mut_from_ref)]
	pub unsafe fn regs_mut(&self) -> &mut Registers {
		&mut *self.regs.get()
	}

	pub fn regs(&self) -> &Registers {
		unsafe { &*self.regs.get() }
	}

	pub fn stack_len(&self) -> usize {
		unsafe { (*self.stack.get()).len() }
	}

	pub fn expr_stack_len(&self) -> usize {
		unsafe { (*self.expr_stack.get()).len() }
	}

	pub fn stack_elem(&self, i: usize) -> Value {
		unsafe { (*self.stack.get())[i].clone() }
	}

	/// Writes a stack slot and publishes it with a release fence, so that a
	/// collector which has just acquire-loaded `sec` observes a
	/// fully-initialized value rather than a torn write.
	pub fn set_stack_elem(&self, i: usize, value: Value) {
		unsafe {
			(*self.stack.get())[i] = value;
		}
		std::sync::atomic::fence(Ordering::Release);
	}

	pub fn expr_stack_elem(&self, i: usize) -> Value {
		unsafe { (*self.expr_stack.get())[i].clone() }
	}

	pub fn set_expr_stack_elem(&self, i: usize, value: Value) {
		unsafe {
			(*self.expr_stack.get())[i] = value;
		}
		std::sync::atomic::fence(Ordering::Release);
	}

	/// Base index of the current frame's local-variable region. Unlike the
	/// source system's register bundle, no reserved cells separate it from
	/// the argument region: call frames are native Rust call frames now (see
	/// `crate::interp`), so nothing needs to be saved on the value stack to
	/// resume a caller after a callee returns.
	pub fn lvbp(&self) -> u32 {
		self.regs().abp + self.regs().ac
	}

	pub fn arg(&self, i: u32) -> Value {
		self.stack_elem((self.regs().abp + i) as usize)
	}

	pub fn local_var(&self, i: u32) -> Value {
		self.stack_elem((self.lvbp() + i) as usize)
	}

	/// Pushes a freshly computed `LET` result as a new local variable,
	/// clearing the pending-argument region the way `letin`'s
	/// `push_local_var` does: a local variable and a zero-length pending
	/// call are the same stack shape until the next `ARG`.
	pub fn push_local_var(&self, value: Value) -> bool {
		let abp2 = unsafe { self.regs_mut() }.abp2 as usize;
		if abp2 >= self.stack_len() {
			return false;
		}
		self.set_stack_elem(abp2, value);
		let regs = unsafe { self.regs_mut() };
		regs.abp2 += 1;
		regs.ac2 = 0;
		regs.sec = regs.abp2;
		true
	}

	pub fn push_arg(&self, value: Value) -> bool {
		let regs = self.regs();
		let slot = (regs.abp2 + regs.ac2) as usize;
		if slot >= self.stack_len() {
			return false;
		}
		self.set_stack_elem(slot, value);
		let regs = unsafe { self.regs_mut() };
		regs.ac2 += 1;
		regs.sec += 1;
		true
	}

	pub fn pop_args(&self) {
		let regs = unsafe { self.regs_mut() };
		regs.ac2 = 0;
		regs.sec = regs.abp2;
	}

	pub fn pushed_arg(&self, i: u32) -> Value {
		self.stack_elem((self.regs().abp2 + i) as usize)
	}

	/// Hides the pending-argument region (`abp2`/`ac2`) across a nested
	/// call's own argument-building, so that e.g. `ARG ICALL ...` evaluating
	/// its own nested `ARG`s does not clobber the outer call's in-progress
	/// arguments. Paired with [`Self::restore_hidden_args`].
	pub fn hide_args(&self) {
		let regs = unsafe { self.regs_mut() };
		regs.tmp_ac2 = regs.ac2;
		regs.abp2 += regs.tmp_ac2;
		regs.ac2 = 0;
	}

	pub fn restore_hidden_args(&self) {
		let regs = unsafe { self.regs_mut() };
		regs.abp2 -= regs.tmp_ac2;
		regs.ac2 = regs.tmp_ac2;
		regs.sec = regs.abp2 + regs.ac2;
	}

	pub fn is_interruptible(&self) -> bool {
		self.interruptible.load(Ordering::Acquire)
	}

	fn set_interruptible(&self, value: bool) {
		self.interruptible.store(value, Ordering::Release);
	}

	/// Called at every instruction-fetch boundary. If the collector has
	/// requested a stop and this thread is not inside an interruptible
	/// native call, parks here until the collector resumes it.
	pub fn poll_safepoint(&self) {
		if !self.gc.stop_requested() || self.is_interruptible() {
			return;
		}
		*self.parked.lock().unwrap() = true;
		self.gc.notify_parked();
		while self.gc.stop_requested() {
			std::thread::yield_now();
		}
		*self.parked.lock().unwrap() = false;
	}

	/// Blocks the calling (GC) thread until this context reports itself
	/// parked, unless it is interruptible — an interruptible thread's root
	/// set is instead frozen at the moment it entered the interruptible
	/// scope, per the native-call bridge's contract.
	pub fn wait_for_safepoint(&self, notify: &Condvar) {
		if self.is_interruptible() {
			return;
		}
		let mut parked = self.parked.lock().unwrap();
		while !*parked {
			parked = notify.wait(parked).unwrap();
		}
	}

	/// Every object this context's root set keeps alive: stack slots up to
	/// `sec`, expression-stack slots up to `esec`, every still-registered
	/// reference, and the handful of dedicated registers that can hold a
	/// reference across an allocation.
	pub fn root_set(&self) -> Vec<ObjectRef> {
		let mut roots = Vec::new();
		let regs = self.regs();
		for i in 0..regs.sec as usize {
			if let Some(obj) = self.stack_elem(i).as_object() {
				roots.push(*obj);
			}
		}
		for i in 0..regs.esec as usize {
			if let Some(obj) = self.expr_stack_elem(i).as_object() {
				roots.push(*obj);
			}
		}
		for slot in self.registered.lock().unwrap().iter().flatten() {
			roots.push(*slot);
		}
		if let Some(obj) = regs.rv.as_object() {
			roots.push(*obj);
		}
		if let Some(obj) = regs.tmp_r {
			roots.push(obj);
		}
		if let Some(obj) = regs.tmp_ptr {
			roots.push(obj);
		}
		if let Some(obj) = regs.try_arg2.as_object() {
			roots.push(*obj);
		}
		if let Some(obj) = regs.try_io_r {
			roots.push(obj);
		}
		roots
	}
}

/// A scoped smart-handle: while alive, the `ObjectRef` it wraps is part of
/// its owning context's root set, letting native code keep an intermediate
/// allocation alive across further allocations without a local stack slot.
pub struct RegisteredReference<'ctx> {
	context: &'ctx ThreadContext,
	slot: usize,
	object: ObjectRef,
}

impl<'ctx> RegisteredReference<'ctx> {
	pub fn new(context: &'ctx ThreadContext, object: ObjectRef) -> Self {
		let mut list = context.registered.lock().unwrap();
		let slot = list.iter().position(|s| s.is_none()).unwrap_or(list.len());
		if slot == list.len() {
			list.push(Some(object));
		} else {
			list[slot] = Some(object);
		}
		drop(list);
		Self { context, slot, object }
	}

	pub fn get(&self) -> ObjectRef {
		self.object
	}
}

impl Drop for RegisteredReference<'_> {
	fn drop(&mut self) {
		self.context.registered.lock().unwrap()[self.slot] = None;
	}
}

/// Marks the thread interruptible for the duration of the scope: a long
/// running native call (a blocking syscall, in the native library this
/// crate does not implement) wraps itself in this so the GC does not try to
/// stop the thread at a safepoint it cannot reach. The contract is the
/// caller's: no GC-visible state may be mutated while the scope is open.
pub struct InterruptibleFunctionAround<'ctx> {
	context: &'ctx ThreadContext,
}

impl<'ctx> InterruptibleFunctionAround<'ctx> {
	pub fn new(context: &'ctx ThreadContext) -> Self {
		context.set_interruptible(true);
		Self { context }
	}
}

impl Drop for InterruptibleFunctionAround<'_> {
	fn drop(&mut self) {
		self.context.set_interruptible(false);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gc::TracingGc;

	#[test]
	fn registered_reference_adds_and_removes_from_scan_list() {
		let gc = std::sync::Arc::new(TracingGc::new());
		let ctx = ThreadContext::new(gc.clone(), 16, 16);
		let obj = gc.new_object(crate::object::ObjectKind::IArray8, crate::object::ObjectPayload::IArray8(Box::new([1])), false);
		assert!(ctx.root_set().is_empty());
		{
			let _r = RegisteredReference::new(&ctx, obj);
			assert_eq!(ctx.root_set().len(), 1);
		}
		assert!(ctx.root_set().is_empty());
	}

	#[test]
	fn interruptible_scope_clears_on_drop() {
		let gc = std::sync::Arc::new(TracingGc::new());
		let ctx = ThreadContext::new(gc, 16, 16);
		assert!(!ctx.is_interruptible());
		{
			let _scope = InterruptibleFunctionAround::new(&ctx);
			assert!(ctx.is_interruptible());
		}
		assert!(!ctx.is_interruptible());
	}

	#[test]
	fn root_set_tracks_sec_cursor() {
		let gc = std::sync::Arc::new(TracingGc::new());
		let ctx = ThreadContext::new(gc.clone(), 16, 16);
		let obj = gc.new_object(crate::object::ObjectKind::IArray8, crate::object::ObjectPayload::IArray8(Box::new([1])), false);
		ctx.set_stack_elem(0, Value::reference(obj));
		assert!(ctx.root_set().is_empty(), "sec has not advanced past the write yet");
		unsafe { ctx.regs_mut() }.sec = 1;
		assert_eq!(ctx.root_set().len(), 1);
	}
}
