//! The pluggable bridge to host-provided native functions. A
//! [`NativeFunctionHandler`] is how an embedder extends the VM with
//! functions the bytecode cannot express itself (I/O, FFI, anything a
//! native library offers); the interpreter's `INCALL`/`FNCALL`/`RNCALL`
//! opcodes dispatch to whichever handler's index range a call's `nfi`
//! (native-function index) falls into.
use std::sync::Arc;

use crate::error::ErrorCode;
use crate::fork::ForkHandler;
use crate::interp::Machine;
use crate::thread::ThreadContext;
use crate::value::Value;

/// One source of native functions, occupying a contiguous range of native
/// function indices `[min_index(), max_index()]`.
pub trait NativeFunctionHandler: Send + Sync {
	fn min_index(&self) -> i32;
	fn max_index(&self) -> i32;

	/// A human-readable name for `nfi`, or `None` if `nfi` is out of this
	/// handler's range or otherwise unnamed. Used for diagnostics, not
	/// dispatch.
	fn name(&self, nfi: i32) -> Option<String>;

	/// Invokes native function `nfi` with `args`, returning its result or an
	/// `ErrorCode` exactly as a failing opcode would. `ctx` is the calling
	/// thread's execution state and `vm` the shared machine, so a native can
	/// allocate through `vm.gc`, look at `vm.env`, or wrap a blocking call in
	/// `InterruptibleFunctionAround(ctx)`.
	fn invoke(&self, ctx: &ThreadContext, vm: &Machine, nfi: i32, args: &[Value]) -> Result<Value, ErrorCode>;

	/// A handler library that needs to coordinate with the process-wide
	/// [`crate::fork::ForkCoordinator`] (for instance, one guarding its own
	/// mutex around a blocking native call) returns it here together with
	/// its desired registration priority. The default is "no fork handler",
	/// which covers the common case of a stateless native library.
	fn fork_handler(&self) -> Option<(i32, Arc<dyn ForkHandler>)> {
		None
	}
}

/// Composes several handlers, each over its own contiguous index range, into
/// one. Ranges must not overlap; dispatch is a linear scan, which is fine for
/// the small number of handler libraries a program typically links.
#[derive(Default)]
pub struct MultiNativeFunctionHandler {
	handlers: Vec<Box<dyn NativeFunctionHandler>>,
}

impl MultiNativeFunctionHandler {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, handler: Box<dyn NativeFunctionHandler>) {
		self.handlers.push(handler);
	}

	fn handler_for(&self, nfi: i32) -> Option<&dyn NativeFunctionHandler> {
		self.handlers.iter().map(|h| h.as_ref()).find(|h| nfi >= h.min_index() && nfi <= h.max_index())
	}

	/// Every registered handler's fork handler, paired with its priority,
	/// ready to hand to a [`crate::fork::ForkCoordinator`].
	pub fn fork_handlers(&self) -> Vec<(i32, Arc<dyn ForkHandler>)> {
		self.handlers.iter().filter_map(|h| h.fork_handler()).collect()
	}
}

impl NativeFunctionHandler for MultiNativeFunctionHandler {
	fn min_index(&self) -> i32 {
		self.handlers.iter().map(|h| h.min_index()).min().unwrap_or(0)
	}

	fn max_index(&self) -> i32 {
		self.handlers.iter().map(|h| h.max_index()).max().unwrap_or(-1)
	}

	fn name(&self, nfi: i32) -> Option<String> {
		self.handler_for(nfi).and_then(|h| h.name(nfi))
	}

	fn invoke(&self, ctx: &ThreadContext, vm: &Machine, nfi: i32, args: &[Value]) -> Result<Value, ErrorCode> {
		match self.handler_for(nfi) {
			Some(handler) => handler.invoke(ctx, vm, nfi, args),
			None => {
				#[cfg(feature = "tracing")]
				tracing::warn!(nfi, "native call dispatched to unregistered index");
				Err(ErrorCode::NoNativeFun)
			}
		}
	}
}

/// A handler with an empty index range (`max_index() < min_index()`), so
/// every `invoke` fails with `NoNativeFun`. Used where a program needs a
/// native bridge wired up but never actually calls one, such as these tests.
pub struct NoNativeFunctions;

impl NativeFunctionHandler for NoNativeFunctions {
	fn min_index(&self) -> i32 {
		0
	}

	fn max_index(&self) -> i32 {
		-1
	}

	fn name(&self, _nfi: i32) -> Option<String> {
		None
	}

	fn invoke(&self, _ctx: &ThreadContext, _vm: &Machine, _nfi: i32, _args: &[Value]) -> Result<Value, ErrorCode> {
		Err(ErrorCode::NoNativeFun)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct OffsetHandler {
		min: i32,
		max: i32,
	}

	impl NativeFunctionHandler for OffsetHandler {
		fn min_index(&self) -> i32 {
			self.min
		}
		fn max_index(&self) -> i32 {
			self.max
		}
		fn name(&self, nfi: i32) -> Option<String> {
			Some(format!("fn{nfi}"))
		}
		fn invoke(&self, _ctx: &ThreadContext, _vm: &Machine, nfi: i32, _args: &[Value]) -> Result<Value, ErrorCode> {
			Ok(Value::int((nfi - self.min) as i64))
		}
	}

	#[test]
	fn no_native_functions_rejects_every_index() {
		let handler = NoNativeFunctions;
		assert_eq!(handler.max_index(), -1);
		assert!(handler.name(0).is_none());
	}

	#[test]
	fn multi_handler_composes_contiguous_ranges() {
		let mut multi = MultiNativeFunctionHandler::new();
		multi.register(Box::new(OffsetHandler { min: 0, max: 9 }));
		multi.register(Box::new(OffsetHandler { min: 10, max: 19 }));

		assert_eq!(multi.min_index(), 0);
		assert_eq!(multi.max_index(), 19);
		assert_eq!(multi.name(15), Some("fn15".to_string()));
		assert!(multi.name(20).is_none());
	}
}
