//! Shared fixture helpers for the integration suite: building instructions
//! and linked functions by hand, the way the in-crate unit tests do, without
//! going through a byte-level image on disk.
use ulvm::error::ErrorCode;
use ulvm::format::{ArgKind, RawArgument, RawInstruction};
use ulvm::gc::TracingGc;
use ulvm::interp::{DefaultEvaluationStrategy, EvaluationStrategy, Machine, Strategy};
use ulvm::linker::{Environment, LinkedFunction};
use ulvm::native::NativeFunctionHandler;
use ulvm::opcode::{encode_opcode, Op};
use ulvm::thread::ThreadContext;
use ulvm::value::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub fn instr(op: Op, k1: ArgKind, a1: i32, k2: ArgKind, a2: i32) -> RawInstruction {
	RawInstruction { opcode: encode_opcode(op, k1, k2), arg1: RawArgument { bits: a1 as u32 }, arg2: RawArgument { bits: a2 as u32 } }
}

pub fn machine(funs: Vec<LinkedFunction>, default: Strategy, native: Box<dyn NativeFunctionHandler>) -> Machine {
	let gc = Arc::new(TracingGc::new());
	let env = Environment { funs, globals: Vec::new(), entry_fun: 0, fun_eval_overrides: HashMap::new() };
	Machine::new(gc, env, native, Box::new(DefaultEvaluationStrategy { default }))
}

/// A [`Strategy`] override table keyed by function index, for programs that
/// need more than one calling convention in play at once (e.g. an eager
/// `main` calling a memoized `fib`).
pub struct PerFunctionStrategy {
	pub default: Strategy,
	pub overrides: HashMap<u32, Strategy>,
}

impl EvaluationStrategy for PerFunctionStrategy {
	fn strategy_for(&self, fun_index: u32, _overrides: &HashMap<u32, (u32, u32)>) -> Strategy {
		self.overrides.get(&fun_index).copied().unwrap_or(self.default)
	}
}

pub fn machine_with_strategy(funs: Vec<LinkedFunction>, strategy: impl EvaluationStrategy + 'static, native: Box<dyn NativeFunctionHandler>) -> Machine {
	let gc = Arc::new(TracingGc::new());
	let env = Environment { funs, globals: Vec::new(), entry_fun: 0, fun_eval_overrides: HashMap::new() };
	Machine::new(gc, env, native, Box::new(strategy))
}

/// A single-slot native function (index 0) that counts how many times it is
/// actually invoked and echoes its argument straight back, coerced by
/// whichever call site (`INCALL`/`FNCALL`/`RNCALL`) dispatched it. Used to
/// observe how many times a memoized function's body actually runs, as
/// opposed to being served from the cache.
pub struct CountingNative {
	pub count: Arc<AtomicUsize>,
}

impl NativeFunctionHandler for CountingNative {
	fn min_index(&self) -> i32 {
		0
	}

	fn max_index(&self) -> i32 {
		0
	}

	fn name(&self, _nfi: i32) -> Option<String> {
		Some("tally".to_string())
	}

	fn invoke(&self, _ctx: &ThreadContext, _vm: &Machine, _nfi: i32, args: &[Value]) -> Result<Value, ErrorCode> {
		self.count.fetch_add(1, Ordering::SeqCst);
		args.first().cloned().ok_or(ErrorCode::IncorrectArgCount)
	}
}
