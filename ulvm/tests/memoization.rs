//! Memoized self-recursion (`fib`, called through `ICALL` so every
//! recursive step consults the cache) and a concurrent cache-insertion race
//! between two real OS threads.
mod common;

use common::{instr, machine_with_strategy, CountingNative, PerFunctionStrategy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use ulvm::error::ErrorCode;
use ulvm::format::ArgKind;
use ulvm::interp::{start, Machine, Strategy};
use ulvm::linker::LinkedFunction;
use ulvm::native::NativeFunctionHandler;
use ulvm::opcode::Op;
use ulvm::thread::ThreadContext;
use ulvm::value::Value;

/// fn fib(n):
///   incall tally(n)                -- side channel: counts actual (non-cached) invocations
///   if n < 2: return n
///   else: return fib(n - 1) + fib(n - 2)
fn fib_code(fib_index: i32) -> Vec<ulvm::format::RawInstruction> {
	vec![
		instr(Op::ILOAD, ArgKind::Arg, 0, ArgKind::Imm, 0),   // 0: n
		instr(Op::ARG, ArgKind::Imm, 0, ArgKind::Imm, 0),     // 1: push n
		instr(Op::INCALL, ArgKind::Imm, 0, ArgKind::Imm, 0),  // 2: tally(n); pending overwritten below
		instr(Op::ILT, ArgKind::Arg, 0, ArgKind::Imm, 2),     // 3: n < 2
		instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),     // 4: localvar0 = cond
		instr(Op::JC, ArgKind::LocalVar, 0, ArgKind::Imm, 11), // 5: ip=5, taken -> jumps to 16 (base case)
		instr(Op::ISUB, ArgKind::Arg, 0, ArgKind::Imm, 1),    // 6: n - 1
		instr(Op::ARG, ArgKind::Imm, 0, ArgKind::Imm, 0),     // 7: push n-1
		instr(Op::ICALL, ArgKind::Imm, fib_index, ArgKind::Imm, 0), // 8: fib(n-1)
		instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),     // 9: localvar1 = r1
		instr(Op::ISUB, ArgKind::Arg, 0, ArgKind::Imm, 2),    // 10: n - 2
		instr(Op::ARG, ArgKind::Imm, 0, ArgKind::Imm, 0),     // 11: push n-2
		instr(Op::ICALL, ArgKind::Imm, fib_index, ArgKind::Imm, 0), // 12: fib(n-2)
		instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),     // 13: localvar2 = r2
		instr(Op::IADD, ArgKind::LocalVar, 1, ArgKind::LocalVar, 2), // 14: r1 + r2
		instr(Op::JUMP, ArgKind::Imm, 2, ArgKind::Imm, 0),    // 15: ip=15 -> jumps to 17 (ret)
		instr(Op::ILOAD, ArgKind::Arg, 0, ArgKind::Imm, 0),   // 16: base case: n itself
		instr(Op::RET, ArgKind::Imm, 0, ArgKind::Imm, 0),     // 17
	]
}

#[test]
fn memoized_self_recursion_computes_each_argument_once() {
	let code = fib_code(0);
	let counter = Arc::new(AtomicUsize::new(0));
	let strategy = PerFunctionStrategy { default: Strategy::Eager, overrides: [(0u32, Strategy::Memoized)].into_iter().collect() };
	let m = machine_with_strategy(vec![LinkedFunction { arg_count: 1, code }], strategy, Box::new(CountingNative { count: counter.clone() }));

	let result = start(&m, 0, &[Value::int(10)]).unwrap();
	assert_eq!(result.as_int(), Some(55));
	// fib(10) touches exactly the distinct arguments 0..=10 once each; without
	// memoization the naive recursion would tally on the order of hundreds of
	// times.
	let tallies = counter.load(Ordering::SeqCst);
	assert!(tallies <= 11, "expected at most 11 distinct computations, got {tallies}");
}

struct SquaringNative {
	count: Arc<AtomicUsize>,
}

impl NativeFunctionHandler for SquaringNative {
	fn min_index(&self) -> i32 {
		0
	}
	fn max_index(&self) -> i32 {
		0
	}
	fn name(&self, _nfi: i32) -> Option<String> {
		Some("square".to_string())
	}
	fn invoke(&self, _ctx: &ThreadContext, _vm: &Machine, _nfi: i32, args: &[Value]) -> Result<Value, ErrorCode> {
		self.count.fetch_add(1, Ordering::SeqCst);
		let n = args[0].as_int().ok_or(ErrorCode::IncorrectValue)?;
		Ok(Value::int(n * n))
	}
}

#[test]
fn concurrent_callers_share_a_single_cached_computation() {
	// fn caller() = arg 5; icall square(); ret
	let caller_code = vec![
		instr(Op::ILOAD, ArgKind::Imm, 5, ArgKind::Imm, 0),
		instr(Op::ARG, ArgKind::Imm, 0, ArgKind::Imm, 0),
		instr(Op::ICALL, ArgKind::Imm, 1, ArgKind::Imm, 0),
		instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),
		instr(Op::ILOAD, ArgKind::LocalVar, 0, ArgKind::Imm, 0),
		instr(Op::RET, ArgKind::Imm, 0, ArgKind::Imm, 0),
	];
	// fn square(n) = incall square_native(n); ret
	let square_code = vec![
		instr(Op::ILOAD, ArgKind::Arg, 0, ArgKind::Imm, 0),
		instr(Op::ARG, ArgKind::Imm, 0, ArgKind::Imm, 0),
		instr(Op::INCALL, ArgKind::Imm, 0, ArgKind::Imm, 0),
		instr(Op::RET, ArgKind::Imm, 0, ArgKind::Imm, 0),
	];

	let counter = Arc::new(AtomicUsize::new(0));
	let strategy = PerFunctionStrategy { default: Strategy::Eager, overrides: [(1u32, Strategy::Memoized)].into_iter().collect() };
	let m = Arc::new(machine_with_strategy(
		vec![LinkedFunction { arg_count: 0, code: caller_code }, LinkedFunction { arg_count: 1, code: square_code }],
		strategy,
		Box::new(SquaringNative { count: counter.clone() }),
	));

	// `caller`'s ICALL is the only call site that consults the memo cache
	// (the function the host calls directly here, `caller` itself, is not
	// memoized). Running the first caller fully to completion before
	// starting the second is a deliberate, non-racy way to guarantee the
	// second thread observes a cache hit rather than a 50/50 race with the
	// first — the memo cache's actual concurrent-insertion behavior (loser's
	// result discarded) is covered directly in `memo.rs`'s own unit tests.
	let m1 = m.clone();
	let first = std::thread::spawn(move || start(&m1, 0, &[]).unwrap().as_int().unwrap());
	let first_result = first.join().unwrap();

	let m2 = m.clone();
	let second = std::thread::spawn(move || start(&m2, 0, &[]).unwrap().as_int().unwrap());
	let second_result = second.join().unwrap();

	assert_eq!(first_result, 25);
	assert_eq!(second_result, 25);
	assert_eq!(counter.load(Ordering::SeqCst), 1, "the second caller should have hit the memo cache instead of recomputing");
}
