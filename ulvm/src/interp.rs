//! The instruction interpreter: fetch/decode/execute over a linked
//! [`Environment`], one [`ThreadContext`] per running thread. Calls
//! (`ICALL`/`FCALL`/`RCALL`/`RETRY`) recurse natively into
//! [`run_function`] rather than resuming a trampoline loop through a saved
//! "after-leaving" flag — the source system's register bundle needs that
//! flag only because its interpreter loop is a single non-recursive `while`;
//! here the Rust call stack already remembers where to resume, so a callee's
//! own instruction loop simply returns its `RET` value to the call site that
//! invoked it. See `DESIGN.md` for the full writeup of this simplification.
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::ErrorCode;
use crate::format::{self, ArgKind, RawArgument, RawInstruction};
use crate::gc::{Allocator, TracingGc};
use crate::lazy::{self, LockCount};
use crate::linker::Environment;
use crate::memo::MemoizationCache;
use crate::native::NativeFunctionHandler;
use crate::object::{LazyValueState, Object, ObjectKind, ObjectPayload, ObjectRef, TupleElement, TupleElementType};
use crate::opcode::{decode_opcode, Op};
use crate::thread::ThreadContext;
use crate::value::{Value, ValueTag};

/// Which of the four call-site policies a callee's invocation follows. See
/// the per-function evaluation strategy described for the interpreter: the
/// historical system hard-codes this per call site; here it is a trait so a
/// host can choose without touching the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
	Eager,
	Lazy,
	Memoized,
	MemoizedLazy,
}

fn decode_strategy(bits: u32) -> Option<Strategy> {
	match bits {
		format::eval_strategy::EAGER => Some(Strategy::Eager),
		format::eval_strategy::LAZY => Some(Strategy::Lazy),
		format::eval_strategy::MEMOIZED => Some(Strategy::Memoized),
		format::eval_strategy::MEMOIZED_LAZY => Some(Strategy::MemoizedLazy),
		_ => None,
	}
}

pub trait EvaluationStrategy: Send + Sync {
	fn strategy_for(&self, fun_index: u32, overrides: &HashMap<u32, (u32, u32)>) -> Strategy;
}

/// Applies `default` to every callee unless its `FunctionInfo` carries a
/// nonzero `eval_strategy_mask`, in which case the override wins outright.
pub struct DefaultEvaluationStrategy {
	pub default: Strategy,
}

impl EvaluationStrategy for DefaultEvaluationStrategy {
	fn strategy_for(&self, fun_index: u32, overrides: &HashMap<u32, (u32, u32)>) -> Strategy {
		match overrides.get(&fun_index) {
			Some((strategy, mask)) if *mask != 0 => decode_strategy(*strategy).unwrap_or(self.default),
			_ => self.default,
		}
	}
}

/// Everything one running program needs beyond a thread's own registers and
/// stacks: the linked code and globals, the memoization cache, the lazy-value
/// lock-count semaphore, the native-call bridge, and the call-site strategy.
pub struct Machine {
	pub gc: Arc<TracingGc>,
	pub env: Environment,
	pub memo: MemoizationCache,
	pub lock_count: LockCount,
	pub native: Box<dyn NativeFunctionHandler>,
	pub strategy: Box<dyn EvaluationStrategy>,
}

impl Machine {
	pub fn new(gc: Arc<TracingGc>, env: Environment, native: Box<dyn NativeFunctionHandler>, strategy: Box<dyn EvaluationStrategy>) -> Self {
		Self { gc, env, memo: MemoizationCache::new(64), lock_count: LockCount::new(64), native, strategy }
	}
}

/// Runs the program's entry function to completion on a fresh thread
/// context, on the calling OS thread, and returns its final value or fault.
/// Named after the scheduler glue's `start(fun_index, args, continuation)`;
/// the continuation here is simply the return value, since callers that want
/// a background thread spawn one themselves and call this from its body.
pub fn start(machine: &Machine, fun_index: u32, args: &[Value]) -> Result<Value, ErrorCode> {
	let ctx = ThreadContext::new(machine.gc.clone(), 32 * 1024, 16 * 1024);
	run_function(&ctx, machine, fun_index, args)
}

/// Enters a function's frame, runs its instruction loop to a `RET` or fault,
/// and restores the caller's registers. The three special stack cells the
/// source system threads through `enter_to_fun`/`leave_from_fun` are not
/// needed here: `saved_*` are ordinary Rust locals, restored when this frame
/// unwinds exactly as the caller's registers were before the call.
pub fn run_function(ctx: &ThreadContext, machine: &Machine, fun_index: u32, args: &[Value]) -> Result<Value, ErrorCode> {
	let fun = machine.env.funs.get(fun_index as usize).ok_or(ErrorCode::NoFun)?;
	if args.len() as u32 != fun.arg_count {
		return Err(ErrorCode::IncorrectArgCount);
	}

	let saved_abp = ctx.regs().abp;
	let saved_ac = ctx.regs().ac;
	let saved_lvc = ctx.regs().lvc;
	let saved_fp = ctx.regs().fp;
	let saved_ip = ctx.regs().ip;
	let frame_base = ctx.regs().abp2;

	if frame_base as usize + args.len() >= ctx.stack_len() {
		return Err(ErrorCode::StackOverflow);
	}
	for (i, arg) in args.iter().enumerate() {
		ctx.set_stack_elem(frame_base as usize + i, arg.clone());
	}
	{
		let regs = unsafe { ctx.regs_mut() };
		regs.abp = frame_base;
		regs.ac = args.len() as u32;
		regs.abp2 = frame_base + args.len() as u32;
		regs.lvc = 0;
		regs.ac2 = 0;
		regs.sec = regs.abp2;
		regs.fp = fun_index as i64;
		regs.ip = 0;
	}
	std::sync::atomic::fence(Ordering::Release);

	let result = run_instruction_loop(ctx, machine, fun_index);

	{
		let regs = unsafe { ctx.regs_mut() };
		regs.abp = saved_abp;
		regs.ac = saved_ac;
		regs.lvc = saved_lvc;
		regs.fp = saved_fp;
		regs.ip = saved_ip;
		regs.abp2 = frame_base;
		regs.ac2 = 0;
		regs.sec = frame_base;
	}
	std::sync::atomic::fence(Ordering::Release);

	result
}

/// The per-function fetch/decode/execute loop. Returns the value a `RET`
/// produced, or the fault that stopped execution. `pending` carries a
/// value-producing opcode's result forward to the control opcode
/// (`LET`/`ARG`/`RET`/`LETTUPLE`) that must immediately follow it in this
/// instruction set's convention — see the module doc comment on why this
/// crate splits what the source format packs into one opcode word into two
/// consecutive instructions instead.
fn run_instruction_loop(ctx: &ThreadContext, machine: &Machine, fun_index: u32) -> Result<Value, ErrorCode> {
	let mut pending: Option<Value> = None;
	loop {
		ctx.poll_safepoint();
		let code = &machine.env.funs[fun_index as usize].code;
		let ip = ctx.regs().ip;
		let instr = *code.get(ip as usize).ok_or(ErrorCode::NoInstr)?;
		unsafe { ctx.regs_mut() }.ip = ip + 1;
		let decoded = decode_opcode(instr.opcode).map_err(|_| ErrorCode::IncorrectInstr)?;

		match decoded.op {
			Op::LET => {
				let value = pending.take().ok_or(ErrorCode::IncorrectInstr)?;
				ctx.pop_args();
				if !ctx.push_local_var(value) {
					return Err(ErrorCode::StackOverflow);
				}
			}
			Op::IN => {
				let lvc = ctx.regs().abp2 - ctx.lvbp();
				unsafe { ctx.regs_mut() }.lvc = lvc;
			}
			Op::RET => {
				let value = pending.take().ok_or(ErrorCode::IncorrectInstr)?;
				return Ok(value);
			}
			Op::ARG => {
				let value = pending.take().ok_or(ErrorCode::IncorrectInstr)?;
				if !ctx.push_arg(value) {
					return Err(ErrorCode::StackOverflow);
				}
			}
			Op::JC => {
				let cond = fetch_int(ctx, &machine.env, decoded.arg1_kind, instr.arg1)?;
				if cond != 0 {
					let offset = instr.arg2.as_i32();
					unsafe { ctx.regs_mut() }.ip = (ip as i64 + offset as i64) as u32;
				}
			}
			Op::JUMP => {
				let offset = instr.arg1.as_i32();
				unsafe { ctx.regs_mut() }.ip = (ip as i64 + offset as i64) as u32;
			}
			Op::RETRY => {
				let regs = ctx.regs();
				if regs.ac != regs.ac2 {
					return Err(ErrorCode::IncorrectArgCount);
				}
				for i in 0..regs.ac {
					let value = ctx.pushed_arg(i);
					ctx.set_stack_elem((regs.abp + i) as usize, value);
				}
				let regs = unsafe { ctx.regs_mut() };
				regs.abp2 = ctx.lvbp();
				regs.lvc = 0;
				regs.ac2 = 0;
				regs.ip = 0;
			}
			Op::LETTUPLE => {
				let value = pending.take().ok_or(ErrorCode::IncorrectInstr)?;
				ctx.pop_args();
				let arity = instr.arg1.as_index();
				let obj = value_to_ref(&value)?;
				let ObjectPayload::Tuple(elems) = &obj.get().payload else { return Err(ErrorCode::IncorrectObject) };
				if elems.len() as u32 != arity {
					return Err(ErrorCode::IncorrectObject);
				}
				for elem in elems.iter() {
					let (payload, ty) = elem.read().ok_or(ErrorCode::IncorrectObject)?;
					if !ctx.push_local_var(tuple_elem_to_value(payload, ty)) {
						return Err(ErrorCode::StackOverflow);
					}
				}
			}
			op => {
				pending = Some(eval_op(ctx, machine, op, decoded.arg1_kind, instr.arg1, decoded.arg2_kind, instr.arg2)?);
			}
		}
	}
}

fn fetch_value(ctx: &ThreadContext, env: &Environment, kind: ArgKind, raw: RawArgument) -> Result<Value, ErrorCode> {
	match kind {
		ArgKind::Imm => Err(ErrorCode::IncorrectValue),
		ArgKind::LocalVar => {
			if raw.as_index() >= ctx.regs().lvc {
				return Err(ErrorCode::NoLocalVar);
			}
			Ok(ctx.local_var(raw.as_index()))
		}
		ArgKind::Arg => {
			if raw.as_index() >= ctx.regs().ac {
				return Err(ErrorCode::NoArg);
			}
			Ok(ctx.arg(raw.as_index()))
		}
		ArgKind::GlobalVar => env.globals.get(raw.as_index() as usize).cloned().ok_or(ErrorCode::NoGlobalVar),
	}
}

fn fetch_int(ctx: &ThreadContext, env: &Environment, kind: ArgKind, raw: RawArgument) -> Result<i64, ErrorCode> {
	if kind == ArgKind::Imm {
		return Ok(raw.as_i32() as i64);
	}
	fetch_value(ctx, env, kind, raw)?.as_int().ok_or(ErrorCode::IncorrectValue)
}

fn fetch_float(ctx: &ThreadContext, env: &Environment, kind: ArgKind, raw: RawArgument) -> Result<f64, ErrorCode> {
	if kind == ArgKind::Imm {
		return Ok(raw.as_f32() as f64);
	}
	fetch_value(ctx, env, kind, raw)?.as_float().ok_or(ErrorCode::IncorrectValue)
}

/// Resolves a ref operand, cancelling the source if it was unique — the
/// "every plain read of a unique reference quietly moves it" behavior the
/// source interpreter applies to any non-constant operand. A `GlobalVar`
/// operand names a constant, which cannot be moved out of, so a unique
/// target there is rejected outright instead.
fn fetch_ref(ctx: &ThreadContext, env: &Environment, kind: ArgKind, raw: RawArgument) -> Result<ObjectRef, ErrorCode> {
	if kind == ArgKind::GlobalVar {
		let value = fetch_value(ctx, env, kind, raw)?;
		let obj = value_to_ref(&value)?;
		if obj.get().unique {
			return Err(ErrorCode::UniqueObject);
		}
		return Ok(obj);
	}
	let (slot_index, mut value) = match kind {
		ArgKind::LocalVar => {
			if raw.as_index() >= ctx.regs().lvc {
				return Err(ErrorCode::NoLocalVar);
			}
			(ctx.lvbp() + raw.as_index(), ctx.local_var(raw.as_index()))
		}
		ArgKind::Arg => {
			if raw.as_index() >= ctx.regs().ac {
				return Err(ErrorCode::NoArg);
			}
			(ctx.regs().abp + raw.as_index(), ctx.arg(raw.as_index()))
		}
		ArgKind::Imm | ArgKind::GlobalVar => unreachable!(),
	};
	let obj = value_to_ref(&value)?;
	if obj.get().unique {
		value.cancel_ref();
		ctx.set_stack_elem(slot_index as usize, value);
	}
	Ok(obj)
}

fn value_to_ref(value: &Value) -> Result<ObjectRef, ErrorCode> {
	if value.is_canceled() {
		return Err(ErrorCode::AgainUsedUnique);
	}
	value.as_object().copied().ok_or(ErrorCode::IncorrectValue)
}

fn check_shared(value: &Value) -> Result<(), ErrorCode> {
	if let Some(obj) = value.as_object() {
		if obj.get().unique {
			return Err(ErrorCode::UniqueObject);
		}
	}
	Ok(())
}

fn expect_kind(obj: ObjectRef, kind: ObjectKind, unique: bool) -> Result<(), ErrorCode> {
	let object = obj.get();
	if object.kind == kind && object.unique == unique {
		Ok(())
	} else {
		Err(ErrorCode::IncorrectObject)
	}
}

fn check_index(obj: ObjectRef, i: i64) -> Result<usize, ErrorCode> {
	if i < 0 || i as usize >= obj.get().len() {
		Err(ErrorCode::IndexOutOfBounds)
	} else {
		Ok(i as usize)
	}
}

fn add_lengths(a: usize, b: usize) -> Result<usize, ErrorCode> {
	a.checked_add(b).ok_or(ErrorCode::OutOfMemory)
}

fn value_to_tuple_elem(value: &Value) -> Result<(u64, TupleElementType), ErrorCode> {
	match value.tag() {
		ValueTag::Int => Ok((value.as_int().unwrap() as u64, TupleElementType::Int)),
		ValueTag::Float => Ok((value.as_float().unwrap().to_bits(), TupleElementType::Float)),
		ValueTag::Ref => Ok((value.as_object().unwrap().as_ptr() as u64, TupleElementType::Ref)),
		_ => Err(ErrorCode::IncorrectValue),
	}
}

fn tuple_elem_to_value(payload: u64, ty: TupleElementType) -> Value {
	match ty {
		TupleElementType::Int => Value::int(payload as i64),
		TupleElementType::Float => Value::float(f64::from_bits(payload)),
		TupleElementType::Ref => match NonNull::new(payload as *mut Object) {
			Some(ptr) => Value::reference(unsafe { ObjectRef::from_raw(ptr) }),
			None => Value::error(),
		},
	}
}

/// Wraps `value1`/`value2` in a fresh 2-element unique tuple: the "unique
/// pair" `(payload, container)` every unique-object read or conversion hands
/// back to the caller, per the linear-object read protocol.
fn new_unique_pair(machine: &Machine, value1: &Value, value2: &Value) -> Result<ObjectRef, ErrorCode> {
	let elems: Box<[TupleElement]> = (0..2).map(|_| TupleElement::new_unset()).collect();
	let (p1, t1) = value_to_tuple_elem(value1)?;
	let (p2, t2) = value_to_tuple_elem(value2)?;
	elems[0].publish(p1, t1);
	elems[1].publish(p2, t2);
	Ok(machine.gc.new_object(ObjectKind::Tuple, ObjectPayload::Tuple(elems), true))
}

macro_rules! int_array_family {
	($op:ident, $ctx:expr, $machine:expr, $arg1_kind:expr, $raw1:expr, $arg2_kind:expr, $raw2:expr, $kind:expr, $variant:ident, $elem:ty) => {{
		match $op {
			"construct" => {
				let regs = $ctx.regs();
				let mut elems: Vec<$elem> = Vec::with_capacity(regs.ac2 as usize);
				for i in 0..regs.ac2 {
					let v = $ctx.pushed_arg(i);
					let int = v.as_int().ok_or(ErrorCode::IncorrectValue)?;
					elems.push(int as $elem);
				}
				let obj = $machine.gc.new_object($kind, ObjectPayload::$variant(elems.into_boxed_slice()), false);
				Ok(Value::reference(obj))
			}
			"read" => {
				let obj = fetch_ref($ctx, &$machine.env, $arg1_kind, $raw1)?;
				let i = fetch_int($ctx, &$machine.env, $arg2_kind, $raw2)?;
				expect_kind(obj, $kind, false)?;
				let idx = check_index(obj, i)?;
				let ObjectPayload::$variant(elems) = &obj.get().payload else { return Err(ErrorCode::IncorrectObject) };
				Ok(Value::int(elems[idx] as i64))
			}
			"cat" => {
				let obj1 = fetch_ref($ctx, &$machine.env, $arg1_kind, $raw1)?;
				let obj2 = fetch_ref($ctx, &$machine.env, $arg2_kind, $raw2)?;
				expect_kind(obj1, $kind, false)?;
				expect_kind(obj2, $kind, false)?;
				let len = add_lengths(obj1.get().len(), obj2.get().len())?;
				let mut elems: Vec<$elem> = Vec::with_capacity(len);
				let ObjectPayload::$variant(e1) = &obj1.get().payload else { return Err(ErrorCode::IncorrectObject) };
				let ObjectPayload::$variant(e2) = &obj2.get().payload else { return Err(ErrorCode::IncorrectObject) };
				elems.extend_from_slice(e1);
				elems.extend_from_slice(e2);
				let obj = $machine.gc.new_object($kind, ObjectPayload::$variant(elems.into_boxed_slice()), false);
				Ok(Value::reference(obj))
			}
			"len" => {
				let obj = fetch_ref($ctx, &$machine.env, $arg1_kind, $raw1)?;
				expect_kind(obj, $kind, false)?;
				Ok(Value::int(obj.get().len() as i64))
			}
			_ => unreachable!(),
		}
	}};
}

macro_rules! int_array_unique_family {
	($op:ident, $ctx:expr, $machine:expr, $arg1_kind:expr, $raw1:expr, $arg2_kind:expr, $raw2:expr, $kind:expr, $variant:ident, $elem:ty) => {{
		match $op {
			"fill" => {
				let n = fetch_int($ctx, &$machine.env, $arg1_kind, $raw1)?;
				let v = fetch_int($ctx, &$machine.env, $arg2_kind, $raw2)?;
				if n < 0 {
					return Err(ErrorCode::IncorrectValue);
				}
				let elems: Vec<$elem> = vec![v as $elem; n as usize];
				let obj = $machine.gc.new_object($kind, ObjectPayload::$variant(elems.into_boxed_slice()), true);
				Ok(Value::reference(obj))
			}
			"read" => {
				let obj = fetch_ref($ctx, &$machine.env, $arg1_kind, $raw1)?;
				let i = fetch_int($ctx, &$machine.env, $arg2_kind, $raw2)?;
				expect_kind(obj, $kind, true)?;
				let idx = check_index(obj, i)?;
				let ObjectPayload::$variant(elems) = &obj.get().payload else { return Err(ErrorCode::IncorrectObject) };
				let elem_value = Value::int(elems[idx] as i64);
				let pair = new_unique_pair($machine, &elem_value, &Value::reference(obj))?;
				Ok(Value::reference(pair))
			}
			"write" => {
				let obj = fetch_ref($ctx, &$machine.env, $arg1_kind, $raw1)?;
				let i = fetch_int($ctx, &$machine.env, $arg2_kind, $raw2)?;
				if $ctx.regs().ac2 != 1 {
					return Err(ErrorCode::IncorrectArgCount);
				}
				let v = $ctx.pushed_arg(0).as_int().ok_or(ErrorCode::IncorrectValue)?;
				expect_kind(obj, $kind, true)?;
				let idx = check_index(obj, i)?;
				let payload = unsafe { obj.payload_mut() };
				let ObjectPayload::$variant(elems) = payload else { return Err(ErrorCode::IncorrectObject) };
				elems[idx] = v as $elem;
				Ok(Value::reference(obj))
			}
			"len" => {
				let obj = fetch_ref($ctx, &$machine.env, $arg1_kind, $raw1)?;
				expect_kind(obj, $kind, true)?;
				let pair = new_unique_pair($machine, &Value::int(obj.get().len() as i64), &Value::reference(obj))?;
				Ok(Value::reference(pair))
			}
			"to_shared" => {
				let obj = fetch_ref($ctx, &$machine.env, $arg1_kind, $raw1)?;
				expect_kind(obj, $kind, true)?;
				let ObjectPayload::$variant(elems) = &obj.get().payload else { return Err(ErrorCode::IncorrectObject) };
				let copy: Vec<$elem> = elems.to_vec();
				let shared = $machine.gc.new_object($kind, ObjectPayload::$variant(copy.into_boxed_slice()), false);
				let pair = new_unique_pair($machine, &Value::reference(shared), &Value::reference(obj))?;
				Ok(Value::reference(pair))
			}
			_ => unreachable!(),
		}
	}};
}

/// Evaluates a single value-producing opcode (every `Op` variant except the
/// control-flow and frame-management ones, which `run_instruction_loop`
/// handles directly) and returns its result. Mirrors the giant `interpret_op`
/// switch this interpreter generalizes, one case per opcode family.
#[allow(clippy::too_many_lines)]
fn eval_op(ctx: &ThreadContext, machine: &Machine, op: Op, k1: ArgKind, a1: RawArgument, k2: ArgKind, a2: RawArgument) -> Result<Value, ErrorCode> {
	let env = &machine.env;
	match op {
		Op::ILOAD => Ok(Value::int(fetch_int(ctx, env, k1, a1)?)),
		Op::ILOAD2 => {
			let (i1, i2) = (fetch_int(ctx, env, k1, a1)?, fetch_int(ctx, env, k2, a2)?);
			Ok(Value::int((i1 << 32) | (i2 & 0xffff_ffff)))
		}
		Op::INEG => Ok(Value::int(-fetch_int(ctx, env, k1, a1)?)),
		Op::IADD => Ok(Value::int(fetch_int(ctx, env, k1, a1)?.wrapping_add(fetch_int(ctx, env, k2, a2)?))),
		Op::ISUB => Ok(Value::int(fetch_int(ctx, env, k1, a1)?.wrapping_sub(fetch_int(ctx, env, k2, a2)?))),
		Op::IMUL => Ok(Value::int(fetch_int(ctx, env, k1, a1)?.wrapping_mul(fetch_int(ctx, env, k2, a2)?))),
		Op::IDIV => {
			let (i1, i2) = (fetch_int(ctx, env, k1, a1)?, fetch_int(ctx, env, k2, a2)?);
			if i2 == 0 {
				return Err(ErrorCode::DivByZero);
			}
			Ok(Value::int(i1.wrapping_div(i2)))
		}
		Op::IMOD => {
			let (i1, i2) = (fetch_int(ctx, env, k1, a1)?, fetch_int(ctx, env, k2, a2)?);
			if i2 == 0 {
				return Err(ErrorCode::DivByZero);
			}
			Ok(Value::int(i1.wrapping_rem(i2)))
		}
		Op::INOT => Ok(Value::int(!fetch_int(ctx, env, k1, a1)?)),
		Op::IAND => Ok(Value::int(fetch_int(ctx, env, k1, a1)? & fetch_int(ctx, env, k2, a2)?)),
		Op::IOR => Ok(Value::int(fetch_int(ctx, env, k1, a1)? | fetch_int(ctx, env, k2, a2)?)),
		Op::IXOR => Ok(Value::int(fetch_int(ctx, env, k1, a1)? ^ fetch_int(ctx, env, k2, a2)?)),
		Op::ISHL => Ok(Value::int(fetch_int(ctx, env, k1, a1)?.wrapping_shl(fetch_int(ctx, env, k2, a2)? as u32))),
		Op::ISHR => Ok(Value::int(fetch_int(ctx, env, k1, a1)?.wrapping_shr(fetch_int(ctx, env, k2, a2)? as u32))),
		Op::ISHRU => Ok(Value::int((fetch_int(ctx, env, k1, a1)? as u64).wrapping_shr(fetch_int(ctx, env, k2, a2)? as u32) as i64)),
		Op::IEQ => Ok(Value::int((fetch_int(ctx, env, k1, a1)? == fetch_int(ctx, env, k2, a2)?) as i64)),
		Op::INE => Ok(Value::int((fetch_int(ctx, env, k1, a1)? != fetch_int(ctx, env, k2, a2)?) as i64)),
		Op::ILT => Ok(Value::int((fetch_int(ctx, env, k1, a1)? < fetch_int(ctx, env, k2, a2)?) as i64)),
		Op::IGE => Ok(Value::int((fetch_int(ctx, env, k1, a1)? >= fetch_int(ctx, env, k2, a2)?) as i64)),
		Op::IGT => Ok(Value::int((fetch_int(ctx, env, k1, a1)? > fetch_int(ctx, env, k2, a2)?) as i64)),
		Op::ILE => Ok(Value::int((fetch_int(ctx, env, k1, a1)? <= fetch_int(ctx, env, k2, a2)?) as i64)),

		Op::FLOAD => Ok(Value::float(fetch_float(ctx, env, k1, a1)?)),
		Op::FLOAD2 => Ok(Value::float(fetch_float(ctx, env, k1, a1)?)),
		Op::FNEG => Ok(Value::float(-fetch_float(ctx, env, k1, a1)?)),
		Op::FADD => Ok(Value::float(fetch_float(ctx, env, k1, a1)? + fetch_float(ctx, env, k2, a2)?)),
		Op::FSUB => Ok(Value::float(fetch_float(ctx, env, k1, a1)? - fetch_float(ctx, env, k2, a2)?)),
		Op::FMUL => Ok(Value::float(fetch_float(ctx, env, k1, a1)? * fetch_float(ctx, env, k2, a2)?)),
		Op::FDIV => Ok(Value::float(fetch_float(ctx, env, k1, a1)? / fetch_float(ctx, env, k2, a2)?)),
		Op::FEQ => Ok(Value::int((fetch_float(ctx, env, k1, a1)? == fetch_float(ctx, env, k2, a2)?) as i64)),
		Op::FNE => Ok(Value::int((fetch_float(ctx, env, k1, a1)? != fetch_float(ctx, env, k2, a2)?) as i64)),
		Op::FLT => Ok(Value::int((fetch_float(ctx, env, k1, a1)? < fetch_float(ctx, env, k2, a2)?) as i64)),
		Op::FGE => Ok(Value::int((fetch_float(ctx, env, k1, a1)? >= fetch_float(ctx, env, k2, a2)?) as i64)),
		Op::FGT => Ok(Value::int((fetch_float(ctx, env, k1, a1)? > fetch_float(ctx, env, k2, a2)?) as i64)),
		Op::FLE => Ok(Value::int((fetch_float(ctx, env, k1, a1)? <= fetch_float(ctx, env, k2, a2)?) as i64)),
		Op::ITOF => Ok(Value::float(fetch_int(ctx, env, k1, a1)? as f64)),
		Op::FTOI => Ok(Value::int(fetch_float(ctx, env, k1, a1)? as i64)),

		Op::RLOAD => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			Ok(Value::reference(obj))
		}
		Op::REQ | Op::RNE => {
			if k1 != ArgKind::GlobalVar && k2 != ArgKind::GlobalVar {
				return Err(ErrorCode::IncorrectInstr);
			}
			let obj1 = fetch_ref(ctx, env, k1, a1)?;
			let obj2 = fetch_ref(ctx, env, k2, a2)?;
			let eq = std::ptr::eq(obj1.as_ptr(), obj2.as_ptr());
			Ok(Value::int((eq == (op == Op::REQ)) as i64))
		}
		Op::RTYPE => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			Ok(Value::int(obj.get().wire_type() as i64))
		}

		Op::RIARRAY8 => int_array_family!("construct", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray8, IArray8, i8),
		Op::RIARRAY16 => int_array_family!("construct", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray16, IArray16, i16),
		Op::RIARRAY32 => int_array_family!("construct", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray32, IArray32, i32),
		Op::RIARRAY64 => int_array_family!("construct", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray64, IArray64, i64),
		Op::RSFARRAY => {
			let regs = ctx.regs();
			let mut elems = Vec::with_capacity(regs.ac2 as usize);
			for i in 0..regs.ac2 {
				elems.push(ctx.pushed_arg(i).as_float().ok_or(ErrorCode::IncorrectValue)? as f32);
			}
			Ok(Value::reference(machine.gc.new_object(ObjectKind::SfArray, ObjectPayload::SfArray(elems.into_boxed_slice()), false)))
		}
		Op::RDFARRAY => {
			let regs = ctx.regs();
			let mut elems = Vec::with_capacity(regs.ac2 as usize);
			for i in 0..regs.ac2 {
				elems.push(ctx.pushed_arg(i).as_float().ok_or(ErrorCode::IncorrectValue)?);
			}
			Ok(Value::reference(machine.gc.new_object(ObjectKind::DfArray, ObjectPayload::DfArray(elems.into_boxed_slice()), false)))
		}
		Op::RRARRAY => {
			let regs = ctx.regs();
			let refs: Vec<Value> = (0..regs.ac2).map(|i| ctx.pushed_arg(i)).collect();
			for v in &refs {
				check_shared(v)?;
			}
			let slots: Box<[crate::object::RefSlot]> = (0..refs.len()).map(|_| crate::object::RefSlot::new_unset()).collect();
			for (slot, v) in slots.iter().zip(refs.iter()) {
				let obj = value_to_ref(v)?;
				unsafe { slot.publish(obj) };
			}
			Ok(Value::reference(machine.gc.new_object(ObjectKind::RArray, ObjectPayload::RArray(slots), false)))
		}
		Op::RTUPLE => {
			let regs = ctx.regs();
			let elems: Box<[TupleElement]> = (0..regs.ac2).map(|_| TupleElement::new_unset()).collect();
			for i in 0..regs.ac2 {
				let v = ctx.pushed_arg(i);
				check_shared(&v)?;
				let (payload, ty) = value_to_tuple_elem(&v)?;
				elems[i as usize].publish(payload, ty);
			}
			Ok(Value::reference(machine.gc.new_object(ObjectKind::Tuple, ObjectPayload::Tuple(elems), false)))
		}

		Op::RIANTH8 => int_array_family!("read", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray8, IArray8, i8),
		Op::RIANTH16 => int_array_family!("read", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray16, IArray16, i16),
		Op::RIANTH32 => int_array_family!("read", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray32, IArray32, i32),
		Op::RIANTH64 => int_array_family!("read", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray64, IArray64, i64),
		Op::RSFANTH => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			let i = fetch_int(ctx, env, k2, a2)?;
			expect_kind(obj, ObjectKind::SfArray, false)?;
			let idx = check_index(obj, i)?;
			let ObjectPayload::SfArray(elems) = &obj.get().payload else { unreachable!() };
			Ok(Value::float(elems[idx] as f64))
		}
		Op::RDFANTH => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			let i = fetch_int(ctx, env, k2, a2)?;
			expect_kind(obj, ObjectKind::DfArray, false)?;
			let idx = check_index(obj, i)?;
			let ObjectPayload::DfArray(elems) = &obj.get().payload else { unreachable!() };
			Ok(Value::float(elems[idx]))
		}
		Op::RRANTH => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			let i = fetch_int(ctx, env, k2, a2)?;
			expect_kind(obj, ObjectKind::RArray, false)?;
			let idx = check_index(obj, i)?;
			let ObjectPayload::RArray(slots) = &obj.get().payload else { unreachable!() };
			match slots[idx].get() {
				Some(target) => Ok(Value::reference(target)),
				None => Err(ErrorCode::IncorrectObject),
			}
		}
		Op::RTNTH => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			let i = fetch_int(ctx, env, k2, a2)?;
			expect_kind(obj, ObjectKind::Tuple, false)?;
			let idx = check_index(obj, i)?;
			let ObjectPayload::Tuple(elems) = &obj.get().payload else { unreachable!() };
			let (payload, ty) = elems[idx].read().ok_or(ErrorCode::IncorrectObject)?;
			Ok(tuple_elem_to_value(payload, ty))
		}

		Op::RIACAT8 => int_array_family!("cat", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray8, IArray8, i8),
		Op::RIACAT16 => int_array_family!("cat", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray16, IArray16, i16),
		Op::RIACAT32 => int_array_family!("cat", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray32, IArray32, i32),
		Op::RIACAT64 => int_array_family!("cat", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray64, IArray64, i64),
		Op::RSFACAT => {
			let obj1 = fetch_ref(ctx, env, k1, a1)?;
			let obj2 = fetch_ref(ctx, env, k2, a2)?;
			expect_kind(obj1, ObjectKind::SfArray, false)?;
			expect_kind(obj2, ObjectKind::SfArray, false)?;
			let ObjectPayload::SfArray(e1) = &obj1.get().payload else { unreachable!() };
			let ObjectPayload::SfArray(e2) = &obj2.get().payload else { unreachable!() };
			let mut elems = Vec::with_capacity(add_lengths(e1.len(), e2.len())?);
			elems.extend_from_slice(e1);
			elems.extend_from_slice(e2);
			Ok(Value::reference(machine.gc.new_object(ObjectKind::SfArray, ObjectPayload::SfArray(elems.into_boxed_slice()), false)))
		}
		Op::RDFACAT => {
			let obj1 = fetch_ref(ctx, env, k1, a1)?;
			let obj2 = fetch_ref(ctx, env, k2, a2)?;
			expect_kind(obj1, ObjectKind::DfArray, false)?;
			expect_kind(obj2, ObjectKind::DfArray, false)?;
			let ObjectPayload::DfArray(e1) = &obj1.get().payload else { unreachable!() };
			let ObjectPayload::DfArray(e2) = &obj2.get().payload else { unreachable!() };
			let mut elems = Vec::with_capacity(add_lengths(e1.len(), e2.len())?);
			elems.extend_from_slice(e1);
			elems.extend_from_slice(e2);
			Ok(Value::reference(machine.gc.new_object(ObjectKind::DfArray, ObjectPayload::DfArray(elems.into_boxed_slice()), false)))
		}
		Op::RRACAT => {
			let obj1 = fetch_ref(ctx, env, k1, a1)?;
			let obj2 = fetch_ref(ctx, env, k2, a2)?;
			expect_kind(obj1, ObjectKind::RArray, false)?;
			expect_kind(obj2, ObjectKind::RArray, false)?;
			let ObjectPayload::RArray(s1) = &obj1.get().payload else { unreachable!() };
			let ObjectPayload::RArray(s2) = &obj2.get().payload else { unreachable!() };
			let total = add_lengths(s1.len(), s2.len())?;
			let slots: Box<[crate::object::RefSlot]> = (0..total).map(|_| crate::object::RefSlot::new_unset()).collect();
			for (slot, src) in slots.iter().zip(s1.iter().chain(s2.iter())) {
				if let Some(target) = src.get() {
					unsafe { slot.publish(target) };
				}
			}
			Ok(Value::reference(machine.gc.new_object(ObjectKind::RArray, ObjectPayload::RArray(slots), false)))
		}
		Op::RTCAT => {
			let obj1 = fetch_ref(ctx, env, k1, a1)?;
			let obj2 = fetch_ref(ctx, env, k2, a2)?;
			expect_kind(obj1, ObjectKind::Tuple, false)?;
			expect_kind(obj2, ObjectKind::Tuple, false)?;
			let ObjectPayload::Tuple(e1) = &obj1.get().payload else { unreachable!() };
			let ObjectPayload::Tuple(e2) = &obj2.get().payload else { unreachable!() };
			let total = add_lengths(e1.len(), e2.len())?;
			let elems: Box<[TupleElement]> = (0..total).map(|_| TupleElement::new_unset()).collect();
			for (dst, src) in elems.iter().zip(e1.iter().chain(e2.iter())) {
				let (p, t) = src.read().ok_or(ErrorCode::IncorrectObject)?;
				dst.publish(p, t);
			}
			Ok(Value::reference(machine.gc.new_object(ObjectKind::Tuple, ObjectPayload::Tuple(elems), false)))
		}

		Op::RIALEN8 => int_array_family!("len", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray8, IArray8, i8),
		Op::RIALEN16 => int_array_family!("len", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray16, IArray16, i16),
		Op::RIALEN32 => int_array_family!("len", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray32, IArray32, i32),
		Op::RIALEN64 => int_array_family!("len", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray64, IArray64, i64),
		Op::RSFALEN => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			expect_kind(obj, ObjectKind::SfArray, false)?;
			Ok(Value::int(obj.get().len() as i64))
		}
		Op::RDFALEN => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			expect_kind(obj, ObjectKind::DfArray, false)?;
			Ok(Value::int(obj.get().len() as i64))
		}
		Op::RRALEN => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			expect_kind(obj, ObjectKind::RArray, false)?;
			Ok(Value::int(obj.get().len() as i64))
		}
		Op::RTLEN => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			expect_kind(obj, ObjectKind::Tuple, false)?;
			Ok(Value::int(obj.get().len() as i64))
		}

		Op::ICALL | Op::FCALL | Op::RCALL => {
			let fun_index = fetch_int(ctx, env, k1, a1)? as u32;
			let regs = ctx.regs();
			let args: Vec<Value> = (0..regs.ac2).map(|i| ctx.pushed_arg(i)).collect();
			ctx.pop_args();
			let value = dispatch_call(ctx, machine, fun_index, &args, op != Op::RCALL)?;
			match op {
				Op::ICALL => Ok(Value::int(value.as_int().ok_or(ErrorCode::IncorrectValue)?)),
				Op::FCALL => Ok(Value::float(value.as_float().ok_or(ErrorCode::IncorrectValue)?)),
				_ => Ok(value),
			}
		}
		Op::INCALL | Op::FNCALL | Op::RNCALL => {
			let nfi = fetch_int(ctx, env, k1, a1)? as i32;
			let regs = ctx.regs();
			let args: Vec<Value> = (0..regs.ac2).map(|i| ctx.pushed_arg(i)).collect();
			ctx.pop_args();
			let value = machine.native.invoke(ctx, machine, nfi, &args)?;
			match op {
				Op::INCALL => Ok(Value::int(value.as_int().ok_or(ErrorCode::IncorrectValue)?)),
				Op::FNCALL => Ok(Value::float(value.as_float().ok_or(ErrorCode::IncorrectValue)?)),
				_ => Ok(value),
			}
		}

		Op::RUIAFILL8 => int_array_unique_family!("fill", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray8, IArray8, i8),
		Op::RUIAFILL16 => int_array_unique_family!("fill", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray16, IArray16, i16),
		Op::RUIAFILL32 => int_array_unique_family!("fill", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray32, IArray32, i32),
		Op::RUIAFILL64 => int_array_unique_family!("fill", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray64, IArray64, i64),
		Op::RUSFAFILL => {
			let n = fetch_int(ctx, env, k1, a1)?;
			let v = fetch_float(ctx, env, k2, a2)?;
			if n < 0 {
				return Err(ErrorCode::IncorrectValue);
			}
			let elems = vec![v as f32; n as usize];
			Ok(Value::reference(machine.gc.new_object(ObjectKind::SfArray, ObjectPayload::SfArray(elems.into_boxed_slice()), true)))
		}
		Op::RUDFAFILL => {
			let n = fetch_int(ctx, env, k1, a1)?;
			let v = fetch_float(ctx, env, k2, a2)?;
			if n < 0 {
				return Err(ErrorCode::IncorrectValue);
			}
			let elems = vec![v; n as usize];
			Ok(Value::reference(machine.gc.new_object(ObjectKind::DfArray, ObjectPayload::DfArray(elems.into_boxed_slice()), true)))
		}
		Op::RURAFILL => {
			let n = fetch_int(ctx, env, k1, a1)?;
			let v = fetch_ref(ctx, env, k2, a2)?;
			if n < 0 {
				return Err(ErrorCode::IncorrectValue);
			}
			let slots: Box<[crate::object::RefSlot]> = (0..n as usize).map(|_| crate::object::RefSlot::new_unset()).collect();
			for slot in slots.iter() {
				unsafe { slot.publish(v) };
			}
			Ok(Value::reference(machine.gc.new_object(ObjectKind::RArray, ObjectPayload::RArray(slots), true)))
		}
		Op::RUTFILLI | Op::RUTFILLF | Op::RUTFILLR => {
			let n = fetch_int(ctx, env, k1, a1)?;
			if n < 0 {
				return Err(ErrorCode::IncorrectValue);
			}
			let regs = ctx.regs();
			if regs.ac2 != 1 {
				return Err(ErrorCode::IncorrectArgCount);
			}
			let fill = ctx.pushed_arg(0);
			let (payload, ty) = value_to_tuple_elem(&fill)?;
			if op == Op::RUTFILLR {
				check_shared(&fill)?;
			}
			let elems: Box<[TupleElement]> = (0..n as usize).map(|_| TupleElement::new_unset()).collect();
			for elem in elems.iter() {
				elem.publish(payload, ty);
			}
			Ok(Value::reference(machine.gc.new_object(ObjectKind::Tuple, ObjectPayload::Tuple(elems), true)))
		}

		Op::RUIANTH8 => int_array_unique_family!("read", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray8, IArray8, i8),
		Op::RUIANTH16 => int_array_unique_family!("read", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray16, IArray16, i16),
		Op::RUIANTH32 => int_array_unique_family!("read", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray32, IArray32, i32),
		Op::RUIANTH64 => int_array_unique_family!("read", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray64, IArray64, i64),
		Op::RUSFANTH => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			let i = fetch_int(ctx, env, k2, a2)?;
			expect_kind(obj, ObjectKind::SfArray, true)?;
			let idx = check_index(obj, i)?;
			let ObjectPayload::SfArray(elems) = &obj.get().payload else { unreachable!() };
			let elem_value = Value::float(elems[idx] as f64);
			let pair = new_unique_pair(machine, &elem_value, &Value::reference(obj))?;
			Ok(Value::reference(pair))
		}
		Op::RUDFANTH => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			let i = fetch_int(ctx, env, k2, a2)?;
			expect_kind(obj, ObjectKind::DfArray, true)?;
			let idx = check_index(obj, i)?;
			let ObjectPayload::DfArray(elems) = &obj.get().payload else { unreachable!() };
			let elem_value = Value::float(elems[idx]);
			let pair = new_unique_pair(machine, &elem_value, &Value::reference(obj))?;
			Ok(Value::reference(pair))
		}
		Op::RURANTH => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			let i = fetch_int(ctx, env, k2, a2)?;
			expect_kind(obj, ObjectKind::RArray, true)?;
			let idx = check_index(obj, i)?;
			let ObjectPayload::RArray(slots) = &obj.get().payload else { unreachable!() };
			let target = slots[idx].get().ok_or(ErrorCode::IncorrectObject)?;
			if target.get().unique {
				return Err(ErrorCode::UniqueObject);
			}
			let pair = new_unique_pair(machine, &Value::reference(target), &Value::reference(obj))?;
			Ok(Value::reference(pair))
		}
		Op::RUTNTH => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			let i = fetch_int(ctx, env, k2, a2)?;
			expect_kind(obj, ObjectKind::Tuple, true)?;
			let idx = check_index(obj, i)?;
			let ObjectPayload::Tuple(elems) = &obj.get().payload else { unreachable!() };
			let (payload, ty) = elems[idx].read().ok_or(ErrorCode::IncorrectObject)?;
			let mut elem_value = tuple_elem_to_value(payload, ty);
			if let TupleElementType::Ref = ty {
				if let Some(target) = elem_value.as_object() {
					if target.get().unique {
						elem_value.cancel_ref();
						elems[idx].publish(0, TupleElementType::Ref);
					}
				}
			}
			let pair = new_unique_pair(machine, &elem_value, &Value::reference(obj))?;
			Ok(Value::reference(pair))
		}

		Op::RUIASNTH8 => int_array_unique_family!("write", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray8, IArray8, i8),
		Op::RUIASNTH16 => int_array_unique_family!("write", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray16, IArray16, i16),
		Op::RUIASNTH32 => int_array_unique_family!("write", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray32, IArray32, i32),
		Op::RUIASNTH64 => int_array_unique_family!("write", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray64, IArray64, i64),
		Op::RUSFASNTH => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			let i = fetch_int(ctx, env, k2, a2)?;
			if ctx.regs().ac2 != 1 {
				return Err(ErrorCode::IncorrectArgCount);
			}
			let v = ctx.pushed_arg(0).as_float().ok_or(ErrorCode::IncorrectValue)?;
			expect_kind(obj, ObjectKind::SfArray, true)?;
			let idx = check_index(obj, i)?;
			let ObjectPayload::SfArray(elems) = (unsafe { obj.payload_mut() }) else { unreachable!() };
			elems[idx] = v as f32;
			Ok(Value::reference(obj))
		}
		Op::RUDFASNTH => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			let i = fetch_int(ctx, env, k2, a2)?;
			if ctx.regs().ac2 != 1 {
				return Err(ErrorCode::IncorrectArgCount);
			}
			let v = ctx.pushed_arg(0).as_float().ok_or(ErrorCode::IncorrectValue)?;
			expect_kind(obj, ObjectKind::DfArray, true)?;
			let idx = check_index(obj, i)?;
			let ObjectPayload::DfArray(elems) = (unsafe { obj.payload_mut() }) else { unreachable!() };
			elems[idx] = v;
			Ok(Value::reference(obj))
		}
		Op::RURASNTH => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			let i = fetch_int(ctx, env, k2, a2)?;
			if ctx.regs().ac2 != 1 {
				return Err(ErrorCode::IncorrectArgCount);
			}
			let v = ctx.pushed_arg(0);
			check_shared(&v)?;
			let target = value_to_ref(&v)?;
			expect_kind(obj, ObjectKind::RArray, true)?;
			let idx = check_index(obj, i)?;
			let ObjectPayload::RArray(slots) = &obj.get().payload else { unreachable!() };
			unsafe { slots[idx].publish(target) };
			Ok(Value::reference(obj))
		}
		Op::RUTSNTH => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			let i = fetch_int(ctx, env, k2, a2)?;
			if ctx.regs().ac2 != 1 {
				return Err(ErrorCode::IncorrectArgCount);
			}
			let mut v = ctx.pushed_arg(0);
			v.cancel_ref();
			let (payload, ty) = value_to_tuple_elem(&v)?;
			expect_kind(obj, ObjectKind::Tuple, true)?;
			let idx = check_index(obj, i)?;
			let ObjectPayload::Tuple(elems) = &obj.get().payload else { unreachable!() };
			elems[idx].publish(payload, ty);
			Ok(Value::reference(obj))
		}

		Op::RUIATOIA8 => int_array_unique_family!("to_shared", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray8, IArray8, i8),
		Op::RUIATOIA16 => int_array_unique_family!("to_shared", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray16, IArray16, i16),
		Op::RUIATOIA32 => int_array_unique_family!("to_shared", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray32, IArray32, i32),
		Op::RUIATOIA64 => int_array_unique_family!("to_shared", ctx, machine, k1, a1, k2, a2, ObjectKind::IArray64, IArray64, i64),
		Op::RUSFATOSFA => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			expect_kind(obj, ObjectKind::SfArray, true)?;
			let ObjectPayload::SfArray(elems) = &obj.get().payload else { unreachable!() };
			let copy = elems.to_vec();
			let shared = machine.gc.new_object(ObjectKind::SfArray, ObjectPayload::SfArray(copy.into_boxed_slice()), false);
			let pair = new_unique_pair(machine, &Value::reference(shared), &Value::reference(obj))?;
			Ok(Value::reference(pair))
		}
		Op::RUDFATODFA => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			expect_kind(obj, ObjectKind::DfArray, true)?;
			let ObjectPayload::DfArray(elems) = &obj.get().payload else { unreachable!() };
			let copy = elems.to_vec();
			let shared = machine.gc.new_object(ObjectKind::DfArray, ObjectPayload::DfArray(copy.into_boxed_slice()), false);
			let pair = new_unique_pair(machine, &Value::reference(shared), &Value::reference(obj))?;
			Ok(Value::reference(pair))
		}
		Op::RURATORA => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			expect_kind(obj, ObjectKind::RArray, true)?;
			let ObjectPayload::RArray(slots) = &obj.get().payload else { unreachable!() };
			let new_slots: Box<[crate::object::RefSlot]> = (0..slots.len()).map(|_| crate::object::RefSlot::new_unset()).collect();
			for (dst, src) in new_slots.iter().zip(slots.iter()) {
				let target = src.get().ok_or(ErrorCode::IncorrectObject)?;
				if target.get().unique {
					return Err(ErrorCode::UniqueObject);
				}
				unsafe { dst.publish(target) };
			}
			let shared = machine.gc.new_object(ObjectKind::RArray, ObjectPayload::RArray(new_slots), false);
			let pair = new_unique_pair(machine, &Value::reference(shared), &Value::reference(obj))?;
			Ok(Value::reference(pair))
		}
		Op::RUTTOT => {
			let obj = fetch_ref(ctx, env, k1, a1)?;
			expect_kind(obj, ObjectKind::Tuple, true)?;
			let ObjectPayload::Tuple(elems) = &obj.get().payload else { unreachable!() };
			let new_elems: Box<[TupleElement]> = (0..elems.len()).map(|_| TupleElement::new_unset()).collect();
			for (dst, src) in new_elems.iter().zip(elems.iter()) {
				let (payload, ty) = src.read().ok_or(ErrorCode::IncorrectObject)?;
				if let TupleElementType::Ref = ty {
					if let Some(ptr) = NonNull::new(payload as *mut Object) {
						if unsafe { ptr.as_ref() }.unique {
							return Err(ErrorCode::UniqueObject);
						}
					}
				}
				dst.publish(payload, ty);
			}
			let shared = machine.gc.new_object(ObjectKind::Tuple, ObjectPayload::Tuple(new_elems), false);
			let pair = new_unique_pair(machine, &Value::reference(shared), &Value::reference(obj))?;
			Ok(Value::reference(pair))
		}

		Op::LET | Op::IN | Op::ARG | Op::RET | Op::JC | Op::JUMP | Op::RETRY | Op::LETTUPLE => unreachable!("handled by run_instruction_loop"),
	}
}

/// Runs a callee under its chosen [`Strategy`]. Lazy/memoized-lazy wrapping
/// only makes sense for a reference-typed result — a `LAZY_VALUE` is itself
/// a heap object, so a scalar (`ICALL`/`FCALL`) call site always evaluates
/// eagerly regardless of strategy, optionally still consulting the
/// memoization cache (which is equally meaningful for scalar results).
/// `scalar` is `true` exactly for those two call sites; `RCALL` passes
/// `false` and gets the full four-way strategy.
fn dispatch_call(ctx: &ThreadContext, machine: &Machine, fun_index: u32, args: &[Value], scalar: bool) -> Result<Value, ErrorCode> {
	let memoized = || machine.memo.get_or_insert(fun_index, args, || run_function(ctx, machine, fun_index, args).unwrap_or_else(|_| Value::error())).or_else(|_| run_function(ctx, machine, fun_index, args));
	match machine.strategy.strategy_for(fun_index, &machine.env.fun_eval_overrides) {
		Strategy::Eager => run_function(ctx, machine, fun_index, args),
		Strategy::Memoized => memoized(),
		Strategy::Lazy if scalar => run_function(ctx, machine, fun_index, args),
		Strategy::Lazy => make_lazy(machine, fun_index, args, false),
		Strategy::MemoizedLazy if scalar => memoized(),
		Strategy::MemoizedLazy => make_lazy(machine, fun_index, args, true),
	}
}

fn make_lazy(machine: &Machine, fun_index: u32, args: &[Value], must_be_shared: bool) -> Result<Value, ErrorCode> {
	let state = LazyValueState {
		fun_index,
		args: args.to_vec().into_boxed_slice(),
		must_be_shared,
		mutex: std::sync::Mutex::new(None),
		forcing_thread: std::sync::atomic::AtomicU64::new(0),
	};
	let obj = machine.gc.new_object(ObjectKind::LazyValue, ObjectPayload::LazyValue(state), false);
	Ok(Value::lazy_value_ref(obj))
}

/// Forces a `LazyValueRef`, invoking the interpreter recursively (optionally
/// through the memoization cache, for a memoized-lazy thunk) the first time
/// it is demanded.
pub fn force(ctx: &ThreadContext, machine: &Machine, thunk: ObjectRef) -> Result<Value, ErrorCode> {
	let invoke = |fun_index: u32, args: &[Value]| -> Result<Value, ErrorCode> {
		if machine.memo.get(fun_index, args).unwrap_or(None).is_some() {
			return machine.memo.get_or_insert(fun_index, args, || run_function(ctx, machine, fun_index, args).unwrap_or_else(|_| Value::error()));
		}
		run_function(ctx, machine, fun_index, args)
	};
	lazy::force(thunk, &machine.lock_count, &invoke, ctx.id)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::format::{eval_strategy, RawFunctionInfo};
	use crate::linker::LinkedFunction;
	use crate::native::NoNativeFunctions;
	use crate::opcode::encode_opcode;

	fn instr(op: Op, k1: ArgKind, a1: i32, k2: ArgKind, a2: i32) -> RawInstruction {
		RawInstruction { opcode: encode_opcode(op, k1, k2), arg1: RawArgument { bits: a1 as u32 }, arg2: RawArgument { bits: a2 as u32 } }
	}

	fn machine_with(funs: Vec<LinkedFunction>) -> Machine {
		let gc = Arc::new(TracingGc::new());
		let env = Environment { funs, globals: Vec::new(), entry_fun: 0, fun_eval_overrides: HashMap::new() };
		Machine::new(gc, env, Box::new(NoNativeFunctions), Box::new(DefaultEvaluationStrategy { default: Strategy::Eager }))
	}

	#[test]
	fn runs_simple_arithmetic_program() {
		// fn entry() = let x = 2 + 3 in x
		let code = vec![
			instr(Op::IADD, ArgKind::Imm, 2, ArgKind::Imm, 3),
			instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),
			instr(Op::ILOAD, ArgKind::LocalVar, 0, ArgKind::Imm, 0),
			instr(Op::RET, ArgKind::Imm, 0, ArgKind::Imm, 0),
		];
		let machine = machine_with(vec![LinkedFunction { arg_count: 0, code }]);
		let result = start(&machine, 0, &[]).unwrap();
		assert_eq!(result.as_int(), Some(5));
	}

	#[test]
	fn call_invokes_callee_and_returns_its_value() {
		// fn callee(a) = ret a
		let callee_code = vec![instr(Op::ILOAD, ArgKind::Arg, 0, ArgKind::Imm, 0), instr(Op::RET, ArgKind::Imm, 0, ArgKind::Imm, 0)];
		// fn entry() = arg 7; icall 0; ret
		let entry_code = vec![
			instr(Op::ILOAD, ArgKind::Imm, 7, ArgKind::Imm, 0),
			instr(Op::ARG, ArgKind::Imm, 0, ArgKind::Imm, 0),
			instr(Op::ICALL, ArgKind::Imm, 0, ArgKind::Imm, 0),
			instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),
			instr(Op::ILOAD, ArgKind::LocalVar, 0, ArgKind::Imm, 0),
			instr(Op::RET, ArgKind::Imm, 0, ArgKind::Imm, 0),
		];
		let machine = machine_with(vec![LinkedFunction { arg_count: 0, code: entry_code }, LinkedFunction { arg_count: 1, code: callee_code }]);
		let result = start(&machine, 0, &[]).unwrap();
		assert_eq!(result.as_int(), Some(7));
	}

	#[test]
	fn division_by_zero_faults_instead_of_panicking() {
		let code = vec![
			instr(Op::IDIV, ArgKind::Imm, 1, ArgKind::Imm, 0),
			instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),
			instr(Op::RET, ArgKind::Imm, 0, ArgKind::Imm, 0),
		];
		let machine = machine_with(vec![LinkedFunction { arg_count: 0, code }]);
		let result = start(&machine, 0, &[]);
		assert_eq!(result, Err(ErrorCode::DivByZero));
	}

	#[test]
	fn unique_array_write_then_convert_cancels_original() {
		// fn entry() = rec = ruiafill8 3 0; rec2 = ruiasnth8 rec 0 <- 9; ruiatoia8 rec2
		let code = vec![
			instr(Op::RUIAFILL8, ArgKind::Imm, 3, ArgKind::Imm, 0),
			instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),
			instr(Op::ILOAD, ArgKind::Imm, 9, ArgKind::Imm, 0),
			instr(Op::ARG, ArgKind::Imm, 0, ArgKind::Imm, 0),
			instr(Op::RUIASNTH8, ArgKind::LocalVar, 0, ArgKind::Imm, 0),
			instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),
			instr(Op::RUIATOIA8, ArgKind::LocalVar, 1, ArgKind::Imm, 0),
			instr(Op::RET, ArgKind::Imm, 0, ArgKind::Imm, 0),
		];
		let machine = machine_with(vec![LinkedFunction { arg_count: 0, code }]);
		let result = start(&machine, 0, &[]).unwrap();
		let pair = result.as_object().unwrap().get();
		let ObjectPayload::Tuple(elems) = &pair.payload else { panic!("expected a unique pair") };
		let (shared_ptr, ty) = elems[0].read().unwrap();
		assert_eq!(ty, TupleElementType::Ref);
		let shared = unsafe { ObjectRef::from_raw(NonNull::new(shared_ptr as *mut Object).unwrap()) };
		let ObjectPayload::IArray8(bytes) = &shared.get().payload else { panic!("expected an iarray8") };
		assert_eq!(&**bytes, &[9, 0, 0]);
	}

	#[test]
	fn fun_eval_overrides_select_lazy_strategy() {
		let mut overrides = HashMap::new();
		overrides.insert(1u32, eval_strategy_for_test(eval_strategy::LAZY));
		let callee_code = vec![instr(Op::ILOAD, ArgKind::Imm, 42, ArgKind::Imm, 0), instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0), instr(Op::RET, ArgKind::Imm, 0, ArgKind::Imm, 0)];
		let entry_code = vec![
			instr(Op::RCALL, ArgKind::Imm, 1, ArgKind::Imm, 0),
			instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),
			instr(Op::RLOAD, ArgKind::LocalVar, 0, ArgKind::Imm, 0),
			instr(Op::RET, ArgKind::Imm, 0, ArgKind::Imm, 0),
		];
		let gc = Arc::new(TracingGc::new());
		let env = Environment {
			funs: vec![LinkedFunction { arg_count: 0, code: entry_code }, LinkedFunction { arg_count: 0, code: callee_code }],
			globals: Vec::new(),
			entry_fun: 0,
			fun_eval_overrides: overrides,
		};
		let machine = Machine::new(gc, env, Box::new(NoNativeFunctions), Box::new(DefaultEvaluationStrategy { default: Strategy::Eager }));
		let result = start(&machine, 0, &[]).unwrap();
		assert_eq!(result.tag(), ValueTag::LazyValueRef);
		let ctx = ThreadContext::new(machine.gc.clone(), 1024, 1024);
		let forced = force(&ctx, &machine, *result.as_object().unwrap()).unwrap();
		assert_eq!(forced.as_int(), Some(42));
	}

	fn eval_strategy_for_test(strategy: u32) -> (u32, u32) {
		crate::linker::eval_strategy_for(&RawFunctionInfo { fun_index: 1, eval_strategy: strategy, eval_strategy_mask: 0xff })
	}
}
