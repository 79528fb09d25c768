//! The unique-object discipline end to end: fill, write-in-place, and
//! convert-to-shared all thread the same linear handle through, and any
//! second read of an already-moved-from local variable faults instead of
//! silently aliasing the (possibly already freed) original.
mod common;

use common::{instr, machine};
use ulvm::format::ArgKind;
use ulvm::interp::{start, Strategy};
use ulvm::linker::LinkedFunction;
use ulvm::native::NoNativeFunctions;
use ulvm::object::{ObjectPayload, TupleElementType};
use ulvm::opcode::Op;
use ulvm::ErrorCode;

#[test]
fn fill_write_then_convert_round_trips_through_the_unique_handle() {
	// fn entry():
	//   let a = ruiafill64 2 7        -- unique [7, 7]
	//   arg 9
	//   let b = ruiasnth64 a 0        -- write index 0 <- 9, consumes `a`
	//   ruiatoia64 b                  -- convert to shared, consumes `b`
	let code = vec![
		instr(Op::RUIAFILL64, ArgKind::Imm, 2, ArgKind::Imm, 7),
		instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),
		instr(Op::ILOAD, ArgKind::Imm, 9, ArgKind::Imm, 0),
		instr(Op::ARG, ArgKind::Imm, 0, ArgKind::Imm, 0),
		instr(Op::RUIASNTH64, ArgKind::LocalVar, 0, ArgKind::Imm, 0),
		instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),
		instr(Op::RUIATOIA64, ArgKind::LocalVar, 1, ArgKind::Imm, 0),
		instr(Op::RET, ArgKind::Imm, 0, ArgKind::Imm, 0),
	];
	let m = machine(vec![LinkedFunction { arg_count: 0, code }], Strategy::Eager, Box::new(NoNativeFunctions));
	let result = start(&m, 0, &[]).unwrap();

	let pair = result.as_object().unwrap().get();
	let ObjectPayload::Tuple(elems) = &pair.payload else { panic!("expected a unique pair") };
	let (shared_ptr, ty) = elems[0].read().unwrap();
	assert_eq!(ty, TupleElementType::Ref);
	let shared = unsafe { ulvm::object::ObjectRef::from_raw(std::ptr::NonNull::new(shared_ptr as *mut ulvm::object::Object).unwrap()) };
	let ObjectPayload::IArray64(values) = &shared.get().payload else { panic!("expected an iarray64") };
	assert_eq!(&**values, &[9, 7]);
}

#[test]
fn reusing_an_already_moved_local_var_faults() {
	// fn entry():
	//   let a = ruiafill64 2 7
	//   let _ = ruianth64 a 0     -- first read moves `a`
	//   ruianth64 a 0             -- second read of the same slot must fault
	let code = vec![
		instr(Op::RUIAFILL64, ArgKind::Imm, 2, ArgKind::Imm, 7),
		instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),
		instr(Op::RUIANTH64, ArgKind::LocalVar, 0, ArgKind::Imm, 0),
		instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),
		instr(Op::RUIANTH64, ArgKind::LocalVar, 0, ArgKind::Imm, 0),
		instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),
		instr(Op::RET, ArgKind::Imm, 0, ArgKind::Imm, 0),
	];
	let m = machine(vec![LinkedFunction { arg_count: 0, code }], Strategy::Eager, Box::new(NoNativeFunctions));
	let result = start(&m, 0, &[]);
	assert_eq!(result, Err(ErrorCode::AgainUsedUnique));
}
