//! Linking a library image (one exported function) against a main image
//! that calls it by symbol, in both link orders, to check that Stage A's
//! full-symbol-table-first pass makes resolution independent of which
//! `Program` comes first in the `Vec` handed to `link`.
mod common;

use common::instr;
use std::sync::Arc;
use ulvm::decode::{DataObject, Program};
use ulvm::format::{reloc_type, symbol_type, ArgKind, HeaderFlags, RawFunction, RawRelocation, RawSymbol};
use ulvm::gc::TracingGc;
use ulvm::interp::{start, DefaultEvaluationStrategy, Machine, Strategy};
use ulvm::linker::link;
use ulvm::native::NoNativeFunctions;
use ulvm::opcode::Op;

fn library_program() -> Program {
	// fn double(a) = let x = a * 2 in x
	let code = vec![
		instr(Op::IMUL, ArgKind::Arg, 0, ArgKind::Imm, 2),
		instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),
		instr(Op::ILOAD, ArgKind::LocalVar, 0, ArgKind::Imm, 0),
		instr(Op::RET, ArgKind::Imm, 0, ArgKind::Imm, 0),
	];
	Program {
		flags: HeaderFlags::LIBRARY,
		entry: 0,
		funs: vec![RawFunction { addr: 0, arg_count: 1, instr_count: code.len() as u32 }],
		vars: Vec::new(),
		code,
		data: Vec::<DataObject>::new(),
		relocs: Vec::new(),
		symbols: vec![RawSymbol { index: 0, length: 6, type_: symbol_type::FUN | symbol_type::DEFINED, name: "double".into() }],
		fun_infos: Vec::new(),
	}
}

fn main_program() -> Program {
	// fn entry() = arg 21; icall <double>; ret
	let code = vec![
		instr(Op::ILOAD, ArgKind::Imm, 21, ArgKind::Imm, 0),
		instr(Op::ARG, ArgKind::Imm, 0, ArgKind::Imm, 0),
		instr(Op::ICALL, ArgKind::Imm, 0, ArgKind::Imm, 0), // arg1 relocated to `double`'s linked index
		instr(Op::LET, ArgKind::Imm, 0, ArgKind::Imm, 0),
		instr(Op::ILOAD, ArgKind::LocalVar, 0, ArgKind::Imm, 0),
		instr(Op::RET, ArgKind::Imm, 0, ArgKind::Imm, 0),
	];
	Program {
		flags: HeaderFlags::empty(),
		entry: 0,
		funs: vec![RawFunction { addr: 0, arg_count: 0, instr_count: code.len() as u32 }],
		vars: Vec::new(),
		code,
		data: Vec::<DataObject>::new(),
		relocs: vec![RawRelocation { type_: reloc_type::ARG1_FUN | reloc_type::SYMBOLIC, addr: 2, symbol: 0 }],
		symbols: vec![RawSymbol { index: 0, length: 6, type_: symbol_type::FUN, name: "double".into() }],
		fun_infos: Vec::new(),
	}
}

fn run_linked(programs: Vec<Program>) -> i64 {
	let gc = Arc::new(TracingGc::new());
	let env = link(programs, gc.as_ref()).unwrap();
	let machine = Machine::new(gc, env, Box::new(NoNativeFunctions), Box::new(DefaultEvaluationStrategy { default: Strategy::Eager }));
	let entry = machine.env.entry_fun;
	start(&machine, entry, &[]).unwrap().as_int().unwrap()
}

#[test]
fn library_first_resolves_symbolic_call() {
	assert_eq!(run_linked(vec![library_program(), main_program()]), 42);
}

#[test]
fn main_first_resolves_symbolic_call_identically() {
	// Stage A registers every program's symbols before Stage B/C resolve
	// any relocation, so swapping the order must not change the result.
	assert_eq!(run_linked(vec![main_program(), library_program()]), 42);
}

#[test]
fn two_entry_points_are_rejected() {
	let gc = TracingGc::new();
	let result = link(vec![library_program(), main_program(), main_program()], &gc);
	assert_eq!(result.err(), Some(ulvm::error::LoadError::MultipleEntryPoints));
}
