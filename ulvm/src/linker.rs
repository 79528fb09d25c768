//! Combines one or more decoded [`Program`]s into a single runnable
//! [`Environment`]. Three stages, run in order over the whole set of
//! programs being linked together:
//!
//! - **Stage A** assigns each program's functions and global variables a
//!   contiguous slot in the environment-wide index space, and registers
//!   every `DEFINED` symbol in a name table, rejecting duplicates.
//! - **Stage B** resolves every relocation's symbol reference against that
//!   table.
//! - **Stage C** rewrites each relocation's target word (a code operand or a
//!   data-object `RARRAY`/tuple slot) from program-local index to
//!   environment-wide index.
//!
//! Exactly one non-library program may supply an entry point.
use std::collections::HashMap;

use crate::decode::Program;
use crate::error::LoadError;
use crate::format::{self, reloc_type, symbol_type, RawFunctionInfo};
use crate::gc::Allocator;
use crate::object::{ObjectKind, ObjectPayload, ObjectRef, TupleElement, TupleElementType};
use crate::value::Value;

/// The environment-wide index a function or global variable resolved to,
/// kept around so Stage C can translate program-local indices found in
/// relocations.
#[derive(Debug, Clone, Copy)]
struct SymbolTarget {
	index: u32,
}

#[derive(Default)]
struct SymbolTable {
	funs: HashMap<String, SymbolTarget>,
	vars: HashMap<String, SymbolTarget>,
	native_funs: HashMap<String, SymbolTarget>,
}

/// A linked, runnable environment: a flat function table, a flat global
/// variable table (backed by immortal heap objects for any `REF`-typed
/// variable), and per-function evaluation-strategy overrides.
pub struct Environment {
	pub funs: Vec<LinkedFunction>,
	pub globals: Vec<Value>,
	pub entry_fun: u32,
	pub fun_eval_overrides: HashMap<u32, (u32, u32)>,
}

pub struct LinkedFunction {
	pub arg_count: u32,
	pub code: Vec<crate::format::RawInstruction>,
}

/// Links a set of programs, in the order given, into one [`Environment`].
/// At most one program may define an entry point (the first non-library
/// program's `entry`, or any relocatable program explicitly marked as the
/// root); exactly one is required across the whole set.
pub fn link(programs: Vec<Program>, gc: &dyn Allocator) -> Result<Environment, LoadError> {
	let mut fun_base = Vec::with_capacity(programs.len());
	let mut var_base = Vec::with_capacity(programs.len());
	let mut symbols = SymbolTable::default();
	let mut next_fun = 0u32;
	let mut next_var = 0u32;

	// Stage A: index assignment + symbol registration.
	for program in &programs {
		fun_base.push(next_fun);
		var_base.push(next_var);
		next_fun += program.funs.len() as u32;
		next_var += program.vars.len() as u32;

		for symbol in &program.symbols {
			if symbol.type_ & symbol_type::DEFINED == 0 {
				continue;
			}
			let base = symbol.type_ & !symbol_type::DEFINED;
			let target = SymbolTarget { index: fun_base.last().copied().unwrap_or(0) + symbol.index };
			match base {
				symbol_type::FUN => {
					if symbols.funs.insert(symbol.name.to_string(), target).is_some() {
						return Err(LoadError::DuplicateFunctionSymbol { name: symbol.name.to_string() });
					}
				}
				symbol_type::VAR => {
					let target = SymbolTarget { index: var_base.last().copied().unwrap_or(0) + symbol.index };
					if symbols.vars.insert(symbol.name.to_string(), target).is_some() {
						return Err(LoadError::DuplicateVarSymbol { name: symbol.name.to_string() });
					}
				}
				symbol_type::NATIVE_FUN => {
					symbols.native_funs.insert(symbol.name.to_string(), SymbolTarget { index: symbol.index });
				}
				_ => return Err(LoadError::InvalidSymbolType { index: 0 }),
			}
		}
	}

	// Stage B + C: resolve and rewrite relocations, per program.
	let mut funs = Vec::with_capacity(next_fun as usize);
	let mut globals: Vec<Value> = Vec::with_capacity(next_var as usize);
	let mut fun_eval_overrides = HashMap::new();
	let mut entry_fun = None;

	for (program_index, program) in programs.into_iter().enumerate() {
		let this_fun_base = fun_base[program_index];
		let this_var_base = var_base[program_index];

		let mut code = program.code.clone();
		let mut data_relocs: HashMap<u32, u32> = HashMap::new();
		for reloc in &program.relocs {
			let resolved = resolve_reloc_target(reloc, &program, &symbols, this_fun_base, this_var_base)?;
			apply_relocation(&mut code, reloc, resolved);
			let base_type = reloc.type_ & !reloc_type::SYMBOLIC;
			if matches!(base_type, reloc_type::ELEM_FUN | reloc_type::VAR_FUN | reloc_type::ELEM_NATIVE_FUN | reloc_type::VAR_NATIVE_FUN) {
				data_relocs.insert(reloc.addr, resolved);
			}
		}

		for fun in &program.funs {
			funs.push(LinkedFunction {
				arg_count: fun.arg_count,
				code: code[fun.addr as usize..fun.addr as usize + fun.instr_count as usize].to_vec(),
			});
		}

		for info in &program.fun_infos {
			fun_eval_overrides.insert(this_fun_base + info.fun_index, (info.eval_strategy, info.eval_strategy_mask));
		}

		let data_objects = build_data_objects(&program, gc, &data_relocs)?;
		for var in &program.vars {
			let value = match var.type_ {
				format::value_type::INT => Value::int(var.as_i64()),
				format::value_type::FLOAT => Value::float(var.as_f64()),
				format::value_type::REF => {
					let object = data_objects
						.get(&(var.as_addr() as u32))
						.copied()
						.ok_or(LoadError::DanglingGlobalVarRef)?;
					Value::reference(object)
				}
				_ => return Err(LoadError::InvalidGlobalVarType { index: 0 }),
			};
			globals.push(value);
		}

		if !program.is_library() {
			if entry_fun.is_some() {
				return Err(LoadError::MultipleEntryPoints);
			}
			entry_fun = Some(this_fun_base + program.entry);
		}
	}

	let entry_fun = entry_fun.ok_or(LoadError::NoEntryPoint)?;
	Ok(Environment { funs, globals, entry_fun, fun_eval_overrides })
}

fn resolve_reloc_target(
	reloc: &crate::format::RawRelocation,
	program: &Program,
	symbols: &SymbolTable,
	fun_base: u32,
	var_base: u32,
) -> Result<u32, LoadError> {
	let base_type = reloc.type_ & !reloc_type::SYMBOLIC;
	let symbolic = reloc.type_ & reloc_type::SYMBOLIC != 0;
	if symbolic {
		let symbol = program
			.symbols
			.get(reloc.symbol as usize)
			.ok_or(LoadError::UnresolvedSymbol { index: reloc.symbol as usize })?;
		let table = match base_type {
			reloc_type::ARG1_NATIVE_FUN | reloc_type::ARG2_NATIVE_FUN | reloc_type::ELEM_NATIVE_FUN | reloc_type::VAR_NATIVE_FUN => {
				&symbols.native_funs
			}
			reloc_type::ARG1_FUN | reloc_type::ARG2_FUN | reloc_type::ELEM_FUN | reloc_type::VAR_FUN => &symbols.funs,
			reloc_type::ARG1_VAR | reloc_type::ARG2_VAR => &symbols.vars,
			_ => return Err(LoadError::InvalidRelocationType { index: 0 }),
		};
		table
			.get(symbol.name.as_ref())
			.map(|t| t.index)
			.ok_or(LoadError::UnresolvedSymbol { index: reloc.symbol as usize })
	} else {
		Ok(match base_type {
			reloc_type::ARG1_FUN | reloc_type::ARG2_FUN | reloc_type::ELEM_FUN | reloc_type::VAR_FUN => fun_base + reloc.symbol,
			reloc_type::ARG1_VAR | reloc_type::ARG2_VAR => var_base + reloc.symbol,
			_ => return Err(LoadError::InvalidRelocationType { index: 0 }),
		})
	}
}

fn apply_relocation(code: &mut [crate::format::RawInstruction], reloc: &crate::format::RawRelocation, resolved: u32) {
	let base_type = reloc.type_ & !reloc_type::SYMBOLIC;
	let addr = reloc.addr as usize;
	match base_type {
		reloc_type::ARG1_FUN | reloc_type::ARG1_VAR | reloc_type::ARG1_NATIVE_FUN => {
			if let Some(instr) = code.get_mut(addr) {
				instr.arg1.bits = resolved;
			}
		}
		reloc_type::ARG2_FUN | reloc_type::ARG2_VAR | reloc_type::ARG2_NATIVE_FUN => {
			if let Some(instr) = code.get_mut(addr) {
				instr.arg2.bits = resolved;
			}
		}
		// ELEM_FUN / VAR_FUN / their *_NATIVE_FUN variants target the data
		// section rather than code; the data-object rewrite happens while
		// building heap objects in `build_data_objects`, keyed by `addr`.
		_ => {}
	}
}

/// Looks up whatever relocation targets the data cell at `offset + 8 +
/// idx * cell_size` (the payload's `idx`-th `cell_size`-byte int cell),
/// falling back to the cell's own decoded value when no `ELEM_FUN`/`VAR_FUN`
/// relocation rewrites it.
fn data_cell(data_relocs: &HashMap<u32, u32>, offset: u32, idx: usize, cell_size: u32, decoded: i64) -> i64 {
	let addr = offset + 8 + idx as u32 * cell_size;
	data_relocs.get(&addr).map(|&resolved| resolved as i64).unwrap_or(decoded)
}

fn build_data_objects(program: &Program, gc: &dyn Allocator, data_relocs: &HashMap<u32, u32>) -> Result<HashMap<u32, ObjectRef>, LoadError> {
	let mut built = HashMap::new();
	for data in &program.data {
		let kind = ObjectKind::from_base_type(data.type_ & !format::object_type::UNIQUE).ok_or(LoadError::InvalidObjectType {
			offset: data.offset as usize,
		})?;
		let unique = data.type_ & format::object_type::UNIQUE != 0;
		let payload = match kind {
			ObjectKind::IArray8 => ObjectPayload::IArray8(data.ints.iter().map(|&i| i as i8).collect()),
			ObjectKind::IArray16 => ObjectPayload::IArray16(data.ints.iter().map(|&i| i as i16).collect()),
			ObjectKind::IArray32 => ObjectPayload::IArray32(
				data.ints.iter().enumerate().map(|(idx, &i)| data_cell(data_relocs, data.offset, idx, 4, i) as i32).collect(),
			),
			ObjectKind::IArray64 => ObjectPayload::IArray64(
				data.ints.iter().enumerate().map(|(idx, &i)| data_cell(data_relocs, data.offset, idx, 8, i)).collect(),
			),
			ObjectKind::SfArray => ObjectPayload::SfArray(data.floats.iter().map(|&f| f as f32).collect()),
			ObjectKind::DfArray => ObjectPayload::DfArray(data.floats.clone().into_boxed_slice()),
			ObjectKind::RArray => {
				let slots: Box<[crate::object::RefSlot]> = (0..data.refs.len()).map(|_| crate::object::RefSlot::new_unset()).collect();
				ObjectPayload::RArray(slots)
			}
			ObjectKind::Tuple => {
				let elems: Box<[TupleElement]> = (0..data.length as usize).map(|_| TupleElement::new_unset()).collect();
				for (slot, elem) in elems.iter().enumerate() {
					let ty = data.tuple_elem_types[slot];
					match ty as i32 {
						format::value_type::INT => {
							let value = data_cell(data_relocs, data.offset, slot, 8, data.ints[slot]);
							elem.publish(value as u64, TupleElementType::Int)
						}
						format::value_type::FLOAT => elem.publish(data.ints[slot] as u64, TupleElementType::Float),
						// REF slots are left unset here; a tuple element may point
						// forward to an object later in the same data section, so
						// resolution happens in the second pass below.
						format::value_type::REF => {}
						_ => return Err(LoadError::InvalidTupleElementType { offset: data.offset as usize, slot }),
					}
				}
				ObjectPayload::Tuple(elems)
			}
			ObjectKind::Io | ObjectKind::LazyValue | ObjectKind::NativeObject => {
				return Err(LoadError::InvalidObjectType { offset: data.offset as usize })
			}
		};
		let object = gc.new_immortal_object(kind, payload, unique);
		built.insert(data.offset, object);
	}

	// Second pass: every object in this data section now has a known
	// address, so resolve RARRAY slots and tuple REF slots into live
	// `ObjectRef`s.
	for data in &program.data {
		let Some(object) = built.get(&data.offset).copied() else { continue };
		match &object.get().payload {
			ObjectPayload::RArray(slots) => {
				for (slot, &target_offset) in slots.iter().zip(data.refs.iter()) {
					let target = built.get(&target_offset).copied().ok_or(LoadError::DanglingGlobalVarRef)?;
					unsafe { slot.publish(target) };
				}
			}
			ObjectPayload::Tuple(elems) => {
				for (slot, elem) in elems.iter().enumerate() {
					if data.tuple_elem_types[slot] as i32 != format::value_type::REF {
						continue;
					}
					let target_offset = data.ints[slot] as u64 as u32;
					let target = built.get(&target_offset).copied().ok_or(LoadError::DanglingGlobalVarRef)?;
					elem.publish(target.as_ptr() as u64, TupleElementType::Ref);
				}
			}
			_ => {}
		}
	}

	Ok(built)
}

/// Translates a `format::RawFunctionInfo`'s evaluation-strategy override
/// into the runtime bits [`crate::interp`] consults per call. Exposed for
/// tests that build a linker fixture without going through a full decode.
pub fn eval_strategy_for(info: &RawFunctionInfo) -> (u32, u32) {
	(info.eval_strategy, info.eval_strategy_mask)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gc::TracingGc;

	#[test]
	fn links_single_entry_program() {
		let gc = TracingGc::new();
		let program = Program {
			flags: format::HeaderFlags::empty(),
			entry: 0,
			funs: vec![crate::format::RawFunction { addr: 0, arg_count: 0, instr_count: 0 }],
			vars: Vec::new(),
			code: Vec::new(),
			data: Vec::new(),
			relocs: Vec::new(),
			symbols: Vec::new(),
			fun_infos: Vec::new(),
		};
		let env = link(vec![program], &gc).unwrap();
		assert_eq!(env.entry_fun, 0);
		assert_eq!(env.funs.len(), 1);
	}

	#[test]
	fn var_fun_relocation_rewrites_a_function_index_embedded_in_data() {
		// The library contributes one function, so `main`'s own functions are
		// offset by 1 in the linked environment. `main` stores its own local
		// function index (0) inside an IARRAY64 data cell and relies on a
		// VAR_FUN relocation to rewrite it to the linked index (1) — if that
		// rewrite were silently dropped, the embedded cell would keep the
		// stale local index.
		let gc = TracingGc::new();
		let lib = Program {
			flags: format::HeaderFlags::LIBRARY,
			entry: 0,
			funs: vec![crate::format::RawFunction { addr: 0, arg_count: 0, instr_count: 0 }],
			vars: Vec::new(),
			code: Vec::new(),
			data: Vec::new(),
			relocs: Vec::new(),
			symbols: vec![crate::format::RawSymbol { index: 0, length: 5, type_: symbol_type::FUN | symbol_type::DEFINED, name: "dummy".into() }],
			fun_infos: Vec::new(),
		};
		let main = Program {
			flags: format::HeaderFlags::empty(),
			entry: 0,
			funs: vec![crate::format::RawFunction { addr: 0, arg_count: 0, instr_count: 0 }],
			vars: vec![crate::format::RawValue { type_: format::value_type::REF, payload: 0 }],
			code: Vec::new(),
			data: vec![crate::decode::DataObject {
				offset: 0,
				type_: format::object_type::IARRAY64,
				length: 1,
				ints: vec![0], // local function index 0, to be rewritten
				floats: Vec::new(),
				refs: Vec::new(),
				tuple_elem_types: Vec::new(),
			}],
			relocs: vec![crate::format::RawRelocation { type_: reloc_type::VAR_FUN, addr: 8, symbol: 0 }],
			symbols: Vec::new(),
			fun_infos: Vec::new(),
		};

		let env = link(vec![lib, main], &gc).unwrap();
		let ObjectPayload::IArray64(values) = &env.globals[0].as_object().unwrap().get().payload else {
			panic!("expected an iarray64 global")
		};
		assert_eq!(&**values, &[1]);
	}

	#[test]
	fn rejects_two_entry_points() {
		let gc = TracingGc::new();
		let make = || Program {
			flags: format::HeaderFlags::empty(),
			entry: 0,
			funs: vec![crate::format::RawFunction { addr: 0, arg_count: 0, instr_count: 0 }],
			vars: Vec::new(),
			code: Vec::new(),
			data: Vec::new(),
			relocs: Vec::new(),
			symbols: Vec::new(),
			fun_infos: Vec::new(),
		};
		let result = link(vec![make(), make()], &gc);
		assert_eq!(result.err(), Some(LoadError::MultipleEntryPoints));
	}
}
