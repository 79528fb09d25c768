//! Turns the raw bytes of a loadable image into a validated, immutable
//! [`Program`]. This is a straight generalization of the original loader's
//! single linear decode pass: read the header, then walk each section in
//! order, checking every size computation for overflow and every function
//! address, tuple element type, and global-variable target for validity
//! before the section is trusted. Nothing here resolves symbols or rewrites
//! relocations — that is [`crate::linker`]'s job.
use std::collections::HashSet;
use std::io::Cursor;

use crate::error::LoadError;
use crate::format::{
	self, object_type, value_type, Header, HeaderFlags, RawFunction, RawFunctionInfo, RawInstruction, RawRelocation,
	RawSymbol, RawValue,
};
use crate::utilities::{round_to_multiple_of, FromByteStream};

/// A single data-section object as decoded off the wire: its type, and the
/// raw payload bytes (already byte-swapped to host order) that
/// [`crate::linker`] will turn into heap objects.
#[derive(Debug, Clone)]
pub struct DataObject {
	pub offset: u32,
	pub type_: i32,
	pub length: u32,
	pub ints: Vec<i64>,
	pub floats: Vec<f64>,
	pub refs: Vec<u32>,
	pub tuple_elem_types: Vec<i8>,
}

/// A validated, not-yet-linked image. Every field has already been checked
/// for internal consistency (sizes fit, addresses are in range, types are
/// legal); what remains is cross-image symbol resolution.
#[derive(Debug, Clone)]
pub struct Program {
	pub flags: HeaderFlags,
	pub entry: u32,
	pub funs: Vec<RawFunction>,
	pub vars: Vec<RawValue>,
	pub code: Vec<RawInstruction>,
	pub data: Vec<DataObject>,
	pub relocs: Vec<RawRelocation>,
	pub symbols: Vec<RawSymbol>,
	pub fun_infos: Vec<RawFunctionInfo>,
}

impl Program {
	pub fn is_library(&self) -> bool {
		self.flags.contains(HeaderFlags::LIBRARY)
	}

	pub fn is_relocatable(&self) -> bool {
		self.flags.contains(HeaderFlags::RELOCATABLE)
	}
}

/// Decodes and validates a complete image. `bytes` is the raw file content;
/// big-endian multi-byte fields are normalized to host order exactly once,
/// here.
pub fn decode(bytes: &[u8]) -> Result<Program, LoadError> {
	let mut cursor = Cursor::new(bytes);
	let header = Header::read(&mut cursor, &())?;
	if header.magic != format::HEADER_MAGIC {
		return Err(LoadError::BadMagic);
	}
	advance_past_padding(&mut cursor, std::mem::size_of::<Header>())?;

	let funs = decode_funs(&mut cursor, header.fun_count as usize, header.code_size as usize)?;
	let vars_and_addrs = decode_vars(&mut cursor, header.var_count as usize)?;
	let (vars, mut var_addrs) = vars_and_addrs;
	let code = decode_code(&mut cursor, header.code_size as usize)?;
	let data = decode_data(&mut cursor, header.data_size as usize, &mut var_addrs)?;
	if !var_addrs.is_empty() {
		return Err(LoadError::DanglingGlobalVarRef);
	}

	let (relocs, symbols) = if header.flags.contains(HeaderFlags::RELOCATABLE) {
		let relocs = decode_relocs(&mut cursor, header.reloc_count as usize, header.flags)?;
		let symbols = decode_symbols(&mut cursor, header.symbol_count as usize, header.flags, &relocs)?;
		(relocs, symbols)
	} else {
		(Vec::new(), Vec::new())
	};

	let fun_infos = if header.flags.contains(HeaderFlags::FUN_INFOS) {
		decode_fun_infos(&mut cursor, header.reserved[0] as usize, funs.len())?
	} else {
		Vec::new()
	};

	Ok(Program {
		flags: header.flags,
		entry: header.entry,
		funs,
		vars,
		code,
		data,
		relocs,
		symbols,
		fun_infos,
	})
}

fn advance_past_padding(cursor: &mut Cursor<&[u8]>, raw_size: usize) -> Result<(), LoadError> {
	let padded = round_to_multiple_of::<8>(raw_size);
	let pad = padded.checked_sub(raw_size).ok_or(LoadError::SectionOverflow { section: "header" })?;
	cursor.set_position(cursor.position() + pad as u64);
	Ok(())
}

fn decode_funs(cursor: &mut Cursor<&[u8]>, count: usize, code_size: usize) -> Result<Vec<RawFunction>, LoadError> {
	let mut funs = Vec::with_capacity(count);
	for i in 0..count {
		let fun = RawFunction::read(cursor, &())?;
		let end = (fun.addr as usize)
			.checked_add(fun.instr_count as usize)
			.ok_or(LoadError::SectionOverflow { section: "funs" })?;
		if (fun.addr as usize) > code_size || end > code_size {
			return Err(LoadError::InvalidFunction { index: i });
		}
		funs.push(fun);
	}
	advance_past_padding_for(cursor, count * std::mem::size_of::<RawFunction>())?;
	Ok(funs)
}

fn advance_past_padding_for(cursor: &mut Cursor<&[u8]>, raw_size: usize) -> Result<(), LoadError> {
	advance_past_padding(cursor, raw_size)
}

fn decode_vars(cursor: &mut Cursor<&[u8]>, count: usize) -> Result<(Vec<RawValue>, HashSet<u32>), LoadError> {
	let mut vars = Vec::with_capacity(count);
	let mut addrs = HashSet::new();
	for i in 0..count {
		let var = RawValue::read(cursor, &())?;
		if var.type_ != value_type::INT && var.type_ != value_type::FLOAT && var.type_ != value_type::REF {
			return Err(LoadError::InvalidGlobalVarType { index: i });
		}
		if var.type_ == value_type::REF {
			addrs.insert(var.as_addr() as u32);
		}
		vars.push(var);
	}
	advance_past_padding_for(cursor, count * std::mem::size_of::<RawValue>())?;
	Ok((vars, addrs))
}

fn decode_code(cursor: &mut Cursor<&[u8]>, count: usize) -> Result<Vec<RawInstruction>, LoadError> {
	let mut code = Vec::with_capacity(count);
	for _ in 0..count {
		code.push(RawInstruction::read(cursor, &())?);
	}
	advance_past_padding_for(cursor, count * std::mem::size_of::<RawInstruction>())?;
	Ok(code)
}

fn decode_data(cursor: &mut Cursor<&[u8]>, data_size: usize, var_addrs: &mut HashSet<u32>) -> Result<Vec<DataObject>, LoadError> {
	let mut objects = Vec::new();
	let mut offset = 0usize;
	while offset < data_size {
		var_addrs.remove(&(offset as u32));
		let type_ = i32::read(cursor, &())?;
		let length = u32::read(cursor, &())?;
		let elem_size = format::object_elem_size(type_ & !object_type::UNIQUE).ok_or(LoadError::InvalidObjectType { offset })?;
		let payload_size = (length as usize)
			.checked_mul(elem_size)
			.ok_or(LoadError::SectionOverflow { section: "data" })?;
		let end = offset
			.checked_add(8)
			.and_then(|v| v.checked_add(payload_size))
			.ok_or(LoadError::SectionOverflow { section: "data" })?;
		if end > data_size {
			return Err(LoadError::SectionOutOfBounds { section: "data" });
		}

		let base_type = type_ & !object_type::UNIQUE;
		let mut ints = Vec::new();
		let mut floats = Vec::new();
		let mut refs = Vec::new();
		let mut tuple_elem_types = Vec::new();
		match base_type {
			object_type::IARRAY8 => {
				for _ in 0..length {
					ints.push(i8::read(cursor, &())? as i64);
				}
			}
			object_type::IARRAY16 => {
				for _ in 0..length {
					ints.push(i16::read(cursor, &())? as i64);
				}
			}
			object_type::IARRAY32 => {
				for _ in 0..length {
					ints.push(i32::read(cursor, &())? as i64);
				}
			}
			object_type::IARRAY64 => {
				for _ in 0..length {
					ints.push(i64::read(cursor, &())?);
				}
			}
			object_type::SFARRAY => {
				for _ in 0..length {
					floats.push(f32::read(cursor, &())? as f64);
				}
			}
			object_type::DFARRAY => {
				for _ in 0..length {
					floats.push(f64::read(cursor, &())?);
				}
			}
			object_type::RARRAY => {
				for _ in 0..length {
					refs.push(u32::read(cursor, &())?);
				}
			}
			object_type::TUPLE => {
				for _ in 0..length {
					ints.push(i64::read(cursor, &())?);
				}
				for slot in 0..length {
					let ty = i8::read(cursor, &())?;
					if ty as i32 != value_type::INT && ty as i32 != value_type::FLOAT && ty as i32 != value_type::REF {
						return Err(LoadError::InvalidTupleElementType { offset, slot: slot as usize });
					}
					tuple_elem_types.push(ty);
				}
			}
			_ => return Err(LoadError::InvalidObjectType { offset }),
		}

		objects.push(DataObject { offset: offset as u32, type_, length, ints, floats, refs, tuple_elem_types });
		offset = round_to_multiple_of::<8>(end);
	}
	Ok(objects)
}

fn decode_relocs(cursor: &mut Cursor<&[u8]>, count: usize, flags: HeaderFlags) -> Result<Vec<RawRelocation>, LoadError> {
	let mut relocs = Vec::with_capacity(count);
	for i in 0..count {
		let reloc = RawRelocation::read(cursor, &())?;
		let base = reloc.type_ & !format::reloc_type::SYMBOLIC;
		let is_native = matches!(
			base,
			format::reloc_type::ARG1_NATIVE_FUN | format::reloc_type::ARG2_NATIVE_FUN | format::reloc_type::ELEM_NATIVE_FUN | format::reloc_type::VAR_NATIVE_FUN
		);
		let is_plain = matches!(
			base,
			format::reloc_type::ARG1_FUN
				| format::reloc_type::ARG2_FUN
				| format::reloc_type::ARG1_VAR
				| format::reloc_type::ARG2_VAR
				| format::reloc_type::ELEM_FUN
				| format::reloc_type::VAR_FUN
		);
		if is_native && !flags.contains(HeaderFlags::SYMBOLIC_NATIVE_FUNS) {
			return Err(LoadError::InvalidRelocationType { index: i });
		}
		if !is_native && !is_plain {
			return Err(LoadError::InvalidRelocationType { index: i });
		}
		relocs.push(reloc);
	}
	advance_past_padding_for(cursor, count * std::mem::size_of::<RawRelocation>())?;
	Ok(relocs)
}

fn decode_symbols(
	cursor: &mut Cursor<&[u8]>,
	count: usize,
	flags: HeaderFlags,
	relocs: &[RawRelocation],
) -> Result<Vec<RawSymbol>, LoadError> {
	let referenced: HashSet<u32> = relocs
		.iter()
		.filter(|r| r.type_ & format::reloc_type::SYMBOLIC != 0)
		.map(|r| r.symbol)
		.collect();

	let mut symbols = Vec::with_capacity(count);
	for i in 0..count {
		let index = u32::read(cursor, &())?;
		let length = u16::read(cursor, &())?;
		let type_ = u8::read(cursor, &())?;
		let base = type_ & !format::symbol_type::DEFINED;
		let is_native = base == format::symbol_type::NATIVE_FUN;
		if is_native && !flags.contains(HeaderFlags::SYMBOLIC_NATIVE_FUNS) {
			return Err(LoadError::InvalidSymbolType { index: i });
		}
		if base != format::symbol_type::FUN && base != format::symbol_type::VAR && !is_native {
			return Err(LoadError::InvalidSymbolType { index: i });
		}
		let mut name_bytes = vec![0u8; length as usize];
		std::io::Read::read_exact(cursor, &mut name_bytes)?;
		let name = String::from_utf8(name_bytes).map_err(|_| LoadError::InvalidSymbolType { index: i })?.into_boxed_str();
		symbols.push(RawSymbol { index, length, type_, name });

		let symbol_size = 4 + 2 + 1 + length as usize;
		let aligned = if i + 1 < count { round_to_multiple_of::<8>(symbol_size) } else { symbol_size };
		let pad = aligned - symbol_size;
		cursor.set_position(cursor.position() + pad as u64);
	}
	if !referenced.is_subset(&(0..count as u32).collect()) {
		return Err(LoadError::UnresolvedSymbol { index: 0 });
	}
	Ok(symbols)
}

fn decode_fun_infos(cursor: &mut Cursor<&[u8]>, count: usize, fun_count: usize) -> Result<Vec<RawFunctionInfo>, LoadError> {
	let mut infos = Vec::with_capacity(count);
	for _ in 0..count {
		let info = RawFunctionInfo::read(cursor, &())?;
		if info.fun_index as usize >= fun_count {
			return Err(LoadError::InvalidFunction { index: info.fun_index as usize });
		}
		infos.push(info);
	}
	advance_past_padding_for(cursor, count * std::mem::size_of::<RawFunctionInfo>())?;
	Ok(infos)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn minimal_header(flags: HeaderFlags, entry: u32) -> Vec<u8> {
		let mut bytes = Vec::new();
		bytes.extend_from_slice(&format::HEADER_MAGIC);
		bytes.extend_from_slice(&flags.bits().to_be_bytes());
		bytes.extend_from_slice(&entry.to_be_bytes());
		bytes.extend_from_slice(&0u32.to_be_bytes()); // fun_count
		bytes.extend_from_slice(&0u32.to_be_bytes()); // var_count
		bytes.extend_from_slice(&0u32.to_be_bytes()); // code_size
		bytes.extend_from_slice(&0u32.to_be_bytes()); // data_size
		bytes.extend_from_slice(&0u32.to_be_bytes()); // reloc_count
		bytes.extend_from_slice(&0u32.to_be_bytes()); // symbol_count
		bytes.extend_from_slice(&0u32.to_be_bytes());
		bytes.extend_from_slice(&0u32.to_be_bytes());
		bytes
	}

	#[test]
	fn decodes_empty_library_image() {
		let bytes = minimal_header(HeaderFlags::LIBRARY, 0);
		let program = decode(&bytes).unwrap();
		assert!(program.is_library());
		assert!(program.funs.is_empty());
	}

	#[test]
	fn rejects_bad_magic() {
		let mut bytes = minimal_header(HeaderFlags::LIBRARY, 0);
		bytes[0] = 0;
		assert_eq!(decode(&bytes), Err(LoadError::BadMagic));
	}
}
