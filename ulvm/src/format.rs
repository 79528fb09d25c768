//! On-disk layout of a loadable image: the header, the per-section record
//! types, and the numeric tags that appear inside them. Everything here is
//! a direct transcription of the wire format; no validation or index
//! resolution happens in this module. [`crate::decode`] turns these records
//! into a validated [`crate::decode::Program`]; [`crate::linker`] turns a set
//! of `Program`s into a runnable `Environment`.
use std::io::Cursor;

use crate::utilities::{impl_from_be_byte_stream, FromByteStream};

pub const HEADER_MAGIC: [u8; 8] = [0x33, b'L', b'E', b'T', 0x77, b'I', b'N', 0xff];

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct HeaderFlags: u32 {
		/// The image defines no entry point and may only be linked as a dependency.
		const LIBRARY = 1 << 0;
		/// The image carries a relocation and symbol table that must be resolved at link time.
		const RELOCATABLE = 1 << 1;
		/// Native-function relocations name their target by symbol rather than by raw index.
		const SYMBOLIC_NATIVE_FUNS = 1 << 2;
		/// The image carries a `fun_info_count`-sized table of per-function evaluation strategy overrides.
		const FUN_INFOS = 1 << 3;
	}
}

impl FromByteStream for HeaderFlags {
	type Deps = ();
	#[inline]
	fn read(stream: &mut Cursor<&[u8]>, deps: &Self::Deps) -> std::io::Result<Self> {
		Ok(Self::from_bits_retain(u32::read(stream, deps)?))
	}
}

/// The fixed-size header every image opens with. `fun_info_count` only
/// exists on disk when [`HeaderFlags::FUN_INFOS`] is set; it is folded into
/// the trailing `reserved` words here and read out explicitly by the decoder
/// once `flags` is known.
#[derive(Debug, Clone, Copy)]
pub struct Header {
	pub magic: [u8; 8],
	pub flags: HeaderFlags,
	pub entry: u32,
	pub fun_count: u32,
	pub var_count: u32,
	pub code_size: u32,
	pub data_size: u32,
	pub reloc_count: u32,
	pub symbol_count: u32,
	pub reserved: [u32; 2],
}

impl_from_be_byte_stream!(Header {
	magic: [u8; 8],
	flags: HeaderFlags,
	entry: u32,
	fun_count: u32,
	var_count: u32,
	code_size: u32,
	data_size: u32,
	reloc_count: u32,
	symbol_count: u32,
	reserved: [u32; 2],
});

/// A function's entry in the function table: where its code starts, how
/// many arguments it takes, and how many instructions it spans.
#[derive(Debug, Clone, Copy)]
pub struct RawFunction {
	pub addr: u32,
	pub arg_count: u32,
	pub instr_count: u32,
}

impl_from_be_byte_stream!(RawFunction {
	addr: u32,
	arg_count: u32,
	instr_count: u32,
});

/// Wire tags shared by [`RawValue`], tuple element types, and runtime
/// [`crate::value::Value`] discriminants; see spec for the exact numbering.
pub mod value_type {
	pub const INT: i32 = 0;
	pub const FLOAT: i32 = 1;
	pub const REF: i32 = 2;
	pub const PAIR: i32 = 3;
	pub const CANCELED_REF: i32 = 4;
	pub const ERROR: i32 = 5;
	pub const LAZY_VALUE_REF: i32 = 6;
	pub const LOCKED_LAZY_VALUE_REF: i32 = 7;
	pub const LAZILY_CANCELED: i32 = 0x80;
}

/// A global variable slot. `type_` selects which union member of the
/// trailing 8 bytes is meaningful; only `INT`, `FLOAT`, and `REF` are legal
/// on disk (see [`crate::decode`]).
#[derive(Debug, Clone, Copy)]
pub struct RawValue {
	pub type_: i32,
	pub payload: u64,
}

impl FromByteStream for RawValue {
	type Deps = ();
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		let type_ = i32::read(stream, &())?;
		let _pad = u32::read(stream, &())?;
		let payload = u64::read(stream, &())?;
		Ok(Self { type_, payload })
	}
}

impl RawValue {
	#[inline]
	pub fn as_i64(&self) -> i64 {
		self.payload as i64
	}

	#[inline]
	pub fn as_f64(&self) -> f64 {
		f64::from_bits(self.payload)
	}

	#[inline]
	pub fn as_addr(&self) -> u64 {
		self.payload
	}
}

/// Operand-kind tag carried alongside each [`RawArgument`] word, decoded
/// from the high bits the original instruction set multiplexes into opcode
/// encoding; see [`crate::opcode`] for how an instruction's two arguments
/// pick their kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
	/// Signed immediate or IEEE-754 float word, depending on opcode.
	Imm,
	/// Index into the current frame's local-variable slots.
	LocalVar,
	/// Index into the current frame's argument slots.
	Arg,
	/// Index into the global-variable table.
	GlobalVar,
}

/// One operand of an [`RawInstruction`]. Like the C union this replaces,
/// which field is meaningful depends on the opcode and is not recoverable
/// from the bit pattern alone.
#[derive(Debug, Clone, Copy)]
pub struct RawArgument {
	pub bits: u32,
}

impl_from_be_byte_stream!(RawArgument { bits: u32 });

impl RawArgument {
	#[inline]
	pub fn as_i32(&self) -> i32 {
		self.bits as i32
	}

	#[inline]
	pub fn as_f32(&self) -> f32 {
		f32::from_bits(self.bits)
	}

	#[inline]
	pub fn as_index(&self) -> u32 {
		self.bits
	}
}

/// One bytecode instruction: a 32-bit opcode word and two operand words.
/// Decoded opcodes live in [`crate::opcode`]; this type only carries the
/// raw wire bits.
#[derive(Debug, Clone, Copy)]
pub struct RawInstruction {
	pub opcode: u32,
	pub arg1: RawArgument,
	pub arg2: RawArgument,
}

impl_from_be_byte_stream!(RawInstruction {
	opcode: u32,
	arg1: RawArgument,
	arg2: RawArgument,
});

pub mod object_type {
	pub const IARRAY8: i32 = 0;
	pub const IARRAY16: i32 = 1;
	pub const IARRAY32: i32 = 2;
	pub const IARRAY64: i32 = 3;
	pub const SFARRAY: i32 = 4;
	pub const DFARRAY: i32 = 5;
	pub const RARRAY: i32 = 6;
	pub const TUPLE: i32 = 7;
	pub const IO: i32 = 8;
	pub const LAZY_VALUE: i32 = 9;
	pub const NATIVE_OBJECT: i32 = 10;
	pub const UNIQUE: i32 = 0x40;
	pub const ERROR: i32 = -1;
}

/// Returns the on-disk element size, in bytes, for a data-section object of
/// the given base type (with the `UNIQUE` bit already masked off), or `None`
/// for a type the image is not allowed to carry in its data section.
pub fn object_elem_size(base_type: i32) -> Option<usize> {
	use object_type::*;
	match base_type {
		IARRAY8 => Some(1),
		IARRAY16 => Some(2),
		IARRAY32 => Some(4),
		IARRAY64 => Some(8),
		SFARRAY => Some(4),
		DFARRAY => Some(8),
		RARRAY => Some(4),
		TUPLE => Some(9),
		_ => None,
	}
}

pub mod reloc_type {
	pub const ARG1_FUN: u32 = 0;
	pub const ARG2_FUN: u32 = 1;
	pub const ARG1_VAR: u32 = 2;
	pub const ARG2_VAR: u32 = 3;
	pub const ELEM_FUN: u32 = 4;
	pub const VAR_FUN: u32 = 5;
	pub const ARG1_NATIVE_FUN: u32 = 6;
	pub const ARG2_NATIVE_FUN: u32 = 7;
	pub const ELEM_NATIVE_FUN: u32 = 8;
	pub const VAR_NATIVE_FUN: u32 = 9;
	pub const SYMBOLIC: u32 = 0x100;
}

/// A single relocation record: what kind of slot to rewrite (`type_`, masked
/// against [`reloc_type::SYMBOLIC`]), where it lives (`addr`, a code or data
/// offset depending on kind), and which symbol table entry supplies the
/// resolved value.
#[derive(Debug, Clone, Copy)]
pub struct RawRelocation {
	pub type_: u32,
	pub addr: u32,
	pub symbol: u32,
}

impl_from_be_byte_stream!(RawRelocation {
	type_: u32,
	addr: u32,
	symbol: u32,
});

pub mod symbol_type {
	pub const FUN: u8 = 0;
	pub const VAR: u8 = 1;
	pub const NATIVE_FUN: u8 = 2;
	pub const DEFINED: u8 = 0x10;
}

/// A symbol table entry. `name` is a variable-length, non-NUL-terminated
/// UTF-8 slice of `length` bytes immediately following the fixed fields;
/// see [`crate::decode`] for how the table is walked.
#[derive(Debug, Clone)]
pub struct RawSymbol {
	pub index: u32,
	pub length: u16,
	pub type_: u8,
	pub name: Box<str>,
}

pub mod eval_strategy {
	pub const EAGER: u32 = 0;
	pub const LAZY: u32 = 1;
	pub const MEMOIZED: u32 = 2;
	pub const MEMOIZED_LAZY: u32 = 3;
}

/// Per-function evaluation-strategy override, present only when
/// [`HeaderFlags::FUN_INFOS`] is set. `eval_strategy_mask` selects which
/// bits of `eval_strategy` override the function's default; a mask of
/// `0xff` (the default constructed by the original loader) takes the
/// strategy verbatim.
#[derive(Debug, Clone, Copy)]
pub struct RawFunctionInfo {
	pub fun_index: u32,
	pub eval_strategy: u32,
	pub eval_strategy_mask: u32,
}

impl_from_be_byte_stream!(RawFunctionInfo {
	fun_index: u32,
	eval_strategy: u32,
	eval_strategy_mask: u32,
});

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_flags_round_trip_bits() {
		let flags = HeaderFlags::RELOCATABLE | HeaderFlags::FUN_INFOS;
		assert!(flags.contains(HeaderFlags::RELOCATABLE));
		assert!(!flags.contains(HeaderFlags::LIBRARY));
	}

	#[test]
	fn object_elem_size_rejects_unsized_types() {
		assert_eq!(object_elem_size(object_type::IARRAY64), Some(8));
		assert_eq!(object_elem_size(object_type::IO), None);
		assert_eq!(object_elem_size(object_type::LAZY_VALUE), None);
	}
}
