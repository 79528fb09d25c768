//! The instruction set: the base operation an instruction word names, and
//! the operand-kind bits the assembler packs alongside it. An instruction's
//! 32-bit opcode field is never just `Op as u32` on disk — bits 16-17 and
//! 18-19 carry [`ArgKind`] for each operand, matching the format's "operand
//! types encoded in opcode" convention described alongside the instruction
//! catalog. [`decode_opcode`] is the single place that splits a raw opcode
//! word back into `(Op, ArgKind, ArgKind)`.
use ulvm_derive::FromRepr;

use crate::format::ArgKind;

macro_rules! define_opcodes {
	($($name: ident = $value: literal),* $(,)?) => {
		/// A decoded base operation, independent of its operands' kinds.
		#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq, Hash)]
		#[repr(u16)]
		pub enum Op {
			$($name = $value),*
		}

		impl Op {
			pub const fn name(self) -> &'static str {
				match self {
					$(Self::$name => stringify!($name)),*
				}
			}
		}
	};
}

define_opcodes! {
	// Integer arithmetic and comparisons.
	ILOAD = 0, ILOAD2 = 1, INEG = 2, IADD = 3, ISUB = 4, IMUL = 5, IDIV = 6, IMOD = 7,
	INOT = 8, IAND = 9, IOR = 10, IXOR = 11, ISHL = 12, ISHR = 13, ISHRU = 14,
	IEQ = 15, INE = 16, ILT = 17, IGE = 18, IGT = 19, ILE = 20,

	// Float arithmetic and comparisons.
	FLOAD = 21, FLOAD2 = 22, FNEG = 23, FADD = 24, FSUB = 25, FMUL = 26, FDIV = 27,
	FEQ = 28, FNE = 29, FLT = 30, FGE = 31, FGT = 32, FLE = 33,
	ITOF = 34, FTOI = 35,

	// Reference primitives.
	RLOAD = 36, REQ = 37, RNE = 38, RTYPE = 39,

	// Shared-object construction.
	RIARRAY8 = 40, RIARRAY16 = 41, RIARRAY32 = 42, RIARRAY64 = 43,
	RSFARRAY = 44, RDFARRAY = 45, RRARRAY = 46, RTUPLE = 47,

	// Shared-object element read.
	RIANTH8 = 48, RIANTH16 = 49, RIANTH32 = 50, RIANTH64 = 51,
	RSFANTH = 52, RDFANTH = 53, RRANTH = 54, RTNTH = 55,

	// Shared-object concatenation.
	RIACAT8 = 56, RIACAT16 = 57, RIACAT32 = 58, RIACAT64 = 59,
	RSFACAT = 60, RDFACAT = 61, RRACAT = 62, RTCAT = 63,

	// Shared-object length.
	RIALEN8 = 64, RIALEN16 = 65, RIALEN32 = 66, RIALEN64 = 67,
	RSFALEN = 68, RDFALEN = 69, RRALEN = 70, RTLEN = 71,

	// Calls.
	ICALL = 72, FCALL = 73, RCALL = 74, INCALL = 75, FNCALL = 76, RNCALL = 77,

	// Unique-object in-place fill (creation).
	RUIAFILL8 = 78, RUIAFILL16 = 79, RUIAFILL32 = 80, RUIAFILL64 = 81,
	RUSFAFILL = 82, RUDFAFILL = 83, RURAFILL = 84,
	RUTFILLI = 85, RUTFILLF = 86, RUTFILLR = 87,

	// Unique-object element read (produces a linear pair).
	RUIANTH8 = 88, RUIANTH16 = 89, RUIANTH32 = 90, RUIANTH64 = 91,
	RUSFANTH = 92, RUDFANTH = 93, RURANTH = 94, RUTNTH = 95,

	// Unique-object element write (consumes and returns the container).
	RUIASNTH8 = 96, RUIASNTH16 = 97, RUIASNTH32 = 98, RUIASNTH64 = 99,
	RUSFASNTH = 100, RUDFASNTH = 101, RURASNTH = 102, RUTSNTH = 103,

	// Unique-to-shared conversion (deep copy).
	RUIATOIA8 = 104, RUIATOIA16 = 105, RUIATOIA32 = 106, RUIATOIA64 = 107,
	RUSFATOSFA = 108, RUDFATODFA = 109, RURATORA = 110, RUTTOT = 111,

	// Control flow and frame management.
	LET = 112, IN = 113, ARG = 114, RET = 115, JC = 116, JUMP = 117,
	RETRY = 118, LETTUPLE = 119,
}

/// The two bits packing an [`ArgKind`] into the high half of an opcode word.
const ARG1_KIND_SHIFT: u32 = 16;
const ARG2_KIND_SHIFT: u32 = 18;
const ARG_KIND_MASK: u32 = 0b11;

impl ArgKind {
	const fn from_bits(bits: u32) -> Self {
		match bits & ARG_KIND_MASK {
			0 => ArgKind::Imm,
			1 => ArgKind::LocalVar,
			2 => ArgKind::Arg,
			_ => ArgKind::GlobalVar,
		}
	}

	const fn to_bits(self) -> u32 {
		match self {
			ArgKind::Imm => 0,
			ArgKind::LocalVar => 1,
			ArgKind::Arg => 2,
			ArgKind::GlobalVar => 3,
		}
	}
}

/// A fully decoded instruction: base operation plus each operand's kind.
/// [`crate::interp`] reads `arg1_kind`/`arg2_kind` to decide whether an
/// instruction's raw operand word is an immediate, a local-variable index,
/// an argument index, or a global-variable index.
#[derive(Debug, Clone, Copy)]
pub struct DecodedOpcode {
	pub op: Op,
	pub arg1_kind: ArgKind,
	pub arg2_kind: ArgKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidOpcode(pub u32);

/// Splits a raw 32-bit opcode word into base operation and operand kinds.
/// The low 16 bits select [`Op`]; bits 16-17 and 18-19 select `arg1_kind`
/// and `arg2_kind` respectively. Bits above 19 are reserved and must be zero.
pub fn decode_opcode(word: u32) -> Result<DecodedOpcode, InvalidOpcode> {
	let base = (word & 0xffff) as u16;
	let reserved = word >> 20;
	if reserved != 0 {
		return Err(InvalidOpcode(word));
	}
	let op = Op::from_repr(base).ok_or(InvalidOpcode(word))?;
	let arg1_kind = ArgKind::from_bits(word >> ARG1_KIND_SHIFT);
	let arg2_kind = ArgKind::from_bits(word >> ARG2_KIND_SHIFT);
	Ok(DecodedOpcode { op, arg1_kind, arg2_kind })
}

/// Packs a base operation and operand kinds back into a raw opcode word.
/// Used by the in-process fixtures that build programs without going
/// through a text assembler (out of scope for this crate).
pub const fn encode_opcode(op: Op, arg1_kind: ArgKind, arg2_kind: ArgKind) -> u32 {
	(op as u32) | (arg1_kind.to_bits() << ARG1_KIND_SHIFT) | (arg2_kind.to_bits() << ARG2_KIND_SHIFT)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_through_encode_decode() {
		let word = encode_opcode(Op::IADD, ArgKind::LocalVar, ArgKind::Imm);
		let decoded = decode_opcode(word).unwrap();
		assert_eq!(decoded.op, Op::IADD);
		assert_eq!(decoded.arg1_kind, ArgKind::LocalVar);
		assert_eq!(decoded.arg2_kind, ArgKind::Imm);
	}

	#[test]
	fn rejects_reserved_bits() {
		assert!(decode_opcode(1 << 20).is_err());
	}

	#[test]
	fn rejects_unknown_base_op() {
		assert!(decode_opcode(0xffff).is_err());
	}
}
