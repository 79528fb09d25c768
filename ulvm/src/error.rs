//! Two disjoint error families: [`LoadError`] for anything that goes wrong
//! decoding or linking an image (never recoverable at runtime — the image
//! simply won't run), and [`ErrorCode`] for the runtime faults an
//! interpreter loop can raise mid-execution and that a `try` frame can
//! catch. Plain enums with manual `From` impls, not `thiserror`, to match
//! how the rest of this crate's decode/link path reports failure.
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
	Io(String),
	BadMagic,
	SectionOverflow { section: &'static str },
	SectionOutOfBounds { section: &'static str },
	InvalidFunction { index: usize },
	InvalidGlobalVarType { index: usize },
	InvalidObjectType { offset: usize },
	InvalidTupleElementType { offset: usize, slot: usize },
	DanglingGlobalVarRef,
	InvalidRelocationType { index: usize },
	InvalidSymbolType { index: usize },
	UnresolvedSymbol { index: usize },
	DuplicateFunctionSymbol { name: String },
	DuplicateVarSymbol { name: String },
	NoEntryPoint,
	MultipleEntryPoints,
}

impl fmt::Display for LoadError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			LoadError::Io(message) => write!(f, "I/O error while reading image: {message}"),
			LoadError::BadMagic => write!(f, "image does not start with the expected magic bytes"),
			LoadError::SectionOverflow { section } => write!(f, "size arithmetic overflowed in section `{section}`"),
			LoadError::SectionOutOfBounds { section } => write!(f, "section `{section}` extends past the end of the image"),
			LoadError::InvalidFunction { index } => write!(f, "function {index} has an invalid address or instruction range"),
			LoadError::InvalidGlobalVarType { index } => write!(f, "global variable {index} has an invalid wire type"),
			LoadError::InvalidObjectType { offset } => write!(f, "data object at offset {offset} has an invalid type"),
			LoadError::InvalidTupleElementType { offset, slot } => {
				write!(f, "tuple at offset {offset} has an invalid element type in slot {slot}")
			}
			LoadError::DanglingGlobalVarRef => write!(f, "a REF-typed global variable does not target the start of a data object"),
			LoadError::InvalidRelocationType { index } => write!(f, "relocation {index} has an unknown type"),
			LoadError::InvalidSymbolType { index } => write!(f, "symbol {index} has an unknown type"),
			LoadError::UnresolvedSymbol { index } => write!(f, "symbol {index} was never defined by any linked image"),
			LoadError::DuplicateFunctionSymbol { name } => write!(f, "function symbol `{name}` is defined more than once"),
			LoadError::DuplicateVarSymbol { name } => write!(f, "variable symbol `{name}` is defined more than once"),
			LoadError::NoEntryPoint => write!(f, "no linked image supplies an entry point"),
			LoadError::MultipleEntryPoints => write!(f, "more than one linked image supplies an entry point"),
		}
	}
}

impl std::error::Error for LoadError {}

impl From<std::io::Error> for LoadError {
	fn from(err: std::io::Error) -> Self {
		LoadError::Io(err.to_string())
	}
}

/// Runtime fault codes an interpreter loop can raise. `Success` is not
/// itself an error; it is included because the original instruction-result
/// protocol represents "no fault" as error code zero and several native
/// call sites compare against it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
	Success,
	NoInstr,
	IncorrectInstr,
	IncorrectValue,
	IncorrectObject,
	IncorrectFun,
	EmptyStack,
	StackOverflow,
	OutOfMemory,
	NoFun,
	NoLocalVar,
	NoGlobalVar,
	NoArg,
	IncorrectArgCount,
	DivByZero,
	IndexOutOfBounds,
	Exception,
	NoEntry,
	NoNativeFun,
	UniqueObject,
	AgainUsedUnique,
}

impl ErrorCode {
	pub fn is_success(self) -> bool {
		matches!(self, ErrorCode::Success)
	}
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let message = match self {
			ErrorCode::Success => "success",
			ErrorCode::NoInstr => "no such instruction",
			ErrorCode::IncorrectInstr => "incorrect instruction",
			ErrorCode::IncorrectValue => "incorrect value",
			ErrorCode::IncorrectObject => "incorrect object",
			ErrorCode::IncorrectFun => "incorrect function",
			ErrorCode::EmptyStack => "empty stack",
			ErrorCode::StackOverflow => "stack overflow",
			ErrorCode::OutOfMemory => "out of memory",
			ErrorCode::NoFun => "no such function",
			ErrorCode::NoLocalVar => "no such local variable",
			ErrorCode::NoGlobalVar => "no such global variable",
			ErrorCode::NoArg => "no such argument",
			ErrorCode::IncorrectArgCount => "incorrect argument count",
			ErrorCode::DivByZero => "division by zero",
			ErrorCode::IndexOutOfBounds => "index out of bounds",
			ErrorCode::Exception => "exception",
			ErrorCode::NoEntry => "no entry point",
			ErrorCode::NoNativeFun => "no such native function",
			ErrorCode::UniqueObject => "operation not allowed on a unique object",
			ErrorCode::AgainUsedUnique => "unique object used again after being moved",
		};
		f.write_str(message)
	}
}

impl std::error::Error for ErrorCode {}
