//! A bytecode virtual machine for a statically-typed, pure functional
//! language family that mixes eager and non-strict (lazy/memoized)
//! evaluation with a linear-type ("unique object") discipline for safe
//! in-place mutation of I/O and array objects.
//!
//! The crate is organized the way the runtime it models is organized: a wire
//! format and decoder ([`format`], [`decode`]), a linker that turns decoded
//! images into a runnable [`linker::Environment`], a heap object model
//! ([`object`]) under a tracing collector ([`gc`]), a register-bundle
//! interpreter ([`interp`]) over an opcode set ([`opcode`]), and the three
//! concurrency-facing subsystems the interpreter leans on: per-thread
//! execution state and the cooperative safepoint protocol ([`thread`]), the
//! lazy-value forcing engine ([`lazy`]), and the memoization cache
//! ([`memo`]). [`native`] is the pluggable bridge to host-provided native
//! functions, and [`fork`] is the process-wide coordinator native libraries
//! register fork handlers with.
pub mod decode;
pub mod error;
pub mod fork;
pub mod format;
pub mod gc;
pub mod interp;
pub mod lazy;
pub mod linker;
pub mod memo;
pub mod native;
pub mod object;
pub mod opcode;
pub mod thread;
pub mod utilities;
pub mod value;

pub use error::{ErrorCode, LoadError};
pub use interp::Machine;
pub use linker::Environment;
pub use value::Value;
