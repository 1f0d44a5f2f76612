//! Portable backend for the Lyrical compiler.
//!
//! Lowers a [`lyrical_codegen::CompileResult`] to the deterministic
//! fixed-width encoding described in [`encode`], writes and reads the
//! two-section debug-info layout ([`dbginfo`]), and executes encoded
//! programs in a small interpreter ([`interp`]).

pub mod dbginfo;
pub mod encode;
pub mod interp;

pub use dbginfo::{line_for_offset, LineInfo};
pub use encode::{decode, encode, EncodeError};
pub use interp::{run, InterpError, Outcome, RunConfig};
