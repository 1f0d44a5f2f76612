//! Per-instruction data.

use std::sync::Arc;

use crate::ir::entities::Reg;
use crate::ir::immediate::Imm;
use crate::ir::opcode::Opcode;

/// Opcode-specific payload.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Payload {
    /// Literal backend-specific bytes for [`Opcode::Machinecode`],
    /// preserved exactly; most likely non-printable.
    MachineCode(Vec<u8>),
    /// Commentary for [`Opcode::Comment`].
    Comment(String),
}

/// Source provenance of an instruction, plus the binary offset a backend
/// reports after emission.
#[derive(Clone, Default, Debug)]
pub struct DebugInfo {
    /// Absolute path of the file the instruction was generated from.
    pub filepath: Option<Arc<str>>,
    /// 1-based line number within that file.
    pub line: u32,
    /// Byte offset of the line within the file.
    pub line_offset: u32,
    /// Offset of the generated binary; not set during compilation, filled
    /// in by a backend for use by another backend.
    pub bin_offset: u32,
}

/// One IR instruction.
#[derive(Clone, Debug)]
pub struct InstructionData {
    pub opcode: Opcode,
    pub r1: Reg,
    pub r2: Reg,
    pub r3: Reg,
    pub imm: Option<Imm>,
    pub payload: Option<Payload>,
    /// When set, the byte size the encoded form must have; backends pad
    /// with target NOPs, so it must be a multiple of their size.
    pub binsz: Option<u32>,
    /// Ids of the registers that were unallocated when this instruction
    /// was generated, terminated by register id 0 (the stack pointer,
    /// which is always in use).
    pub unused_regs: Option<Vec<Reg>>,
    pub dbg: DebugInfo,
}

impl InstructionData {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            r1: Reg::SP,
            r2: Reg::SP,
            r3: Reg::SP,
            imm: None,
            payload: None,
            binsz: None,
            unused_regs: None,
            dbg: DebugInfo::default(),
        }
    }

    /// Enforce the per-opcode immediate shape.
    pub fn validate(&self) {
        if self.opcode.wants_single_literal_imm() {
            debug_assert!(
                self.imm.as_ref().and_then(Imm::as_value).is_some(),
                "{} requires a single literal immediate term",
                self.opcode.mnemonic()
            );
        }
        if let Some(unused) = &self.unused_regs {
            debug_assert_eq!(
                unused.last(),
                Some(&Reg::SP),
                "unused-register array must be terminated by register id 0"
            );
        }
    }
}
