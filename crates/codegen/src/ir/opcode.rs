//! The machine-independent opcode set.
//!
//! Backend implementations of these opcodes must not make function calls:
//! the stack pointer register may not point to the top of the call stack,
//! as it can be backtracked to a stackframe holding the tiny-stackframe of
//! the currently executing function. The only exceptions are
//! [`Opcode::Stackpagealloc`] and [`Opcode::Stackpagefree`], which are
//! generated only while the stack pointer points to the top of the call
//! stack.

/// Operation of an instruction. `r1`, `r2`, `r3` are virtual register ids
/// and `imm` is the summed immediate list of the instruction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[repr(u16)]
pub enum Opcode {
    // Arithmetic integer.
    /// r1 = r2 + r3
    Add,
    /// r1 = r2 + imm
    Addi,
    /// r1 = r2 - r3
    Sub,
    /// r1 = -r2
    Neg,
    /// r1 = r2 * r3
    Mul,
    /// r1 = high half of r2 * r3, signed
    Mulh,
    /// r1 = r2 / r3, signed
    Div,
    /// r1 = r2 % r3, signed
    Mod,
    /// r1 = high half of r2 * r3, unsigned
    Mulhu,
    /// r1 = r2 / r3, unsigned
    Divu,
    /// r1 = r2 % r3, unsigned
    Modu,
    /// r1 = r2 * imm
    Muli,
    /// r1 = high half of r2 * imm, signed
    Mulhi,
    /// r1 = r2 / imm, signed
    Divi,
    /// r1 = r2 % imm, signed
    Modi,
    /// r1 = imm / r2, signed
    Divi2,
    /// r1 = imm % r2, signed
    Modi2,
    /// r1 = high half of r2 * imm, unsigned
    Mulhui,
    /// r1 = r2 / imm, unsigned
    Divui,
    /// r1 = r2 % imm, unsigned
    Modui,
    /// r1 = imm / r2, unsigned
    Divui2,
    /// r1 = imm % r2, unsigned
    Modui2,

    // Bitwise.
    /// r1 = r2 & r3
    And,
    /// r1 = r2 & imm
    Andi,
    /// r1 = r2 | r3
    Or,
    /// r1 = r2 | imm
    Ori,
    /// r1 = r2 ^ r3
    Xor,
    /// r1 = r2 ^ imm
    Xori,
    /// r1 = ~r2
    Not,
    /// r1 = r2
    Cpy,
    /// r1 = r2 << r3, logical
    Sll,
    /// r1 = r2 << imm, logical
    Slli,
    /// r1 = imm << r2, logical
    Slli2,
    /// r1 = r2 >> r3, logical
    Srl,
    /// r1 = r2 >> imm, logical
    Srli,
    /// r1 = imm >> r2, logical
    Srli2,
    /// r1 = r2 >> r3, arithmetic
    Sra,
    /// r1 = r2 >> imm, arithmetic
    Srai,
    /// r1 = imm >> r2, arithmetic
    Srai2,
    /// Zero-extend r2 into r1; imm is the count of least significant bits
    /// to keep. No operation when imm is 0. The immediate is a single
    /// literal term.
    Zxt,
    /// Sign-extend r2 into r1; imm is the count of least significant bits
    /// to keep. No operation when imm is 0. The immediate is a single
    /// literal term.
    Sxt,

    // Test.
    /// r1 = (r2 == r3)
    Seq,
    /// r1 = (r2 != r3)
    Sne,
    /// r1 = (r2 == imm)
    Seqi,
    /// r1 = (r2 != imm)
    Snei,
    /// r1 = (r2 < r3), signed
    Slt,
    /// r1 = (r2 <= r3), signed
    Slte,
    /// r1 = (r2 < r3), unsigned
    Sltu,
    /// r1 = (r2 <= r3), unsigned
    Slteu,
    /// r1 = (r2 < imm), signed
    Slti,
    /// r1 = (r2 <= imm), signed
    Sltei,
    /// r1 = (r2 < imm), unsigned
    Sltui,
    /// r1 = (r2 <= imm), unsigned
    Slteui,
    /// r1 = (r2 > imm), signed
    Sgti,
    /// r1 = (r2 >= imm), signed
    Sgtei,
    /// r1 = (r2 > imm), unsigned
    Sgtui,
    /// r1 = (r2 >= imm), unsigned
    Sgteui,
    /// r1 = (r2 == 0)
    Sz,
    /// r1 = (r2 != 0)
    Snz,

    // Branching. Jeq must always start the branch range and Jpop must
    // always terminate it; backends pattern-match on the range.
    /// if (r1 == r2) goto imm, PC-relative
    Jeq,
    /// if (r1 == r2) goto imm, absolute
    Jeqi,
    /// if (r1 == r2) goto r3
    Jeqr,
    /// if (r1 != r2) goto imm, PC-relative
    Jne,
    /// if (r1 != r2) goto imm, absolute
    Jnei,
    /// if (r1 != r2) goto r3
    Jner,
    /// if (r1 < r2) goto imm, PC-relative, signed
    Jlt,
    /// if (r1 < r2) goto imm, absolute, signed
    Jlti,
    /// if (r1 < r2) goto r3, signed
    Jltr,
    /// if (r1 <= r2) goto imm, PC-relative, signed
    Jlte,
    /// if (r1 <= r2) goto imm, absolute, signed
    Jltei,
    /// if (r1 <= r2) goto r3, signed
    Jlter,
    /// if (r1 < r2) goto imm, PC-relative, unsigned
    Jltu,
    /// if (r1 < r2) goto imm, absolute, unsigned
    Jltui,
    /// if (r1 < r2) goto r3, unsigned
    Jltur,
    /// if (r1 <= r2) goto imm, PC-relative, unsigned
    Jlteu,
    /// if (r1 <= r2) goto imm, absolute, unsigned
    Jlteui,
    /// if (r1 <= r2) goto r3, unsigned
    Jlteur,
    /// if (!r1) goto imm, PC-relative
    Jz,
    /// if (!r1) goto imm, absolute
    Jzi,
    /// if (!r1) goto r2
    Jzr,
    /// if (r1) goto imm, PC-relative
    Jnz,
    /// if (r1) goto imm, absolute
    Jnzi,
    /// if (r1) goto r2
    Jnzr,
    /// goto imm, PC-relative
    J,
    /// goto imm, absolute
    Ji,
    /// goto r1
    Jr,
    /// r1 = address of next instruction; goto imm, PC-relative
    Jl,
    /// r1 = address of next instruction; goto imm, absolute
    Jli,
    /// r1 = address of next instruction; goto r2
    Jlr,
    /// push address of next instruction; goto imm, PC-relative
    Jpush,
    /// push address of next instruction; goto imm, absolute
    Jpushi,
    /// push address of next instruction; goto r1
    Jpushr,
    /// pop an address and continue execution from it
    Jpop,

    /// r1 = the relative address imm, materialized from the instruction
    /// pointer. Implementations may use a call-like trick, so the
    /// configured stack guard space applies.
    Afip,

    /// r1 = imm
    Li,

    // Memory access load: register+immediate, register-indirect and
    // absolute-immediate address forms at each width.
    /// r1 = 8-bit load from (r2 + imm)
    Ld8,
    /// r1 = 8-bit load from r2
    Ld8r,
    /// r1 = 8-bit load from imm
    Ld8i,
    /// r1 = 16-bit load from (r2 + imm)
    Ld16,
    /// r1 = 16-bit load from r2
    Ld16r,
    /// r1 = 16-bit load from imm
    Ld16i,
    /// r1 = 32-bit load from (r2 + imm)
    Ld32,
    /// r1 = 32-bit load from r2
    Ld32r,
    /// r1 = 32-bit load from imm
    Ld32i,
    /// r1 = 64-bit load from (r2 + imm)
    Ld64,
    /// r1 = 64-bit load from r2
    Ld64r,
    /// r1 = 64-bit load from imm
    Ld64i,

    // Memory access store.
    /// store low 8 bits of r1 at (r2 + imm)
    St8,
    /// store low 8 bits of r1 at r2
    St8r,
    /// store low 8 bits of r1 at imm
    St8i,
    /// store low 16 bits of r1 at (r2 + imm)
    St16,
    /// store low 16 bits of r1 at r2
    St16r,
    /// store low 16 bits of r1 at imm
    St16i,
    /// store low 32 bits of r1 at (r2 + imm)
    St32,
    /// store low 32 bits of r1 at r2
    St32r,
    /// store low 32 bits of r1 at imm
    St32i,
    /// store r1 at (r2 + imm)
    St64,
    /// store r1 at r2
    St64r,
    /// store r1 at imm
    St64i,

    // Atomic swap between r1 and memory, mirroring the plain accesses.
    /// atomically swap low 8 bits of r1 with (r2 + imm)
    Ldst8,
    /// atomically swap low 8 bits of r1 with r2
    Ldst8r,
    /// atomically swap low 8 bits of r1 with imm
    Ldst8i,
    /// atomically swap low 16 bits of r1 with (r2 + imm)
    Ldst16,
    /// atomically swap low 16 bits of r1 with r2
    Ldst16r,
    /// atomically swap low 16 bits of r1 with imm
    Ldst16i,
    /// atomically swap low 32 bits of r1 with (r2 + imm)
    Ldst32,
    /// atomically swap low 32 bits of r1 with r2
    Ldst32r,
    /// atomically swap low 32 bits of r1 with imm
    Ldst32i,
    /// atomically swap r1 with (r2 + imm)
    Ldst64,
    /// atomically swap r1 with r2
    Ldst64r,
    /// atomically swap r1 with imm
    Ldst64i,

    // Block memory copies from the location in r2 to the location in r1.
    // The count is r3 or the immediate and is never zero; r1, r2 (and r3)
    // are never the same register. At the end both pointers hold the next
    // locations that would have been used.
    /// copy r3 u8 units, incrementing
    Mem8cpy,
    /// copy imm u8 units, incrementing
    Mem8cpyi,
    /// copy r3 u8 units, decrementing
    Mem8cpy2,
    /// copy imm u8 units, decrementing
    Mem8cpyi2,
    /// copy r3 u16 units, incrementing
    Mem16cpy,
    /// copy imm u16 units, incrementing
    Mem16cpyi,
    /// copy r3 u16 units, decrementing
    Mem16cpy2,
    /// copy imm u16 units, decrementing
    Mem16cpyi2,
    /// copy r3 u32 units, incrementing
    Mem32cpy,
    /// copy imm u32 units, incrementing
    Mem32cpyi,
    /// copy r3 u32 units, decrementing
    Mem32cpy2,
    /// copy imm u32 units, decrementing
    Mem32cpyi2,
    /// copy r3 u64 units, incrementing
    Mem64cpy,
    /// copy imm u64 units, incrementing
    Mem64cpyi,
    /// copy r3 u64 units, decrementing
    Mem64cpy2,
    /// copy imm u64 units, decrementing
    Mem64cpyi2,

    // Page allocation. The allocated pages are readable and writable.
    /// r1 = start address of r2 allocated pages, or -1 on failure
    Pagealloc,
    /// r1 = start address of imm allocated pages, or -1 on failure. The
    /// immediate is a single literal term.
    Pagealloci,
    /// free r2 pages starting from the page containing the address in r1
    Pagefree,
    /// free imm pages starting from the page containing the address in
    /// r1. The immediate is a single literal term.
    Pagefreei,
    /// r1 = start address of a page allocated for stack use, or -1 on
    /// failure. Generated only while the stack pointer points to the top
    /// of the call stack.
    Stackpagealloc,
    /// free the stack page containing the address in r1
    Stackpagefree,

    /// Raw machine code escape; the payload holds the literal
    /// backend-specific bytes, preserved exactly.
    Machinecode,

    /// Block boundary. Instructions strictly between two nops form a
    /// basic block whose only branch target is the first instruction; all
    /// virtual registers are considered flushed at block entry. The first
    /// instruction of a function is a branch target without a preceding
    /// nop, and the last instruction of a function ends a block without a
    /// following one.
    Nop,

    /// Compiler commentary; generated only when comments are enabled.
    Comment,
}

impl Opcode {
    /// Length of the per-opcode minimum-unused-register table. Only
    /// opcodes before `Nop` use registers.
    pub const REGISTERFUL_COUNT: usize = Opcode::Nop as usize;

    /// Is this opcode in the contiguous branch range used by backends for
    /// pattern matching?
    pub fn is_branch(self) -> bool {
        (self as u16) >= (Opcode::Jeq as u16) && (self as u16) <= (Opcode::Jpop as u16)
    }

    /// Does this opcode require its immediate to be exactly one literal
    /// term?
    pub fn wants_single_literal_imm(self) -> bool {
        matches!(
            self,
            Opcode::Zxt | Opcode::Sxt | Opcode::Pagealloci | Opcode::Pagefreei
        )
    }

    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Add => "add",
            Addi => "addi",
            Sub => "sub",
            Neg => "neg",
            Mul => "mul",
            Mulh => "mulh",
            Div => "div",
            Mod => "mod",
            Mulhu => "mulhu",
            Divu => "divu",
            Modu => "modu",
            Muli => "muli",
            Mulhi => "mulhi",
            Divi => "divi",
            Modi => "modi",
            Divi2 => "divi2",
            Modi2 => "modi2",
            Mulhui => "mulhui",
            Divui => "divui",
            Modui => "modui",
            Divui2 => "divui2",
            Modui2 => "modui2",
            And => "and",
            Andi => "andi",
            Or => "or",
            Ori => "ori",
            Xor => "xor",
            Xori => "xori",
            Not => "not",
            Cpy => "cpy",
            Sll => "sll",
            Slli => "slli",
            Slli2 => "slli2",
            Srl => "srl",
            Srli => "srli",
            Srli2 => "srli2",
            Sra => "sra",
            Srai => "srai",
            Srai2 => "srai2",
            Zxt => "zxt",
            Sxt => "sxt",
            Seq => "seq",
            Sne => "sne",
            Seqi => "seqi",
            Snei => "snei",
            Slt => "slt",
            Slte => "slte",
            Sltu => "sltu",
            Slteu => "slteu",
            Slti => "slti",
            Sltei => "sltei",
            Sltui => "sltui",
            Slteui => "slteui",
            Sgti => "sgti",
            Sgtei => "sgtei",
            Sgtui => "sgtui",
            Sgteui => "sgteui",
            Sz => "sz",
            Snz => "snz",
            Jeq => "jeq",
            Jeqi => "jeqi",
            Jeqr => "jeqr",
            Jne => "jne",
            Jnei => "jnei",
            Jner => "jner",
            Jlt => "jlt",
            Jlti => "jlti",
            Jltr => "jltr",
            Jlte => "jlte",
            Jltei => "jltei",
            Jlter => "jlter",
            Jltu => "jltu",
            Jltui => "jltui",
            Jltur => "jltur",
            Jlteu => "jlteu",
            Jlteui => "jlteui",
            Jlteur => "jlteur",
            Jz => "jz",
            Jzi => "jzi",
            Jzr => "jzr",
            Jnz => "jnz",
            Jnzi => "jnzi",
            Jnzr => "jnzr",
            J => "j",
            Ji => "ji",
            Jr => "jr",
            Jl => "jl",
            Jli => "jli",
            Jlr => "jlr",
            Jpush => "jpush",
            Jpushi => "jpushi",
            Jpushr => "jpushr",
            Jpop => "jpop",
            Afip => "afip",
            Li => "li",
            Ld8 => "ld8",
            Ld8r => "ld8r",
            Ld8i => "ld8i",
            Ld16 => "ld16",
            Ld16r => "ld16r",
            Ld16i => "ld16i",
            Ld32 => "ld32",
            Ld32r => "ld32r",
            Ld32i => "ld32i",
            Ld64 => "ld64",
            Ld64r => "ld64r",
            Ld64i => "ld64i",
            St8 => "st8",
            St8r => "st8r",
            St8i => "st8i",
            St16 => "st16",
            St16r => "st16r",
            St16i => "st16i",
            St32 => "st32",
            St32r => "st32r",
            St32i => "st32i",
            St64 => "st64",
            St64r => "st64r",
            St64i => "st64i",
            Ldst8 => "ldst8",
            Ldst8r => "ldst8r",
            Ldst8i => "ldst8i",
            Ldst16 => "ldst16",
            Ldst16r => "ldst16r",
            Ldst16i => "ldst16i",
            Ldst32 => "ldst32",
            Ldst32r => "ldst32r",
            Ldst32i => "ldst32i",
            Ldst64 => "ldst64",
            Ldst64r => "ldst64r",
            Ldst64i => "ldst64i",
            Mem8cpy => "mem8cpy",
            Mem8cpyi => "mem8cpyi",
            Mem8cpy2 => "mem8cpy2",
            Mem8cpyi2 => "mem8cpyi2",
            Mem16cpy => "mem16cpy",
            Mem16cpyi => "mem16cpyi",
            Mem16cpy2 => "mem16cpy2",
            Mem16cpyi2 => "mem16cpyi2",
            Mem32cpy => "mem32cpy",
            Mem32cpyi => "mem32cpyi",
            Mem32cpy2 => "mem32cpy2",
            Mem32cpyi2 => "mem32cpyi2",
            Mem64cpy => "mem64cpy",
            Mem64cpyi => "mem64cpyi",
            Mem64cpy2 => "mem64cpy2",
            Mem64cpyi2 => "mem64cpyi2",
            Pagealloc => "pagealloc",
            Pagealloci => "pagealloci",
            Pagefree => "pagefree",
            Pagefreei => "pagefreei",
            Stackpagealloc => "stackpagealloc",
            Stackpagefree => "stackpagefree",
            Machinecode => "machinecode",
            Nop => "nop",
            Comment => "comment",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_range_is_contiguous() {
        assert!(Opcode::Jeq.is_branch());
        assert!(Opcode::Jpop.is_branch());
        assert!(Opcode::Jlteur.is_branch());
        assert!(!Opcode::Snz.is_branch());
        assert!(!Opcode::Afip.is_branch());
        assert!(!Opcode::Li.is_branch());
    }

    #[test]
    fn registerful_count_stops_before_nop() {
        assert_eq!(Opcode::REGISTERFUL_COUNT, Opcode::Nop as usize);
        assert!((Opcode::Comment as usize) > Opcode::REGISTERFUL_COUNT);
    }

    #[test]
    fn single_literal_imm_opcodes() {
        assert!(Opcode::Zxt.wants_single_literal_imm());
        assert!(Opcode::Sxt.wants_single_literal_imm());
        assert!(Opcode::Pagealloci.wants_single_literal_imm());
        assert!(!Opcode::Addi.wants_single_literal_imm());
    }
}
