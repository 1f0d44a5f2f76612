//! Native-operator emitters.
//!
//! Each emitter receives the argument list of a call-site descriptor and
//! produces IR while observing the register-allocation discipline
//! documented in [`crate::regalloc`]. The front-end runs two passes: the
//! first pass only materializes typed result variables, the second emits
//! instructions.

use bitflags::bitflags;

use crate::ir::entities::Reg;
use crate::ir::function::{FunctionData, Program};
use crate::ir::immediate::Imm;
use crate::ir::inst::{DebugInfo, InstructionData, Payload};
use crate::ir::opcode::Opcode;
use crate::ir::types::Type;
use crate::ir::{Func, Inst};
use crate::regalloc::{DiscardMode, RegAlloc, Usage};
use crate::vars::{Var, VarTable};

mod assign;
mod bitwise;
mod comparison;
mod incdec;
mod muldiv;
mod negnot;
mod notistrue;
mod plusminus;
mod selfop;
mod shift;

bitflags! {
    /// Compilation switches, combinable with bitwise or.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CompileFlags: u32 {
        /// Generate `comment` instructions narrating the emitters.
        const COMMENT = 1;
        /// Generate debug information.
        const DEBUG_INFO = 1 << 1;
        /// Treat every variable as volatile; values are never cached in
        /// registers.
        const ALL_VAR_VOLATILE = 1 << 2;
        /// Functions never share a stackframe.
        const NO_STACKFRAME_SHARING = 1 << 3;
        /// An undefined non-nested function is an error instead of an
        /// import.
        const NO_FUNCTION_IMPORT = 1 << 4;
        /// The `export` keyword on a non-nested function is an error.
        const NO_FUNCTION_EXPORT = 1 << 5;
    }
}

/// Target description and knobs supplied by the driver.
pub struct EmitConfig {
    /// Byte size of the target general purpose registers; a power of two.
    pub sizeof_gpr: u32,
    /// Number of general purpose registers besides %0, the stack pointer.
    /// Must be at least 3.
    pub nbr_of_gpr: u32,
    /// Minimum count of unused registers that must be available before
    /// generating the corresponding instruction, indexed by opcode.
    pub min_unused_reg_count_for_op: [u8; Opcode::REGISTERFUL_COUNT],
    /// Extra stack bytes `stackpagealloc` may use while allocating.
    pub stack_page_alloc_provision: u32,
    /// Guard space in `sizeof_gpr` units protecting the bottom of a
    /// stackframe under construction from call-like address computation.
    pub function_call_args_guard_space: u32,
    /// log2 byte size of each jump-case slot in a switch jumptable.
    pub jump_case_clog2_size: u32,
    pub flags: CompileFlags,
}

impl EmitConfig {
    /// Defaults matching the original driver's per-target values.
    pub fn for_word_size(sizeof_gpr: u32) -> Self {
        let nbr_of_gpr = if sizeof_gpr == 8 { 15 } else { 7 };
        Self {
            sizeof_gpr,
            nbr_of_gpr,
            min_unused_reg_count_for_op: [0; Opcode::REGISTERFUL_COUNT],
            stack_page_alloc_provision: 64 * sizeof_gpr,
            function_call_args_guard_space: 64,
            jump_case_clog2_size: if sizeof_gpr == 8 { 4 } else { 3 },
            flags: CompileFlags::empty(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("the left argument of the native operator '{op}' cannot be readonly")]
    ReadonlyLeft { op: String },
    #[error("argument to the native operator '{op}' cannot be readonly")]
    ReadonlyOperand { op: String },
    #[error("the second argument of the native operator '{op}' cannot be a pointer")]
    PointerSecondOperand { op: String },
    #[error("unknown native operator '{op}'")]
    UnknownOperator { op: String },
}

pub type EmitResult<T> = Result<T, CodegenError>;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Pass {
    First,
    Second,
}

/// One argument of a native-operator call site.
#[derive(Clone)]
pub struct OpArg {
    /// The value variable, possibly a duplicate of the pushed one.
    pub var: Var,
    /// The variable as the programmer pushed it.
    pub varpushed: Var,
    /// The type the argument was pushed with.
    pub pushed_ty: Type,
    /// Bit-select mask applied when accessing a sub-width value; 0 for
    /// the whole value.
    pub bitselect: u32,
    pub byref: bool,
    /// Set by the first pass when the argument is only written, so the
    /// second pass never duplicates its value.
    pub to_output: bool,
}

/// A native-operator call site: the operator's arguments plus the
/// registered arguments of any enclosing calls, which matter for tempvar
/// sharing.
pub struct CallArgs {
    pub args: Vec<OpArg>,
    pub registered: Vec<Var>,
}

/// Emission context for one function and one pass.
pub struct Cx<'a> {
    pub cfg: &'a EmitConfig,
    pub prog: &'a mut Program,
    pub cur: Func,
    pub vars: VarTable,
    pub alloc: RegAlloc,
    pub pass: Pass,
    /// Debug provenance stamped on new instructions.
    pub srcloc: DebugInfo,
}

impl<'a> Cx<'a> {
    pub fn new(cfg: &'a EmitConfig, prog: &'a mut Program, cur: Func, pass: Pass) -> Self {
        Self {
            cfg,
            prog,
            cur,
            vars: VarTable::new(),
            alloc: RegAlloc::new(cfg.nbr_of_gpr),
            pass,
            srcloc: DebugInfo::default(),
        }
    }

    pub fn func(&self) -> &FunctionData {
        self.prog.func(self.cur)
    }

    pub fn func_mut(&mut self) -> &mut FunctionData {
        self.prog.func_mut(self.cur)
    }

    /// Create an instruction skeleton: the allocator first guarantees the
    /// opcode's minimum unused-register count, then the current unused
    /// set and source location are recorded.
    fn new_inst(&mut self, opcode: Opcode) -> InstructionData {
        let need = if (opcode as usize) < Opcode::REGISTERFUL_COUNT {
            usize::from(self.cfg.min_unused_reg_count_for_op[opcode as usize])
        } else {
            0
        };
        if need > 0 {
            self.alloc
                .ensure_unused(self.prog.func_mut(self.cur), &self.vars, need);
        }
        let mut data = InstructionData::new(opcode);
        data.dbg = self.srcloc.clone();
        data.unused_regs = Some(self.alloc.unused_snapshot());
        data
    }

    pub fn op3(&mut self, opcode: Opcode, r1: Reg, r2: Reg, r3: Reg) -> Inst {
        let mut data = self.new_inst(opcode);
        data.r1 = r1;
        data.r2 = r2;
        data.r3 = r3;
        self.func_mut().append(data)
    }

    pub fn op2(&mut self, opcode: Opcode, r1: Reg, r2: Reg) -> Inst {
        let mut data = self.new_inst(opcode);
        data.r1 = r1;
        data.r2 = r2;
        self.func_mut().append(data)
    }

    pub fn op2i(&mut self, opcode: Opcode, r1: Reg, r2: Reg, imm: i64) -> Inst {
        let mut data = self.new_inst(opcode);
        data.r1 = r1;
        data.r2 = r2;
        data.imm = Some(Imm::value(imm));
        self.func_mut().append(data)
    }

    pub fn op1i(&mut self, opcode: Opcode, r1: Reg, imm: i64) -> Inst {
        let mut data = self.new_inst(opcode);
        data.r1 = r1;
        data.imm = Some(Imm::value(imm));
        self.func_mut().append(data)
    }

    pub fn addi(&mut self, r1: Reg, r2: Reg, imm: i64) -> Inst {
        self.op2i(Opcode::Addi, r1, r2, imm)
    }

    pub fn li(&mut self, r1: Reg, imm: i64) -> Inst {
        self.op1i(Opcode::Li, r1, imm)
    }

    /// Block boundary. The flush stores belong to the block being closed,
    /// so they are emitted before the nop; nothing stays cached across it.
    pub fn nop(&mut self) {
        self.alloc
            .flush_all(self.prog.func_mut(self.cur), &self.vars);
        let data = self.new_inst(Opcode::Nop);
        self.func_mut().append(data);
    }

    /// Compiler commentary, generated only when comments are enabled.
    pub fn comment(&mut self, text: impl Into<String>) {
        if !self.cfg.flags.contains(CompileFlags::COMMENT) {
            return;
        }
        let mut data = self.new_inst(Opcode::Comment);
        data.payload = Some(Payload::Comment(text.into()));
        self.func_mut().append(data);
    }

    /// Acquire and lock a register holding the argument's value. Volatile
    /// variables are never read from a cached register; any stale binding
    /// is discarded so a fresh load is generated.
    pub fn input_reg(&mut self, arg: &OpArg) -> Reg {
        let size = arg.pushed_ty.size_of(self.cfg.sizeof_gpr);
        if self.is_volatile(arg.var) {
            self.alloc
                .discard_overlapping(arg.var, 0, size, 0, DiscardMode::AllOverlap);
        }
        let r = self.alloc.get_reg_for_var(
            self.prog.func_mut(self.cur),
            &self.vars,
            arg.var,
            0,
            size,
            arg.bitselect,
            Usage::ForInput,
        );
        self.alloc.lock(r);
        r
    }

    /// Acquire, dirty and lock a register for a result variable.
    pub fn output_reg(&mut self, v: Var, ty: &Type) -> Reg {
        let size = ty.size_of(self.cfg.sizeof_gpr);
        let r = self.alloc.get_reg_for_var(
            self.prog.func_mut(self.cur),
            &self.vars,
            v,
            0,
            size,
            0,
            Usage::ForOutput,
        );
        self.alloc.lock(r);
        r
    }

    /// Locked registers are unlocked only after the instructions using
    /// them have been generated; otherwise they could be lost when the
    /// ensure-unused step runs while creating a new instruction.
    pub fn unlock(&mut self, r: Reg) {
        self.alloc.unlock(r);
    }

    pub fn flush_reg(&mut self, r: Reg) {
        self.alloc
            .flush_reg(self.prog.func_mut(self.cur), &self.vars, r);
    }

    pub fn discard_overlapping(&mut self, v: Var, offset: u32, size: u32, mode: DiscardMode) {
        self.alloc.discard_overlapping(v, offset, size, 0, mode);
    }

    /// Allocate a typed result tempvar; the only work of the first pass.
    pub fn temp_result(&mut self, ty: &Type) -> Var {
        self.vars.alloc_temp(ty.clone(), self.cfg.sizeof_gpr)
    }

    /// A constant result variable.
    pub fn number_result(&mut self, value: i64, ty: &Type) -> Var {
        self.vars.number(value, ty.clone(), self.cfg.sizeof_gpr)
    }

    /// Is the variable's value never cached?
    pub fn is_volatile(&self, v: Var) -> bool {
        self.cfg.flags.contains(CompileFlags::ALL_VAR_VOLATILE) || self.vars.get(v).volatile
    }

    /// Store a register's value into a variable's memory.
    pub fn store_var(&mut self, r: Reg, v: Var, size: u32) {
        let opcode = match size {
            1 => Opcode::St8,
            2 => Opcode::St16,
            4 => Opcode::St32,
            _ => Opcode::St64,
        };
        let offset = i64::from(self.vars.get(v).frame_offset);
        self.op2i(opcode, r, Reg::SP, offset);
    }
}

/// Size of what a pointer points to; `sizeof_gpr` for function pointers.
pub fn stride(ty: &Type, sizeof_gpr: u32) -> u32 {
    ty.stride(sizeof_gpr)
}

/// Is the first argument's tempvar aliased by another pending argument of
/// this call or a registered argument list? When it is, its register must
/// be flushed before being reassigned or the still-needed value is lost.
pub fn is_shared_tempvar1(args: &CallArgs) -> bool {
    let first = args.args[0].var;
    args.args[1..].iter().any(|a| a.var == first)
        || args.registered.iter().any(|&v| v == first)
}

/// Record the bytes of `v` modified through an operator, clamped so the
/// recorded region stays within the variable. Only for programmer-declared
/// variables.
pub fn propagate_var_change(vars: &mut VarTable, v: Var, offset: u32, mut size: u32) {
    let total = vars.get(v).size;
    if offset >= total {
        return;
    }
    if size > total - offset {
        size = total - offset;
    }
    vars.get_mut(v).changed.push((offset, size));
}

/// The canonical width normalization of immediate literals: sign- or
/// zero-extend `value` per its declared native type.
pub fn extend_to_native(value: i64, ty: &Type) -> i64 {
    match ty {
        Type::Int { bits: 64, .. } => value,
        Type::Int { bits, signed } => {
            let bits = u32::from(*bits);
            let mask = (1i64 << bits) - 1;
            let v = value & mask;
            if *signed && (v >> (bits - 1)) & 1 == 1 {
                v | !mask
            } else {
                v
            }
        }
        _ => value,
    }
}

/// The literal value of an argument, width-normalized, when the argument
/// is a number.
pub fn arg_number(cx: &Cx, arg: &OpArg) -> Option<i64> {
    cx.vars
        .get(arg.var)
        .number
        .map(|n| extend_to_native(n, &arg.pushed_ty))
}

/// Shared prologue of the read-modify-write operators (`++`, `--` and the
/// compound assignments): acquire the in-out register, flush a shared
/// tempvar if needed, discard overlaps and reassign the register to the
/// pushed variable, and mark it dirty.
pub(crate) fn prepare_inout_reg(cx: &mut Cx, args: &CallArgs) -> Reg {
    let a = &args.args[0];
    let size = a.pushed_ty.size_of(cx.cfg.sizeof_gpr);
    let r1 = cx.input_reg(a);
    if cx.vars.is_tempvar(a.var) {
        // The register was loaded from a duplicate of the pushed
        // variable. If that duplicate is shared with another argument,
        // its dirty value must survive the reassignment.
        if is_shared_tempvar1(args) && cx.alloc.is_dirty(r1) {
            cx.flush_reg(r1);
        }
        cx.discard_overlapping(a.varpushed, 0, size, DiscardMode::AllOverlap);
        cx.alloc.reassign(r1, a.varpushed, 0);
    } else {
        cx.discard_overlapping(a.var, 0, size, DiscardMode::AllOverlapExceptRegForVar);
    }
    cx.alloc.mark_dirty(r1);
    r1
}

/// Change propagation for operators whose first operand is writable: only
/// programmer-declared variables participate; tempvars, readonly variables
/// and dereferences do not.
pub(crate) fn propagate_first_arg_change(cx: &mut Cx, args: &CallArgs) {
    let a = &args.args[0];
    if cx.vars.is_tempvar(a.varpushed) || cx.vars.get(a.varpushed).readonly {
        return;
    }
    let size = a.pushed_ty.size_of(cx.cfg.sizeof_gpr);
    propagate_var_change(&mut cx.vars, a.varpushed, 0, size);
}

/// Dispatch a native operator by name. The argument list is consumed as
/// the call-site descriptor; the returned variable is the operator's
/// result.
pub fn native_operator(cx: &mut Cx, name: &str, args: &mut CallArgs) -> EmitResult<Var> {
    if cx.pass == Pass::Second {
        cx.comment("begin: native operation");
    }
    let result = match name {
        "=" => assign::emit(cx, args),
        "++" | "--" => incdec::emit(cx, args, name),
        "!" | "?" => notistrue::emit(cx, args, name),
        "~" => negnot::emit(cx, args, name),
        "-" if args.args.len() == 1 => negnot::emit(cx, args, name),
        "<<" | ">>" => shift::emit(cx, args, name),
        "*" | "/" | "%" => muldiv::emit(cx, args, name),
        "+" | "-" => plusminus::emit(cx, args, name),
        "&" | "|" | "^" => bitwise::emit(cx, args, name),
        "==" | "!=" | "<" | "<=" | ">" | ">=" => comparison::emit(cx, args, name),
        "+=" | "-=" | "*=" | "/=" | "%=" | "<<=" | ">>=" | "&=" | "|=" | "^=" => {
            selfop::emit(cx, args, name)
        }
        _ => Err(CodegenError::UnknownOperator {
            op: name.to_owned(),
        }),
    }?;
    if cx.pass == Pass::Second {
        cx.comment("end: done");
    }
    Ok(result)
}
