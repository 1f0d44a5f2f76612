//! Interpreter for the portable encoding.
//!
//! The image loads at address 0 of a flat memory: instructions, the
//! constant-string region, the global region (zeroed), then a stack whose
//! top is the initial stack pointer (register 0). Execution starts at the
//! root function's first instruction and halts at a `jpop` with an empty
//! call stack; register 1 at that point is the exit value.

use lyrical_codegen::backend::BackendResult;
use lyrical_codegen::ir::Opcode;
use lyrical_codegen::RegionAlignment;

use crate::encode::decode;

#[derive(Debug, thiserror::Error)]
pub enum InterpError {
    #[error("invalid instruction encoding at offset {0:#x}")]
    BadEncoding(u64),
    #[error("memory fault at address {addr:#x} (pc {pc:#x})")]
    Fault { pc: u64, addr: u64 },
    #[error("integer division by zero at pc {0:#x}")]
    DivideByZero(u64),
    #[error("machinecode payloads are backend-specific and cannot be interpreted (pc {0:#x})")]
    MachineCode(u64),
    #[error("step limit of {0} exceeded")]
    StepLimit(u64),
}

pub struct RunConfig {
    pub stack_size: usize,
    pub step_limit: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stack_size: 64 * 1024,
            step_limit: 50_000_000,
        }
    }
}

/// Result of a completed run.
#[derive(Debug)]
pub struct Outcome {
    /// Value of register 1 when the program returned.
    pub exit: u64,
    pub steps: u64,
    /// Final memory image, for inspection of the global region.
    pub memory: Vec<u8>,
    /// Offset of the global region within `memory`.
    pub global_base: usize,
}

struct Machine {
    regs: [u64; 256],
    mem: Vec<u8>,
    initial_sp: u64,
}

impl Machine {
    fn reg(&self, r: u8) -> u64 {
        self.regs[r as usize]
    }

    fn set_reg(&mut self, r: u8, v: u64) {
        self.regs[r as usize] = v;
    }

    fn load(&self, pc: u64, addr: u64, size: u32) -> Result<u64, InterpError> {
        let a = addr as usize;
        let bytes = self
            .mem
            .get(a..a + size as usize)
            .ok_or(InterpError::Fault { pc, addr })?;
        let mut v = 0u64;
        for (i, b) in bytes.iter().enumerate() {
            v |= u64::from(*b) << (8 * i);
        }
        Ok(v)
    }

    fn store(&mut self, pc: u64, addr: u64, size: u32, value: u64) -> Result<(), InterpError> {
        let a = addr as usize;
        let bytes = self
            .mem
            .get_mut(a..a + size as usize)
            .ok_or(InterpError::Fault { pc, addr })?;
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (value >> (8 * i)) as u8;
        }
        Ok(())
    }

    fn push(&mut self, pc: u64, value: u64) -> Result<(), InterpError> {
        let sp = self.regs[0].wrapping_sub(8);
        self.store(pc, sp, 8, value)?;
        self.regs[0] = sp;
        Ok(())
    }

    fn pop(&mut self, pc: u64) -> Result<u64, InterpError> {
        let sp = self.regs[0];
        let v = self.load(pc, sp, 8)?;
        self.regs[0] = sp.wrapping_add(8);
        Ok(v)
    }
}

/// Execute an encoded program.
pub fn run(
    result: &BackendResult,
    alignment: RegionAlignment,
    config: &RunConfig,
) -> Result<Outcome, InterpError> {
    let region_align = match alignment {
        RegionAlignment::Compact => 4usize,
        _ => 4096,
    };
    let instr_size = result.executable_instr_size as usize;
    let strings_base = instr_size.next_multiple_of(region_align);
    let global_base =
        (strings_base + result.constant_strings_size as usize).next_multiple_of(region_align);
    let mem_size = global_base + result.global_region_size as usize + config.stack_size;

    let mut m = Machine {
        regs: [0; 256],
        mem: vec![0; mem_size],
        initial_sp: mem_size as u64,
    };
    m.mem[..result.exec.len()].copy_from_slice(&result.exec);
    m.regs[0] = m.initial_sp;

    let mut pc = 0u64;
    let mut steps = 0u64;
    loop {
        steps += 1;
        if steps > config.step_limit {
            return Err(InterpError::StepLimit(config.step_limit));
        }
        if pc as usize >= instr_size {
            return Err(InterpError::Fault { pc, addr: pc });
        }
        let d = {
            let d = decode(&m.mem, pc as usize).ok_or(InterpError::BadEncoding(pc))?;
            Op {
                opcode: d.opcode,
                r1: d.r1,
                r2: d.r2,
                r3: d.r3,
                imm: d.imm,
                size: d.size,
            }
        };
        match step(&mut m, pc, d)? {
            Flow::Next => pc += u64::from(d.size),
            Flow::Jump(target) => pc = target,
            Flow::Halt => {
                return Ok(Outcome {
                    exit: m.regs[1],
                    steps,
                    memory: m.mem,
                    global_base,
                });
            }
        }
    }
}

enum Flow {
    Next,
    Jump(u64),
    Halt,
}

/// The scalar fields of a decoded instruction, detached from the memory
/// borrow so execution can mutate the machine.
#[derive(Copy, Clone)]
struct Op {
    opcode: Opcode,
    r1: u8,
    r2: u8,
    r3: u8,
    imm: Option<i64>,
    size: u32,
}

fn rel(pc: u64, imm: i64) -> u64 {
    pc.wrapping_add(imm as u64)
}

fn mulh_signed(a: u64, b: u64) -> u64 {
    (((a as i64 as i128) * (b as i64 as i128)) >> 64) as u64
}

fn mulh_unsigned(a: u64, b: u64) -> u64 {
    ((u128::from(a) * u128::from(b)) >> 64) as u64
}

fn step(m: &mut Machine, pc: u64, d: Op) -> Result<Flow, InterpError> {
    use Opcode::*;
    let imm = d.imm.unwrap_or(0);
    let immu = imm as u64;
    let next_pc = pc + u64::from(d.size);
    let (a, b, c) = (d.r1, d.r2, d.r3);
    let rb = m.reg(b);
    let rc = m.reg(c);

    macro_rules! div_checked {
        ($n:expr, $d:expr, $signed:expr, $rem:expr) => {{
            let den = $d;
            if den == 0 {
                return Err(InterpError::DivideByZero(pc));
            }
            let num = $n;
            if $signed {
                let (num, den) = (num as i64, den as i64);
                (if $rem {
                    num.wrapping_rem(den)
                } else {
                    num.wrapping_div(den)
                }) as u64
            } else if $rem {
                num % den
            } else {
                num / den
            }
        }};
    }

    match d.opcode {
        Add => m.set_reg(a, rb.wrapping_add(rc)),
        Addi => m.set_reg(a, rb.wrapping_add(immu)),
        Sub => m.set_reg(a, rb.wrapping_sub(rc)),
        Neg => m.set_reg(a, rb.wrapping_neg()),
        Mul => m.set_reg(a, rb.wrapping_mul(rc)),
        Muli => m.set_reg(a, rb.wrapping_mul(immu)),
        Mulh => m.set_reg(a, mulh_signed(rb, rc)),
        Mulhi => m.set_reg(a, mulh_signed(rb, immu)),
        Mulhu => m.set_reg(a, mulh_unsigned(rb, rc)),
        Mulhui => m.set_reg(a, mulh_unsigned(rb, immu)),
        Div => m.set_reg(a, div_checked!(rb, rc, true, false)),
        Divi => m.set_reg(a, div_checked!(rb, immu, true, false)),
        Divi2 => m.set_reg(a, div_checked!(immu, rb, true, false)),
        Divu => m.set_reg(a, div_checked!(rb, rc, false, false)),
        Divui => m.set_reg(a, div_checked!(rb, immu, false, false)),
        Divui2 => m.set_reg(a, div_checked!(immu, rb, false, false)),
        Mod => m.set_reg(a, div_checked!(rb, rc, true, true)),
        Modi => m.set_reg(a, div_checked!(rb, immu, true, true)),
        Modi2 => m.set_reg(a, div_checked!(immu, rb, true, true)),
        Modu => m.set_reg(a, div_checked!(rb, rc, false, true)),
        Modui => m.set_reg(a, div_checked!(rb, immu, false, true)),
        Modui2 => m.set_reg(a, div_checked!(immu, rb, false, true)),

        And => m.set_reg(a, rb & rc),
        Andi => m.set_reg(a, rb & immu),
        Or => m.set_reg(a, rb | rc),
        Ori => m.set_reg(a, rb | immu),
        Xor => m.set_reg(a, rb ^ rc),
        Xori => m.set_reg(a, rb ^ immu),
        Not => m.set_reg(a, !rb),
        Cpy => m.set_reg(a, rb),
        Sll => m.set_reg(a, rb.wrapping_shl(rc as u32 & 63)),
        Slli => m.set_reg(a, rb.wrapping_shl(immu as u32 & 63)),
        Slli2 => m.set_reg(a, immu.wrapping_shl(rb as u32 & 63)),
        Srl => m.set_reg(a, rb.wrapping_shr(rc as u32 & 63)),
        Srli => m.set_reg(a, rb.wrapping_shr(immu as u32 & 63)),
        Srli2 => m.set_reg(a, immu.wrapping_shr(rb as u32 & 63)),
        Sra => m.set_reg(a, ((rb as i64).wrapping_shr(rc as u32 & 63)) as u64),
        Srai => m.set_reg(a, ((rb as i64).wrapping_shr(immu as u32 & 63)) as u64),
        Srai2 => m.set_reg(a, (imm.wrapping_shr(rb as u32 & 63)) as u64),
        Zxt => {
            let bits = immu as u32;
            if bits != 0 && bits < 64 {
                m.set_reg(a, rb & ((1u64 << bits) - 1));
            } else {
                m.set_reg(a, rb);
            }
        }
        Sxt => {
            let bits = immu as u32;
            if bits != 0 && bits < 64 {
                let shift = 64 - bits;
                m.set_reg(a, (((rb << shift) as i64) >> shift) as u64);
            } else {
                m.set_reg(a, rb);
            }
        }

        Seq => m.set_reg(a, u64::from(rb == rc)),
        Seqi => m.set_reg(a, u64::from(rb == immu)),
        Sne => m.set_reg(a, u64::from(rb != rc)),
        Snei => m.set_reg(a, u64::from(rb != immu)),
        Slt => m.set_reg(a, u64::from((rb as i64) < (rc as i64))),
        Slte => m.set_reg(a, u64::from((rb as i64) <= (rc as i64))),
        Sltu => m.set_reg(a, u64::from(rb < rc)),
        Slteu => m.set_reg(a, u64::from(rb <= rc)),
        Slti => m.set_reg(a, u64::from((rb as i64) < imm)),
        Sltei => m.set_reg(a, u64::from((rb as i64) <= imm)),
        Sltui => m.set_reg(a, u64::from(rb < immu)),
        Slteui => m.set_reg(a, u64::from(rb <= immu)),
        Sgti => m.set_reg(a, u64::from((rb as i64) > imm)),
        Sgtei => m.set_reg(a, u64::from((rb as i64) >= imm)),
        Sgtui => m.set_reg(a, u64::from(rb > immu)),
        Sgteui => m.set_reg(a, u64::from(rb >= immu)),
        Sz => m.set_reg(a, u64::from(rb == 0)),
        Snz => m.set_reg(a, u64::from(rb != 0)),

        Jeq if m.reg(a) == rb => return Ok(Flow::Jump(rel(pc, imm))),
        Jeqi if m.reg(a) == rb => return Ok(Flow::Jump(immu)),
        Jeqr if m.reg(a) == rb => return Ok(Flow::Jump(rc)),
        Jne if m.reg(a) != rb => return Ok(Flow::Jump(rel(pc, imm))),
        Jnei if m.reg(a) != rb => return Ok(Flow::Jump(immu)),
        Jner if m.reg(a) != rb => return Ok(Flow::Jump(rc)),
        Jlt if (m.reg(a) as i64) < (rb as i64) => return Ok(Flow::Jump(rel(pc, imm))),
        Jlti if (m.reg(a) as i64) < (rb as i64) => return Ok(Flow::Jump(immu)),
        Jltr if (m.reg(a) as i64) < (rb as i64) => return Ok(Flow::Jump(rc)),
        Jlte if (m.reg(a) as i64) <= (rb as i64) => return Ok(Flow::Jump(rel(pc, imm))),
        Jltei if (m.reg(a) as i64) <= (rb as i64) => return Ok(Flow::Jump(immu)),
        Jlter if (m.reg(a) as i64) <= (rb as i64) => return Ok(Flow::Jump(rc)),
        Jltu if m.reg(a) < rb => return Ok(Flow::Jump(rel(pc, imm))),
        Jltui if m.reg(a) < rb => return Ok(Flow::Jump(immu)),
        Jltur if m.reg(a) < rb => return Ok(Flow::Jump(rc)),
        Jlteu if m.reg(a) <= rb => return Ok(Flow::Jump(rel(pc, imm))),
        Jlteui if m.reg(a) <= rb => return Ok(Flow::Jump(immu)),
        Jlteur if m.reg(a) <= rb => return Ok(Flow::Jump(rc)),
        Jz if m.reg(a) == 0 => return Ok(Flow::Jump(rel(pc, imm))),
        Jzi if m.reg(a) == 0 => return Ok(Flow::Jump(immu)),
        Jzr if m.reg(a) == 0 => return Ok(Flow::Jump(rb)),
        Jnz if m.reg(a) != 0 => return Ok(Flow::Jump(rel(pc, imm))),
        Jnzi if m.reg(a) != 0 => return Ok(Flow::Jump(immu)),
        Jnzr if m.reg(a) != 0 => return Ok(Flow::Jump(rb)),
        Jeq | Jeqi | Jeqr | Jne | Jnei | Jner | Jlt | Jlti | Jltr | Jlte | Jltei | Jlter
        | Jltu | Jltui | Jltur | Jlteu | Jlteui | Jlteur | Jz | Jzi | Jzr | Jnz | Jnzi
        | Jnzr => {}
        J => return Ok(Flow::Jump(rel(pc, imm))),
        Ji => return Ok(Flow::Jump(immu)),
        Jr => return Ok(Flow::Jump(m.reg(a))),
        Jl => {
            m.set_reg(a, next_pc);
            return Ok(Flow::Jump(rel(pc, imm)));
        }
        Jli => {
            m.set_reg(a, next_pc);
            return Ok(Flow::Jump(immu));
        }
        Jlr => {
            m.set_reg(a, next_pc);
            return Ok(Flow::Jump(rb));
        }
        Jpush => {
            m.push(pc, next_pc)?;
            return Ok(Flow::Jump(rel(pc, imm)));
        }
        Jpushi => {
            m.push(pc, next_pc)?;
            return Ok(Flow::Jump(immu));
        }
        Jpushr => {
            m.push(pc, next_pc)?;
            return Ok(Flow::Jump(m.reg(a)));
        }
        Jpop => {
            if m.regs[0] == m.initial_sp {
                return Ok(Flow::Halt);
            }
            let target = m.pop(pc)?;
            return Ok(Flow::Jump(target));
        }

        Afip => m.set_reg(a, rel(pc, imm)),
        Li => m.set_reg(a, immu),

        Ld8 => {
            let v = m.load(pc, rb.wrapping_add(immu), 1)?;
            m.set_reg(a, v);
        }
        Ld8r => {
            let v = m.load(pc, rb, 1)?;
            m.set_reg(a, v);
        }
        Ld8i => {
            let v = m.load(pc, immu, 1)?;
            m.set_reg(a, v);
        }
        Ld16 => {
            let v = m.load(pc, rb.wrapping_add(immu), 2)?;
            m.set_reg(a, v);
        }
        Ld16r => {
            let v = m.load(pc, rb, 2)?;
            m.set_reg(a, v);
        }
        Ld16i => {
            let v = m.load(pc, immu, 2)?;
            m.set_reg(a, v);
        }
        Ld32 => {
            let v = m.load(pc, rb.wrapping_add(immu), 4)?;
            m.set_reg(a, v);
        }
        Ld32r => {
            let v = m.load(pc, rb, 4)?;
            m.set_reg(a, v);
        }
        Ld32i => {
            let v = m.load(pc, immu, 4)?;
            m.set_reg(a, v);
        }
        Ld64 => {
            let v = m.load(pc, rb.wrapping_add(immu), 8)?;
            m.set_reg(a, v);
        }
        Ld64r => {
            let v = m.load(pc, rb, 8)?;
            m.set_reg(a, v);
        }
        Ld64i => {
            let v = m.load(pc, immu, 8)?;
            m.set_reg(a, v);
        }

        St8 => m.store(pc, rb.wrapping_add(immu), 1, m.reg(a))?,
        St8r => m.store(pc, rb, 1, m.reg(a))?,
        St8i => m.store(pc, immu, 1, m.reg(a))?,
        St16 => m.store(pc, rb.wrapping_add(immu), 2, m.reg(a))?,
        St16r => m.store(pc, rb, 2, m.reg(a))?,
        St16i => m.store(pc, immu, 2, m.reg(a))?,
        St32 => m.store(pc, rb.wrapping_add(immu), 4, m.reg(a))?,
        St32r => m.store(pc, rb, 4, m.reg(a))?,
        St32i => m.store(pc, immu, 4, m.reg(a))?,
        St64 => m.store(pc, rb.wrapping_add(immu), 8, m.reg(a))?,
        St64r => m.store(pc, rb, 8, m.reg(a))?,
        St64i => m.store(pc, immu, 8, m.reg(a))?,

        Ldst8 | Ldst8r | Ldst8i | Ldst16 | Ldst16r | Ldst16i | Ldst32 | Ldst32r | Ldst32i
        | Ldst64 | Ldst64r | Ldst64i => {
            let size = match d.opcode {
                Ldst8 | Ldst8r | Ldst8i => 1,
                Ldst16 | Ldst16r | Ldst16i => 2,
                Ldst32 | Ldst32r | Ldst32i => 4,
                _ => 8,
            };
            let addr = match d.opcode {
                Ldst8 | Ldst16 | Ldst32 | Ldst64 => rb.wrapping_add(immu),
                Ldst8r | Ldst16r | Ldst32r | Ldst64r => rb,
                _ => immu,
            };
            let old = m.load(pc, addr, size)?;
            m.store(pc, addr, size, m.reg(a))?;
            m.set_reg(a, old);
        }

        Mem8cpy | Mem8cpyi | Mem8cpy2 | Mem8cpyi2 | Mem16cpy | Mem16cpyi | Mem16cpy2
        | Mem16cpyi2 | Mem32cpy | Mem32cpyi | Mem32cpy2 | Mem32cpyi2 | Mem64cpy | Mem64cpyi
        | Mem64cpy2 | Mem64cpyi2 => {
            let unit: u64 = match d.opcode {
                Mem8cpy | Mem8cpyi | Mem8cpy2 | Mem8cpyi2 => 1,
                Mem16cpy | Mem16cpyi | Mem16cpy2 | Mem16cpyi2 => 2,
                Mem32cpy | Mem32cpyi | Mem32cpy2 | Mem32cpyi2 => 4,
                _ => 8,
            };
            let by_register = matches!(
                d.opcode,
                Mem8cpy | Mem8cpy2 | Mem16cpy | Mem16cpy2 | Mem32cpy | Mem32cpy2 | Mem64cpy
                    | Mem64cpy2
            );
            let decrement = matches!(
                d.opcode,
                Mem8cpy2 | Mem8cpyi2 | Mem16cpy2 | Mem16cpyi2 | Mem32cpy2 | Mem32cpyi2
                    | Mem64cpy2 | Mem64cpyi2
            );
            let count = if by_register { rc } else { immu };
            let mut dst = m.reg(a);
            let mut src = rb;
            for _ in 0..count {
                let v = m.load(pc, src, unit as u32)?;
                m.store(pc, dst, unit as u32, v)?;
                if decrement {
                    dst = dst.wrapping_sub(unit);
                    src = src.wrapping_sub(unit);
                } else {
                    dst = dst.wrapping_add(unit);
                    src = src.wrapping_add(unit);
                }
            }
            m.set_reg(a, dst);
            m.set_reg(b, src);
            if by_register {
                m.set_reg(c, 0);
            }
        }

        Pagealloc | Pagealloci | Stackpagealloc => {
            let pages = match d.opcode {
                Pagealloc => rb,
                Pagealloci => immu,
                _ => 1,
            };
            let base = m.mem.len() as u64;
            m.mem.extend(core::iter::repeat(0).take((pages * 4096) as usize));
            m.set_reg(a, base);
        }
        Pagefree | Pagefreei | Stackpagefree => {
            // Pages are never returned to the flat memory model.
        }

        Machinecode => return Err(InterpError::MachineCode(pc)),
        Nop | Comment => {}
    }
    Ok(Flow::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lyrical_codegen::backend::CompileResult;
    use lyrical_codegen::ir::{Imm, InstructionData, Program, Reg};

    fn build(insts: Vec<InstructionData>) -> BackendResult {
        let mut prog = Program::new();
        let root = prog.root();
        for i in insts {
            prog.func_mut(root).append(i);
        }
        let result = CompileResult {
            program: prog,
            string_region: Vec::new(),
            global_region_size: 64,
            src_file_paths: Vec::new(),
        };
        crate::encode::encode(&result, RegionAlignment::Compact, 8, false).unwrap()
    }

    fn li(r: u32, v: i64) -> InstructionData {
        let mut i = InstructionData::new(Opcode::Li);
        i.r1 = Reg::new(r);
        i.imm = Some(Imm::value(v));
        i
    }

    fn op3(op: Opcode, a: u32, b: u32, c: u32) -> InstructionData {
        let mut i = InstructionData::new(op);
        i.r1 = Reg::new(a);
        i.r2 = Reg::new(b);
        i.r3 = Reg::new(c);
        i
    }

    #[test]
    fn arithmetic_and_halt() {
        let out = build(vec![
            li(2, 5),
            li(3, 7),
            op3(Opcode::Add, 1, 2, 3),
            InstructionData::new(Opcode::Jpop),
        ]);
        let got = run(&out, RegionAlignment::Compact, &RunConfig::default()).unwrap();
        assert_eq!(got.exit, 12);
    }

    #[test]
    fn stores_land_in_the_global_region() {
        let mut st = InstructionData::new(Opcode::St64);
        st.r1 = Reg::new(1);
        st.r2 = Reg::new(2);
        st.imm = Some(Imm::global_region());
        let out = build(vec![li(1, 0x1122334455667788), li(2, 0), st, {
            InstructionData::new(Opcode::Jpop)
        }]);
        let got = run(&out, RegionAlignment::Compact, &RunConfig::default()).unwrap();
        let g = &got.memory[got.global_base..got.global_base + 8];
        assert_eq!(u64::from_le_bytes(g.try_into().unwrap()), 0x1122334455667788);
    }

    #[test]
    fn conditional_branches_loop() {
        // r1 = 3; while (r1) r1--;  then return.
        let mut prog = Program::new();
        let root = prog.root();
        let load = {
            let f = prog.func_mut(root);
            f.append(li(1, 3))
        };
        let dec = {
            let f = prog.func_mut(root);
            let mut i = InstructionData::new(Opcode::Addi);
            i.r1 = Reg::new(1);
            i.r2 = Reg::new(1);
            i.imm = Some(Imm::value(-1));
            f.append(i)
        };
        let _ = load;
        {
            let f = prog.func_mut(root);
            let mut j = InstructionData::new(Opcode::Jnz);
            j.r1 = Reg::new(1);
            j.imm = Some(Imm::inst(dec));
            f.append(j);
            f.append(InstructionData::new(Opcode::Jpop));
        }
        let result = CompileResult {
            program: prog,
            string_region: Vec::new(),
            global_region_size: 0,
            src_file_paths: Vec::new(),
        };
        let out = crate::encode::encode(&result, RegionAlignment::Compact, 8, false).unwrap();
        let got = run(&out, RegionAlignment::Compact, &RunConfig::default()).unwrap();
        assert_eq!(got.exit, 0);
    }

    #[test]
    fn jpush_and_jpop_nest_calls() {
        // jpush over the next instruction, which the callee returns to.
        let mut prog = Program::new();
        let root = prog.root();
        let (callee_li, _ret) = {
            let f = prog.func_mut(root);
            // Layout: jpush -> li(skipped) ... callee at the end.
            let jp = InstructionData::new(Opcode::Jpush);
            let mut jp = jp;
            let li_after = li(1, 1);
            let halt = InstructionData::new(Opcode::Jpop);
            let mut callee = li(2, 99);
            callee.r1 = Reg::new(2);
            let ret = InstructionData::new(Opcode::Jpop);
            // Append in executable order: jpush, li, jpop(halt), callee,
            // jpop(return).
            let jp_id = f.append({
                jp.r1 = Reg::SP;
                jp
            });
            f.append(li_after);
            f.append(halt);
            let callee_id = f.append(callee);
            let ret_id = f.append(ret);
            // Patch the jpush target to the callee.
            f.inst_mut(jp_id).imm = Some(Imm::inst(callee_id));
            (callee_id, ret_id)
        };
        let _ = callee_li;
        let result = CompileResult {
            program: prog,
            string_region: Vec::new(),
            global_region_size: 0,
            src_file_paths: Vec::new(),
        };
        let out = crate::encode::encode(&result, RegionAlignment::Compact, 8, false).unwrap();
        let got = run(&out, RegionAlignment::Compact, &RunConfig::default()).unwrap();
        // The callee ran (r2 = 99 has no effect on exit), then returned to
        // the li that sets r1 = 1, then halted.
        assert_eq!(got.exit, 1);
    }

    #[test]
    fn division_by_zero_is_reported() {
        let out = build(vec![li(2, 1), {
            let mut d = InstructionData::new(Opcode::Div);
            d.r1 = Reg::new(1);
            d.r2 = Reg::new(2);
            d.r3 = Reg::new(3);
            d
        }]);
        let err = run(&out, RegionAlignment::Compact, &RunConfig::default()).unwrap_err();
        assert!(matches!(err, InterpError::DivideByZero(_)));
    }

    #[test]
    fn out_of_bounds_access_faults() {
        let out = build(vec![{
            let mut l = InstructionData::new(Opcode::Ld64i);
            l.r1 = Reg::new(1);
            l.imm = Some(Imm::value(i64::MAX));
            l
        }]);
        let err = run(&out, RegionAlignment::Compact, &RunConfig::default()).unwrap_err();
        assert!(matches!(err, InterpError::Fault { .. }));
    }

    #[test]
    fn machinecode_is_rejected() {
        let out = build(vec![{
            let mut m = InstructionData::new(Opcode::Machinecode);
            m.payload = Some(lyrical_codegen::Payload::MachineCode(vec![0x90]));
            m
        }]);
        let err = run(&out, RegionAlignment::Compact, &RunConfig::default()).unwrap_err();
        assert!(matches!(err, InterpError::MachineCode(_)));
    }

    #[test]
    fn runaway_programs_hit_the_step_limit() {
        let mut prog = Program::new();
        let root = prog.root();
        let target = {
            let f = prog.func_mut(root);
            let mut j = InstructionData::new(Opcode::J);
            j.imm = Some(Imm::value(0));
            f.append(j)
        };
        prog.func_mut(root).inst_mut(target).imm = Some(Imm::inst(target));
        let result = CompileResult {
            program: prog,
            string_region: Vec::new(),
            global_region_size: 0,
            src_file_paths: Vec::new(),
        };
        let out = crate::encode::encode(&result, RegionAlignment::Compact, 8, false).unwrap();
        let cfg = RunConfig {
            step_limit: 1000,
            ..Default::default()
        };
        let err = run(&out, RegionAlignment::Compact, &cfg).unwrap_err();
        assert!(matches!(err, InterpError::StepLimit(_)));
    }
}

