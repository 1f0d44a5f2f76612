//! Human-readable rendering of a compilation result.
//!
//! This is the text the driver stores to the cache `log` file when `-l`
//! is used. Functions are announced with a `# function_…` header carrying
//! their linking signature; instruction operands render as `%N` virtual
//! registers and immediates as sums of literal and symbolic terms.

use core::fmt::{self, Write};

use crate::backend::CompileResult;
use crate::entity::EntityRef;
use crate::ir::{Imm, ImmTerm, Opcode, Payload};

pub fn write_compile_result(out: &mut String, result: &CompileResult) -> fmt::Result {
    let prog = &result.program;
    for f in prog.iter() {
        let data = prog.func(f);
        match &data.linking_signature {
            Some(sig) if data.to_import != 0 => {
                writeln!(out, "# function_{:08x}:{sig}:{}", f.index(), data.to_import - 1)?;
            }
            Some(sig) => writeln!(out, "# function_{:08x}:{sig}", f.index())?,
            None => writeln!(out, "# function_{:08x}", f.index())?,
        }
        if data.to_export {
            writeln!(out, "# exported")?;
        }
        for i in data.iter() {
            let inst = data.inst(i);
            match (&inst.payload, inst.opcode) {
                (Some(Payload::Comment(text)), _) => {
                    writeln!(out, "\t# {text}")?;
                    continue;
                }
                (Some(Payload::MachineCode(bytes)), _) => {
                    writeln!(out, "\tmachinecode <{} bytes>", bytes.len())?;
                    continue;
                }
                (_, Opcode::Nop) => {
                    writeln!(out, "\tnop")?;
                    continue;
                }
                _ => {}
            }
            write!(out, "\t{} %{}", inst.opcode.mnemonic(), inst.r1.id())?;
            write!(out, ", %{}", inst.r2.id())?;
            write!(out, ", %{}", inst.r3.id())?;
            if let Some(imm) = &inst.imm {
                write!(out, ", ")?;
                write_imm(out, imm)?;
            }
            out.push('\n');
        }
    }
    Ok(())
}

fn write_imm(out: &mut String, imm: &Imm) -> fmt::Result {
    for (i, term) in imm.terms().iter().enumerate() {
        if i > 0 {
            out.push('+');
        }
        match term {
            ImmTerm::Value(v) => write!(out, "{v}")?,
            ImmTerm::InstOffset(inst) => write!(out, "label_{:08x}", inst.index())?,
            ImmTerm::FuncOffset(f) => write!(out, "function_{:08x}", f.index())?,
            ImmTerm::GlobalRegion => out.push_str("globalregion"),
            ImmTerm::StringRegion => out.push_str("stringregion"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InstructionData, Program, Reg};

    #[test]
    fn renders_functions_and_instructions() {
        let mut prog = Program::new();
        let root = prog.root();
        let mut add = InstructionData::new(Opcode::Add);
        add.r1 = Reg::new(1);
        add.r2 = Reg::new(2);
        add.r3 = Reg::new(3);
        prog.func_mut(root).append(add);
        let mut li = InstructionData::new(Opcode::Li);
        li.r1 = Reg::new(1);
        li.imm = Some(Imm::value(-5));
        prog.func_mut(root).append(li);
        let result = CompileResult {
            program: prog,
            string_region: Vec::new(),
            global_region_size: 0,
            src_file_paths: Vec::new(),
        };
        let mut out = String::new();
        write_compile_result(&mut out, &result).unwrap();
        assert!(out.starts_with("# function_00000000\n"));
        assert!(out.contains("\tadd %1, %2, %3\n"));
        assert!(out.contains("\tli %1, %0, %0, -5\n"));
    }
}
