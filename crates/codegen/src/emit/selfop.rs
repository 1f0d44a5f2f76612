//! The compound-assignment native operators (`+=`, `-=`, `*=`, `/=`,
//! `%=`, `<<=`, `>>=`, `&=`, `|=`, `^=`).
//!
//! Same operator rules as the binary forms, with the register
//! reassignment, tempvar-sharing, discard-overlap and volatile-flush
//! behavior of `++`/`--`. The first argument is returned.

use super::*;

pub(super) fn emit(cx: &mut Cx, args: &mut CallArgs, name: &str) -> EmitResult<Var> {
    let a = args.args[0].clone();
    let b = args.args[1].clone();
    let resultvar = a.varpushed;
    if cx.vars.get(resultvar).readonly {
        return Err(CodegenError::ReadonlyLeft { op: name.into() });
    }
    let base = &name[..name.len() - 1];
    if matches!(base, "+" | "-") && b.pushed_ty.is_pointer() {
        return Err(CodegenError::PointerSecondOperand { op: name.into() });
    }
    propagate_first_arg_change(cx, args);

    if cx.pass == Pass::First {
        return Ok(resultvar);
    }

    let ty = a.pushed_ty.clone();
    let signed = !ty.is_unsigned();
    let bn = arg_number(cx, &b);
    let r1 = prepare_inout_reg(cx, args);

    match base {
        "+" | "-" => {
            let plus = base == "+";
            let strd = if ty.is_pointer() {
                i64::from(stride(&ty, cx.cfg.sizeof_gpr))
            } else {
                1
            };
            match bn {
                Some(y) => {
                    let y = y.wrapping_mul(strd);
                    cx.addi(r1, r1, if plus { y } else { y.wrapping_neg() });
                }
                None => {
                    let r2 = cx.input_reg(&b);
                    if strd != 1 {
                        // The stride multiplication needs a scratch that
                        // must not clobber either operand.
                        let t = cx.temp_result(&ty);
                        let rt = cx.output_reg(t, &ty);
                        cx.op2i(Opcode::Muli, rt, r2, strd);
                        if plus {
                            cx.op3(Opcode::Add, r1, r1, rt);
                        } else {
                            cx.op3(Opcode::Sub, r1, r1, rt);
                        }
                        cx.unlock(rt);
                        let size = ty.size_of(cx.cfg.sizeof_gpr);
                        cx.discard_overlapping(t, 0, size, DiscardMode::AllOverlap);
                    } else if plus {
                        cx.op3(Opcode::Add, r1, r1, r2);
                    } else {
                        cx.op3(Opcode::Sub, r1, r1, r2);
                    }
                    cx.unlock(r2);
                }
            }
        }
        "*" | "/" | "%" => {
            let (op_rr, op_ri) = match (base, signed) {
                ("*", _) => (Opcode::Mul, Opcode::Muli),
                ("/", true) => (Opcode::Div, Opcode::Divi),
                ("/", false) => (Opcode::Divu, Opcode::Divui),
                (_, true) => (Opcode::Mod, Opcode::Modi),
                (_, false) => (Opcode::Modu, Opcode::Modui),
            };
            match bn {
                Some(y) => {
                    cx.op2i(op_ri, r1, r1, y);
                }
                None => {
                    let r2 = cx.input_reg(&b);
                    cx.op3(op_rr, r1, r1, r2);
                    cx.unlock(r2);
                }
            }
        }
        "<<" | ">>" => {
            let (op_rr, op_ri) = if base == "<<" {
                (Opcode::Sll, Opcode::Slli)
            } else if !signed {
                (Opcode::Srl, Opcode::Srli)
            } else {
                (Opcode::Sra, Opcode::Srai)
            };
            match bn {
                Some(y) => {
                    cx.op2i(op_ri, r1, r1, y);
                }
                None => {
                    let r2 = cx.input_reg(&b);
                    cx.op3(op_rr, r1, r1, r2);
                    cx.unlock(r2);
                }
            }
        }
        _ => {
            let (op_rr, op_ri) = match base {
                "&" => (Opcode::And, Opcode::Andi),
                "|" => (Opcode::Or, Opcode::Ori),
                _ => (Opcode::Xor, Opcode::Xori),
            };
            match bn {
                Some(y) => {
                    cx.op2i(op_ri, r1, r1, y);
                }
                None => {
                    let r2 = cx.input_reg(&b);
                    cx.op3(op_rr, r1, r1, r2);
                    cx.unlock(r2);
                }
            }
        }
    }

    if cx.is_volatile(resultvar) {
        cx.flush_reg(r1);
        let size = ty.size_of(cx.cfg.sizeof_gpr);
        cx.discard_overlapping(resultvar, 0, size, DiscardMode::AllOverlap);
    }
    cx.unlock(r1);
    Ok(resultvar)
}
