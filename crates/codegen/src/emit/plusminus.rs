//! The binary `+` and `-` native operators.
//!
//! Only the first operand can be a pointer: `ptr + 3` manipulates the
//! pointer, `3 + ptr` adds an address to a number and is rejected when the
//! second operand is itself a pointer. A pointer first operand multiplies
//! the second operand by its stride. A literal second operand of `-` is
//! lowered as `addi` of the negated immediate; a literal first operand is
//! lowered as `neg` then `addi`.

use super::*;

pub(super) fn emit(cx: &mut Cx, args: &mut CallArgs, name: &str) -> EmitResult<Var> {
    let a = args.args[0].clone();
    let b = args.args[1].clone();
    let ty = a.pushed_ty.clone();
    if b.pushed_ty.is_pointer() {
        return Err(CodegenError::PointerSecondOperand { op: name.into() });
    }
    let plus = name == "+";
    let ptr = ty.is_pointer();
    let strd = if ptr {
        i64::from(stride(&ty, cx.cfg.sizeof_gpr))
    } else {
        1
    };
    let an = arg_number(cx, &a);
    let bn = arg_number(cx, &b);

    if let (Some(x), Some(y)) = (an, bn) {
        let y = y.wrapping_mul(strd);
        let v = if plus {
            x.wrapping_add(y)
        } else {
            x.wrapping_sub(y)
        };
        return Ok(cx.number_result(extend_to_native(v, &ty), &ty));
    }
    if cx.pass == Pass::First {
        return Ok(cx.temp_result(&ty));
    }

    let result;
    match (an, bn) {
        (None, None) => {
            let r1 = cx.input_reg(&a);
            let r2 = cx.input_reg(&b);
            result = cx.temp_result(&ty);
            let rres = cx.output_reg(result, &ty);
            if ptr {
                cx.op2i(Opcode::Muli, rres, r2, strd);
                if plus {
                    cx.op3(Opcode::Add, rres, r1, rres);
                } else {
                    cx.op3(Opcode::Sub, rres, r1, rres);
                }
            } else if plus {
                cx.op3(Opcode::Add, rres, r1, r2);
            } else {
                cx.op3(Opcode::Sub, rres, r1, r2);
            }
            cx.unlock(r1);
            cx.unlock(r2);
            cx.unlock(rres);
        }
        (None, Some(y)) => {
            let r1 = cx.input_reg(&a);
            result = cx.temp_result(&ty);
            let rres = cx.output_reg(result, &ty);
            let y = y.wrapping_mul(strd);
            cx.addi(rres, r1, if plus { y } else { y.wrapping_neg() });
            cx.unlock(r1);
            cx.unlock(rres);
        }
        (Some(x), None) => {
            let r2 = cx.input_reg(&b);
            result = cx.temp_result(&ty);
            let rres = cx.output_reg(result, &ty);
            if ptr {
                cx.op2i(Opcode::Muli, rres, r2, strd);
                if plus {
                    cx.addi(rres, rres, x);
                } else {
                    cx.op2(Opcode::Neg, rres, rres);
                    cx.addi(rres, rres, x);
                }
            } else if plus {
                cx.addi(rres, r2, x);
            } else {
                cx.op2(Opcode::Neg, rres, r2);
                cx.addi(rres, rres, x);
            }
            cx.unlock(r2);
            cx.unlock(rres);
        }
        (Some(_), Some(_)) => unreachable!("folded above"),
    }
    Ok(result)
}
