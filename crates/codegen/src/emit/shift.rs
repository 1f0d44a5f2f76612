//! The `<<` and `>>` native operators.
//!
//! Arithmetic versus logical right shift is chosen by the signedness of
//! the left operand's type. Three immediate forms distinguish
//! shift-reg-by-imm, shift-imm-by-reg, and fully literal operands.

use super::*;

pub(super) fn emit(cx: &mut Cx, args: &mut CallArgs, name: &str) -> EmitResult<Var> {
    let a = args.args[0].clone();
    let b = args.args[1].clone();
    let ty = a.pushed_ty.clone();
    let logical = ty.is_unsigned();
    let an = arg_number(cx, &a);
    let bn = arg_number(cx, &b);

    if let (Some(x), Some(y)) = (an, bn) {
        let sh = (y & 63) as u32;
        let v = if name == "<<" {
            x.wrapping_shl(sh)
        } else if logical {
            ((x as u64) >> sh) as i64
        } else {
            x >> sh
        };
        return Ok(cx.number_result(extend_to_native(v, &ty), &ty));
    }
    if cx.pass == Pass::First {
        return Ok(cx.temp_result(&ty));
    }

    let (op_rr, op_ri, op_ir) = if name == "<<" {
        (Opcode::Sll, Opcode::Slli, Opcode::Slli2)
    } else if logical {
        (Opcode::Srl, Opcode::Srli, Opcode::Srli2)
    } else {
        (Opcode::Sra, Opcode::Srai, Opcode::Srai2)
    };

    let result;
    match (an, bn) {
        (None, None) => {
            let r1 = cx.input_reg(&a);
            let r2 = cx.input_reg(&b);
            result = cx.temp_result(&ty);
            let rres = cx.output_reg(result, &ty);
            cx.op3(op_rr, rres, r1, r2);
            cx.unlock(r1);
            cx.unlock(r2);
            cx.unlock(rres);
        }
        (None, Some(y)) => {
            let r1 = cx.input_reg(&a);
            result = cx.temp_result(&ty);
            let rres = cx.output_reg(result, &ty);
            cx.op2i(op_ri, rres, r1, y);
            cx.unlock(r1);
            cx.unlock(rres);
        }
        (Some(x), None) => {
            let r2 = cx.input_reg(&b);
            result = cx.temp_result(&ty);
            let rres = cx.output_reg(result, &ty);
            cx.op2i(op_ir, rres, r2, x);
            cx.unlock(r2);
            cx.unlock(rres);
        }
        (Some(_), Some(_)) => unreachable!("folded above"),
    }
    Ok(result)
}
