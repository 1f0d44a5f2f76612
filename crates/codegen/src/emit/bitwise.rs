//! The `&`, `|` and `^` native operators. The immediate forms commute.

use super::*;

pub(super) fn emit(cx: &mut Cx, args: &mut CallArgs, name: &str) -> EmitResult<Var> {
    let a = args.args[0].clone();
    let b = args.args[1].clone();
    let ty = a.pushed_ty.clone();
    let an = arg_number(cx, &a);
    let bn = arg_number(cx, &b);

    if let (Some(x), Some(y)) = (an, bn) {
        let v = match name {
            "&" => x & y,
            "|" => x | y,
            _ => x ^ y,
        };
        return Ok(cx.number_result(extend_to_native(v, &ty), &ty));
    }
    if cx.pass == Pass::First {
        return Ok(cx.temp_result(&ty));
    }

    let (op_rr, op_ri) = match name {
        "&" => (Opcode::And, Opcode::Andi),
        "|" => (Opcode::Or, Opcode::Ori),
        _ => (Opcode::Xor, Opcode::Xori),
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
        (None, Some(imm)) => {
            let r1 = cx.input_reg(&a);
            result = cx.temp_result(&ty);
            let rres = cx.output_reg(result, &ty);
            cx.op2i(op_ri, rres, r1, imm);
            cx.unlock(r1);
            cx.unlock(rres);
        }
        (Some(imm), None) => {
            let r2 = cx.input_reg(&b);
            result = cx.temp_result(&ty);
            let rres = cx.output_reg(result, &ty);
            cx.op2i(op_ri, rres, r2, imm);
            cx.unlock(r2);
            cx.unlock(rres);
        }
        (Some(_), Some(_)) => unreachable!("folded above"),
    }
    Ok(result)
}
