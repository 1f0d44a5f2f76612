//! The `~` (bitwise not) and unary `-` (negation) native operators.

use super::*;

pub(super) fn emit(cx: &mut Cx, args: &mut CallArgs, name: &str) -> EmitResult<Var> {
    let a = args.args[0].clone();
    let ty = a.pushed_ty.clone();
    if let Some(n) = arg_number(cx, &a) {
        let v = if name == "~" { !n } else { n.wrapping_neg() };
        let v = extend_to_native(v, &ty);
        return Ok(cx.number_result(v, &ty));
    }
    if cx.pass == Pass::First {
        return Ok(cx.temp_result(&ty));
    }
    let r1 = cx.input_reg(&a);
    let result = cx.temp_result(&ty);
    let rres = cx.output_reg(result, &ty);
    let op = if name == "~" { Opcode::Not } else { Opcode::Neg };
    cx.op2(op, rres, r1);
    cx.unlock(r1);
    cx.unlock(rres);
    Ok(result)
}
