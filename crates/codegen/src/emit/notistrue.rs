//! The `!` and `?` native operators.
//!
//! The result type is the natural unsigned word, which never needs sign
//! adjustment.

use super::*;

pub(super) fn emit(cx: &mut Cx, args: &mut CallArgs, name: &str) -> EmitResult<Var> {
    let a = args.args[0].clone();
    let word = Type::word(cx.cfg.sizeof_gpr);
    if let Some(n) = arg_number(cx, &a) {
        let v = if name == "!" { (n == 0) as i64 } else { (n != 0) as i64 };
        return Ok(cx.number_result(v, &word));
    }
    if cx.pass == Pass::First {
        return Ok(cx.temp_result(&word));
    }
    let r1 = cx.input_reg(&a);
    let result = cx.temp_result(&word);
    let rres = cx.output_reg(result, &word);
    let op = if name == "!" { Opcode::Sz } else { Opcode::Snz };
    cx.op2(op, rres, r1);
    cx.unlock(r1);
    cx.unlock(rres);
    Ok(result)
}
