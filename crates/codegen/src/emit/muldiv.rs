//! The `*`, `/` and `%` native operators.
//!
//! Signed versus unsigned division is selected by the first operand's
//! type. The immediate forms include the operand-reversed `divi2`,
//! `modi2`, `divui2` and `modui2` for a literal dividend.

use super::*;

pub(super) fn emit(cx: &mut Cx, args: &mut CallArgs, name: &str) -> EmitResult<Var> {
    let a = args.args[0].clone();
    let b = args.args[1].clone();
    let ty = a.pushed_ty.clone();
    let signed = !ty.is_unsigned();
    let an = arg_number(cx, &a);
    let bn = arg_number(cx, &b);

    if let (Some(x), Some(y)) = (an, bn) {
        // Division by a literal zero is left to the runtime form.
        let folded = match name {
            "*" => Some(x.wrapping_mul(y)),
            _ if y == 0 => None,
            "/" if signed => Some(x.wrapping_div(y)),
            "/" => Some(((x as u64) / (y as u64)) as i64),
            _ if signed => Some(x.wrapping_rem(y)),
            _ => Some(((x as u64) % (y as u64)) as i64),
        };
        if let Some(v) = folded {
            return Ok(cx.number_result(extend_to_native(v, &ty), &ty));
        }
    }
    if cx.pass == Pass::First {
        return Ok(cx.temp_result(&ty));
    }

    let (op_rr, op_ri, op_ir) = match (name, signed) {
        ("*", _) => (Opcode::Mul, Opcode::Muli, Opcode::Muli),
        ("/", true) => (Opcode::Div, Opcode::Divi, Opcode::Divi2),
        ("/", false) => (Opcode::Divu, Opcode::Divui, Opcode::Divui2),
        ("%", true) => (Opcode::Mod, Opcode::Modi, Opcode::Modi2),
        (_, false) => (Opcode::Modu, Opcode::Modui, Opcode::Modui2),
        (_, true) => (Opcode::Mod, Opcode::Modi, Opcode::Modi2),
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
            // Multiplication commutes; division and modulo use the
            // reversed-operand immediate forms.
            cx.op2i(op_ir, rres, r2, x);
            cx.unlock(r2);
            cx.unlock(rres);
        }
        (Some(x), Some(y)) => {
            // Reached only for an unfoldable literal division by zero.
            result = cx.temp_result(&ty);
            let rres = cx.output_reg(result, &ty);
            cx.li(rres, x);
            cx.op2i(op_ri, rres, rres, y);
            cx.unlock(rres);
        }
    }
    Ok(result)
}
