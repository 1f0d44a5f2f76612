//! The comparison native operators.
//!
//! The result type is the unsigned word. The signedness of `<`, `<=`,
//! `>` and `>=` is driven by the first operand's type; `==` and `!=` are
//! sign-agnostic. A literal on one side uses the immediate forms,
//! reversing through the `sgt*` family where needed.

use super::*;

pub(super) fn emit(cx: &mut Cx, args: &mut CallArgs, name: &str) -> EmitResult<Var> {
    let a = args.args[0].clone();
    let b = args.args[1].clone();
    let word = Type::word(cx.cfg.sizeof_gpr);
    let signed = !a.pushed_ty.is_unsigned();
    let an = arg_number(cx, &a);
    let bn = arg_number(cx, &b);

    if let (Some(x), Some(y)) = (an, bn) {
        let v = match name {
            "==" => x == y,
            "!=" => x != y,
            "<" if signed => x < y,
            "<" => (x as u64) < (y as u64),
            "<=" if signed => x <= y,
            "<=" => (x as u64) <= (y as u64),
            ">" if signed => x > y,
            ">" => (x as u64) > (y as u64),
            _ if signed => x >= y,
            _ => (x as u64) >= (y as u64),
        };
        return Ok(cx.number_result(v as i64, &word));
    }
    if cx.pass == Pass::First {
        return Ok(cx.temp_result(&word));
    }

    let result;
    match (an, bn) {
        (None, None) => {
            let r1 = cx.input_reg(&a);
            let r2 = cx.input_reg(&b);
            result = cx.temp_result(&word);
            let rres = cx.output_reg(result, &word);
            // Greater-than forms swap the operands of the less-than
            // opcodes.
            let (op, x, y) = match (name, signed) {
                ("==", _) => (Opcode::Seq, r1, r2),
                ("!=", _) => (Opcode::Sne, r1, r2),
                ("<", true) => (Opcode::Slt, r1, r2),
                ("<", false) => (Opcode::Sltu, r1, r2),
                ("<=", true) => (Opcode::Slte, r1, r2),
                ("<=", false) => (Opcode::Slteu, r1, r2),
                (">", true) => (Opcode::Slt, r2, r1),
                (">", false) => (Opcode::Sltu, r2, r1),
                (_, true) => (Opcode::Slte, r2, r1),
                (_, false) => (Opcode::Slteu, r2, r1),
            };
            cx.op3(op, rres, x, y);
            cx.unlock(r1);
            cx.unlock(r2);
            cx.unlock(rres);
        }
        (None, Some(y)) => {
            let r1 = cx.input_reg(&a);
            result = cx.temp_result(&word);
            let rres = cx.output_reg(result, &word);
            let op = match (name, signed) {
                ("==", _) => Opcode::Seqi,
                ("!=", _) => Opcode::Snei,
                ("<", true) => Opcode::Slti,
                ("<", false) => Opcode::Sltui,
                ("<=", true) => Opcode::Sltei,
                ("<=", false) => Opcode::Slteui,
                (">", true) => Opcode::Sgti,
                (">", false) => Opcode::Sgtui,
                (_, true) => Opcode::Sgtei,
                (_, false) => Opcode::Sgteui,
            };
            cx.op2i(op, rres, r1, y);
            cx.unlock(r1);
            cx.unlock(rres);
        }
        (Some(x), None) => {
            let r2 = cx.input_reg(&b);
            result = cx.temp_result(&word);
            let rres = cx.output_reg(result, &word);
            // imm OP b is rewritten as b OP' imm.
            let op = match (name, signed) {
                ("==", _) => Opcode::Seqi,
                ("!=", _) => Opcode::Snei,
                ("<", true) => Opcode::Sgti,
                ("<", false) => Opcode::Sgtui,
                ("<=", true) => Opcode::Sgtei,
                ("<=", false) => Opcode::Sgteui,
                (">", true) => Opcode::Slti,
                (">", false) => Opcode::Sltui,
                (_, true) => Opcode::Sltei,
                (_, false) => Opcode::Slteui,
            };
            cx.op2i(op, rres, r2, x);
            cx.unlock(r2);
            cx.unlock(rres);
        }
        (Some(_), Some(_)) => unreachable!("folded above"),
    }
    Ok(result)
}
