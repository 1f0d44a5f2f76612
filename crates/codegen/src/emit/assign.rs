//! The `=` native operator.
//!
//! The operator does not produce a value; its first argument is returned
//! instead. When the right operand is a number it translates to an
//! immediate load rather than a register allocation. Volatile left
//! variables are never cached: the value is written straight through to
//! memory and any cached alias is discarded.

use super::*;

pub(super) fn emit(cx: &mut Cx, args: &mut CallArgs) -> EmitResult<Var> {
    let left = args.args[0].clone();
    let right = args.args[1].clone();
    let resultvar = left.varpushed;
    if cx.vars.get(resultvar).readonly {
        return Err(CodegenError::ReadonlyLeft { op: "=".into() });
    }
    propagate_first_arg_change(cx, args);

    if cx.pass == Pass::First {
        // The left operand is only written, never read; the second pass
        // must not duplicate its value.
        args.args[0].to_output = true;
        return Ok(resultvar);
    }

    let size = left.pushed_ty.size_of(cx.cfg.sizeof_gpr);
    let right_num = arg_number(cx, &right);

    if cx.is_volatile(resultvar) {
        let (rsrc, scratch) = match right_num {
            Some(n) => {
                let tmp = cx.temp_result(&left.pushed_ty);
                let r = cx.output_reg(tmp, &left.pushed_ty);
                cx.li(r, n);
                (r, Some(tmp))
            }
            None => (cx.input_reg(&right), None),
        };
        cx.store_var(rsrc, resultvar, size);
        cx.discard_overlapping(resultvar, 0, size, DiscardMode::AllOverlap);
        cx.unlock(rsrc);
        if let Some(tmp) = scratch {
            cx.discard_overlapping(tmp, 0, size, DiscardMode::AllOverlap);
        }
    } else {
        // At most one register may be associated with the region being
        // assigned.
        cx.discard_overlapping(resultvar, 0, size, DiscardMode::AllOverlapExceptRegForVar);
        let rdst = cx.output_reg(resultvar, &left.pushed_ty);
        match right_num {
            Some(n) => {
                cx.li(rdst, n);
            }
            None => {
                let rsrc = cx.input_reg(&right);
                cx.op2(Opcode::Cpy, rdst, rsrc);
                cx.unlock(rsrc);
            }
        }
        cx.unlock(rdst);
    }
    Ok(resultvar)
}
