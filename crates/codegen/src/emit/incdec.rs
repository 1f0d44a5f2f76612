//! The `++` and `--` native operators.
//!
//! Pointer types step by their stride, everything else by one. The first
//! argument is returned.

use super::*;

pub(super) fn emit(cx: &mut Cx, args: &mut CallArgs, name: &str) -> EmitResult<Var> {
    let a = args.args[0].clone();
    let resultvar = a.varpushed;
    if cx.vars.get(resultvar).readonly {
        return Err(CodegenError::ReadonlyOperand { op: name.into() });
    }
    propagate_first_arg_change(cx, args);

    if cx.pass == Pass::First {
        return Ok(resultvar);
    }

    let r1 = prepare_inout_reg(cx, args);
    let step = if a.pushed_ty.is_pointer() {
        i64::from(stride(&a.pushed_ty, cx.cfg.sizeof_gpr))
    } else {
        1
    };
    let delta = if name.starts_with('+') { step } else { -step };
    cx.addi(r1, r1, delta);
    if cx.is_volatile(resultvar) {
        cx.flush_reg(r1);
        let size = a.pushed_ty.size_of(cx.cfg.sizeof_gpr);
        cx.discard_overlapping(resultvar, 0, size, DiscardMode::AllOverlap);
    }
    cx.unlock(r1);
    Ok(resultvar)
}
