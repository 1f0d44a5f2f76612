//! Linking signatures.
//!
//! A signature is the canonical text identifying a function or operator
//! for import/export resolution: the name (or operator glyph) followed by
//! the parenthesized argument types, with `&` suffixes for by-ref
//! arguments and function-pointer types spelled `return-type(arg-types)`.
//! Signatures are compared by byte equality; there is no hashing.

use crate::ir::types::Type;

pub fn linking_signature(name: &str, params: &[Type]) -> String {
    use core::fmt::Write;
    let mut out = String::with_capacity(name.len() + 2 + params.len() * 8);
    out.push_str(name);
    out.push('(');
    for (i, p) in params.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{p}");
    }
    out.push(')');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_function() {
        let params = [Type::parse("u32").unwrap(), Type::parse("u8*").unwrap()];
        assert_eq!(linking_signature("open", &params), "open(u32,u8*)");
    }

    #[test]
    fn operator_glyph_as_name() {
        let params = [
            Type::parse("u32&").unwrap(),
            Type::parse("u32(void*)").unwrap(),
        ];
        assert_eq!(linking_signature("+", &params), "+(u32&,u32(void*))");
    }

    #[test]
    fn nullary() {
        assert_eq!(linking_signature("main", &[]), "main()");
    }
}
