//! Immediate values.
//!
//! An immediate is not always known during compilation: it can reference an
//! instruction or a function whose address the backend determines while
//! emitting, or the base of the global or string region. The effective
//! operand is the sum of all terms.

use smallvec::{smallvec, SmallVec};

use crate::ir::entities::{Func, Inst};

/// One term of an immediate value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ImmTerm {
    /// A literal 64-bit value.
    Value(i64),
    /// Relative address of an instruction, resolved at emit time.
    InstOffset(Inst),
    /// Relative address of a function, resolved at emit time.
    FuncOffset(Func),
    /// Relative address of the global-variable region.
    GlobalRegion,
    /// Relative address of the string-constant region.
    StringRegion,
}

/// An instruction's immediate operand: the sum of one or more terms.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Imm {
    terms: SmallVec<[ImmTerm; 1]>,
}

impl Imm {
    pub fn value(v: i64) -> Self {
        Self {
            terms: smallvec![ImmTerm::Value(v)],
        }
    }

    pub fn inst(i: Inst) -> Self {
        Self {
            terms: smallvec![ImmTerm::InstOffset(i)],
        }
    }

    pub fn func(f: Func) -> Self {
        Self {
            terms: smallvec![ImmTerm::FuncOffset(f)],
        }
    }

    pub fn global_region() -> Self {
        Self {
            terms: smallvec![ImmTerm::GlobalRegion],
        }
    }

    pub fn string_region() -> Self {
        Self {
            terms: smallvec![ImmTerm::StringRegion],
        }
    }

    /// Add another term to the sum.
    pub fn push(&mut self, term: ImmTerm) {
        self.terms.push(term);
    }

    pub fn terms(&self) -> &[ImmTerm] {
        &self.terms
    }

    /// The literal value when the immediate is a single `Value` term,
    /// which some opcodes require.
    pub fn as_value(&self) -> Option<i64> {
        match self.terms.as_slice() {
            [ImmTerm::Value(v)] => Some(*v),
            _ => None,
        }
    }

    /// Sum the terms with a backend-supplied resolution of the symbolic
    /// ones.
    pub fn resolve(&self, mut resolver: impl FnMut(ImmTerm) -> i64) -> i64 {
        self.terms
            .iter()
            .map(|&t| match t {
                ImmTerm::Value(v) => v,
                other => resolver(other),
            })
            .fold(0, i64::wrapping_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;

    #[test]
    fn single_value_round_trips() {
        let imm = Imm::value(-7);
        assert_eq!(imm.as_value(), Some(-7));
        assert_eq!(imm.resolve(|_| unreachable!()), -7);
    }

    #[test]
    fn sums_resolve_symbolic_terms() {
        let mut imm = Imm::func(Func::new(0));
        imm.push(ImmTerm::Value(16));
        assert_eq!(imm.as_value(), None);
        assert_eq!(imm.resolve(|_| 0x1000), 0x1010);
    }
}
