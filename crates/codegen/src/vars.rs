//! The variable table of a function under compilation.
//!
//! Variables come in three flavors: programmer-declared variables, which
//! occupy stackframe memory and participate in change propagation;
//! compiler-introduced tempvars, distinguished by the `$` name prefix; and
//! constant variables, which hold a number and never reside in memory.

use crate::entity::{entity_ref, PrimaryMap};
use crate::ir::types::Type;

entity_ref! {
    /// An opaque reference to a variable in a [`VarTable`].
    Var, "v"
}

pub struct VarData {
    /// Variable name; tempvars are prefixed with `$`.
    pub name: String,
    /// Byte size of the variable's storage.
    pub size: u32,
    pub ty: Type,
    /// Set for constant variables; the value is already normalized to the
    /// type's width.
    pub number: Option<i64>,
    /// Offset of the variable within the stackframe.
    pub frame_offset: u32,
    /// The value is never cached in a register.
    pub volatile: bool,
    pub readonly: bool,
    /// Byte ranges of this variable modified through operators, recorded
    /// by change propagation. Only for programmer-declared variables.
    pub changed: Vec<(u32, u32)>,
}

pub struct VarTable {
    vars: PrimaryMap<Var, VarData>,
    frame_size: u32,
    temp_counter: u32,
}

impl VarTable {
    pub fn new() -> Self {
        Self {
            vars: PrimaryMap::new(),
            frame_size: 0,
            temp_counter: 0,
        }
    }

    pub fn get(&self, v: Var) -> &VarData {
        &self.vars[v]
    }

    pub fn get_mut(&mut self, v: Var) -> &mut VarData {
        &mut self.vars[v]
    }

    /// Total stackframe bytes allocated so far.
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    fn alloc_frame(&mut self, size: u32) -> u32 {
        let offset = self.frame_size;
        self.frame_size += size.max(1);
        offset
    }

    /// Declare a programmer-visible variable.
    pub fn declare(&mut self, name: &str, ty: Type, sizeof_gpr: u32) -> Var {
        let size = ty.size_of(sizeof_gpr);
        let frame_offset = self.alloc_frame(size);
        self.vars.push(VarData {
            name: name.to_owned(),
            size,
            ty,
            number: None,
            frame_offset,
            volatile: false,
            readonly: false,
            changed: Vec::new(),
        })
    }

    /// Allocate a compiler temporary with a generated `$`-prefixed name.
    pub fn alloc_temp(&mut self, ty: Type, sizeof_gpr: u32) -> Var {
        let size = ty.size_of(sizeof_gpr);
        let frame_offset = self.alloc_frame(size);
        let name = format!("${}", self.temp_counter);
        self.temp_counter += 1;
        self.vars.push(VarData {
            name,
            size,
            ty,
            number: None,
            frame_offset,
            volatile: false,
            readonly: false,
            changed: Vec::new(),
        })
    }

    /// A constant variable holding `value`, which translates to an
    /// immediate rather than a register when instructions are generated.
    pub fn number(&mut self, value: i64, ty: Type, sizeof_gpr: u32) -> Var {
        let size = ty.size_of(sizeof_gpr);
        self.vars.push(VarData {
            name: format!("#{value}"),
            size,
            ty,
            number: Some(value),
            frame_offset: 0,
            volatile: false,
            readonly: true,
            changed: Vec::new(),
        })
    }

    pub fn is_tempvar(&self, v: Var) -> bool {
        self.vars[v].name.starts_with('$')
    }

    pub fn is_number(&self, v: Var) -> bool {
        self.vars[v].number.is_some()
    }
}

impl Default for VarTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_offsets_do_not_overlap() {
        let mut t = VarTable::new();
        let a = t.declare("a", Type::parse("u32").unwrap(), 8);
        let b = t.declare("b", Type::parse("u64").unwrap(), 8);
        let (ao, asz) = (t.get(a).frame_offset, t.get(a).size);
        assert!(ao + asz <= t.get(b).frame_offset);
        assert_eq!(t.frame_size(), 12);
    }

    #[test]
    fn tempvars_carry_the_prefix() {
        let mut t = VarTable::new();
        let v = t.alloc_temp(Type::parse("u64").unwrap(), 8);
        assert!(t.is_tempvar(v));
        assert!(!t.is_number(v));
    }

    #[test]
    fn number_vars_have_no_storage() {
        let mut t = VarTable::new();
        let before = t.frame_size();
        let v = t.number(7, Type::parse("u32").unwrap(), 8);
        assert!(t.is_number(v));
        assert_eq!(t.frame_size(), before);
    }
}
