//! IR entity references.

use crate::entity::entity_ref;
use core::fmt;

entity_ref! {
    /// An opaque reference to an instruction in a function.
    Inst, "i"
}

entity_ref! {
    /// An opaque reference to a function in a [`crate::ir::Program`].
    Func, "f"
}

/// A virtual register id. Register 0 is the stack pointer, which is always
/// in use; it also terminates the unused-register arrays recorded on
/// instructions. The allocator owns the mapping to machine registers.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(u32);

impl Reg {
    /// The stack pointer register.
    pub const SP: Reg = Reg(0);

    pub fn new(id: u32) -> Self {
        Reg(id)
    }

    pub fn id(self) -> u32 {
        self.0
    }

    pub fn is_sp(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
