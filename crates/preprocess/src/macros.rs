//! Macro table.
//!
//! An insertion-ordered, name-keyed registry of macro definitions. All
//! scoping (function-like argument visibility, file-local `locdef`
//! definitions, loop macros) is encoded by push/remove discipline on a
//! single ordered list, not by nested namespaces. Lookup is linear over the
//! active list, newest definition first; macro sets are small in practice
//! and tie-breaks by insertion order matter.

use crate::chunk::ChunkId;

/// An opaque reference to a macro in a [`MacroTable`] arena. Ids are
/// allocated monotonically, so comparing indices orders macros by creation
/// time.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct MacroId(u32);

impl MacroId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What kind of definition a macro is.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MacroKind {
    /// `` `define NAME content `` until end of line.
    Object,
    /// `` `define NAME(A,B) `` with a body until `` `enddef ``.
    Function,
    /// The nameless iteration macro of a `` `foreach `` block.
    Loop,
    /// Supplied by the embedder before preprocessing starts.
    Predeclared,
    /// A formal parameter of a function-like macro, visible only while its
    /// owner's body is being parsed.
    Argument,
}

pub struct Macro {
    pub kind: MacroKind,
    pub name: String,
    /// `path:line` of the definition site, or
    /// `"creation of predeclared macros"`.
    pub origin: String,
    /// Body ring head. `None` for an empty object-like body.
    pub chunks: Option<ChunkId>,
    /// Argument macros, in declaration order. Only for function-like.
    pub args: Vec<MacroId>,
    /// Set while the macro's own body is being parsed.
    pub being_defined: bool,
    /// Defined with `` `locdef ``; removed when the defining file's
    /// include frame exits.
    pub is_local: bool,
    /// Predeclared, loop and argument macros cannot be `` `undef ``ed.
    pub cannot_be_undefined: bool,
    /// The single body chunk borrows its provenance from the use site.
    /// Set for predeclared and loop macros.
    pub location_set_when_used: bool,
    /// Tracked for loop and argument macros, which must be referenced at
    /// least once.
    pub was_used: bool,
}

/// The single global macro list of a preprocessing session.
#[derive(Default)]
pub struct MacroTable {
    arena: Vec<Macro>,
    /// Active macros, newest first.
    active: Vec<MacroId>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: MacroId) -> &Macro {
        &self.arena[id.index()]
    }

    pub fn get_mut(&mut self, id: MacroId) -> &mut Macro {
        &mut self.arena[id.index()]
    }

    /// Number of macros ever created. Used as a watermark: macros created
    /// after a point in time have indices >= the watermark.
    pub fn watermark(&self) -> usize {
        self.arena.len()
    }

    /// Find the newest active macro with the given name.
    pub fn lookup(&self, name: &str) -> Option<MacroId> {
        self.active
            .iter()
            .copied()
            .find(|&id| self.get(id).name == name)
    }

    /// Create a macro and push it on top of the active list.
    pub fn define(&mut self, m: Macro) -> MacroId {
        let id = MacroId(self.arena.len() as u32);
        self.arena.push(m);
        self.active.insert(0, id);
        id
    }

    /// Create a macro without making it visible. Used for function-like
    /// arguments, which are pushed separately around the body parse.
    pub fn alloc_hidden(&mut self, m: Macro) -> MacroId {
        let id = MacroId(self.arena.len() as u32);
        self.arena.push(m);
        id
    }

    /// Make a hidden macro visible on top of the active list.
    pub fn push(&mut self, id: MacroId) {
        debug_assert!(!self.active.contains(&id));
        self.active.insert(0, id);
    }

    /// Remove a macro from the active list. The arena slot is kept so
    /// existing ids stay valid.
    pub fn remove(&mut self, id: MacroId) {
        self.active.retain(|&a| a != id);
    }

    /// Remove every active local macro created at or after `watermark`.
    /// Called when an include frame exits so `locdef` definitions do not
    /// leak out of their file.
    pub fn remove_locals_since(&mut self, watermark: usize) {
        let arena = &self.arena;
        self.active
            .retain(|&id| !(id.index() >= watermark && arena[id.index()].is_local));
    }

    /// Iterate the active list, newest first.
    pub fn active(&self) -> impl Iterator<Item = MacroId> + '_ {
        self.active.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(name: &str, local: bool) -> Macro {
        Macro {
            kind: MacroKind::Object,
            name: name.to_owned(),
            origin: "t:1".to_owned(),
            chunks: None,
            args: Vec::new(),
            being_defined: false,
            is_local: local,
            cannot_be_undefined: false,
            location_set_when_used: false,
            was_used: false,
        }
    }

    #[test]
    fn lookup_finds_newest_first() {
        let mut t = MacroTable::new();
        t.define(object("A", false));
        let b = t.define(object("B", false));
        assert_eq!(t.lookup("B"), Some(b));
        assert_eq!(t.lookup("C"), None);
    }

    #[test]
    fn remove_then_redefine() {
        let mut t = MacroTable::new();
        let a = t.define(object("A", false));
        t.remove(a);
        assert_eq!(t.lookup("A"), None);
        let a2 = t.define(object("A", false));
        assert_eq!(t.lookup("A"), Some(a2));
    }

    #[test]
    fn locals_removed_at_watermark() {
        let mut t = MacroTable::new();
        t.define(object("OUTER", true));
        let mark = t.watermark();
        t.define(object("INNER", true));
        t.define(object("KEPT", false));
        t.remove_locals_since(mark);
        assert!(t.lookup("INNER").is_none());
        assert!(t.lookup("KEPT").is_some());
        assert!(t.lookup("OUTER").is_some());
    }
}
