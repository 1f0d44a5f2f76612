//! Functions and the program-wide function structure.
//!
//! Each function owns its instructions as a circular ring over an arena;
//! the head points at the *last-created* instruction, so `next(head)` is
//! the first executable one. Functions themselves form both a tree
//! (parent / children / sibling) and a flat circular ring in definition
//! order rooted at the program entry.

use crate::entity::PrimaryMap;
use crate::ir::entities::{Func, Inst};
use crate::ir::inst::InstructionData;
use crate::ir::sig;
use crate::ir::types::Type;

#[derive(Debug)]
struct InstNode {
    data: InstructionData,
    prev: Inst,
    next: Inst,
}

/// A function under construction or compiled.
#[derive(Debug)]
pub struct FunctionData {
    /// The parent function; `None` only for the root.
    pub parent: Option<Func>,
    /// The sibling declared immediately before this one in the parent.
    pub sibling: Option<Func>,
    /// The last child created within this function; older children are
    /// reached through their `sibling` links.
    pub children: Option<Func>,
    /// Canonical text identifying the function for linking, e.g.
    /// `name(u32&,u32(void*))`. Operators use their glyph as the name.
    /// Set only on the second pass.
    pub linking_signature: Option<String>,
    /// Set when the function is defined with the `export` keyword in the
    /// root function.
    pub to_export: bool,
    /// 0 when the function is defined; otherwise offset+1 within the
    /// string region from which the resolved import address is loaded.
    pub to_import: u32,
    insts: PrimaryMap<Inst, InstNode>,
    head: Option<Inst>,
    /// Definition-order ring links, maintained by [`Program`].
    pub(crate) ring_prev: Func,
    pub(crate) ring_next: Func,
}

impl FunctionData {
    fn new(parent: Option<Func>, own: Func) -> Self {
        Self {
            parent,
            sibling: None,
            children: None,
            linking_signature: None,
            to_export: false,
            to_import: 0,
            insts: PrimaryMap::new(),
            head: None,
            ring_prev: own,
            ring_next: own,
        }
    }

    /// The last-created instruction.
    pub fn head(&self) -> Option<Inst> {
        self.head
    }

    /// The first executable instruction.
    pub fn entry(&self) -> Option<Inst> {
        self.head.map(|h| self.insts[h].next)
    }

    pub fn inst(&self, i: Inst) -> &InstructionData {
        &self.insts[i].data
    }

    pub fn inst_mut(&mut self, i: Inst) -> &mut InstructionData {
        &mut self.insts[i].data
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Append an instruction; it becomes the new head (the ring's last
    /// element).
    pub fn append(&mut self, data: InstructionData) -> Inst {
        data.validate();
        match self.head {
            None => {
                let id = self.insts.push(InstNode {
                    data,
                    // Self-links are patched right below.
                    prev: Inst::reserved(),
                    next: Inst::reserved(),
                });
                self.insts[id].prev = id;
                self.insts[id].next = id;
                self.head = Some(id);
                id
            }
            Some(last) => {
                let first = self.insts[last].next;
                let id = self.insts.push(InstNode {
                    data,
                    prev: last,
                    next: first,
                });
                self.insts[last].next = id;
                self.insts[first].prev = id;
                self.head = Some(id);
                id
            }
        }
    }

    /// Instructions in executable order, starting at the entry.
    pub fn iter(&self) -> impl Iterator<Item = Inst> + '_ {
        let entry = self.entry();
        let mut cur = entry;
        core::iter::from_fn(move || {
            let i = cur?;
            let next = self.insts[i].next;
            cur = if Some(next) == entry { None } else { Some(next) };
            Some(i)
        })
    }

    pub fn next_inst(&self, i: Inst) -> Inst {
        self.insts[i].next
    }

    pub fn prev_inst(&self, i: Inst) -> Inst {
        self.insts[i].prev
    }
}

impl Inst {
    fn reserved() -> Inst {
        use crate::entity::EntityRef;
        Inst::new(0)
    }
}

/// All functions of one compilation, rooted at the program entry.
#[derive(Debug)]
pub struct Program {
    funcs: PrimaryMap<Func, FunctionData>,
    root: Func,
}

impl Program {
    pub fn new() -> Self {
        let mut funcs = PrimaryMap::new();
        let root = {
            use crate::entity::EntityRef;
            Func::new(0)
        };
        funcs.push(FunctionData::new(None, root));
        Self { funcs, root }
    }

    pub fn root(&self) -> Func {
        self.root
    }

    pub fn func(&self, f: Func) -> &FunctionData {
        &self.funcs[f]
    }

    pub fn func_mut(&mut self, f: Func) -> &mut FunctionData {
        &mut self.funcs[f]
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Create a function nested in `parent`, linking it as the parent's
    /// newest child and appending it to the definition-order ring.
    pub fn create_function(&mut self, parent: Func) -> Func {
        let f = {
            use crate::entity::EntityRef;
            Func::new(self.funcs.len())
        };
        let mut data = FunctionData::new(Some(parent), f);
        data.sibling = self.funcs[parent].children;
        self.funcs.push(data);
        self.funcs[parent].children = Some(f);
        // Ring insertion at the bottom: definition order oldest-first.
        let root = self.root;
        let last = self.funcs[root].ring_prev;
        self.funcs[last].ring_next = f;
        self.funcs[f].ring_prev = last;
        self.funcs[f].ring_next = root;
        self.funcs[root].ring_prev = f;
        f
    }

    /// All functions in definition order, root first.
    pub fn iter(&self) -> impl Iterator<Item = Func> + '_ {
        let root = self.root;
        let mut cur = Some(root);
        core::iter::from_fn(move || {
            let f = cur?;
            let next = self.funcs[f].ring_next;
            cur = if next == root { None } else { Some(next) };
            Some(f)
        })
    }

    /// The children of `f`, oldest first, by walking back through the
    /// sibling links.
    pub fn children_oldest_first(&self, f: Func) -> Vec<Func> {
        let mut out = Vec::new();
        let mut cur = self.funcs[f].children;
        while let Some(c) = cur {
            out.push(c);
            cur = self.funcs[c].sibling;
        }
        out.reverse();
        out
    }

    /// Second-pass helper: record the canonical linking signature of `f`.
    pub fn set_signature(&mut self, f: Func, name: &str, params: &[Type]) {
        self.funcs[f].linking_signature = Some(sig::linking_signature(name, params));
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}
