//! Register allocation.
//!
//! The emitters obey a fixed discipline, which is the contract any
//! allocator must honor:
//!
//! 1. **Acquire**: [`RegAlloc::get_reg_for_var`] makes the memory of a
//!    variable available in a register, allocating, flushing and
//!    discarding as needed. For an output the register is marked dirty
//!    and moved to the warm end of the eviction order.
//! 2. **Lock**: a register acquired for an instruction being emitted is
//!    locked until the instruction has been generated, so the
//!    ensure-unused step of instruction creation cannot evict it.
//! 3. **Flush / discard**: before a register's owner variable is
//!    reassigned, overlapping registers are discarded so at most one
//!    register is associated with any memory region.
//! 4. **Reassign**: when the first operand is the same variable whose
//!    value was just materialized from a tempvar duplicate, the register
//!    is reassigned directly instead of copied.
//! 5. **Volatile flush**: a dirtying operation on an always-volatile
//!    variable is followed by an immediate flush.
//! 6. **Block boundary**: at each `nop`, every register is considered
//!    flushed; nothing is cached across blocks.
//!
//! Before any instruction is created, the allocator guarantees the
//! per-opcode minimum count of unused registers supplied by the driver,
//! evicting as needed. This is how opcodes that internally clobber
//! scratch registers declare their needs.

use crate::ir::entities::Reg;
use crate::ir::function::FunctionData;
use crate::ir::immediate::Imm;
use crate::ir::inst::InstructionData;
use crate::ir::opcode::Opcode;
use crate::vars::{Var, VarTable};

/// Why a register is being acquired.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Usage {
    ForInput,
    ForOutput,
}

/// What [`RegAlloc::discard_overlapping`] keeps.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DiscardMode {
    /// Discard every register overlapping the region, including the one
    /// bound to the variable itself.
    AllOverlap,
    /// Discard every overlapping register except the one bound to the
    /// variable being operated on.
    AllOverlapExceptRegForVar,
}

#[derive(Clone, Debug)]
struct Binding {
    var: Var,
    offset: u32,
    size: u32,
}

#[derive(Clone, Debug, Default)]
struct RegState {
    binding: Option<Binding>,
    dirty: bool,
    locked: bool,
}

/// Reference LRU allocator implementing the contract above. Register 0 is
/// the stack pointer and is never allocated.
pub struct RegAlloc {
    states: Vec<RegState>,
    /// Eviction order: front is coldest (evicted first), back warmest.
    lru: Vec<u32>,
}

impl RegAlloc {
    pub fn new(nbr_of_gpr: u32) -> Self {
        assert!(nbr_of_gpr >= 3, "at least 3 general purpose registers");
        Self {
            states: (0..=nbr_of_gpr).map(|_| RegState::default()).collect(),
            lru: (1..=nbr_of_gpr).collect(),
        }
    }

    fn state(&self, r: Reg) -> &RegState {
        &self.states[r.id() as usize]
    }

    fn state_mut(&mut self, r: Reg) -> &mut RegState {
        &mut self.states[r.id() as usize]
    }

    fn touch(&mut self, r: Reg) {
        self.lru.retain(|&id| id != r.id());
        self.lru.push(r.id());
    }

    /// The register currently holding `v` at `offset`, if any.
    pub fn reg_for(&self, v: Var) -> Option<Reg> {
        (1..self.states.len()).find_map(|id| {
            let s = &self.states[id];
            match &s.binding {
                Some(b) if b.var == v => Some(Reg::new(id as u32)),
                _ => None,
            }
        })
    }

    pub fn lock(&mut self, r: Reg) {
        self.state_mut(r).locked = true;
    }

    pub fn unlock(&mut self, r: Reg) {
        self.state_mut(r).locked = false;
    }

    pub fn mark_dirty(&mut self, r: Reg) {
        self.state_mut(r).dirty = true;
    }

    pub fn is_dirty(&self, r: Reg) -> bool {
        self.state(r).dirty
    }

    /// Number of registers with no binding.
    pub fn free_count(&self) -> usize {
        self.states[1..]
            .iter()
            .filter(|s| s.binding.is_none())
            .count()
    }

    /// Ids of the currently unallocated registers, terminated by register
    /// id 0. Recorded on every instruction.
    pub fn unused_snapshot(&self) -> Vec<Reg> {
        let mut out: Vec<Reg> = (1..self.states.len() as u32)
            .map(Reg::new)
            .filter(|&r| self.state(r).binding.is_none())
            .collect();
        out.push(Reg::SP);
        out
    }

    /// Load the memory of `v` into some register. `bitselect` narrows the
    /// interesting bits of the value; the reference allocator loads the
    /// full `size` bytes regardless. For `ForOutput` the register is
    /// dirtied and moved to the warm end of the eviction order.
    pub fn get_reg_for_var(
        &mut self,
        func: &mut FunctionData,
        vars: &VarTable,
        v: Var,
        use_offset: u32,
        size: u32,
        _bitselect: u32,
        usage: Usage,
    ) -> Reg {
        if let Some(r) = self.find_bound(v, use_offset) {
            self.touch(r);
            if usage == Usage::ForOutput {
                self.state_mut(r).dirty = true;
            }
            return r;
        }
        let r = self.take_register(func, vars);
        self.state_mut(r).binding = Some(Binding {
            var: v,
            offset: use_offset,
            size,
        });
        match usage {
            Usage::ForInput => {
                self.emit_load(func, vars, r, v, use_offset, size);
                self.state_mut(r).dirty = false;
            }
            Usage::ForOutput => {
                self.state_mut(r).dirty = true;
            }
        }
        self.touch(r);
        r
    }

    fn find_bound(&self, v: Var, offset: u32) -> Option<Reg> {
        (1..self.states.len()).find_map(|id| {
            let s = &self.states[id];
            match &s.binding {
                Some(b) if b.var == v && b.offset == offset => Some(Reg::new(id as u32)),
                _ => None,
            }
        })
    }

    /// A register with no binding, evicting the coldest unlocked one if
    /// none is free.
    fn take_register(&mut self, func: &mut FunctionData, vars: &VarTable) -> Reg {
        if let Some(id) = self
            .lru
            .iter()
            .copied()
            .find(|&id| self.states[id as usize].binding.is_none())
        {
            return Reg::new(id);
        }
        let id = self
            .lru
            .iter()
            .copied()
            .find(|&id| !self.states[id as usize].locked)
            .expect("all registers locked while allocating");
        let r = Reg::new(id);
        self.flush_reg(func, vars, r);
        self.state_mut(r).binding = None;
        r
    }

    /// Write a dirty register back to its variable's memory. The binding
    /// is kept; only the dirty bit is cleared.
    pub fn flush_reg(&mut self, func: &mut FunctionData, vars: &VarTable, r: Reg) {
        let Some(binding) = self.state(r).binding.clone() else {
            return;
        };
        if !self.state(r).dirty {
            return;
        }
        // Number variables have no memory to flush to.
        if vars.is_number(binding.var) {
            self.state_mut(r).dirty = false;
            return;
        }
        self.emit_store(func, vars, r, binding.var, binding.offset, binding.size);
        self.state_mut(r).dirty = false;
    }

    /// Drop the association of every register overlapping the byte region
    /// `[offset, offset+size)` of `v`, per the discard mode. Discarded
    /// registers lose their dirty value; callers flush first when the
    /// value is still needed.
    pub fn discard_overlapping(
        &mut self,
        v: Var,
        offset: u32,
        size: u32,
        _bitselect: u32,
        mode: DiscardMode,
    ) {
        for id in 1..self.states.len() {
            let s = &self.states[id];
            let Some(b) = &s.binding else { continue };
            if b.var != v {
                continue;
            }
            if mode == DiscardMode::AllOverlapExceptRegForVar && b.offset == offset {
                continue;
            }
            if b.offset < offset + size && offset < b.offset + b.size {
                let s = &mut self.states[id];
                s.binding = None;
                s.dirty = false;
            }
        }
    }

    /// Hand a register over to another variable without copying. Used when
    /// the computed value must be flushed to the pushed variable rather
    /// than to the tempvar duplicate it was loaded from.
    pub fn reassign(&mut self, r: Reg, v: Var, offset: u32) {
        let s = self.state_mut(r);
        if let Some(b) = &mut s.binding {
            b.var = v;
            b.offset = offset;
        }
    }

    /// Block boundary: flush every dirty register and drop all bindings.
    pub fn flush_all(&mut self, func: &mut FunctionData, vars: &VarTable) {
        for id in 1..self.states.len() as u32 {
            let r = Reg::new(id);
            self.flush_reg(func, vars, r);
            self.state_mut(r).binding = None;
        }
    }

    /// Guarantee at least `n` unallocated registers, evicting the coldest
    /// unlocked ones as needed.
    pub fn ensure_unused(&mut self, func: &mut FunctionData, vars: &VarTable, n: usize) {
        while self.free_count() < n {
            let Some(id) = self
                .lru
                .iter()
                .copied()
                .find(|&id| {
                    let s = &self.states[id as usize];
                    s.binding.is_some() && !s.locked
                })
            else {
                debug_assert!(false, "cannot free {n} registers, too many locks");
                return;
            };
            let r = Reg::new(id);
            self.flush_reg(func, vars, r);
            self.state_mut(r).binding = None;
        }
    }

    fn emit_load(
        &self,
        func: &mut FunctionData,
        vars: &VarTable,
        r: Reg,
        v: Var,
        use_offset: u32,
        size: u32,
    ) {
        debug_assert!(!vars.is_number(v), "number variables are immediates");
        let opcode = match size {
            1 => Opcode::Ld8,
            2 => Opcode::Ld16,
            4 => Opcode::Ld32,
            _ => Opcode::Ld64,
        };
        let mut data = InstructionData::new(opcode);
        data.r1 = r;
        data.r2 = Reg::SP;
        data.imm = Some(Imm::value(i64::from(
            vars.get(v).frame_offset + use_offset,
        )));
        func.append(data);
    }

    fn emit_store(
        &self,
        func: &mut FunctionData,
        vars: &VarTable,
        r: Reg,
        v: Var,
        use_offset: u32,
        size: u32,
    ) {
        let opcode = match size {
            1 => Opcode::St8,
            2 => Opcode::St16,
            4 => Opcode::St32,
            _ => Opcode::St64,
        };
        let mut data = InstructionData::new(opcode);
        data.r1 = r;
        data.r2 = Reg::SP;
        data.imm = Some(Imm::value(i64::from(
            vars.get(v).frame_offset + use_offset,
        )));
        func.append(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::function::Program;
    use crate::ir::types::Type;

    fn setup() -> (Program, VarTable, RegAlloc) {
        (Program::new(), VarTable::new(), RegAlloc::new(3))
    }

    #[test]
    fn input_acquire_emits_a_load() {
        let (mut prog, mut vars, mut alloc) = setup();
        let root = prog.root();
        let v = vars.declare("a", Type::parse("u32").unwrap(), 8);
        let r = alloc.get_reg_for_var(
            prog.func_mut(root),
            &vars,
            v,
            0,
            4,
            0,
            Usage::ForInput,
        );
        assert_ne!(r, Reg::SP);
        let f = prog.func(root);
        let entry = f.entry().unwrap();
        assert_eq!(f.inst(entry).opcode, Opcode::Ld32);
        assert_eq!(f.inst(entry).r1, r);
        // Re-acquiring reuses the same register without a second load.
        let before = f.len();
        let r2 = alloc.get_reg_for_var(
            prog.func_mut(root),
            &vars,
            v,
            0,
            4,
            0,
            Usage::ForInput,
        );
        assert_eq!(r, r2);
        assert_eq!(prog.func(root).len(), before);
    }

    #[test]
    fn eviction_flushes_dirty_registers() {
        let (mut prog, mut vars, mut alloc) = setup();
        let root = prog.root();
        let vs: Vec<_> = (0..4)
            .map(|i| vars.declare(&format!("v{i}"), Type::parse("u64").unwrap(), 8))
            .collect();
        for &v in &vs[..3] {
            let r = alloc.get_reg_for_var(
                prog.func_mut(root),
                &vars,
                v,
                0,
                8,
                0,
                Usage::ForOutput,
            );
            assert!(alloc.is_dirty(r));
        }
        assert_eq!(alloc.free_count(), 0);
        // The fourth acquisition evicts the coldest, storing it first.
        alloc.get_reg_for_var(prog.func_mut(root), &vars, vs[3], 0, 8, 0, Usage::ForOutput);
        let stores = prog
            .func(root)
            .iter()
            .filter(|&i| prog.func(root).inst(i).opcode == Opcode::St64)
            .count();
        assert_eq!(stores, 1);
        assert_eq!(alloc.reg_for(vs[0]), None);
    }

    #[test]
    fn locks_pin_registers_during_eviction() {
        let (mut prog, mut vars, mut alloc) = setup();
        let root = prog.root();
        let a = vars.declare("a", Type::parse("u64").unwrap(), 8);
        let ra = alloc.get_reg_for_var(prog.func_mut(root), &vars, a, 0, 8, 0, Usage::ForInput);
        alloc.lock(ra);
        for i in 0..4 {
            let v = vars.declare(&format!("x{i}"), Type::parse("u64").unwrap(), 8);
            alloc.get_reg_for_var(prog.func_mut(root), &vars, v, 0, 8, 0, Usage::ForInput);
        }
        assert_eq!(alloc.reg_for(a), Some(ra));
        alloc.unlock(ra);
    }

    #[test]
    fn ensure_unused_evicts_cold_registers() {
        let (mut prog, mut vars, mut alloc) = setup();
        let root = prog.root();
        for i in 0..3 {
            let v = vars.declare(&format!("x{i}"), Type::parse("u64").unwrap(), 8);
            alloc.get_reg_for_var(prog.func_mut(root), &vars, v, 0, 8, 0, Usage::ForOutput);
        }
        assert_eq!(alloc.free_count(), 0);
        alloc.ensure_unused(prog.func_mut(root), &vars, 2);
        assert!(alloc.free_count() >= 2);
    }

    #[test]
    fn flush_all_writes_back_and_unbinds() {
        let (mut prog, mut vars, mut alloc) = setup();
        let root = prog.root();
        let v = vars.declare("a", Type::parse("u64").unwrap(), 8);
        alloc.get_reg_for_var(prog.func_mut(root), &vars, v, 0, 8, 0, Usage::ForOutput);
        alloc.flush_all(prog.func_mut(root), &vars);
        assert_eq!(alloc.reg_for(v), None);
        assert_eq!(alloc.free_count(), 3);
        let has_store = prog
            .func(root)
            .iter()
            .any(|i| prog.func(root).inst(i).opcode == Opcode::St64);
        assert!(has_store);
    }

    #[test]
    fn discard_respects_the_keep_mode() {
        let (mut prog, mut vars, mut alloc) = setup();
        let root = prog.root();
        let v = vars.declare("a", Type::parse("u64").unwrap(), 8);
        let r = alloc.get_reg_for_var(prog.func_mut(root), &vars, v, 0, 8, 0, Usage::ForInput);
        alloc.discard_overlapping(v, 0, 8, 0, DiscardMode::AllOverlapExceptRegForVar);
        assert_eq!(alloc.reg_for(v), Some(r));
        alloc.discard_overlapping(v, 0, 8, 0, DiscardMode::AllOverlap);
        assert_eq!(alloc.reg_for(v), None);
    }

    #[test]
    fn unused_snapshot_is_terminated_by_the_stack_pointer() {
        let (_prog, _vars, alloc) = setup();
        let snap = alloc.unused_snapshot();
        assert_eq!(snap.last(), Some(&Reg::SP));
        assert_eq!(snap.len(), 4);
    }
}
