//! Side-exit stack maps
//!
//! A [`StackMap`] says which registers must be written back to the
//! interpreter's operand stack when a trace leaves at a given program
//! counter. Slots are listed bottom to top starting at the register-stack
//! low-water mark; `bottom` is that mark relative to the operand-stack
//! height at trace entry (zero or negative).
//!
//! Maps are taken in recording order and never edited. Every instruction
//! that can leave the trace is bound to the newest map for its exit pc at
//! the moment it was emitted, so a later snapshot at the same pc (a second
//! call of the same method, say) never changes what an earlier guard
//! restores.

use super::ir::InstId;
use super::pcmap::PcMap;
use crate::bytecode::Pc;
use rustc_hash::FxHashMap as HashMap;
use std::fmt;

/// How control leaves the trace at an exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExitKind {
    /// A speculative guard failed
    #[default]
    SideExit,
    /// The trace reached a loop header and finished normally
    Success,
}

/// Registers to restore at one exit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackMap {
    pub pc: Pc,
    pub kind: ExitKind,
    /// Operand-stack height, relative to trace entry, below which the
    /// interpreter's own values are still intact
    pub bottom: i32,
    /// Registers to push, bottom first. A `FramePush` register marks where
    /// an inlined frame's operand stack begins.
    pub regs: Vec<InstId>,
    /// Inlined frames live at this exit
    pub call_depth: u32,
}

impl StackMap {
    pub fn new(pc: Pc, kind: ExitKind, bottom: i32, regs: Vec<InstId>, call_depth: u32) -> Self {
        Self {
            pc,
            kind,
            bottom,
            regs,
            call_depth,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == ExitKind::Success
    }

    /// Registers this exit keeps alive
    pub fn uses(&self) -> impl Iterator<Item = InstId> + '_ {
        self.regs.iter().copied()
    }
}

impl fmt::Display for StackMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ExitKind::SideExit => "side-exit",
            ExitKind::Success => "success",
        };
        write!(f, "exit {} ({}) bottom={} depth={} [", self.pc, kind, self.bottom, self.call_depth)?;
        for (i, reg) in self.regs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", reg)?;
        }
        write!(f, "]")
    }
}

/// Every map of one recording attempt plus the exit bindings
#[derive(Debug, Clone, Default)]
pub struct ExitMaps {
    maps: Vec<StackMap>,
    bound: HashMap<InstId, usize>,
}

impl ExitMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn clear(&mut self) {
        self.maps.clear();
        self.bound.clear();
    }

    /// Record a snapshot
    pub fn push(&mut self, map: StackMap) {
        self.maps.push(map);
    }

    /// Newest map for `pc`
    pub fn latest(&self, pc: Pc) -> Option<&StackMap> {
        self.maps.iter().rev().find(|m| m.pc == pc)
    }

    /// Bind `inst` to the newest map for `pc`; false when there is none
    pub fn bind(&mut self, inst: InstId, pc: Pc) -> bool {
        match self.maps.iter().rposition(|m| m.pc == pc) {
            Some(at) => {
                self.bound.insert(inst, at);
                true
            }
            None => false,
        }
    }

    /// Map restored when `inst` leaves the trace
    pub fn map_of(&self, inst: InstId) -> Option<&StackMap> {
        self.bound.get(&inst).map(|&at| &self.maps[at])
    }

    pub fn iter(&self) -> impl Iterator<Item = &StackMap> + '_ {
        self.maps.iter()
    }

    /// Forget maps taken after the first `len` and bindings of
    /// instructions allocated at or after `mark`
    pub fn truncate(&mut self, len: usize, mark: InstId) {
        self.maps.truncate(len);
        self.bound.retain(|inst, at| *inst < mark && *at < len);
    }

    /// Newest map per pc
    pub fn by_pc(&self) -> PcMap<StackMap> {
        let mut out = PcMap::with_capacity(self.maps.len());
        for map in &self.maps {
            out.insert(map.pc, map.clone());
        }
        out
    }
}
