//! Post-recording optimization
//!
//! Runs once per submitted trace, before code generation. Use-lists are
//! rebuilt from the live instructions of every block and every side-exit
//! map pins the registers it restores. Each pass drains a deduplicated
//! worklist, so a change re-queues only the instructions it can affect.

use super::fold::fold;
use super::function::Function;
use super::ir::{InstId, InstKind};
use super::snapshot::ExitMaps;
use std::collections::VecDeque;
use tracing::trace;

// ==================== Optimization Pass ====================

/// Result of running an optimization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizationResult {
    pub instructions_modified: usize,
    pub instructions_removed: usize,
    pub instructions_added: usize,
}

impl OptimizationResult {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn total_changes(&self) -> usize {
        self.instructions_modified + self.instructions_removed + self.instructions_added
    }
}

/// A transformation of a recorded trace
pub trait OptimizationPass {
    fn name(&self) -> &str;
    fn run(&self, func: &mut Function, exits: &ExitMaps) -> OptimizationResult;
}

/// Users of every instruction, plus the registers pinned by side exits
#[derive(Debug)]
pub struct UseLists {
    users: Vec<Vec<InstId>>,
    pinned: Vec<bool>,
}

impl UseLists {
    pub fn build(func: &Function, exits: &ExitMaps) -> Self {
        let mut users = vec![Vec::new(); func.len()];
        for inst in func.live_insts() {
            for op in inst.kind.operands() {
                if let Some(list) = users.get_mut(op.index()) {
                    list.push(inst.id);
                }
            }
        }
        let mut pinned = vec![false; func.len()];
        for map in exits.iter() {
            for reg in map.uses() {
                if let Some(pin) = pinned.get_mut(reg.index()) {
                    *pin = true;
                }
            }
        }
        Self { users, pinned }
    }

    pub fn users(&self, id: InstId) -> &[InstId] {
        self.users.get(id.index()).map_or(&[], |u| u.as_slice())
    }

    pub fn is_pinned(&self, id: InstId) -> bool {
        self.pinned.get(id.index()).copied().unwrap_or(false)
    }

    /// Drop one use of `op` by `user`
    fn release(&mut self, op: InstId, user: InstId) {
        if let Some(list) = self.users.get_mut(op.index()) {
            if let Some(at) = list.iter().position(|&u| u == user) {
                list.swap_remove(at);
            }
        }
    }
}

/// FIFO worklist that holds each instruction at most once
struct Worklist {
    queue: VecDeque<InstId>,
    queued: Vec<bool>,
}

impl Worklist {
    fn seeded(func: &Function) -> Self {
        let mut list = Self {
            queue: VecDeque::with_capacity(func.live_count()),
            queued: vec![false; func.len()],
        };
        let ids: Vec<InstId> = func.live_insts().map(|i| i.id).collect();
        for id in ids {
            list.push(id);
        }
        list
    }

    fn push(&mut self, id: InstId) {
        if let Some(flag) = self.queued.get_mut(id.index()) {
            if !*flag {
                *flag = true;
                self.queue.push_back(id);
            }
        }
    }

    fn pop(&mut self) -> Option<InstId> {
        let id = self.queue.pop_front()?;
        self.queued[id.index()] = false;
        Some(id)
    }
}

// ---- Constant Folding ----

/// Replaces operations on constant loads with the load of their result.
/// The instruction keeps its id, so its users need no rewiring.
pub struct ConstantFolding;

impl OptimizationPass for ConstantFolding {
    fn name(&self) -> &str {
        "ConstantFolding"
    }

    fn run(&self, func: &mut Function, exits: &ExitMaps) -> OptimizationResult {
        let uses = UseLists::build(func, exits);
        let mut work = Worklist::seeded(func);
        let mut modified = 0;
        while let Some(id) = work.pop() {
            if !func.is_live(id) {
                continue;
            }
            let kind = func.kind(id);
            if kind.is_guard() || kind.is_terminator() || kind.as_const().is_some() {
                continue;
            }
            if let Some(constant) = fold(func, kind) {
                trace!("fold {} into {}", func.inst(id), constant);
                func.replace(id, InstKind::LoadConst(constant));
                modified += 1;
                for &user in uses.users(id) {
                    work.push(user);
                }
            }
        }
        OptimizationResult {
            instructions_modified: modified,
            ..OptimizationResult::none()
        }
    }
}

// ---- Dead-Code Elimination ----

/// Removes pure instructions nobody reads and no side exit restores
pub struct DeadCodeElimination;

impl DeadCodeElimination {
    fn is_dead(func: &Function, uses: &UseLists, id: InstId) -> bool {
        let kind = func.kind(id);
        func.is_live(id)
            && uses.users(id).is_empty()
            && !uses.is_pinned(id)
            && !kind.is_guard()
            && !kind.is_terminator()
            && !kind.has_side_effect()
    }
}

impl OptimizationPass for DeadCodeElimination {
    fn name(&self) -> &str {
        "DeadCodeElimination"
    }

    fn run(&self, func: &mut Function, exits: &ExitMaps) -> OptimizationResult {
        let mut uses = UseLists::build(func, exits);
        let mut work = Worklist::seeded(func);
        let mut removed = 0;
        while let Some(id) = work.pop() {
            if !Self::is_dead(func, &uses, id) {
                continue;
            }
            trace!("remove dead {}", func.inst(id));
            let operands = func.kind(id).operands();
            func.remove(id);
            removed += 1;
            for op in operands {
                uses.release(op, id);
                work.push(op);
            }
        }
        OptimizationResult {
            instructions_removed: removed,
            ..OptimizationResult::none()
        }
    }
}

// ==================== Pipeline ====================

/// Folding followed by dead-code elimination
pub struct TraceOptimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl TraceOptimizer {
    pub fn new() -> Self {
        Self {
            passes: vec![Box::new(ConstantFolding), Box::new(DeadCodeElimination)],
        }
    }

    pub fn with_passes(passes: Vec<Box<dyn OptimizationPass>>) -> Self {
        Self { passes }
    }

    /// Run every pass in order
    pub fn run(&self, func: &mut Function, exits: &ExitMaps) -> Vec<(String, OptimizationResult)> {
        self.passes
            .iter()
            .map(|pass| (pass.name().to_string(), pass.run(func, exits)))
            .collect()
    }
}

impl Default for TraceOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Pc;
    use crate::jit::ir::{Constant, TypeCheck};
    use crate::jit::snapshot::{ExitKind, StackMap};
    use crate::runtime::numeric::{ArithOp, CmpOp};

    fn new_func() -> Function {
        let mut func = Function::new(16);
        let b = func.create_block(Some(Pc(0)), 0, 0);
        func.set_current(Some(b));
        func
    }

    #[test]
    fn test_fold_chains_through_users() {
        let mut func = new_func();
        let a = func.push(InstKind::LoadConst(Constant::Fixnum(2)));
        let b = func.push(InstKind::LoadConst(Constant::Fixnum(3)));
        let sum = func.push(InstKind::FixnumArith {
            op: ArithOp::Add,
            lhs: a,
            rhs: b,
            exit: Pc(0),
        });
        let cmp = func.push(InstKind::FixnumCmp {
            op: CmpOp::Lt,
            lhs: sum,
            rhs: b,
        });
        func.push(InstKind::Exit { pc: Pc(1) });

        let result = ConstantFolding.run(&mut func, &ExitMaps::new());
        assert_eq!(result.instructions_modified, 2);
        assert_eq!(func.kind(sum).as_const().and_then(|c| c.as_fixnum()), Some(5));
        assert!(matches!(
            func.kind(cmp).as_const(),
            Some(Constant::Boolean(false))
        ));
    }

    #[test]
    fn test_dce_removes_unused_pure_chain() {
        let mut func = new_func();
        let a = func.push(InstKind::LoadSelf);
        let len = func.push(InstKind::Length {
            of: crate::jit::ir::Container::Array,
            value: a,
        });
        func.push(InstKind::FixnumToFloat(len));
        func.push(InstKind::Exit { pc: Pc(1) });

        let result = DeadCodeElimination.run(&mut func, &ExitMaps::new());
        assert_eq!(result.instructions_removed, 3);
        assert_eq!(func.live_count(), 1);
    }

    #[test]
    fn test_dce_keeps_guards_effects_and_pinned() {
        let mut func = new_func();
        let a = func.push(InstKind::LoadSelf);
        func.push(InstKind::GuardType {
            check: TypeCheck::Fixnum,
            value: a,
            exit: Pc(0),
        });
        let pinned = func.push(InstKind::LoadConst(Constant::Fixnum(7)));
        let g = func.push(InstKind::LoadConst(Constant::Nil));
        func.push(InstKind::SetGlobal { name: g, value: g });
        func.push(InstKind::LoadConst(Constant::Fixnum(8)));
        func.push(InstKind::Exit { pc: Pc(1) });

        let mut exits = ExitMaps::new();
        exits.push(StackMap::new(Pc(1), ExitKind::SideExit, 0, vec![pinned], 0));
        let result = DeadCodeElimination.run(&mut func, &exits);
        assert_eq!(result.instructions_removed, 1);
        assert!(func.is_live(a));
        assert!(func.is_live(pinned));
        assert!(func.is_live(g));
    }

    #[test]
    fn test_no_dangling_operands_after_pipeline() {
        let mut func = new_func();
        let a = func.push(InstKind::LoadConst(Constant::Fixnum(1)));
        let s = func.push(InstKind::LoadSelf);
        let sum = func.push(InstKind::FixnumArith {
            op: ArithOp::Add,
            lhs: s,
            rhs: a,
            exit: Pc(0),
        });
        let dead = func.push(InstKind::FixnumArith {
            op: ArithOp::Mul,
            lhs: a,
            rhs: a,
            exit: Pc(0),
        });
        func.push(InstKind::EnvStore {
            level: 0,
            idx: 0,
            value: sum,
        });
        func.push(InstKind::Exit { pc: Pc(1) });

        let results = TraceOptimizer::new().run(&mut func, &ExitMaps::new());
        assert_eq!(results[0].0, "ConstantFolding");
        assert_eq!(results[1].0, "DeadCodeElimination");
        assert!(!func.is_live(dead));
        for inst in func.live_insts() {
            for op in inst.kind.operands() {
                assert!(func.is_live(op), "{} reads removed {}", inst, op);
            }
        }
    }
}
