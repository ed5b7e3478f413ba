//! Lowering of trace IR into a flat operation list
//!
//! Blocks are laid out back to back; linked jumps become operation
//! indices and every exit gets an [`ExitPlan`] describing how to rebuild
//! the interpreter's operand stack.

use crate::bytecode::Pc;
use crate::error::{Error, Result};
use crate::jit::codegen::CompileUnit;
use crate::jit::ir::{InstId, InstKind};
use crate::jit::snapshot::{ExitKind, StackMap};
use rustc_hash::FxHashMap as HashMap;

/// One stack slot restored at an exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Push the register's value
    Value(InstId),
    /// The operand stack of the next inlined frame starts here
    Frame,
}

/// Interpreter state to rebuild when leaving through one exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitPlan {
    pub pc: Pc,
    pub kind: ExitKind,
    /// Operand-stack height, relative to trace entry, to truncate to
    pub bottom: i32,
    pub slots: Vec<Slot>,
    pub call_depth: u32,
}

/// A lowered operation
#[derive(Debug, Clone)]
pub enum Op {
    /// Evaluate `kind` into register `dst`; a failing check leaves through
    /// plan `exit`. Errors are reported at `pc`.
    Eval {
        dst: InstId,
        kind: InstKind,
        exit: Option<usize>,
        pc: Pc,
    },
    Jump {
        to: usize,
    },
    Exit {
        plan: usize,
    },
}

/// A trace ready to run
#[derive(Debug, Clone)]
pub struct Lowered {
    pub start_pc: Pc,
    pub ops: Vec<Op>,
    pub plans: Vec<ExitPlan>,
    /// Size of the register file
    pub registers: usize,
}

fn plan_of(unit: &CompileUnit<'_>, map: &StackMap) -> ExitPlan {
    let slots = map
        .regs
        .iter()
        .map(|&reg| match unit.func.kind(reg) {
            InstKind::FramePush { .. } => Slot::Frame,
            _ => Slot::Value(reg),
        })
        .collect();
    ExitPlan {
        pc: map.pc,
        kind: map.kind,
        bottom: map.bottom,
        slots,
        call_depth: map.call_depth,
    }
}

/// Lower a validated compile unit
pub fn lower(unit: &CompileUnit<'_>) -> Result<Lowered> {
    let func = unit.func;

    let mut starts = HashMap::default();
    let mut offset = 0;
    for block in func.layout() {
        starts.insert(block, offset);
        offset += func.block(block).insts.len();
    }

    let mut ops = Vec::with_capacity(offset);
    let mut plans = Vec::new();
    let mut plan_index: HashMap<*const StackMap, usize> = HashMap::default();
    let mut plan_for = |inst: InstId, plans: &mut Vec<ExitPlan>| -> Result<usize> {
        let map = unit
            .exits
            .map_of(inst)
            .ok_or_else(|| Error::codegen(format!("{} has no exit map", inst)))?;
        let key = map as *const StackMap;
        if let Some(&at) = plan_index.get(&key) {
            return Ok(at);
        }
        plans.push(plan_of(unit, map));
        plan_index.insert(key, plans.len() - 1);
        Ok(plans.len() - 1)
    };

    for inst in func.live_insts() {
        let op = match &inst.kind {
            InstKind::Jump { block: Some(block), .. } => Op::Jump {
                to: *starts
                    .get(block)
                    .ok_or_else(|| Error::codegen(format!("jump to {} outside the layout", block)))?,
            },
            InstKind::Jump { target, block: None } => {
                return Err(Error::codegen(format!("unlinked jump to {}", target)))
            }
            InstKind::Exit { .. } => Op::Exit {
                plan: plan_for(inst.id, &mut plans)?,
            },
            kind => Op::Eval {
                dst: inst.id,
                kind: kind.clone(),
                exit: match kind.exit_pc() {
                    Some(_) => Some(plan_for(inst.id, &mut plans)?),
                    None => None,
                },
                pc: inst.pc,
            },
        };
        ops.push(op);
    }

    Ok(Lowered {
        start_pc: unit.start_pc,
        ops,
        plans,
        registers: func.len(),
    })
}
