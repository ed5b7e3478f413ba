//! Code generation interface
//!
//! The engine hands every finished trace to a [`Backend`]. A backend either
//! returns [`NativeCode`] callable on the host, or declines; a declined
//! trace is never offered again. Compiled code reports how it left through
//! a [`TraceExit`].

use super::function::Function;
use super::ir::InstId;
use super::snapshot::ExitMaps;
use super::trace::TraceId;
use crate::bytecode::Pc;
use crate::error::{Error, Result};
use std::fmt;

// ==================== Trace Exit ====================

/// How compiled code returned to the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceExitStatus {
    /// Left through a success exit (loop finished, or a parent trace takes
    /// over)
    Success,
    /// A guard failed
    SideExit,
    /// A call made by the trace raised; the host holds the error
    Error,
}

/// Exit status plus the program counter to resume at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceExit {
    pub status: TraceExitStatus,
    pub exit_pc: Pc,
}

impl TraceExit {
    pub fn success(exit_pc: Pc) -> Self {
        Self {
            status: TraceExitStatus::Success,
            exit_pc,
        }
    }

    pub fn side_exit(exit_pc: Pc) -> Self {
        Self {
            status: TraceExitStatus::SideExit,
            exit_pc,
        }
    }

    pub fn error(exit_pc: Pc) -> Self {
        Self {
            status: TraceExitStatus::Error,
            exit_pc,
        }
    }
}

impl fmt::Display for TraceExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status {
            TraceExitStatus::Success => "success",
            TraceExitStatus::SideExit => "side-exit",
            TraceExitStatus::Error => "error",
        };
        write!(f, "{} at {}", status, self.exit_pc)
    }
}

// ==================== Backend ====================

/// Code produced for one trace
pub trait NativeCode<H> {
    /// Run the trace on `host`, entered at `pc`
    fn invoke(&self, host: &mut H, pc: Pc) -> TraceExit;

    /// Number of lowered operations (diagnostics only)
    fn size(&self) -> usize {
        0
    }
}

/// Everything a backend sees of a finished trace
#[derive(Clone, Copy)]
pub struct CompileUnit<'a> {
    pub trace: TraceId,
    pub start_pc: Pc,
    pub func: &'a Function,
    pub exits: &'a ExitMaps,
}

impl<'a> CompileUnit<'a> {
    pub fn new(trace: TraceId, start_pc: Pc, func: &'a Function, exits: &'a ExitMaps) -> Self {
        Self {
            trace,
            start_pc,
            func,
            exits,
        }
    }

    /// Check the structural contract backends rely on: operands are live
    /// and defined earlier in layout order, every block ends in a
    /// terminator, jumps are linked and every exit has a bound map
    pub fn validate(&self) -> Result<()> {
        let func = self.func;
        if func.entry().is_none() {
            return Err(Error::codegen(format!("{} has no entry block", self.trace)));
        }
        let mut position = vec![usize::MAX; func.len()];
        for (at, inst) in func.live_insts().enumerate() {
            position[inst.id.index()] = at;
        }
        let defined_before = |op: InstId, at: usize| position.get(op.index()).map_or(false, |&p| p < at);

        for (at, inst) in func.live_insts().enumerate() {
            for op in inst.kind.operands() {
                if !defined_before(op, at) {
                    return Err(Error::codegen(format!("{} reads {} before it is defined", inst, op)));
                }
            }
            if inst.kind.exit_pc().is_some() {
                let map = self
                    .exits
                    .map_of(inst.id)
                    .ok_or_else(|| Error::codegen(format!("{} has no exit map", inst)))?;
                for reg in map.uses() {
                    if !defined_before(reg, at) {
                        return Err(Error::codegen(format!("exit of {} restores undefined {}", inst, reg)));
                    }
                }
            }
            if let super::ir::InstKind::Jump { block: None, target } = inst.kind {
                return Err(Error::codegen(format!("unlinked jump to {}", target)));
            }
        }
        for block in func.layout() {
            let terminated = func
                .block(block)
                .last()
                .map_or(false, |last| func.kind(last).is_terminator());
            if !terminated {
                return Err(Error::codegen(format!("{} does not end in a terminator", block)));
            }
        }
        Ok(())
    }
}

/// Turns finished traces into native code
pub trait Backend<H> {
    fn name(&self) -> &str;

    /// Compile `unit`; an error means the trace stays interpreted
    fn compile(&mut self, unit: &CompileUnit<'_>) -> Result<Box<dyn NativeCode<H>>>;
}

/// Backend that declines every trace. Recording, optimization and the
/// repository still run, which makes it useful for inspecting IR.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl<H> Backend<H> for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn compile(&mut self, unit: &CompileUnit<'_>) -> Result<Box<dyn NativeCode<H>>> {
        Err(Error::codegen(format!("{} declined by the null backend", unit.trace)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{Constant, InstKind, TypeCheck};
    use crate::jit::snapshot::{ExitKind, StackMap};

    fn entry_func() -> Function {
        let mut func = Function::new(8);
        let b = func.create_block(None, 0, 0);
        func.set_current(Some(b));
        func.push(InstKind::StackAdjust);
        func
    }

    #[test]
    fn test_valid_unit() {
        let mut func = entry_func();
        let v = func.push(InstKind::LoadConst(Constant::Fixnum(1)));
        let guard = func.push(InstKind::GuardType {
            check: TypeCheck::Fixnum,
            value: v,
            exit: Pc(3),
        });
        let exit = func.push(InstKind::Exit { pc: Pc(4) });
        let mut exits = ExitMaps::new();
        exits.push(StackMap::new(Pc(3), ExitKind::SideExit, 0, vec![v], 0));
        exits.bind(guard, Pc(3));
        exits.push(StackMap::new(Pc(4), ExitKind::Success, 0, vec![], 0));
        exits.bind(exit, Pc(4));
        let unit = CompileUnit::new(TraceId(0), Pc(0), &func, &exits);
        assert!(unit.validate().is_ok());
    }

    #[test]
    fn test_unbound_exit_is_rejected() {
        let mut func = entry_func();
        func.push(InstKind::Exit { pc: Pc(4) });
        let exits = ExitMaps::new();
        let err = CompileUnit::new(TraceId(1), Pc(0), &func, &exits)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("has no exit map"));
    }

    #[test]
    fn test_missing_terminator_is_rejected() {
        let func = entry_func();
        let exits = ExitMaps::new();
        let err = CompileUnit::new(TraceId(1), Pc(0), &func, &exits)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("does not end in a terminator"));
    }

    #[test]
    fn test_null_backend_declines() {
        let mut func = entry_func();
        let exit = func.push(InstKind::Exit { pc: Pc(0) });
        let mut exits = ExitMaps::new();
        exits.push(StackMap::default());
        exits.bind(exit, Pc(0));
        let unit = CompileUnit::new(TraceId(2), Pc(0), &func, &exits);
        let result: Result<Box<dyn NativeCode<()>>> = NullBackend.compile(&unit);
        assert!(result.is_err());
    }

    #[test]
    fn test_exit_display() {
        assert_eq!(TraceExit::side_exit(Pc(12)).to_string(), "side-exit at 0012");
        assert_eq!(TraceExit::success(Pc(3)).status, TraceExitStatus::Success);
    }
}
