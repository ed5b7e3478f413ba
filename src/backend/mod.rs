//! Reference backend
//!
//! Compiles traces for the reference [`Machine`] by lowering the IR into a
//! flat list of operations over a register file. Guards, exits and the
//! stack-map protocol behave exactly as a machine-code backend's would, so
//! the engine can be exercised end to end without emitting native code.

mod exec;
mod lower;

pub use exec::CompiledTrace;
pub use lower::{lower, ExitPlan, Lowered, Op, Slot};

use crate::error::Result;
use crate::jit::codegen::{Backend, CompileUnit, NativeCode};
use crate::runtime::vm::Machine;
use tracing::debug;

/// Backend producing [`CompiledTrace`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceBackend;

impl ReferenceBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend<Machine> for ReferenceBackend {
    fn name(&self) -> &str {
        "reference"
    }

    fn compile(&mut self, unit: &CompileUnit<'_>) -> Result<Box<dyn NativeCode<Machine>>> {
        let lowered = lower(unit)?;
        debug!(
            "lowered {}: {} ops, {} exit plans",
            unit.trace,
            lowered.ops.len(),
            lowered.plans.len()
        );
        Ok(Box::new(CompiledTrace::new(lowered)))
    }
}
