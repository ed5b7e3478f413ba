//! Runtime environment for quicktrace
//!
//! The reference [`Machine`] executes bytecode one instruction at a time.
//! [`Interpreter`] drives it and, when a JIT is attached, consults the
//! trace engine before every instruction.

pub mod builtins;
pub mod class;
pub mod host;
pub mod intern;
pub mod numeric;
pub mod value;
pub mod vm;

pub use class::{BasicOp, ClassId, IseqId};
pub use value::Value;
pub use vm::{Machine, Step};

use crate::backend::ReferenceBackend;
use crate::bytecode::{assemble, Program};
use crate::config::JitConfig;
use crate::error::Result;
use crate::jit::stats::JitStats;
use crate::jit::JitEngine;
use tracing::debug;

/// A machine plus an optional trace JIT
pub struct Interpreter {
    machine: Machine,
    jit: Option<JitEngine<Machine>>,
}

impl Interpreter {
    /// Interpreter without a JIT
    pub fn new() -> Self {
        Self {
            machine: Machine::new(),
            jit: None,
        }
    }

    /// Interpreter whose hot loops are compiled by the reference backend
    pub fn with_jit(config: JitConfig) -> Result<Self> {
        config.validate()?;
        let jit = config
            .enabled
            .then(|| JitEngine::new(config, Box::new(ReferenceBackend::new())));
        Ok(Self {
            machine: Machine::new(),
            jit,
        })
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub fn jit(&self) -> Option<&JitEngine<Machine>> {
        self.jit.as_ref()
    }

    pub fn jit_stats(&self) -> Option<JitStats> {
        self.jit.as_ref().map(JitEngine::stats)
    }

    pub fn load(&mut self, program: &Program) -> Result<()> {
        self.machine.load(program)
    }

    /// Assemble, load and run `source`
    pub fn eval(&mut self, source: &str) -> Result<Value> {
        let program = assemble(source)?;
        self.load(&program)?;
        self.run()
    }

    /// Run the loaded entry sequence to completion
    pub fn run(&mut self) -> Result<Value> {
        let machine = &mut self.machine;
        let Some(jit) = self.jit.as_mut() else {
            debug!("running without a JIT");
            return machine.run();
        };
        machine.start()?;
        loop {
            let pc = machine.pc();
            let next = jit.trace_dispatch(machine, pc);
            if let Some(err) = machine.take_pending_error() {
                return Err(err);
            }
            if next != pc {
                continue;
            }
            if let Step::Return(value) = machine.step()? {
                return Ok(value);
            }
            if machine.take_constants_redefined() {
                jit.invalidate_all();
            }
        }
    }

    /// Output written by `puts` and friends since the last call
    pub fn take_output(&mut self) -> String {
        self.machine.take_output()
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SUM: &str = "top main locals=2
           putobject 0
           setlocal 0 0
           putobject 0
           setlocal 1 0
         loop:
           getlocal 1 0
           getlocal 0 0
           opt_plus
           setlocal 1 0
           getlocal 0 0
           opt_succ
           setlocal 0 0
           getlocal 0 0
           putobject 100
           opt_lt
           branchif loop
           getlocal 1 0
           leave
         end";

    #[test]
    fn test_eval_without_jit() {
        let mut interp = Interpreter::new();
        assert_eq!(interp.eval(SUM).unwrap(), Value::Fixnum(4950));
        assert!(interp.jit_stats().is_none());
    }

    #[test]
    fn test_eval_with_jit_matches() {
        let mut interp = Interpreter::with_jit(JitConfig::default()).unwrap();
        assert_eq!(interp.eval(SUM).unwrap(), Value::Fixnum(4950));
        let stats = interp.jit_stats().unwrap();
        assert_eq!(stats.traces_compiled, 1);
    }

    #[test]
    fn test_disabled_config_attaches_nothing() {
        let interp = Interpreter::with_jit(JitConfig::disabled()).unwrap();
        assert!(interp.jit().is_none());
    }
}
