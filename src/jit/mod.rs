//! Trace JIT
//!
//! Counts visits to loop headers, records the hot path the interpreter takes
//! through them as guarded IR, optimizes it, and hands it to a code
//! generation [`Backend`](codegen::Backend). Side exits of compiled traces
//! grow child traces, so every trace is the root of a tree of hot paths.
//!
//! [`JitEngine`] owns all of it: one recorder, one trace repository, the
//! optimizer and the backend. The host interpreter calls
//! [`JitEngine::trace_dispatch`] before executing each instruction.
//!
//! | Module | Role |
//! |--------|------|
//! | [`trace`] | traces, their repository, modes and error statuses |
//! | [`recorder`] | per-instruction recording handlers |
//! | [`regstack`] | register stack and inlined-call shadow |
//! | [`snapshot`] | stack maps restoring interpreter state at exits |
//! | [`ir`], [`function`] | IR instructions and basic blocks |
//! | [`peephole`], [`fold`], [`optimizer`] | inline and post-pass optimization |
//! | [`icache`] | call-cache clones owned by traces |
//! | [`codegen`] | backend interface and exit protocol |

pub mod codegen;
pub mod fold;
pub mod function;
pub mod host;
pub mod icache;
pub mod ir;
pub mod optimizer;
pub mod pcmap;
pub mod peephole;
pub mod recorder;
pub mod regstack;
pub mod snapshot;
pub mod stats;
pub mod trace;

use crate::bytecode::Pc;
use crate::config::JitConfig;
use codegen::{Backend, CompileUnit, NullBackend, TraceExitStatus};
use host::Host;
use optimizer::TraceOptimizer;
use recorder::{Flow, Recorder};
use stats::JitStats;
use trace::{TraceError, TraceId, TraceMode, TraceRepository};
use tracing::{debug, info, warn};

/// The trace JIT attached to one interpreter
pub struct JitEngine<H: Host> {
    config: JitConfig,
    backend: Box<dyn Backend<H>>,
    optimizer: TraceOptimizer,
    repo: TraceRepository<H>,
    recorder: Recorder,
    stats: JitStats,
}

impl<H: Host> JitEngine<H> {
    pub fn new(config: JitConfig, backend: Box<dyn Backend<H>>) -> Self {
        debug!("jit engine up with the {} backend", backend.name());
        Self {
            recorder: Recorder::new(&config),
            config,
            backend,
            optimizer: TraceOptimizer::new(),
            repo: TraceRepository::new(),
            stats: JitStats::new(),
        }
    }

    /// Engine whose traces are recorded and optimized but never compiled
    pub fn with_null_backend(config: JitConfig) -> Self
    where
        H: 'static,
    {
        Self::new(config, Box::new(NullBackend))
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn mode(&self) -> TraceMode {
        self.recorder.mode()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub fn repository(&self) -> &TraceRepository<H> {
        &self.repo
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn stats(&self) -> JitStats {
        let mut stats = self.stats.clone();
        stats.caches = self.recorder.caches().stats();
        stats
    }

    // ==================== Dispatch ====================

    /// Called before the interpreter executes the instruction at `pc`.
    /// Returns where interpretation continues: `pc` itself unless a
    /// compiled trace ran.
    pub fn trace_dispatch(&mut self, host: &mut H, pc: Pc) -> Pc {
        if !self.config.enabled {
            return pc;
        }
        if self.recorder.is_recording() {
            self.record(host, pc);
            return pc;
        }
        if let Some(id) = self.repo.find(pc) {
            if self.repo.get(id).map_or(false, |t| t.is_compiled()) {
                return self.invoke(host, id, pc);
            }
            self.hit(host, id, pc);
            return pc;
        }
        let backward = host.fetch(pc).map_or(false, |insn| insn.is_backward_branch());
        if backward {
            let (id, created) = self.repo.get_or_create(pc, None, host.iseq_at(pc));
            if created {
                self.stats.traces_created += 1;
                debug!("new {} at {}", id, host.location(pc));
            }
            self.hit(host, id, pc);
        }
        pc
    }

    /// Count an interpreted visit; start recording once the trace is hot
    fn hit(&mut self, host: &mut H, id: TraceId, pc: Pc) {
        let threshold = self.config.hot_threshold;
        let Some(trace) = self.repo.get_mut(id) else {
            return;
        };
        trace.counter += 1;
        if trace.counter > threshold && !trace.is_compiled() && !trace.blacklisted {
            self.start_recording(host, id);
            self.record(host, pc);
        }
    }

    fn start_recording(&mut self, host: &H, id: TraceId) {
        let stops = self.repo.ancestor_starts(id);
        let Some(trace) = self.repo.get_mut(id) else {
            return;
        };
        trace.reset();
        let start = trace.start_pc;
        self.stats.recordings_started += 1;
        debug!("recording {} at {}", id, host.location(start));
        self.recorder.start(id, start, stops);
    }

    fn record(&mut self, host: &mut H, pc: Pc) {
        let before = self.recorder.recorded();
        let flow = self.recorder.record(host, pc);
        self.stats.instructions_recorded += (self.recorder.recorded() - before) as u64;
        match flow {
            Flow::Continue => {}
            Flow::Closed => self.submit(host),
            Flow::Aborted(reason) => {
                self.stats.record_abort(reason);
                if reason.allows_submit() {
                    self.submit(host);
                } else {
                    self.discard(reason);
                }
            }
        }
    }

    /// Finish the current recording and try to compile it
    fn submit(&mut self, host: &H) {
        let Some(id) = self.recorder.trace() else {
            self.recorder.reset();
            return;
        };
        self.recorder.finalize();
        if self.config.optimize {
            let (func, exits) = self.recorder.parts_mut();
            for (pass, result) in self.optimizer.run(func, exits) {
                debug!("{}: {:?}", pass, result);
                self.stats.ir_removed_by_optimizer += result.instructions_removed as u64;
            }
        }
        if self.config.dump_ir {
            info!("IR of {}:\n{}", id, self.recorder.func());
            for map in self.recorder.exits().iter() {
                info!("  {}", map);
            }
        }

        let start = self.recorder.start_pc();
        let last = self.recorder.last_pc();
        let compiled = if self.recorder.func().live_count() > self.config.min_trace_length {
            let unit = CompileUnit::new(id, start, self.recorder.func(), self.recorder.exits());
            unit.validate().and_then(|()| self.backend.compile(&unit))
        } else {
            Err(crate::error::Error::codegen(format!(
                "{} is too short ({} instructions)",
                id,
                self.recorder.func().live_count()
            )))
        };

        let side_exits = self.recorder.exits().by_pc();
        match compiled {
            Ok(code) => {
                let caches = self.recorder.caches_mut().freeze();
                info!(
                    "compiled {} at {} ({} ops, {} exits)",
                    id,
                    host.location(start),
                    code.size(),
                    side_exits.len()
                );
                if let Some(trace) = self.repo.get_mut(id) {
                    trace.code = Some(code);
                    trace.caches = caches;
                    trace.side_exits = side_exits;
                    trace.last_pc = last;
                }
                self.stats.traces_compiled += 1;
            }
            Err(err) => {
                debug!("{} not compiled: {}", id, err);
                self.recorder.caches_mut().cancel_unfrozen();
                if let Some(trace) = self.repo.get_mut(id) {
                    trace.blacklisted = true;
                    trace.side_exits = side_exits;
                    trace.last_pc = last;
                }
                self.stats.compile_failures += 1;
                self.stats.blacklisted += 1;
            }
        }
        self.recorder.reset();
    }

    /// Throw away an attempt that must not be compiled
    fn discard(&mut self, reason: TraceError) {
        if let Some(id) = self.recorder.trace() {
            debug!("discarding {}: {}", id, reason);
            if let Some(trace) = self.repo.get_mut(id) {
                trace.blacklisted = true;
            }
            self.stats.blacklisted += 1;
        }
        self.recorder.caches_mut().cancel_unfrozen();
        self.recorder.reset();
    }

    // ==================== Execution ====================

    fn invoke(&mut self, host: &mut H, id: TraceId, pc: Pc) -> Pc {
        let exit = match self.repo.get_mut(id) {
            Some(trace) => {
                trace.invocations += 1;
                match &trace.code {
                    Some(code) => code.invoke(host, pc),
                    None => return pc,
                }
            }
            None => return pc,
        };
        self.stats.record_exit(exit.status);
        match exit.status {
            TraceExitStatus::Success => exit.exit_pc,
            TraceExitStatus::SideExit => {
                let (child, created) = self.repo.get_or_create(exit.exit_pc, Some(id), host.iseq_at(exit.exit_pc));
                if created {
                    self.stats.traces_created += 1;
                    debug!("{} grows {} at {}", id, child, host.location(exit.exit_pc));
                }
                let startable = self
                    .repo
                    .get(child)
                    .map_or(false, |t| !t.is_compiled() && !t.blacklisted);
                if startable {
                    self.start_recording(host, child);
                }
                exit.exit_pc
            }
            TraceExitStatus::Error => {
                warn!("{} raised at {}", id, host.location(exit.exit_pc));
                pc
            }
        }
    }

    /// Drop every trace and compiled code. Called when the host changes
    /// state traces may have folded in, such as constants.
    pub fn invalidate_all(&mut self) {
        if self.repo.is_empty() && !self.recorder.is_recording() {
            return;
        }
        info!("invalidating {} traces", self.repo.len());
        self.recorder.reset();
        self.recorder.caches_mut().cancel_unfrozen();
        self.repo.clear();
        self.stats.invalidations += 1;
    }

    /// Tear down: drop all traces and report
    pub fn shutdown(&mut self) {
        if self.stats.recordings_started > 0 {
            debug!(
                "jit shutdown: {} traces, {} compiled, {} aborts",
                self.repo.len(),
                self.repo.compiled_count(),
                self.stats.total_aborts()
            );
        }
        self.recorder.reset();
        self.recorder.caches_mut().cancel_unfrozen();
        self.repo.clear();
    }
}

impl<H: Host> Drop for JitEngine<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::assemble;
    use crate::runtime::vm::Machine;

    const LOOP: &str = "top main locals=1
           putobject 0
           setlocal 0 0
         loop:
           getlocal 0 0
           putobject 1
           opt_plus
           setlocal 0 0
           getlocal 0 0
           putobject 50
           opt_lt
           branchif loop
           getlocal 0 0
           leave
         end";

    fn machine(src: &str) -> Machine {
        let mut m = Machine::new();
        m.load(&assemble(src).unwrap()).unwrap();
        m.start().unwrap();
        m
    }

    /// Interpret with the engine consulted before every instruction
    fn run(m: &mut Machine, jit: &mut JitEngine<Machine>) -> crate::runtime::value::Value {
        loop {
            let pc = m.pc();
            let next = jit.trace_dispatch(m, pc);
            if next != pc {
                continue;
            }
            if let crate::runtime::vm::Step::Return(v) = m.step().unwrap() {
                return v;
            }
        }
    }

    #[test]
    fn test_disabled_engine_never_records() {
        let mut m = machine(LOOP);
        let mut jit = JitEngine::with_null_backend(JitConfig::disabled());
        run(&mut m, &mut jit);
        assert!(jit.repository().is_empty());
        assert_eq!(jit.stats().recordings_started, 0);
    }

    #[test]
    fn test_hot_loop_is_recorded_once() {
        let mut m = machine(LOOP);
        let mut jit = JitEngine::with_null_backend(JitConfig::default());
        let value = run(&mut m, &mut jit);
        assert_eq!(value, crate::runtime::value::Value::Fixnum(50));

        let stats = jit.stats();
        assert_eq!(stats.traces_created, 1);
        assert_eq!(stats.recordings_started, 1);
        // the null backend declines, so the trace is blacklisted
        assert_eq!(stats.compile_failures, 1);
        assert_eq!(stats.blacklisted, 1);
        let trace = jit.repository().iter().next().unwrap();
        assert!(trace.blacklisted);
        assert!(!trace.is_compiled());
        assert_eq!(trace.counter, 49);
        assert!(!jit.is_recording());
    }

    #[test]
    fn test_invalidate_all_clears_repository() {
        let mut m = machine(LOOP);
        let mut jit = JitEngine::with_null_backend(JitConfig::default());
        run(&mut m, &mut jit);
        jit.invalidate_all();
        assert!(jit.repository().is_empty());
        assert_eq!(jit.stats().invalidations, 1);
        // nothing left to invalidate
        jit.invalidate_all();
        assert_eq!(jit.stats().invalidations, 1);
    }
}
