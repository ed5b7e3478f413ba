//! Shared test helpers for integration tests

#![allow(dead_code)]

use quicktrace::bytecode::{assemble, Pc};
use quicktrace::jit::function::Function;
use quicktrace::jit::ir::InstKind;
use quicktrace::jit::optimizer::TraceOptimizer;
use quicktrace::jit::recorder::{Flow, Recorder};
use quicktrace::jit::trace::TraceId;
use quicktrace::runtime::Step;
use quicktrace::{Interpreter, JitConfig, JitEngine, JitStats, Machine, Value};

/// `i = 0; begin i = i + 1 end while i < limit; i`
pub fn counter_loop(limit: i64) -> String {
    format!(
        "top main locals=1
           putobject 0
           setlocal 0 0
         loop:
           getlocal 0 0
           putobject 1
           opt_plus
           setlocal 0 0
           getlocal 0 0
           putobject {}
           opt_lt
           branchif loop
           getlocal 0 0
           leave
         end",
        limit
    )
}

/// Load and start `src` on a fresh machine
pub fn machine(src: &str) -> Machine {
    let program = assemble(src).unwrap();
    let mut m = Machine::new();
    m.load(&program).unwrap();
    m.start().unwrap();
    m
}

/// Address of the first `branchif` that jumps backwards
pub fn first_backward_branch(m: &Machine) -> Pc {
    (0..m.code_len() as u32)
        .map(Pc)
        .find(|pc| m.fetch(*pc).map_or(false, |insn| insn.is_backward_branch()))
        .unwrap()
}

/// Run `src` without a JIT; returns the result and the printed output
pub fn run_interpreted(src: &str) -> (Value, String) {
    let mut interp = Interpreter::new();
    let value = interp.eval(src).unwrap();
    (value, interp.take_output())
}

/// Run `src` with the reference backend attached
pub fn run_traced(src: &str, config: JitConfig) -> (Value, String, JitStats) {
    let mut interp = Interpreter::with_jit(config).unwrap();
    let value = interp.eval(src).unwrap();
    let stats = interp.jit_stats().unwrap_or_default();
    (value, interp.take_output(), stats)
}

/// Interpret `m` to completion, consulting `jit` before every instruction.
/// `on_dispatch` sees each pc the engine is asked about.
pub fn drive_with(
    m: &mut Machine,
    jit: &mut JitEngine<Machine>,
    mut on_dispatch: impl FnMut(Pc, &JitEngine<Machine>),
) -> Value {
    for _ in 0..1_000_000 {
        let pc = m.pc();
        on_dispatch(pc, jit);
        let next = jit.trace_dispatch(m, pc);
        if let Some(err) = m.take_pending_error() {
            panic!("trace raised: {}", err);
        }
        if next != pc {
            continue;
        }
        if let Step::Return(value) = m.step().unwrap() {
            return value;
        }
    }
    panic!("program did not finish");
}

/// One recording, stopped wherever the recorder stopped
pub struct Recording {
    pub machine: Machine,
    pub recorder: Recorder,
    pub flow: Flow,
    /// Interpreter stack height when recording started
    pub entry_len: usize,
    /// Interpreter stack height at each recorded pc, first visit only
    pub heights: Vec<(Pc, usize)>,
}

impl Recording {
    pub fn func(&self) -> &Function {
        self.recorder.func()
    }

    pub fn height_at(&self, pc: Pc) -> Option<usize> {
        self.heights.iter().find(|(p, _)| *p == pc).map(|(_, h)| *h)
    }

    /// Live instruction kinds in layout order
    pub fn kinds(&self) -> Vec<InstKind> {
        self.func().live_insts().map(|inst| inst.kind.clone()).collect()
    }

    pub fn count(&self, pred: impl Fn(&InstKind) -> bool) -> usize {
        self.kinds().iter().filter(|k| pred(k)).count()
    }
}

/// Interpret `src` up to its first backward branch and record from there
/// the way the engine does, finalizing (and optimizing when enabled) the
/// result.
pub fn record_first_loop(src: &str, config: &JitConfig) -> Recording {
    let mut m = machine(src);
    let header = first_backward_branch(&m);
    for _ in 0..10_000 {
        if m.pc() == header {
            break;
        }
        m.step().unwrap();
    }
    let start = m.pc();
    let entry_len = m.stack_len();
    let mut recorder = Recorder::new(config);
    recorder.start(TraceId(0), start, Vec::new());

    let mut heights: Vec<(Pc, usize)> = Vec::new();
    let mut steps = 0;
    let flow = loop {
        let pc = m.pc();
        if !heights.iter().any(|(p, _)| *p == pc) {
            heights.push((pc, m.stack_len()));
        }
        let flow = recorder.record(&mut m, pc);
        if flow != Flow::Continue {
            break flow;
        }
        m.step().unwrap();
        steps += 1;
        assert!(steps < 10_000, "recording did not stop");
    };

    recorder.finalize();
    if config.optimize {
        let (func, exits) = recorder.parts_mut();
        TraceOptimizer::new().run(func, exits);
    }
    Recording {
        machine: m,
        recorder,
        flow,
        entry_len,
        heights,
    }
}
