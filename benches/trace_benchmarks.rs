//! Performance benchmarks for quicktrace
//!
//! Run with: cargo bench
//!
//! Each built-in workload runs interpreted and traced, plus the cost of
//! recording and optimizing a trace on its own.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quicktrace::bytecode::{assemble, Program};
use quicktrace::jit::optimizer::TraceOptimizer;
use quicktrace::jit::recorder::{Flow, Recorder};
use quicktrace::jit::trace::TraceId;
use quicktrace::{demos, Interpreter, JitConfig, Machine};

fn run(program: &Program, config: JitConfig) -> quicktrace::Value {
    let mut interp = Interpreter::with_jit(config).unwrap();
    interp.load(program).unwrap();
    interp.run().unwrap()
}

/// Benchmark: every demo with and without the JIT
fn bench_demos(c: &mut Criterion) {
    let mut group = c.benchmark_group("demos");
    for demo in demos::DEMOS {
        let program = demo.program().unwrap();
        group.bench_with_input(BenchmarkId::new("interpreted", demo.name), &program, |b, p| {
            b.iter(|| black_box(run(p, JitConfig::disabled())))
        });
        group.bench_with_input(BenchmarkId::new("traced", demo.name), &program, |b, p| {
            b.iter(|| black_box(run(p, JitConfig::default())))
        });
    }
    group.finish();
}

/// Benchmark: recording one iteration of the counter loop
fn bench_recording(c: &mut Criterion) {
    let program = demos::find("counter").unwrap().program().unwrap();
    let config = JitConfig::default();
    c.bench_function("record_counter_loop", |b| {
        b.iter(|| black_box(record(&program, &config).func().live_count()))
    });
}

const INC_LOOP: &str = "
def inc params=1 locals=1
  getlocal 0 0
  putobject 1
  opt_plus
  leave
end
top main locals=1
  putobject 0
  setlocal 0 0
loop:
  putself
  getlocal 0 0
  send inc 1
  setlocal 0 0
  getlocal 0 0
  putobject 10
  opt_lt
  branchif loop
  getlocal 0 0
  leave
end
entry main
";

/// Record one iteration starting two instructions into `program`
fn record(program: &Program, config: &JitConfig) -> Recorder {
    let mut m = Machine::new();
    m.load(program).unwrap();
    m.start().unwrap();
    m.step().unwrap();
    m.step().unwrap();
    let mut recorder = Recorder::new(config);
    recorder.start(TraceId(0), m.pc(), Vec::new());
    loop {
        let pc = m.pc();
        if recorder.record(&mut m, pc) != Flow::Continue {
            break;
        }
        m.step().unwrap();
    }
    recorder.finalize();
    recorder
}

/// Benchmark: optimizer on a trace with an inlined method
fn bench_optimizer(c: &mut Criterion) {
    let program = assemble(INC_LOOP).unwrap();
    let recorder = record(&program, &JitConfig::default().with_optimize(false));
    let optimizer = TraceOptimizer::new();

    c.bench_function("optimize_inlined_call", |b| {
        b.iter(|| {
            let mut func = recorder.func().clone();
            black_box(optimizer.run(&mut func, recorder.exits()))
        })
    });
}

/// Benchmark: assembling every demo
fn bench_assemble(c: &mut Criterion) {
    c.bench_function("assemble_demos", |b| {
        b.iter(|| {
            for demo in demos::DEMOS {
                black_box(assemble(demo.source).unwrap());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_demos,
    bench_recording,
    bench_optimizer,
    bench_assemble
);

criterion_main!(benches);
