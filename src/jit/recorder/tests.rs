use super::*;
use crate::bytecode::assemble;
use crate::jit::ir::TypeCheck;
use crate::runtime::vm::Machine;
use pretty_assertions::assert_eq;

const COUNTER_LOOP: &str = "top main locals=1
       putobject 0
       setlocal 0 0
     loop:
       getlocal 0 0
       putobject 1
       opt_plus
       setlocal 0 0
       getlocal 0 0
       putobject 100
       opt_lt
       branchif loop
       getlocal 0 0
       leave
     end";

/// Load `src` and execute `steps` instructions
fn machine(src: &str, steps: usize) -> Machine {
    let program = assemble(src).unwrap();
    let mut m = Machine::new();
    m.load(&program).unwrap();
    m.start().unwrap();
    for _ in 0..steps {
        m.step().unwrap();
    }
    m
}

/// Record and execute instructions until the recorder stops
fn drive(m: &mut Machine, r: &mut Recorder) -> Flow {
    for _ in 0..1000 {
        let pc = m.pc();
        let flow = r.record(m, pc);
        if flow != Flow::Continue {
            return flow;
        }
        m.step().unwrap();
    }
    panic!("recording did not stop");
}

fn kinds(r: &Recorder) -> Vec<InstKind> {
    r.func().live_insts().map(|inst| inst.kind.clone()).collect()
}

fn count(r: &Recorder, pred: impl Fn(&InstKind) -> bool) -> usize {
    kinds(r).iter().filter(|k| pred(k)).count()
}

#[test]
fn test_counter_loop_closes() {
    let mut m = machine(COUNTER_LOOP, 2);
    let header = m.pc();
    let mut r = Recorder::new(&JitConfig::default());
    r.start(TraceId(0), header, Vec::new());

    assert_eq!(drive(&mut m, &mut r), Flow::Closed);
    assert_eq!(r.recorded(), 8);
    assert!(r.func().is_terminated());
    assert_eq!(count(&r, |k| matches!(k, InstKind::FixnumArith { .. })), 1);
    assert_eq!(count(&r, |k| matches!(k, InstKind::FixnumCmp { .. })), 1);
    // the back edge re-enters the loop block instead of leaving the trace
    assert_eq!(
        count(&r, |k| matches!(k, InstKind::Jump { block: Some(_), .. })),
        1
    );
    assert_eq!(count(&r, |k| matches!(k, InstKind::Exit { .. })), 0);
}

#[test]
fn test_branch_guard_exits_to_untaken_side() {
    let mut m = machine(COUNTER_LOOP, 2);
    let header = m.pc();
    let mut r = Recorder::new(&JitConfig::default());
    r.start(TraceId(0), header, Vec::new());
    drive(&mut m, &mut r);

    let branch_exit = r
        .exits()
        .iter()
        .find(|map| map.pc == Pc(header.0 + 8))
        .cloned()
        .unwrap();
    assert_eq!(branch_exit.kind, ExitKind::SideExit);
    assert!(kinds(&r).iter().any(|k| matches!(
        k,
        InstKind::GuardType {
            check: TypeCheck::NonNil,
            ..
        }
    )));
}

#[test]
fn test_values_below_entry_are_lifted() {
    // start after `getlocal`, so `opt_plus` consumes a value the trace
    // did not produce
    let mut m = machine(COUNTER_LOOP, 3);
    let start = m.pc();
    let header = Pc(start.0 - 1);
    let mut r = Recorder::new(&JitConfig::default());
    r.start(TraceId(1), start, vec![header]);

    assert_eq!(drive(&mut m, &mut r), Flow::Closed);
    assert_eq!(
        count(&r, |k| matches!(k, InstKind::StackPop { depth: 1 })),
        1
    );
    // reaching the parent's header leaves with a success exit
    let last = r.exits().iter().last().cloned().unwrap();
    assert_eq!(last.pc, header);
    assert!(last.is_success());
}

#[test]
fn test_native_call_aborts_with_exit() {
    let mut m = machine(
        "top main locals=1
           putobject 0
           setlocal 0 0
         loop:
           putself
           getlocal 0 0
           send puts 1
           pop
           jump loop
           putnil
           leave
         end",
        2,
    );
    let mut r = Recorder::new(&JitConfig::default());
    r.start(TraceId(0), m.pc(), Vec::new());

    assert_eq!(
        drive(&mut m, &mut r),
        Flow::Aborted(TraceError::NativeMethod)
    );
    assert!(r.func().is_terminated());
    // the failed call left nothing behind but the abort exit
    let insts = kinds(&r);
    assert!(matches!(insts.last(), Some(InstKind::Exit { .. })));
    assert!(!insts
        .iter()
        .any(|k| matches!(k, InstKind::GuardMethodCache { .. })));
}

#[test]
fn test_iseq_method_is_inlined() {
    let mut m = machine(
        "def inc params=1 locals=1
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
         entry main",
        2,
    );
    let mut r = Recorder::new(&JitConfig::default());
    r.start(TraceId(0), m.pc(), Vec::new());

    assert_eq!(drive(&mut m, &mut r), Flow::Closed);
    assert_eq!(count(&r, |k| matches!(k, InstKind::FramePush { .. })), 1);
    assert_eq!(count(&r, |k| matches!(k, InstKind::FramePop)), 1);
    assert_eq!(
        count(&r, |k| matches!(k, InstKind::GuardMethodCache { .. })),
        1
    );
    assert_eq!(r.caches().pending(), 1);
}

#[test]
fn test_leave_at_top_aborts() {
    let mut m = machine(
        "top main
           putobject 1
           putobject 2
           opt_plus
           leave
         end",
        0,
    );
    let mut r = Recorder::new(&JitConfig::default());
    r.start(TraceId(0), m.pc(), Vec::new());
    assert_eq!(drive(&mut m, &mut r), Flow::Aborted(TraceError::Leave));
    // 1 + 2 folds to a constant
    assert_eq!(count(&r, |k| matches!(k, InstKind::FixnumArith { .. })), 0);
}

#[test]
fn test_buffer_full() {
    let config = JitConfig {
        max_trace_length: 6,
        ..JitConfig::default()
    };
    let mut m = machine(COUNTER_LOOP, 2);
    let mut r = Recorder::new(&config);
    r.start(TraceId(0), m.pc(), Vec::new());
    assert_eq!(
        drive(&mut m, &mut r),
        Flow::Aborted(TraceError::BufferFull)
    );
    assert!(r.func().is_terminated());
}

#[test]
fn test_reset_keeps_nothing() {
    let mut m = machine(COUNTER_LOOP, 2);
    let mut r = Recorder::new(&JitConfig::default());
    r.start(TraceId(0), m.pc(), Vec::new());
    drive(&mut m, &mut r);
    r.reset();
    assert!(!r.is_recording());
    assert_eq!(r.trace(), None);
    assert!(r.func().is_empty());
    assert!(r.exits().is_empty());
}

#[test]
fn test_float_operands_use_flonum_guards() {
    let mut m = machine(
        "top main locals=1
           putobject 0.5
           setlocal 0 0
         loop:
           getlocal 0 0
           putobject 1.5
           opt_mult
           setlocal 0 0
           jump loop
           putnil
           leave
         end",
        2,
    );
    let mut r = Recorder::new(&JitConfig::default());
    r.start(TraceId(0), m.pc(), Vec::new());
    assert_eq!(drive(&mut m, &mut r), Flow::Closed);
    assert_eq!(count(&r, |k| matches!(k, InstKind::FloatArith { .. })), 1);
    assert!(kinds(&r).iter().any(|k| matches!(
        k,
        InstKind::GuardType {
            check: TypeCheck::Flonum,
            ..
        }
    )));
}

#[test]
fn test_header_fallthrough_is_success_from_first_visit() {
    // start on the `branchif` itself, the way the engine does
    let mut m = machine(COUNTER_LOOP, 9);
    let header = m.pc();
    assert!(m.fetch(header).unwrap().is_backward_branch());
    let mut r = Recorder::new(&JitConfig::default());
    r.start(TraceId(0), header, Vec::new());

    assert_eq!(drive(&mut m, &mut r), Flow::Closed);
    let fallthrough: Vec<ExitKind> = r
        .exits()
        .iter()
        .filter(|map| map.pc == header.next())
        .map(|map| map.kind)
        .collect();
    assert!(!fallthrough.is_empty());
    assert!(fallthrough.iter().all(|kind| *kind == ExitKind::Success));
}

/// Record the loop at pc 2 whose body is `body` followed by `jump loop`
fn record_loop_body(body: &str) -> (Machine, Recorder, Flow) {
    let src = format!(
        "top main locals=1
           putobject 0
           setlocal 0 0
         loop:
{}
           jump loop
           putnil
           leave
         end",
        body
    );
    let mut m = machine(&src, 2);
    let mut r = Recorder::new(&JitConfig::default());
    r.start(TraceId(0), m.pc(), Vec::new());
    let flow = drive(&mut m, &mut r);
    (m, r, flow)
}

fn assert_aborts_at(body: &str, name: &str, reason: TraceError) {
    let (m, r, flow) = record_loop_body(body);
    assert_eq!(flow, Flow::Aborted(reason));
    let pc = m.pc();
    assert_eq!(m.fetch(pc).unwrap().name(), name);
    let last = r.exits().iter().last().cloned().unwrap();
    assert_eq!(last.pc, pc);
    assert_eq!(last.kind, ExitKind::SideExit);
    assert!(matches!(kinds(&r).last(), Some(InstKind::Exit { pc: at }) if *at == pc));
}

#[test]
fn test_unsupported_opcode_aborts_with_exit() {
    assert_aborts_at(
        "getlocal 0 0
         opt_not
         pop",
        "opt_not",
        TraceError::UnsupportedOpcode,
    );
}

#[test]
fn test_topn_aborts_with_exit() {
    assert_aborts_at(
        "getlocal 0 0
         topn 0
         pop
         pop",
        "topn",
        TraceError::UnsupportedOpcode,
    );
}

#[test]
fn test_throw_aborts_with_exit() {
    assert_aborts_at(
        "putnil
         throw",
        "throw",
        TraceError::Throw,
    );
}
