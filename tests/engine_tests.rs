//! Trace engine behavior: hotness, aborts, trace trees and exits that
//! hand control back to the interpreter

mod common;
use common::{counter_loop, drive_with, first_backward_branch, machine, run_interpreted, run_traced};
use quicktrace::bytecode::Pc;
use quicktrace::jit::trace::TraceError;
use quicktrace::RuntimeErrorKind;
use quicktrace::{demos, Interpreter, JitConfig, JitEngine, Value};

/// `acc += 1` while `i < 50`, `acc += 2` afterwards, for 100 iterations
const TWO_PATHS: &str = "top main locals=2
       putobject 0
       setlocal 0 0
       putobject 0
       setlocal 1 0
     loop:
       getlocal 0 0
       putobject 50
       opt_lt
       branchunless big
       getlocal 1 0
       putobject 1
       opt_plus
       setlocal 1 0
       jump next
     big:
       getlocal 1 0
       putobject 2
       opt_plus
       setlocal 1 0
     next:
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

mod hotness {
    use super::*;
    use pretty_assertions::assert_eq;

    fn recordings(limit: i64) -> u64 {
        let mut m = machine(&counter_loop(limit));
        let mut jit = JitEngine::with_null_backend(JitConfig::default());
        drive_with(&mut m, &mut jit, |_, _| {});
        jit.stats().recordings_started
    }

    #[test]
    fn test_threshold_visits_do_not_record() {
        // the header runs once per iteration
        let threshold = JitConfig::default().hot_threshold as i64;
        assert_eq!(recordings(threshold), 0);
    }

    #[test]
    fn test_one_more_visit_records() {
        let threshold = JitConfig::default().hot_threshold as i64;
        assert_eq!(recordings(threshold + 1), 1);
    }

    #[test]
    fn test_custom_threshold() {
        let mut m = machine(&counter_loop(30));
        let header = first_backward_branch(&m);
        let mut jit = JitEngine::with_null_backend(JitConfig::default().with_hot_threshold(20));
        let mut started_at = None;
        let mut visits = 0;
        drive_with(&mut m, &mut jit, |pc, jit| {
            if started_at.is_none() && jit.is_recording() {
                started_at = Some(visits);
            }
            if pc == header {
                visits += 1;
            }
        });
        assert_eq!(started_at, Some(21));
        assert_eq!(jit.stats().recordings_started, 1);
    }
}

mod aborts {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    #[test]
    fn test_native_abort_keeps_trace_uncompiled() {
        let program = demos::find("rand").unwrap().source;
        let mut m = machine(program);
        let mut jit = JitEngine::with_null_backend(JitConfig::default());

        let mut header = None;
        let mut ids = BTreeSet::new();
        let mut visits = 0u32;
        let mut counter_after_abort = None;
        let mut was_recording = false;
        drive_with(&mut m, &mut jit, |pc, jit| {
            let repo = jit.repository();
            if header.is_none() {
                header = repo.iter().next().map(|t| t.start_pc);
            }
            if let Some(header) = header {
                if let Some(id) = repo.find(header) {
                    ids.insert(id);
                }
                if pc == header {
                    visits += 1;
                }
                if was_recording && !jit.is_recording() {
                    counter_after_abort = repo.get(repo.find(header).unwrap()).map(|t| t.counter);
                }
            }
            was_recording = jit.is_recording();
        });

        let stats = jit.stats();
        assert_eq!(stats.aborts.get(&TraceError::NativeMethod), Some(&1));
        assert_eq!(stats.recordings_started, 1);
        assert_eq!(ids.len(), 1);

        let trace = jit.repository().iter().next().unwrap();
        assert!(trace.code.is_none());
        // the abort did not touch the counter, later visits kept counting
        let threshold = JitConfig::default().hot_threshold;
        assert_eq!(counter_after_abort, Some(threshold + 1));
        // the first visit happened before the trace existed
        assert_eq!(trace.counter, visits + 1);
    }

    #[test]
    fn test_aborted_loop_still_computes() {
        let src = demos::find("rand").unwrap().source;
        let (expected, _) = run_interpreted(src);
        let (value, _, stats) = run_traced(src, JitConfig::default());
        assert_eq!(value, expected);
        assert!(stats.aborts.get(&TraceError::NativeMethod).copied().unwrap_or(0) >= 1);
    }

    /// `acc` stays on the operand stack across iterations, so the loop body
    /// consumes a value from below the trace entry
    const STACK_CARRIED: &str = "top main locals=1
           putobject 0
           putobject 0
           setlocal 0 0
         loop:
           putobject 1
           opt_plus
           getlocal 0 0
           opt_succ
           dup
           setlocal 0 0
           putobject 50
           opt_lt
           branchif loop
           leave
         end";

    #[test]
    fn test_underflow_discards_trace() {
        let config = JitConfig {
            reserved_regstack: 1,
            ..JitConfig::default()
        };
        let mut interp = Interpreter::with_jit(config).unwrap();
        assert_eq!(interp.eval(STACK_CARRIED).unwrap(), Value::Fixnum(50));

        let jit = interp.jit().unwrap();
        let stats = jit.stats();
        assert_eq!(stats.aborts.get(&TraceError::RegstackUnderflow), Some(&1));
        assert_eq!(stats.recordings_started, 1);
        assert_eq!(stats.traces_compiled, 0);
        assert_eq!(stats.compile_failures, 0);
        assert_eq!(stats.blacklisted, 1);

        let trace = jit.repository().iter().next().unwrap();
        assert!(trace.blacklisted);
        assert!(trace.code.is_none());
    }

    #[test]
    fn test_values_below_entry_fit_default_reserve() {
        let (expected, _) = run_interpreted(STACK_CARRIED);
        let (value, _, stats) = run_traced(STACK_CARRIED, JitConfig::default());
        assert_eq!(value, expected);
        assert_eq!(stats.aborts.get(&TraceError::RegstackUnderflow), None);
    }

    #[test]
    fn test_unsupported_opcode_still_submits() {
        let src = "top main locals=1
               putobject 0
               setlocal 0 0
             loop:
               getlocal 0 0
               opt_not
               pop
               getlocal 0 0
               opt_succ
               setlocal 0 0
               getlocal 0 0
               putobject 40
               opt_lt
               branchif loop
               getlocal 0 0
               leave
             end";
        let (expected, _) = run_interpreted(src);
        let (value, _, stats) = run_traced(src, JitConfig::default());
        assert_eq!(value, expected);
        let aborts = stats.aborts.get(&TraceError::UnsupportedOpcode).copied().unwrap_or(0);
        assert!(aborts >= 1);
        // every unsupported abort went on to submission
        assert_eq!(stats.traces_compiled + stats.compile_failures, aborts);
    }
}

mod trace_trees {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_side_exit_grows_child() {
        let mut interp = Interpreter::with_jit(JitConfig::default()).unwrap();
        let value = interp.eval(TWO_PATHS).unwrap();
        assert_eq!(value, Value::Fixnum(150));

        let jit = interp.jit().unwrap();
        let repo = jit.repository();
        assert_eq!(repo.len(), 2);
        let parent = repo.iter().find(|t| t.parent.is_none()).unwrap();
        let child = repo.iter().find(|t| t.parent.is_some()).unwrap();
        assert_eq!(child.parent, Some(parent.id));

        // the child starts at `big:`, right after the `jump`
        let m = interp.machine();
        assert_eq!(m.fetch(child.start_pc).unwrap().name(), "getlocal");
        assert_eq!(m.fetch(Pc(child.start_pc.0 - 1)).unwrap().name(), "jump");
        assert!(parent.is_compiled());
        assert!(child.is_compiled());

        // each later iteration runs the parent, then the child, and the
        // child hands back to the parent instead of recording again
        let stats = jit.stats();
        assert_eq!(stats.recordings_started, 2);
        assert_eq!(stats.traces_compiled, 2);
        assert!(child.invocations >= 40);
        assert!(parent.invocations > child.invocations);
    }

    #[test]
    fn test_child_closes_at_parent_header() {
        let mut interp = Interpreter::with_jit(JitConfig::default()).unwrap();
        interp.eval(TWO_PATHS).unwrap();
        let repo = interp.jit().unwrap().repository();
        let parent = repo.iter().find(|t| t.parent.is_none()).unwrap();
        let child = repo.iter().find(|t| t.parent.is_some()).unwrap();
        assert_eq!(repo.ancestor_starts(child.id), vec![parent.start_pc]);
        let back = child.side_exits.get(parent.start_pc).unwrap();
        assert!(back.is_success());
    }
}

mod fidelity {
    use super::*;
    use pretty_assertions::assert_eq;

    fn same_result(src: &str) -> quicktrace::JitStats {
        let (expected, expected_out) = run_interpreted(src);
        let (value, out, stats) = run_traced(src, JitConfig::default());
        assert_eq!(value, expected);
        assert_eq!(out, expected_out);
        stats
    }

    #[test]
    fn test_every_demo_matches_interpreter() {
        for demo in demos::DEMOS {
            let stats = same_result(demo.source);
            assert!(stats.recordings_started >= 1, "{} never got hot", demo.name);
        }
    }

    #[test]
    fn test_two_paths_match_interpreter() {
        let stats = same_result(TWO_PATHS);
        assert!(stats.side_exits >= 1);
    }

    #[test]
    fn test_type_change_side_exits() {
        // `x` turns into a float at i == 30
        let stats = same_result(
            "top main locals=3
               putobject 0
               setlocal 0 0
               putobject 0
               setlocal 1 0
               putobject 1
               setlocal 2 0
             loop:
               getlocal 0 0
               putobject 30
               opt_eq
               branchunless skip
               putobject 0.5
               setlocal 2 0
             skip:
               getlocal 1 0
               getlocal 2 0
               opt_plus
               setlocal 1 0
               getlocal 0 0
               opt_succ
               setlocal 0 0
               getlocal 0 0
               putobject 60
               opt_lt
               branchif loop
               getlocal 1 0
               leave
             end",
        );
        assert!(stats.side_exits >= 1);
    }

    #[test]
    fn test_overflow_promotes() {
        let (value, _, _) = run_traced(
            "top main locals=2
               putobject 1
               setlocal 0 0
               putobject 0
               setlocal 1 0
             loop:
               getlocal 0 0
               putobject 3
               opt_mult
               setlocal 0 0
               getlocal 1 0
               opt_succ
               setlocal 1 0
               getlocal 1 0
               putobject 60
               opt_lt
               branchif loop
               getlocal 0 0
               leave
             end",
            JitConfig::default(),
        );
        let expected = num_bigint::BigInt::from(3u8).pow(60);
        assert_eq!(value, Value::Bignum(std::rc::Rc::new(expected)));
    }

    #[test]
    fn test_division_by_zero_raises_in_interpreter() {
        let src = "top main locals=2
               putobject 0
               setlocal 0 0
               putobject 0
               setlocal 1 0
             loop:
               getlocal 1 0
               putobject 100
               putobject 20
               getlocal 0 0
               opt_minus
               opt_div
               opt_plus
               setlocal 1 0
               getlocal 0 0
               opt_succ
               setlocal 0 0
               getlocal 0 0
               putobject 30
               opt_lt
               branchif loop
               getlocal 1 0
               leave
             end";
        let expected = Interpreter::new().eval(src).unwrap_err();
        let mut interp = Interpreter::with_jit(JitConfig::default()).unwrap();
        let err = interp.eval(src).unwrap_err();
        assert_eq!(err.runtime_kind(), Some(RuntimeErrorKind::ZeroDivisionError));
        assert_eq!(err.to_string(), expected.to_string());
        assert_eq!(interp.jit_stats().unwrap().traces_compiled, 1);
    }

    #[test]
    fn test_error_inside_trace_reports_faulting_instruction() {
        // `a[5 - i] = i` on a six element array, fails at i == 12
        let src = "top main locals=2
               putobject 0
               putobject 0
               putobject 0
               putobject 0
               putobject 0
               putobject 0
               newarray 6
               setlocal 1 0
               putobject 0
               setlocal 0 0
             loop:
               getlocal 1 0
               putobject 5
               getlocal 0 0
               opt_minus
               getlocal 0 0
               opt_aset
               pop
               getlocal 0 0
               opt_succ
               setlocal 0 0
               getlocal 0 0
               putobject 100
               opt_lt
               branchif loop
               putnil
               leave
             end";
        let expected = Interpreter::new().eval(src).unwrap_err();
        assert_eq!(expected.runtime_kind(), Some(RuntimeErrorKind::RangeError));

        let mut interp = Interpreter::with_jit(JitConfig::default()).unwrap();
        let err = interp.eval(src).unwrap_err();
        let stats = interp.jit_stats().unwrap();
        assert_eq!(stats.traces_compiled, 1);
        assert_eq!(stats.error_exits, 1);
        assert_eq!(err.to_string(), expected.to_string());
    }

    #[test]
    fn test_constant_redefinition_invalidates() {
        let src = "top main locals=2
               putobject 1
               setconstant K
               putobject 0
               setlocal 0 0
               putobject 0
               setlocal 1 0
             loop:
               getlocal 1 0
               getinlinecache got 0
               getconstant K
               setinlinecache 0
             got:
               opt_plus
               setlocal 1 0
               getlocal 0 0
               putobject 50
               opt_eq
               branchunless skip
               putobject 10
               setconstant K
             skip:
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
        let stats = same_result(src);
        assert_eq!(run_interpreted(src).0, Value::Fixnum(541));
        assert_eq!(stats.invalidations, 1);
        // the loop got hot again after the repository was cleared
        assert!(stats.traces_compiled >= 2);
    }
}
