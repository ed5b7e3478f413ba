//! Properties of recorded and optimized traces

mod common;
use common::{counter_loop, record_first_loop, Recording};
use quicktrace::bytecode::Pc;
use quicktrace::jit::ir::{Constant, InstKind, TypeCheck};
use quicktrace::jit::recorder::Flow;
use quicktrace::jit::snapshot::ExitKind;
use quicktrace::runtime::numeric::ArithOp;
use quicktrace::runtime::{BasicOp, ClassId};
use quicktrace::{demos, JitConfig};

const INLINED_CALL: &str = "def inc params=1 locals=1
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
     entry main";

fn unoptimized() -> JitConfig {
    JitConfig::default().with_optimize(false)
}

/// Value registers of a stack map, leaving out inlined-frame markers
fn value_regs(rec: &Recording, regs: &[quicktrace::jit::ir::InstId]) -> usize {
    regs.iter()
        .filter(|id| !matches!(rec.func().kind(**id), InstKind::FramePush { .. }))
        .count()
}

mod stack_balance {
    use super::*;
    use pretty_assertions::assert_eq;

    fn check(src: &str) {
        let rec = record_first_loop(src, &unoptimized());
        assert_eq!(rec.flow, Flow::Closed);

        // a closed loop body leaves the stack as it found it
        let (start, start_height) = rec.heights[0];
        assert_eq!(rec.machine.pc(), start);
        assert_eq!(rec.machine.stack_len(), start_height);

        let mut checked = 0;
        for map in rec.recorder.exits().iter() {
            if map.call_depth != 0 {
                continue;
            }
            let Some(height) = rec.height_at(map.pc) else {
                continue;
            };
            let rebuilt = rec.entry_len as i64 + map.bottom as i64 + value_regs(&rec, &map.regs) as i64;
            assert_eq!(rebuilt, height as i64, "stack map at {}", map.pc);
            checked += 1;
        }
        assert!(checked > 0);
    }

    #[test]
    fn test_counter_loop() {
        check(&counter_loop(100));
    }

    #[test]
    fn test_string_append_loop() {
        check(demos::find("strings").unwrap().source);
    }

    #[test]
    fn test_hash_update_loop() {
        check(demos::find("hash").unwrap().source);
    }

    #[test]
    fn test_inlined_call_loop() {
        check(INLINED_CALL);
    }
}

mod guards {
    use super::*;
    use quicktrace::jit::function::Function;
    use quicktrace::jit::peephole::guard_is_redundant;
    use quicktrace::Value;

    #[test]
    fn test_guards_on_constants_are_dropped() {
        let rec = record_first_loop(&counter_loop(100), &unoptimized());
        for kind in rec.kinds() {
            if let InstKind::GuardType { check, value, .. } = kind {
                let producer = rec.func().kind(value);
                assert!(
                    !matches!(producer, InstKind::LoadConst(_)),
                    "{:?} guard kept on a constant",
                    check
                );
            }
        }
        // the local is still checked
        assert!(rec.count(|k| matches!(
            k,
            InstKind::GuardType {
                check: TypeCheck::Fixnum,
                ..
            }
        )) >= 1);
    }

    #[test]
    fn test_redundancy_implies_predicate() {
        let constants = [
            Value::Nil,
            Value::True,
            Value::False,
            Value::Fixnum(3),
            Value::Float(1.5),
            Value::Float(1e-320),
        ];
        let checks = [
            TypeCheck::Fixnum,
            TypeCheck::Float,
            TypeCheck::Flonum,
            TypeCheck::String,
            TypeCheck::Array,
            TypeCheck::Hash,
            TypeCheck::Nil,
            TypeCheck::NonNil,
            TypeCheck::SpecialConst,
        ];
        let mut func = Function::new(64);
        for value in &constants {
            let id = func.alloc(InstKind::LoadConst(Constant::of(value)));
            for check in checks {
                if guard_is_redundant(&func, check, id) {
                    assert!(check.test(value), "{:?} dropped for {:?}", check, value);
                }
            }
        }
    }

    #[test]
    fn test_guards_on_locals_survive_optimization() {
        // locals may change type between iterations
        let rec = record_first_loop(
            "top main locals=2
               putobject 0
               setlocal 0 0
               putobject 0
               setlocal 1 0
             loop:
               getlocal 1 0
               putobject 1
               opt_plus
               setlocal 1 0
               getlocal 0 0
               opt_succ
               setlocal 0 0
               getlocal 0 0
               putobject 10
               opt_lt
               branchif loop
               getlocal 1 0
               leave
             end",
            &JitConfig::default(),
        );
        assert_eq!(rec.flow, Flow::Closed);
        let guarded_loads = rec
            .kinds()
            .iter()
            .filter_map(|k| match k {
                InstKind::GuardType {
                    check: TypeCheck::Fixnum,
                    value,
                    ..
                } => Some(*value),
                _ => None,
            })
            .filter(|v| matches!(rec.func().kind(*v), InstKind::EnvLoad { .. }))
            .count();
        assert!(guarded_loads >= 2);
    }
}

mod constants {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_same_constant_shares_a_register() {
        let rec = record_first_loop(
            "top main locals=1
               putobject 0
               setlocal 0 0
             loop:
               getlocal 0 0
               putobject 7
               opt_plus
               putobject 7
               opt_minus
               putobject 1
               opt_plus
               setlocal 0 0
               getlocal 0 0
               putobject 100
               opt_lt
               branchif loop
               getlocal 0 0
               leave
             end",
            &unoptimized(),
        );
        assert_eq!(rec.flow, Flow::Closed);
        let sevens = rec.count(|k| matches!(k, InstKind::LoadConst(Constant::Fixnum(7))));
        assert_eq!(sevens, 1);

        let rhs: Vec<_> = rec
            .kinds()
            .iter()
            .filter_map(|k| match k {
                InstKind::FixnumArith {
                    op: ArithOp::Add | ArithOp::Sub,
                    rhs,
                    ..
                } => Some(*rhs),
                _ => None,
            })
            .filter(|r| matches!(rec.func().kind(*r), InstKind::LoadConst(Constant::Fixnum(7))))
            .collect();
        assert_eq!(rhs.len(), 2);
        assert_eq!(rhs[0], rhs[1]);
    }

    #[test]
    fn test_constant_arithmetic_folds() {
        let rec = record_first_loop(
            "top main locals=1
               putobject 0
               setlocal 0 0
             loop:
               getlocal 0 0
               putobject 2
               putobject 3
               opt_mult
               opt_plus
               setlocal 0 0
               getlocal 0 0
               putobject 100
               opt_lt
               branchif loop
               getlocal 0 0
               leave
             end",
            &JitConfig::default(),
        );
        assert_eq!(rec.count(|k| matches!(k, InstKind::LoadConst(Constant::Fixnum(6)))), 1);
        assert_eq!(
            rec.count(|k| matches!(
                k,
                InstKind::FixnumArith {
                    op: ArithOp::Mul,
                    ..
                }
            )),
            0
        );
    }
}

mod dead_code {
    use super::*;

    fn check(src: &str) {
        let rec = record_first_loop(src, &JitConfig::default());
        let func = rec.func();
        for inst in func.live_insts() {
            for operand in inst.kind.operands() {
                assert!(func.is_live(operand), "{} uses removed {}", inst.id, operand);
            }
        }
        for map in rec.recorder.exits().iter() {
            for reg in map.uses() {
                assert!(func.is_live(reg), "stack map at {} uses removed {}", map.pc, reg);
            }
        }
    }

    #[test]
    fn test_every_demo_keeps_its_operands() {
        for demo in demos::DEMOS {
            check(demo.source);
        }
    }

    #[test]
    fn test_inlined_call_keeps_its_operands() {
        check(INLINED_CALL);
    }
}

mod scenarios {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fixnum_increment() {
        let rec = record_first_loop(&counter_loop(100), &unoptimized());
        assert_eq!(rec.flow, Flow::Closed);

        let kinds = rec.kinds();
        let (guard, local) = rec
            .func()
            .live_insts()
            .find_map(|inst| match &inst.kind {
                InstKind::GuardType {
                    check: TypeCheck::Fixnum,
                    value,
                    ..
                } => Some((inst.id, *value)),
                _ => None,
            })
            .unwrap();
        assert!(matches!(
            rec.func().kind(local),
            InstKind::EnvLoad { level: 0, idx: 0 }
        ));
        assert!(kinds.iter().any(|k| matches!(
            k,
            InstKind::GuardMethodRedefine {
                class: ClassId::INTEGER,
                op: BasicOp::Plus,
                ..
            }
        )));
        assert!(kinds.iter().any(|k| matches!(
            k,
            InstKind::FixnumArith {
                op: ArithOp::Add,
                ..
            }
        )));

        // the guard leaves to `opt_plus` with `i` and the constant on the
        // stack, below them the header's condition has been consumed
        let map = rec.recorder.exits().map_of(guard).unwrap();
        assert_eq!(map.kind, ExitKind::SideExit);
        assert_eq!(rec.machine.fetch(map.pc).unwrap().name(), "opt_plus");
        assert_eq!(map.bottom, -1);
        assert_eq!(map.regs.len(), 2);
        assert_eq!(map.regs[0], local);
        let non_constant: Vec<_> = map
            .regs
            .iter()
            .filter(|r| !matches!(rec.func().kind(**r), InstKind::LoadConst(_)))
            .collect();
        assert_eq!(non_constant, vec![&local]);
    }

    #[test]
    fn test_loop_exit_is_a_success() {
        let rec = record_first_loop(&counter_loop(100), &unoptimized());
        let start = rec.heights[0].0;
        let fallthrough = Pc(start.0 + 1);
        let exits: Vec<_> = rec
            .recorder
            .exits()
            .iter()
            .filter(|m| m.pc == fallthrough)
            .map(|m| m.kind)
            .collect();
        assert!(exits.contains(&ExitKind::Success));
    }

    #[test]
    fn test_untraceable_native_aborts() {
        let rec = record_first_loop(demos::find("rand").unwrap().source, &unoptimized());
        assert_eq!(
            rec.flow,
            Flow::Aborted(quicktrace::jit::trace::TraceError::NativeMethod)
        );
        // the abort leaves through an exit at the call
        let last = rec.recorder.exits().iter().last().unwrap();
        assert_eq!(rec.machine.pc(), last.pc);
        assert!(rec.func().is_terminated());
    }
}
