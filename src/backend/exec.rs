//! Execution of lowered traces on the reference machine

use super::lower::{ExitPlan, Lowered, Op, Slot};
use crate::error::{Error, Result};
use crate::jit::codegen::{NativeCode, TraceExit};
use crate::jit::ir::{BitOp, Container, InlineFrame, InstId, InstKind};
use crate::jit::snapshot::ExitKind;
use crate::bytecode::Pc;
use crate::runtime::builtins::{self, NativeFn};
use crate::runtime::numeric;
use crate::runtime::value::Value;
use crate::runtime::vm::{Block, Machine};
use std::rc::Rc;
use tracing::trace;

/// A compiled trace
#[derive(Debug)]
pub struct CompiledTrace {
    code: Lowered,
}

/// Result of evaluating one operation
enum Outcome {
    Value(Value),
    /// A check failed; leave through the operation's exit
    Exit,
}

/// Per-invocation state
struct Activation {
    regs: Vec<Value>,
    /// Operand-stack height at trace entry
    entry_len: usize,
}

impl Activation {
    #[inline]
    fn get(&self, reg: InstId) -> Value {
        self.regs[reg.index()].clone()
    }

    fn all(&self, regs: &[InstId]) -> Vec<Value> {
        regs.iter().map(|&r| self.get(r)).collect()
    }

    fn fixnum(&self, reg: InstId) -> Result<i64> {
        self.get(reg)
            .as_fixnum()
            .ok_or_else(|| Error::internal(format!("{} is not a fixnum", reg)))
    }

    fn float(&self, reg: InstId) -> Result<f64> {
        numeric::to_f64(&self.get(reg)).ok_or_else(|| Error::internal(format!("{} is not numeric", reg)))
    }
}

fn proc_of(value: &Value) -> Option<Rc<Block>> {
    match value {
        Value::Proc(block) => Some(Rc::clone(block)),
        _ => None,
    }
}

impl CompiledTrace {
    pub fn new(code: Lowered) -> Self {
        Self { code }
    }

    fn run(&self, m: &mut Machine, act: &mut Activation) -> TraceExit {
        let mut at = 0;
        loop {
            let Some(op) = self.code.ops.get(at) else {
                m.set_pending_error(Error::internal("compiled trace fell off its end"));
                return TraceExit::error(m.pc());
            };
            match op {
                Op::Jump { to } => at = *to,
                Op::Exit { plan } => return self.leave(m, act, *plan),
                Op::Eval { dst, kind, exit, pc } => match eval(m, act, kind) {
                    Ok(Outcome::Value(value)) => {
                        act.regs[dst.index()] = value;
                        at += 1;
                    }
                    Ok(Outcome::Exit) => match exit {
                        Some(plan) => return self.leave(m, act, *plan),
                        None => {
                            m.set_pending_error(Error::internal(format!("{} failed without an exit", dst)));
                            return TraceExit::error(m.pc());
                        }
                    },
                    Err(err) => {
                        let err = err.with_location(m.location(*pc));
                        m.set_pending_error(err);
                        return TraceExit::error(*pc);
                    }
                },
            }
        }
    }

    /// Write the exit's registers back to the operand stack and resume the
    /// interpreter at the exit pc
    fn leave(&self, m: &mut Machine, act: &Activation, plan: usize) -> TraceExit {
        let Some(plan) = self.code.plans.get(plan) else {
            m.set_pending_error(Error::internal("exit plan out of range"));
            return TraceExit::error(m.pc());
        };
        match restore(m, act, plan) {
            Ok(()) => {
                trace!("leaving trace at {} ({:?})", plan.pc, plan.kind);
                match plan.kind {
                    ExitKind::Success => TraceExit::success(plan.pc),
                    ExitKind::SideExit => TraceExit::side_exit(plan.pc),
                }
            }
            Err(err) => {
                m.set_pending_error(err);
                TraceExit::error(plan.pc)
            }
        }
    }
}

fn restore(m: &mut Machine, act: &Activation, plan: &ExitPlan) -> Result<()> {
    let base = act.entry_len as i64 + plan.bottom as i64;
    if base < 0 {
        return Err(Error::internal(format!("exit at {} restores below the stack", plan.pc)));
    }
    m.truncate_stack(base as usize);

    let depth = plan.call_depth as usize;
    let first_inlined = m
        .frames()
        .len()
        .checked_sub(depth)
        .ok_or_else(|| Error::internal(format!("exit at {} expects {} inlined frames", plan.pc, depth)))?;
    let mut next_frame = first_inlined;
    for slot in &plan.slots {
        match slot {
            Slot::Value(reg) => m.push(act.get(*reg)),
            Slot::Frame => {
                let sp = m.stack_len();
                let frame = m
                    .frames_mut()
                    .get_mut(next_frame)
                    .ok_or_else(|| Error::internal("more frame markers than inlined frames"))?;
                frame.sp_base = sp;
                next_frame += 1;
            }
        }
    }
    m.set_pc(plan.pc);
    Ok(())
}

fn eval(m: &mut Machine, act: &Activation, kind: &InstKind) -> Result<Outcome> {
    use InstKind::*;
    let pass = |ok: bool| if ok { Outcome::Value(Value::Nil) } else { Outcome::Exit };
    let value = match kind {
        // ---- Entry and stack ----
        StackAdjust => Value::Nil,
        StackPop { depth } => {
            let at = act
                .entry_len
                .checked_sub(*depth as usize)
                .ok_or_else(|| Error::internal(format!("no value {} below trace entry", depth)))?;
            m.stack()
                .get(at)
                .cloned()
                .ok_or_else(|| Error::internal("operand stack shrank under a trace"))?
        }

        // ---- Loads ----
        LoadSelf => m.self_value(),
        LoadBlock => m.current_block().map_or(Value::Nil, Value::Proc),
        LoadSelfAsBlock { iseq } => Value::Proc(m.block_for(*iseq)?),
        LoadConst(c) => c.to_value(),
        EnvLoad { level, idx } => m.local(*level, *idx)?,
        EnvStore { level, idx, value } => {
            m.set_local(*level, *idx, act.get(*value))?;
            Value::Nil
        }
        GetPropertyName { recv, index } => match act.get(*recv) {
            Value::Object(obj) => obj.borrow().get(*index),
            other => return Err(Error::type_error(format!("{} has no instance variables", other.type_name()))),
        },
        SetPropertyName { recv, index, value } => {
            let value = act.get(*value);
            match act.get(*recv) {
                Value::Object(obj) => obj.borrow_mut().set(*index, value.clone()),
                other => {
                    return Err(Error::type_error(format!("can't modify {}", other.type_name())));
                }
            }
            value
        }
        GetGlobal { name } => match act.get(*name) {
            Value::Symbol(sym) => m.global(sym),
            _ => return Err(Error::internal("global name is not a symbol")),
        },
        SetGlobal { name, value } => {
            let value = act.get(*value);
            match act.get(*name) {
                Value::Symbol(sym) => m.set_global(sym, value.clone()),
                _ => return Err(Error::internal("global name is not a symbol")),
            }
            value
        }

        // ---- Allocation ----
        AllocArray(items) => Value::array(act.all(items)),
        AllocHash(items) => builtins::hash_from_pairs(act.all(items)),
        AllocRange { low, high, exclusive } => Value::range(act.get(*low), act.get(*high), *exclusive),
        AllocString(source) => match act.get(*source) {
            Value::String(s) => Value::string(&s.borrow()),
            other => other,
        },
        AllocObject { klass, args } => m.call_native(NativeFn::ClassNew, act.get(*klass), act.all(args))?,
        StringConcat(parts) => {
            let mut out = String::new();
            for part in act.all(parts) {
                match part {
                    Value::String(s) => out.push_str(&s.borrow()),
                    other => {
                        return Err(Error::type_error(format!(
                            "no implicit conversion of {} into String",
                            other.type_name()
                        )))
                    }
                }
            }
            Value::string(&out)
        }

        // ---- Guards ----
        GuardType { check, value, .. } => return Ok(pass(check.test(&act.get(*value)))),
        GuardProperty { recv, cache, .. } => {
            let value = act.get(*recv);
            let klass = m.class_of(&value);
            let ok = matches!(value, Value::Object(_))
                && klass == cache.klass
                && m.classes().serial(klass) == cache.class_serial;
            return Ok(pass(ok));
        }
        GuardMethodCache { recv, cache, .. } => {
            let klass = m.class_of(&act.get(*recv));
            let classes = m.classes();
            return Ok(pass(cache.is_valid(klass, classes.serial(klass), classes.method_state())));
        }
        GuardMethodRedefine { class, op, .. } => return Ok(pass(m.basic_op_unredefined(*op, *class))),
        GuardBlockEqual { block, iseq, .. } => {
            let ok = proc_of(&act.get(*block)).map_or(false, |b| b.iseq == *iseq);
            return Ok(pass(ok));
        }

        // ---- Fixnum ----
        FixnumArith { op, lhs, rhs, .. } => match numeric::fixnum_arith(*op, act.fixnum(*lhs)?, act.fixnum(*rhs)?) {
            Some(value) => value,
            // division by zero raises in the interpreter
            None => return Ok(Outcome::Exit),
        },
        FixnumCmp { op, lhs, rhs } => Value::bool(op.eval(act.fixnum(*lhs)?, act.fixnum(*rhs)?)),
        FixnumBit { op, lhs, rhs } => {
            let (a, b) = (act.fixnum(*lhs)?, act.fixnum(*rhs)?);
            match op {
                BitOp::And => Value::Fixnum(a & b),
                BitOp::Or => Value::Fixnum(a | b),
                BitOp::Xor => Value::Fixnum(a ^ b),
                BitOp::Lshift => numeric::fixnum_lshift(a, b),
                BitOp::Rshift => numeric::fixnum_rshift(a, b),
            }
        }
        FixnumComplement(v) => Value::Fixnum(!act.fixnum(*v)?),
        FixnumToFloat(v) => Value::Float(act.fixnum(*v)? as f64),

        // ---- Float ----
        FloatArith { op, lhs, rhs } => Value::Float(numeric::float_arith(*op, act.float(*lhs)?, act.float(*rhs)?)),
        FloatCmp { op, lhs, rhs } => Value::bool(op.eval(act.float(*lhs)?, act.float(*rhs)?)),
        FloatToFixnum(v) => numeric::float_to_int(act.float(*v)?)?,
        StringToFloat(v) => match act.get(*v) {
            Value::String(s) => Value::Float(numeric::str_to_f(&s.borrow())),
            other => return Err(Error::type_error(format!("can't convert {} into Float", other.type_name()))),
        },
        Math { func, arg } => Value::Float(func.apply(act.float(*arg)?)),

        // ---- Containers ----
        Length { of, value } => {
            let func = match of {
                Container::String => NativeFn::StrLength,
                Container::Array => NativeFn::AryLength,
                Container::Hash => NativeFn::HashLength,
            };
            m.call_native(func, act.get(*value), Vec::new())?
        }
        EmptyP { of, value } => {
            let func = match of {
                Container::String => NativeFn::StrEmptyP,
                Container::Array => NativeFn::AryEmptyP,
                Container::Hash => NativeFn::HashEmptyP,
            };
            m.call_native(func, act.get(*value), Vec::new())?
        }
        ArrayGet { recv, index } => m.call_native(NativeFn::AryAref, act.get(*recv), vec![act.get(*index)])?,
        ArraySet { recv, index, value } => m.call_native(
            NativeFn::AryAset,
            act.get(*recv),
            vec![act.get(*index), act.get(*value)],
        )?,
        HashGet { recv, key } => m.call_native(NativeFn::HashAref, act.get(*recv), vec![act.get(*key)])?,
        HashSet { recv, key, value } => m.call_native(
            NativeFn::HashAset,
            act.get(*recv),
            vec![act.get(*key), act.get(*value)],
        )?,
        RegExpMatch { regexp, target } => m.call_native(NativeFn::ReMatch, act.get(*regexp), vec![act.get(*target)])?,

        // ---- Calls ----
        InvokeMethod {
            cache,
            recv,
            args,
            block,
        } => {
            let block = block.and_then(|b| proc_of(&act.get(b)));
            m.invoke_method(&cache.method, act.get(*recv), act.all(args), block)?
        }
        InvokeNative { func, recv, args } => m.call_native(*func, act.get(*recv), act.all(args))?,
        FramePush {
            iseq,
            frame,
            return_pc,
            block,
            argv,
        } => {
            let block = block.and_then(|b| proc_of(&act.get(b)));
            let argv = act.all(argv);
            match frame {
                InlineFrame::Method => {
                    let (recv, args) = argv
                        .split_first()
                        .ok_or_else(|| Error::internal("inlined method call without a receiver"))?;
                    m.enter_inlined_method(*iseq, recv.clone(), args, block, *return_pc)?;
                }
                InlineFrame::Block => {
                    let block = block.ok_or_else(|| Error::internal("inlined yield without a block"))?;
                    m.enter_inlined_block(&block, &argv, *return_pc)?;
                }
            }
            Value::Nil
        }
        FramePop => {
            m.leave_inlined_frame()?;
            Value::Nil
        }
        PatternMatch { kind, pattern, target } => {
            Value::bool(m.check_match(*kind, &act.get(*pattern), &act.get(*target))?)
        }
        PatternMatchRange { kind, pattern, target } => {
            let target = act.get(*target);
            let patterns = match act.get(*pattern) {
                Value::Array(items) => items.borrow().clone(),
                single => vec![single],
            };
            let mut any = false;
            for p in &patterns {
                if m.check_match(*kind, p, &target)? {
                    any = true;
                    break;
                }
            }
            Value::bool(any)
        }
        Trace { .. } => {
            m.record_trace_event();
            Value::Nil
        }

        // ---- Control ----
        Jump { .. } | Exit { .. } => return Err(Error::internal("control flow evaluated as a value")),
    };
    Ok(Outcome::Value(value))
}

impl NativeCode<Machine> for CompiledTrace {
    fn invoke(&self, m: &mut Machine, pc: Pc) -> TraceExit {
        if pc != self.code.start_pc {
            return TraceExit::side_exit(pc);
        }
        let mut act = Activation {
            regs: vec![Value::Nil; self.code.registers],
            entry_len: m.stack_len(),
        };
        self.run(m, &mut act)
    }

    fn size(&self) -> usize {
        self.code.ops.len()
    }
}
