//! Handlers for variables, literals, stack shuffles and control flow

use super::{operand, Flow, RecordResult, Recorder};
use crate::bytecode::{Insn, Pc};
use crate::jit::host::Host;
use crate::jit::ir::{Constant, InstKind, TypeCheck};
use crate::jit::snapshot::ExitKind;
use crate::jit::trace::TraceError;
use crate::runtime::builtins::NativeFn;
use crate::runtime::value::Value;

/// Instance variable names are stored without the leading `@`
fn ivar_name(name: &str) -> &str {
    name.strip_prefix('@').unwrap_or(name)
}

impl Recorder {
    pub(super) fn record_simple<H: Host>(
        &mut self,
        host: &mut H,
        pc: Pc,
        insn: &Insn,
    ) -> RecordResult<Flow> {
        match insn {
            Insn::Nop | Insn::Reput => {}

            // ---- Variables ----
            Insn::GetLocal { idx, level } => {
                let value = self.emit(InstKind::EnvLoad {
                    level: *level,
                    idx: *idx,
                })?;
                self.push(value);
            }
            Insn::SetLocal { idx, level } => {
                let value = self.pop()?;
                self.emit(InstKind::EnvStore {
                    level: *level,
                    idx: *idx,
                    value,
                })?;
            }
            Insn::GetInstanceVariable { name } => self.record_getivar(host, pc, name)?,
            Insn::SetInstanceVariable { name } => self.record_setivar(host, pc, name)?,
            Insn::GetGlobal { name } => {
                let sym = host.intern(name);
                let name = self.load_const(Constant::of(&Value::Symbol(sym)));
                let value = self.emit(InstKind::GetGlobal { name })?;
                self.push(value);
            }
            Insn::SetGlobal { name } => {
                let value = self.pop()?;
                let sym = host.intern(name);
                let name = self.load_const(Constant::of(&Value::Symbol(sym)));
                self.emit(InstKind::SetGlobal { name, value })?;
            }

            // ---- Literals ----
            Insn::PutNil => {
                let value = self.load_const(Constant::Nil);
                self.push(value);
            }
            Insn::PutSelf => {
                let value = self.emit(InstKind::LoadSelf)?;
                self.push(value);
            }
            Insn::PutObject { .. } => {
                let literal = host.literal(pc).ok_or(TraceError::UnsupportedOpcode)?;
                let value = self.load_const(Constant::of(&literal));
                self.push(value);
            }
            Insn::PutString { .. } => {
                let literal = host.literal(pc).ok_or(TraceError::UnsupportedOpcode)?;
                let source = self.load_const(Constant::of(&literal));
                let value = self.emit(InstKind::AllocString(source))?;
                self.push(value);
            }
            Insn::ConcatStrings { count } => {
                let parts = self.pop_regs(*count)?;
                let value = self.emit(InstKind::StringConcat(parts))?;
                self.push(value);
            }
            Insn::ToString => {
                let recv = self.pop()?;
                let value = self.emit(InstKind::InvokeNative {
                    func: NativeFn::ObjAsString,
                    recv,
                    args: Vec::new(),
                })?;
                self.push(value);
            }
            Insn::NewArray { count } => {
                let items = self.pop_regs(*count)?;
                let value = self.emit(InstKind::AllocArray(items))?;
                self.push(value);
            }
            Insn::DupArray { .. } => {
                let literal = host.literal(pc).ok_or(TraceError::UnsupportedOpcode)?;
                let recv = self.load_const(Constant::of(&literal));
                let value = self.emit(InstKind::InvokeNative {
                    func: NativeFn::AryDup,
                    recv,
                    args: Vec::new(),
                })?;
                self.push(value);
            }
            Insn::NewHash { count } => {
                let items = self.pop_regs(*count)?;
                let value = self.emit(InstKind::AllocHash(items))?;
                self.push(value);
            }
            Insn::NewRange { exclusive } => {
                let high = self.pop()?;
                let low = self.pop()?;
                let value = self.emit(InstKind::AllocRange {
                    low,
                    high,
                    exclusive: *exclusive,
                })?;
                self.push(value);
            }

            // ---- Stack ----
            Insn::Pop => {
                self.pop()?;
            }
            Insn::Dup => {
                let top = self.top(0)?;
                self.push(top);
            }
            Insn::DupN { n } => {
                for reg in self.top_regs(*n)? {
                    self.push(reg);
                }
            }
            Insn::Swap => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a);
                self.push(b);
            }
            Insn::SetN { n } => {
                let top = self.top(0)?;
                if *n > 0 {
                    self.set(*n, top)?;
                }
            }
            Insn::AdjustStack { n } => {
                for _ in 0..*n {
                    self.pop()?;
                }
            }

            // ---- Misc ----
            Insn::CheckMatch { kind, array } => {
                let pattern = self.pop()?;
                let target = self.pop()?;
                let matched = if *array {
                    InstKind::PatternMatchRange {
                        kind: *kind,
                        pattern,
                        target,
                    }
                } else {
                    InstKind::PatternMatch {
                        kind: *kind,
                        pattern,
                        target,
                    }
                };
                let value = self.emit(matched)?;
                self.push(value);
            }
            Insn::Trace { event } => {
                self.emit(InstKind::Trace { event: *event })?;
            }
            Insn::Throw => return Err(TraceError::Throw),

            // ---- Control flow ----
            Insn::Jump { offset } => return self.emit_jump(pc.branch_target(*offset)),
            Insn::BranchIf { offset } => return self.record_branch(host, pc, *offset, true),
            Insn::BranchUnless { offset } => return self.record_branch(host, pc, *offset, false),
            Insn::GetInlineCache { .. } => {
                // a valid cache jumps over the lookup; the trace just
                // continues at the jump target
                let value = host.constant_cache(pc).ok_or(TraceError::UnsupportedOpcode)?;
                let value = self.load_const(Constant::of(&value));
                self.push(value);
            }

            _ => return Err(TraceError::UnsupportedOpcode),
        }
        Ok(Flow::Continue)
    }

    /// Follow the direction the interpreter is about to take and guard the
    /// condition's truthiness; the other direction becomes a side exit
    fn record_branch<H: Host>(
        &mut self,
        host: &H,
        pc: Pc,
        offset: i32,
        jump_if_truthy: bool,
    ) -> RecordResult<Flow> {
        let truthy = operand(host, 0)?.is_truthy();
        let cond = self.pop()?;
        let next = pc.next();
        let target = pc.branch_target(offset);
        let (follow, other) = if truthy == jump_if_truthy {
            (target, next)
        } else {
            (next, target)
        };
        let check = if truthy {
            TypeCheck::NonNil
        } else {
            TypeCheck::Nil
        };
        if pc == self.start_pc && jump_if_truthy && offset < 0 && other == next {
            // falling out of the trace's own loop header ends the loop
            self.snapshot_as(other, ExitKind::Success)?;
        } else {
            self.snapshot(other)?;
        }
        self.emit_guard(InstKind::GuardType {
            check,
            value: cond,
            exit: other,
        })?;
        self.emit_jump(follow)
    }

    fn record_getivar<H: Host>(&mut self, host: &mut H, pc: Pc, name: &str) -> RecordResult<()> {
        let recv = host.self_value();
        let sym = host.intern(ivar_name(name));
        let cache = host
            .ivar_slot(pc, &recv, sym, false)
            .ok_or(TraceError::UnsupportedOpcode)?;
        let this = self.emit(InstKind::LoadSelf)?;
        self.snapshot(pc)?;
        self.emit_guard(InstKind::GuardType {
            check: TypeCheck::Object,
            value: this,
            exit: pc,
        })?;
        self.emit_guard(InstKind::GuardProperty {
            recv: this,
            cache,
            exit: pc,
        })?;
        let value = self.emit(InstKind::GetPropertyName {
            recv: this,
            index: cache.index,
        })?;
        self.push(value);
        Ok(())
    }

    fn record_setivar<H: Host>(&mut self, host: &mut H, pc: Pc, name: &str) -> RecordResult<()> {
        let recv = host.self_value();
        let sym = host.intern(ivar_name(name));
        let cache = host
            .ivar_slot(pc, &recv, sym, true)
            .ok_or(TraceError::UnsupportedOpcode)?;
        self.snapshot(pc)?;
        let value = self.pop()?;
        let this = self.emit(InstKind::LoadSelf)?;
        self.emit_guard(InstKind::GuardType {
            check: TypeCheck::Object,
            value: this,
            exit: pc,
        })?;
        self.emit_guard(InstKind::GuardProperty {
            recv: this,
            cache,
            exit: pc,
        })?;
        self.emit(InstKind::SetPropertyName {
            recv: this,
            index: cache.index,
            value,
        })?;
        Ok(())
    }
}
