//! Handlers for method calls, blocks and returns
//!
//! A call is traceable only when it resolves to an iseq method (inlined
//! behind a `FramePush`), an attribute accessor, or one of the natives with
//! dedicated IR (`Math` functions, `Class#new`, `block_given?`). Every
//! other native aborts with [`TraceError::NativeMethod`].

use super::{operand, Flow, RecordResult, Recorder};
use crate::bytecode::{CallFlags, CallInfo, Pc};
use crate::jit::host::Host;
use crate::jit::ir::{Constant, InlineFrame, InstId, InstKind, MathFn, TypeCheck};
use crate::jit::trace::TraceError;
use crate::runtime::builtins::NativeFn;
use crate::runtime::class::{BasicOp, ClassId, IseqId, MethodKind};
use crate::runtime::intern::Sym;
use crate::runtime::value::Value;
use crate::runtime::vm::CallCache;
use tracing::debug;

/// Block literal passed to a recorded call: its register and sequence
#[derive(Debug, Clone, Copy)]
pub(super) struct BlockArg {
    pub reg: InstId,
    pub iseq: IseqId,
}

impl Recorder {
    pub(super) fn record_send<H: Host>(&mut self, host: &mut H, pc: Pc, ci: &CallInfo) -> RecordResult<Flow> {
        if ci.flags.intersects(CallFlags::ARGS_BLOCKARG | CallFlags::ARGS_SPLAT) {
            return Err(TraceError::UnsupportedOpcode);
        }
        let recv = operand(host, ci.argc as usize)?;
        self.snapshot(pc)?;
        let block = match &ci.block {
            Some(name) => {
                let iseq = host.iseq_by_name(name).ok_or(TraceError::UnsupportedOpcode)?;
                let reg = self.emit(InstKind::LoadSelfAsBlock { iseq })?;
                Some(BlockArg { reg, iseq })
            }
            None => None,
        };
        self.emit_method_call(host, pc, &ci.mid, ci.argc, &recv, block)
    }

    pub(super) fn record_send_simple<H: Host>(
        &mut self,
        host: &mut H,
        pc: Pc,
        ci: &CallInfo,
    ) -> RecordResult<Flow> {
        if ci.flags.intersects(CallFlags::ARGS_BLOCKARG | CallFlags::ARGS_SPLAT) {
            return Err(TraceError::UnsupportedOpcode);
        }
        let recv = operand(host, ci.argc as usize)?;
        self.snapshot(pc)?;
        self.emit_method_call(host, pc, &ci.mid, ci.argc, &recv, None)
    }

    /// Emit a call of `mid` whose receiver and `argc` arguments are the top
    /// registers. A snapshot at `pc` must already exist.
    pub(super) fn emit_method_call<H: Host>(
        &mut self,
        host: &mut H,
        pc: Pc,
        mid: &str,
        argc: u32,
        recv: &Value,
        block: Option<BlockArg>,
    ) -> RecordResult<Flow> {
        let cache = host
            .search_method(pc, mid, argc, recv)
            .ok_or(TraceError::Throw)?;
        match cache.method.kind.clone() {
            MethodKind::Iseq(iseq) => self.inline_method(host, pc, &cache, iseq, argc, block),
            MethodKind::AttrReader(name) if argc == 0 && block.is_none() => {
                self.attr_reader(host, pc, &cache, recv, name)
            }
            MethodKind::AttrWriter(name) if argc == 1 && block.is_none() => {
                self.attr_writer(host, pc, &cache, recv, name)
            }
            MethodKind::Native(func) => self.native_call(host, pc, &cache, func, argc, block),
            _ => Err(TraceError::NativeMethod),
        }
    }

    /// Enter an iseq method in the trace
    pub(super) fn inline_method<H: Host>(
        &mut self,
        host: &H,
        pc: Pc,
        cache: &CallCache,
        iseq: IseqId,
        argc: u32,
        block: Option<BlockArg>,
    ) -> RecordResult<Flow> {
        if host.iseq_params(iseq) != argc {
            // the interpreter raises ArgumentError here
            return Err(TraceError::UnsupportedOpcode);
        }
        let argv = self.top_regs(argc + 1)?;
        let cache = self.caches.clone_cache(cache);
        self.emit_guard(InstKind::GuardMethodCache {
            recv: argv[0],
            cache,
            exit: pc,
        })?;
        if let Some(block) = block {
            self.emit_guard(InstKind::GuardBlockEqual {
                block: block.reg,
                iseq: block.iseq,
                exit: pc,
            })?;
        }
        self.push_call(argc + 1);
        let frame = self.emit(InstKind::FramePush {
            iseq,
            frame: InlineFrame::Method,
            return_pc: pc.next(),
            block: block.map(|b| b.reg),
            argv,
        })?;
        self.push(frame);
        debug!("inline call at {} (depth {})", host.location(pc), self.call_depth());
        Ok(Flow::Continue)
    }

    fn guard_object_slot<H: Host>(
        &mut self,
        host: &mut H,
        pc: Pc,
        cache: &CallCache,
        recv_reg: InstId,
        recv: &Value,
        name: Sym,
        define: bool,
    ) -> RecordResult<usize> {
        let slot = host
            .ivar_slot(pc, recv, name, define)
            .ok_or(TraceError::UnsupportedOpcode)?;
        let cache = self.caches.clone_cache(cache);
        self.emit_guard(InstKind::GuardMethodCache {
            recv: recv_reg,
            cache,
            exit: pc,
        })?;
        self.emit_guard(InstKind::GuardType {
            check: TypeCheck::Object,
            value: recv_reg,
            exit: pc,
        })?;
        self.emit_guard(InstKind::GuardProperty {
            recv: recv_reg,
            cache: slot,
            exit: pc,
        })?;
        Ok(slot.index)
    }

    fn attr_reader<H: Host>(
        &mut self,
        host: &mut H,
        pc: Pc,
        cache: &CallCache,
        recv: &Value,
        name: Sym,
    ) -> RecordResult<Flow> {
        let recv_reg = self.pop()?;
        let index = self.guard_object_slot(host, pc, cache, recv_reg, recv, name, false)?;
        let value = self.emit(InstKind::GetPropertyName {
            recv: recv_reg,
            index,
        })?;
        self.push(value);
        Ok(Flow::Continue)
    }

    fn attr_writer<H: Host>(
        &mut self,
        host: &mut H,
        pc: Pc,
        cache: &CallCache,
        recv: &Value,
        name: Sym,
    ) -> RecordResult<Flow> {
        let value = self.pop()?;
        let recv_reg = self.pop()?;
        let index = self.guard_object_slot(host, pc, cache, recv_reg, recv, name, true)?;
        self.emit(InstKind::SetPropertyName {
            recv: recv_reg,
            index,
            value,
        })?;
        self.push(value);
        Ok(Flow::Continue)
    }

    fn native_call<H: Host>(
        &mut self,
        host: &mut H,
        pc: Pc,
        cache: &CallCache,
        func: NativeFn,
        argc: u32,
        block: Option<BlockArg>,
    ) -> RecordResult<Flow> {
        let math_owner = host.class_of(&Value::Class(ClassId::MATH));
        if let Some(math) = MathFn::from_native(func).filter(|_| cache.method.owner == math_owner) {
            if argc != 1 || block.is_some() {
                return Err(TraceError::NativeMethod);
            }
            return self.math_call(host, pc, cache, math);
        }
        match func {
            NativeFn::ClassNew => {
                if block.is_some() {
                    return Err(TraceError::UnsupportedOpcode);
                }
                let args = self.pop_regs(argc)?;
                let klass = self.pop()?;
                let cache = self.caches.clone_cache(cache);
                self.emit_guard(InstKind::GuardMethodCache {
                    recv: klass,
                    cache,
                    exit: pc,
                })?;
                let object = self.emit(InstKind::AllocObject { klass, args })?;
                self.push(object);
                Ok(Flow::Continue)
            }
            NativeFn::BlockGiven if argc == 0 && block.is_none() => {
                let recv = self.pop()?;
                let cache = self.caches.clone_cache(cache);
                self.emit_guard(InstKind::GuardMethodCache {
                    recv,
                    cache,
                    exit: pc,
                })?;
                let value = self.emit(InstKind::InvokeNative {
                    func,
                    recv,
                    args: Vec::new(),
                })?;
                self.push(value);
                Ok(Flow::Continue)
            }
            _ => Err(TraceError::NativeMethod),
        }
    }

    /// `Math.f(x)`: convert the argument to a float, then apply `f`
    fn math_call<H: Host>(&mut self, host: &H, pc: Pc, cache: &CallCache, math: MathFn) -> RecordResult<Flow> {
        let arg_value = operand(host, 0)?;
        let arg = self.pop()?;
        let recv = self.pop()?;
        let cache = self.caches.clone_cache(cache);
        self.emit_guard(InstKind::GuardMethodCache {
            recv,
            cache,
            exit: pc,
        })?;
        let arg = match arg_value {
            Value::Fixnum(_) => {
                self.emit_guard(InstKind::GuardType {
                    check: TypeCheck::Fixnum,
                    value: arg,
                    exit: pc,
                })?;
                self.emit(InstKind::FixnumToFloat(arg))?
            }
            Value::Float(_) => {
                self.emit_guard(InstKind::GuardType {
                    check: TypeCheck::Float,
                    value: arg,
                    exit: pc,
                })?;
                arg
            }
            _ => return Err(TraceError::NativeMethod),
        };
        let value = self.emit(InstKind::Math { func: math, arg })?;
        self.push(value);
        Ok(Flow::Continue)
    }

    pub(super) fn record_invokeblock<H: Host>(
        &mut self,
        host: &mut H,
        pc: Pc,
        ci: &CallInfo,
    ) -> RecordResult<Flow> {
        let block = host.current_block().ok_or(TraceError::Throw)?;
        if ci.flags.intersects(CallFlags::ARGS_BLOCKARG | CallFlags::ARGS_SPLAT) {
            return Err(TraceError::UnsupportedOpcode);
        }
        self.snapshot(pc)?;
        let reg = self.emit(InstKind::LoadBlock)?;
        self.emit_guard(InstKind::GuardBlockEqual {
            block: reg,
            iseq: block.iseq,
            exit: pc,
        })?;
        let argv = self.top_regs(ci.argc)?;
        self.push_call(ci.argc);
        let frame = self.emit(InstKind::FramePush {
            iseq: block.iseq,
            frame: InlineFrame::Block,
            return_pc: pc.next(),
            block: Some(reg),
            argv,
        })?;
        self.push(frame);
        debug!("inline yield at {} (depth {})", host.location(pc), self.call_depth());
        Ok(Flow::Continue)
    }

    pub(super) fn record_leave<H: Host>(&mut self, host: &H) -> RecordResult<Flow> {
        if host.returns_to_native() || self.call_depth() == 0 {
            return Err(TraceError::Leave);
        }
        let value = self.pop()?;
        self.pop_call()?;
        self.emit(InstKind::FramePop)?;
        self.push(value);
        Ok(Flow::Continue)
    }

    pub(super) fn record_str_freeze<H: Host>(&mut self, host: &mut H, pc: Pc) -> RecordResult<Flow> {
        if !host.basic_op_unredefined(BasicOp::Freeze, ClassId::STRING) {
            return Err(TraceError::UnsupportedOpcode);
        }
        let literal = host.literal(pc).ok_or(TraceError::UnsupportedOpcode)?;
        self.snapshot(pc)?;
        self.emit_guard(InstKind::GuardMethodRedefine {
            class: ClassId::STRING,
            op: BasicOp::Freeze,
            exit: pc,
        })?;
        let value = self.load_const(Constant::of(&literal));
        self.push(value);
        Ok(Flow::Continue)
    }
}
