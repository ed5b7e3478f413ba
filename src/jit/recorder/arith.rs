//! Handlers for the specialized `opt_*` operators
//!
//! Each handler looks at the operand values the interpreter is about to
//! consume. When they have the builtin types the interpreter's fast path
//! expects and the operator is not redefined, the trace gets type guards, a
//! redefinition guard and the typed operation. Otherwise the operator is
//! recorded as the regular method call the interpreter falls back to.

use super::{operand, Flow, RecordResult, Recorder};
use crate::bytecode::{Insn, Pc};
use crate::jit::host::Host;
use crate::jit::ir::{Constant, Container, InstId, InstKind, TypeCheck};
use crate::jit::trace::TraceError;
use crate::runtime::builtins::NativeFn;
use crate::runtime::class::{BasicOp, ClassId, MethodKind};
use crate::runtime::numeric::{ArithOp, CmpOp};
use crate::runtime::value::Value;

#[derive(Debug, Clone, Copy)]
enum Binary {
    Arith(ArithOp),
    Cmp(CmpOp),
}

fn binary_op(insn: &Insn) -> Option<(BasicOp, Binary)> {
    Some(match insn {
        Insn::OptPlus => (BasicOp::Plus, Binary::Arith(ArithOp::Add)),
        Insn::OptMinus => (BasicOp::Minus, Binary::Arith(ArithOp::Sub)),
        Insn::OptMult => (BasicOp::Mult, Binary::Arith(ArithOp::Mul)),
        Insn::OptDiv => (BasicOp::Div, Binary::Arith(ArithOp::Div)),
        Insn::OptMod => (BasicOp::Mod, Binary::Arith(ArithOp::Mod)),
        Insn::OptEq => (BasicOp::Eq, Binary::Cmp(CmpOp::Eq)),
        Insn::OptNeq => (BasicOp::Neq, Binary::Cmp(CmpOp::Ne)),
        Insn::OptLt => (BasicOp::Lt, Binary::Cmp(CmpOp::Lt)),
        Insn::OptLe => (BasicOp::Le, Binary::Cmp(CmpOp::Le)),
        Insn::OptGt => (BasicOp::Gt, Binary::Cmp(CmpOp::Gt)),
        Insn::OptGe => (BasicOp::Ge, Binary::Cmp(CmpOp::Ge)),
        _ => return None,
    })
}

fn float_check(value: &Value) -> TypeCheck {
    if value.is_flonum() {
        TypeCheck::Flonum
    } else {
        TypeCheck::Float
    }
}

impl Recorder {
    fn guard_type(&mut self, check: TypeCheck, value: InstId, pc: Pc) -> RecordResult<()> {
        self.emit_guard(InstKind::GuardType {
            check,
            value,
            exit: pc,
        })
    }

    fn guard_redefine(&mut self, class: ClassId, op: BasicOp, pc: Pc) -> RecordResult<()> {
        self.emit_guard(InstKind::GuardMethodRedefine {
            class,
            op,
            exit: pc,
        })
    }

    /// Whether `op` has its builtin meaning for `class`; `!=` also needs
    /// `==`
    fn unredefined<H: Host>(host: &H, op: BasicOp, class: ClassId) -> bool {
        host.basic_op_unredefined(op, class)
            && (op != BasicOp::Neq || host.basic_op_unredefined(BasicOp::Eq, class))
    }

    fn guard_unredefined(&mut self, class: ClassId, op: BasicOp, pc: Pc) -> RecordResult<()> {
        if op == BasicOp::Neq {
            self.guard_redefine(class, BasicOp::Eq, pc)?;
        }
        self.guard_redefine(class, op, pc)
    }

    /// Pop a receiver and one argument and push `func(recv, arg)` behind
    /// type and redefinition guards
    fn native_binary(
        &mut self,
        pc: Pc,
        checks: (TypeCheck, Option<TypeCheck>),
        class: ClassId,
        op: BasicOp,
        func: NativeFn,
    ) -> RecordResult<Flow> {
        let arg = self.pop()?;
        let recv = self.pop()?;
        self.guard_type(checks.0, recv, pc)?;
        if let Some(check) = checks.1 {
            self.guard_type(check, arg, pc)?;
        }
        self.guard_redefine(class, op, pc)?;
        let value = self.emit(InstKind::InvokeNative {
            func,
            recv,
            args: vec![arg],
        })?;
        self.push(value);
        Ok(Flow::Continue)
    }

    /// The regular method call behind an operator: receiver and `argc`
    /// arguments are the top registers, `recv` is the receiver's value
    fn generic_call<H: Host>(
        &mut self,
        host: &mut H,
        pc: Pc,
        mid: &str,
        argc: u32,
        recv: &Value,
    ) -> RecordResult<Flow> {
        let cache = host
            .search_method(pc, mid, argc, recv)
            .ok_or(TraceError::Throw)?;
        if let MethodKind::Iseq(iseq) = cache.method.kind {
            return self.inline_method(host, pc, &cache, iseq, argc, None);
        }
        let recv_reg = self.top(argc)?;
        let cache = self.caches.clone_cache(&cache);
        self.emit_guard(InstKind::GuardMethodCache {
            recv: recv_reg,
            cache: cache.clone(),
            exit: pc,
        })?;
        let args = self.pop_regs(argc)?;
        let recv = self.pop()?;
        let value = self.emit(InstKind::InvokeMethod {
            cache,
            recv,
            args,
            block: None,
        })?;
        self.push(value);
        Ok(Flow::Continue)
    }

    /// Fallback for an `opt_*` instruction whose operands are already the
    /// top registers
    fn generic_basic<H: Host>(&mut self, host: &mut H, pc: Pc, insn: &Insn) -> RecordResult<Flow> {
        let (mid, argc) = insn.basic_call().ok_or(TraceError::UnsupportedOpcode)?;
        let recv = operand(host, argc as usize)?;
        self.generic_call(host, pc, mid, argc, &recv)
    }

    // ==================== Arithmetic and comparison ====================

    pub(super) fn record_binary<H: Host>(&mut self, host: &mut H, pc: Pc, insn: &Insn) -> RecordResult<Flow> {
        let (op, binary) = binary_op(insn).ok_or(TraceError::UnsupportedOpcode)?;
        let recv = operand(host, 1)?;
        let arg = operand(host, 0)?;
        self.snapshot(pc)?;

        match (&recv, &arg) {
            (Value::Fixnum(_), Value::Fixnum(_)) if Self::unredefined(host, op, ClassId::INTEGER) => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.guard_type(TypeCheck::Fixnum, lhs, pc)?;
                self.guard_type(TypeCheck::Fixnum, rhs, pc)?;
                self.guard_unredefined(ClassId::INTEGER, op, pc)?;
                let value = match binary {
                    Binary::Arith(op) => self.emit(InstKind::FixnumArith {
                        op,
                        lhs,
                        rhs,
                        exit: pc,
                    })?,
                    Binary::Cmp(op) => self.emit(InstKind::FixnumCmp { op, lhs, rhs })?,
                };
                self.push(value);
                Ok(Flow::Continue)
            }
            (Value::Float(_), Value::Float(_)) if Self::unredefined(host, op, ClassId::FLOAT) => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.guard_type(float_check(&recv), lhs, pc)?;
                self.guard_type(float_check(&arg), rhs, pc)?;
                self.guard_unredefined(ClassId::FLOAT, op, pc)?;
                let value = match binary {
                    Binary::Arith(op) => self.emit(InstKind::FloatArith { op, lhs, rhs })?,
                    Binary::Cmp(op) => self.emit(InstKind::FloatCmp { op, lhs, rhs })?,
                };
                self.push(value);
                Ok(Flow::Continue)
            }
            (Value::String(_), Value::String(_))
                if matches!(op, BasicOp::Plus | BasicOp::Eq)
                    && Self::unredefined(host, op, ClassId::STRING) =>
            {
                let func = if op == BasicOp::Plus {
                    NativeFn::StrPlus
                } else {
                    NativeFn::StrEq
                };
                self.native_binary(
                    pc,
                    (TypeCheck::String, Some(TypeCheck::String)),
                    ClassId::STRING,
                    op,
                    func,
                )
            }
            (Value::Array(_), Value::Array(_))
                if op == BasicOp::Plus && Self::unredefined(host, op, ClassId::ARRAY) =>
            {
                self.native_binary(
                    pc,
                    (TypeCheck::Array, Some(TypeCheck::Array)),
                    ClassId::ARRAY,
                    op,
                    NativeFn::AryPlus,
                )
            }
            _ => self.generic_basic(host, pc, insn),
        }
    }

    pub(super) fn record_ltlt<H: Host>(&mut self, host: &mut H, pc: Pc, insn: &Insn) -> RecordResult<Flow> {
        let recv = operand(host, 1)?;
        let arg = operand(host, 0)?;
        self.snapshot(pc)?;
        match (&recv, &arg) {
            (Value::String(_), Value::String(_))
                if Self::unredefined(host, BasicOp::LtLt, ClassId::STRING) =>
            {
                self.native_binary(
                    pc,
                    (TypeCheck::String, Some(TypeCheck::String)),
                    ClassId::STRING,
                    BasicOp::LtLt,
                    NativeFn::StrAppend,
                )
            }
            (Value::Array(_), _) if Self::unredefined(host, BasicOp::LtLt, ClassId::ARRAY) => self
                .native_binary(
                    pc,
                    (TypeCheck::Array, None),
                    ClassId::ARRAY,
                    BasicOp::LtLt,
                    NativeFn::AryPush,
                ),
            _ => self.generic_basic(host, pc, insn),
        }
    }

    // ==================== Element access ====================

    pub(super) fn record_aref<H: Host>(&mut self, host: &mut H, pc: Pc, insn: &Insn) -> RecordResult<Flow> {
        let recv = operand(host, 1)?;
        let key = operand(host, 0)?;
        self.snapshot(pc)?;
        match (&recv, &key) {
            (Value::Array(_), Value::Fixnum(_))
                if Self::unredefined(host, BasicOp::Aref, ClassId::ARRAY) =>
            {
                let index = self.pop()?;
                let array = self.pop()?;
                self.guard_type(TypeCheck::Array, array, pc)?;
                self.guard_type(TypeCheck::Fixnum, index, pc)?;
                self.guard_redefine(ClassId::ARRAY, BasicOp::Aref, pc)?;
                let value = self.emit(InstKind::ArrayGet { recv: array, index })?;
                self.push(value);
                Ok(Flow::Continue)
            }
            (Value::Hash(_), _) if Self::unredefined(host, BasicOp::Aref, ClassId::HASH) => {
                let key = self.pop()?;
                let hash = self.pop()?;
                self.guard_type(TypeCheck::Hash, hash, pc)?;
                self.guard_redefine(ClassId::HASH, BasicOp::Aref, pc)?;
                let value = self.emit(InstKind::HashGet { recv: hash, key })?;
                self.push(value);
                Ok(Flow::Continue)
            }
            _ => self.generic_basic(host, pc, insn),
        }
    }

    pub(super) fn record_aset<H: Host>(&mut self, host: &mut H, pc: Pc, insn: &Insn) -> RecordResult<Flow> {
        let recv = operand(host, 2)?;
        let key = operand(host, 1)?;
        self.snapshot(pc)?;
        match (&recv, &key) {
            (Value::Array(_), Value::Fixnum(_))
                if Self::unredefined(host, BasicOp::Aset, ClassId::ARRAY) =>
            {
                let value = self.pop()?;
                let index = self.pop()?;
                let array = self.pop()?;
                self.guard_type(TypeCheck::Array, array, pc)?;
                self.guard_type(TypeCheck::Fixnum, index, pc)?;
                self.guard_redefine(ClassId::ARRAY, BasicOp::Aset, pc)?;
                let result = self.emit(InstKind::ArraySet {
                    recv: array,
                    index,
                    value,
                })?;
                self.push(result);
                Ok(Flow::Continue)
            }
            (Value::Hash(_), _) if Self::unredefined(host, BasicOp::Aset, ClassId::HASH) => {
                let value = self.pop()?;
                let key = self.pop()?;
                let hash = self.pop()?;
                self.guard_type(TypeCheck::Hash, hash, pc)?;
                self.guard_redefine(ClassId::HASH, BasicOp::Aset, pc)?;
                let result = self.emit(InstKind::HashSet {
                    recv: hash,
                    key,
                    value,
                })?;
                self.push(result);
                Ok(Flow::Continue)
            }
            _ => self.generic_basic(host, pc, insn),
        }
    }

    pub(super) fn record_aref_with<H: Host>(&mut self, host: &mut H, pc: Pc) -> RecordResult<Flow> {
        let literal = host.literal(pc).ok_or(TraceError::UnsupportedOpcode)?;
        let recv = operand(host, 0)?;
        self.snapshot(pc)?;
        if recv.is_hash() && Self::unredefined(host, BasicOp::Aref, ClassId::HASH) {
            let hash = self.pop()?;
            self.guard_type(TypeCheck::Hash, hash, pc)?;
            self.guard_redefine(ClassId::HASH, BasicOp::Aref, pc)?;
            let key = self.load_const(Constant::of(&literal));
            let value = self.emit(InstKind::HashGet { recv: hash, key })?;
            self.push(value);
            return Ok(Flow::Continue);
        }
        let key = self.load_const(Constant::of(&literal));
        self.push(key);
        self.generic_call(host, pc, "[]", 1, &recv)
    }

    pub(super) fn record_aset_with<H: Host>(&mut self, host: &mut H, pc: Pc) -> RecordResult<Flow> {
        let literal = host.literal(pc).ok_or(TraceError::UnsupportedOpcode)?;
        let recv = operand(host, 1)?;
        self.snapshot(pc)?;
        let value = self.pop()?;
        let key = self.load_const(Constant::of(&literal));
        if recv.is_hash() && Self::unredefined(host, BasicOp::Aset, ClassId::HASH) {
            let hash = self.pop()?;
            self.guard_type(TypeCheck::Hash, hash, pc)?;
            self.guard_redefine(ClassId::HASH, BasicOp::Aset, pc)?;
            let result = self.emit(InstKind::HashSet {
                recv: hash,
                key,
                value,
            })?;
            self.push(result);
            return Ok(Flow::Continue);
        }
        self.push(key);
        self.push(value);
        self.generic_call(host, pc, "[]=", 2, &recv)
    }

    // ==================== Unary ====================

    pub(super) fn record_length<H: Host>(&mut self, host: &mut H, pc: Pc, insn: &Insn) -> RecordResult<Flow> {
        let op = match insn {
            Insn::OptLength => BasicOp::Length,
            Insn::OptSize => BasicOp::Size,
            _ => BasicOp::EmptyP,
        };
        let recv = operand(host, 0)?;
        self.snapshot(pc)?;
        let container = match recv {
            Value::String(_) => Some((Container::String, TypeCheck::String, ClassId::STRING)),
            Value::Array(_) => Some((Container::Array, TypeCheck::Array, ClassId::ARRAY)),
            Value::Hash(_) => Some((Container::Hash, TypeCheck::Hash, ClassId::HASH)),
            _ => None,
        };
        match container {
            Some((of, check, class)) if Self::unredefined(host, op, class) => {
                let value = self.pop()?;
                self.guard_type(check, value, pc)?;
                self.guard_redefine(class, op, pc)?;
                let result = if op == BasicOp::EmptyP {
                    self.emit(InstKind::EmptyP { of, value })?
                } else {
                    self.emit(InstKind::Length { of, value })?
                };
                self.push(result);
                Ok(Flow::Continue)
            }
            _ => self.generic_basic(host, pc, insn),
        }
    }

    pub(super) fn record_succ<H: Host>(&mut self, host: &mut H, pc: Pc, insn: &Insn) -> RecordResult<Flow> {
        let recv = operand(host, 0)?;
        self.snapshot(pc)?;
        match recv {
            Value::Fixnum(_) if Self::unredefined(host, BasicOp::Succ, ClassId::INTEGER) => {
                let value = self.pop()?;
                self.guard_type(TypeCheck::Fixnum, value, pc)?;
                self.guard_redefine(ClassId::INTEGER, BasicOp::Succ, pc)?;
                let one = self.load_const(Constant::Fixnum(1));
                let result = self.emit(InstKind::FixnumArith {
                    op: ArithOp::Add,
                    lhs: value,
                    rhs: one,
                    exit: pc,
                })?;
                self.push(result);
                Ok(Flow::Continue)
            }
            Value::String(_) if Self::unredefined(host, BasicOp::Succ, ClassId::STRING) => {
                self.native_unary(pc, TypeCheck::String, ClassId::STRING, NativeFn::StrSucc)
            }
            Value::Time(_) if Self::unredefined(host, BasicOp::Succ, ClassId::TIME) => {
                self.native_unary(pc, TypeCheck::Time, ClassId::TIME, NativeFn::TimeSucc)
            }
            _ => self.generic_basic(host, pc, insn),
        }
    }

    fn native_unary(&mut self, pc: Pc, check: TypeCheck, class: ClassId, func: NativeFn) -> RecordResult<Flow> {
        let recv = self.pop()?;
        self.guard_type(check, recv, pc)?;
        self.guard_redefine(class, BasicOp::Succ, pc)?;
        let value = self.emit(InstKind::InvokeNative {
            func,
            recv,
            args: Vec::new(),
        })?;
        self.push(value);
        Ok(Flow::Continue)
    }

    // ==================== Regexp ====================

    /// `target =~ /literal/`
    pub(super) fn record_regexpmatch1<H: Host>(&mut self, host: &mut H, pc: Pc) -> RecordResult<Flow> {
        let regexp = host.literal(pc).ok_or(TraceError::UnsupportedOpcode)?;
        let target = operand(host, 0)?;
        self.snapshot(pc)?;
        let target_reg = self.pop()?;
        let regexp_reg = self.load_const(Constant::of(&regexp));
        if target.is_string() && Self::unredefined(host, BasicOp::Match, ClassId::REGEXP) {
            self.guard_type(TypeCheck::String, target_reg, pc)?;
            self.guard_redefine(ClassId::REGEXP, BasicOp::Match, pc)?;
            let value = self.emit(InstKind::RegExpMatch {
                regexp: regexp_reg,
                target: target_reg,
            })?;
            self.push(value);
            return Ok(Flow::Continue);
        }
        self.push(regexp_reg);
        self.push(target_reg);
        self.generic_call(host, pc, "=~", 1, &regexp)
    }

    /// `string =~ regexp` with both operands on the stack
    pub(super) fn record_regexpmatch2<H: Host>(&mut self, host: &mut H, pc: Pc, insn: &Insn) -> RecordResult<Flow> {
        let recv = operand(host, 1)?;
        let arg = operand(host, 0)?;
        self.snapshot(pc)?;
        match (&recv, &arg) {
            (Value::String(_), Value::Regexp(_))
                if Self::unredefined(host, BasicOp::Match, ClassId::STRING) =>
            {
                let regexp = self.pop()?;
                let target = self.pop()?;
                self.guard_type(TypeCheck::String, target, pc)?;
                self.guard_type(TypeCheck::Regexp, regexp, pc)?;
                self.guard_redefine(ClassId::STRING, BasicOp::Match, pc)?;
                let value = self.emit(InstKind::RegExpMatch { regexp, target })?;
                self.push(value);
                Ok(Flow::Continue)
            }
            _ => self.generic_basic(host, pc, insn),
        }
    }
}
