//! Builtin methods of the reference interpreter
//!
//! Every builtin is a [`NativeFn`] registered on a class, or on a metaclass
//! for singleton methods such as `Math.sqrt`. Natives run on the caller's
//! frame; natives taking a block re-enter the interpreter through
//! [`Machine::yield_block`].

use super::class::{ClassId, MethodKind};
use super::numeric::{self, ArithOp, CmpOp};
use super::value::{HashValue, Value};
use super::vm::{Block, Machine};
use crate::error::{Error, Result, RuntimeErrorKind};
use num_bigint::BigInt;
use std::rc::Rc;

/// Identifier of a builtin method implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeFn {
    // Kernel
    Puts,
    Print,
    P,
    Rand,
    BlockGiven,
    Proc,
    ObjInitialize,
    ObjEq,
    ObjNeq,
    ObjNot,
    ObjEqualP,
    ObjCaseEq,
    ObjToS,
    ObjInspect,
    ObjClass,
    ObjNilP,
    ObjFreeze,
    ObjIsA,
    // Integer
    IntPlus,
    IntMinus,
    IntMul,
    IntDiv,
    IntMod,
    IntEq,
    IntLt,
    IntLe,
    IntGt,
    IntGe,
    IntLshift,
    IntRshift,
    IntAnd,
    IntOr,
    IntXor,
    IntNeg,
    IntSucc,
    IntToS,
    IntToF,
    IntToI,
    IntAbs,
    IntTimes,
    // Float
    FloPlus,
    FloMinus,
    FloMul,
    FloDiv,
    FloMod,
    FloEq,
    FloLt,
    FloLe,
    FloGt,
    FloGe,
    FloNeg,
    FloToS,
    FloToI,
    FloToF,
    FloFloor,
    FloCeil,
    FloAbs,
    // String
    StrPlus,
    StrAppend,
    StrEq,
    StrLength,
    StrEmptyP,
    StrSucc,
    StrToS,
    StrToI,
    StrToF,
    StrToSym,
    StrMatch,
    StrAref,
    StrFreeze,
    StrMul,
    StrUpcase,
    StrDowncase,
    StrReverse,
    // Symbol
    SymToS,
    // Array
    AryPlus,
    AryPush,
    AryAref,
    AryAset,
    AryLength,
    AryEmptyP,
    AryFirst,
    AryLast,
    AryPop,
    AryEach,
    AryMap,
    AryIncludeP,
    AryJoin,
    AryDup,
    // Hash
    HashAref,
    HashAset,
    HashLength,
    HashEmptyP,
    HashKeyP,
    HashKeys,
    HashValues,
    HashEach,
    // Range
    RangeFirst,
    RangeLast,
    RangeIncludeP,
    RangeEach,
    RangeToA,
    // Regexp
    ReMatch,
    ReCaseEq,
    ReMatchP,
    ReSource,
    // Time
    TimeNow,
    TimeSucc,
    TimeToF,
    TimePlus,
    // Class
    ClassNew,
    ClassName,
    // Math
    MathSin,
    MathCos,
    MathTan,
    MathExp,
    MathSqrt,
    MathLog10,
    MathLog2,
    MathLog,
    MathHypot,
    // Proc
    ProcCall,
    /// `tostring` conversion: strings pass through, anything else goes
    /// through `to_s`
    ObjAsString,
}

const MANY: usize = usize::MAX;

impl NativeFn {
    /// Accepted argument counts (receiver excluded)
    pub fn arity(self) -> (usize, usize) {
        use NativeFn::*;
        match self {
            Puts | Print | P | ObjInitialize | AryPush | ClassNew | ProcCall => (0, MANY),
            Rand | AryJoin => (0, 1),
            AryAset | HashAset | MathHypot => (2, 2),
            IntPlus | IntMinus | IntMul | IntDiv | IntMod | IntEq | IntLt | IntLe | IntGt
            | IntGe | IntLshift | IntRshift | IntAnd | IntOr | IntXor | FloPlus | FloMinus
            | FloMul | FloDiv | FloMod | FloEq | FloLt | FloLe | FloGt | FloGe | StrPlus
            | StrAppend | StrEq | StrMatch | StrAref | StrMul | AryPlus | AryAref
            | AryIncludeP | HashAref | HashKeyP | RangeIncludeP | ReMatch | ReCaseEq
            | ReMatchP | TimePlus | ObjEq | ObjNeq | ObjEqualP | ObjCaseEq | ObjIsA | MathSin
            | MathCos | MathTan | MathExp | MathSqrt | MathLog10 | MathLog2 | MathLog => (1, 1),
            _ => (0, 0),
        }
    }

    /// Whether the native calls back into the interpreter through a block
    pub fn takes_block(self) -> bool {
        use NativeFn::*;
        matches!(
            self,
            IntTimes | AryEach | AryMap | HashEach | RangeEach | Proc | ProcCall
        )
    }
}

use NativeFn::*;

/// Instance methods: (class, name, implementation)
const METHODS: &[(ClassId, &str, NativeFn)] = &[
    (ClassId::OBJECT, "puts", Puts),
    (ClassId::OBJECT, "print", Print),
    (ClassId::OBJECT, "p", P),
    (ClassId::OBJECT, "rand", Rand),
    (ClassId::OBJECT, "block_given?", BlockGiven),
    (ClassId::OBJECT, "proc", Proc),
    (ClassId::OBJECT, "initialize", ObjInitialize),
    (ClassId::OBJECT, "==", ObjEq),
    (ClassId::OBJECT, "!=", ObjNeq),
    (ClassId::OBJECT, "!", ObjNot),
    (ClassId::OBJECT, "equal?", ObjEqualP),
    (ClassId::OBJECT, "===", ObjCaseEq),
    (ClassId::OBJECT, "to_s", ObjToS),
    (ClassId::OBJECT, "inspect", ObjInspect),
    (ClassId::OBJECT, "class", ObjClass),
    (ClassId::OBJECT, "nil?", ObjNilP),
    (ClassId::OBJECT, "freeze", ObjFreeze),
    (ClassId::OBJECT, "is_a?", ObjIsA),
    (ClassId::INTEGER, "+", IntPlus),
    (ClassId::INTEGER, "-", IntMinus),
    (ClassId::INTEGER, "*", IntMul),
    (ClassId::INTEGER, "/", IntDiv),
    (ClassId::INTEGER, "%", IntMod),
    (ClassId::INTEGER, "==", IntEq),
    (ClassId::INTEGER, "<", IntLt),
    (ClassId::INTEGER, "<=", IntLe),
    (ClassId::INTEGER, ">", IntGt),
    (ClassId::INTEGER, ">=", IntGe),
    (ClassId::INTEGER, "<<", IntLshift),
    (ClassId::INTEGER, ">>", IntRshift),
    (ClassId::INTEGER, "&", IntAnd),
    (ClassId::INTEGER, "|", IntOr),
    (ClassId::INTEGER, "^", IntXor),
    (ClassId::INTEGER, "-@", IntNeg),
    (ClassId::INTEGER, "succ", IntSucc),
    (ClassId::INTEGER, "to_s", IntToS),
    (ClassId::INTEGER, "to_f", IntToF),
    (ClassId::INTEGER, "to_i", IntToI),
    (ClassId::INTEGER, "abs", IntAbs),
    (ClassId::INTEGER, "times", IntTimes),
    (ClassId::FLOAT, "+", FloPlus),
    (ClassId::FLOAT, "-", FloMinus),
    (ClassId::FLOAT, "*", FloMul),
    (ClassId::FLOAT, "/", FloDiv),
    (ClassId::FLOAT, "%", FloMod),
    (ClassId::FLOAT, "==", FloEq),
    (ClassId::FLOAT, "<", FloLt),
    (ClassId::FLOAT, "<=", FloLe),
    (ClassId::FLOAT, ">", FloGt),
    (ClassId::FLOAT, ">=", FloGe),
    (ClassId::FLOAT, "-@", FloNeg),
    (ClassId::FLOAT, "to_s", FloToS),
    (ClassId::FLOAT, "to_i", FloToI),
    (ClassId::FLOAT, "to_f", FloToF),
    (ClassId::FLOAT, "floor", FloFloor),
    (ClassId::FLOAT, "ceil", FloCeil),
    (ClassId::FLOAT, "abs", FloAbs),
    (ClassId::STRING, "+", StrPlus),
    (ClassId::STRING, "<<", StrAppend),
    (ClassId::STRING, "==", StrEq),
    (ClassId::STRING, "length", StrLength),
    (ClassId::STRING, "size", StrLength),
    (ClassId::STRING, "empty?", StrEmptyP),
    (ClassId::STRING, "succ", StrSucc),
    (ClassId::STRING, "to_s", StrToS),
    (ClassId::STRING, "to_i", StrToI),
    (ClassId::STRING, "to_f", StrToF),
    (ClassId::STRING, "to_sym", StrToSym),
    (ClassId::STRING, "=~", StrMatch),
    (ClassId::STRING, "[]", StrAref),
    (ClassId::STRING, "freeze", StrFreeze),
    (ClassId::STRING, "*", StrMul),
    (ClassId::STRING, "upcase", StrUpcase),
    (ClassId::STRING, "downcase", StrDowncase),
    (ClassId::STRING, "reverse", StrReverse),
    (ClassId::SYMBOL, "to_s", SymToS),
    (ClassId::ARRAY, "+", AryPlus),
    (ClassId::ARRAY, "<<", AryPush),
    (ClassId::ARRAY, "push", AryPush),
    (ClassId::ARRAY, "[]", AryAref),
    (ClassId::ARRAY, "[]=", AryAset),
    (ClassId::ARRAY, "length", AryLength),
    (ClassId::ARRAY, "size", AryLength),
    (ClassId::ARRAY, "empty?", AryEmptyP),
    (ClassId::ARRAY, "first", AryFirst),
    (ClassId::ARRAY, "last", AryLast),
    (ClassId::ARRAY, "pop", AryPop),
    (ClassId::ARRAY, "each", AryEach),
    (ClassId::ARRAY, "map", AryMap),
    (ClassId::ARRAY, "include?", AryIncludeP),
    (ClassId::ARRAY, "join", AryJoin),
    (ClassId::ARRAY, "dup", AryDup),
    (ClassId::HASH, "[]", HashAref),
    (ClassId::HASH, "[]=", HashAset),
    (ClassId::HASH, "length", HashLength),
    (ClassId::HASH, "size", HashLength),
    (ClassId::HASH, "empty?", HashEmptyP),
    (ClassId::HASH, "key?", HashKeyP),
    (ClassId::HASH, "keys", HashKeys),
    (ClassId::HASH, "values", HashValues),
    (ClassId::HASH, "each", HashEach),
    (ClassId::RANGE, "first", RangeFirst),
    (ClassId::RANGE, "last", RangeLast),
    (ClassId::RANGE, "include?", RangeIncludeP),
    (ClassId::RANGE, "===", RangeIncludeP),
    (ClassId::RANGE, "each", RangeEach),
    (ClassId::RANGE, "to_a", RangeToA),
    (ClassId::REGEXP, "=~", ReMatch),
    (ClassId::REGEXP, "===", ReCaseEq),
    (ClassId::REGEXP, "match?", ReMatchP),
    (ClassId::REGEXP, "source", ReSource),
    (ClassId::TIME, "succ", TimeSucc),
    (ClassId::TIME, "to_f", TimeToF),
    (ClassId::TIME, "+", TimePlus),
    (ClassId::CLASS, "new", ClassNew),
    (ClassId::CLASS, "name", ClassName),
    (ClassId::PROC, "call", ProcCall),
];

/// Singleton methods: (class, name, implementation)
const SINGLETON_METHODS: &[(ClassId, &str, NativeFn)] = &[
    (ClassId::MATH, "sin", MathSin),
    (ClassId::MATH, "cos", MathCos),
    (ClassId::MATH, "tan", MathTan),
    (ClassId::MATH, "exp", MathExp),
    (ClassId::MATH, "sqrt", MathSqrt),
    (ClassId::MATH, "log10", MathLog10),
    (ClassId::MATH, "log2", MathLog2),
    (ClassId::MATH, "log", MathLog),
    (ClassId::MATH, "hypot", MathHypot),
    (ClassId::TIME, "now", TimeNow),
];

/// Install every builtin method into the machine's class table
pub fn register_builtins(m: &mut Machine) {
    for &(class, name, func) in METHODS {
        m.define_method(class, name, MethodKind::Native(func));
    }
    for &(class, name, func) in SINGLETON_METHODS {
        let meta = m.classes().meta(class);
        m.define_method(meta, name, MethodKind::Native(func));
    }
}

// ==================== Argument helpers ====================

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Nil)
}

fn implicit_conversion(v: &Value, into: &str) -> Error {
    Error::type_error(format!(
        "no implicit conversion of {} into {}",
        v.type_name(),
        into
    ))
}

fn int_arg(v: &Value) -> Result<i64> {
    v.as_fixnum().ok_or_else(|| implicit_conversion(v, "Integer"))
}

fn float_arg(v: &Value) -> Result<f64> {
    match v {
        Value::String(_) | Value::Nil => Err(Error::type_error(format!(
            "can't convert {} into Float",
            v.type_name()
        ))),
        _ => numeric::to_f64(v).ok_or_else(|| {
            Error::type_error(format!("can't convert {} into Float", v.type_name()))
        }),
    }
}

fn str_arg(v: &Value) -> Result<String> {
    match v {
        Value::String(s) => Ok(s.borrow().clone()),
        _ => Err(implicit_conversion(v, "String")),
    }
}

fn big(v: &Value) -> Option<BigInt> {
    match v {
        Value::Fixnum(n) => Some(BigInt::from(*n)),
        Value::Bignum(b) => Some((**b).clone()),
        _ => None,
    }
}

fn wrong_receiver(func: NativeFn, recv: &Value) -> Error {
    Error::type_error(format!(
        "{:?} called on {}",
        func,
        recv.type_name()
    ))
}

fn require_block(block: Option<Rc<Block>>) -> Result<Rc<Block>> {
    block.ok_or_else(|| Error::runtime(RuntimeErrorKind::LocalJumpError, "no block given (yield)"))
}

/// Resolve a possibly negative index against `len`
fn array_index(idx: i64, len: usize) -> Option<usize> {
    let resolved = if idx < 0 { len as i64 + idx } else { idx };
    (resolved >= 0).then_some(resolved as usize)
}

// ==================== Dispatch ====================

/// Invoke a builtin on `recv`
pub fn call(
    m: &mut Machine,
    func: NativeFn,
    recv: Value,
    args: Vec<Value>,
    block: Option<Rc<Block>>,
) -> Result<Value> {
    let (min, max) = func.arity();
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else if max == MANY {
            format!("{}+", min)
        } else {
            format!("{}..{}", min, max)
        };
        return Err(Error::argument_error(format!(
            "wrong number of arguments (given {}, expected {})",
            args.len(),
            expected
        )));
    }

    match func {
        // ---- Kernel ----
        Puts => {
            if args.is_empty() {
                m.write_output("\n");
            }
            for value in args {
                puts_value(m, value)?;
            }
            Ok(Value::Nil)
        }
        Print => {
            for value in args {
                let s = m.obj_as_string(&value)?;
                m.write_output(&string_contents(&s));
            }
            Ok(Value::Nil)
        }
        P => {
            for value in &args {
                let line = format!("{}\n", inspect(m, value));
                m.write_output(&line);
            }
            Ok(match args.len() {
                0 => Value::Nil,
                1 => arg(&args, 0),
                _ => Value::array(args),
            })
        }
        Rand => match args.first() {
            None | Some(Value::Nil) => Ok(Value::Float(m.random_f64())),
            Some(Value::Fixnum(n)) if *n > 0 => Ok(Value::Fixnum(m.random_below(*n))),
            Some(Value::Float(x)) if *x > 0.0 => Ok(Value::Float(m.random_f64() * x)),
            Some(other) => Err(Error::argument_error(format!(
                "invalid argument - {}",
                inspect(m, other)
            ))),
        },
        BlockGiven => Ok(Value::bool(m.current_block().is_some())),
        Proc => Ok(Value::Proc(block.ok_or_else(|| {
            Error::argument_error("tried to create Proc object without a block")
        })?)),
        ObjInitialize => Ok(Value::Nil),
        ObjEq => Ok(Value::bool(recv == arg(&args, 0))),
        ObjNeq => {
            let eq = m.call_method(recv, "==", args, None)?;
            Ok(Value::bool(!eq.is_truthy()))
        }
        ObjNot => Ok(Value::bool(!recv.is_truthy())),
        ObjEqualP => Ok(Value::bool(recv.same(&arg(&args, 0)))),
        ObjCaseEq => m.call_method(recv, "==", args, None),
        ObjToS => Ok(Value::string(&to_s(m, &recv))),
        ObjInspect => Ok(Value::string(&inspect(m, &recv))),
        ObjClass => Ok(Value::Class(match recv {
            Value::Class(_) => ClassId::CLASS,
            _ => m.class_of(&recv),
        })),
        ObjNilP => Ok(Value::bool(recv.is_nil())),
        ObjFreeze => Ok(recv),
        ObjIsA => match arg(&args, 0) {
            Value::Class(c) => {
                let klass = m.class_of(&recv);
                Ok(Value::bool(m.classes().inherits(klass, c)))
            }
            other => Err(Error::type_error(format!(
                "class or module required, got {}",
                other.type_name()
            ))),
        },

        // ---- Integer / Float ----
        IntPlus | FloPlus => numeric::arith(ArithOp::Add, &recv, &arg(&args, 0)),
        IntMinus | FloMinus => numeric::arith(ArithOp::Sub, &recv, &arg(&args, 0)),
        IntMul | FloMul => numeric::arith(ArithOp::Mul, &recv, &arg(&args, 0)),
        IntDiv | FloDiv => numeric::arith(ArithOp::Div, &recv, &arg(&args, 0)),
        IntMod | FloMod => numeric::arith(ArithOp::Mod, &recv, &arg(&args, 0)),
        IntEq | FloEq => numeric::compare(CmpOp::Eq, &recv, &arg(&args, 0)).map(Value::bool),
        IntLt | FloLt => numeric::compare(CmpOp::Lt, &recv, &arg(&args, 0)).map(Value::bool),
        IntLe | FloLe => numeric::compare(CmpOp::Le, &recv, &arg(&args, 0)).map(Value::bool),
        IntGt | FloGt => numeric::compare(CmpOp::Gt, &recv, &arg(&args, 0)).map(Value::bool),
        IntGe | FloGe => numeric::compare(CmpOp::Ge, &recv, &arg(&args, 0)).map(Value::bool),
        IntLshift | IntRshift => {
            let count = int_arg(&arg(&args, 0))?;
            let left = (func == IntLshift) == (count >= 0);
            match (&recv, left) {
                (Value::Fixnum(a), true) => Ok(numeric::fixnum_lshift(*a, count.abs())),
                (Value::Fixnum(a), false) => Ok(numeric::fixnum_rshift(*a, count.abs())),
                (Value::Bignum(b), true) => {
                    Ok(Value::bigint((**b).clone() << count.unsigned_abs().min(1 << 20) as usize))
                }
                (Value::Bignum(b), false) => {
                    Ok(Value::bigint((**b).clone() >> count.unsigned_abs().min(1 << 20) as usize))
                }
                _ => Err(wrong_receiver(func, &recv)),
            }
        }
        IntAnd | IntOr | IntXor => {
            let other = arg(&args, 0);
            if let (Value::Fixnum(a), Value::Fixnum(b)) = (&recv, &other) {
                return Ok(Value::Fixnum(match func {
                    IntAnd => a & b,
                    IntOr => a | b,
                    _ => a ^ b,
                }));
            }
            match (big(&recv), big(&other)) {
                (Some(a), Some(b)) => Ok(Value::bigint(match func {
                    IntAnd => a & b,
                    IntOr => a | b,
                    _ => a ^ b,
                })),
                _ => Err(implicit_conversion(&other, "Integer")),
            }
        }
        IntNeg => numeric::arith(ArithOp::Sub, &Value::Fixnum(0), &recv),
        FloNeg => Ok(Value::Float(-float_arg(&recv)?)),
        IntSucc => numeric::arith(ArithOp::Add, &recv, &Value::Fixnum(1)),
        IntToS => Ok(Value::string(&to_s(m, &recv))),
        IntToF | FloToF => Ok(Value::Float(float_arg(&recv)?)),
        IntToI => Ok(recv),
        IntAbs => match big(&recv) {
            Some(n) if n < BigInt::from(0) => Ok(Value::bigint(-n)),
            Some(_) => Ok(recv),
            None => Err(wrong_receiver(func, &recv)),
        },
        IntTimes => {
            let block = require_block(block)?;
            let n = int_arg(&recv)?;
            for i in 0..n.max(0) {
                m.yield_block(&block, vec![Value::Fixnum(i)])?;
            }
            Ok(recv)
        }
        FloToS => Ok(Value::string(&numeric::float_to_s(float_arg(&recv)?))),
        FloToI => numeric::float_to_int(float_arg(&recv)?),
        FloFloor => numeric::float_to_int(float_arg(&recv)?.floor()),
        FloCeil => numeric::float_to_int(float_arg(&recv)?.ceil()),
        FloAbs => Ok(Value::Float(float_arg(&recv)?.abs())),

        // ---- String ----
        StrPlus => {
            let mut s = str_arg(&recv)?;
            s.push_str(&str_arg(&arg(&args, 0))?);
            Ok(Value::string(&s))
        }
        StrAppend => {
            let tail = match arg(&args, 0) {
                Value::Fixnum(code) => char::from_u32(code as u32)
                    .map(String::from)
                    .ok_or_else(|| Error::runtime(RuntimeErrorKind::RangeError, format!("{} out of char range", code)))?,
                other => str_arg(&other)?,
            };
            match &recv {
                Value::String(s) => s.borrow_mut().push_str(&tail),
                _ => return Err(wrong_receiver(func, &recv)),
            }
            Ok(recv)
        }
        StrEq => Ok(Value::bool(matches!(
            (&recv, &arg(&args, 0)),
            (Value::String(a), Value::String(b)) if *a.borrow() == *b.borrow()
        ))),
        StrLength => Ok(Value::Fixnum(str_arg(&recv)?.chars().count() as i64)),
        StrEmptyP => Ok(Value::bool(str_arg(&recv)?.is_empty())),
        StrSucc => Ok(Value::string(&string_succ(&str_arg(&recv)?))),
        StrToS | StrFreeze => Ok(recv),
        StrToI => Ok(numeric::str_to_i(&str_arg(&recv)?)),
        StrToF => Ok(Value::Float(numeric::str_to_f(&str_arg(&recv)?))),
        StrToSym => {
            let s = str_arg(&recv)?;
            Ok(Value::Symbol(m.intern(&s)))
        }
        StrMatch => match arg(&args, 0) {
            Value::Regexp(re) => Ok(regexp_match(&re, &str_arg(&recv)?)),
            Value::String(_) => Err(Error::type_error("wrong argument type String (expected Regexp)")),
            other => m.call_method(other, "=~", vec![recv], None),
        },
        StrAref => {
            let s = str_arg(&recv)?;
            match arg(&args, 0) {
                Value::Fixnum(idx) => {
                    let len = s.chars().count();
                    Ok(array_index(idx, len)
                        .and_then(|i| s.chars().nth(i))
                        .map(|c| Value::string(&c.to_string()))
                        .unwrap_or(Value::Nil))
                }
                Value::String(sub) => {
                    let sub = sub.borrow().clone();
                    Ok(if s.contains(sub.as_str()) {
                        Value::string(&sub)
                    } else {
                        Value::Nil
                    })
                }
                other => Err(implicit_conversion(&other, "Integer")),
            }
        }
        StrMul => {
            let n = int_arg(&arg(&args, 0))?;
            if n < 0 {
                return Err(Error::argument_error("negative argument"));
            }
            Ok(Value::string(&str_arg(&recv)?.repeat(n as usize)))
        }
        StrUpcase => Ok(Value::string(&str_arg(&recv)?.to_uppercase())),
        StrDowncase => Ok(Value::string(&str_arg(&recv)?.to_lowercase())),
        StrReverse => Ok(Value::string(&str_arg(&recv)?.chars().rev().collect::<String>())),
        SymToS => match recv {
            Value::Symbol(sym) => Ok(Value::string(m.symbol_name(sym))),
            _ => Err(wrong_receiver(func, &recv)),
        },

        // ---- Array ----
        AryPlus => match (&recv, arg(&args, 0)) {
            (Value::Array(a), Value::Array(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Value::array(items))
            }
            (Value::Array(_), other) => Err(implicit_conversion(&other, "Array")),
            _ => Err(wrong_receiver(func, &recv)),
        },
        AryPush => {
            match &recv {
                Value::Array(a) => a.borrow_mut().extend(args),
                _ => return Err(wrong_receiver(func, &recv)),
            }
            Ok(recv)
        }
        AryAref => match (&recv, arg(&args, 0)) {
            (Value::Array(a), Value::Fixnum(idx)) => {
                let items = a.borrow();
                Ok(array_index(idx, items.len())
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Value::Nil))
            }
            (Value::Array(_), other) => Err(implicit_conversion(&other, "Integer")),
            _ => Err(wrong_receiver(func, &recv)),
        },
        AryAset => {
            let value = arg(&args, 1);
            match (&recv, arg(&args, 0)) {
                (Value::Array(a), Value::Fixnum(idx)) => {
                    let mut items = a.borrow_mut();
                    let len = items.len();
                    let i = array_index(idx, len).ok_or_else(|| {
                        Error::runtime(
                            RuntimeErrorKind::RangeError,
                            format!("index {} too small for array; minimum: -{}", idx, len),
                        )
                    })?;
                    if i >= len {
                        items.resize(i + 1, Value::Nil);
                    }
                    items[i] = value.clone();
                    Ok(value)
                }
                (Value::Array(_), other) => Err(implicit_conversion(&other, "Integer")),
                _ => Err(wrong_receiver(func, &recv)),
            }
        }
        AryLength | AryEmptyP | AryFirst | AryLast | AryPop | AryDup => {
            let Value::Array(a) = &recv else {
                return Err(wrong_receiver(func, &recv));
            };
            Ok(match func {
                AryLength => Value::Fixnum(a.borrow().len() as i64),
                AryEmptyP => Value::bool(a.borrow().is_empty()),
                AryFirst => a.borrow().first().cloned().unwrap_or(Value::Nil),
                AryLast => a.borrow().last().cloned().unwrap_or(Value::Nil),
                AryPop => a.borrow_mut().pop().unwrap_or(Value::Nil),
                _ => Value::array(a.borrow().clone()),
            })
        }
        AryEach | AryMap => {
            let block = require_block(block)?;
            let Value::Array(a) = &recv else {
                return Err(wrong_receiver(func, &recv));
            };
            let mut mapped = Vec::new();
            let mut i = 0;
            // the block may grow or shrink the array
            loop {
                let item = a.borrow().get(i).cloned();
                let Some(item) = item else {
                    break;
                };
                let result = m.yield_block(&block, vec![item])?;
                if func == AryMap {
                    mapped.push(result);
                }
                i += 1;
            }
            Ok(if func == AryMap {
                Value::array(mapped)
            } else {
                recv
            })
        }
        AryIncludeP => match &recv {
            Value::Array(a) => {
                let needle = arg(&args, 0);
                Ok(Value::bool(a.borrow().iter().any(|v| *v == needle)))
            }
            _ => Err(wrong_receiver(func, &recv)),
        },
        AryJoin => {
            let sep = match arg(&args, 0) {
                Value::Nil => String::new(),
                other => str_arg(&other)?,
            };
            let Value::Array(a) = &recv else {
                return Err(wrong_receiver(func, &recv));
            };
            let items = a.borrow().clone();
            let mut parts = Vec::with_capacity(items.len());
            for item in &items {
                parts.push(string_contents(&m.obj_as_string(item)?));
            }
            Ok(Value::string(&parts.join(&sep)))
        }

        // ---- Hash ----
        HashAref | HashAset | HashLength | HashEmptyP | HashKeyP | HashKeys | HashValues => {
            let Value::Hash(h) = &recv else {
                return Err(wrong_receiver(func, &recv));
            };
            Ok(match func {
                HashAref => h.borrow().get(&arg(&args, 0)).unwrap_or(Value::Nil),
                HashAset => {
                    let value = arg(&args, 1);
                    h.borrow_mut().insert(arg(&args, 0), value.clone());
                    value
                }
                HashLength => Value::Fixnum(h.borrow().len() as i64),
                HashEmptyP => Value::bool(h.borrow().is_empty()),
                HashKeyP => Value::bool(h.borrow().contains_key(&arg(&args, 0))),
                HashKeys => Value::array(h.borrow().entries().iter().map(|(k, _)| k.clone()).collect()),
                _ => Value::array(h.borrow().entries().iter().map(|(_, v)| v.clone()).collect()),
            })
        }
        HashEach => {
            let block = require_block(block)?;
            let Value::Hash(h) = &recv else {
                return Err(wrong_receiver(func, &recv));
            };
            let entries = h.borrow().entries().to_vec();
            for (k, v) in entries {
                m.yield_block(&block, vec![k, v])?;
            }
            Ok(recv)
        }

        // ---- Range ----
        RangeFirst | RangeLast => match &recv {
            Value::Range(r) => Ok(if func == RangeFirst {
                r.low.clone()
            } else {
                r.high.clone()
            }),
            _ => Err(wrong_receiver(func, &recv)),
        },
        RangeIncludeP => match &recv {
            Value::Range(r) => {
                let v = arg(&args, 0);
                Ok(Value::bool(range_include(&r.low, &r.high, r.exclusive, &v)))
            }
            _ => Err(wrong_receiver(func, &recv)),
        },
        RangeEach | RangeToA => {
            let Value::Range(r) = &recv else {
                return Err(wrong_receiver(func, &recv));
            };
            let (low, high) = match (&r.low, &r.high) {
                (Value::Fixnum(l), Value::Fixnum(h)) => (*l, if r.exclusive { *h - 1 } else { *h }),
                _ => return Err(Error::type_error(format!("can't iterate from {}", r.low.type_name()))),
            };
            if func == RangeToA {
                return Ok(Value::array((low..=high).map(Value::Fixnum).collect()));
            }
            let block = require_block(block)?;
            for i in low..=high {
                m.yield_block(&block, vec![Value::Fixnum(i)])?;
            }
            Ok(recv)
        }

        // ---- Regexp ----
        ReMatch | ReCaseEq | ReMatchP | ReSource => {
            let Value::Regexp(re) = &recv else {
                return Err(wrong_receiver(func, &recv));
            };
            match (func, arg(&args, 0)) {
                (ReSource, _) => Ok(Value::string(&re.source)),
                (ReMatch, Value::Nil) => Ok(Value::Nil),
                (ReMatch, Value::String(s)) => Ok(regexp_match(re, &s.borrow())),
                (ReMatch, other) => Err(implicit_conversion(&other, "String")),
                (_, Value::String(s)) => Ok(Value::bool(re.regex.is_match(&s.borrow()))),
                (ReMatchP, Value::Nil) => Ok(Value::False),
                (ReMatchP, other) => Err(implicit_conversion(&other, "String")),
                _ => Ok(Value::False),
            }
        }

        // ---- Time ----
        TimeNow => {
            let secs = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            Ok(Value::time(secs))
        }
        TimeSucc | TimeToF | TimePlus => {
            let Value::Time(t) = &recv else {
                return Err(wrong_receiver(func, &recv));
            };
            Ok(match func {
                TimeSucc => Value::time(t.secs + 1.0),
                TimeToF => Value::Float(t.secs),
                _ => Value::time(t.secs + float_arg(&arg(&args, 0))?),
            })
        }

        // ---- Class ----
        ClassNew => {
            let Value::Class(class) = recv else {
                return Err(wrong_receiver(func, &recv));
            };
            let obj = m.allocate(class)?;
            if let Value::Object(_) = obj {
                m.call_method(obj.clone(), "initialize", args, block)?;
            }
            Ok(obj)
        }
        ClassName => match recv {
            Value::Class(class) => Ok(Value::string(m.classes().name(class))),
            _ => Err(wrong_receiver(func, &recv)),
        },

        // ---- Math ----
        MathSin | MathCos | MathTan | MathExp | MathSqrt | MathLog10 | MathLog2 | MathLog => {
            let x = float_arg(&arg(&args, 0))?;
            Ok(Value::Float(match func {
                MathSin => x.sin(),
                MathCos => x.cos(),
                MathTan => x.tan(),
                MathExp => x.exp(),
                MathSqrt => x.sqrt(),
                MathLog10 => x.log10(),
                MathLog2 => x.log2(),
                _ => x.ln(),
            }))
        }
        MathHypot => {
            let x = float_arg(&arg(&args, 0))?;
            let y = float_arg(&arg(&args, 1))?;
            Ok(Value::Float(x.hypot(y)))
        }

        // ---- Proc ----
        ProcCall => match recv {
            Value::Proc(b) => m.yield_block(&b, args),
            _ => Err(wrong_receiver(func, &recv)),
        },

        ObjAsString => m.obj_as_string(&recv),
    }
}

fn puts_value(m: &mut Machine, value: Value) -> Result<()> {
    if let Value::Array(items) = &value {
        let items = items.borrow().clone();
        if items.is_empty() {
            m.write_output("\n");
        }
        for item in items {
            puts_value(m, item)?;
        }
        return Ok(());
    }
    let s = string_contents(&m.obj_as_string(&value)?);
    m.write_output(&s);
    if !s.ends_with('\n') {
        m.write_output("\n");
    }
    Ok(())
}

fn string_contents(v: &Value) -> String {
    match v {
        Value::String(s) => s.borrow().clone(),
        _ => String::new(),
    }
}

fn regexp_match(re: &super::value::RegexpValue, text: &str) -> Value {
    re.match_index(text)
        .map(|i| Value::Fixnum(i as i64))
        .unwrap_or(Value::Nil)
}

/// `Range#include?` for numeric endpoints
pub fn range_include(low: &Value, high: &Value, exclusive: bool, v: &Value) -> bool {
    let above = numeric::compare(CmpOp::Ge, v, low).unwrap_or(false);
    let below = if exclusive {
        numeric::compare(CmpOp::Lt, v, high).unwrap_or(false)
    } else {
        numeric::compare(CmpOp::Le, v, high).unwrap_or(false)
    };
    above && below
}

/// `String#succ`: increment the rightmost alphanumeric, carrying leftwards
pub fn string_succ(s: &str) -> String {
    let mut chars: Vec<char> = s.chars().collect();
    let has_alnum = chars.iter().any(|c| c.is_ascii_alphanumeric());
    let mut carry = None;
    let mut last = chars.len();
    for i in (0..chars.len()).rev() {
        let c = chars[i];
        if has_alnum && !c.is_ascii_alphanumeric() {
            continue;
        }
        let (next, wrapped) = match c {
            'z' => ('a', Some('a')),
            'Z' => ('A', Some('A')),
            '9' => ('0', Some('1')),
            _ if has_alnum => ((c as u8 + 1) as char, None),
            _ => (char::from_u32(c as u32 + 1).unwrap_or(c), None),
        };
        chars[i] = next;
        last = i;
        match wrapped {
            None => return chars.into_iter().collect(),
            Some(w) => carry = Some(w),
        }
    }
    if let Some(w) = carry {
        chars.insert(last, w);
    }
    chars.into_iter().collect()
}

// ==================== Formatting ====================

/// `Kernel#to_s` for builtin values
pub fn to_s(m: &Machine, v: &Value) -> String {
    match v {
        Value::Nil => String::new(),
        Value::True => "true".into(),
        Value::False => "false".into(),
        Value::Fixnum(n) => n.to_string(),
        Value::Bignum(b) => b.to_string(),
        Value::Float(x) => numeric::float_to_s(*x),
        Value::Symbol(s) => m.symbol_name(*s).to_string(),
        Value::String(s) => s.borrow().clone(),
        Value::Range(r) => format!(
            "{}{}{}",
            to_s(m, &r.low),
            if r.exclusive { "..." } else { ".." },
            to_s(m, &r.high)
        ),
        Value::Regexp(re) => format!("(?-mix:{})", re.source),
        Value::Time(t) => numeric::float_to_s(t.secs),
        Value::Object(o) => format!("#<{}>", m.classes().name(o.borrow().class)),
        Value::Class(c) => m.classes().name(*c).to_string(),
        Value::Proc(_) => "#<Proc>".into(),
        Value::Array(_) | Value::Hash(_) => inspect(m, v),
    }
}

/// `Kernel#inspect` for builtin values
pub fn inspect(m: &Machine, v: &Value) -> String {
    match v {
        Value::Nil => "nil".into(),
        Value::String(s) => format!("{:?}", s.borrow().as_str()),
        Value::Symbol(s) => format!(":{}", m.symbol_name(*s)),
        Value::Regexp(re) => format!("/{}/", re.source),
        Value::Array(items) => {
            let parts: Vec<String> = items.borrow().iter().map(|i| inspect(m, i)).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Hash(h) => {
            let parts: Vec<String> = h
                .borrow()
                .entries()
                .iter()
                .map(|(k, v)| format!("{}=>{}", inspect(m, k), inspect(m, v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Value::Range(r) => format!(
            "{}{}{}",
            inspect(m, &r.low),
            if r.exclusive { "..." } else { ".." },
            inspect(m, &r.high)
        ),
        _ => to_s(m, v),
    }
}

/// Build a hash from alternating keys and values
pub fn hash_from_pairs(items: Vec<Value>) -> Value {
    let mut hash = HashValue::new();
    let mut iter = items.into_iter();
    while let Some(key) = iter.next() {
        let value = iter.next().unwrap_or(Value::Nil);
        hash.insert(key, value);
    }
    Value::hash(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_succ() {
        assert_eq!(string_succ("a"), "b");
        assert_eq!(string_succ("az"), "ba");
        assert_eq!(string_succ("zz"), "aaa");
        assert_eq!(string_succ("a9"), "b0");
        assert_eq!(string_succ("Zz"), "AAa");
        assert_eq!(string_succ("1.9"), "2.0");
        assert_eq!(string_succ(""), "");
    }

    #[test]
    fn test_arity_table() {
        assert_eq!(NativeFn::MathSqrt.arity(), (1, 1));
        assert_eq!(NativeFn::Puts.arity(), (0, MANY));
        assert_eq!(NativeFn::HashAset.arity(), (2, 2));
        assert!(NativeFn::IntTimes.takes_block());
        assert!(!NativeFn::IntPlus.takes_block());
    }

    #[test]
    fn test_range_include() {
        let (one, five) = (Value::Fixnum(1), Value::Fixnum(5));
        assert!(range_include(&one, &five, false, &Value::Fixnum(5)));
        assert!(!range_include(&one, &five, true, &Value::Fixnum(5)));
        assert!(range_include(&one, &five, true, &Value::Float(4.5)));
        assert!(!range_include(&one, &five, false, &Value::string("3")));
    }

    #[test]
    fn test_natives_through_machine() {
        let mut m = Machine::new();
        let sum = call(&mut m, IntPlus, Value::Fixnum(2), vec![Value::Fixnum(3)], None).unwrap();
        assert_eq!(sum, Value::Fixnum(5));

        let err = call(&mut m, IntDiv, Value::Fixnum(1), vec![Value::Fixnum(0)], None).unwrap_err();
        assert_eq!(err.runtime_kind(), Some(RuntimeErrorKind::ZeroDivisionError));

        let arr = Value::array(vec![Value::Fixnum(1)]);
        call(&mut m, AryPush, arr.clone(), vec![Value::Fixnum(2)], None).unwrap();
        assert_eq!(inspect(&m, &arr), "[1, 2]");

        call(&mut m, Puts, Value::Nil, vec![Value::string("hi"), arr], None).unwrap();
        assert_eq!(m.output(), "hi\n1\n2\n");
    }

    #[test]
    fn test_wrong_arity() {
        let mut m = Machine::new();
        let err = call(&mut m, MathSqrt, Value::Class(ClassId::MATH), vec![], None).unwrap_err();
        assert_eq!(err.runtime_kind(), Some(RuntimeErrorKind::ArgumentError));
    }
}
