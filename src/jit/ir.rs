//! Trace IR
//!
//! Every instruction is an [`InstKind`] stored in the function's arena and
//! named by its [`InstId`]. An id is both the instruction's SSA-style value
//! name and its allocation order. Guards carry the program counter of the
//! side exit taken when they fail; they never define a usable value.

use crate::bytecode::{CheckMatchKind, Pc};
use crate::runtime::builtins::NativeFn;
use crate::runtime::class::{BasicOp, ClassId, IseqId};
use crate::runtime::numeric::{ArithOp, CmpOp};
use crate::runtime::value::Value;
use crate::runtime::vm::{CallCache, IvarCache};
use std::fmt;
use std::rc::Rc;

/// Instruction id (arena index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

impl InstId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Basic block id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Constant payload of a `LoadConst*` instruction
#[derive(Debug, Clone)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Fixnum(i64),
    Float(f64),
    String(Value),
    Regexp(Value),
    Object(Value),
}

impl Constant {
    /// Constant for a concrete value
    pub fn of(value: &Value) -> Constant {
        match value {
            Value::Nil => Constant::Nil,
            Value::True => Constant::Boolean(true),
            Value::False => Constant::Boolean(false),
            Value::Fixnum(n) => Constant::Fixnum(*n),
            Value::Float(x) => Constant::Float(*x),
            Value::String(_) => Constant::String(value.clone()),
            Value::Regexp(_) => Constant::Regexp(value.clone()),
            other => Constant::Object(other.clone()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Constant::Nil => Value::Nil,
            Constant::Boolean(b) => Value::bool(*b),
            Constant::Fixnum(n) => Value::Fixnum(*n),
            Constant::Float(x) => Value::Float(*x),
            Constant::String(v) | Constant::Regexp(v) | Constant::Object(v) => v.clone(),
        }
    }

    pub fn as_fixnum(&self) -> Option<i64> {
        match self {
            Constant::Fixnum(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Constant::Float(x) => Some(*x),
            _ => None,
        }
    }

    fn opcode(&self) -> &'static str {
        match self {
            Constant::Nil => "LoadConstNil",
            Constant::Boolean(_) => "LoadConstBoolean",
            Constant::Fixnum(_) => "LoadConstFixnum",
            Constant::Float(_) => "LoadConstFloat",
            Constant::String(_) => "LoadConstString",
            Constant::Regexp(_) => "LoadConstRegexp",
            Constant::Object(_) => "LoadConstObject",
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Nil => write!(f, "nil"),
            Constant::Boolean(b) => write!(f, "{}", b),
            Constant::Fixnum(n) => write!(f, "{}", n),
            Constant::Float(x) => write!(f, "{:?}", x),
            Constant::String(Value::String(s)) => write!(f, "{:?}", s.borrow()),
            Constant::Regexp(Value::Regexp(re)) => write!(f, "/{}/", re.source),
            Constant::String(v) | Constant::Regexp(v) | Constant::Object(v) => {
                write!(f, "<{}>", v.type_name())
            }
        }
    }
}

/// Value-type predicates checked by `GuardType*`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCheck {
    Fixnum,
    /// Any float, immediate or heap
    Float,
    Flonum,
    String,
    Array,
    Hash,
    Regexp,
    Time,
    /// The `Math` module itself
    Math,
    /// A plain object with instance variables
    Object,
    /// Passes when the value is nil or false
    Nil,
    /// Passes when the value is truthy
    NonNil,
    /// Passes when the value is a heap reference
    SpecialConst,
}

impl TypeCheck {
    /// Whether `value` satisfies the check
    pub fn test(self, value: &Value) -> bool {
        match self {
            TypeCheck::Fixnum => value.is_fixnum(),
            TypeCheck::Float => value.is_float(),
            TypeCheck::Flonum => value.is_flonum(),
            TypeCheck::String => value.is_string(),
            TypeCheck::Array => value.is_array(),
            TypeCheck::Hash => value.is_hash(),
            TypeCheck::Regexp => matches!(value, Value::Regexp(_)),
            TypeCheck::Time => matches!(value, Value::Time(_)),
            TypeCheck::Math => matches!(value, Value::Class(ClassId::MATH)),
            TypeCheck::Object => matches!(value, Value::Object(_)),
            TypeCheck::Nil => !value.is_truthy(),
            TypeCheck::NonNil => value.is_truthy(),
            TypeCheck::SpecialConst => !value.is_special_const(),
        }
    }

    fn opcode(self) -> &'static str {
        match self {
            TypeCheck::Fixnum => "GuardTypeFixnum",
            TypeCheck::Float => "GuardTypeFloat",
            TypeCheck::Flonum => "GuardTypeFlonum",
            TypeCheck::String => "GuardTypeString",
            TypeCheck::Array => "GuardTypeArray",
            TypeCheck::Hash => "GuardTypeHash",
            TypeCheck::Regexp => "GuardTypeRegexp",
            TypeCheck::Time => "GuardTypeTime",
            TypeCheck::Math => "GuardTypeMath",
            TypeCheck::Object => "GuardTypeObject",
            TypeCheck::Nil => "GuardTypeNil",
            TypeCheck::NonNil => "GuardTypeNonNil",
            TypeCheck::SpecialConst => "GuardTypeSpecialConst",
        }
    }
}

/// Fixnum bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitOp {
    And,
    Or,
    Xor,
    Lshift,
    Rshift,
}

/// `Math` singleton functions with trace support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathFn {
    Sin,
    Cos,
    Tan,
    Exp,
    Sqrt,
    Log10,
    Log2,
}

impl MathFn {
    pub fn from_native(func: NativeFn) -> Option<MathFn> {
        Some(match func {
            NativeFn::MathSin => MathFn::Sin,
            NativeFn::MathCos => MathFn::Cos,
            NativeFn::MathTan => MathFn::Tan,
            NativeFn::MathExp => MathFn::Exp,
            NativeFn::MathSqrt => MathFn::Sqrt,
            NativeFn::MathLog10 => MathFn::Log10,
            NativeFn::MathLog2 => MathFn::Log2,
            _ => return None,
        })
    }

    pub fn apply(self, x: f64) -> f64 {
        match self {
            MathFn::Sin => x.sin(),
            MathFn::Cos => x.cos(),
            MathFn::Tan => x.tan(),
            MathFn::Exp => x.exp(),
            MathFn::Sqrt => x.sqrt(),
            MathFn::Log10 => x.log10(),
            MathFn::Log2 => x.log2(),
        }
    }
}

/// Builtin container whose length / emptiness is read directly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    String,
    Array,
    Hash,
}

impl Container {
    fn name(self) -> &'static str {
        match self {
            Container::String => "String",
            Container::Array => "Array",
            Container::Hash => "Hash",
        }
    }
}

/// Frame entered by `FramePush`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InlineFrame {
    /// Method frame; the receiver and arguments stay on the caller's stack
    Method,
    /// Block frame; only the arguments are on the caller's stack
    Block,
}

/// One IR operation
#[derive(Debug, Clone)]
pub enum InstKind {
    // ==================== Entry and stack ====================
    /// Marks the trace entry
    StackAdjust,
    /// Value `depth` slots below the operand-stack top at trace entry
    StackPop { depth: u32 },

    // ==================== Loads ====================
    LoadSelf,
    /// Block of the current frame (nil without one)
    LoadBlock,
    /// A block over `iseq` capturing the current frame
    LoadSelfAsBlock { iseq: IseqId },
    LoadConst(Constant),
    EnvLoad { level: u32, idx: u32 },
    EnvStore { level: u32, idx: u32, value: InstId },
    GetPropertyName { recv: InstId, index: usize },
    SetPropertyName { recv: InstId, index: usize, value: InstId },
    /// Global named by the symbol in `name`
    GetGlobal { name: InstId },
    SetGlobal { name: InstId, value: InstId },

    // ==================== Allocation ====================
    AllocArray(Vec<InstId>),
    /// Key/value pairs, flattened
    AllocHash(Vec<InstId>),
    AllocRange { low: InstId, high: InstId, exclusive: bool },
    /// Fresh copy of a string
    AllocString(InstId),
    /// `klass.new(*args)`
    AllocObject { klass: InstId, args: Vec<InstId> },
    StringConcat(Vec<InstId>),

    // ==================== Guards ====================
    GuardType { check: TypeCheck, value: InstId, exit: Pc },
    /// Object shape still matches the instance-variable cache
    GuardProperty { recv: InstId, cache: IvarCache, exit: Pc },
    /// Receiver class and method state still match the call cache
    GuardMethodCache { recv: InstId, cache: Rc<CallCache>, exit: Pc },
    /// Builtin operator `op` of `class` was not redefined
    GuardMethodRedefine { class: ClassId, op: BasicOp, exit: Pc },
    /// Block register holds a block over `iseq`
    GuardBlockEqual { block: InstId, iseq: IseqId, exit: Pc },

    // ==================== Fixnum ====================
    /// Overflow promotes to a bignum; division by zero leaves through `exit`
    FixnumArith { op: ArithOp, lhs: InstId, rhs: InstId, exit: Pc },
    FixnumCmp { op: CmpOp, lhs: InstId, rhs: InstId },
    FixnumBit { op: BitOp, lhs: InstId, rhs: InstId },
    FixnumComplement(InstId),
    FixnumToFloat(InstId),

    // ==================== Float ====================
    FloatArith { op: ArithOp, lhs: InstId, rhs: InstId },
    FloatCmp { op: CmpOp, lhs: InstId, rhs: InstId },
    FloatToFixnum(InstId),
    StringToFloat(InstId),
    Math { func: MathFn, arg: InstId },

    // ==================== Containers ====================
    Length { of: Container, value: InstId },
    EmptyP { of: Container, value: InstId },
    ArrayGet { recv: InstId, index: InstId },
    ArraySet { recv: InstId, index: InstId, value: InstId },
    HashGet { recv: InstId, key: InstId },
    HashSet { recv: InstId, key: InstId, value: InstId },
    RegExpMatch { regexp: InstId, target: InstId },

    // ==================== Calls ====================
    /// Call through a cloned call cache
    InvokeMethod { cache: Rc<CallCache>, recv: InstId, args: Vec<InstId>, block: Option<InstId> },
    InvokeNative { func: NativeFn, recv: InstId, args: Vec<InstId> },
    /// Enter an inlined frame. For methods `argv[0]` is the receiver.
    FramePush {
        iseq: IseqId,
        frame: InlineFrame,
        return_pc: Pc,
        block: Option<InstId>,
        argv: Vec<InstId>,
    },
    FramePop,
    PatternMatch { kind: CheckMatchKind, pattern: InstId, target: InstId },
    /// `checkmatch` against every element of an array pattern
    PatternMatchRange { kind: CheckMatchKind, pattern: InstId, target: InstId },
    Trace { event: u32 },

    // ==================== Control ====================
    /// Jump to the block starting at `target` (resolved by linking)
    Jump { target: Pc, block: Option<BlockId> },
    /// Leave the trace at `pc`
    Exit { pc: Pc },
}

impl InstKind {
    /// Opcode mnemonic
    pub fn opcode(&self) -> String {
        let name: &str = match self {
            InstKind::StackAdjust => "StackAdjust",
            InstKind::StackPop { .. } => "StackPop",
            InstKind::LoadSelf => "LoadSelf",
            InstKind::LoadBlock => "LoadBlock",
            InstKind::LoadSelfAsBlock { .. } => "LoadSelfAsBlock",
            InstKind::LoadConst(c) => c.opcode(),
            InstKind::EnvLoad { .. } => "EnvLoad",
            InstKind::EnvStore { .. } => "EnvStore",
            InstKind::GetPropertyName { .. } => "GetPropertyName",
            InstKind::SetPropertyName { .. } => "SetPropertyName",
            InstKind::GetGlobal { .. } => "GetGlobal",
            InstKind::SetGlobal { .. } => "SetGlobal",
            InstKind::AllocArray(_) => "AllocArray",
            InstKind::AllocHash(_) => "AllocHash",
            InstKind::AllocRange { .. } => "AllocRange",
            InstKind::AllocString(_) => "AllocString",
            InstKind::AllocObject { .. } => "AllocObject",
            InstKind::StringConcat(_) => "StringConcat",
            InstKind::GuardType { check, .. } => check.opcode(),
            InstKind::GuardProperty { .. } => "GuardProperty",
            InstKind::GuardMethodCache { .. } => "GuardMethodCache",
            InstKind::GuardMethodRedefine { .. } => "GuardMethodRedefine",
            InstKind::GuardBlockEqual { .. } => "GuardBlockEqual",
            InstKind::FixnumArith { op, .. } => {
                return format!("Fixnum{}Overflow", arith_name(*op));
            }
            InstKind::FixnumCmp { op, .. } => return format!("Fixnum{}", cmp_name(*op)),
            InstKind::FixnumBit { op, .. } => {
                return format!(
                    "Fixnum{}",
                    match op {
                        BitOp::And => "And",
                        BitOp::Or => "Or",
                        BitOp::Xor => "Xor",
                        BitOp::Lshift => "Lshift",
                        BitOp::Rshift => "Rshift",
                    }
                );
            }
            InstKind::FixnumComplement(_) => "FixnumComplement",
            InstKind::FixnumToFloat(_) => "FixnumToFloat",
            InstKind::FloatArith { op, .. } => return format!("Float{}", arith_name(*op)),
            InstKind::FloatCmp { op, .. } => return format!("Float{}", cmp_name(*op)),
            InstKind::FloatToFixnum(_) => "FloatToFixnum",
            InstKind::StringToFloat(_) => "StringToFloat",
            InstKind::Math { func, .. } => return format!("Math{:?}", func),
            InstKind::Length { of, .. } => return format!("{}Length", of.name()),
            InstKind::EmptyP { of, .. } => return format!("{}EmptyP", of.name()),
            InstKind::ArrayGet { .. } => "ArrayGet",
            InstKind::ArraySet { .. } => "ArraySet",
            InstKind::HashGet { .. } => "HashGet",
            InstKind::HashSet { .. } => "HashSet",
            InstKind::RegExpMatch { .. } => "RegExpMatch",
            InstKind::InvokeMethod { .. } => "InvokeMethod",
            InstKind::InvokeNative { .. } => "InvokeNative",
            InstKind::FramePush { .. } => "FramePush",
            InstKind::FramePop => "FramePop",
            InstKind::PatternMatch { .. } => "PatternMatch",
            InstKind::PatternMatchRange { .. } => "PatternMatchRange",
            InstKind::Trace { .. } => "Trace",
            InstKind::Jump { .. } => "Jump",
            InstKind::Exit { .. } => "Exit",
        };
        name.to_string()
    }

    /// Registers read by this instruction
    pub fn operands(&self) -> Vec<InstId> {
        use InstKind::*;
        match self {
            StackAdjust | StackPop { .. } | LoadSelf | LoadBlock | LoadSelfAsBlock { .. }
            | LoadConst(_) | EnvLoad { .. } | GuardMethodRedefine { .. } | FramePop
            | Trace { .. } | Jump { .. } | Exit { .. } => Vec::new(),
            EnvStore { value, .. } => vec![*value],
            GetPropertyName { recv, .. } => vec![*recv],
            SetPropertyName { recv, value, .. } => vec![*recv, *value],
            GetGlobal { name } => vec![*name],
            SetGlobal { name, value } => vec![*name, *value],
            AllocArray(items) | AllocHash(items) | StringConcat(items) => items.clone(),
            AllocRange { low, high, .. } => vec![*low, *high],
            AllocString(v)
            | FixnumComplement(v)
            | FixnumToFloat(v)
            | FloatToFixnum(v)
            | StringToFloat(v) => vec![*v],
            AllocObject { klass, args } => std::iter::once(*klass).chain(args.iter().copied()).collect(),
            GuardType { value, .. } => vec![*value],
            GuardProperty { recv, .. } | GuardMethodCache { recv, .. } => vec![*recv],
            GuardBlockEqual { block, .. } => vec![*block],
            FixnumArith { lhs, rhs, .. }
            | FixnumCmp { lhs, rhs, .. }
            | FixnumBit { lhs, rhs, .. }
            | FloatArith { lhs, rhs, .. }
            | FloatCmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Math { arg, .. } => vec![*arg],
            Length { value, .. } | EmptyP { value, .. } => vec![*value],
            ArrayGet { recv, index } => vec![*recv, *index],
            ArraySet { recv, index, value } => vec![*recv, *index, *value],
            HashGet { recv, key } => vec![*recv, *key],
            HashSet { recv, key, value } => vec![*recv, *key, *value],
            RegExpMatch { regexp, target } => vec![*regexp, *target],
            InvokeMethod { recv, args, block, .. } => std::iter::once(*recv)
                .chain(args.iter().copied())
                .chain(block.iter().copied())
                .collect(),
            InvokeNative { recv, args, .. } => {
                std::iter::once(*recv).chain(args.iter().copied()).collect()
            }
            FramePush { block, argv, .. } => argv.iter().copied().chain(block.iter().copied()).collect(),
            PatternMatch { pattern, target, .. } | PatternMatchRange { pattern, target, .. } => {
                vec![*pattern, *target]
            }
        }
    }

    pub fn is_guard(&self) -> bool {
        matches!(
            self,
            InstKind::GuardType { .. }
                | InstKind::GuardProperty { .. }
                | InstKind::GuardMethodCache { .. }
                | InstKind::GuardMethodRedefine { .. }
                | InstKind::GuardBlockEqual { .. }
        )
    }

    /// Ends a basic block
    pub fn is_terminator(&self) -> bool {
        matches!(self, InstKind::Jump { .. } | InstKind::Exit { .. })
    }

    /// Program counter this instruction may leave the trace at
    pub fn exit_pc(&self) -> Option<Pc> {
        match self {
            InstKind::GuardType { exit, .. }
            | InstKind::GuardProperty { exit, .. }
            | InstKind::GuardMethodCache { exit, .. }
            | InstKind::GuardMethodRedefine { exit, .. }
            | InstKind::GuardBlockEqual { exit, .. }
            | InstKind::FixnumArith { exit, .. } => Some(*exit),
            InstKind::Exit { pc } => Some(*pc),
            _ => None,
        }
    }

    /// Whether the instruction does anything besides producing its value
    /// (stores, calls, frame changes, possible exits)
    pub fn has_side_effect(&self) -> bool {
        use InstKind::*;
        match self {
            StackPop { .. } | LoadSelf | LoadBlock | LoadSelfAsBlock { .. } | LoadConst(_)
            | EnvLoad { .. } | GetPropertyName { .. } | GetGlobal { .. } | AllocArray(_)
            | AllocHash(_) | AllocRange { .. } | AllocString(_) | FixnumCmp { .. }
            | FixnumBit { .. } | FixnumComplement(_) | FixnumToFloat(_) | FloatArith { .. }
            | FloatCmp { .. } | StringToFloat(_) | Math { .. } | Length { .. } | EmptyP { .. }
            | ArrayGet { .. } | HashGet { .. } | RegExpMatch { .. } => false,
            FixnumArith { op, .. } => matches!(op, ArithOp::Div | ArithOp::Mod),
            // RangeError on non-finite floats
            FloatToFixnum(_) => true,
            _ => true,
        }
    }

    /// Constant payload of a `LoadConst*`
    pub fn as_const(&self) -> Option<&Constant> {
        match self {
            InstKind::LoadConst(c) => Some(c),
            _ => None,
        }
    }
}

fn arith_name(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "Add",
        ArithOp::Sub => "Sub",
        ArithOp::Mul => "Mul",
        ArithOp::Div => "Div",
        ArithOp::Mod => "Mod",
    }
}

fn cmp_name(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "Eq",
        CmpOp::Ne => "Ne",
        CmpOp::Lt => "Lt",
        CmpOp::Le => "Le",
        CmpOp::Gt => "Gt",
        CmpOp::Ge => "Ge",
    }
}

/// An instruction in the arena
#[derive(Debug, Clone)]
pub struct Inst {
    pub id: InstId,
    pub kind: InstKind,
    /// Owning block; `None` once removed (or never placed)
    pub block: Option<BlockId>,
    /// Bytecode instruction being recorded when this was emitted
    pub pc: Pc,
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.id, self.kind.opcode())?;
        match &self.kind {
            InstKind::StackPop { depth } => write!(f, " {}", depth)?,
            InstKind::LoadSelfAsBlock { iseq } => write!(f, " iseq#{}", iseq.0)?,
            InstKind::LoadConst(c) => write!(f, " {}", c)?,
            InstKind::EnvLoad { level, idx } => write!(f, " {} {}", idx, level)?,
            InstKind::EnvStore { level, idx, value } => write!(f, " {} {} {}", idx, level, value)?,
            InstKind::GetPropertyName { recv, index } => write!(f, " {} @{}", recv, index)?,
            InstKind::SetPropertyName { recv, index, value } => {
                write!(f, " {} @{} {}", recv, index, value)?
            }
            InstKind::AllocRange { low, high, exclusive } => {
                write!(f, " {} {} {}", low, high, if *exclusive { "..." } else { ".." })?
            }
            InstKind::GuardMethodRedefine { class, op, .. } => {
                write!(f, " class#{} {}", class.0, op)?
            }
            InstKind::GuardBlockEqual { block, iseq, .. } => write!(f, " {} iseq#{}", block, iseq.0)?,
            InstKind::InvokeNative { func, .. } => {
                write!(f, " {:?}", func)?;
                for op in self.kind.operands() {
                    write!(f, " {}", op)?;
                }
            }
            InstKind::FramePush { iseq, frame, return_pc, .. } => {
                write!(f, " {:?} iseq#{} ret={}", frame, iseq.0, return_pc)?;
                for op in self.kind.operands() {
                    write!(f, " {}", op)?;
                }
            }
            InstKind::Trace { event } => write!(f, " {}", event)?,
            InstKind::Jump { target, block } => match block {
                Some(b) => write!(f, " {} ({})", b, target)?,
                None => write!(f, " {}", target)?,
            },
            kind => {
                for op in kind.operands() {
                    write!(f, " {}", op)?;
                }
            }
        }
        if let Some(exit) = self.kind.exit_pc() {
            if !matches!(self.kind, InstKind::Exit { .. }) {
                write!(f, " exit={}", exit)?;
            } else {
                write!(f, " {}", exit)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(id: u32, kind: InstKind) -> Inst {
        Inst {
            id: InstId(id),
            kind,
            block: None,
            pc: Pc(0),
        }
    }

    #[test]
    fn test_opcode_names() {
        let add = InstKind::FixnumArith {
            op: ArithOp::Add,
            lhs: InstId(1),
            rhs: InstId(2),
            exit: Pc(4),
        };
        assert_eq!(add.opcode(), "FixnumAddOverflow");
        let guard = InstKind::GuardType {
            check: TypeCheck::Fixnum,
            value: InstId(1),
            exit: Pc(4),
        };
        assert_eq!(guard.opcode(), "GuardTypeFixnum");
        assert_eq!(InstKind::LoadConst(Constant::Fixnum(3)).opcode(), "LoadConstFixnum");
        assert_eq!(
            InstKind::Math { func: MathFn::Sqrt, arg: InstId(0) }.opcode(),
            "MathSqrt"
        );
        assert_eq!(
            InstKind::Length { of: Container::Hash, value: InstId(0) }.opcode(),
            "HashLength"
        );
    }

    #[test]
    fn test_display() {
        let add = inst(
            3,
            InstKind::FixnumArith {
                op: ArithOp::Add,
                lhs: InstId(1),
                rhs: InstId(2),
                exit: Pc(4),
            },
        );
        assert_eq!(add.to_string(), "v3 = FixnumAddOverflow v1 v2 exit=0004");
        let exit = inst(9, InstKind::Exit { pc: Pc(12) });
        assert_eq!(exit.to_string(), "v9 = Exit 0012");
        let load = inst(1, InstKind::LoadConst(Constant::Fixnum(7)));
        assert_eq!(load.to_string(), "v1 = LoadConstFixnum 7");
    }

    #[test]
    fn test_classification() {
        let guard = InstKind::GuardType {
            check: TypeCheck::NonNil,
            value: InstId(0),
            exit: Pc(0),
        };
        assert!(guard.is_guard());
        assert!(guard.has_side_effect());
        assert!(!InstKind::LoadSelf.has_side_effect());
        assert!(InstKind::Exit { pc: Pc(0) }.is_terminator());
        let div = InstKind::FixnumArith {
            op: ArithOp::Div,
            lhs: InstId(0),
            rhs: InstId(1),
            exit: Pc(0),
        };
        assert!(div.has_side_effect());
    }

    #[test]
    fn test_type_checks() {
        assert!(TypeCheck::Nil.test(&Value::False));
        assert!(!TypeCheck::Nil.test(&Value::Fixnum(0)));
        assert!(TypeCheck::NonNil.test(&Value::Fixnum(0)));
        assert!(TypeCheck::SpecialConst.test(&Value::string("x")));
        assert!(!TypeCheck::SpecialConst.test(&Value::Fixnum(1)));
        assert!(TypeCheck::Math.test(&Value::Class(ClassId::MATH)));
    }

    #[test]
    fn test_operands() {
        let call = InstKind::InvokeNative {
            func: NativeFn::AryDup,
            recv: InstId(4),
            args: vec![InstId(5)],
        };
        assert_eq!(call.operands(), vec![InstId(4), InstId(5)]);
        assert!(InstKind::FramePop.operands().is_empty());
    }
}
