//! Instruction set of the host interpreter
//!
//! The instruction set follows YARV: a stack machine with local variables in
//! environments, method calls described by call info, and specialized
//! `opt_*` instructions for basic operators that fall back to a regular
//! method call when the operand types are not the expected builtins.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of one instruction in the interpreter's loaded code space
///
/// Every instruction occupies one address unit. Branch offsets are relative
/// to the address of the following instruction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Pc(pub u32);

impl Pc {
    pub const fn new(addr: u32) -> Self {
        Pc(addr)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Address of the following instruction
    pub fn next(self) -> Pc {
        Pc(self.0.wrapping_add(1))
    }

    /// Address `offset` units away (may be negative)
    pub fn offset(self, offset: i32) -> Pc {
        Pc((self.0 as i64 + offset as i64) as u32)
    }

    /// Branch target of a relative jump at this address
    pub fn branch_target(self, offset: i32) -> Pc {
        self.next().offset(offset)
    }
}

impl fmt::Display for Pc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

bitflags! {
    /// Call-site flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CallFlags: u8 {
        /// `f(*args)`
        const ARGS_SPLAT = 1;
        /// `f(&blk)`
        const ARGS_BLOCKARG = 1 << 1;
        /// Receiver omitted (`foo(1)`)
        const FCALL = 1 << 2;
        /// Bare identifier call (`foo`)
        const VCALL = 1 << 3;
    }
}

/// Static description of a call site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    /// Method name
    pub mid: String,
    /// Number of arguments (receiver excluded)
    pub argc: u32,
    #[serde(default)]
    pub flags: CallFlags,
    /// Name of the block sequence passed with the call
    #[serde(default)]
    pub block: Option<String>,
}

impl CallInfo {
    pub fn new(mid: impl Into<String>, argc: u32) -> Self {
        Self {
            mid: mid.into(),
            argc,
            flags: CallFlags::empty(),
            block: None,
        }
    }

    pub fn with_block(mut self, block: impl Into<String>) -> Self {
        self.block = Some(block.into());
        self
    }

    pub fn with_flags(mut self, flags: CallFlags) -> Self {
        self.flags |= flags;
        self
    }
}

impl fmt::Display for CallInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<callinfo!mid:{}, argc:{}", self.mid, self.argc)?;
        if let Some(block) = &self.block {
            write!(f, ", block:{}", block)?;
        }
        if !self.flags.is_empty() {
            write!(f, ", {:?}", self.flags)?;
        }
        write!(f, ">")
    }
}

/// Literal operand of `putobject` / `duparray`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Nil,
    True,
    False,
    Int(i64),
    Float(f64),
    Str(String),
    Sym(String),
    Regexp(String),
    Array(Vec<Literal>),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Nil => write!(f, "nil"),
            Literal::True => write!(f, "true"),
            Literal::False => write!(f, "false"),
            Literal::Int(n) => write!(f, "{}", n),
            Literal::Float(x) => write!(f, "{:?}", x),
            Literal::Str(s) => write!(f, "{:?}", s),
            Literal::Sym(s) => write!(f, ":{}", s),
            Literal::Regexp(s) => write!(f, "/{}/", s),
            Literal::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Flavour of `checkmatch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMatchKind {
    /// `when` clause of a `case` without subject
    When,
    /// `when` clause of a `case` with subject (`pattern === target`)
    Case,
    /// `rescue` clause
    Rescue,
}

/// One host instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Insn {
    Nop,

    // ==================== Variables ====================
    GetLocal { idx: u32, level: u32 },
    SetLocal { idx: u32, level: u32 },
    GetInstanceVariable { name: String },
    SetInstanceVariable { name: String },
    GetClassVariable { name: String },
    SetClassVariable { name: String },
    GetConstant { name: String },
    SetConstant { name: String },
    GetGlobal { name: String },
    SetGlobal { name: String },

    // ==================== Literals ====================
    PutNil,
    PutSelf,
    PutObject { value: Literal },
    PutString { value: String },
    ConcatStrings { count: u32 },
    ToString,
    ToRegexp { count: u32 },
    NewArray { count: u32 },
    DupArray { value: Vec<Literal> },
    NewHash { count: u32 },
    NewRange { exclusive: bool },

    // ==================== Stack ====================
    Pop,
    Dup,
    DupN { n: u32 },
    Swap,
    Reput,
    TopN { n: u32 },
    SetN { n: u32 },
    AdjustStack { n: u32 },

    // ==================== Misc ====================
    CheckMatch { kind: CheckMatchKind, array: bool },
    Trace { event: u32 },

    // ==================== Calls ====================
    Send { ci: CallInfo },
    OptSendSimple { ci: CallInfo },
    OptStrFreeze { value: String },
    InvokeBlock { ci: CallInfo },
    Leave,
    Throw,

    // ==================== Control flow ====================
    Jump { offset: i32 },
    BranchIf { offset: i32 },
    BranchUnless { offset: i32 },
    GetInlineCache { offset: i32, slot: u32 },
    SetInlineCache { slot: u32 },

    // ==================== Specialized operators ====================
    OptPlus,
    OptMinus,
    OptMult,
    OptDiv,
    OptMod,
    OptEq,
    OptNeq,
    OptLt,
    OptLe,
    OptGt,
    OptGe,
    OptLtLt,
    OptAref,
    OptAset,
    OptArefWith { key: String },
    OptAsetWith { key: String },
    OptLength,
    OptSize,
    OptEmptyP,
    OptSucc,
    OptNot,
    OptRegexpMatch1 { pattern: String },
    OptRegexpMatch2,
}

impl Insn {
    /// YARV mnemonic
    pub fn name(&self) -> &'static str {
        match self {
            Insn::Nop => "nop",
            Insn::GetLocal { .. } => "getlocal",
            Insn::SetLocal { .. } => "setlocal",
            Insn::GetInstanceVariable { .. } => "getinstancevariable",
            Insn::SetInstanceVariable { .. } => "setinstancevariable",
            Insn::GetClassVariable { .. } => "getclassvariable",
            Insn::SetClassVariable { .. } => "setclassvariable",
            Insn::GetConstant { .. } => "getconstant",
            Insn::SetConstant { .. } => "setconstant",
            Insn::GetGlobal { .. } => "getglobal",
            Insn::SetGlobal { .. } => "setglobal",
            Insn::PutNil => "putnil",
            Insn::PutSelf => "putself",
            Insn::PutObject { .. } => "putobject",
            Insn::PutString { .. } => "putstring",
            Insn::ConcatStrings { .. } => "concatstrings",
            Insn::ToString => "tostring",
            Insn::ToRegexp { .. } => "toregexp",
            Insn::NewArray { .. } => "newarray",
            Insn::DupArray { .. } => "duparray",
            Insn::NewHash { .. } => "newhash",
            Insn::NewRange { .. } => "newrange",
            Insn::Pop => "pop",
            Insn::Dup => "dup",
            Insn::DupN { .. } => "dupn",
            Insn::Swap => "swap",
            Insn::Reput => "reput",
            Insn::TopN { .. } => "topn",
            Insn::SetN { .. } => "setn",
            Insn::AdjustStack { .. } => "adjuststack",
            Insn::CheckMatch { .. } => "checkmatch",
            Insn::Trace { .. } => "trace",
            Insn::Send { .. } => "send",
            Insn::OptSendSimple { .. } => "opt_send_simple",
            Insn::OptStrFreeze { .. } => "opt_str_freeze",
            Insn::InvokeBlock { .. } => "invokeblock",
            Insn::Leave => "leave",
            Insn::Throw => "throw",
            Insn::Jump { .. } => "jump",
            Insn::BranchIf { .. } => "branchif",
            Insn::BranchUnless { .. } => "branchunless",
            Insn::GetInlineCache { .. } => "getinlinecache",
            Insn::SetInlineCache { .. } => "setinlinecache",
            Insn::OptPlus => "opt_plus",
            Insn::OptMinus => "opt_minus",
            Insn::OptMult => "opt_mult",
            Insn::OptDiv => "opt_div",
            Insn::OptMod => "opt_mod",
            Insn::OptEq => "opt_eq",
            Insn::OptNeq => "opt_neq",
            Insn::OptLt => "opt_lt",
            Insn::OptLe => "opt_le",
            Insn::OptGt => "opt_gt",
            Insn::OptGe => "opt_ge",
            Insn::OptLtLt => "opt_ltlt",
            Insn::OptAref => "opt_aref",
            Insn::OptAset => "opt_aset",
            Insn::OptArefWith { .. } => "opt_aref_with",
            Insn::OptAsetWith { .. } => "opt_aset_with",
            Insn::OptLength => "opt_length",
            Insn::OptSize => "opt_size",
            Insn::OptEmptyP => "opt_empty_p",
            Insn::OptSucc => "opt_succ",
            Insn::OptNot => "opt_not",
            Insn::OptRegexpMatch1 { .. } => "opt_regexpmatch1",
            Insn::OptRegexpMatch2 => "opt_regexpmatch2",
        }
    }

    /// `branchif` with a negative offset: the back edge of a loop
    pub fn is_backward_branch(&self) -> bool {
        matches!(self, Insn::BranchIf { offset } if *offset < 0)
    }

    /// Relative offset of a control-flow instruction
    pub fn branch_offset(&self) -> Option<i32> {
        match self {
            Insn::Jump { offset }
            | Insn::BranchIf { offset }
            | Insn::BranchUnless { offset }
            | Insn::GetInlineCache { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    /// Call info of a generic call instruction
    pub fn call_info(&self) -> Option<&CallInfo> {
        match self {
            Insn::Send { ci } | Insn::OptSendSimple { ci } | Insn::InvokeBlock { ci } => Some(ci),
            _ => None,
        }
    }

    /// Method name and argument count an `opt_*` instruction dispatches to
    /// when its fast path does not apply
    pub fn basic_call(&self) -> Option<(&'static str, u32)> {
        let call = match self {
            Insn::OptPlus => ("+", 1),
            Insn::OptMinus => ("-", 1),
            Insn::OptMult => ("*", 1),
            Insn::OptDiv => ("/", 1),
            Insn::OptMod => ("%", 1),
            Insn::OptEq => ("==", 1),
            Insn::OptNeq => ("!=", 1),
            Insn::OptLt => ("<", 1),
            Insn::OptLe => ("<=", 1),
            Insn::OptGt => (">", 1),
            Insn::OptGe => (">=", 1),
            Insn::OptLtLt => ("<<", 1),
            Insn::OptAref | Insn::OptArefWith { .. } => ("[]", 1),
            Insn::OptAset | Insn::OptAsetWith { .. } => ("[]=", 2),
            Insn::OptLength => ("length", 0),
            Insn::OptSize => ("size", 0),
            Insn::OptEmptyP => ("empty?", 0),
            Insn::OptSucc => ("succ", 0),
            Insn::OptNot => ("!", 0),
            Insn::OptRegexpMatch2 => ("=~", 1),
            _ => return None,
        };
        Some(call)
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        match self {
            Insn::GetLocal { idx, level } | Insn::SetLocal { idx, level } => {
                write!(f, "{:<20} {}, {}", name, idx, level)
            }
            Insn::GetInstanceVariable { name: n }
            | Insn::SetInstanceVariable { name: n }
            | Insn::GetClassVariable { name: n }
            | Insn::SetClassVariable { name: n }
            | Insn::GetConstant { name: n }
            | Insn::SetConstant { name: n }
            | Insn::GetGlobal { name: n }
            | Insn::SetGlobal { name: n } => write!(f, "{:<20} :{}", name, n),
            Insn::PutObject { value } => write!(f, "{:<20} {}", name, value),
            Insn::PutString { value } | Insn::OptStrFreeze { value } => {
                write!(f, "{:<20} {:?}", name, value)
            }
            Insn::ConcatStrings { count }
            | Insn::ToRegexp { count }
            | Insn::NewArray { count }
            | Insn::NewHash { count } => write!(f, "{:<20} {}", name, count),
            Insn::DupArray { value } => write!(f, "{:<20} {}", name, Literal::Array(value.clone())),
            Insn::NewRange { exclusive } => write!(f, "{:<20} {}", name, u8::from(*exclusive)),
            Insn::DupN { n } | Insn::TopN { n } | Insn::SetN { n } | Insn::AdjustStack { n } => {
                write!(f, "{:<20} {}", name, n)
            }
            Insn::CheckMatch { kind, array } => write!(f, "{:<20} {:?}{}", name, kind, if *array { ", array" } else { "" }),
            Insn::Trace { event } => write!(f, "{:<20} {}", name, event),
            Insn::Send { ci } | Insn::OptSendSimple { ci } | Insn::InvokeBlock { ci } => {
                write!(f, "{:<20} {}", name, ci)
            }
            Insn::Jump { offset } | Insn::BranchIf { offset } | Insn::BranchUnless { offset } => {
                write!(f, "{:<20} {:+}", name, offset)
            }
            Insn::GetInlineCache { offset, slot } => write!(f, "{:<20} {:+}, <ic:{}>", name, offset, slot),
            Insn::SetInlineCache { slot } => write!(f, "{:<20} <ic:{}>", name, slot),
            Insn::OptArefWith { key } | Insn::OptAsetWith { key } => write!(f, "{:<20} {:?}", name, key),
            Insn::OptRegexpMatch1 { pattern } => write!(f, "{:<20} /{}/", name, pattern),
            _ => write!(f, "{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_target() {
        let pc = Pc(10);
        assert_eq!(pc.branch_target(-5), Pc(6));
        assert_eq!(pc.branch_target(3), Pc(14));
        assert_eq!(pc.next(), Pc(11));
    }

    #[test]
    fn test_backward_branch_detection() {
        assert!(Insn::BranchIf { offset: -4 }.is_backward_branch());
        assert!(!Insn::BranchIf { offset: 4 }.is_backward_branch());
        assert!(!Insn::BranchUnless { offset: -4 }.is_backward_branch());
        assert!(!Insn::Jump { offset: -4 }.is_backward_branch());
    }

    #[test]
    fn test_basic_call_fallbacks() {
        assert_eq!(Insn::OptPlus.basic_call(), Some(("+", 1)));
        assert_eq!(Insn::OptAset.basic_call(), Some(("[]=", 2)));
        assert_eq!(Insn::OptEmptyP.basic_call(), Some(("empty?", 0)));
        assert_eq!(Insn::Pop.basic_call(), None);
    }

    #[test]
    fn test_json_shape() {
        let insn = Insn::GetLocal { idx: 1, level: 0 };
        let json = serde_json::to_string(&insn).unwrap();
        assert_eq!(json, r#"{"get_local":{"idx":1,"level":0}}"#);
        let back: Insn = serde_json::from_str(r#""opt_plus""#).unwrap();
        assert_eq!(back, Insn::OptPlus);
    }

    #[test]
    fn test_display() {
        let send = Insn::Send {
            ci: CallInfo::new("foo", 2).with_block("blk"),
        };
        assert_eq!(
            send.to_string(),
            format!("{:<20} <callinfo!mid:foo, argc:2, block:blk>", "send")
        );
        assert_eq!(Insn::Leave.to_string(), "leave");
    }
}
