//! Label-aware instruction sequence builder
//!
//! ```
//! use quicktrace::bytecode::{IseqBuilder, IseqKind};
//!
//! let mut b = IseqBuilder::new("count", IseqKind::Top).locals(1);
//! b.putobject_int(0).setlocal(0, 0);
//! b.label("loop");
//! b.getlocal(0, 0).putobject_int(1).opt_plus().setlocal(0, 0);
//! b.getlocal(0, 0).putobject_int(10).opt_lt().branchif("loop");
//! b.getlocal(0, 0).leave();
//! let iseq = b.build().unwrap();
//! assert_eq!(iseq.code.len(), 12);
//! ```

use super::insn::{CallInfo, CheckMatchKind, Insn, Literal};
use super::iseq::{Iseq, IseqKind};
use crate::error::{Error, Result};
use rustc_hash::FxHashMap as HashMap;

#[derive(Debug, Clone, Copy)]
enum BranchKind {
    Jump,
    BranchIf,
    BranchUnless,
    GetInlineCache(u32),
}

/// Builds an [`Iseq`], resolving symbolic labels to relative offsets
#[derive(Debug)]
pub struct IseqBuilder {
    iseq: Iseq,
    labels: HashMap<String, usize>,
    fixups: Vec<(usize, BranchKind, String)>,
    line: u32,
}

impl IseqBuilder {
    pub fn new(name: impl Into<String>, kind: IseqKind) -> Self {
        Self {
            iseq: Iseq::new(name, kind),
            labels: HashMap::default(),
            fixups: Vec::new(),
            line: 0,
        }
    }

    /// Number of locals (parameters included)
    pub fn locals(mut self, locals: u32) -> Self {
        self.iseq.locals = locals;
        self
    }

    /// Number of parameters
    pub fn params(mut self, params: u32) -> Self {
        self.iseq.params = params;
        if self.iseq.locals < params {
            self.iseq.locals = params;
        }
        self
    }

    /// Source line attached to the following instructions
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    /// Offset the next instruction will get
    pub fn position(&self) -> usize {
        self.iseq.code.len()
    }

    pub fn emit(&mut self, insn: Insn) -> &mut Self {
        self.iseq.code.push(insn);
        self.iseq.lines.push(self.line);
        self
    }

    /// Define `name` at the current position
    pub fn label(&mut self, name: &str) -> &mut Self {
        self.labels.insert(name.to_string(), self.position());
        self
    }

    fn branch(&mut self, kind: BranchKind, label: &str) -> &mut Self {
        self.fixups.push((self.position(), kind, label.to_string()));
        let placeholder = match kind {
            BranchKind::Jump => Insn::Jump { offset: 0 },
            BranchKind::BranchIf => Insn::BranchIf { offset: 0 },
            BranchKind::BranchUnless => Insn::BranchUnless { offset: 0 },
            BranchKind::GetInlineCache(slot) => Insn::GetInlineCache { offset: 0, slot },
        };
        self.emit(placeholder)
    }

    pub fn jump(&mut self, label: &str) -> &mut Self {
        self.branch(BranchKind::Jump, label)
    }

    pub fn branchif(&mut self, label: &str) -> &mut Self {
        self.branch(BranchKind::BranchIf, label)
    }

    pub fn branchunless(&mut self, label: &str) -> &mut Self {
        self.branch(BranchKind::BranchUnless, label)
    }

    /// `getinlinecache` jumping to `label` when the cache is valid
    pub fn getinlinecache(&mut self, label: &str, slot: u32) -> &mut Self {
        self.branch(BranchKind::GetInlineCache(slot), label)
    }

    // ---- Shorthands ----

    pub fn nop(&mut self) -> &mut Self {
        self.emit(Insn::Nop)
    }

    pub fn getlocal(&mut self, idx: u32, level: u32) -> &mut Self {
        self.emit(Insn::GetLocal { idx, level })
    }

    pub fn setlocal(&mut self, idx: u32, level: u32) -> &mut Self {
        self.emit(Insn::SetLocal { idx, level })
    }

    pub fn getivar(&mut self, name: &str) -> &mut Self {
        self.emit(Insn::GetInstanceVariable { name: name.into() })
    }

    pub fn setivar(&mut self, name: &str) -> &mut Self {
        self.emit(Insn::SetInstanceVariable { name: name.into() })
    }

    pub fn getglobal(&mut self, name: &str) -> &mut Self {
        self.emit(Insn::GetGlobal { name: name.into() })
    }

    pub fn setglobal(&mut self, name: &str) -> &mut Self {
        self.emit(Insn::SetGlobal { name: name.into() })
    }

    pub fn getconstant(&mut self, name: &str) -> &mut Self {
        self.emit(Insn::GetConstant { name: name.into() })
    }

    pub fn setconstant(&mut self, name: &str) -> &mut Self {
        self.emit(Insn::SetConstant { name: name.into() })
    }

    pub fn putnil(&mut self) -> &mut Self {
        self.emit(Insn::PutNil)
    }

    pub fn putself(&mut self) -> &mut Self {
        self.emit(Insn::PutSelf)
    }

    pub fn putobject(&mut self, value: Literal) -> &mut Self {
        self.emit(Insn::PutObject { value })
    }

    pub fn putobject_int(&mut self, value: i64) -> &mut Self {
        self.putobject(Literal::Int(value))
    }

    pub fn putobject_float(&mut self, value: f64) -> &mut Self {
        self.putobject(Literal::Float(value))
    }

    pub fn putstring(&mut self, value: &str) -> &mut Self {
        self.emit(Insn::PutString { value: value.into() })
    }

    pub fn newarray(&mut self, count: u32) -> &mut Self {
        self.emit(Insn::NewArray { count })
    }

    pub fn newhash(&mut self, count: u32) -> &mut Self {
        self.emit(Insn::NewHash { count })
    }

    pub fn newrange(&mut self, exclusive: bool) -> &mut Self {
        self.emit(Insn::NewRange { exclusive })
    }

    pub fn checkmatch(&mut self, kind: CheckMatchKind, array: bool) -> &mut Self {
        self.emit(Insn::CheckMatch { kind, array })
    }

    pub fn pop(&mut self) -> &mut Self {
        self.emit(Insn::Pop)
    }

    pub fn dup(&mut self) -> &mut Self {
        self.emit(Insn::Dup)
    }

    pub fn swap(&mut self) -> &mut Self {
        self.emit(Insn::Swap)
    }

    pub fn send(&mut self, mid: &str, argc: u32) -> &mut Self {
        self.emit(Insn::Send {
            ci: CallInfo::new(mid, argc),
        })
    }

    pub fn send_with_block(&mut self, mid: &str, argc: u32, block: &str) -> &mut Self {
        self.emit(Insn::Send {
            ci: CallInfo::new(mid, argc).with_block(block),
        })
    }

    pub fn send_simple(&mut self, mid: &str, argc: u32) -> &mut Self {
        self.emit(Insn::OptSendSimple {
            ci: CallInfo::new(mid, argc),
        })
    }

    pub fn invokeblock(&mut self, argc: u32) -> &mut Self {
        self.emit(Insn::InvokeBlock {
            ci: CallInfo::new("yield", argc),
        })
    }

    pub fn leave(&mut self) -> &mut Self {
        self.emit(Insn::Leave)
    }

    pub fn opt_plus(&mut self) -> &mut Self {
        self.emit(Insn::OptPlus)
    }

    pub fn opt_minus(&mut self) -> &mut Self {
        self.emit(Insn::OptMinus)
    }

    pub fn opt_mult(&mut self) -> &mut Self {
        self.emit(Insn::OptMult)
    }

    pub fn opt_div(&mut self) -> &mut Self {
        self.emit(Insn::OptDiv)
    }

    pub fn opt_mod(&mut self) -> &mut Self {
        self.emit(Insn::OptMod)
    }

    pub fn opt_lt(&mut self) -> &mut Self {
        self.emit(Insn::OptLt)
    }

    pub fn opt_eq(&mut self) -> &mut Self {
        self.emit(Insn::OptEq)
    }

    pub fn opt_aref(&mut self) -> &mut Self {
        self.emit(Insn::OptAref)
    }

    pub fn opt_aset(&mut self) -> &mut Self {
        self.emit(Insn::OptAset)
    }

    pub fn opt_ltlt(&mut self) -> &mut Self {
        self.emit(Insn::OptLtLt)
    }

    /// Resolve labels and validate the sequence
    pub fn build(mut self) -> Result<Iseq> {
        for (at, kind, label) in std::mem::take(&mut self.fixups) {
            let target = *self.labels.get(&label).ok_or_else(|| {
                Error::bytecode(format!("{}: unknown label {}", self.iseq.name, label))
            })?;
            let offset = target as i32 - (at as i32 + 1);
            self.iseq.code[at] = match kind {
                BranchKind::Jump => Insn::Jump { offset },
                BranchKind::BranchIf => Insn::BranchIf { offset },
                BranchKind::BranchUnless => Insn::BranchUnless { offset },
                BranchKind::GetInlineCache(slot) => Insn::GetInlineCache { offset, slot },
            };
        }
        if self.iseq.lines.iter().all(|&l| l == 0) {
            self.iseq.lines.clear();
        }
        self.iseq.validate()?;
        Ok(self.iseq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backward_label() {
        let mut b = IseqBuilder::new("loop", IseqKind::Top);
        b.label("top").nop().nop().branchif("top");
        let iseq = b.build().unwrap();
        assert_eq!(iseq.code[2], Insn::BranchIf { offset: -3 });
        assert!(iseq.code[2].is_backward_branch());
    }

    #[test]
    fn test_forward_label() {
        let mut b = IseqBuilder::new("fwd", IseqKind::Top);
        b.jump("end").nop().label("end").putnil().leave();
        let iseq = b.build().unwrap();
        assert_eq!(iseq.code[0], Insn::Jump { offset: 1 });
    }

    #[test]
    fn test_unknown_label() {
        let mut b = IseqBuilder::new("bad", IseqKind::Top);
        b.jump("nowhere");
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("unknown label nowhere"));
    }

    #[test]
    fn test_params_raise_locals() {
        let b = IseqBuilder::new("f", IseqKind::Method).params(2);
        let mut b = b;
        b.putnil().leave();
        let iseq = b.build().unwrap();
        assert_eq!(iseq.locals, 2);
        assert!(iseq.lines.is_empty());
    }

    #[test]
    fn test_line_table() {
        let mut b = IseqBuilder::new("lines", IseqKind::Top);
        b.line(1).putnil();
        b.line(2).leave();
        let iseq = b.build().unwrap();
        assert_eq!(iseq.lines, vec![1, 2]);
        assert_eq!(iseq.line_at(1), 2);
    }
}
