//! VM type definitions
//!
//! Frames, environments and blocks.

use crate::bytecode::Pc;
use crate::runtime::class::IseqId;
use crate::runtime::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Shared, mutable local-variable environment
pub type EnvRef = Rc<RefCell<Env>>;

/// Local variables of one frame, chained to the defining frame's
/// environment for blocks
#[derive(Debug)]
pub struct Env {
    pub locals: Vec<Value>,
    pub parent: Option<EnvRef>,
}

impl Env {
    pub fn new(locals: usize, parent: Option<EnvRef>) -> EnvRef {
        Rc::new(RefCell::new(Env {
            locals: vec![Value::Nil; locals],
            parent,
        }))
    }
}

/// A block: code plus the `self` and environment it closes over
pub struct Block {
    pub iseq: IseqId,
    pub self_value: Value,
    pub env: EnvRef,
    /// Block of the frame that created this block (target of `yield`
    /// inside the block body)
    pub outer_block: Option<Rc<Block>>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block").field("iseq", &self.iseq).finish()
    }
}

/// What a frame is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Top,
    Method,
    Block,
}

/// A call frame on the call stack
#[derive(Debug, Clone)]
pub struct Frame {
    pub iseq: IseqId,
    /// Next instruction to execute (for callers: the return point)
    pub pc: Pc,
    pub self_value: Value,
    pub env: EnvRef,
    /// Block passed to this frame
    pub block: Option<Rc<Block>>,
    /// Operand-stack height when the frame was entered
    pub sp_base: usize,
    /// Receiver and arguments left on the caller's stack, popped on return
    pub stack_args: usize,
    pub kind: FrameKind,
    /// Returning from this frame hands the value back to native code
    pub finish: bool,
}
