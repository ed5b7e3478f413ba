//! What the recorder needs from the interpreter
//!
//! The recorder runs before the interpreter executes each instruction, so
//! every query sees the machine state the instruction is about to consume.
//! Lookups that fill interpreter caches (`search_method`, `ivar_slot`,
//! `literal`) fill them exactly as executing the instruction would.

use crate::bytecode::{Insn, Pc};
use crate::error::CodeLocation;
use crate::runtime::class::{BasicOp, ClassId, IseqId};
use crate::runtime::intern::Sym;
use crate::runtime::value::Value;
use crate::runtime::vm::{Block, CallCache, IvarCache};
use std::rc::Rc;

pub trait Host {
    /// Instruction at `pc`
    fn fetch(&self, pc: Pc) -> Option<Insn>;

    /// Operand `n` slots below the top of the stack
    fn topn(&self, n: usize) -> Option<Value>;

    fn self_value(&self) -> Value;

    /// Block passed to the current frame
    fn current_block(&self) -> Option<Rc<Block>>;

    /// Whether `leave` in the current frame returns into native code
    fn returns_to_native(&self) -> bool;

    fn iseq_at(&self, pc: Pc) -> Option<IseqId>;

    fn iseq_by_name(&self, name: &str) -> Option<IseqId>;

    /// Declared parameter count of `iseq`
    fn iseq_params(&self, iseq: IseqId) -> u32;

    /// Resolve a call the way the call site at `pc` would
    fn search_method(&mut self, pc: Pc, mid: &str, argc: u32, recv: &Value) -> Option<CallCache>;

    /// Resolve an instance-variable slot the way the instruction at `pc`
    /// would
    fn ivar_slot(&mut self, pc: Pc, recv: &Value, name: Sym, define: bool) -> Option<IvarCache>;

    /// Valid cached constant of the `getinlinecache` at `pc`
    fn constant_cache(&self, pc: Pc) -> Option<Value>;

    /// Literal object of the instruction at `pc`
    fn literal(&mut self, pc: Pc) -> Option<Value>;

    fn basic_op_unredefined(&self, op: BasicOp, class: ClassId) -> bool;

    fn class_of(&self, value: &Value) -> ClassId;

    fn intern(&mut self, name: &str) -> Sym;

    /// `iseq:line` of `pc`, for diagnostics
    fn location(&self, pc: Pc) -> CodeLocation;
}
