//! Register stack
//!
//! Mirrors the interpreter's operand stack while recording, holding IR
//! register ids instead of values. Index 0 is the operand-stack height at
//! trace entry. Negative indices address values that were already on the
//! interpreter's stack when recording started; they are lifted into the
//! trace on first use (the caller supplies the lifting closure, which emits
//! a `StackPop` into the entry block).
//!
//! A shadow call stack remembers, per inlined call, the register-stack
//! height at the call and how many receiver/argument slots the callee
//! consumes on return.

use super::ir::InstId;
use super::trace::TraceError;

/// One inlined call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrame {
    /// Register-stack height when the call was made (arguments included)
    pub base: i32,
    /// Slots below `base` popped when the callee returns
    pub stack_args: u32,
}

#[derive(Debug, Clone)]
pub struct RegStack {
    reserved: usize,
    slots: Vec<Option<InstId>>,
    size: i32,
    bottom: i32,
    calls: Vec<CallFrame>,
}

type StackResult<T> = std::result::Result<T, TraceError>;

impl RegStack {
    pub fn new(reserved: usize) -> Self {
        Self {
            reserved,
            slots: vec![None; reserved + 16],
            size: 0,
            bottom: 0,
            calls: Vec::new(),
        }
    }

    /// Logical height relative to trace entry
    pub fn size(&self) -> i32 {
        self.size
    }

    /// Lowest height touched so far
    pub fn bottom(&self) -> i32 {
        self.bottom
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.size = 0;
        self.bottom = 0;
        self.calls.clear();
    }

    #[inline]
    fn slot_index(&self, idx: i32) -> StackResult<usize> {
        let at = idx + self.reserved as i32;
        if at < 0 {
            return Err(TraceError::RegstackUnderflow);
        }
        Ok(at as usize)
    }

    fn ensure(&mut self, at: usize) {
        if at >= self.slots.len() {
            self.slots.resize((at + 1).next_power_of_two(), None);
        }
    }

    /// Lift every unlifted slot from `idx` up to the entry height and lower
    /// the watermark
    fn touch(&mut self, idx: i32, lift: &mut dyn FnMut(u32) -> InstId) -> StackResult<()> {
        self.slot_index(idx)?;
        for i in idx..self.size.min(0) {
            let at = self.slot_index(i)?;
            if self.slots[at].is_none() {
                self.slots[at] = Some(lift((-i) as u32));
            }
        }
        self.bottom = self.bottom.min(idx);
        Ok(())
    }

    fn read(&self, idx: i32) -> StackResult<InstId> {
        let at = self.slot_index(idx)?;
        self.slots
            .get(at)
            .copied()
            .flatten()
            .ok_or(TraceError::RegstackUnderflow)
    }

    pub fn push(&mut self, reg: InstId) {
        let at = (self.size + self.reserved as i32).max(0) as usize;
        self.ensure(at);
        self.slots[at] = Some(reg);
        self.size += 1;
    }

    pub fn pop(&mut self, lift: &mut dyn FnMut(u32) -> InstId) -> StackResult<InstId> {
        let idx = self.size - 1;
        self.touch(idx, lift)?;
        let reg = self.read(idx)?;
        self.size = idx;
        Ok(reg)
    }

    /// Register `n` slots below the top
    pub fn top(&mut self, n: u32, lift: &mut dyn FnMut(u32) -> InstId) -> StackResult<InstId> {
        let idx = self.size - 1 - n as i32;
        self.touch(idx, lift)?;
        self.read(idx)
    }

    /// Overwrite the slot `n` below the top
    pub fn set(&mut self, n: u32, reg: InstId, lift: &mut dyn FnMut(u32) -> InstId) -> StackResult<()> {
        let idx = self.size - 1 - n as i32;
        self.touch(idx, lift)?;
        let at = self.slot_index(idx)?;
        self.slots[at] = Some(reg);
        Ok(())
    }

    /// Register at logical index `idx` without lifting
    pub fn peek(&self, idx: i32) -> Option<InstId> {
        self.read(idx).ok()
    }

    /// Registers from the watermark to the top, bottom first
    pub fn live(&self) -> StackResult<Vec<InstId>> {
        (self.bottom..self.size).map(|i| self.read(i)).collect()
    }

    // ==================== Call stack ====================

    /// Enter an inlined call whose callee pops `stack_args` slots on return
    pub fn push_call(&mut self, stack_args: u32) {
        self.calls.push(CallFrame {
            base: self.size,
            stack_args,
        });
    }

    /// Unwind the innermost inlined call: drop the callee's slots and the
    /// receiver/argument slots below them
    pub fn pop_call(&mut self, lift: &mut dyn FnMut(u32) -> InstId) -> StackResult<CallFrame> {
        let frame = self.calls.pop().ok_or(TraceError::Leave)?;
        if self.size > frame.base {
            self.size = frame.base;
        }
        for _ in 0..frame.stack_args {
            self.pop(lift)?;
        }
        Ok(frame)
    }

    pub fn call_depth(&self) -> usize {
        self.calls.len()
    }

    pub fn calls(&self) -> &[CallFrame] {
        &self.calls
    }
}

impl Default for RegStack {
    fn default() -> Self {
        Self::new(crate::config::RESERVED_REGSTACK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lifting closure handing out ids from 100 + depth
    fn lifter(log: &mut Vec<u32>) -> impl FnMut(u32) -> InstId + '_ {
        move |depth| {
            log.push(depth);
            InstId(100 + depth)
        }
    }

    #[test]
    fn test_push_pop() {
        let mut stack = RegStack::new(8);
        let mut log = Vec::new();
        stack.push(InstId(1));
        stack.push(InstId(2));
        assert_eq!(stack.pop(&mut lifter(&mut log)), Ok(InstId(2)));
        assert_eq!(stack.pop(&mut lifter(&mut log)), Ok(InstId(1)));
        assert_eq!(stack.size(), 0);
        assert_eq!(stack.bottom(), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn test_pop_below_entry_lifts() {
        let mut stack = RegStack::new(8);
        let mut log = Vec::new();
        assert_eq!(stack.pop(&mut lifter(&mut log)), Ok(InstId(101)));
        assert_eq!(stack.pop(&mut lifter(&mut log)), Ok(InstId(102)));
        assert_eq!(log, vec![1, 2]);
        assert_eq!(stack.size(), -2);
        assert_eq!(stack.bottom(), -2);
    }

    #[test]
    fn test_top_lifts_everything_above() {
        let mut stack = RegStack::new(8);
        let mut log = Vec::new();
        assert_eq!(stack.top(2, &mut lifter(&mut log)), Ok(InstId(103)));
        log.sort();
        assert_eq!(log, vec![1, 2, 3]);
        assert_eq!(stack.bottom(), -3);
        assert_eq!(
            stack.live(),
            Ok(vec![InstId(103), InstId(102), InstId(101)])
        );
        // already lifted slots are not lifted twice
        log.clear();
        assert_eq!(stack.top(0, &mut lifter(&mut log)), Ok(InstId(101)));
        assert!(log.is_empty());
    }

    #[test]
    fn test_underflow() {
        let mut stack = RegStack::new(2);
        let mut log = Vec::new();
        assert!(stack.pop(&mut lifter(&mut log)).is_ok());
        assert!(stack.pop(&mut lifter(&mut log)).is_ok());
        assert_eq!(
            stack.pop(&mut lifter(&mut log)),
            Err(TraceError::RegstackUnderflow)
        );
    }

    #[test]
    fn test_set_and_live() {
        let mut stack = RegStack::new(8);
        let mut log = Vec::new();
        stack.push(InstId(1));
        stack.push(InstId(2));
        stack.set(1, InstId(9), &mut lifter(&mut log)).unwrap();
        assert_eq!(stack.live(), Ok(vec![InstId(9), InstId(2)]));
    }

    #[test]
    fn test_call_unwinding() {
        let mut stack = RegStack::new(8);
        let mut log = Vec::new();
        stack.push(InstId(1)); // receiver
        stack.push(InstId(2)); // argument
        stack.push_call(2);
        stack.push(InstId(3)); // frame marker
        stack.push(InstId(4)); // callee temporary
        assert_eq!(stack.call_depth(), 1);
        let frame = stack.pop_call(&mut lifter(&mut log)).unwrap();
        assert_eq!(frame.base, 2);
        assert_eq!(stack.size(), 0);
        assert_eq!(stack.call_depth(), 0);
        assert_eq!(
            stack.pop_call(&mut lifter(&mut log)),
            Err(TraceError::Leave)
        );
    }

    #[test]
    fn test_grows_upward() {
        let mut stack = RegStack::new(2);
        for i in 0..100 {
            stack.push(InstId(i));
        }
        assert_eq!(stack.size(), 100);
        assert_eq!(stack.live().map(|l| l.len()), Ok(100));
    }
}
