//! Trace recorder
//!
//! The recorder consumes one interpreter instruction at a time, before the
//! interpreter executes it, and appends the IR that reproduces that
//! instruction along the path actually taken. Every speculative assumption
//! becomes a guard bound to a stack map, so a failing guard hands the
//! interpreter exactly the state it would have had without the trace.
//!
//! Handlers live in three files: [`insns`] (variables, literals, stack
//! shuffles and control flow), [`call`] (sends, blocks and `leave`) and
//! [`arith`] (the specialized `opt_*` operators).
//!
//! A handler either succeeds, closes the trace, or fails with a
//! [`TraceError`]. A failing handler is rolled back completely (IR, exit
//! maps, pooled constants, cloned caches and the register stack) before the
//! abort snapshot is taken, so the abort exit restores the state from just
//! before the failing instruction.

mod arith;
mod call;
mod insns;

use super::function::Function;
use super::icache::InlineCacheManager;
use super::ir::{BlockId, Constant, InstId, InstKind};
use super::peephole::{guard_is_redundant, ConstPool};
use super::regstack::{CallFrame, RegStack};
use super::snapshot::{ExitKind, ExitMaps, StackMap};
use super::trace::{TraceError, TraceId, TraceMode};
use super::{fold::fold, host::Host};
use crate::bytecode::{Insn, Pc};
use crate::config::JitConfig;
use tracing::{debug, trace, warn};

/// Outcome of recording one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep recording
    Continue,
    /// The trace closed a cycle or reached a parent; submit it
    Closed,
    /// Recording stopped; an exit to the interpreter was emitted
    Aborted(TraceError),
}

type RecordResult<T> = std::result::Result<T, TraceError>;

/// Register-stack shape at the start of a block. A jump may only enter an
/// existing block when the stack holds the same registers it held then.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockShape {
    bottom: i32,
    slots: Vec<Option<InstId>>,
    calls: Vec<CallFrame>,
}

/// Everything a handler may change, saved before it runs
struct Checkpoint {
    regs: RegStack,
    inst_mark: InstId,
    block_mark: usize,
    current: Option<BlockId>,
    exits: usize,
    caches: usize,
    shapes: usize,
}

/// The process-wide recording workspace. Reset between attempts, never
/// reallocated.
pub struct Recorder {
    max_trace_length: usize,
    dump_stack_maps: bool,
    mode: TraceMode,
    trace: Option<TraceId>,
    start_pc: Pc,
    last_pc: Pc,
    /// Start pcs of the ancestors of the trace being recorded
    stops: Vec<Pc>,
    recorded: usize,
    func: Function,
    regs: RegStack,
    pool: ConstPool,
    caches: InlineCacheManager,
    exits: ExitMaps,
    shapes: Vec<Option<BlockShape>>,
    entry: Option<BlockId>,
}

impl Recorder {
    pub fn new(config: &JitConfig) -> Self {
        Self {
            max_trace_length: config.max_trace_length,
            dump_stack_maps: config.dump_stack_maps,
            mode: TraceMode::DEFAULT,
            trace: None,
            start_pc: Pc::default(),
            last_pc: Pc::default(),
            stops: Vec::new(),
            recorded: 0,
            func: Function::new(crate::config::IR_ARENA_CAPACITY),
            regs: RegStack::new(config.reserved_regstack),
            pool: ConstPool::new(),
            caches: InlineCacheManager::new(),
            exits: ExitMaps::new(),
            shapes: Vec::new(),
            entry: None,
        }
    }

    pub fn mode(&self) -> TraceMode {
        self.mode
    }

    pub fn is_recording(&self) -> bool {
        self.mode.is_recording()
    }

    /// Trace being recorded
    pub fn trace(&self) -> Option<TraceId> {
        self.trace
    }

    pub fn start_pc(&self) -> Pc {
        self.start_pc
    }

    /// Last program counter appended to the trace
    pub fn last_pc(&self) -> Pc {
        self.last_pc
    }

    /// Instructions recorded in this attempt
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    pub fn func(&self) -> &Function {
        &self.func
    }

    pub fn exits(&self) -> &ExitMaps {
        &self.exits
    }

    /// IR and exit maps together, for the optimizer
    pub fn parts_mut(&mut self) -> (&mut Function, &ExitMaps) {
        (&mut self.func, &self.exits)
    }

    pub fn caches(&self) -> &InlineCacheManager {
        &self.caches
    }

    pub fn caches_mut(&mut self) -> &mut InlineCacheManager {
        &mut self.caches
    }

    /// Forget the current attempt and return to interpreting
    pub fn reset(&mut self) {
        self.mode = TraceMode::DEFAULT;
        self.trace = None;
        self.stops.clear();
        self.recorded = 0;
        self.func.clear();
        self.regs.clear();
        self.pool.clear();
        self.exits.clear();
        self.shapes.clear();
        self.entry = None;
    }

    /// Begin recording `trace` at `start_pc`. `stops` are the start pcs of
    /// its ancestors; reaching one ends the trace.
    pub fn start(&mut self, trace: TraceId, start_pc: Pc, stops: Vec<Pc>) {
        self.reset();
        self.mode = TraceMode::RECORD;
        self.trace = Some(trace);
        self.start_pc = start_pc;
        self.last_pc = start_pc;
        self.stops = stops;
        self.func.set_source(start_pc);

        let entry = self.func.create_block(None, 0, 0);
        self.func.set_current(Some(entry));
        self.shapes.push(None);
        self.entry = Some(entry);
        self.func.push(InstKind::StackAdjust);
        self.func.push(InstKind::Jump {
            target: start_pc,
            block: None,
        });
        self.open_block(start_pc);
    }

    // ==================== Recording ====================

    /// Record the instruction at `pc`, which the interpreter is about to
    /// execute
    pub fn record<H: Host>(&mut self, host: &mut H, pc: Pc) -> Flow {
        let Some(insn) = host.fetch(pc) else {
            return self.abort(host, pc, TraceError::UnsupportedOpcode);
        };
        self.func.set_source(pc);

        if self.recorded > 0 {
            if pc == self.start_pc {
                return self.guarded(host, pc, |r, h| r.close_at_start(h, pc, &insn));
            }
            if self.stops.contains(&pc) {
                return self.guarded(host, pc, |r, _| r.close_at_parent(pc));
            }
        }
        if self.func.len() >= self.max_trace_length {
            return self.abort(host, pc, TraceError::BufferFull);
        }

        trace!("record {} {}", pc, insn.name());
        let flow = self.guarded(host, pc, |r, h| r.dispatch(h, pc, &insn));
        if !matches!(flow, Flow::Aborted(_)) {
            self.recorded += 1;
            self.last_pc = pc;
        }
        flow
    }

    /// Run `handler`, rolling everything back and aborting when it fails
    fn guarded<H, F>(&mut self, host: &mut H, pc: Pc, handler: F) -> Flow
    where
        H: Host,
        F: FnOnce(&mut Self, &mut H) -> RecordResult<Flow>,
    {
        let saved = self.checkpoint();
        match handler(self, host) {
            Ok(flow) => flow,
            Err(reason) => {
                self.restore(saved);
                self.abort(host, pc, reason)
            }
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            regs: self.regs.clone(),
            inst_mark: self.func.next_id(),
            block_mark: self.func.block_count(),
            current: self.func.current(),
            exits: self.exits.len(),
            caches: self.caches.pending(),
            shapes: self.shapes.len(),
        }
    }

    fn restore(&mut self, saved: Checkpoint) {
        self.func
            .rollback(saved.inst_mark, saved.block_mark, saved.current);
        self.pool.truncate(saved.inst_mark);
        self.exits.truncate(saved.exits, saved.inst_mark);
        self.caches.truncate(saved.caches);
        self.shapes.truncate(saved.shapes);
        self.regs = saved.regs;
    }

    /// Leave the trace at `pc` and stop recording
    fn abort<H: Host>(&mut self, host: &H, pc: Pc, reason: TraceError) -> Flow {
        warn!("failed to trace at {} because {}", host.location(pc), reason);
        if self.func.is_terminated() {
            return Flow::Aborted(reason);
        }
        if self.snapshot(pc).is_ok() {
            let exit = self.func.push(InstKind::Exit { pc });
            self.exits.bind(exit, pc);
        }
        Flow::Aborted(reason)
    }

    fn dispatch<H: Host>(&mut self, host: &mut H, pc: Pc, insn: &Insn) -> RecordResult<Flow> {
        match insn {
            Insn::Send { ci } => self.record_send(host, pc, ci),
            Insn::OptSendSimple { ci } => self.record_send_simple(host, pc, ci),
            Insn::InvokeBlock { ci } => self.record_invokeblock(host, pc, ci),
            Insn::Leave => self.record_leave(host),
            Insn::OptStrFreeze { .. } => self.record_str_freeze(host, pc),
            Insn::OptPlus
            | Insn::OptMinus
            | Insn::OptMult
            | Insn::OptDiv
            | Insn::OptMod
            | Insn::OptEq
            | Insn::OptNeq
            | Insn::OptLt
            | Insn::OptLe
            | Insn::OptGt
            | Insn::OptGe => self.record_binary(host, pc, insn),
            Insn::OptLtLt => self.record_ltlt(host, pc, insn),
            Insn::OptAref => self.record_aref(host, pc, insn),
            Insn::OptAset => self.record_aset(host, pc, insn),
            Insn::OptArefWith { .. } => self.record_aref_with(host, pc),
            Insn::OptAsetWith { .. } => self.record_aset_with(host, pc),
            Insn::OptLength | Insn::OptSize | Insn::OptEmptyP => self.record_length(host, pc, insn),
            Insn::OptSucc => self.record_succ(host, pc, insn),
            Insn::OptRegexpMatch1 { .. } => self.record_regexpmatch1(host, pc),
            Insn::OptRegexpMatch2 => self.record_regexpmatch2(host, pc, insn),
            other => self.record_simple(host, pc, other),
        }
    }

    // ==================== Closing ====================

    /// The trace came back to its own loop header
    fn close_at_start<H: Host>(&mut self, host: &mut H, pc: Pc, insn: &Insn) -> RecordResult<Flow> {
        self.mode |= TraceMode::EMIT_BACKWARD_BRANCH;
        debug!("closing loop at {}", host.location(pc));
        if insn.is_backward_branch() {
            // the header's not-taken exit becomes the loop's success exit
            self.dispatch(host, pc, insn)?;
            self.recorded += 1;
            return Ok(Flow::Closed);
        }
        self.close_loop(pc)?;
        Ok(Flow::Closed)
    }

    /// The trace reached the start of an ancestor; hand control back to it
    fn close_at_parent(&mut self, pc: Pc) -> RecordResult<Flow> {
        debug!("reached parent trace at {}", pc);
        self.snapshot_as(pc, ExitKind::Success)?;
        self.emit_exit(pc);
        Ok(Flow::Closed)
    }

    /// Jump to the block at `target` when the stack shape allows it,
    /// otherwise leave the trace there
    fn close_loop(&mut self, target: Pc) -> RecordResult<()> {
        match self.matching_block(target) {
            Some(block) => {
                self.func.push(InstKind::Jump {
                    target,
                    block: Some(block),
                });
            }
            None => {
                self.snapshot_as(target, ExitKind::Success)?;
                self.emit_exit(target);
            }
        }
        Ok(())
    }

    /// End open blocks and resolve jumps; called once before submission
    pub fn finalize(&mut self) {
        if self.trace.is_some() && !self.func.is_terminated() {
            if let Some(start) = self.func.current().and_then(|b| self.func.block(b).start) {
                if self.snapshot(start).is_ok() {
                    self.emit_exit(start);
                }
            }
        }
        self.func.link_blocks();
    }

    // ==================== Blocks ====================

    fn shape(&self) -> BlockShape {
        let bottom = self.regs.bottom();
        BlockShape {
            bottom,
            slots: (bottom..self.regs.size()).map(|i| self.regs.peek(i)).collect(),
            calls: self.regs.calls().to_vec(),
        }
    }

    fn open_block(&mut self, start: Pc) -> BlockId {
        let block = self.func.create_block(
            Some(start),
            self.regs.call_depth() as u32,
            self.regs.size(),
        );
        self.func.set_current(Some(block));
        let shape = self.shape();
        if self.shapes.len() <= block.index() {
            self.shapes.resize(block.index() + 1, None);
        }
        self.shapes[block.index()] = Some(shape);
        block
    }

    /// Whether the register stack still looks the way it did when `block`
    /// was opened. Slots lifted since then must still hold their original
    /// `StackPop`.
    fn shape_matches(&self, block: BlockId) -> bool {
        let Some(Some(shape)) = self.shapes.get(block.index()) else {
            return false;
        };
        if shape.calls != self.regs.calls() {
            return false;
        }
        let bottom = self.regs.bottom();
        for i in bottom..shape.bottom {
            let lifted = self
                .regs
                .peek(i)
                .map(|reg| matches!(self.func.kind(reg), InstKind::StackPop { depth } if *depth == (-i) as u32));
            if lifted != Some(true) {
                return false;
            }
        }
        let current: Vec<Option<InstId>> = (shape.bottom..self.regs.size())
            .map(|i| self.regs.peek(i))
            .collect();
        current == shape.slots
    }

    fn matching_block(&self, target: Pc) -> Option<BlockId> {
        self.func
            .find_block(target, self.regs.call_depth() as u32, self.regs.size())
            .filter(|&b| self.shape_matches(b))
    }

    /// Continue recording at `target`. Entering a block the trace already
    /// holds closes a cycle.
    fn emit_jump(&mut self, target: Pc) -> RecordResult<Flow> {
        let depth = self.regs.call_depth() as u32;
        if self.func.find_block(target, depth, self.regs.size()).is_some() {
            self.close_loop(target)?;
            return Ok(Flow::Closed);
        }
        self.func.push(InstKind::Jump {
            target,
            block: None,
        });
        self.open_block(target);
        Ok(Flow::Continue)
    }

    // ==================== Snapshots ====================

    /// Capture the live registers for an exit at `pc`
    fn snapshot(&mut self, pc: Pc) -> RecordResult<()> {
        let kind = if self.mode.contains(TraceMode::EMIT_BACKWARD_BRANCH) {
            ExitKind::Success
        } else {
            ExitKind::SideExit
        };
        self.snapshot_as(pc, kind)
    }

    fn snapshot_as(&mut self, pc: Pc, kind: ExitKind) -> RecordResult<()> {
        let map = StackMap::new(
            pc,
            kind,
            self.regs.bottom(),
            self.regs.live()?,
            self.regs.call_depth() as u32,
        );
        if self.dump_stack_maps {
            debug!("snapshot {}", map);
        } else {
            trace!("snapshot {}", map);
        }
        self.exits.push(map);
        Ok(())
    }

    // ==================== Emission ====================

    /// Append `kind` to the current block. Folds constant operations,
    /// drops guards the peephole proves redundant and binds everything that
    /// can leave the trace to the newest stack map for its exit pc.
    fn emit(&mut self, kind: InstKind) -> RecordResult<InstId> {
        if !kind.is_guard() {
            if let Some(constant) = fold(&self.func, &kind) {
                return Ok(self.load_const(constant));
            }
        }
        let id = self.func.push(kind);
        if let Some(exit) = self.func.kind(id).exit_pc() {
            if !self.exits.bind(id, exit) {
                warn!("no stack map for exit at {}", exit);
                return Err(TraceError::UnsupportedOpcode);
            }
        }
        Ok(id)
    }

    /// Emit a guard unless it is provably redundant
    fn emit_guard(&mut self, kind: InstKind) -> RecordResult<()> {
        if let InstKind::GuardType { check, value, .. } = kind {
            if guard_is_redundant(&self.func, check, value) {
                trace!("drop redundant guard on {}", value);
                return Ok(());
            }
        }
        self.emit(kind).map(|_| ())
    }

    fn emit_exit(&mut self, pc: Pc) {
        let exit = self.func.push(InstKind::Exit { pc });
        self.exits.bind(exit, pc);
    }

    /// Load of `constant`, shared with earlier loads of the same value
    fn load_const(&mut self, constant: Constant) -> InstId {
        if let Some(id) = self.pool.get(&constant) {
            return id;
        }
        let id = self.func.push(InstKind::LoadConst(constant.clone()));
        self.pool.insert(&constant, id);
        id
    }

    // ==================== Register stack ====================

    fn lifter<'a>(func: &'a mut Function, entry: Option<BlockId>) -> impl FnMut(u32) -> InstId + 'a {
        move |depth| {
            let id = func.alloc(InstKind::StackPop { depth });
            if let Some(entry) = entry {
                func.insert_before_terminator(entry, id);
            }
            id
        }
    }

    fn push(&mut self, reg: InstId) {
        self.regs.push(reg);
    }

    fn pop(&mut self) -> RecordResult<InstId> {
        let mut lift = Self::lifter(&mut self.func, self.entry);
        self.regs.pop(&mut lift)
    }

    fn top(&mut self, n: u32) -> RecordResult<InstId> {
        let mut lift = Self::lifter(&mut self.func, self.entry);
        self.regs.top(n, &mut lift)
    }

    fn set(&mut self, n: u32, reg: InstId) -> RecordResult<()> {
        let mut lift = Self::lifter(&mut self.func, self.entry);
        self.regs.set(n, reg, &mut lift)
    }

    /// Registers of the top `count` slots, bottom first
    fn top_regs(&mut self, count: u32) -> RecordResult<Vec<InstId>> {
        (0..count).rev().map(|n| self.top(n)).collect()
    }

    /// Pop `count` slots, returning them bottom first
    fn pop_regs(&mut self, count: u32) -> RecordResult<Vec<InstId>> {
        let regs = self.top_regs(count)?;
        for _ in 0..count {
            self.pop()?;
        }
        Ok(regs)
    }

    fn push_call(&mut self, stack_args: u32) {
        self.regs.push_call(stack_args);
    }

    fn pop_call(&mut self) -> RecordResult<CallFrame> {
        let mut lift = Self::lifter(&mut self.func, self.entry);
        self.regs.pop_call(&mut lift)
    }

    fn call_depth(&self) -> usize {
        self.regs.call_depth()
    }
}

/// Operand `n` below the top of the interpreter stack
fn operand<H: Host>(host: &H, n: usize) -> RecordResult<crate::runtime::value::Value> {
    host.topn(n).ok_or(TraceError::UnsupportedOpcode)
}

#[cfg(test)]
mod tests;
