//! Traces and the trace repository
//!
//! A [`Trace`] is one candidate or compiled hot path, keyed by the program
//! counter it starts at. Side exits of a compiled trace grow child traces
//! keyed by the exit's program counter, so the repository holds a forest
//! of trace trees.

use super::codegen::NativeCode;
use super::pcmap::PcMap;
use super::snapshot::StackMap;
use crate::bytecode::Pc;
use crate::runtime::class::IseqId;
use crate::runtime::vm::CallCache;
use bitflags::bitflags;
use std::fmt;
use std::rc::Rc;

bitflags! {
    /// Global recording mode of the engine
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TraceMode: u8 {
        /// Every dispatched instruction is appended to the current trace
        const RECORD = 1;
        /// The trace is closing at a loop header; snapshots taken now are
        /// successful exits rather than side exits
        const EMIT_BACKWARD_BRANCH = 1 << 1;
    }
}

impl TraceMode {
    /// Interpreting, not recording
    pub const DEFAULT: TraceMode = TraceMode::empty();

    pub fn is_recording(self) -> bool {
        self.contains(TraceMode::RECORD)
    }
}

/// Status of one recording step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceError {
    Ok,
    /// A call resolved to native code without special support
    NativeMethod,
    /// Irregular control flow (exception, `yield` without a block)
    Throw,
    /// The instruction has no recording handler or the handler declined
    UnsupportedOpcode,
    /// `leave` would return out of the recorded frame
    Leave,
    /// The register stack was popped below its reserved region
    RegstackUnderflow,
    /// The trace reached its own loop header again
    AlreadyRecorded,
    /// The trace grew past `max_trace_length`
    BufferFull,
}

impl TraceError {
    pub fn message(self) -> &'static str {
        match self {
            TraceError::Ok => "ok",
            TraceError::NativeMethod => "invoking native method",
            TraceError::Throw => "throw exception",
            TraceError::UnsupportedOpcode => "not supported bytecode",
            TraceError::Leave => "this trace return into native method",
            TraceError::RegstackUnderflow => "register stack underflow",
            TraceError::AlreadyRecorded => "this instruction is already recorded on trace",
            TraceError::BufferFull => "trace buffer is full",
        }
    }

    /// Whether a trace aborted for this reason may still be compiled
    pub fn allows_submit(self) -> bool {
        !matches!(self, TraceError::RegstackUnderflow)
    }
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Index of a trace in its repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(pub u32);

impl TraceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trace#{}", self.0)
    }
}

/// One candidate or compiled hot path
pub struct Trace<H> {
    pub id: TraceId,
    pub start_pc: Pc,
    /// Last program counter appended while recording
    pub last_pc: Pc,
    /// Trace whose side exit created this one
    pub parent: Option<TraceId>,
    /// Instruction sequence holding `start_pc`
    pub iseq: Option<IseqId>,
    /// Interpreted visits
    pub counter: u32,
    /// Side-exit maps keyed by exit program counter
    pub side_exits: PcMap<StackMap>,
    /// Call caches owned by the compiled code
    pub caches: Vec<Rc<CallCache>>,
    pub code: Option<Box<dyn NativeCode<H>>>,
    /// Recording produced no native code; never recorded again
    pub blacklisted: bool,
    /// Times the compiled code ran
    pub invocations: u64,
}

impl<H> Trace<H> {
    pub fn new(id: TraceId, start_pc: Pc, parent: Option<TraceId>, iseq: Option<IseqId>) -> Self {
        Self {
            id,
            start_pc,
            last_pc: start_pc,
            parent,
            iseq,
            counter: 0,
            side_exits: PcMap::new(),
            caches: Vec::new(),
            code: None,
            blacklisted: false,
            invocations: 0,
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.code.is_some()
    }

    /// Forget the previous recording before a new one starts
    pub fn reset(&mut self) {
        self.side_exits.clear();
        self.caches.clear();
        self.code = None;
        self.last_pc = self.start_pc;
    }
}

impl<H> fmt::Debug for Trace<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("id", &self.id)
            .field("start_pc", &self.start_pc)
            .field("last_pc", &self.last_pc)
            .field("parent", &self.parent)
            .field("counter", &self.counter)
            .field("compiled", &self.is_compiled())
            .field("blacklisted", &self.blacklisted)
            .field("side_exits", &self.side_exits.len())
            .finish()
    }
}

/// All traces of one engine, addressable by id and by start pc
pub struct TraceRepository<H> {
    traces: Vec<Trace<H>>,
    by_pc: PcMap<TraceId>,
}

impl<H> TraceRepository<H> {
    pub fn new() -> Self {
        Self {
            traces: Vec::new(),
            by_pc: PcMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Trace starting at `pc`
    pub fn find(&self, pc: Pc) -> Option<TraceId> {
        self.by_pc.get(pc).copied()
    }

    /// Trace starting at `pc`, created with `parent` if missing. The
    /// boolean is true when the trace was created by this call.
    pub fn get_or_create(&mut self, pc: Pc, parent: Option<TraceId>, iseq: Option<IseqId>) -> (TraceId, bool) {
        if let Some(id) = self.find(pc) {
            return (id, false);
        }
        let id = TraceId(self.traces.len() as u32);
        self.traces.push(Trace::new(id, pc, parent, iseq));
        self.by_pc.insert(pc, id);
        (id, true)
    }

    pub fn get(&self, id: TraceId) -> Option<&Trace<H>> {
        self.traces.get(id.index())
    }

    pub fn get_mut(&mut self, id: TraceId) -> Option<&mut Trace<H>> {
        self.traces.get_mut(id.index())
    }

    /// Start pcs of `id` and every trace above it in its tree, nearest first
    pub fn ancestor_starts(&self, id: TraceId) -> Vec<Pc> {
        let mut starts = Vec::new();
        let mut cursor = self.get(id).and_then(|t| t.parent);
        while let Some(parent) = cursor {
            match self.get(parent) {
                Some(trace) => {
                    starts.push(trace.start_pc);
                    cursor = trace.parent;
                }
                None => break,
            }
        }
        starts
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trace<H>> {
        self.traces.iter()
    }

    /// Number of traces holding native code
    pub fn compiled_count(&self) -> usize {
        self.traces.iter().filter(|t| t.is_compiled()).count()
    }

    /// Drop every trace and its native code
    pub fn clear(&mut self) {
        self.traces.clear();
        self.by_pc.clear();
    }
}

impl<H> Default for TraceRepository<H> {
    fn default() -> Self {
        Self::new()
    }
}
