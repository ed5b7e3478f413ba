//! Inline caches of the interpreter
//!
//! Call sites, instance-variable accesses and constant lookups each keep a
//! monomorphic cache keyed by the instruction's program counter. The trace
//! recorder reads these caches (and clones call caches into its traces).

use crate::bytecode::Pc;
use crate::runtime::class::{ClassId, IseqId, MethodEntry};
use crate::runtime::intern::Sym;
use crate::runtime::value::Value;
use rustc_hash::FxHashMap as HashMap;

/// Method resolved at a call site for one receiver class
#[derive(Debug, Clone, PartialEq)]
pub struct CallCache {
    pub mid: Sym,
    pub argc: u32,
    /// Receiver class the entry was resolved for
    pub klass: ClassId,
    /// Class serial at resolution time
    pub class_serial: u64,
    /// Global method state at resolution time
    pub method_state: u64,
    pub method: MethodEntry,
}

impl CallCache {
    #[inline]
    pub fn is_valid(&self, klass: ClassId, class_serial: u64, method_state: u64) -> bool {
        self.klass == klass && self.class_serial == class_serial && self.method_state == method_state
    }
}

/// Instance-variable slot resolved for one class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IvarCache {
    pub klass: ClassId,
    pub class_serial: u64,
    pub index: usize,
}

/// Cached constant value
#[derive(Debug, Clone)]
pub struct ConstCache {
    pub value: Value,
    pub constant_state: u64,
}

/// All inline caches of a machine
#[derive(Debug, Default)]
pub struct InlineCaches {
    pub calls: HashMap<Pc, CallCache>,
    pub ivars: HashMap<Pc, IvarCache>,
    pub consts: HashMap<(IseqId, u32), ConstCache>,
    /// Materialized literal objects of `putobject`, `duparray` and friends
    pub literals: HashMap<Pc, Value>,
}

impl InlineCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call cache at `pc` if still valid for `klass`
    #[inline]
    pub fn call(&self, pc: Pc, mid: Sym, klass: ClassId, serial: u64, state: u64) -> Option<&CallCache> {
        self.calls
            .get(&pc)
            .filter(|cc| cc.mid == mid && cc.is_valid(klass, serial, state))
    }

    /// Instance-variable cache at `pc` if still valid for `klass`
    #[inline]
    pub fn ivar(&self, pc: Pc, klass: ClassId, serial: u64) -> Option<usize> {
        self.ivars
            .get(&pc)
            .filter(|ic| ic.klass == klass && ic.class_serial == serial)
            .map(|ic| ic.index)
    }

    /// Constant cache entry if still valid
    #[inline]
    pub fn constant(&self, iseq: IseqId, slot: u32, state: u64) -> Option<&Value> {
        self.consts
            .get(&(iseq, slot))
            .filter(|c| c.constant_state == state)
            .map(|c| &c.value)
    }
}
