//! Inline-cache clones owned by the JIT
//!
//! The interpreter rewrites its call caches whenever a call site sees a new
//! receiver class. A trace therefore never points at the interpreter's
//! cache; it embeds a private copy made while recording. Copies made during
//! an attempt stay pending until the attempt either compiles (the copies
//! are frozen and handed to the trace) or is thrown away (the copies are
//! cancelled).

use crate::runtime::vm::CallCache;
use std::rc::Rc;

/// Lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub cloned: u64,
    pub frozen: u64,
    pub cancelled: u64,
}

#[derive(Debug, Default)]
pub struct InlineCacheManager {
    pending: Vec<Rc<CallCache>>,
    stats: CacheStats,
}

impl InlineCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Private copy of `cache` for the current recording attempt
    pub fn clone_cache(&mut self, cache: &CallCache) -> Rc<CallCache> {
        let copy = Rc::new(cache.clone());
        self.pending.push(Rc::clone(&copy));
        self.stats.cloned += 1;
        copy
    }

    /// Copies made since the last freeze or cancel
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Hand every pending copy to a compiled trace
    pub fn freeze(&mut self) -> Vec<Rc<CallCache>> {
        self.stats.frozen += self.pending.len() as u64;
        std::mem::take(&mut self.pending)
    }

    /// Release every pending copy
    pub fn cancel_unfrozen(&mut self) {
        self.stats.cancelled += self.pending.len() as u64;
        self.pending.clear();
    }

    /// Drop pending copies beyond the first `len` (rollback of a failed
    /// handler)
    pub fn truncate(&mut self, len: usize) {
        if self.pending.len() > len {
            self.stats.cancelled += (self.pending.len() - len) as u64;
            self.pending.truncate(len);
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::class::{ClassId, MethodEntry, MethodKind};
    use crate::runtime::intern::SymbolTable;

    fn cache() -> CallCache {
        let mut symbols = SymbolTable::new();
        let mid = symbols.intern("foo");
        CallCache {
            mid,
            argc: 0,
            klass: ClassId::OBJECT,
            class_serial: 1,
            method_state: 1,
            method: MethodEntry {
                owner: ClassId::OBJECT,
                name: mid,
                kind: MethodKind::AttrReader(mid),
            },
        }
    }

    #[test]
    fn test_clone_is_independent() {
        let mut manager = InlineCacheManager::new();
        let mut original = cache();
        let copy = manager.clone_cache(&original);
        original.class_serial = 99;
        assert_eq!(copy.class_serial, 1);
        assert_eq!(manager.pending(), 1);
    }

    #[test]
    fn test_freeze_transfers_ownership() {
        let mut manager = InlineCacheManager::new();
        let copy = manager.clone_cache(&cache());
        let frozen = manager.freeze();
        assert_eq!(frozen.len(), 1);
        assert!(Rc::ptr_eq(&frozen[0], &copy));
        assert_eq!(manager.pending(), 0);
        assert_eq!(manager.stats().frozen, 1);
    }

    #[test]
    fn test_cancel_releases_copies() {
        let mut manager = InlineCacheManager::new();
        let copy = manager.clone_cache(&cache());
        manager.clone_cache(&cache());
        manager.truncate(1);
        assert_eq!(manager.stats().cancelled, 1);
        manager.cancel_unfrozen();
        assert_eq!(Rc::strong_count(&copy), 1);
        assert_eq!(
            manager.stats(),
            CacheStats {
                cloned: 2,
                frozen: 0,
                cancelled: 2
            }
        );
    }
}
