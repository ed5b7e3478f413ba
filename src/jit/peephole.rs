//! Emission-time peephole rules
//!
//! Two local rewrites run before an instruction is committed to its block:
//! a type guard whose operand's producer already proves the predicate is
//! dropped, and constant loads are deduplicated through a per-trace pool.

use super::function::Function;
use super::ir::{Constant, InstId, InstKind, TypeCheck};
use crate::runtime::class::ClassId;
use crate::runtime::intern::Sym;
use crate::runtime::value::{is_flonum, Value};
use rustc_hash::FxHashMap as HashMap;

/// Whether the producer of `value` always satisfies `check`
pub fn guard_is_redundant(func: &Function, check: TypeCheck, value: InstId) -> bool {
    let Some(inst) = func.get(value) else {
        return false;
    };
    use InstKind as K;
    match (check, &inst.kind) {
        (TypeCheck::Fixnum, K::LoadConst(Constant::Fixnum(_))) => true,
        (
            TypeCheck::Float,
            K::LoadConst(Constant::Float(_))
            | K::FloatArith { .. }
            | K::FixnumToFloat(_)
            | K::StringToFloat(_)
            | K::Math { .. },
        ) => true,
        (TypeCheck::Flonum, K::LoadConst(Constant::Float(x))) => is_flonum(*x),
        (TypeCheck::Regexp, K::LoadConst(Constant::Regexp(_))) => true,
        (TypeCheck::Array, K::AllocArray(_)) => true,
        (TypeCheck::String, K::LoadConst(Constant::String(_)) | K::AllocString(_) | K::StringConcat(_)) => {
            true
        }
        (TypeCheck::Hash, K::AllocHash(_)) => true,
        (TypeCheck::SpecialConst, kind) => is_heap_producer(kind),
        (TypeCheck::NonNil, K::LoadConst(c)) => c.to_value().is_truthy(),
        (TypeCheck::NonNil, kind) => is_heap_producer(kind),
        (TypeCheck::Nil, K::LoadConst(c)) => !c.to_value().is_truthy(),
        _ => false,
    }
}

/// Producers whose result is always a heap reference
fn is_heap_producer(kind: &InstKind) -> bool {
    match kind {
        InstKind::LoadConst(Constant::String(v) | Constant::Regexp(v) | Constant::Object(v)) => {
            !v.is_special_const()
        }
        InstKind::AllocArray(_)
        | InstKind::AllocHash(_)
        | InstKind::AllocRange { .. }
        | InstKind::AllocString(_)
        | InstKind::StringConcat(_) => true,
        _ => false,
    }
}

/// Pool key of a constant: immediates compare by value, heap objects by
/// identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstKey {
    Nil,
    Boolean(bool),
    Fixnum(i64),
    /// Float bit pattern
    Float(u64),
    Symbol(Sym),
    Class(ClassId),
    Heap(usize),
}

impl ConstKey {
    pub fn of(constant: &Constant) -> Option<ConstKey> {
        Some(match constant {
            Constant::Nil => ConstKey::Nil,
            Constant::Boolean(b) => ConstKey::Boolean(*b),
            Constant::Fixnum(n) => ConstKey::Fixnum(*n),
            Constant::Float(x) => ConstKey::Float(x.to_bits()),
            Constant::String(v) | Constant::Regexp(v) | Constant::Object(v) => match v {
                Value::Symbol(s) => ConstKey::Symbol(*s),
                Value::Class(c) => ConstKey::Class(*c),
                other => ConstKey::Heap(other.heap_addr()?),
            },
        })
    }
}

/// Constant loads emitted so far in one trace
#[derive(Debug, Default)]
pub struct ConstPool {
    entries: HashMap<ConstKey, InstId>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, constant: &Constant) -> Option<InstId> {
        ConstKey::of(constant).and_then(|k| self.entries.get(&k).copied())
    }

    pub fn insert(&mut self, constant: &Constant, id: InstId) {
        if let Some(key) = ConstKey::of(constant) {
            self.entries.insert(key, id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget loads allocated at or after `mark`
    pub fn truncate(&mut self, mark: InstId) {
        self.entries.retain(|_, id| *id < mark);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func_with(kinds: Vec<InstKind>) -> (Function, Vec<InstId>) {
        let mut func = Function::new(8);
        let b = func.create_block(None, 0, 0);
        func.set_current(Some(b));
        let ids = kinds.into_iter().map(|k| func.push(k)).collect();
        (func, ids)
    }

    #[test]
    fn test_fixnum_guard_on_constant_is_redundant() {
        let (func, ids) = func_with(vec![
            InstKind::LoadConst(Constant::Fixnum(3)),
            InstKind::LoadConst(Constant::Float(3.0)),
            InstKind::LoadSelf,
        ]);
        assert!(guard_is_redundant(&func, TypeCheck::Fixnum, ids[0]));
        assert!(!guard_is_redundant(&func, TypeCheck::Fixnum, ids[1]));
        assert!(!guard_is_redundant(&func, TypeCheck::Fixnum, ids[2]));
        assert!(guard_is_redundant(&func, TypeCheck::Float, ids[1]));
        assert!(guard_is_redundant(&func, TypeCheck::Flonum, ids[1]));
    }

    #[test]
    fn test_heap_float_constant_is_not_flonum() {
        let (func, ids) = func_with(vec![InstKind::LoadConst(Constant::Float(1e300))]);
        assert!(guard_is_redundant(&func, TypeCheck::Float, ids[0]));
        assert!(!guard_is_redundant(&func, TypeCheck::Flonum, ids[0]));
    }

    #[test]
    fn test_allocations_prove_heap_and_truthiness() {
        let (func, ids) = func_with(vec![
            InstKind::AllocArray(vec![]),
            InstKind::LoadConst(Constant::Nil),
            InstKind::LoadConst(Constant::String(Value::string("s"))),
        ]);
        assert!(guard_is_redundant(&func, TypeCheck::Array, ids[0]));
        assert!(guard_is_redundant(&func, TypeCheck::SpecialConst, ids[0]));
        assert!(guard_is_redundant(&func, TypeCheck::NonNil, ids[0]));
        assert!(guard_is_redundant(&func, TypeCheck::Nil, ids[1]));
        assert!(!guard_is_redundant(&func, TypeCheck::NonNil, ids[1]));
        assert!(guard_is_redundant(&func, TypeCheck::String, ids[2]));
        assert!(guard_is_redundant(&func, TypeCheck::SpecialConst, ids[2]));
    }

    #[test]
    fn test_pool_is_structural_for_immediates() {
        let mut pool = ConstPool::new();
        pool.insert(&Constant::Fixnum(1), InstId(4));
        pool.insert(&Constant::Float(0.5), InstId(5));
        assert_eq!(pool.get(&Constant::Fixnum(1)), Some(InstId(4)));
        assert_eq!(pool.get(&Constant::Float(0.5)), Some(InstId(5)));
        assert_eq!(pool.get(&Constant::Fixnum(2)), None);
        assert_eq!(pool.get(&Constant::Boolean(true)), None);
    }

    #[test]
    fn test_pool_keys_heap_objects_by_identity() {
        let mut pool = ConstPool::new();
        let a = Value::string("x");
        let b = Value::string("x");
        pool.insert(&Constant::String(a.clone()), InstId(1));
        assert_eq!(pool.get(&Constant::String(a)), Some(InstId(1)));
        assert_eq!(pool.get(&Constant::String(b)), None);
    }

    #[test]
    fn test_truncate() {
        let mut pool = ConstPool::new();
        pool.insert(&Constant::Nil, InstId(1));
        pool.insert(&Constant::Fixnum(9), InstId(7));
        pool.truncate(InstId(5));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(&Constant::Nil), Some(InstId(1)));
    }
}
