//! The reference machine as the recorder's host

use crate::bytecode::{Insn, Pc};
use crate::error::CodeLocation;
use crate::jit::host::Host;
use crate::runtime::class::{BasicOp, ClassId, IseqId};
use crate::runtime::intern::Sym;
use crate::runtime::value::Value;
use crate::runtime::vm::{Block, CallCache, IvarCache, Machine};
use std::rc::Rc;

impl Host for Machine {
    fn fetch(&self, pc: Pc) -> Option<Insn> {
        Machine::fetch(self, pc).cloned()
    }

    fn topn(&self, n: usize) -> Option<Value> {
        Machine::topn(self, n).ok()
    }

    fn self_value(&self) -> Value {
        Machine::self_value(self)
    }

    fn current_block(&self) -> Option<Rc<Block>> {
        Machine::current_block(self)
    }

    fn returns_to_native(&self) -> bool {
        Machine::returns_to_native(self)
    }

    fn iseq_at(&self, pc: Pc) -> Option<IseqId> {
        Machine::iseq_at(self, pc)
    }

    fn iseq_by_name(&self, name: &str) -> Option<IseqId> {
        Machine::iseq_by_name(self, name)
    }

    fn iseq_params(&self, iseq: IseqId) -> u32 {
        self.iseq(iseq).params
    }

    fn search_method(&mut self, pc: Pc, mid: &str, argc: u32, recv: &Value) -> Option<CallCache> {
        let mid = Machine::intern(self, mid);
        Machine::search_method(self, pc, mid, argc, recv)
    }

    fn ivar_slot(&mut self, pc: Pc, recv: &Value, name: Sym, define: bool) -> Option<IvarCache> {
        Machine::ivar_slot(self, pc, recv, name, define)
    }

    fn constant_cache(&self, pc: Pc) -> Option<Value> {
        Machine::constant_cache(self, pc)
    }

    fn literal(&mut self, pc: Pc) -> Option<Value> {
        Machine::literal(self, pc).ok()
    }

    fn basic_op_unredefined(&self, op: BasicOp, class: ClassId) -> bool {
        Machine::basic_op_unredefined(self, op, class)
    }

    fn class_of(&self, value: &Value) -> ClassId {
        Machine::class_of(self, value)
    }

    fn intern(&mut self, name: &str) -> Sym {
        Machine::intern(self, name)
    }

    fn location(&self, pc: Pc) -> CodeLocation {
        Machine::location(self, pc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::assemble;

    fn host(src: &str) -> Machine {
        let mut m = Machine::new();
        m.load(&assemble(src).unwrap()).unwrap();
        m.start().unwrap();
        m
    }

    #[test]
    fn test_top_frame_returns_to_native() {
        let m = host("top main\n putnil\n leave\nend");
        assert!(Host::returns_to_native(&m));
    }

    #[test]
    fn test_search_method_interns_name() {
        let mut m = host("top main\n putnil\n leave\nend");
        let recv = Value::Fixnum(1);
        let cache = Host::search_method(&mut m, Pc(0), "+", 1, &recv).unwrap();
        assert_eq!(cache.klass, ClassId::INTEGER);
        assert_eq!(m.symbol_name(cache.mid), "+");
        assert!(Host::search_method(&mut m, Pc(0), "no_such_method", 0, &recv).is_none());
    }

    #[test]
    fn test_topn_underflow_is_none() {
        let m = host("top main\n putnil\n leave\nend");
        assert_eq!(Host::topn(&m, 0), None);
    }
}
