//! Classes, method tables and basic-operator redefinition tracking

use super::builtins::NativeFn;
use super::intern::{Sym, SymbolTable};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::fmt;

/// Index of a class in the [`ClassTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl ClassId {
    pub const OBJECT: ClassId = ClassId(0);
    pub const INTEGER: ClassId = ClassId(1);
    pub const FLOAT: ClassId = ClassId(2);
    pub const STRING: ClassId = ClassId(3);
    pub const SYMBOL: ClassId = ClassId(4);
    pub const ARRAY: ClassId = ClassId(5);
    pub const HASH: ClassId = ClassId(6);
    pub const RANGE: ClassId = ClassId(7);
    pub const REGEXP: ClassId = ClassId(8);
    pub const TIME: ClassId = ClassId(9);
    pub const NIL: ClassId = ClassId(10);
    pub const TRUE: ClassId = ClassId(11);
    pub const FALSE: ClassId = ClassId(12);
    pub const CLASS: ClassId = ClassId(13);
    pub const PROC: ClassId = ClassId(14);
    pub const MATH: ClassId = ClassId(15);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

const BUILTINS: [(ClassId, &str, Option<ClassId>); 16] = [
    (ClassId::OBJECT, "Object", None),
    (ClassId::INTEGER, "Integer", Some(ClassId::OBJECT)),
    (ClassId::FLOAT, "Float", Some(ClassId::OBJECT)),
    (ClassId::STRING, "String", Some(ClassId::OBJECT)),
    (ClassId::SYMBOL, "Symbol", Some(ClassId::OBJECT)),
    (ClassId::ARRAY, "Array", Some(ClassId::OBJECT)),
    (ClassId::HASH, "Hash", Some(ClassId::OBJECT)),
    (ClassId::RANGE, "Range", Some(ClassId::OBJECT)),
    (ClassId::REGEXP, "Regexp", Some(ClassId::OBJECT)),
    (ClassId::TIME, "Time", Some(ClassId::OBJECT)),
    (ClassId::NIL, "NilClass", Some(ClassId::OBJECT)),
    (ClassId::TRUE, "TrueClass", Some(ClassId::OBJECT)),
    (ClassId::FALSE, "FalseClass", Some(ClassId::OBJECT)),
    (ClassId::CLASS, "Class", Some(ClassId::OBJECT)),
    (ClassId::PROC, "Proc", Some(ClassId::OBJECT)),
    (ClassId::MATH, "Math", Some(ClassId::OBJECT)),
];

/// Index of an instruction sequence loaded in the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IseqId(pub u32);

impl IseqId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a method is implemented
#[derive(Debug, Clone, PartialEq)]
pub enum MethodKind {
    /// Bytecode method
    Iseq(IseqId),
    /// Instance-variable getter
    AttrReader(Sym),
    /// Instance-variable setter
    AttrWriter(Sym),
    /// Builtin implemented in Rust
    Native(NativeFn),
}

/// A resolved method
#[derive(Debug, Clone, PartialEq)]
pub struct MethodEntry {
    /// Class whose method table holds the entry
    pub owner: ClassId,
    pub name: Sym,
    pub kind: MethodKind,
}

/// Operators the interpreter (and the JIT) specialize for builtin classes
/// as long as they are not redefined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BasicOp {
    Plus,
    Minus,
    Mult,
    Div,
    Mod,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    LtLt,
    Aref,
    Aset,
    Length,
    Size,
    EmptyP,
    Succ,
    Not,
    Match,
    Freeze,
}

impl BasicOp {
    pub fn from_method_name(name: &str) -> Option<BasicOp> {
        let op = match name {
            "+" => BasicOp::Plus,
            "-" => BasicOp::Minus,
            "*" => BasicOp::Mult,
            "/" => BasicOp::Div,
            "%" => BasicOp::Mod,
            "==" => BasicOp::Eq,
            "!=" => BasicOp::Neq,
            "<" => BasicOp::Lt,
            "<=" => BasicOp::Le,
            ">" => BasicOp::Gt,
            ">=" => BasicOp::Ge,
            "<<" => BasicOp::LtLt,
            "[]" => BasicOp::Aref,
            "[]=" => BasicOp::Aset,
            "length" => BasicOp::Length,
            "size" => BasicOp::Size,
            "empty?" => BasicOp::EmptyP,
            "succ" => BasicOp::Succ,
            "!" => BasicOp::Not,
            "=~" => BasicOp::Match,
            "freeze" => BasicOp::Freeze,
            _ => return None,
        };
        Some(op)
    }

    pub fn method_name(self) -> &'static str {
        match self {
            BasicOp::Plus => "+",
            BasicOp::Minus => "-",
            BasicOp::Mult => "*",
            BasicOp::Div => "/",
            BasicOp::Mod => "%",
            BasicOp::Eq => "==",
            BasicOp::Neq => "!=",
            BasicOp::Lt => "<",
            BasicOp::Le => "<=",
            BasicOp::Gt => ">",
            BasicOp::Ge => ">=",
            BasicOp::LtLt => "<<",
            BasicOp::Aref => "[]",
            BasicOp::Aset => "[]=",
            BasicOp::Length => "length",
            BasicOp::Size => "size",
            BasicOp::EmptyP => "empty?",
            BasicOp::Succ => "succ",
            BasicOp::Not => "!",
            BasicOp::Match => "=~",
            BasicOp::Freeze => "freeze",
        }
    }
}

impl fmt::Display for BasicOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method_name())
    }
}

/// A class or module
#[derive(Debug, Clone)]
pub struct Class {
    pub name: String,
    pub superclass: Option<ClassId>,
    /// Class holding this class's singleton methods
    pub meta: Option<ClassId>,
    /// For metaclasses: the class they are attached to
    pub attached: Option<ClassId>,
    pub methods: HashMap<Sym, MethodEntry>,
    /// Bumped whenever a method visible to instances of this class changes
    pub serial: u64,
    /// Instance-variable slot of each name
    pub ivar_slots: HashMap<Sym, usize>,
}

impl Class {
    fn new(name: String, superclass: Option<ClassId>, serial: u64) -> Self {
        Self {
            name,
            superclass,
            meta: None,
            attached: None,
            methods: HashMap::default(),
            serial,
            ivar_slots: HashMap::default(),
        }
    }
}

/// All classes of an interpreter
pub struct ClassTable {
    classes: Vec<Class>,
    by_name: HashMap<String, ClassId>,
    /// Global method state, bumped on every method definition
    method_state: u64,
    next_serial: u64,
    redefined: HashSet<(BasicOp, ClassId)>,
    sealed: bool,
}

impl ClassTable {
    /// Table holding the builtin classes and their metaclasses
    pub fn new() -> Self {
        let mut table = Self {
            classes: Vec::with_capacity(64),
            by_name: HashMap::default(),
            method_state: 1,
            next_serial: 1,
            redefined: HashSet::default(),
            sealed: false,
        };
        for (id, name, superclass) in BUILTINS {
            let serial = table.fresh_serial();
            table.classes.push(Class::new(name.to_string(), superclass, serial));
            table.by_name.insert(name.to_string(), id);
        }
        for (id, _, _) in BUILTINS {
            table.attach_meta(id);
        }
        table
    }

    fn fresh_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    fn attach_meta(&mut self, class: ClassId) -> ClassId {
        let meta_super = match self.classes[class.index()].superclass {
            Some(sup) => self.classes[sup.index()].meta.unwrap_or(ClassId::CLASS),
            None => ClassId::CLASS,
        };
        let name = format!("#<Class:{}>", self.classes[class.index()].name);
        let serial = self.fresh_serial();
        let mut meta = Class::new(name, Some(meta_super), serial);
        meta.attached = Some(class);
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(meta);
        self.classes[class.index()].meta = Some(id);
        id
    }

    /// Define a class, or return the existing one with that name
    pub fn define_class(&mut self, name: &str, superclass: Option<ClassId>) -> ClassId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = ClassId(self.classes.len() as u32);
        let serial = self.fresh_serial();
        self.classes.push(Class::new(
            name.to_string(),
            Some(superclass.unwrap_or(ClassId::OBJECT)),
            serial,
        ));
        self.by_name.insert(name.to_string(), id);
        self.attach_meta(id);
        id
    }

    pub fn get(&self, id: ClassId) -> &Class {
        &self.classes[id.index()]
    }

    pub fn by_name(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: ClassId) -> &str {
        &self.classes[id.index()].name
    }

    pub fn serial(&self, id: ClassId) -> u64 {
        self.classes[id.index()].serial
    }

    pub fn method_state(&self) -> u64 {
        self.method_state
    }

    pub fn meta(&self, id: ClassId) -> ClassId {
        self.classes[id.index()].meta.unwrap_or(ClassId::CLASS)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Whether `class` is `ancestor` or inherits from it
    pub fn inherits(&self, mut class: ClassId, ancestor: ClassId) -> bool {
        loop {
            if class == ancestor {
                return true;
            }
            match self.classes[class.index()].superclass {
                Some(sup) => class = sup,
                None => return false,
            }
        }
    }

    /// Resolve `mid` along the superclass chain of `class`
    pub fn lookup(&self, class: ClassId, mid: Sym) -> Option<&MethodEntry> {
        let mut current = Some(class);
        while let Some(id) = current {
            let c = &self.classes[id.index()];
            if let Some(entry) = c.methods.get(&mid) {
                return Some(entry);
            }
            current = c.superclass;
        }
        None
    }

    /// Define (or redefine) a method. Bumps the serial of the class and of
    /// every class inheriting from it. Once builtins are sealed it also bumps
    /// the global method state, and a basic operator defined on a class
    /// counts as redefined for that class and its descendants.
    pub fn define_method(&mut self, class: ClassId, name: Sym, kind: MethodKind, symbols: &SymbolTable) {
        self.classes[class.index()].methods.insert(
            name,
            MethodEntry {
                owner: class,
                name,
                kind,
            },
        );
        let descendants: Vec<ClassId> = (0..self.classes.len() as u32)
            .map(ClassId)
            .filter(|&id| self.inherits(id, class))
            .collect();
        if self.sealed {
            self.method_state += 1;
            if let Some(op) = BasicOp::from_method_name(symbols.resolve(name)) {
                for &id in &descendants {
                    self.redefined.insert((op, id));
                }
            }
        }
        for id in descendants {
            let serial = self.fresh_serial();
            self.classes[id.index()].serial = serial;
        }
    }

    /// Mark the end of builtin installation
    pub fn seal_builtins(&mut self) {
        self.sealed = true;
    }

    /// Whether `op` still has its builtin meaning for instances of `class`
    pub fn basic_op_unredefined(&self, op: BasicOp, class: ClassId) -> bool {
        !self.redefined.contains(&(op, class))
    }

    /// Slot of an instance variable, optionally allocating one
    pub fn ivar_slot(&mut self, class: ClassId, name: Sym, define: bool) -> Option<usize> {
        let slots = &mut self.classes[class.index()].ivar_slots;
        if let Some(&slot) = slots.get(&name) {
            return Some(slot);
        }
        if !define {
            return None;
        }
        let slot = slots.len();
        slots.insert(name, slot);
        Some(slot)
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_layout() {
        let table = ClassTable::new();
        assert_eq!(table.by_name("Integer"), Some(ClassId::INTEGER));
        assert_eq!(table.name(ClassId::MATH), "Math");
        let meta = table.meta(ClassId::MATH);
        assert_eq!(table.get(meta).attached, Some(ClassId::MATH));
        assert!(table.inherits(ClassId::STRING, ClassId::OBJECT));
        assert!(table.inherits(meta, ClassId::CLASS));
    }

    #[test]
    fn test_lookup_walks_superclasses() {
        let mut symbols = SymbolTable::new();
        let mut table = ClassTable::new();
        let base = table.define_class("Base", None);
        let derived = table.define_class("Derived", Some(base));
        let hello = symbols.intern("hello");
        table.define_method(base, hello, MethodKind::AttrReader(hello), &symbols);
        let entry = table.lookup(derived, hello).unwrap();
        assert_eq!(entry.owner, base);
        assert!(table.lookup(ClassId::OBJECT, hello).is_none());
    }

    #[test]
    fn test_redefinition_flags_and_serials() {
        let mut symbols = SymbolTable::new();
        let mut table = ClassTable::new();
        let plus = symbols.intern("+");
        table.define_method(ClassId::INTEGER, plus, MethodKind::Native(NativeFn::IntPlus), &symbols);
        table.seal_builtins();
        assert!(table.basic_op_unredefined(BasicOp::Plus, ClassId::INTEGER));

        let before = table.serial(ClassId::INTEGER);
        table.define_method(ClassId::INTEGER, plus, MethodKind::AttrReader(plus), &symbols);
        assert!(!table.basic_op_unredefined(BasicOp::Plus, ClassId::INTEGER));
        assert!(table.basic_op_unredefined(BasicOp::Plus, ClassId::FLOAT));
        assert_ne!(before, table.serial(ClassId::INTEGER));
    }

    #[test]
    fn test_subclass_serial_follows_parent() {
        let mut symbols = SymbolTable::new();
        let mut table = ClassTable::new();
        let base = table.define_class("Base", None);
        let derived = table.define_class("Derived", Some(base));
        let before = table.serial(derived);
        let m = symbols.intern("m");
        table.define_method(base, m, MethodKind::AttrReader(m), &symbols);
        assert_ne!(before, table.serial(derived));
    }

    #[test]
    fn test_ivar_slots() {
        let mut symbols = SymbolTable::new();
        let mut table = ClassTable::new();
        let point = table.define_class("Point", None);
        let x = symbols.intern("x");
        let y = symbols.intern("y");
        assert_eq!(table.ivar_slot(point, x, false), None);
        assert_eq!(table.ivar_slot(point, x, true), Some(0));
        assert_eq!(table.ivar_slot(point, y, true), Some(1));
        assert_eq!(table.ivar_slot(point, x, false), Some(0));
    }
}
