//! Symbol table for method, variable and constant names
//!
//! Names are interned once and compared as integers afterwards. The table is
//! pre-seeded with the names the interpreter and the JIT look up on hot
//! paths.

use string_interner::{DefaultStringInterner, DefaultSymbol};

/// An interned name
pub type Sym = DefaultSymbol;

/// Interner for [`Sym`]s
pub struct SymbolTable {
    interner: DefaultStringInterner,
}

impl SymbolTable {
    /// Create a table pre-seeded with common method names
    pub fn new() -> Self {
        let mut interner = DefaultStringInterner::default();
        let common = [
            // Basic operators
            "+", "-", "*", "/", "%", "==", "!=", "<", "<=", ">", ">=", "<<", "[]", "[]=",
            "length", "size", "empty?", "succ", "!", "=~", "freeze", "===",
            // Object protocol
            "new", "initialize", "to_s", "inspect", "class", "nil?", "block_given?",
            // Math module
            "sin", "cos", "tan", "exp", "sqrt", "log10", "log2",
        ];
        for name in common {
            interner.get_or_intern_static(name);
        }
        Self { interner }
    }

    /// Intern a name, returning its symbol
    #[inline]
    pub fn intern(&mut self, name: &str) -> Sym {
        self.interner.get_or_intern(name)
    }

    /// Symbol of an already interned name
    #[inline]
    pub fn lookup(&self, name: &str) -> Option<Sym> {
        self.interner.get(name)
    }

    /// Name of a symbol (empty for symbols from another table)
    #[inline]
    pub fn resolve(&self, sym: Sym) -> &str {
        self.interner.resolve(sym).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.interner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interner.is_empty()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let mut table = SymbolTable::new();
        let a = table.intern("each");
        let b = table.intern("each");
        assert_eq!(a, b);
        assert_eq!(table.resolve(a), "each");
    }

    #[test]
    fn test_preseeded() {
        let table = SymbolTable::new();
        assert!(table.lookup("+").is_some());
        assert!(table.lookup("block_given?").is_some());
        assert!(table.lookup("not_seeded").is_none());
    }
}
