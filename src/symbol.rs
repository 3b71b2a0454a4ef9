//! Symbol interning.
//!
//! A [`SymbolTable`] hands out exactly one [`Symbol`] per distinct identifier text.
//! Symbols compare and hash by pointer, so equality and environment lookups never
//! look at the characters once a name has been interned. There is no removal:
//! symbols live as long as the table (or any value) holds them.

use crate::config::DEFAULT_SYMBOL_TABLE_CAPACITY;
use crate::hashtable::HashTable;
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// An interned identifier. Only [`SymbolTable::get_or_create`] creates these.
#[derive(Clone)]
pub struct Symbol(Rc<str>);

impl Symbol {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared handle to one session's symbol table.
///
/// Cloning the handle shares the table; the reader, the global environment and
/// every child environment of a session point at the same one.
#[derive(Clone)]
pub struct SymbolTable {
    known: Rc<RefCell<HashTable<Rc<str>, Symbol>>>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new(DEFAULT_SYMBOL_TABLE_CAPACITY)
    }
}

impl SymbolTable {
    pub fn new(capacity: usize) -> Self {
        SymbolTable {
            known: Rc::new(RefCell::new(HashTable::with_capacity(capacity))),
        }
    }

    /// Return the symbol for `name`, creating and storing it on first use.
    pub fn get_or_create(&self, name: &str) -> Symbol {
        if let Some(symbol) = self.known.borrow().value(name) {
            return symbol.clone();
        }

        let text: Rc<str> = Rc::from(name);
        let symbol = Symbol(Rc::clone(&text));
        let mut known = self.known.borrow_mut();
        known.insert(text, symbol.clone());
        if known.is_full() {
            known.grow();
        }
        symbol
    }

    /// Look up a name without interning it
    pub fn get(&self, name: &str) -> Option<Symbol> {
        self.known.borrow().value(name).cloned()
    }

    /// Number of distinct symbols created so far
    pub fn len(&self) -> usize {
        self.known.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.borrow().is_empty()
    }

    pub fn same_table(&self, other: &SymbolTable) -> bool {
        Rc::ptr_eq(&self.known, &other.known)
    }
}

impl fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolTable(len={})", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_symbols_are_not_added_twice() {
        let table = SymbolTable::default();
        let define = table.get_or_create("define");
        table.get_or_create("+");
        table.get_or_create("-");
        table.get_or_create("define");
        table.get_or_create("+");
        table.get_or_create("-");

        assert_eq!(table.len(), 3);
        assert_eq!(define, table.get_or_create("define"));
    }

    #[test]
    fn test_growth_keeps_identity() {
        let table = SymbolTable::new(2);
        let first = table.get_or_create("name0");
        let names: Vec<String> = (0..200).map(|n| format!("name{n}")).collect();
        let symbols: Vec<Symbol> = names.iter().map(|n| table.get_or_create(n)).collect();

        assert_eq!(table.len(), 200);
        assert_eq!(first, symbols[0]);
        for (name, symbol) in names.iter().zip(&symbols) {
            assert_eq!(&table.get_or_create(name), symbol);
            assert_eq!(symbol.as_str(), name);
        }
    }

    #[test]
    fn test_tables_are_independent() {
        let a = SymbolTable::default();
        let b = SymbolTable::default();
        assert_ne!(a.get_or_create("x"), b.get_or_create("x"));
        assert!(a.same_table(&a.clone()));
        assert!(!a.same_table(&b));
        assert!(b.get("y").is_none());
    }

    proptest! {
        #[test]
        fn prop_interning_twice_yields_same_instance(name in "\\PC{0,24}") {
            let table = SymbolTable::new(4);
            let first = table.get_or_create(&name);
            let second = table.get_or_create(&name);
            prop_assert!(first == second);
            prop_assert_eq!(first.as_str(), name.as_str());
            prop_assert_eq!(table.len(), 1);
        }

        #[test]
        fn prop_distinct_texts_yield_distinct_symbols(a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
            let table = SymbolTable::new(4);
            let sa = table.get_or_create(&a);
            let sb = table.get_or_create(&b);
            prop_assert_eq!(sa == sb, a == b);
        }
    }
}
