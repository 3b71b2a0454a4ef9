//! Chained lexical scopes.
//!
//! An [`Environment`] is a shared handle to one frame: a local binding table plus
//! an optional parent. Lookups walk outwards through the parents; writes never
//! leave the local frame. Closures keep their defining frame alive by holding a
//! handle to it.

use crate::ast::Value;
use crate::config::DEFAULT_ENVIRONMENT_CAPACITY;
use crate::hashtable::HashTable;
use crate::symbol::{Symbol, SymbolTable};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

#[derive(Clone)]
pub struct Environment(Rc<Frame>);

struct Frame {
    bindings: RefCell<HashTable<Symbol, Value>>,
    parent: Option<Environment>,
    symbols: SymbolTable,
    capacity: usize,
}

impl Frame {
    /// Move every bound value and the parent handle onto `pending`
    fn take_contents(&mut self, pending: &mut Vec<Value>) {
        let bindings = self.bindings.get_mut().get_all_elements();
        pending.extend(bindings.into_iter().map(|(_, value)| value));
        if let Some(parent) = self.parent.take() {
            pending.push(Value::Environment(parent));
        }
    }
}

impl Drop for Frame {
    // A frame can hold closures whose home frames hold further closures; tear the
    // chain down through a worklist.
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.take_contents(&mut pending);
        crate::ast::release(pending);
    }
}

impl Environment {
    /// Create a root environment that interns through `symbols`
    pub fn new_global(symbols: SymbolTable, capacity: usize) -> Self {
        Environment(Rc::new(Frame {
            bindings: RefCell::new(HashTable::with_capacity(capacity)),
            parent: None,
            symbols,
            capacity,
        }))
    }

    /// Create an empty scope nested in `self`, sharing its symbol table and capacity
    pub fn child(&self) -> Self {
        Environment(Rc::new(Frame {
            bindings: RefCell::new(HashTable::with_capacity(self.0.capacity)),
            parent: Some(self.clone()),
            symbols: self.0.symbols.clone(),
            capacity: self.0.capacity,
        }))
    }

    pub fn parent(&self) -> Option<&Environment> {
        self.0.parent.as_ref()
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.0.symbols
    }

    /// Look `key` up here, then in each enclosing scope.
    /// `None` means the symbol is unbound all the way to the root.
    pub fn get(&self, key: &Symbol) -> Option<Value> {
        let mut scope = Some(self);
        while let Some(env) = scope {
            if let Some(value) = env.0.bindings.borrow().value(key) {
                return Some(value.clone());
            }
            scope = env.parent();
        }
        None
    }

    /// Look a name up, interning it first
    pub fn get_by_name(&self, name: &str) -> Option<Value> {
        self.get(&self.0.symbols.get(name)?)
    }

    /// Create or overwrite a binding in this scope only
    pub fn insert_or_update(&self, key: Symbol, value: Value) {
        let mut bindings = self.0.bindings.borrow_mut();
        if bindings.insert(key, value).is_none() && bindings.is_full() {
            bindings.grow();
        }
    }

    /// Bind a name in this scope, interning it first
    pub fn define(&self, name: &str, value: Value) {
        let key = self.0.symbols.get_or_create(name);
        self.insert_or_update(key, value);
    }

    /// Overwrite an existing binding of this scope. Enclosing scopes are not
    /// consulted; returns `false` when `key` is not bound locally.
    pub fn update(&self, key: &Symbol, value: Value) -> bool {
        self.0.bindings.borrow_mut().update(key, value).is_some()
    }

    pub fn contains_local(&self, key: &Symbol) -> bool {
        self.0.bindings.borrow().contains_key(key)
    }

    /// Number of bindings in this scope
    pub fn local_len(&self) -> usize {
        self.0.bindings.borrow().len()
    }

    /// Snapshot of this scope's bindings, sorted by name
    pub fn local_bindings(&self) -> Vec<(Symbol, Value)> {
        let mut bindings: Vec<(Symbol, Value)> = self
            .0
            .bindings
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        bindings.sort_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));
        bindings
    }

    pub fn ptr_eq(&self, other: &Environment) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Release this handle. If it was the last one, the frame's contents go onto
    /// `pending` instead of being dropped in place.
    pub(crate) fn dismantle(self, pending: &mut Vec<Value>) {
        if let Ok(mut frame) = Rc::try_unwrap(self.0) {
            frame.take_contents(pending);
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new_global(SymbolTable::default(), DEFAULT_ENVIRONMENT_CAPACITY)
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut depth = 0;
        let mut scope = self.parent();
        while let Some(env) = scope {
            depth += 1;
            scope = env.parent();
        }
        write!(f, "Environment(bindings={}, depth={depth})", self.local_len())
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_insert_and_get() {
        let env = Environment::default();
        let symbols = env.symbols().clone();
        let x = symbols.get_or_create("x");

        assert_eq!(env.get(&x), None);
        env.insert_or_update(x.clone(), Value::from(1));
        assert_eq!(env.get(&x), Some(Value::from(1)));

        env.insert_or_update(x.clone(), Value::from(2));
        assert_eq!(env.get(&x), Some(Value::from(2)));
        assert_eq!(env.local_len(), 1);
    }

    #[test]
    fn test_shadowing_keeps_parent_intact() {
        let parent = Environment::default();
        let x = parent.symbols().get_or_create("x");
        parent.insert_or_update(x.clone(), Value::from("outer"));

        let child = parent.child();
        assert_eq!(child.get(&x), Some(Value::from("outer")));

        child.insert_or_update(x.clone(), Value::from("inner"));
        assert_eq!(child.get(&x), Some(Value::from("inner")));
        assert_eq!(parent.get(&x), Some(Value::from("outer")));
    }

    #[test]
    fn test_update_is_local_only() {
        let parent = Environment::default();
        let x = parent.symbols().get_or_create("x");
        let y = parent.symbols().get_or_create("y");
        parent.insert_or_update(x.clone(), Value::from(1));

        let child = parent.child();
        assert!(!child.update(&x, Value::from(2)));
        assert_eq!(parent.get(&x), Some(Value::from(1)));
        assert!(!child.contains_local(&x));

        assert!(parent.update(&x, Value::from(3)));
        assert_eq!(child.get(&x), Some(Value::from(3)));
        assert!(!parent.update(&y, Value::from(4)));
        assert_eq!(parent.get(&y), None);
    }

    #[test]
    fn test_growth_past_initial_capacity() {
        let env = Environment::new_global(SymbolTable::new(4), 2);
        for n in 0..100 {
            env.define(&format!("v{n}"), Value::from(n));
        }
        assert_eq!(env.local_len(), 100);
        for n in 0..100 {
            assert_eq!(env.get_by_name(&format!("v{n}")).unwrap(), Value::from(n));
        }

        let listed: Vec<String> = env
            .local_bindings()
            .iter()
            .take(3)
            .map(|(k, _)| k.to_string())
            .collect();
        assert_eq!(listed, vec!["v0", "v1", "v10"]);
    }

    #[test]
    fn test_children_share_symbols_and_chain() {
        let root = Environment::default();
        let child = root.child();
        let grandchild = child.child();

        assert!(grandchild.symbols().same_table(root.symbols()));
        assert!(grandchild.parent().unwrap().ptr_eq(&child));
        assert!(root.parent().is_none());
        assert!(!root.ptr_eq(&child));
    }

    #[test]
    fn test_frame_chain_drops_without_recursion() {
        let root = Environment::default();
        let mut scope = root.child();
        for n in 0..200_000 {
            let next = scope.child();
            next.define("n", Value::from(n));
            scope = next;
        }
        assert_eq!(scope.get_by_name("n"), Some(Value::from(199_999)));
        drop(scope);
        assert_eq!(root.local_len(), 0);
    }

    #[test]
    fn test_dismantle_leaves_shared_frames_alive() {
        let env = Environment::default();
        env.define("x", Value::list([Value::from(1), Value::from(2)]));
        let handle = env.clone();

        let mut pending = Vec::new();
        handle.dismantle(&mut pending);
        assert!(pending.is_empty());
        assert_eq!(env.local_len(), 1);

        let mut pending = Vec::new();
        env.dismantle(&mut pending);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0], Value::list([Value::from(1), Value::from(2)]));
    }

    proptest! {
        #[test]
        fn prop_binding_survives_other_inserts(
            key in "[a-z]{1,6}",
            others in proptest::collection::vec("[A-Z]{1,6}", 0..60),
            value in any::<i64>(),
        ) {
            let env = Environment::new_global(SymbolTable::new(8), 1);
            let symbol = env.symbols().get_or_create(&key);
            env.insert_or_update(symbol.clone(), Value::from(value));
            prop_assert_eq!(env.get(&symbol), Some(Value::from(value)));

            for (n, other) in others.iter().enumerate() {
                env.define(other, Value::from(n as i64));
                prop_assert_eq!(env.get(&symbol), Some(Value::from(value)));
            }
        }
    }
}
