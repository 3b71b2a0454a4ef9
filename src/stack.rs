//! The operand stack.
//!
//! Evaluation steps communicate through this stack: a step pushes the values it
//! produced, the next step pops what it needs. Function calls use it as an
//! argument area. The caller pushes the function, then an index marker holding the
//! stack position of the first argument, then the evaluated arguments; the callee
//! reads all arguments at once with [`Stack::get_objects`], which also discards
//! them.

use smallvec::SmallVec;
use std::fmt;

/// Argument slices handed to builtins; most calls take four or fewer
pub type Arguments<T> = SmallVec<[T; 4]>;

pub struct Stack<T> {
    items: Vec<T>,
    high_water: usize,
}

/// The evaluator's stack of intermediate values
pub type OperandStack = Stack<crate::ast::Value>;

impl<T: Clone> Stack<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Stack {
            items: Vec::with_capacity(capacity),
            high_water: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.high_water = self.high_water.max(self.items.len());
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    /// Read the item at `index` without removing it
    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    /// Copy out every item from position `from` to the top, then truncate the
    /// stack to length `from`. A `from` at or past the top yields nothing.
    pub fn get_objects(&mut self, from: usize) -> Arguments<T> {
        if from >= self.items.len() {
            return Arguments::new();
        }
        self.items.drain(from..).collect()
    }

    /// Current stack pointer: the index the next push lands on
    pub fn pointer(&self) -> usize {
        self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop everything above position `len`
    pub fn truncate(&mut self, len: usize) {
        self.items.truncate(len);
    }

    /// Largest length observed since creation or the last [`Stack::reset_high_water`]
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn reset_high_water(&mut self) {
        self.high_water = self.items.len();
    }
}

impl<T: Clone> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter().rev()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Value;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_push_pop_and_random_access() {
        let mut stack = OperandStack::new();
        stack.push(Value::from(123));
        stack.push(Value::from("Test"));
        stack.push(Value::from(12));

        assert_eq!(stack.pointer(), 3);
        assert_eq!(stack.get(0), Some(&Value::from(123)));
        assert_eq!(stack.get(1), Some(&Value::from("Test")));
        assert_eq!(stack.get(3), None);

        assert_eq!(stack.pop(), Some(Value::from(12)));
        assert_eq!(stack.pop(), Some(Value::from("Test")));
        assert_eq!(stack.pop(), Some(Value::from(123)));
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_get_objects_slices_and_truncates() {
        let mut stack: Stack<i64> = Stack::new();
        for n in 0..6 {
            stack.push(n);
        }
        let args = stack.get_objects(2);
        assert_eq!(args.as_slice(), &[2, 3, 4, 5]);
        assert_eq!(stack.pointer(), 2);

        // at or past the top: empty, no change
        assert!(stack.get_objects(2).is_empty());
        assert!(stack.get_objects(10).is_empty());
        assert_eq!(stack.pointer(), 2);
    }

    #[test]
    fn test_high_water_tracks_peak() {
        let mut stack: Stack<u8> = Stack::with_capacity(2);
        stack.push(1);
        stack.push(2);
        stack.push(3);
        stack.truncate(1);
        assert_eq!(stack.high_water(), 3);
        stack.reset_high_water();
        assert_eq!(stack.high_water(), 1);
    }
}
