//! Session configuration.

use crate::MAX_PARSE_DEPTH;

/// Initial bucket count of a session's symbol table
pub const DEFAULT_SYMBOL_TABLE_CAPACITY: usize = 512;

/// Initial bucket count of each environment's local binding table
pub const DEFAULT_ENVIRONMENT_CAPACITY: usize = 20;

/// Operand stack slots reserved up front
pub const DEFAULT_OPERAND_STACK_CAPACITY: usize = 256;

/// How many `load`s may be nested inside one another in a session
pub const MAX_LOAD_DEPTH: usize = 64;

/// Capacities and limits for one interpreter session.
///
/// Tables still grow past their initial capacity (see [`crate::hashtable`]); these
/// values only decide how much is allocated before the first growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterConfig {
    pub symbol_table_capacity: usize,
    pub environment_capacity: usize,
    pub operand_stack_capacity: usize,
    pub max_parse_depth: usize,
    pub max_load_depth: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        InterpreterConfig {
            symbol_table_capacity: DEFAULT_SYMBOL_TABLE_CAPACITY,
            environment_capacity: DEFAULT_ENVIRONMENT_CAPACITY,
            operand_stack_capacity: DEFAULT_OPERAND_STACK_CAPACITY,
            max_parse_depth: MAX_PARSE_DEPTH,
            max_load_depth: MAX_LOAD_DEPTH,
        }
    }
}

impl InterpreterConfig {
    pub fn with_symbol_table_capacity(mut self, capacity: usize) -> Self {
        self.symbol_table_capacity = capacity;
        self
    }

    pub fn with_environment_capacity(mut self, capacity: usize) -> Self {
        self.environment_capacity = capacity;
        self
    }

    pub fn with_operand_stack_capacity(mut self, capacity: usize) -> Self {
        self.operand_stack_capacity = capacity;
        self
    }

    pub fn with_max_parse_depth(mut self, depth: usize) -> Self {
        self.max_parse_depth = depth;
        self
    }

    pub fn with_max_load_depth(mut self, depth: usize) -> Self {
        self.max_load_depth = depth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_only_named_fields() {
        let config = InterpreterConfig::default()
            .with_environment_capacity(3)
            .with_max_parse_depth(8);

        assert_eq!(config.environment_capacity, 3);
        assert_eq!(config.max_parse_depth, 8);
        assert_eq!(config.symbol_table_capacity, DEFAULT_SYMBOL_TABLE_CAPACITY);
        assert_eq!(config.operand_stack_capacity, DEFAULT_OPERAND_STACK_CAPACITY);
        assert_eq!(config.max_load_depth, MAX_LOAD_DEPTH);
    }
}
