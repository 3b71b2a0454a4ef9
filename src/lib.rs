//! cpscheme - Scheme evaluation core on an explicit continuation trampoline
//!
//! This crate evaluates a small Scheme dialect without ever recursing on the host
//! call stack while evaluating. Every pending piece of work is a [`evaluator::Step`]
//! on an explicit continuation stack, intermediate values live on an explicit
//! [`stack::OperandStack`], and a driver loop pops and runs steps until it reaches a
//! sentinel. Calls in tail position schedule their body without leaving a pending
//! step behind, so tail-recursive loops run in constant continuation depth:
//!
//! ```scheme
//! (define (count n acc) (if (= n 0) acc (count (- n 1) (+ acc 1))))
//! (count 1000000 0)   ; => 1000000, constant continuation depth
//! ```
//!
//! ## Value model
//!
//! Runtime values are the closed [`ast::Value`] sum type. Cons cells, strings,
//! environments and closures are reference-shared (`Rc`), symbols are interned
//! through a per-session [`symbol::SymbolTable`] and compared by identity.
//!
//! ## Errors
//!
//! Inside the evaluator errors are values: [`ast::Value::Error`] for user mistakes
//! (unbound variable, wrong arity, bad syntax) and [`ast::Value::FatalError`] for
//! broken evaluator invariants. Either one aborts the current top-level evaluation
//! and leaves the session usable. At the host boundary they are surfaced as
//! [`Error`] through [`ast::Value::into_result`].
//!
//! ## Modules
//!
//! - `ast`: runtime values, equality and printing
//! - `hashtable`: bucket-chained table backing symbols and environments
//! - `symbol`: symbol interning
//! - `environment`: chained lexical scopes
//! - `stack`: operand stack and its slice-and-truncate protocol
//! - `evaluator`: the continuation trampoline
//! - `builtinops`: primitive functions and their registration
//! - `scheme`: reader from text to values
//! - `interpreter`: one complete session (reader + environment + evaluator)

use std::fmt;

/// Maximum reader nesting depth.
/// The reader is the only natively recursive part of the crate, so deeply nested
/// input is rejected instead of overflowing the host stack.
pub const MAX_PARSE_DEPTH: usize = 256;

/// Categorizes the different kinds of parsing errors.
#[derive(Debug, PartialEq, Clone)]
pub enum ParseErrorKind {
    /// Invalid or unexpected syntax (bad tokens, malformed expressions)
    InvalidSyntax,
    /// Input ended before the expression was complete (unterminated string, unclosed parens)
    Incomplete,
    /// Expression nesting exceeded the maximum parse depth
    TooDeeplyNested,
    /// Extra input found after a complete, valid expression
    TrailingContent,
}

/// A structured error providing detailed information about a parsing failure.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Context snippet from the input showing where the error occurred (max 60 chars)
    pub context: Option<String>,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>, context: Option<String>) -> Self {
        ParseError {
            kind,
            message: message.into(),
            context,
        }
    }

    pub fn from_message(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, None)
    }

    /// Create a ParseError with a context snippet cut from `input` around `error_offset`
    pub fn with_context(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
    ) -> Self {
        const MAX_CONTEXT: usize = 60;

        let context_start = error_offset.saturating_sub(20);
        let context_str: String = input
            .chars()
            .skip(context_start)
            .take(MAX_CONTEXT)
            .collect();

        let mut display_context = String::new();
        if context_start > 0 {
            display_context.push_str("[...]");
        }
        display_context.push_str(&context_str);
        if context_start + context_str.chars().count() < input.chars().count() {
            display_context.push_str("[...]");
        }

        let display_context = display_context.replace('\n', "\\n").replace('\r', "");
        Self::new(kind, message, Some(display_context))
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(context) = &self.context {
            write!(f, "\nContext: {context}")?;
        }
        Ok(())
    }
}

/// Host-level error type.
///
/// The evaluator itself never returns this; it produces error *values*. Sessions
/// and the reader convert to this type at the boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("ParseError: {0}")]
    Parse(ParseError),
    #[error("Error: {0}")]
    Input(String),
    #[error("FatalError: {0}")]
    Fatal(String),
    #[error("IoError: {0}")]
    Io(String),
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::Parse(err)
    }
}

pub mod ast;
pub mod builtinops;
pub mod config;
pub mod environment;
pub mod evaluator;
pub mod hashtable;
pub mod stack;
pub mod symbol;

#[cfg(feature = "scheme")]
pub mod interpreter;

#[cfg(feature = "scheme")]
pub mod scheme;

pub use ast::Value;
pub use builtinops::{initialize_builtins, register_builtin};
pub use config::InterpreterConfig;
pub use environment::Environment;
pub use evaluator::Evaluator;
pub use symbol::{Symbol, SymbolTable};

#[cfg(feature = "scheme")]
pub use interpreter::Interpreter;
