//! One interpreter session: symbol table, global environment, evaluator and reader.
//!
//! Sessions are independent of each other; values from one session must not be
//! evaluated in another, since their symbols belong to a different table.

use crate::Error;
use crate::ast::{SchemeFile, Value};
use crate::builtinops::initialize_builtins;
use crate::config::InterpreterConfig;
use crate::environment::Environment;
use crate::evaluator::{EvalStats, Evaluator};
use crate::scheme::Reader;
use crate::symbol::SymbolTable;
use std::rc::Rc;
use tracing::debug;

pub struct Interpreter {
    symbols: SymbolTable,
    global: Environment,
    evaluator: Evaluator,
    reader: Reader,
    max_load_depth: usize,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(InterpreterConfig::default())
    }
}

impl Interpreter {
    pub fn new(config: InterpreterConfig) -> Self {
        let symbols = SymbolTable::new(config.symbol_table_capacity);
        let global = Environment::new_global(symbols.clone(), config.environment_capacity);
        initialize_builtins(&global);
        Interpreter {
            reader: Reader::new(symbols.clone()).with_max_depth(config.max_parse_depth),
            evaluator: Evaluator::with_capacity(config.operand_stack_capacity),
            symbols,
            global,
            max_load_depth: config.max_load_depth,
        }
    }

    pub fn global(&self) -> &Environment {
        &self.global
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn reader(&self) -> &Reader {
        &self.reader
    }

    /// Statistics of the most recent top-level evaluation
    pub fn stats(&self) -> EvalStats {
        self.evaluator.stats()
    }

    /// Evaluate an already read expression in the global environment
    pub fn eval(&mut self, expr: &Value) -> Value {
        self.evaluator.eval(expr, &self.global)
    }

    /// Read and evaluate every datum of `src` in order, stopping at the first error.
    /// Returns the value of the last datum, `Void` for empty input.
    pub fn eval_str(&mut self, src: &str) -> Result<Value, Error> {
        let mut last = Value::Void;
        for expr in self.reader.read_all(src)? {
            last = self.eval(&expr).into_result()?;
        }
        Ok(last)
    }

    /// REPL-level driver: evaluate every datum of `src` and collect the printable
    /// results. Parse errors become error values, `Void` results are dropped, and
    /// a loaded file is evaluated unit by unit in place of its `File` value.
    /// Loads nested deeper than the configured limit yield an error value.
    pub fn interpret(&mut self, src: &str) -> Vec<Value> {
        let mut results = Vec::new();
        self.interpret_into(src, 0, &mut results);
        results
    }

    fn interpret_into(&mut self, src: &str, load_depth: usize, results: &mut Vec<Value>) {
        debug!(input = src, "interpreting");
        let data = match self.reader.read_all(src) {
            Ok(data) => data,
            Err(err) => {
                results.push(Value::error(format!("ParseError: {err}")));
                return;
            }
        };
        for expr in data {
            match self.eval(&expr) {
                Value::Void => {}
                Value::File(file) => self.interpret_file(&file, load_depth, results),
                value => results.push(value),
            }
        }
    }

    fn interpret_file(
        &mut self,
        file: &Rc<SchemeFile>,
        load_depth: usize,
        results: &mut Vec<Value>,
    ) {
        if load_depth >= self.max_load_depth {
            results.push(Value::error(format!(
                "load: {} is nested more than {} files deep",
                file.path, self.max_load_depth
            )));
            return;
        }
        debug!(path = %file.path, lines = file.line_count(), load_depth, "loading file");
        for unit in file.units() {
            self.interpret_into(&unit, load_depth + 1, results);
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_eval_str_returns_last_value() {
        let mut interp = Interpreter::default();
        assert_eq!(interp.eval_str("(define x 34) (+ 123 x 43 4)").unwrap(), Value::from(204));
        assert_eq!(interp.eval_str("").unwrap(), Value::Void);
        assert_eq!(
            interp.eval_str("zzz"),
            Err(Error::Input("Unbound variable: zzz".into()))
        );
        assert!(matches!(interp.eval_str("(+ 1"), Err(Error::Parse(_))));
        // earlier definitions survive a failed input
        assert_eq!(interp.eval_str("x").unwrap(), Value::from(34));
    }

    #[test]
    fn test_eval_str_stops_at_first_error() {
        let mut interp = Interpreter::default();
        assert!(interp.eval_str("(define a 1) (car a) (define b 2)").is_err());
        assert_eq!(interp.eval_str("a").unwrap(), Value::from(1));
        assert!(interp.eval_str("b").is_err());
    }

    #[test]
    fn test_interpret_drops_void_and_reports_errors() {
        let mut interp = Interpreter::default();
        let results = interp.interpret("(define x 1) x (car x) (+ x 1)");
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], Value::from(1));
        assert!(matches!(&results[1], Value::Error(_)));
        assert_eq!(results[2], Value::from(2));

        let results = interp.interpret("(1 2");
        assert!(matches!(&results[..], [Value::Error(d)] if d.message.starts_with("ParseError")));
    }

    #[test]
    fn test_interpret_expands_loaded_files() {
        let dir = std::env::temp_dir();
        let pid = std::process::id();
        let inner = dir.join(format!("cpscheme-inner-{pid}.scm"));
        let outer = dir.join(format!("cpscheme-outer-{pid}.scm"));
        std::fs::write(&inner, "(define (square n)\n  (* n n))\n").unwrap();
        std::fs::write(
            &outer,
            format!("; outer file\n(load \"{}\")\n(square 7)\n(square\n 8)\n", inner.display()),
        )
        .unwrap();

        let mut interp = Interpreter::default();
        let results = interp.interpret(&format!("(load \"{}\") (square 2)", outer.display()));
        std::fs::remove_file(&inner).unwrap();
        std::fs::remove_file(&outer).unwrap();

        assert_eq!(results, vec![Value::from(49), Value::from(64), Value::from(4)]);
    }

    #[test]
    fn test_self_loading_file_stops_at_load_limit() {
        let path = std::env::temp_dir().join(format!("cpscheme-self-{}.scm", std::process::id()));
        std::fs::write(&path, format!("(load \"{}\")\n(+ 1 1)\n", path.display())).unwrap();

        let mut interp = Interpreter::new(InterpreterConfig::default().with_max_load_depth(3));
        let results = interp.interpret(&format!("(load \"{}\")", path.display()));
        std::fs::remove_file(&path).unwrap();

        assert_eq!(results.len(), 4, "{results:?}");
        let Value::Error(diagnostic) = &results[0] else {
            panic!("expected a load error first, got {results:?}");
        };
        assert!(diagnostic.message.contains("nested more than 3 files"));
        assert_eq!(&results[1..], &[Value::from(2), Value::from(2), Value::from(2)]);
        // the session is still usable
        assert_eq!(interp.eval_str("(+ 2 2)").unwrap(), Value::from(4));
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut first = Interpreter::default();
        let config = InterpreterConfig::default().with_environment_capacity(2);
        let mut second = Interpreter::new(config);
        first.eval_str("(define only-here 1)").unwrap();
        assert!(second.eval_str("only-here").is_err());
        assert!(!first.symbols().same_table(second.symbols()));
        assert!(first.global().symbols().same_table(first.reader().symbols()));
    }
}
