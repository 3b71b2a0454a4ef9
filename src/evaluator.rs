//! The continuation trampoline.
//!
//! Evaluation never recurses on the host stack. Pending work is a [`Step`] on the
//! continuation stack, intermediate values travel on the [`OperandStack`], and one
//! result register carries the value each step produced. [`Evaluator::eval`] pushes
//! a sentinel, schedules the first step and runs steps until the sentinel comes
//! back off the stack.
//!
//! ## Calls
//!
//! A call `(f a b)` leaves this layout on the operand stack before it is applied:
//!
//! ```text
//! ... f  a  b
//!        ^ first argument index
//! ```
//!
//! While the arguments are evaluated, the first argument index travels on top of
//! the evaluated arguments as an integer marker. Builtins receive the index and
//! take `a b` off in one [`OperandStack::get_objects`] call. User functions bind
//! them in a fresh scope nested in the closure's home environment and schedule
//! their body. The last body expression is scheduled as a bare
//! [`Step::Evaluate`], with no step of the callee left behind it, so tail calls do
//! not grow the continuation stack.
//!
//! ## Errors
//!
//! Steps return `Result<(), Fault>`. A fault, or a builtin that returns an error
//! value, clears the continuation stack down to the sentinel, drops whatever the
//! failed evaluation left on the operand stack and puts the error value in the
//! result register.

mod syntax;

use crate::ast::{Cons, Diagnostic, SyntaxKind, TrampolineOp, UserFunction, Value};
use crate::config::DEFAULT_OPERAND_STACK_CAPACITY;
use crate::environment::Environment;
use crate::stack::OperandStack;
use crate::symbol::Symbol;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// One resumable unit of pending work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Pops `(expr, env)`; looks symbols up, hands lists to [`Step::ListEval`]
    Evaluate,
    /// Pops `(list, env)`; evaluates the head
    ListEval,
    /// Dispatches on the evaluated head
    ListEvalHead,
    /// Files one evaluated argument and moves to the next
    ArgEvaluated,
    /// Pops the first argument index and calls the function below the arguments
    Apply,
    /// Discards a body value and continues with the rest of the body
    BodyNext,
    /// Runs a special form on its unevaluated arguments
    Syntax(SyntaxKind),
    /// Picks an `if` branch once the condition is evaluated
    IfBranch,
    /// Finishes `set!`
    SetAssign,
    /// Finishes the `(define name expr)` form
    DefineBind,
    /// Runs a trampoline function on its unevaluated arguments
    Trampoline(TrampolineOp),
}

/// A condition that aborts the current evaluation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Fault {
    /// The program is wrong
    #[error("{0}")]
    Input(Rc<Diagnostic>),
    /// The evaluator broke one of its own invariants
    #[error("{0}")]
    Fatal(Rc<Diagnostic>),
}

impl Fault {
    #[track_caller]
    pub fn input(message: impl Into<String>) -> Self {
        Fault::Input(Rc::new(Diagnostic::new(message)))
    }

    #[track_caller]
    pub fn fatal(message: impl Into<String>) -> Self {
        Fault::Fatal(Rc::new(Diagnostic::new(message)))
    }

    pub fn into_value(self) -> Value {
        match self {
            Fault::Input(diagnostic) => Value::Error(diagnostic),
            Fault::Fatal(diagnostic) => Value::FatalError(diagnostic),
        }
    }
}

type StepResult = Result<(), Fault>;

/// Counters for the most recent [`Evaluator::eval`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalStats {
    /// Steps executed
    pub steps: u64,
    /// Highest number of pending steps, sentinel excluded
    pub max_continuation_depth: usize,
    /// Highest number of operand stack slots in use by this evaluation
    pub max_operand_depth: usize,
}

/// Owns the operand stack, the continuation stack and the result register.
pub struct Evaluator {
    operands: OperandStack,
    /// `None` is the sentinel that ends a trampoline run
    continuations: Vec<Option<Step>>,
    result: Value,
    stats: EvalStats,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OPERAND_STACK_CAPACITY)
    }

    pub fn with_capacity(operand_capacity: usize) -> Self {
        Evaluator {
            operands: OperandStack::with_capacity(operand_capacity),
            continuations: Vec::new(),
            result: Value::Void,
            stats: EvalStats::default(),
        }
    }

    /// Evaluate `expr` in `env` and return its value.
    ///
    /// Failures come back as [`Value::Error`] or [`Value::FatalError`]; in both
    /// cases the evaluator is ready for the next call.
    pub fn eval(&mut self, expr: &Value, env: &Environment) -> Value {
        let operand_base = self.operands.pointer();
        let continuation_base = self.continuations.len();
        self.operands.reset_high_water();
        self.stats = EvalStats::default();
        self.result = Value::Void;

        self.operands.push(expr.clone());
        self.operands.push(Value::Environment(env.clone()));
        self.continuations.push(None);
        self.continuations.push(Some(Step::Evaluate));

        while let Some(Some(step)) = self.continuations.pop() {
            self.stats.steps += 1;
            let depth = self.continuations.len() - continuation_base;
            trace!(?step, depth, "step");
            if let Err(fault) = self.run(step) {
                self.abort(fault, operand_base, continuation_base);
                break;
            }
            let pending = (self.continuations.len() - continuation_base).saturating_sub(1);
            self.stats.max_continuation_depth = self.stats.max_continuation_depth.max(pending);
        }

        self.stats.max_operand_depth = self.operands.high_water() - operand_base;
        if self.operands.pointer() != operand_base && !self.result.is_error() {
            let leftover = self.operands.pointer() - operand_base;
            self.operands.truncate(operand_base);
            self.result = Value::fatal_error(format!(
                "evaluation left {leftover} values on the operand stack"
            ));
        }
        std::mem::replace(&mut self.result, Value::Void)
    }

    /// Statistics of the most recent evaluation
    pub fn stats(&self) -> EvalStats {
        self.stats
    }

    /// Operand stack slots currently in use
    pub fn operand_depth(&self) -> usize {
        self.operands.pointer()
    }

    fn abort(&mut self, fault: Fault, operand_base: usize, continuation_base: usize) {
        debug!(
            %fault,
            pending = self.continuations.len() - continuation_base,
            "evaluation aborted"
        );
        self.continuations.truncate(continuation_base);
        self.operands.truncate(operand_base);
        self.result = fault.into_value();
    }

    fn run(&mut self, step: Step) -> StepResult {
        match step {
            Step::Evaluate => self.evaluate(),
            Step::ListEval => self.list_eval(),
            Step::ListEvalHead => self.list_eval_head(),
            Step::ArgEvaluated => self.arg_evaluated(),
            Step::Apply => self.apply(),
            Step::BodyNext => self.body_next(),
            Step::Syntax(kind) => self.syntax(kind),
            Step::IfBranch => self.if_branch(),
            Step::SetAssign => self.set_assign(),
            Step::DefineBind => self.define_bind(),
            Step::Trampoline(op) => self.trampoline(op),
        }
    }

    //
    // Stack helpers
    //

    fn schedule(&mut self, step: Step) {
        self.continuations.push(Some(step));
    }

    /// Push `(expr, env)` and schedule its evaluation
    fn schedule_eval(&mut self, expr: Value, env: &Environment) {
        self.operands.push(expr);
        self.operands.push(Value::Environment(env.clone()));
        self.schedule(Step::Evaluate);
    }

    fn take_result(&mut self) -> Value {
        std::mem::replace(&mut self.result, Value::Void)
    }

    #[track_caller]
    fn pop_value(&mut self) -> Result<Value, Fault> {
        match self.operands.pop() {
            Some(value) => Ok(value),
            None => Err(Fault::fatal("operand stack underflow")),
        }
    }

    #[track_caller]
    fn pop_env(&mut self) -> Result<Environment, Fault> {
        match self.operands.pop() {
            Some(Value::Environment(env)) => Ok(env),
            Some(other) => Err(Fault::fatal(format!(
                "expected ENVIRONMENT on the operand stack, found {}",
                other.type_name()
            ))),
            None => Err(Fault::fatal("operand stack underflow")),
        }
    }

    #[track_caller]
    fn pop_cons(&mut self) -> Result<Cons, Fault> {
        match self.operands.pop() {
            Some(Value::Cons(cell)) => Ok(cell),
            Some(other) => Err(Fault::fatal(format!(
                "expected CONS on the operand stack, found {}",
                other.type_name()
            ))),
            None => Err(Fault::fatal("operand stack underflow")),
        }
    }

    #[track_caller]
    fn pop_symbol(&mut self) -> Result<Symbol, Fault> {
        match self.operands.pop() {
            Some(Value::Symbol(symbol)) => Ok(symbol),
            Some(other) => Err(Fault::fatal(format!(
                "expected SYMBOL on the operand stack, found {}",
                other.type_name()
            ))),
            None => Err(Fault::fatal("operand stack underflow")),
        }
    }

    #[track_caller]
    fn pop_index(&mut self) -> Result<usize, Fault> {
        match self.operands.pop() {
            Some(Value::Integer(n)) if n > 0 => Ok(n as usize),
            Some(other) => Err(Fault::fatal(format!(
                "expected argument index on the operand stack, found {other:?}"
            ))),
            None => Err(Fault::fatal("operand stack underflow")),
        }
    }

    //
    // Steps
    //

    fn evaluate(&mut self) -> StepResult {
        let env = self.pop_env()?;
        let expr = self.pop_value()?;
        match expr {
            Value::Symbol(symbol) => match env.get(&symbol) {
                Some(value) => self.result = value,
                None => return Err(Fault::input(format!("Unbound variable: {symbol}"))),
            },
            Value::Cons(_) => {
                self.operands.push(expr);
                self.operands.push(Value::Environment(env));
                self.schedule(Step::ListEval);
            }
            Value::Integer(_)
            | Value::Double(_)
            | Value::String(_)
            | Value::Char(_)
            | Value::False
            | Value::True
            | Value::Null
            | Value::Void
            | Value::Environment(_)
            | Value::Syntax(_)
            | Value::Builtin(_)
            | Value::Trampoline(_)
            | Value::Function(_)
            | Value::Error(_)
            | Value::FatalError(_)
            | Value::File(_) => self.result = expr,
        }
        Ok(())
    }

    fn list_eval(&mut self) -> StepResult {
        let env = self.pop_env()?;
        let list = self.pop_cons()?;
        // argument list and environment wait below the head's evaluation
        self.operands.push(list.cdr());
        self.operands.push(Value::Environment(env.clone()));
        self.schedule(Step::ListEvalHead);
        self.schedule_eval(list.car(), &env);
        Ok(())
    }

    fn list_eval_head(&mut self) -> StepResult {
        let head = self.take_result();
        let env = self.pop_env()?;
        let args = self.pop_value()?;
        match head {
            Value::Syntax(kind) => {
                self.operands.push(args);
                self.operands.push(Value::Environment(env));
                self.schedule(Step::Syntax(kind));
            }
            Value::Trampoline(op) => {
                self.operands.push(args);
                self.operands.push(Value::Environment(env));
                self.schedule(Step::Trampoline(op));
            }
            Value::Builtin(_) | Value::Function(_) => {
                self.operands.push(head);
                let first_arg_index = self.operands.pointer();
                self.operands.push(Value::Integer(first_arg_index as i64));
                self.next_argument(args, env)?;
            }
            Value::Integer(_)
            | Value::Double(_)
            | Value::String(_)
            | Value::Char(_)
            | Value::Cons(_)
            | Value::Symbol(_)
            | Value::False
            | Value::True
            | Value::Null
            | Value::Void
            | Value::Environment(_)
            | Value::Error(_)
            | Value::FatalError(_)
            | Value::File(_) => {
                return Err(Fault::input(format!("Not applicable: {head}")));
            }
        }
        Ok(())
    }

    /// Schedule evaluation of the first of `args`, or the call itself when none are left.
    /// Expects the first argument index on top of the operand stack.
    fn next_argument(&mut self, args: Value, env: Environment) -> StepResult {
        match args {
            Value::Cons(cell) => {
                let expr = cell.car();
                self.operands.push(Value::Cons(cell));
                self.operands.push(Value::Environment(env.clone()));
                self.schedule(Step::ArgEvaluated);
                self.schedule_eval(expr, &env);
                Ok(())
            }
            Value::Null => {
                self.schedule(Step::Apply);
                Ok(())
            }
            other => Err(Fault::input(format!(
                "Improper argument list ending in {other}"
            ))),
        }
    }

    fn arg_evaluated(&mut self) -> StepResult {
        let value = self.take_result();
        let env = self.pop_env()?;
        let args = self.pop_cons()?;
        let first_arg_index = self.pop_index()?;
        self.operands.push(value);
        self.operands.push(Value::Integer(first_arg_index as i64));
        self.next_argument(args.cdr(), env)
    }

    fn apply(&mut self) -> StepResult {
        let first_arg_index = self.pop_index()?;
        let function = match self.operands.get(first_arg_index - 1) {
            Some(function) => function.clone(),
            None => return Err(Fault::fatal("no function below the argument index")),
        };

        match function {
            Value::Builtin(builtin) => {
                let value = (builtin.func)(first_arg_index, &mut self.operands);
                if self.operands.pointer() != first_arg_index {
                    warn!(
                        builtin = %builtin.name,
                        expected = first_arg_index,
                        found = self.operands.pointer(),
                        "builtin broke the argument stack contract"
                    );
                    return Err(Fault::fatal(format!(
                        "builtin {} did not take its arguments off the stack",
                        builtin.name
                    )));
                }
                self.pop_value()?;
                match value {
                    Value::Error(diagnostic) => return Err(Fault::Input(diagnostic)),
                    Value::FatalError(diagnostic) => return Err(Fault::Fatal(diagnostic)),
                    value => self.result = value,
                }
                Ok(())
            }
            Value::Function(function) => {
                let args = self.operands.get_objects(first_arg_index);
                self.pop_value()?;
                let scope = bind_arguments(&function, args.into_iter())?;
                self.schedule_body(Value::Cons(function.body.clone()), &scope)
            }
            other => Err(Fault::fatal(format!(
                "apply reached a non-function: {}",
                other.type_name()
            ))),
        }
    }

    /// Schedule a body sequence. The last expression is scheduled alone, in tail
    /// position; earlier ones are followed by [`Step::BodyNext`].
    fn schedule_body(&mut self, body: Value, env: &Environment) -> StepResult {
        let Value::Cons(cell) = body else {
            return Err(Fault::input(format!("Malformed body ending in {body}")));
        };
        if cell.is_last() {
            self.schedule_eval(cell.car(), env);
        } else {
            self.operands.push(cell.cdr());
            self.operands.push(Value::Environment(env.clone()));
            self.schedule(Step::BodyNext);
            self.schedule_eval(cell.car(), env);
        }
        Ok(())
    }

    fn body_next(&mut self) -> StepResult {
        self.take_result();
        let env = self.pop_env()?;
        let rest = self.pop_value()?;
        self.schedule_body(rest, &env)
    }

    fn trampoline(&mut self, op: TrampolineOp) -> StepResult {
        let env = self.pop_env()?;
        let args = self.pop_value()?;
        match op {
            TrampolineOp::Eval => {
                // the argument is evaluated once, in the caller's scope, and its
                // value is the result
                let expr = single_argument(&args, "eval")?;
                self.schedule_eval(expr, &env);
                Ok(())
            }
        }
    }
}

/// The only element of a one-element list
fn single_argument(args: &Value, form: &str) -> Result<Value, Fault> {
    match args {
        Value::Cons(cell) if cell.is_last() => Ok(cell.car()),
        _ => Err(Fault::input(format!("{form} expects exactly one argument"))),
    }
}

/// Bind formals to actual arguments in a fresh scope nested in the closure's home
fn bind_arguments(
    function: &UserFunction,
    mut args: impl ExactSizeIterator<Item = Value>,
) -> Result<Environment, Fault> {
    let scope = function.home.child();
    let given = args.len();
    let mut formals = function.formals.iter();
    for formal in formals.by_ref() {
        let Value::Symbol(name) = formal else {
            return Err(Fault::input(format!("Parameter is not a symbol: {formal}")));
        };
        let Some(value) = args.next() else {
            return Err(Fault::input(format!(
                "Too few arguments: expected {}, got {given}",
                function.formals.iter().count()
            )));
        };
        scope.insert_or_update(name, value);
    }
    if !formals.tail().is_null() {
        return Err(Fault::input(format!(
            "Malformed parameter list: {}",
            Value::Function(function.clone())
        )));
    }
    if args.len() > 0 {
        return Err(Fault::input(format!(
            "Too many arguments: expected {}, got {given}",
            given - args.len()
        )));
    }
    Ok(scope)
}

#[cfg(all(test, feature = "scheme"))]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::builtinops::initialize_builtins;
    use crate::scheme::parse_scheme;
    use crate::symbol::SymbolTable;
    use pretty_assertions::assert_eq;

    /// Test result variants for comprehensive testing
    #[derive(Debug)]
    enum TestResult {
        EvalResult(Value),           // Evaluation should succeed with this value
        SpecificError(&'static str), // Evaluation should fail with error containing this string
        Error,                       // Evaluation should fail (any error)
    }
    use TestResult::*;

    /// Test environment containing test cases that share state
    struct TestEnvironment(Vec<(&'static str, TestResult)>);

    fn success<T: Into<Value>>(value: T) -> TestResult {
        EvalResult(value.into())
    }

    /// Setup expressions that evaluate to Void (like define)
    macro_rules! test_setup {
        ($expr:expr) => {
            ($expr, EvalResult(Value::Void))
        };
    }

    fn global_env() -> Environment {
        let env = Environment::new_global(SymbolTable::default(), 20);
        initialize_builtins(&env);
        env
    }

    fn execute_test_case(
        input: &str,
        expected: &TestResult,
        evaluator: &mut Evaluator,
        env: &Environment,
        test_id: &str,
    ) {
        let expr = match parse_scheme(input, env.symbols()) {
            Ok(expr) => expr,
            Err(parse_err) => {
                panic!("{test_id}: unexpected parse error for '{input}': {parse_err:?}");
            }
        };

        let actual = evaluator.eval(&expr, env);
        assert!(
            !matches!(actual, Value::FatalError(_)),
            "{test_id}: evaluator invariant broken for '{input}': {actual:?}"
        );
        assert_eq!(evaluator.operand_depth(), 0, "{test_id}: operand stack not balanced");

        match (actual.into_result(), expected) {
            (Ok(actual), EvalResult(expected_val)) => {
                assert!(
                    actual == *expected_val,
                    "{test_id}: '{input}' expected {expected_val:?}, got {actual:?}"
                );
            }
            (Err(_), Error) => {}
            (Err(e), SpecificError(expected_text)) => {
                let error_msg = format!("{e}");
                assert!(
                    error_msg.contains(expected_text),
                    "{test_id}: error should contain '{expected_text}', got: {error_msg}"
                );
            }
            (Ok(actual), Error) => {
                panic!("{test_id}: '{input}' expected error, got {actual:?}");
            }
            (Ok(actual), SpecificError(expected_text)) => {
                panic!("{test_id}: '{input}' expected error containing '{expected_text}', got {actual:?}");
            }
            (Err(err), EvalResult(expected_val)) => {
                panic!("{test_id}: '{input}' expected {expected_val:?}, got error {err:?}");
            }
        }
    }

    fn run_tests_in_environment(test_environments: Vec<TestEnvironment>) {
        for (env_idx, TestEnvironment(test_cases)) in test_environments.iter().enumerate() {
            let env = global_env();
            let mut evaluator = Evaluator::new();
            for (test_idx, (input, expected)) in test_cases.iter().enumerate() {
                let test_id = format!("Environment #{} test #{}", env_idx + 1, test_idx + 1);
                execute_test_case(input, expected, &mut evaluator, &env, &test_id);
            }
        }
    }

    fn run_comprehensive_tests(test_cases: Vec<(&str, TestResult)>) {
        for (i, (input, expected)) in test_cases.iter().enumerate() {
            let env = global_env();
            let mut evaluator = Evaluator::new();
            let test_id = format!("#{}", i + 1);
            execute_test_case(input, expected, &mut evaluator, &env, &test_id);
        }
    }

    fn list_of(env: &Environment, src: &str) -> Value {
        parse_scheme(src, env.symbols()).unwrap()
    }

    #[test]
    fn test_self_evaluating_and_simple_calls() {
        run_comprehensive_tests(vec![
            ("42", success(42)),
            ("-271", success(-271)),
            ("2.5", success(2.5)),
            ("\"hi\"", success("hi")),
            ("#\\a", success('a')),
            ("#t", success(true)),
            ("#f", success(false)),
            ("(+ 123 123 43 4)", success(293)),
            ("(- 123 123 43 4)", success(-47)),
            ("(* 123 123 43 4)", success(2_602_188)),
            ("(+)", success(0)),
            ("(+ 1 (* 2 3) (- 10 4))", success(13)),
            ("zzz", SpecificError("Unbound variable: zzz")),
            ("(zzz 1 2)", SpecificError("Unbound variable: zzz")),
            ("(1 2 3)", SpecificError("Not applicable")),
            ("(\"f\")", SpecificError("Not applicable")),
            ("(+ 1 . 2)", SpecificError("Improper argument list")),
            ("(+ 1 (car 5))", Error),
        ]);
    }

    #[test]
    fn test_special_forms() {
        run_comprehensive_tests(vec![
            ("(if #t 1 2)", success(1)),
            ("(if #f 1 2)", success(2)),
            ("(if 3 1 2)", SpecificError("non-boolean")),
            ("(if #t 1)", SpecificError("if")),
            ("(if #t 1 2 3)", SpecificError("if")),
            ("(if (< 1 2) (+ 1 1) undefined-name)", success(2)),
            ("(quote 5)", success(5)),
            ("'#t", success(true)),
            ("(quote)", SpecificError("quote expects exactly one argument")),
            ("(quote 1 2)", SpecificError("quote expects exactly one argument")),
            ("(begin)", EvalResult(Value::Void)),
            ("(begin 1 2 3)", success(3)),
            ("(begin (define x 4) (* x x))", success(16)),
            ("((lambda (x y) (+ x y)) 3 4)", success(7)),
            ("((lambda (x) 1 2 x) 9)", success(9)),
            ("(lambda () 1)", SpecificError("lambda")),
            ("(lambda (x))", SpecificError("lambda")),
            ("(lambda (x 1) x)", SpecificError("not a symbol")),
            ("((lambda (x y) x) 1)", SpecificError("Too few arguments")),
            ("((lambda (x) x) 1 2)", SpecificError("Too many arguments")),
            ("(define)", SpecificError("define")),
            ("(define 5 6)", SpecificError("define")),
            ("(define x)", SpecificError("define")),
            ("(define x 1 2)", SpecificError("define")),
            ("(define (f) 1)", SpecificError("define")),
            ("(define (f 3) 1)", SpecificError("not a symbol")),
            ("(define (f x))", SpecificError("define")),
            ("(set! undefined-name 1)", SpecificError("set!")),
            ("(set! 5 1)", SpecificError("set!")),
            ("(equal? (eval '(+ 1 2)) '(+ 1 2))", success(true)),
            ("(eval (+ 1 2))", success(3)),
            ("(eval 5)", success(5)),
            ("(eval)", SpecificError("eval expects exactly one argument")),
            ("(eval 1 2)", SpecificError("eval expects exactly one argument")),
        ]);
    }

    #[test]
    fn test_definitions_and_state() {
        run_tests_in_environment(vec![
            TestEnvironment(vec![
                test_setup!("(define x 34)"),
                ("(+ 123 x 43 4)", success(204)),
                test_setup!("(set! x 1)"),
                ("x", success(1)),
                test_setup!("(define x 2)"),
                ("x", success(2)),
            ]),
            TestEnvironment(vec![
                test_setup!("(define somefunc (lambda (a b) (+ a b 1)))"),
                ("(somefunc 2 3)", success(6)),
                test_setup!("(define (inc n) (+ n 1))"),
                ("(inc (somefunc 1 1))", success(4)),
            ]),
            TestEnvironment(vec![
                test_setup!("(define fib (lambda (n) (if (< n 2) 1 (+ (fib (- n 1)) (fib (- n 2))))))"),
                ("(fib 10)", success(89)),
                test_setup!("(define (factorial n) (if (= n 0) 1 (* n (factorial (- n 1)))))"),
                ("(factorial 4)", success(24)),
            ]),
            TestEnvironment(vec![
                // closures capture their defining scope
                test_setup!("(define (adder n) (lambda (x) (+ x n)))"),
                test_setup!("(define add5 (adder 5))"),
                ("(add5 10)", success(15)),
                ("((adder 1) 1)", success(2)),
            ]),
            TestEnvironment(vec![
                // set! only sees the local scope
                test_setup!("(define counter 0)"),
                test_setup!("(define (bump) (set! counter (+ counter 1)))"),
                ("(bump)", SpecificError("set!")),
                ("counter", success(0)),
                test_setup!("(define (local-bump c) (set! c (+ c 1)) c)"),
                ("(local-bump 41)", success(42)),
            ]),
            TestEnvironment(vec![
                // a failure leaves the session usable
                test_setup!("(define y 1)"),
                ("(+ y (car 1))", Error),
                ("(+ y 1)", success(2)),
                ("(if y 1 2)", SpecificError("non-boolean")),
                ("y", success(1)),
            ]),
            TestEnvironment(vec![
                // eval runs in the calling scope
                test_setup!("(define (f x) (eval x))"),
                ("(f 7)", success(7)),
                ("(eq? (f 'x) 'x)", success(true)),
                test_setup!("(define code '(* 6 7))"),
                // the quoted form comes back as data, not as its value
                ("(equal? (eval code) code)", success(true)),
                ("(equal? (eval ''(+ 1 1)) ''(+ 1 1))", success(true)),
            ]),
        ]);
    }

    #[test]
    fn test_shorthand_define_shape() {
        let env = global_env();
        let mut evaluator = Evaluator::new();
        let def = list_of(&env, "(define (<= a b) (> a b))");
        assert_eq!(evaluator.eval(&def, &env), Value::Void);

        let Some(Value::Function(function)) = env.get_by_name("<=") else {
            panic!("<= should be bound to a user function");
        };
        assert_eq!(Value::Cons(function.formals.clone()), list_of(&env, "(a b)"));
        assert_eq!(Value::Cons(function.body.clone()), list_of(&env, "((> a b))"));
        assert!(function.home.ptr_eq(&env));

        let call = list_of(&env, "(<= 1 2)");
        assert_eq!(evaluator.eval(&call, &env), Value::False);
    }

    #[test]
    fn test_tail_calls_run_in_constant_continuation_depth() {
        let env = global_env();
        let mut evaluator = Evaluator::new();
        let def = list_of(
            &env,
            "(define (count n acc) (if (= n 0) acc (count (- n 1) (+ acc 1))))",
        );
        evaluator.eval(&def, &env);

        let mut depths = Vec::new();
        for n in [10, 1_000, 100_000] {
            let call = list_of(&env, &format!("(count {n} 0)"));
            assert_eq!(evaluator.eval(&call, &env), Value::from(n));
            depths.push(evaluator.stats().max_continuation_depth);
        }
        assert!(depths.iter().all(|d| *d == depths[0]), "depths grew: {depths:?}");
        assert!(evaluator.stats().steps > 100_000);
    }

    #[test]
    fn test_non_tail_recursion_grows_continuation_depth() {
        let env = global_env();
        let mut evaluator = Evaluator::new();
        let def = list_of(
            &env,
            "(define (sum n) (if (= n 0) 0 (+ n (sum (- n 1)))))",
        );
        evaluator.eval(&def, &env);

        let call = list_of(&env, "(sum 10)");
        assert_eq!(evaluator.eval(&call, &env), Value::from(55));
        let shallow = evaluator.stats();

        // deep enough that host recursion per call would overflow a test thread
        let call = list_of(&env, "(sum 100000)");
        assert_eq!(evaluator.eval(&call, &env), Value::from(5_000_050_000_i64));
        let deep = evaluator.stats();

        assert!(deep.max_continuation_depth > shallow.max_continuation_depth * 1000);
        assert!(deep.max_operand_depth > shallow.max_operand_depth * 1000);
    }

    #[test]
    fn test_failure_clears_both_stacks() {
        let env = global_env();
        let mut evaluator = Evaluator::new();
        let def = list_of(&env, "(define (deep n) (if (= n 0) (car 0) (+ 1 (deep (- n 1)))))");
        evaluator.eval(&def, &env);

        let call = list_of(&env, "(deep 500)");
        let result = evaluator.eval(&call, &env);
        assert!(matches!(result, Value::Error(_)), "got {result:?}");
        assert_eq!(evaluator.operand_depth(), 0);

        let ok = list_of(&env, "(+ 1 1)");
        assert_eq!(evaluator.eval(&ok, &env), Value::from(2));
    }

    fn leaves_arguments(_first_arg_index: usize, _stack: &mut OperandStack) -> Value {
        Value::from(1)
    }

    fn returns_fatal(first_arg_index: usize, stack: &mut OperandStack) -> Value {
        stack.get_objects(first_arg_index);
        Value::fatal_error("host invariant")
    }

    #[test]
    fn test_builtin_contract_violations_are_fatal() {
        let env = global_env();
        crate::builtinops::register_builtin(&env, "leaky", leaves_arguments);
        crate::builtinops::register_builtin(&env, "fatal", returns_fatal);
        let mut evaluator = Evaluator::new();

        let result = evaluator.eval(&list_of(&env, "(leaky 1 2)"), &env);
        assert!(matches!(&result, Value::FatalError(d) if d.message.contains("leaky")));
        assert_eq!(evaluator.operand_depth(), 0);

        let result = evaluator.eval(&list_of(&env, "(+ 1 (fatal))"), &env);
        assert!(matches!(&result, Value::FatalError(d) if d.message == "host invariant"));
        assert_eq!(evaluator.operand_depth(), 0);
    }

    #[test]
    fn test_fatal_error_records_detection_point() {
        let mut evaluator = Evaluator::new();
        let env = global_env();
        // corrupt the protocol by hand: Apply with no index on the stack
        evaluator.continuations.push(None);
        evaluator.continuations.push(Some(Step::Apply));
        let fault = evaluator.run(Step::Apply).unwrap_err();
        let Fault::Fatal(diagnostic) = fault else {
            panic!("expected a fatal fault");
        };
        assert!(diagnostic.origin.file().ends_with("evaluator.rs"));
        assert_eq!(diagnostic.message, "operand stack underflow");

        evaluator.continuations.clear();
        assert_eq!(evaluator.eval(&Value::from(3), &env), Value::from(3));
    }
}
