//! Built-in operations registry.
//!
//! Every primitive is defined once in [`BUILTIN_OPS`] with its Scheme identifier,
//! its arity and its body. [`initialize_builtins`] binds all of them, the special
//! form tags and `eval` into an environment.
//!
//! ## Calling convention
//!
//! The evaluator calls a builtin with the operand stack position of its first
//! evaluated argument. The generated entry point takes the arguments off the stack
//! with exactly one [`OperandStack::get_objects`] call, checks the arity and runs
//! the body on the argument slice. Bodies never see the stack.
//!
//! ## Error Handling
//!
//! - **Type Safety**: Operations reject incorrect types (e.g., `(car 42)` errors)
//! - **No Coercion**: Numbers don't become strings, `if` conditions must be booleans
//! - **Overflow Detection**: Integer arithmetic detects and reports overflow
//! - **Arity Checking**: Argument counts are validated for all functions
//!
//! A failing body produces an error value, which aborts the evaluation that
//! called it.
//!
//! ## Adding New Operations
//!
//! 1. **Implement the body** following the signature `fn(args: &[Value]) -> Result<Value, Error>`
//! 2. **Add it to the `builtin_ops!` table** with its Scheme identifier and arity
//! 3. **Add tests** covering edge cases and error conditions

use crate::Error;
use crate::ast::{
    Builtin, BuiltinFn, NumberType, SchemeFile, SchemeString, SyntaxKind, TrampolineOp, Value,
};
use crate::environment::Environment;
use crate::stack::OperandStack;
use std::cmp::Ordering;
use std::fmt;
use std::io::Write;
use std::rc::Rc;

/// Expected number of arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly n arguments
    Exact(usize),
    /// At least n arguments
    AtLeast(usize),
    /// Between min and max arguments (inclusive)
    Range(usize, usize),
}

impl Arity {
    pub fn validate(self, arg_count: usize) -> Result<(), Error> {
        let ok = match self {
            Arity::Exact(n) => arg_count == n,
            Arity::AtLeast(n) => arg_count >= n,
            Arity::Range(min, max) => (min..=max).contains(&arg_count),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Input(format!(
                "expected {self} argument{}, got {arg_count}",
                if matches!(self, Arity::Exact(1) | Arity::AtLeast(1)) { "" } else { "s" }
            )))
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
            Arity::Range(min, max) => write!(f, "{min} to {max}"),
        }
    }
}

/// Definition of a built-in operation
#[derive(Debug, Clone, Copy)]
pub struct BuiltinOp {
    /// The Scheme identifier for this operation
    pub scheme_id: &'static str,
    /// Expected number of arguments
    pub arity: Arity,
    /// Stack-convention entry point
    pub func: BuiltinFn,
}

impl PartialEq for BuiltinOp {
    fn eq(&self, other: &Self) -> bool {
        self.scheme_id == other.scheme_id
    }
}

impl BuiltinOp {
    pub fn to_value(&self) -> Value {
        Value::Builtin(Builtin {
            name: Rc::from(self.scheme_id),
            func: self.func,
        })
    }
}

/// Shared entry point behind every generated builtin
fn call(
    first_arg_index: usize,
    stack: &mut OperandStack,
    name: &str,
    arity: Arity,
    body: fn(&[Value]) -> Result<Value, Error>,
) -> Value {
    let args = stack.get_objects(first_arg_index);
    match arity.validate(args.len()).and_then(|()| body(&args)) {
        Ok(value) => value,
        Err(Error::Fatal(message)) => Value::fatal_error(format!("{name}: {message}")),
        Err(Error::Parse(err)) => Value::error(format!("{name}: {err}")),
        Err(Error::Input(message) | Error::Io(message)) => {
            Value::error(format!("{name}: {message}"))
        }
    }
}

/// Generates one stack-convention entry point per body and the registry table
macro_rules! builtin_ops {
    ($($scheme:literal => $body:ident, $arity:expr;)*) => {
        mod entry {
            use super::*;
            $(
                pub(super) fn $body(first_arg_index: usize, stack: &mut OperandStack) -> Value {
                    super::call(first_arg_index, stack, $scheme, $arity, super::$body)
                }
            )*
        }

        /// Every builtin registered by [`initialize_builtins`]
        pub static BUILTIN_OPS: &[BuiltinOp] = &[
            $(BuiltinOp { scheme_id: $scheme, arity: $arity, func: entry::$body },)*
        ];
    };
}

builtin_ops! {
    // arithmetic
    "+" => builtin_add, Arity::AtLeast(0);
    "-" => builtin_sub, Arity::AtLeast(1);
    "*" => builtin_mul, Arity::AtLeast(0);
    "/" => builtin_div, Arity::AtLeast(1);
    "%" => builtin_rem, Arity::Exact(2);
    "truncate" => builtin_truncate, Arity::Exact(1);
    // comparison
    "=" => builtin_num_eq, Arity::Exact(2);
    "<" => builtin_lt, Arity::Exact(2);
    ">" => builtin_gt, Arity::Exact(2);
    "<=" => builtin_le, Arity::Exact(2);
    ">=" => builtin_ge, Arity::Exact(2);
    "eq?" => builtin_eq, Arity::Exact(2);
    "equal?" => builtin_equal, Arity::Exact(2);
    "not" => builtin_not, Arity::Exact(1);
    // pairs and lists
    "cons" => builtin_cons, Arity::Exact(2);
    "car" => builtin_car, Arity::Exact(1);
    "cdr" => builtin_cdr, Arity::Exact(1);
    "set-car!" => builtin_set_car, Arity::Exact(2);
    "set-cdr!" => builtin_set_cdr, Arity::Exact(2);
    "list" => builtin_list, Arity::AtLeast(0);
    "null?" => builtin_is_null, Arity::Exact(1);
    // strings
    "string-length" => builtin_string_length, Arity::Exact(1);
    "string-ref" => builtin_string_ref, Arity::Exact(2);
    "string-append" => builtin_string_append, Arity::AtLeast(0);
    "string=?" => builtin_string_eq, Arity::Exact(2);
    // predicates
    "string?" => builtin_is_string, Arity::Exact(1);
    "bool?" => builtin_is_bool, Arity::Exact(1);
    "number?" => builtin_is_number, Arity::Exact(1);
    "cons?" => builtin_is_cons, Arity::Exact(1);
    "symbol?" => builtin_is_symbol, Arity::Exact(1);
    "builtin-function?" => builtin_is_builtin, Arity::Exact(1);
    "user-function?" => builtin_is_user_function, Arity::Exact(1);
    "function?" => builtin_is_function, Arity::Exact(1);
    // output and files
    "display" => builtin_display, Arity::Exact(1);
    "print" => builtin_print, Arity::Exact(1);
    "newline" => builtin_newline, Arity::Exact(0);
    "load" => builtin_load, Arity::Exact(1);
}

/// Look up a builtin operation by its Scheme identifier
pub fn find_scheme_op(name: &str) -> Option<&'static BuiltinOp> {
    BUILTIN_OPS.iter().find(|op| op.scheme_id == name)
}

/// Bind every builtin, every special form tag and `eval` into `env`
pub fn initialize_builtins(env: &Environment) {
    for op in BUILTIN_OPS {
        env.define(op.scheme_id, op.to_value());
    }
    for kind in SyntaxKind::ALL {
        env.define(kind.name(), Value::Syntax(kind));
    }
    env.define(TrampolineOp::Eval.name(), Value::Trampoline(TrampolineOp::Eval));
}

/// Bind a host-provided builtin. `func` must follow the stack calling convention
/// described in the module docs.
pub fn register_builtin(env: &Environment, name: &str, func: BuiltinFn) {
    env.define(
        name,
        Value::Builtin(Builtin {
            name: Rc::from(name),
            func,
        }),
    );
}

//
// Argument helpers
//

fn type_error(expected: &str, got: &Value) -> Error {
    Error::Input(format!("expected {expected}, got {} {got}", got.type_name()))
}

fn one(args: &[Value]) -> Result<&Value, Error> {
    match args {
        [a] => Ok(a),
        _ => Err(Error::Fatal(format!("expected 1 argument slot, got {}", args.len()))),
    }
}

fn two(args: &[Value]) -> Result<(&Value, &Value), Error> {
    match args {
        [a, b] => Ok((a, b)),
        _ => Err(Error::Fatal(format!("expected 2 argument slots, got {}", args.len()))),
    }
}

fn string_arg(value: &Value) -> Result<&SchemeString, Error> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(type_error("string", other)),
    }
}

//
// Arithmetic
//

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(NumberType),
    Real(f64),
}

impl Number {
    fn from_value(value: &Value) -> Result<Number, Error> {
        match value {
            Value::Integer(n) => Ok(Number::Int(*n)),
            Value::Double(d) => Ok(Number::Real(*d)),
            other => Err(type_error("number", other)),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Number::Int(n) => n as f64,
            Number::Real(d) => d,
        }
    }

    /// Integer arithmetic while both sides are integers, doubles otherwise
    fn combine(
        self,
        other: Number,
        int_op: fn(NumberType, NumberType) -> Option<NumberType>,
        real_op: fn(f64, f64) -> f64,
        operation: &str,
    ) -> Result<Number, Error> {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => int_op(a, b)
                .map(Number::Int)
                .ok_or_else(|| Error::Input(format!("Integer overflow in {operation}"))),
            (a, b) => Ok(Number::Real(real_op(a.as_f64(), b.as_f64()))),
        }
    }

    fn compare(self, other: Number) -> Option<Ordering> {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        match n {
            Number::Int(n) => Value::Integer(n),
            Number::Real(d) => Value::Double(d),
        }
    }
}

fn builtin_add(args: &[Value]) -> Result<Value, Error> {
    let mut sum = Number::Int(0);
    for arg in args {
        sum = sum.combine(
            Number::from_value(arg)?,
            NumberType::checked_add,
            |a, b| a + b,
            "addition",
        )?;
    }
    Ok(sum.into())
}

fn builtin_sub(args: &[Value]) -> Result<Value, Error> {
    let Some((first, rest)) = args.split_first() else {
        return Err(Error::Fatal("no arguments".into()));
    };
    let first = Number::from_value(first)?;
    if rest.is_empty() {
        return Number::Int(0)
            .combine(first, NumberType::checked_sub, |a, b| a - b, "negation")
            .map(Value::from);
    }
    let mut result = first;
    for arg in rest {
        result = result.combine(
            Number::from_value(arg)?,
            NumberType::checked_sub,
            |a, b| a - b,
            "subtraction",
        )?;
    }
    Ok(result.into())
}

fn builtin_mul(args: &[Value]) -> Result<Value, Error> {
    let mut product = Number::Int(1);
    for arg in args {
        product = product.combine(
            Number::from_value(arg)?,
            NumberType::checked_mul,
            |a, b| a * b,
            "multiplication",
        )?;
    }
    Ok(product.into())
}

/// Always produces a double
fn builtin_div(args: &[Value]) -> Result<Value, Error> {
    let numbers = args
        .iter()
        .map(|arg| Number::from_value(arg).map(Number::as_f64))
        .collect::<Result<Vec<f64>, Error>>()?;
    let (dividend, divisors) = match numbers.as_slice() {
        [only] => (1.0, std::slice::from_ref(only)),
        [first, rest @ ..] => (*first, rest),
        [] => return Err(Error::Fatal("no arguments".into())),
    };
    let mut quotient = dividend;
    for divisor in divisors {
        if *divisor == 0.0 {
            return Err(Error::Input("Division by zero".into()));
        }
        quotient /= divisor;
    }
    Ok(Value::Double(quotient))
}

fn builtin_rem(args: &[Value]) -> Result<Value, Error> {
    match two(args)? {
        (Value::Integer(_), Value::Integer(0)) => Err(Error::Input("Division by zero".into())),
        (Value::Integer(a), Value::Integer(b)) => a
            .checked_rem(*b)
            .map(Value::Integer)
            .ok_or_else(|| Error::Input("Integer overflow in remainder".into())),
        (Value::Integer(_), other) | (other, _) => Err(type_error("integer", other)),
    }
}

fn builtin_truncate(args: &[Value]) -> Result<Value, Error> {
    match one(args)? {
        Value::Integer(n) => Ok(Value::Integer(*n)),
        Value::Double(d) => {
            let truncated = d.trunc();
            if truncated.is_finite()
                && truncated >= NumberType::MIN as f64
                && truncated < NumberType::MAX as f64
            {
                Ok(Value::Integer(truncated as NumberType))
            } else {
                Err(Error::Input(format!("{d:?} does not fit in an integer")))
            }
        }
        other => Err(type_error("number", other)),
    }
}

//
// Comparison
//

macro_rules! numeric_comparison {
    ($name:ident, $holds:expr) => {
        fn $name(args: &[Value]) -> Result<Value, Error> {
            let (a, b) = two(args)?;
            let ordering = Number::from_value(a)?.compare(Number::from_value(b)?);
            Ok(Value::from(ordering.is_some_and($holds)))
        }
    };
}

numeric_comparison!(builtin_num_eq, Ordering::is_eq);
numeric_comparison!(builtin_lt, Ordering::is_lt);
numeric_comparison!(builtin_gt, Ordering::is_gt);
numeric_comparison!(builtin_le, Ordering::is_le);
numeric_comparison!(builtin_ge, Ordering::is_ge);

fn builtin_eq(args: &[Value]) -> Result<Value, Error> {
    let (a, b) = two(args)?;
    Ok(Value::from(a.is_identical(b)))
}

fn builtin_equal(args: &[Value]) -> Result<Value, Error> {
    let (a, b) = two(args)?;
    Ok(Value::from(a == b))
}

fn builtin_not(args: &[Value]) -> Result<Value, Error> {
    match one(args)? {
        Value::True => Ok(Value::False),
        Value::False => Ok(Value::True),
        other => Err(type_error("boolean", other)),
    }
}

//
// Pairs and lists
//

fn builtin_cons(args: &[Value]) -> Result<Value, Error> {
    let (car, cdr) = two(args)?;
    Ok(Value::cons(car.clone(), cdr.clone()))
}

fn builtin_car(args: &[Value]) -> Result<Value, Error> {
    match one(args)? {
        Value::Cons(cell) => Ok(cell.car()),
        other => Err(type_error("pair", other)),
    }
}

fn builtin_cdr(args: &[Value]) -> Result<Value, Error> {
    match one(args)? {
        Value::Cons(cell) => Ok(cell.cdr()),
        other => Err(type_error("pair", other)),
    }
}

fn builtin_set_car(args: &[Value]) -> Result<Value, Error> {
    match two(args)? {
        (Value::Cons(cell), value) => {
            cell.set_car(value.clone());
            Ok(Value::Void)
        }
        (other, _) => Err(type_error("pair", other)),
    }
}

fn builtin_set_cdr(args: &[Value]) -> Result<Value, Error> {
    match two(args)? {
        (Value::Cons(cell), value) => {
            cell.set_cdr(value.clone());
            Ok(Value::Void)
        }
        (other, _) => Err(type_error("pair", other)),
    }
}

fn builtin_list(args: &[Value]) -> Result<Value, Error> {
    Ok(Value::list(args.iter().cloned()))
}

fn builtin_is_null(args: &[Value]) -> Result<Value, Error> {
    Ok(Value::from(one(args)?.is_null()))
}

//
// Strings
//

fn builtin_string_length(args: &[Value]) -> Result<Value, Error> {
    let s = string_arg(one(args)?)?;
    NumberType::try_from(s.len())
        .map(Value::Integer)
        .map_err(|_| Error::Input("string too long".into()))
}

fn builtin_string_ref(args: &[Value]) -> Result<Value, Error> {
    let (s, index) = two(args)?;
    let s = string_arg(s)?;
    let Value::Integer(index) = index else {
        return Err(type_error("integer index", index));
    };
    usize::try_from(*index)
        .ok()
        .and_then(|i| s.borrow().chars().nth(i))
        .map(Value::Char)
        .ok_or_else(|| {
            Error::Input(format!(
                "index {index} out of range for string of length {}",
                s.len()
            ))
        })
}

fn builtin_string_append(args: &[Value]) -> Result<Value, Error> {
    let joined = SchemeString::new(String::new());
    for arg in args {
        joined.push_str(&string_arg(arg)?.borrow());
    }
    Ok(Value::String(joined))
}

fn builtin_string_eq(args: &[Value]) -> Result<Value, Error> {
    let (a, b) = two(args)?;
    let (a, b) = (string_arg(a)?, string_arg(b)?);
    Ok(Value::from(*a.borrow() == *b.borrow()))
}

//
// Predicates
//

macro_rules! type_predicate {
    ($name:ident, $pattern:pat) => {
        fn $name(args: &[Value]) -> Result<Value, Error> {
            Ok(Value::from(matches!(one(args)?, $pattern)))
        }
    };
}

type_predicate!(builtin_is_string, Value::String(_));
type_predicate!(builtin_is_bool, Value::True | Value::False);
type_predicate!(builtin_is_number, Value::Integer(_) | Value::Double(_));
type_predicate!(builtin_is_cons, Value::Cons(_));
type_predicate!(builtin_is_symbol, Value::Symbol(_));
type_predicate!(builtin_is_builtin, Value::Builtin(_) | Value::Trampoline(_));
type_predicate!(builtin_is_user_function, Value::Function(_));
type_predicate!(
    builtin_is_function,
    Value::Builtin(_) | Value::Trampoline(_) | Value::Function(_)
);

//
// Output and files
//

fn write_stdout(text: &str) -> Result<Value, Error> {
    let mut out = std::io::stdout().lock();
    out.write_all(text.as_bytes())
        .and_then(|()| out.flush())
        .map_err(|err| Error::Io(err.to_string()))?;
    Ok(Value::Void)
}

fn builtin_display(args: &[Value]) -> Result<Value, Error> {
    write_stdout(&one(args)?.display_string())
}

fn builtin_print(args: &[Value]) -> Result<Value, Error> {
    write_stdout(&format!("{}\n", one(args)?))
}

fn builtin_newline(_args: &[Value]) -> Result<Value, Error> {
    write_stdout("\n")
}

/// Read a source file into a [`Value::File`]; the session evaluates its units
fn builtin_load(args: &[Value]) -> Result<Value, Error> {
    let path = string_arg(one(args)?)?.borrow().clone();
    let data = std::fs::read_to_string(&path)
        .map_err(|err| Error::Io(format!("cannot read {path}: {err}")))?;
    Ok(Value::File(Rc::new(SchemeFile::new(path, &data))))
}
