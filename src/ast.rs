//! This module defines the runtime value model shared by the reader, the evaluator,
//! the builtins and the printer. The main enum, [`Value`], is a closed sum type: every
//! dispatch over value kinds in the crate is an exhaustive `match` on it.
//!
//! Compound values are reference-shared. A [`Cons`] cell is an `Rc` around two
//! individually mutable slots, a [`SchemeString`] is an `Rc` around a mutable
//! buffer, and closures hold their defining [`Environment`] by reference, so the
//! environment stays alive as long as any closure that captured it.
//!
//! Two equalities exist. `PartialEq` is structural (`=`/`equal?`): cons cells are
//! compared car and cdr, pair by pair. [`Value::is_identical`] is identity (`eq?`):
//! strings and cons cells compare by reference, symbols always do.
//!
//! The `Display` implementation is the printer.

use crate::Error;
use crate::environment::Environment;
use crate::stack::OperandStack;
use crate::symbol::Symbol;
use std::cell::{Ref, RefCell};
use std::fmt;
use std::panic::Location;
use std::rc::Rc;

/// Type alias for integer values in the interpreter
pub type NumberType = i64;

/// Nesting depth after which the printer elides nested cars
const MAX_PRINT_DEPTH: usize = 512;

/// Calling convention of primitive functions.
///
/// The builtin receives the operand-stack position of its first evaluated argument.
/// It must take its arguments with exactly one [`OperandStack::get_objects`] call
/// (which also truncates the stack back to that position) and return one value,
/// either a result or an error value.
pub type BuiltinFn = fn(usize, &mut OperandStack) -> Value;

/// A two-slot mutable pair, shared by reference.
#[derive(Clone)]
pub struct Cons(Rc<ConsCell>);

struct ConsCell {
    car: RefCell<Value>,
    cdr: RefCell<Value>,
}

impl ConsCell {
    /// Move the slots that can own further cells or frames onto `pending`
    fn take_slots(&mut self, pending: &mut Vec<Value>) {
        for slot in [&mut self.car, &mut self.cdr] {
            let value = std::mem::replace(slot.get_mut(), Value::Null);
            if value.links_heap() {
                pending.push(value);
            }
        }
    }
}

impl Drop for ConsCell {
    // Default drop glue would recurse once per nested car, cdr or closure.
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.take_slots(&mut pending);
        release(pending);
    }
}

/// Drop `pending` and everything only it keeps alive, using a worklist instead
/// of the host stack. Cells and frames that are still shared elsewhere are left
/// alone.
pub(crate) fn release(mut pending: Vec<Value>) {
    while let Some(value) = pending.pop() {
        match value {
            Value::Cons(Cons(cell)) => {
                if let Ok(mut cell) = Rc::try_unwrap(cell) {
                    cell.take_slots(&mut pending);
                }
            }
            Value::Function(UserFunction {
                home,
                formals,
                body,
            }) => {
                pending.push(Value::Cons(formals));
                pending.push(Value::Cons(body));
                home.dismantle(&mut pending);
            }
            Value::Environment(env) => env.dismantle(&mut pending),
            _ => {}
        }
    }
}

impl Cons {
    pub fn new(car: Value, cdr: Value) -> Self {
        Cons(Rc::new(ConsCell {
            car: RefCell::new(car),
            cdr: RefCell::new(cdr),
        }))
    }

    pub fn car(&self) -> Value {
        self.0.car.borrow().clone()
    }

    pub fn cdr(&self) -> Value {
        self.0.cdr.borrow().clone()
    }

    pub fn set_car(&self, value: Value) {
        *self.0.car.borrow_mut() = value;
    }

    pub fn set_cdr(&self, value: Value) {
        *self.0.cdr.borrow_mut() = value;
    }

    /// Whether the cdr is the empty list, without cloning it
    pub fn is_last(&self) -> bool {
        matches!(*self.0.cdr.borrow(), Value::Null)
    }

    pub fn ptr_eq(&self, other: &Cons) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Iterate over this cell and the cells reachable through `cdr`
    pub fn iter(&self) -> ListIter {
        ListIter {
            next: Value::Cons(self.clone()),
        }
    }
}

/// Owned, mutable character buffer shared by reference.
#[derive(Clone)]
pub struct SchemeString(Rc<RefCell<String>>);

impl SchemeString {
    pub fn new(text: impl Into<String>) -> Self {
        SchemeString(Rc::new(RefCell::new(text.into())))
    }

    pub fn borrow(&self) -> Ref<'_, String> {
        self.0.borrow()
    }

    /// Length in characters, not bytes
    pub fn len(&self) -> usize {
        self.0.borrow().chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn push_str(&self, text: &str) {
        self.0.borrow_mut().push_str(text);
    }

    pub fn ptr_eq(&self, other: &SchemeString) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// The special forms the evaluator handles itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyntaxKind {
    Define,
    If,
    Set,
    Begin,
    Lambda,
    Quote,
}

impl SyntaxKind {
    pub const ALL: [SyntaxKind; 6] = [
        SyntaxKind::Define,
        SyntaxKind::If,
        SyntaxKind::Set,
        SyntaxKind::Begin,
        SyntaxKind::Lambda,
        SyntaxKind::Quote,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SyntaxKind::Define => "define",
            SyntaxKind::If => "if",
            SyntaxKind::Set => "set!",
            SyntaxKind::Begin => "begin",
            SyntaxKind::Lambda => "lambda",
            SyntaxKind::Quote => "quote",
        }
    }
}

/// Functions that receive their unevaluated argument list and the caller's
/// environment, and continue on the trampoline instead of returning a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrampolineOp {
    Eval,
}

impl TrampolineOp {
    pub fn name(self) -> &'static str {
        match self {
            TrampolineOp::Eval => "eval",
        }
    }
}

/// A native primitive; compared by name.
#[derive(Clone)]
pub struct Builtin {
    pub name: Rc<str>,
    pub func: BuiltinFn,
}

/// A closure: defining environment plus formal parameter list and body list.
#[derive(Clone)]
pub struct UserFunction {
    pub home: Environment,
    pub formals: Cons,
    pub body: Cons,
}

/// Message plus the point in the interpreter where the condition was detected.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub message: String,
    pub origin: &'static Location<'static>,
}

impl Diagnostic {
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Diagnostic {
            message: message.into(),
            origin: Location::caller(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Externally loaded source text, split into lines. Not evaluated by the core;
/// the session walks it with [`SchemeFile::units`].
#[derive(Debug, Clone, PartialEq)]
pub struct SchemeFile {
    pub path: String,
    lines: Vec<String>,
}

impl SchemeFile {
    pub fn new(path: impl Into<String>, data: &str) -> Self {
        SchemeFile {
            path: path.into(),
            lines: data.lines().map(str::to_owned).collect(),
        }
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Top-level input units: consecutive lines joined until their parentheses
    /// balance. Blank lines and `;` comment lines are skipped.
    pub fn units(&self) -> FileUnits<'_> {
        FileUnits {
            lines: self.lines.iter(),
        }
    }
}

pub struct FileUnits<'a> {
    lines: std::slice::Iter<'a, String>,
}

impl Iterator for FileUnits<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let mut unit = String::new();
        let mut open = 0i64;
        for line in self.lines.by_ref() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            if !unit.is_empty() {
                unit.push(' ');
            }
            unit.push_str(line);
            open += paren_balance(line);
            if open <= 0 {
                return Some(unit);
            }
        }
        // unbalanced trailing text is still handed out so the reader can report it
        (!unit.is_empty()).then_some(unit)
    }
}

/// Net count of opening parentheses outside string literals and comments
fn paren_balance(line: &str) -> i64 {
    let mut balance = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            ';' => break,
            // #\( and #\) are character literals
            '#' if chars.peek() == Some(&'\\') => {
                chars.next();
                chars.next();
            }
            '(' => balance += 1,
            ')' => balance -= 1,
            _ => {}
        }
    }
    balance
}

/// Core runtime value
#[derive(Clone)]
pub enum Value {
    Integer(NumberType),
    Double(f64),
    String(SchemeString),
    Char(char),
    Cons(Cons),
    Symbol(Symbol),
    False,
    True,
    /// The empty list
    Null,
    /// Result of forms evaluated for their side effect
    Void,
    Environment(Environment),
    Syntax(SyntaxKind),
    Builtin(Builtin),
    Trampoline(TrampolineOp),
    Function(UserFunction),
    /// User-caused failure (bad arity, unbound variable, malformed form, ...)
    Error(Rc<Diagnostic>),
    /// Broken evaluator invariant
    FatalError(Rc<Diagnostic>),
    File(Rc<SchemeFile>),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(SchemeString::new(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(SchemeString::new(s))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        if b { Value::True } else { Value::False }
    }
}

impl From<char> for Value {
    fn from(c: char) -> Self {
        Value::Char(c)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<Symbol> for Value {
    fn from(s: Symbol) -> Self {
        Value::Symbol(s)
    }
}

impl From<Cons> for Value {
    fn from(c: Cons) -> Self {
        Value::Cons(c)
    }
}

macro_rules! impl_from_integer {
    ($int_type:ty) => {
        impl From<$int_type> for Value {
            fn from(n: $int_type) -> Self {
                Value::Integer(n as NumberType)
            }
        }
    };
}

impl_from_integer!(i8);
impl_from_integer!(i16);
impl_from_integer!(i32);
impl_from_integer!(NumberType);
impl_from_integer!(u8);
impl_from_integer!(u16);
impl_from_integer!(u32);

/// Iterator over the cars of a (possibly improper) list.
/// After it is exhausted, [`ListIter::tail`] is `Null` for a proper list.
pub struct ListIter {
    next: Value,
}

impl ListIter {
    pub fn tail(&self) -> &Value {
        &self.next
    }
}

impl Iterator for ListIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match std::mem::replace(&mut self.next, Value::Null) {
            Value::Cons(cell) => {
                self.next = cell.cdr();
                Some(cell.car())
            }
            other => {
                self.next = other;
                None
            }
        }
    }
}

impl Value {
    /// Build an input error value, recording the caller as its origin
    #[track_caller]
    pub fn error(message: impl Into<String>) -> Value {
        Value::Error(Rc::new(Diagnostic::new(message)))
    }

    /// Build a fatal error value, recording the caller as its origin
    #[track_caller]
    pub fn fatal_error(message: impl Into<String>) -> Value {
        Value::FatalError(Rc::new(Diagnostic::new(message)))
    }

    pub fn cons(car: Value, cdr: Value) -> Value {
        Value::Cons(Cons::new(car, cdr))
    }

    /// Build a proper list from the given elements
    pub fn list<I>(elements: I) -> Value
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: DoubleEndedIterator,
    {
        elements
            .into_iter()
            .rev()
            .fold(Value::Null, |tail, head| Value::cons(head, tail))
    }

    pub fn iter_list(&self) -> ListIter {
        ListIter { next: self.clone() }
    }

    /// Elements of a proper list; `None` if `self` is not one
    pub fn list_elements(&self) -> Option<Vec<Value>> {
        let mut iter = self.iter_list();
        let elements: Vec<Value> = iter.by_ref().collect();
        matches!(iter.tail(), Value::Null).then_some(elements)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_) | Value::FatalError(_))
    }

    /// Whether dropping this value can cascade into further cells or frames
    fn links_heap(&self) -> bool {
        matches!(
            self,
            Value::Cons(_) | Value::Function(_) | Value::Environment(_)
        )
    }

    pub fn as_cons(&self) -> Option<&Cons> {
        match self {
            Value::Cons(cell) => Some(cell),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<NumberType> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Upper-case tag of the variant, used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "INTEGER",
            Value::Double(_) => "DOUBLE",
            Value::String(_) => "STRING",
            Value::Char(_) => "CHAR",
            Value::Cons(_) => "CONS",
            Value::Symbol(_) => "SYMBOL",
            Value::False => "FALSE",
            Value::True => "TRUE",
            Value::Null => "NULL",
            Value::Void => "VOID",
            Value::Environment(_) => "ENVIRONMENT",
            Value::Syntax(_) => "BUILTINSYNTAX",
            Value::Builtin(_) => "BUILTINFUNCTION",
            Value::Trampoline(_) => "BUILTINTRAMPOLINEFUNCTION",
            Value::Function(_) => "USERDEFINEDFUNCTION",
            Value::Error(_) => "ERROR",
            Value::FatalError(_) => "FATALERROR",
            Value::File(_) => "FILEINPUT",
        }
    }

    /// Convert error values into the host-level [`Error`]
    pub fn into_result(self) -> Result<Value, Error> {
        match self {
            Value::Error(diagnostic) => Err(Error::Input(diagnostic.message.clone())),
            Value::FatalError(diagnostic) => Err(Error::Fatal(format!(
                "{} (detected at {})",
                diagnostic.message, diagnostic.origin
            ))),
            other => Ok(other),
        }
    }

    /// Identity comparison (`eq?`): strings and cons cells by reference,
    /// everything else as with `=`.
    pub fn is_identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a.ptr_eq(b),
            (Value::Cons(a), Value::Cons(b)) => a.ptr_eq(b),
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            _ => self == other,
        }
    }

    /// Printed form used by `display`: strings and characters without quoting
    pub fn display_string(&self) -> String {
        match self {
            Value::String(s) => s.borrow().clone(),
            Value::Char(c) => c.to_string(),
            other => other.to_string(),
        }
    }
}

/// Equality of non-cons values
fn atom_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => x == y,
        (Value::Double(x), Value::Double(y)) => x == y,
        (Value::String(x), Value::String(y)) => x.ptr_eq(y) || *x.borrow() == *y.borrow(),
        (Value::Char(x), Value::Char(y)) => x == y,
        (Value::Symbol(x), Value::Symbol(y)) => x == y,
        (Value::False, Value::False)
        | (Value::True, Value::True)
        | (Value::Null, Value::Null)
        | (Value::Void, Value::Void) => true,
        (Value::Environment(x), Value::Environment(y)) => x.ptr_eq(y),
        (Value::Syntax(x), Value::Syntax(y)) => x == y,
        (Value::Builtin(x), Value::Builtin(y)) => x.name == y.name,
        (Value::Trampoline(x), Value::Trampoline(y)) => x == y,
        (Value::File(x), Value::File(y)) => x == y,
        // errors never compare equal, and different variants never do
        _ => false,
    }
}

impl PartialEq for Value {
    /// Structural equality. Pairs still to be compared are kept on an explicit
    /// stack; cyclic structures are not supported.
    fn eq(&self, other: &Self) -> bool {
        let mut pending = vec![(self.clone(), other.clone())];
        while let Some((left, right)) = pending.pop() {
            match (&left, &right) {
                (Value::Cons(a), Value::Cons(b)) => {
                    if !a.ptr_eq(b) {
                        pending.push((a.cdr(), b.cdr()));
                        pending.push((a.car(), b.car()));
                    }
                }
                (Value::Function(x), Value::Function(y)) => {
                    pending.push((Value::Cons(x.body.clone()), Value::Cons(y.body.clone())));
                    pending.push((Value::Cons(x.formals.clone()), Value::Cons(y.formals.clone())));
                }
                _ => {
                    if !atom_eq(&left, &right) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

fn write_string_literal(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    write!(f, "\"")?;
    for ch in text.chars() {
        match ch {
            '"' => write!(f, "\\\"")?,
            '\\' => write!(f, "\\\\")?,
            '\n' => write!(f, "\\n")?,
            '\t' => write!(f, "\\t")?,
            '\r' => write!(f, "\\r")?,
            c => write!(f, "{c}")?,
        }
    }
    write!(f, "\"")
}

fn write_char_literal(f: &mut fmt::Formatter<'_>, c: char) -> fmt::Result {
    match c {
        ' ' => write!(f, "#\\space"),
        '\n' => write!(f, "#\\newline"),
        '\t' => write!(f, "#\\tab"),
        c => write!(f, "#\\{c}"),
    }
}

/// Write the elements of a list without the surrounding parentheses
fn write_list_body(f: &mut fmt::Formatter<'_>, list: &Value, depth: usize) -> fmt::Result {
    let mut iter = list.iter_list();
    let mut first = true;
    for element in iter.by_ref() {
        if !first {
            write!(f, " ")?;
        }
        first = false;
        write_value(f, &element, depth + 1)?;
    }
    match iter.tail() {
        Value::Null => Ok(()),
        tail => {
            write!(f, " . ")?;
            write_value(f, tail, depth + 1)
        }
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &Value, depth: usize) -> fmt::Result {
    if depth > MAX_PRINT_DEPTH {
        return write!(f, "...");
    }
    match value {
        Value::Integer(n) => write!(f, "{n}"),
        Value::Double(d) => write!(f, "{d:?}"),
        Value::String(s) => write_string_literal(f, &s.borrow()),
        Value::Char(c) => write_char_literal(f, *c),
        Value::Cons(cell)
            if matches!(cell.car(), Value::Syntax(SyntaxKind::Quote))
                && matches!(cell.cdr(), Value::Cons(ref rest) if rest.is_last()) =>
        {
            write!(f, "'")?;
            write_list_body(f, &cell.cdr(), depth)
        }
        Value::Cons(_) => {
            write!(f, "(")?;
            write_list_body(f, value, depth)?;
            write!(f, ")")
        }
        Value::Symbol(s) => write!(f, "{s}"),
        Value::False => write!(f, "#f"),
        Value::True => write!(f, "#t"),
        Value::Null => write!(f, "()"),
        Value::Void => write!(f, "#void"),
        Value::Environment(env) => {
            if env.parent().is_none() {
                write!(f, "<<top environment>>")
            } else {
                write!(f, "<<environment>>")
            }
        }
        Value::Syntax(kind) => write!(f, "<syntax {}>", kind.name()),
        Value::Builtin(builtin) => write!(f, "#<builtin-function:{}>", builtin.name),
        Value::Trampoline(op) => write!(f, "#<builtin-function:{}>", op.name()),
        Value::Function(function) => {
            write!(f, "(lambda (")?;
            write_list_body(f, &Value::Cons(function.formals.clone()), depth)?;
            write!(f, ") ")?;
            write_list_body(f, &Value::Cons(function.body.clone()), depth)?;
            write!(f, ")")
        }
        Value::Error(diagnostic) => write!(f, "Error: {diagnostic}"),
        Value::FatalError(diagnostic) => {
            write!(f, "FatalError: {diagnostic} (detected at {})", diagnostic.origin)
        }
        Value::File(file) => write!(f, "#<file:{}>", file.path),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(f, self, 0)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "Integer({n})"),
            Value::Double(d) => write!(f, "Double({d:?})"),
            Value::String(_) => write!(f, "String({self})"),
            Value::Char(c) => write!(f, "Char({c:?})"),
            Value::Symbol(s) => write!(f, "Symbol({s})"),
            Value::Cons(_) => write!(f, "Cons({self})"),
            Value::Function(_) => write!(f, "Function({self})"),
            Value::Error(d) => write!(f, "Error({:?} at {})", d.message, d.origin),
            Value::FatalError(d) => write!(f, "FatalError({:?} at {})", d.message, d.origin),
            Value::False
            | Value::True
            | Value::Null
            | Value::Void
            | Value::Environment(_)
            | Value::Syntax(_)
            | Value::Builtin(_)
            | Value::Trampoline(_)
            | Value::File(_) => write!(f, "{}({self})", self.type_name()),
        }
    }
}
