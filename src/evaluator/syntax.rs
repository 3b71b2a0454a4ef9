//! Special form handlers.
//!
//! Each handler receives the unevaluated argument list of the form and the
//! environment it appears in. Forms that need a sub-evaluation push what they
//! need afterwards, schedule their completion step and then the evaluation;
//! branches of `if` and the last expression of `begin` are scheduled as bare
//! evaluations so they stay in tail position.

use super::{Evaluator, Fault, Step, StepResult};
use crate::ast::{Cons, SyntaxKind, UserFunction, Value};
use crate::environment::Environment;

impl Evaluator {
    pub(super) fn syntax(&mut self, kind: SyntaxKind) -> StepResult {
        let env = self.pop_env()?;
        let args = self.pop_value()?;
        match kind {
            SyntaxKind::Quote => self.quote(args),
            SyntaxKind::Lambda => self.lambda(args, env),
            SyntaxKind::If => self.if_form(args, env),
            SyntaxKind::Set => self.set_form(args, env),
            SyntaxKind::Define => self.define(args, env),
            SyntaxKind::Begin => self.begin(args, env),
        }
    }

    fn quote(&mut self, args: Value) -> StepResult {
        self.result = super::single_argument(&args, "quote")?;
        Ok(())
    }

    fn lambda(&mut self, args: Value, env: Environment) -> StepResult {
        let Value::Cons(parts) = args else {
            return Err(Fault::input("lambda expects (lambda (params ...) body ...)"));
        };
        let Value::Cons(formals) = parts.car() else {
            return Err(Fault::input("lambda requires a non-empty parameter list"));
        };
        let Value::Cons(body) = parts.cdr() else {
            return Err(Fault::input("lambda requires a body"));
        };
        validate_formals(&formals)?;
        self.result = Value::Function(UserFunction {
            home: env,
            formals,
            body,
        });
        Ok(())
    }

    fn if_form(&mut self, args: Value, env: Environment) -> StepResult {
        let shape_ok = args.list_elements().is_some_and(|parts| parts.len() == 3);
        let Value::Cons(parts) = args else {
            return Err(Fault::input("if expects (if condition consequent alternative)"));
        };
        if !shape_ok {
            return Err(Fault::input(
                "if expects exactly three arguments: (if condition consequent alternative)",
            ));
        }
        let condition = parts.car();
        self.operands.push(Value::Cons(parts));
        self.operands.push(Value::Environment(env.clone()));
        self.schedule(Step::IfBranch);
        self.schedule_eval(condition, &env);
        Ok(())
    }

    pub(super) fn if_branch(&mut self) -> StepResult {
        let condition = self.take_result();
        let env = self.pop_env()?;
        let parts = self.pop_cons()?;
        let branches = match parts.cdr() {
            Value::Cons(branches) => branches,
            other => {
                return Err(Fault::fatal(format!(
                    "if lost its branches: {}",
                    other.type_name()
                )));
            }
        };
        let chosen = match condition {
            Value::True => branches.car(),
            Value::False => match branches.cdr() {
                Value::Cons(alternative) => alternative.car(),
                other => {
                    return Err(Fault::fatal(format!(
                        "if lost its alternative: {}",
                        other.type_name()
                    )));
                }
            },
            other => {
                return Err(Fault::input(format!(
                    "if: non-boolean condition value {other}"
                )));
            }
        };
        self.schedule_eval(chosen, &env);
        Ok(())
    }

    fn set_form(&mut self, args: Value, env: Environment) -> StepResult {
        let (name, expr) = name_and_expression(&args)
            .ok_or_else(|| Fault::input("set! expects (set! name expression)"))?;
        self.operands.push(Value::Symbol(name));
        self.operands.push(Value::Environment(env.clone()));
        self.schedule(Step::SetAssign);
        self.schedule_eval(expr, &env);
        Ok(())
    }

    pub(super) fn set_assign(&mut self) -> StepResult {
        let value = self.take_result();
        let env = self.pop_env()?;
        let name = self.pop_symbol()?;
        if !env.update(&name, value) {
            return Err(Fault::input(format!(
                "set!: {name} is not bound in the current scope"
            )));
        }
        self.result = Value::Void;
        Ok(())
    }

    fn define(&mut self, args: Value, env: Environment) -> StepResult {
        let Value::Cons(parts) = &args else {
            return Err(Fault::input("define expects (define name expression)"));
        };
        match parts.car() {
            Value::Symbol(_) => {
                let (name, expr) = name_and_expression(&args)
                    .ok_or_else(|| Fault::input("define expects (define name expression)"))?;
                self.operands.push(Value::Symbol(name));
                self.operands.push(Value::Environment(env.clone()));
                self.schedule(Step::DefineBind);
                self.schedule_eval(expr, &env);
                Ok(())
            }
            Value::Cons(signature) => {
                let Value::Symbol(name) = signature.car() else {
                    return Err(Fault::input(format!(
                        "define: function name is not a symbol: {}",
                        signature.car()
                    )));
                };
                let Value::Cons(formals) = signature.cdr() else {
                    return Err(Fault::input(format!(
                        "define: {name} requires a non-empty parameter list"
                    )));
                };
                let Value::Cons(body) = parts.cdr() else {
                    return Err(Fault::input(format!("define: {name} requires a body")));
                };
                validate_formals(&formals)?;
                let function = Value::Function(UserFunction {
                    home: env.clone(),
                    formals,
                    body,
                });
                env.insert_or_update(name, function);
                self.result = Value::Void;
                Ok(())
            }
            other => Err(Fault::input(format!(
                "define: cannot define {other}, expected a name or (name params ...)"
            ))),
        }
    }

    pub(super) fn define_bind(&mut self) -> StepResult {
        let value = self.take_result();
        let env = self.pop_env()?;
        let name = self.pop_symbol()?;
        env.insert_or_update(name, value);
        self.result = Value::Void;
        Ok(())
    }

    fn begin(&mut self, args: Value, env: Environment) -> StepResult {
        if args.is_null() {
            self.result = Value::Void;
            return Ok(());
        }
        self.schedule_body(args, &env)
    }
}

/// `(name expr)`: exactly a symbol followed by one expression
fn name_and_expression(args: &Value) -> Option<(crate::symbol::Symbol, Value)> {
    let parts = args.list_elements()?;
    match parts.as_slice() {
        [Value::Symbol(name), expr] => Some((name.clone(), expr.clone())),
        _ => None,
    }
}

/// Every formal parameter must be a symbol and the list must be proper
fn validate_formals(formals: &Cons) -> Result<(), Fault> {
    let mut iter = formals.iter();
    for formal in iter.by_ref() {
        if !matches!(formal, Value::Symbol(_)) {
            return Err(Fault::input(format!("Parameter is not a symbol: {formal}")));
        }
    }
    match iter.tail() {
        Value::Null => Ok(()),
        tail => Err(Fault::input(format!(
            "Malformed parameter list ending in {tail}"
        ))),
    }
}
