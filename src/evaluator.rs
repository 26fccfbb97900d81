//! Trampolined evaluator.
//!
//! `eval` loops over [`Step`]s: special forms and closure calls in tail position hand back
//! a `Step::Continue` with the next form and environment instead of recursing, so tail
//! calls run in constant host stack. Only genuinely nested evaluation (arguments,
//! conditions, binding values) recurses, and that is bounded by [`MAX_EVAL_DEPTH`].

pub mod environment;
pub mod intooperation;

use std::cell::Cell;
use std::rc::Rc;

use crate::ast::{Closure, MapType, Value, list, sym};
use crate::builtinops::{Arity, find_special_form};
use crate::{Error, MAX_EVAL_DEPTH, MAX_MACRO_EXPANSIONS};

pub use crate::builtinops::create_global_env;
pub use environment::Environment;
pub use intooperation::{NumIter, StringIter, ValueIter};

use environment::with_expression;

/// Outcome of one trampoline step
pub(crate) enum Step {
    /// Evaluate this form in this environment next
    Continue(Value, Environment),
    /// Evaluation is finished
    Return(Value),
}

thread_local! {
    static EVAL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// RAII counter for nested evaluation on the current thread.
pub(crate) struct DepthGuard;

impl DepthGuard {
    pub(crate) fn enter() -> Result<Self, Error> {
        EVAL_DEPTH.with(|depth| {
            let current = depth.get();
            if current >= MAX_EVAL_DEPTH {
                return Err(Error::EvalError(format!(
                    "Evaluation depth limit exceeded (max: {MAX_EVAL_DEPTH})"
                )));
            }
            depth.set(current + 1);
            Ok(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        EVAL_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Evaluate `expr` in `env`
pub fn eval(expr: &Value, env: &Environment) -> Result<Value, Error> {
    let _guard = DepthGuard::enter()?;
    let mut ast = expr.clone();
    let mut env = env.clone();

    loop {
        tracing::trace!(form = %ast, "eval");
        ast = macroexpand(ast, &env)?;

        let items = match &ast {
            Value::List(items, _) if !items.is_empty() => Rc::clone(items),
            Value::List(..) => return Ok(ast),
            _ => return eval_ast(&ast, &env),
        };

        let step = match &items[0] {
            Value::Symbol(name) => match find_special_form(name) {
                Some(form) => form(&items[1..], &env)?,
                None => eval_call(&items, &env)?,
            },
            _ => eval_call(&items, &env)?,
        };

        match step {
            Step::Return(value) => return Ok(value),
            Step::Continue(next, next_env) => {
                ast = next;
                env = next_env;
            }
        }
    }
}

/// Evaluate a form that is not a call: symbols resolve, vectors and maps evaluate their
/// elements, everything else evaluates to itself.
fn eval_ast(ast: &Value, env: &Environment) -> Result<Value, Error> {
    match ast {
        Value::Symbol(name) => env.get(name),
        Value::Vector(items, _) => {
            let values = eval_args(items, env)?;
            Ok(Value::Vector(Rc::new(values), None))
        }
        Value::Map(map, _) => {
            let evaluated = map
                .iter()
                .map(|(key, value)| Ok((key.clone(), eval(value, env)?)))
                .collect::<Result<MapType, Error>>()?;
            Ok(Value::Map(Rc::new(evaluated), None))
        }
        _ => Ok(ast.clone()),
    }
}

fn eval_args(args: &[Value], env: &Environment) -> Result<Vec<Value>, Error> {
    args.iter().map(|arg| eval(arg, env)).collect()
}

/// Ordinary application. Closures continue the trampoline in their call frame.
fn eval_call(items: &[Value], env: &Environment) -> Result<Step, Error> {
    let func = eval(&items[0], env)?;
    let args = eval_args(&items[1..], env)?;

    match &func {
        Value::BuiltinFunction { id, func, .. } => {
            Ok(Step::Return(func(args).map_err(|e| with_expression(e, id))?))
        }
        Value::Function { closure, .. } => {
            let call_env = bind_closure(closure, args)?;
            Ok(Step::Continue(closure.body.clone(), call_env))
        }
        _ => Err(Error::TypeError(format!(
            "Cannot apply non-function: {func}"
        ))),
    }
}

fn bind_closure(closure: &Closure, args: Vec<Value>) -> Result<Environment, Error> {
    Environment::bind(&closure.env, &closure.params, closure.rest.as_deref(), args)
}

/// Apply any callable value to already-evaluated arguments.
///
/// This is the re-entry point for natives that call back into the language (`map`,
/// `apply`, `swap!`) and for macro expansion.
pub fn apply_function(func: &Value, args: Vec<Value>) -> Result<Value, Error> {
    match func {
        Value::BuiltinFunction { id, func, .. } => func(args).map_err(|e| with_expression(e, id)),
        Value::Function { closure, .. } => {
            let call_env = bind_closure(closure, args)?;
            eval(&closure.body, &call_env)
        }
        _ => Err(Error::TypeError(format!(
            "Cannot apply non-function: {func}"
        ))),
    }
}

/// The macro bound to the head symbol of `ast`, if any
fn macro_call(ast: &Value, env: &Environment) -> Option<Value> {
    let Value::List(items, _) = ast else {
        return None;
    };
    let Some(Value::Symbol(name)) = items.first() else {
        return None;
    };
    env.lookup(name).filter(Value::is_macro)
}

/// Expand `ast` while its head names a macro. The expansion is not evaluated.
pub fn macroexpand(mut ast: Value, env: &Environment) -> Result<Value, Error> {
    let mut expansions = 0;
    while let Some(mac) = macro_call(&ast, env) {
        if expansions >= MAX_MACRO_EXPANSIONS {
            return Err(Error::EvalError(format!(
                "Macro expansion limit exceeded (max: {MAX_MACRO_EXPANSIONS})"
            )));
        }
        expansions += 1;

        let args = match &ast {
            Value::List(items, _) => items[1..].to_vec(),
            _ => Vec::new(),
        };
        tracing::trace!(form = %ast, "expanding macro");
        ast = apply_function(&mac, args)?;
    }
    Ok(ast)
}

/// Rewrite a quasiquoted template into the `cons`/`concat`/`vec` calls that build it.
pub fn quasiquote(ast: &Value) -> Result<Value, Error> {
    let _guard = DepthGuard::enter()?;
    match ast {
        Value::List(items, _) => match items.as_slice() {
            [Value::Symbol(head), arg] if head == "unquote" => Ok(arg.clone()),
            elements => quasiquote_elements(elements),
        },
        Value::Vector(items, _) => Ok(list([sym("vec"), quasiquote_elements(items)?])),
        Value::Map(..) | Value::Symbol(_) => Ok(list([sym("quote"), ast.clone()])),
        _ => Ok(ast.clone()),
    }
}

fn quasiquote_elements(elements: &[Value]) -> Result<Value, Error> {
    let mut acc = list([]);
    for element in elements.iter().rev() {
        acc = match splice_unquote_target(element) {
            Some(target) => list([sym("concat"), target.clone(), acc]),
            None => list([sym("cons"), quasiquote(element)?, acc]),
        };
    }
    Ok(acc)
}

fn splice_unquote_target(element: &Value) -> Option<&Value> {
    match element {
        Value::List(items, _) => match items.as_slice() {
            [Value::Symbol(head), target] if head == "splice-unquote" => Some(target),
            _ => None,
        },
        _ => None,
    }
}

//
// Special forms. Each receives its unevaluated operands (the head symbol stripped).
//

fn expect_symbol<'a>(value: &'a Value, form: &str) -> Result<&'a str, Error> {
    match value {
        Value::Symbol(name) => Ok(name),
        other => Err(Error::TypeError(format!(
            "{form} requires a symbol, got {}",
            other.type_name()
        ))),
    }
}

/// `(def! name expr)`
pub(crate) fn eval_def(args: &[Value], env: &Environment) -> Result<Step, Error> {
    match args {
        [name, expr] => {
            let name = expect_symbol(name, "def!")?;
            let value = eval(expr, env)?;
            tracing::debug!(name, "def!");
            env.set(name, value.clone());
            Ok(Step::Return(value))
        }
        _ => Err(Error::arity_error_with_expr(Arity::Exact(2), args.len(), "def!")),
    }
}

/// `(let* (name expr ...) body)`; later bindings see earlier ones
pub(crate) fn eval_let(args: &[Value], env: &Environment) -> Result<Step, Error> {
    match args {
        [bindings, body] => {
            let bindings = bindings.expect_sequence()?;
            if bindings.len() % 2 != 0 {
                return Err(Error::arity_error_with_expr(
                    Arity::Even,
                    bindings.len(),
                    "let* bindings",
                ));
            }

            let let_env = Environment::with_parent(env);
            for pair in bindings.chunks_exact(2) {
                let name = expect_symbol(&pair[0], "let*")?;
                let value = eval(&pair[1], &let_env)?;
                let_env.set(name, value);
            }
            Ok(Step::Continue(body.clone(), let_env))
        }
        _ => Err(Error::arity_error_with_expr(Arity::Exact(2), args.len(), "let*")),
    }
}

/// `(do form ...)`; the last form is in tail position
pub(crate) fn eval_do(args: &[Value], env: &Environment) -> Result<Step, Error> {
    match args {
        [] => Ok(Step::Return(Value::Nil)),
        [init @ .., last] => {
            for form in init {
                eval(form, env)?;
            }
            Ok(Step::Continue(last.clone(), env.clone()))
        }
    }
}

/// `(if cond then else?)`; only `nil` and `false` are falsy
pub(crate) fn eval_if(args: &[Value], env: &Environment) -> Result<Step, Error> {
    let (condition, then_expr, else_expr) = match args {
        [condition, then_expr] => (condition, then_expr, None),
        [condition, then_expr, else_expr] => (condition, then_expr, Some(else_expr)),
        _ => {
            return Err(Error::arity_error_with_expr(
                Arity::Range(2, 3),
                args.len(),
                "if",
            ));
        }
    };

    if eval(condition, env)?.is_truthy() {
        Ok(Step::Continue(then_expr.clone(), env.clone()))
    } else {
        match else_expr {
            Some(else_expr) => Ok(Step::Continue(else_expr.clone(), env.clone())),
            None => Ok(Step::Return(Value::Nil)),
        }
    }
}

/// Split a parameter vector into positional names and the optional `&` rest name
fn parse_params(param_list: &Value) -> Result<(Vec<String>, Option<String>), Error> {
    let items = param_list.as_sequence().ok_or_else(|| {
        Error::TypeError("fn* parameters must be a list or vector".to_owned())
    })?;

    let mut params: Vec<String> = Vec::with_capacity(items.len());
    let mut iter = items.iter();
    while let Some(item) = iter.next() {
        let name = expect_symbol(item, "fn* parameter")?;
        if name == "&" {
            return match (iter.next(), iter.next()) {
                (Some(Value::Symbol(rest)), None) if rest != "&" => {
                    if params.contains(rest) {
                        return Err(Error::EvalError(format!(
                            "Duplicate parameter name: {rest}"
                        )));
                    }
                    Ok((params, Some(rest.clone())))
                }
                _ => Err(Error::EvalError(
                    "'&' must be followed by exactly one parameter".to_owned(),
                )),
            };
        }
        if params.iter().any(|p| p == name) {
            return Err(Error::EvalError(format!("Duplicate parameter name: {name}")));
        }
        params.push(name.to_owned());
    }
    Ok((params, None))
}

/// `(fn* (params) body)`
pub(crate) fn eval_fn(args: &[Value], env: &Environment) -> Result<Step, Error> {
    match args {
        [params, body] => {
            let (params, rest) = parse_params(params)?;
            Ok(Step::Return(Value::Function {
                closure: Rc::new(Closure {
                    params,
                    rest,
                    body: body.clone(),
                    env: env.clone(),
                }),
                is_macro: false,
                meta: None,
            }))
        }
        _ => Err(Error::arity_error_with_expr(Arity::Exact(2), args.len(), "fn*")),
    }
}

/// `(quote form)`
pub(crate) fn eval_quote(args: &[Value], _env: &Environment) -> Result<Step, Error> {
    match args {
        [form] => Ok(Step::Return(form.clone())),
        _ => Err(Error::arity_error_with_expr(Arity::Exact(1), args.len(), "quote")),
    }
}

/// `(quasiquote template)`
pub(crate) fn eval_quasiquote(args: &[Value], env: &Environment) -> Result<Step, Error> {
    match args {
        [template] => Ok(Step::Continue(quasiquote(template)?, env.clone())),
        _ => Err(Error::arity_error_with_expr(
            Arity::Exact(1),
            args.len(),
            "quasiquote",
        )),
    }
}

/// `(quasiquoteexpand template)` returns the rewrite without evaluating it
pub(crate) fn eval_quasiquoteexpand(args: &[Value], _env: &Environment) -> Result<Step, Error> {
    match args {
        [template] => Ok(Step::Return(quasiquote(template)?)),
        _ => Err(Error::arity_error_with_expr(
            Arity::Exact(1),
            args.len(),
            "quasiquoteexpand",
        )),
    }
}

/// `(defmacro! name fn-expr)`
pub(crate) fn eval_defmacro(args: &[Value], env: &Environment) -> Result<Step, Error> {
    match args {
        [name, expr] => {
            let name = expect_symbol(name, "defmacro!")?;
            let mac = match eval(expr, env)? {
                Value::Function {
                    ref closure,
                    ref meta,
                    ..
                } => Value::Function {
                    closure: Rc::clone(closure),
                    is_macro: true,
                    meta: meta.clone(),
                },
                other => {
                    return Err(Error::TypeError(format!(
                        "defmacro! requires a function, got {}",
                        other.type_name()
                    )));
                }
            };
            tracing::debug!(name, "defmacro!");
            env.set(name, mac.clone());
            Ok(Step::Return(mac))
        }
        _ => Err(Error::arity_error_with_expr(
            Arity::Exact(2),
            args.len(),
            "defmacro!",
        )),
    }
}

/// `(macroexpand form)`
pub(crate) fn eval_macroexpand(args: &[Value], env: &Environment) -> Result<Step, Error> {
    match args {
        [form] => Ok(Step::Return(macroexpand(form.clone(), env)?)),
        _ => Err(Error::arity_error_with_expr(
            Arity::Exact(1),
            args.len(),
            "macroexpand",
        )),
    }
}

/// `(try* form (catch* name handler))`; the handler is in tail position
pub(crate) fn eval_try(args: &[Value], env: &Environment) -> Result<Step, Error> {
    let (body, handler) = match args {
        [body] => return Ok(Step::Continue(body.clone(), env.clone())),
        [body, clause] => (body, parse_catch(clause)?),
        _ => {
            return Err(Error::arity_error_with_expr(
                Arity::Range(1, 2),
                args.len(),
                "try*",
            ));
        }
    };

    match eval(body, env) {
        Ok(value) => Ok(Step::Return(value)),
        Err(err) => {
            tracing::debug!(error = %err, "caught by try*");
            let (name, handler) = handler;
            let catch_env = Environment::with_parent(env);
            catch_env.set(name, err.into_value());
            Ok(Step::Continue(handler.clone(), catch_env))
        }
    }
}

fn parse_catch(clause: &Value) -> Result<(&str, &Value), Error> {
    if let Value::List(items, _) = clause
        && let [Value::Symbol(head), Value::Symbol(name), handler] = items.as_slice()
        && matches!(head.as_str(), "catch*" | "catch")
    {
        return Ok((name, handler));
    }
    Err(Error::EvalError("Invalid 'catch*' form".to_owned()))
}
