use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::Error;
use crate::ast::Value;
use crate::builtinops::Arity;
use crate::evaluator::intooperation::{IntoOperation, IntoVariadicOperation, OperationFn};

struct Frame {
    bindings: HashMap<String, Value>,
    parent: Option<Environment>,
}

/// Lexical scope: a frame of bindings plus an optional parent.
///
/// `Environment` is a shared handle; cloning it shares the frame. Closures keep their
/// defining environment alive through such a handle.
#[derive(Clone)]
pub struct Environment(Rc<RefCell<Frame>>);

/// Non-owning handle used by natives that need to reach back into an environment
/// without keeping it alive.
#[derive(Clone)]
pub(crate) struct WeakEnvironment(Weak<RefCell<Frame>>);

impl WeakEnvironment {
    pub(crate) fn upgrade(&self) -> Option<Environment> {
        self.0.upgrade().map(Environment)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frame = self.0.borrow();
        f.debug_struct("Environment")
            .field("bindings", &frame.bindings.len())
            .field("has_parent", &frame.parent.is_some())
            .finish()
    }
}

impl Environment {
    /// A root environment with no bindings
    pub fn new() -> Self {
        Environment(Rc::new(RefCell::new(Frame {
            bindings: HashMap::new(),
            parent: None,
        })))
    }

    /// An empty child frame of `parent`
    pub fn with_parent(parent: &Environment) -> Self {
        Environment(Rc::new(RefCell::new(Frame {
            bindings: HashMap::new(),
            parent: Some(parent.clone()),
        })))
    }

    /// Child frame binding `params` to `args` positionally. With a `rest` parameter the
    /// remaining arguments are bound to it as a list.
    pub fn bind(
        parent: &Environment,
        params: &[String],
        rest: Option<&str>,
        args: Vec<Value>,
    ) -> Result<Self, Error> {
        let arity = match rest {
            Some(_) => Arity::AtLeast(params.len()),
            None => Arity::Exact(params.len()),
        };
        arity.validate(args.len())?;

        let env = Environment::with_parent(parent);
        {
            let mut frame = env.0.borrow_mut();
            let mut args = args.into_iter();
            for (param, arg) in params.iter().zip(args.by_ref()) {
                frame.bindings.insert(param.clone(), arg);
            }
            if let Some(rest) = rest {
                frame
                    .bindings
                    .insert(rest.to_owned(), Value::List(Rc::new(args.collect()), None));
            }
        }
        Ok(env)
    }

    /// Insert or overwrite a binding in this frame only
    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.0.borrow_mut().bindings.insert(name.into(), value);
    }

    /// The nearest environment in the chain that binds `name`
    pub fn find(&self, name: &str) -> Option<Environment> {
        let mut current = self.clone();
        loop {
            let parent = {
                let frame = current.0.borrow();
                if frame.bindings.contains_key(name) {
                    break;
                }
                frame.parent.clone()
            };
            current = parent?;
        }
        Some(current)
    }

    /// Value bound to `name` anywhere in the chain, if any
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut current = self.clone();
        loop {
            let parent = {
                let frame = current.0.borrow();
                if let Some(value) = frame.bindings.get(name) {
                    return Some(value.clone());
                }
                frame.parent.clone()
            };
            current = parent?;
        }
    }

    /// Value bound to `name`, or an unbound-symbol error
    pub fn get(&self, name: &str) -> Result<Value, Error> {
        self.lookup(name)
            .ok_or_else(|| Error::UnboundVariable(name.to_owned()))
    }

    /// The outermost environment of the chain
    pub fn root(&self) -> Environment {
        let mut current = self.clone();
        loop {
            let parent = current.0.borrow().parent.clone();
            match parent {
                Some(parent) => current = parent,
                None => return current,
            }
        }
    }

    pub fn ptr_eq(&self, other: &Environment) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn downgrade(&self) -> WeakEnvironment {
        WeakEnvironment(Rc::downgrade(&self.0))
    }

    fn define_builtin(&self, name: &str, func: Rc<OperationFn>) {
        self.set(
            name,
            Value::BuiltinFunction {
                id: name.to_owned(),
                func,
                meta: None,
            },
        );
    }

    /// Register a native function working directly on the argument slice.
    ///
    /// This is the low-level registration API; most natives should prefer
    /// [`Environment::register_builtin_operation`].
    ///
    /// ```
    /// use ensemble::ast::Value;
    /// use ensemble::{Error, create_global_env, rep};
    ///
    /// fn arg_count(args: &[Value]) -> Result<Value, Error> {
    ///     Ok(Value::Number(args.len() as f64))
    /// }
    ///
    /// let env = create_global_env();
    /// env.register_builtin_function("arg-count", arg_count);
    /// assert_eq!(rep("(arg-count 1 2 3)", &env).unwrap(), "3");
    /// ```
    pub fn register_builtin_function(&self, name: &str, func: fn(&[Value]) -> Result<Value, Error>) {
        self.define_builtin(name, Rc::new(move |args: Vec<Value>| func(&args)));
    }

    /// Register a strongly-typed Rust function with automatic argument extraction,
    /// arity checking and result conversion.
    ///
    /// Supported parameter types:
    /// - `f64` (number) and `bool`
    /// - `&str` (borrowed string)
    /// - `Value` (owned access to the raw value)
    /// - `ValueIter<'_>`, `NumIter<'_>`, `StringIter<'_>` (elements of a list or vector argument)
    ///
    /// Supported return types: anything `Into<Value>`, or `Result<T, Error>` with
    /// `T: Into<Value>`.
    ///
    /// ```
    /// use ensemble::{create_global_env, rep};
    ///
    /// fn hypot(a: f64, b: f64) -> f64 {
    ///     (a * a + b * b).sqrt()
    /// }
    ///
    /// let env = create_global_env();
    /// env.register_builtin_operation::<_, (f64, f64)>("hypot", hypot);
    /// assert_eq!(rep("(hypot 3 4)", &env).unwrap(), "5");
    /// ```
    pub fn register_builtin_operation<F, Args>(&self, name: &str, func: F)
    where
        F: IntoOperation<Args>,
    {
        self.define_builtin(name, func.into_operation());
    }

    /// Register a native whose Rust signature ends with a rest parameter
    /// (`ValueIter<'_>`, `NumIter<'_>`, `StringIter<'_>`), optionally after a fixed prefix.
    ///
    /// The provided [`Arity`] is checked before the function runs, since the minimum and
    /// maximum argument counts of variadic functions cannot be derived from the signature.
    ///
    /// ```
    /// use ensemble::builtinops::Arity;
    /// use ensemble::evaluator::NumIter;
    /// use ensemble::{Error, create_global_env, rep};
    ///
    /// fn clamp_sum(limit: f64, rest: NumIter<'_>) -> f64 {
    ///     rest.sum::<f64>().min(limit)
    /// }
    ///
    /// let env = create_global_env();
    /// env.register_variadic_builtin_operation::<_, (f64, NumIter<'static>)>(
    ///     "clamp-sum",
    ///     Arity::AtLeast(2),
    ///     clamp_sum,
    /// );
    /// assert_eq!(rep("(clamp-sum 10 3 4)", &env).unwrap(), "7");
    /// assert_eq!(rep("(clamp-sum 10 30 4)", &env).unwrap(), "10");
    ///
    /// let err = rep("(clamp-sum 10)", &env).unwrap_err();
    /// assert_eq!(
    ///     err,
    ///     Error::arity_error_with_expr(Arity::AtLeast(2), 1, "clamp-sum")
    /// );
    /// ```
    pub fn register_variadic_builtin_operation<F, Args>(&self, name: &str, arity: Arity, func: F)
    where
        F: IntoVariadicOperation<Args>,
    {
        let inner = func.into_variadic_operation();
        let id = name.to_owned();
        let wrapped: Rc<OperationFn> = Rc::new(move |args: Vec<Value>| {
            arity
                .validate(args.len())
                .map_err(|e| with_expression(e, &id))?;
            inner(args)
        });
        self.define_builtin(name, wrapped);
    }

    /// Register a host collaborator.
    ///
    /// Host failures never propagate as interpreter errors: an `Err(e)` is converted to a
    /// [`Value::Error`] carrying `e.to_string()`, which the program can inspect or ignore.
    ///
    /// ```
    /// use ensemble::ast::Value;
    /// use ensemble::{create_global_env, rep};
    ///
    /// let env = create_global_env();
    /// env.register_host_function("parse-int", |args: &[Value]| match args {
    ///     [Value::String(s)] => s.parse::<i64>().map(|n| Value::Number(n as f64)),
    ///     _ => "x".parse::<i64>().map(|n| Value::Number(n as f64)),
    /// });
    /// assert_eq!(rep("(parse-int \"12\")", &env).unwrap(), "12");
    /// assert_eq!(rep("(parse-int \"zz\")", &env).unwrap(), "\"invalid digit found in string\"");
    /// ```
    pub fn register_host_function<F, E>(&self, name: &str, func: F)
    where
        F: Fn(&[Value]) -> Result<Value, E> + 'static,
        E: fmt::Display,
    {
        let id = name.to_owned();
        let wrapped: Rc<OperationFn> = Rc::new(move |args: Vec<Value>| {
            Ok(func(&args).unwrap_or_else(|e| {
                tracing::debug!(native = %id, error = %e, "host function failed");
                Value::error(Value::String(e.to_string()), "HostError")
            }))
        });
        self.define_builtin(name, wrapped);
    }

    /// All bindings visible from this environment, sorted by name.
    /// Child bindings shadow parent bindings.
    pub fn get_all_bindings(&self) -> Vec<(String, Value)> {
        let mut frames = Vec::new();
        let mut current = Some(self.clone());
        while let Some(env) = current {
            current = env.0.borrow().parent.clone();
            frames.push(env);
        }

        let mut bindings = HashMap::new();
        for env in frames.iter().rev() {
            for (name, value) in &env.0.borrow().bindings {
                bindings.insert(name.clone(), value.clone());
            }
        }

        let mut result: Vec<_> = bindings.into_iter().collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }
}

/// Attach the callee name to an arity error that has none yet
pub(crate) fn with_expression(error: Error, name: &str) -> Error {
    match error {
        Error::ArityError {
            expected,
            got,
            expression: None,
        } => Error::arity_error_with_expr(expected, got, name),
        other => other,
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::{list, val};

    #[test]
    fn test_set_only_touches_current_frame() {
        let root = Environment::new();
        root.set("x", val(1));
        let child = Environment::with_parent(&root);
        child.set("x", val(2));

        assert_eq!(child.get("x").unwrap(), val(2));
        assert_eq!(root.get("x").unwrap(), val(1));
    }

    #[test]
    fn test_lookup_delegates_to_parent() {
        let root = Environment::new();
        root.set("a", val("root"));
        let middle = Environment::with_parent(&root);
        let leaf = Environment::with_parent(&middle);

        assert_eq!(leaf.get("a").unwrap(), val("root"));
        assert!(leaf.find("a").unwrap().ptr_eq(&root));
        assert!(leaf.find("missing").is_none());
        assert!(leaf.root().ptr_eq(&root));
    }

    #[test]
    fn test_unbound_symbol_error() {
        let env = Environment::new();
        assert_eq!(
            env.get("nope").unwrap_err(),
            Error::UnboundVariable("nope".into())
        );
    }

    #[test]
    fn test_bind_positional_and_rest() {
        let root = Environment::new();
        let params = vec!["a".to_owned(), "b".to_owned()];

        let env = Environment::bind(&root, &params, None, vec![val(1), val(2)]).unwrap();
        assert_eq!(env.get("a").unwrap(), val(1));
        assert_eq!(env.get("b").unwrap(), val(2));

        let env = Environment::bind(&root, &params, Some("more"), vec![val(1), val(2), val(3)])
            .unwrap();
        assert_eq!(env.get("more").unwrap(), list([val(3)]));

        let env = Environment::bind(&root, &params, Some("more"), vec![val(1), val(2)]).unwrap();
        assert_eq!(env.get("more").unwrap(), list([]));
    }

    #[test]
    fn test_bind_arity_errors() {
        let root = Environment::new();
        let params = vec!["a".to_owned()];
        let err = Environment::bind(&root, &params, None, vec![]).unwrap_err();
        assert_eq!(err, Error::arity_error(Arity::Exact(1), 0));
        let err = Environment::bind(&root, &params, Some("r"), vec![]).unwrap_err();
        assert_eq!(err, Error::arity_error(Arity::AtLeast(1), 0));
    }

    #[test]
    fn test_get_all_bindings_shadowing() {
        let root = Environment::new();
        root.set("x", val(1));
        root.set("y", val(2));
        let child = Environment::with_parent(&root);
        child.set("x", val(10));

        let bindings = child.get_all_bindings();
        assert_eq!(
            bindings,
            vec![("x".to_owned(), val(10)), ("y".to_owned(), val(2))]
        );
    }

    #[test]
    fn test_register_variadic_builtin_operation() {
        use crate::evaluator::NumIter;
        use crate::{create_global_env, rep};

        fn scaled_sum(factor: f64, rest: NumIter<'_>) -> f64 {
            factor * rest.sum::<f64>()
        }

        let env = create_global_env();
        env.register_variadic_builtin_operation::<_, (f64, NumIter<'static>)>(
            "scaled-sum",
            Arity::Range(2, 4),
            scaled_sum,
        );
        assert_eq!(rep("(scaled-sum 2 1)", &env).unwrap(), "2");
        assert_eq!(rep("(scaled-sum 10 1 2 3)", &env).unwrap(), "60");

        // Arity is checked before any argument conversion
        for (source, got) in [("(scaled-sum 2)", 1), ("(scaled-sum 1 1 1 1 1)", 5)] {
            assert_eq!(
                rep(source, &env).unwrap_err(),
                Error::arity_error_with_expr(Arity::Range(2, 4), got, "scaled-sum"),
                "{source}"
            );
        }
        let err = rep("(scaled-sum \"x\" 1)", &env).unwrap_err();
        assert!(matches!(err, Error::TypeError(_)), "{err:?}");
        let err = rep("(scaled-sum 2 1 \"x\")", &env).unwrap_err();
        assert!(
            matches!(&err, Error::TypeError(msg) if msg.starts_with("Invalid NumberNode")),
            "{err:?}"
        );

        let caught = rep("(try* (scaled-sum 2) (catch* e e))", &env).unwrap();
        assert_eq!(caught, "\"scaled-sum: expected between 2 and 4 arguments, got 1\"");
    }

    #[test]
    fn test_weak_handle() {
        let env = Environment::new();
        let weak = env.downgrade();
        assert!(weak.upgrade().unwrap().ptr_eq(&env));
        drop(env);
        assert!(weak.upgrade().is_none());
    }
}
