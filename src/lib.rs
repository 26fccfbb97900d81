//! Ensemble - a small MAL-style Lisp interpreter
//!
//! This crate implements a compact Lisp in the "Make a Lisp" family: a reader that turns
//! source text into a tagged AST, an environment chain for lexical scoping, a trampolined
//! evaluator with proper tail calls, macros and `try*`/`catch*`, and a printer that turns
//! values back into readable text.
//!
//! ```lisp
//! (def! fib (fn* (n) (if (< n 2) n (+ (fib (- n 1)) (fib (- n 2))))))
//! (let* (a 5 b (+ a 1)) (* a b))        ; => 30
//! (defmacro! unless (fn* (c a b) `(if ~c ~b ~a)))
//! (try* (throw "boom") (catch* e (str "caught " e)))  ; => "caught boom"
//! ```
//!
//! ## Pipeline
//!
//! Source text flows through [`reader`] → [`evaluator`] → [`printer`]. The [`rep`] helper
//! wires the three together and returns the printed result instead of writing to a stream:
//!
//! ```
//! use ensemble::{create_global_env, rep};
//!
//! let env = create_global_env();
//! assert_eq!(rep("(+ 1 2)", &env).unwrap(), "3");
//! assert_eq!(rep("(def! a (atom 2)) (swap! a (fn* (x) (* x 10))) (deref a)", &env).unwrap(), "20");
//! ```
//!
//! ## Truthiness
//!
//! Only `nil` and `false` are falsy. `0`, `""` and empty collections are all truthy.
//!
//! ## Modules
//!
//! - `ast`: the [`ast::Value`] sum type, map keys, closures and error values
//! - `reader`: tokenizer and recursive-descent parser
//! - `printer`: readable and raw printing
//! - `evaluator`: environments, the trampoline, special forms and macro expansion
//! - `builtinops`: arity rules, the special-form registry and the core native library
//! - `io`: file and console natives (feature `io`)
//! - `json`: JSON interop natives (feature `json`)

use std::fmt;

use crate::ast::Value;
use crate::builtinops::Arity;

/// Maximum reader nesting depth to prevent stack overflow on hostile input
pub const MAX_READ_DEPTH: usize = 128;

/// Maximum depth of nested (non-tail) evaluation. Must be reached before an unoptimized
/// build exhausts a default 2 MiB thread stack.
/// Tail calls run inside the trampoline and do not count against this limit.
pub const MAX_EVAL_DEPTH: usize = 64;

/// Maximum number of consecutive macro expansions of a single form
pub const MAX_MACRO_EXPANSIONS: usize = 10_000;

/// Categorizes the different kinds of reader errors.
#[derive(Debug, PartialEq, Clone)]
pub enum ReadErrorKind {
    /// Input ended before the form was complete (EOF, unterminated string, unclosed sequence)
    Incomplete,
    /// A closing delimiter with no matching opener
    UnexpectedDelimiter,
    /// Malformed literal content (odd map entries, invalid map keys)
    InvalidSyntax,
    /// Form nesting exceeded [`MAX_READ_DEPTH`]
    TooDeeplyNested,
}

/// A structured error describing a reader failure.
#[derive(Debug, PartialEq, Clone)]
pub struct ReadError {
    pub kind: ReadErrorKind,
    pub message: String,
    /// Context snippet from the input around the failure (max 60 chars)
    pub context: Option<String>,
    /// The problematic token, if one was available
    pub found: Option<String>,
}

impl ReadError {
    pub fn new(kind: ReadErrorKind, message: impl Into<String>) -> Self {
        ReadError {
            kind,
            message: message.into(),
            context: None,
            found: None,
        }
    }

    /// Create a ReadError with a context snippet extracted from `input` at a byte offset
    pub fn with_context(
        kind: ReadErrorKind,
        message: impl Into<String>,
        input: &str,
        offset: usize,
        found: Option<String>,
    ) -> Self {
        const MAX_CONTEXT: usize = 60;

        let start = floor_char_boundary(input, offset.saturating_sub(20));
        let snippet: String = input[start..].chars().take(MAX_CONTEXT).collect();

        let mut context = String::new();
        if start > 0 {
            context.push_str("[...]");
        }
        context.push_str(&snippet);
        if start + snippet.len() < input.len() {
            context.push_str("[...]");
        }
        let context = context.replace('\n', "\\n").replace('\r', "");

        ReadError {
            kind,
            message: message.into(),
            context: Some(context),
            found,
        }
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Error types for the interpreter
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    ReadError(ReadError),
    EvalError(String),
    TypeError(String),
    UnboundVariable(String),
    ArityError {
        expected: Arity,
        got: usize,
        expression: Option<String>,
    },
    IoError(String),
    /// A value raised by `throw`
    Thrown(Value),
}

impl Error {
    /// Create an ArityError without expression context
    pub fn arity_error(expected: Arity, got: usize) -> Self {
        Error::ArityError {
            expected,
            got,
            expression: None,
        }
    }

    /// Create an ArityError naming the form or function that was called
    pub fn arity_error_with_expr(expected: Arity, got: usize, expression: impl Into<String>) -> Self {
        Error::ArityError {
            expected,
            got,
            expression: Some(expression.into()),
        }
    }

    /// The bare message without the category prefix used by `Display`.
    pub fn message(&self) -> String {
        match self {
            Error::ReadError(e) => e.message.clone(),
            Error::EvalError(msg) | Error::TypeError(msg) | Error::IoError(msg) => msg.clone(),
            Error::UnboundVariable(var) => format!("'{var}' not found"),
            Error::ArityError {
                expected,
                got,
                expression,
            } => match expression {
                Some(expr) => format!("{expr}: expected {expected} arguments, got {got}"),
                None => format!("expected {expected} arguments, got {got}"),
            },
            Error::Thrown(value) => printer::print_string(value, false),
        }
    }

    /// Name attached to the error value bound by `catch*`
    pub fn name(&self) -> &'static str {
        match self {
            Error::ReadError(_) => "SyntaxError",
            Error::EvalError(_) => "EvalError",
            Error::TypeError(_) => "TypeError",
            Error::UnboundVariable(_) => "ReferenceError",
            Error::ArityError { .. } => "ArityError",
            Error::IoError(_) => "IoError",
            Error::Thrown(_) => "Error",
        }
    }

    /// Convert into the value bound by `catch*`.
    ///
    /// Thrown values keep their payload untouched, and rethrowing a caught error value
    /// yields that same value. Interpreter failures carry their message as a string
    /// payload.
    pub fn into_value(self) -> Value {
        let name = self.name();
        match self {
            Error::Thrown(caught @ Value::Error(_)) => caught,
            Error::Thrown(payload) => Value::error(payload, name),
            other => Value::error(Value::String(other.message()), name),
        }
    }
}

impl From<ReadError> for Error {
    fn from(e: ReadError) -> Self {
        Error::ReadError(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ReadError(e) => {
                write!(f, "ReadError: {}", e.message)?;
                if let Some(found) = &e.found {
                    write!(f, "\nFound: {found}")?;
                }
                if let Some(context) = &e.context {
                    write!(f, "\nContext: {context}")?;
                }
                Ok(())
            }
            Error::EvalError(msg) => write!(f, "EvaluationError: {msg}"),
            Error::TypeError(msg) => write!(f, "Type error: {msg}"),
            Error::UnboundVariable(var) => write!(f, "'{var}' not found"),
            Error::ArityError {
                expected,
                got,
                expression,
            } => match expression {
                Some(expr) => write!(
                    f,
                    "ArityError: {expr}: expected {expected} arguments, got {got}"
                ),
                None => write!(f, "ArityError: expected {expected} arguments, got {got}"),
            },
            Error::IoError(msg) => write!(f, "IoError: {msg}"),
            Error::Thrown(value) => {
                write!(f, "Uncaught exception: {}", printer::print_string(value, true))
            }
        }
    }
}

impl std::error::Error for Error {}

/// Read every form in `input`, evaluate them in order in `env`, and return the readable
/// print of the last result. Empty input prints as `nil`.
pub fn rep(input: &str, env: &evaluator::Environment) -> Result<String, Error> {
    let mut result = Value::Nil;
    for form in reader::read_all(input)? {
        result = evaluator::eval(&form, env)?;
    }
    Ok(printer::print_string(&result, true))
}

pub use builtinops::create_global_env;

pub mod ast;
pub mod builtinops;
pub mod evaluator;
pub mod printer;
pub mod reader;

#[cfg(feature = "io")]
pub mod io;

#[cfg(feature = "json")]
pub mod json;
