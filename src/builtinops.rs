//! Built-in operations registry.
//!
//! Two tables live here:
//!
//! - **Special forms** (`def!`, `let*`, `if`, `fn*`, ...) control the evaluation of their
//!   operands. They are looked up by head symbol in a static registry before any
//!   environment lookup, so they cannot be shadowed.
//! - **Core natives** (`+`, `cons`, `swap!`, ...) receive evaluated arguments. They are
//!   installed into the root environment by [`create_global_env`] and can be passed around,
//!   rebound and applied like any other function.
//!
//! ## Error handling
//!
//! Every native validates its argument count against its declared [`Arity`] before it
//! runs, then asserts argument types up front with a specific error. Natives never mutate
//! their inputs; the only mutable state is an atom's cell.
//!
//! ## Adding new operations
//!
//! 1. Write the function with typed parameters (`NumberType`, `&str`, `Value`, or the
//!    `ValueIter`/`NumIter`/`StringIter` rest iterators), or as a raw
//!    `fn(Vec<Value>) -> Result<Value, Error>` when it needs ownership of its arguments.
//! 2. Add a [`BuiltinOp`] entry to `builtin_ops` with its identifier and arity.
//! 3. Add cases to the data-driven tests below.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::Error;
use crate::ast::{MapKey, MapType, NumberType, Value, list};
use crate::evaluator::intooperation::{IntoOperation, IntoVariadicOperation, OperationFn};
use crate::evaluator::{
    Environment, NumIter, Step, ValueIter, apply_function, eval, eval_def, eval_defmacro, eval_do,
    eval_fn, eval_if, eval_let, eval_macroexpand, eval_quasiquote, eval_quasiquoteexpand,
    eval_quote, eval_try,
};
use crate::printer::print_joined;
use crate::reader::{read_all, read_str};

/// Expected number of arguments for a native or special form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly N arguments
    Exact(usize),
    /// N or more arguments
    AtLeast(usize),
    /// Between min and max arguments, inclusive
    Range(usize, usize),
    /// Any even number, for key/value pairs
    Even,
    /// Any number of arguments
    Any,
}

impl Arity {
    /// Check an argument count against this arity
    pub fn validate(&self, got: usize) -> Result<(), Error> {
        let ok = match *self {
            Arity::Exact(n) => got == n,
            Arity::AtLeast(n) => got >= n,
            Arity::Range(min, max) => (min..=max).contains(&got),
            Arity::Even => got % 2 == 0,
            Arity::Any => true,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::arity_error(*self, got))
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "exactly {n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
            Arity::Range(min, max) => write!(f, "between {min} and {max}"),
            Arity::Even => write!(f, "an even number of"),
            Arity::Any => write!(f, "any number of"),
        }
    }
}

//
// Special forms
//

/// Evaluator entry point for a special form: unevaluated operands plus the current
/// environment, returning the next trampoline step.
pub(crate) type SpecialForm = fn(&[Value], &Environment) -> Result<Step, Error>;

static SPECIAL_FORMS: LazyLock<HashMap<&'static str, SpecialForm>> = LazyLock::new(|| {
    let forms: [(&'static str, SpecialForm); 17] = [
        ("def!", eval_def),
        ("let*", eval_let),
        ("do", eval_do),
        ("if", eval_if),
        ("fn*", eval_fn),
        ("quote", eval_quote),
        ("quasiquote", eval_quasiquote),
        ("quasiquoteexpand", eval_quasiquoteexpand),
        ("defmacro!", eval_defmacro),
        ("macroexpand", eval_macroexpand),
        ("try*", eval_try),
        // JavaScript-flavoured spellings
        ("var", eval_def),
        ("let", eval_let),
        ("const", eval_let),
        ("function", eval_fn),
        ("=>", eval_fn),
        ("try", eval_try),
    ];
    forms.into_iter().collect()
});

pub(crate) fn find_special_form(name: &str) -> Option<SpecialForm> {
    SPECIAL_FORMS.get(name).copied()
}

/// Whether `name` is handled by the evaluator rather than looked up in the environment
pub fn is_special_form(name: &str) -> bool {
    SPECIAL_FORMS.contains_key(name)
}

//
// Core native implementations
//

/// Definition of a core native
pub struct BuiltinOp {
    /// Symbol the native is bound to in the root environment
    pub id: &'static str,
    /// Expected number of arguments, checked before the native runs
    pub arity: Arity,
    func: Rc<OperationFn>,
}

impl fmt::Debug for BuiltinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinOp")
            .field("id", &self.id)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

macro_rules! type_predicate {
    ($name:ident, $pattern:pat) => {
        fn $name(value: Value) -> bool {
            matches!(value, $pattern)
        }
    };
}

type_predicate!(builtin_is_nil, Value::Nil);
type_predicate!(builtin_is_true, Value::Bool(true));
type_predicate!(builtin_is_false, Value::Bool(false));
type_predicate!(builtin_is_symbol, Value::Symbol(_));
type_predicate!(builtin_is_keyword, Value::Keyword(_));
type_predicate!(builtin_is_number, Value::Number(_));
type_predicate!(builtin_is_string, Value::String(_));
type_predicate!(
    builtin_is_fn,
    Value::BuiltinFunction { .. } | Value::Function { is_macro: false, .. }
);
type_predicate!(builtin_is_macro, Value::Function { is_macro: true, .. });
type_predicate!(builtin_is_list, Value::List(..));
type_predicate!(builtin_is_vector, Value::Vector(..));
type_predicate!(builtin_is_sequential, Value::List(..) | Value::Vector(..));
type_predicate!(builtin_is_map, Value::Map(..));
type_predicate!(builtin_is_atom, Value::Atom(_));

// Chained numeric comparisons: every adjacent pair must satisfy the operator
macro_rules! numeric_comparison {
    ($name:ident, $op:tt) => {
        fn $name(first: NumberType, rest: NumIter<'_>) -> bool {
            let mut prev = first;
            for current in rest {
                if !(prev $op current) {
                    return false;
                }
                prev = current;
            }
            true
        }
    };
}

numeric_comparison!(builtin_lt, <);
numeric_comparison!(builtin_le, <=);
numeric_comparison!(builtin_gt, >);
numeric_comparison!(builtin_ge, >=);

fn builtin_equal(first: Value, second: Value) -> bool {
    first == second
}

fn builtin_throw(payload: Value) -> Result<Value, Error> {
    Err(Error::Thrown(payload))
}

fn builtin_symbol(name: &str) -> Value {
    Value::Symbol(name.to_owned())
}

fn builtin_keyword(value: Value) -> Result<Value, Error> {
    match value {
        Value::Keyword(_) => Ok(value),
        Value::String(ref name) => Ok(Value::Keyword(format!(":{name}"))),
        other => Err(Error::TypeError(format!(
            "keyword expects a string or keyword, got {}",
            other.type_name()
        ))),
    }
}

fn builtin_add(args: NumIter<'_>) -> NumberType {
    args.sum()
}

/// With one argument, negation
fn builtin_sub(first: NumberType, rest: NumIter<'_>) -> NumberType {
    if rest.len() == 0 {
        return -first;
    }
    rest.fold(first, |acc, n| acc - n)
}

fn builtin_mul(args: NumIter<'_>) -> NumberType {
    args.product()
}

fn builtin_div(first: NumberType, rest: NumIter<'_>) -> NumberType {
    rest.fold(first, |acc, n| acc / n)
}

fn builtin_time_ms() -> Result<NumberType, Error> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::EvalError(format!("system clock error: {e}")))?;
    Ok(elapsed.as_millis() as NumberType)
}

fn builtin_pr_str(args: ValueIter<'_>) -> String {
    print_joined(args, true, " ")
}

fn builtin_str(args: ValueIter<'_>) -> String {
    print_joined(args, false, "")
}

fn builtin_prn(args: ValueIter<'_>) -> Value {
    println!("{}", print_joined(args, true, " "));
    Value::Nil
}

fn builtin_println(args: ValueIter<'_>) -> Value {
    println!("{}", print_joined(args, false, " "));
    Value::Nil
}

fn builtin_read_string(source: &str) -> Result<Value, Error> {
    Ok(read_str(source)?)
}

fn builtin_trim(s: &str) -> String {
    s.trim().to_owned()
}

/// Elements of a list or vector; `nil` is the empty sequence
fn sequence_or_empty(value: &Value) -> Result<&[Value], Error> {
    match value {
        Value::Nil => Ok(&[]),
        other => other.expect_sequence(),
    }
}

fn builtin_join(args: Vec<Value>) -> Result<Value, Error> {
    let (seq, separator) = match args.as_slice() {
        [seq] => (seq, " "),
        [seq, Value::String(separator)] => (seq, separator.as_str()),
        [_, other] => {
            return Err(Error::TypeError(format!(
                "join separator must be a string, got {}",
                other.type_name()
            )));
        }
        _ => return Err(Error::arity_error(Arity::Range(1, 2), args.len())),
    };
    Ok(Value::String(print_joined(
        sequence_or_empty(seq)?,
        false,
        separator,
    )))
}

fn builtin_list(args: Vec<Value>) -> Result<Value, Error> {
    Ok(list(args))
}

fn builtin_vector(args: Vec<Value>) -> Result<Value, Error> {
    Ok(Value::Vector(Rc::new(args), None))
}

fn builtin_vec(value: Value) -> Result<Value, Error> {
    match value {
        vector @ Value::Vector(..) => Ok(vector),
        Value::List(ref items, _) => Ok(Value::Vector(Rc::clone(items), None)),
        Value::Nil => Ok(Value::Vector(Rc::default(), None)),
        other => Err(Error::TypeError(format!(
            "vec expects a sequence, got {}",
            other.type_name()
        ))),
    }
}

/// `nil` for empty input; strings split into one-character strings
fn builtin_seq(value: Value) -> Result<Value, Error> {
    match value {
        Value::Nil => Ok(Value::Nil),
        Value::List(ref items, _) | Value::Vector(ref items, _) if items.is_empty() => {
            Ok(Value::Nil)
        }
        Value::List(ref items, _) | Value::Vector(ref items, _) => {
            Ok(Value::List(Rc::clone(items), None))
        }
        Value::String(ref s) if s.is_empty() => Ok(Value::Nil),
        Value::String(ref s) => Ok(list(s.chars().map(|c| Value::String(c.to_string())))),
        other => Err(Error::TypeError(format!(
            "seq expects a sequence or string, got {}",
            other.type_name()
        ))),
    }
}

fn builtin_cons(head: Value, tail: Value) -> Result<Value, Error> {
    let tail = sequence_or_empty(&tail)?;
    let mut items = Vec::with_capacity(tail.len() + 1);
    items.push(head);
    items.extend_from_slice(tail);
    Ok(list(items))
}

fn builtin_concat(args: Vec<Value>) -> Result<Value, Error> {
    let mut items = Vec::new();
    for arg in &args {
        items.extend_from_slice(sequence_or_empty(arg)?);
    }
    Ok(list(items))
}

/// Lists grow at the front, one argument at a time; vectors grow at the back
fn builtin_conj(args: Vec<Value>) -> Result<Value, Error> {
    let Some((target, additions)) = args.split_first() else {
        return Err(Error::arity_error(Arity::AtLeast(1), 0));
    };
    match target {
        Value::List(..) | Value::Nil => {
            let existing = sequence_or_empty(target)?;
            let mut items: Vec<Value> = additions.iter().rev().cloned().collect();
            items.extend_from_slice(existing);
            Ok(list(items))
        }
        Value::Vector(existing, _) => {
            let mut items = existing.to_vec();
            items.extend_from_slice(additions);
            Ok(Value::Vector(Rc::new(items), None))
        }
        other => Err(Error::TypeError(format!(
            "conj expects a list or vector, got {}",
            other.type_name()
        ))),
    }
}

fn builtin_count(value: Value) -> Result<usize, Error> {
    match &value {
        Value::Nil => Ok(0),
        Value::List(items, _) | Value::Vector(items, _) => Ok(items.len()),
        Value::Map(map, _) => Ok(map.len()),
        _ => Err(Error::TypeError("Invalid argument type".to_owned())),
    }
}

fn builtin_is_empty(value: Value) -> Result<bool, Error> {
    Ok(builtin_count(value)? == 0)
}

fn builtin_first(value: Value) -> Value {
    value
        .as_sequence()
        .and_then(<[Value]>::first)
        .cloned()
        .unwrap_or(Value::Nil)
}

fn builtin_last(value: Value) -> Value {
    value
        .as_sequence()
        .and_then(<[Value]>::last)
        .cloned()
        .unwrap_or(Value::Nil)
}

fn builtin_rest(value: Value) -> Value {
    let tail = value
        .as_sequence()
        .map(|items| items.iter().skip(1).cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    list(tail)
}

fn builtin_nth(seq: Value, index: NumberType) -> Result<Value, Error> {
    let items = seq.expect_sequence()?;
    let out_of_range = || Error::EvalError("index out of range".to_owned());
    if index < 0.0 || index.fract() != 0.0 {
        return Err(out_of_range());
    }
    items.get(index as usize).cloned().ok_or_else(out_of_range)
}

fn builtin_map(func: Value, seq: Value) -> Result<Value, Error> {
    let mapped = sequence_or_empty(&seq)?
        .iter()
        .map(|item| apply_function(&func, vec![item.clone()]))
        .collect::<Result<Vec<_>, Error>>()?;
    Ok(list(mapped))
}

/// `(apply f a b [c d])` calls `f` with `a b c d`
fn builtin_apply(args: Vec<Value>) -> Result<Value, Error> {
    let Some((func, rest)) = args.split_first() else {
        return Err(Error::arity_error(Arity::AtLeast(1), 0));
    };
    let mut call_args = Vec::new();
    if let Some((spread, leading)) = rest.split_last() {
        call_args.extend_from_slice(leading);
        call_args.extend_from_slice(sequence_or_empty(spread)?);
    }
    apply_function(func, call_args)
}

fn assoc_pairs(mut map: MapType, pairs: &[Value]) -> Result<MapType, Error> {
    if pairs.len() % 2 != 0 {
        return Err(Error::arity_error(Arity::Even, pairs.len()));
    }
    for pair in pairs.chunks_exact(2) {
        map.insert(MapKey::try_from(&pair[0])?, pair[1].clone());
    }
    Ok(map)
}

fn expect_map<'a>(value: &'a Value, op: &str) -> Result<&'a MapType, Error> {
    match value {
        Value::Map(map, _) => Ok(map),
        other => Err(Error::TypeError(format!(
            "{op} expects a map, got {}",
            other.type_name()
        ))),
    }
}

fn builtin_hash_map(args: Vec<Value>) -> Result<Value, Error> {
    Ok(Value::from(assoc_pairs(MapType::new(), &args)?))
}

fn builtin_assoc(args: Vec<Value>) -> Result<Value, Error> {
    let Some((target, pairs)) = args.split_first() else {
        return Err(Error::arity_error(Arity::AtLeast(1), 0));
    };
    let base = match target {
        Value::Nil => MapType::new(),
        other => expect_map(other, "assoc")?.clone(),
    };
    Ok(Value::from(assoc_pairs(base, pairs)?))
}

fn builtin_dissoc(args: Vec<Value>) -> Result<Value, Error> {
    let Some((target, keys)) = args.split_first() else {
        return Err(Error::arity_error(Arity::AtLeast(1), 0));
    };
    let mut map = expect_map(target, "dissoc")?.clone();
    for key in keys {
        map.shift_remove(&MapKey::try_from(key)?);
    }
    Ok(Value::from(map))
}

/// `nil` when the target is not a map or the key is absent
fn builtin_get(target: Value, key: Value) -> Value {
    match (&target, MapKey::try_from(&key)) {
        (Value::Map(map, _), Ok(key)) => map.get(&key).cloned().unwrap_or(Value::Nil),
        _ => Value::Nil,
    }
}

fn builtin_contains(target: Value, key: Value) -> Result<bool, Error> {
    match &target {
        Value::Nil => Ok(false),
        other => Ok(expect_map(other, "contains?")?.contains_key(&MapKey::try_from(&key)?)),
    }
}

fn builtin_keys(target: Value) -> Result<Value, Error> {
    Ok(list(expect_map(&target, "keys")?.keys().map(MapKey::to_value)))
}

fn builtin_vals(target: Value) -> Result<Value, Error> {
    Ok(list(expect_map(&target, "vals")?.values().cloned()))
}

fn builtin_meta(value: Value) -> Result<Value, Error> {
    value.meta()
}

fn builtin_with_meta(value: Value, meta: Value) -> Result<Value, Error> {
    value.with_meta(meta)
}

fn builtin_atom(value: Value) -> Value {
    Value::atom(value)
}

fn expect_atom(value: &Value) -> Result<&Rc<std::cell::RefCell<Value>>, Error> {
    match value {
        Value::Atom(cell) => Ok(cell),
        other => Err(Error::TypeError(format!(
            "Invalid atom type: {}",
            other.type_name()
        ))),
    }
}

fn builtin_deref(atom: Value) -> Result<Value, Error> {
    Ok(expect_atom(&atom)?.borrow().clone())
}

fn builtin_reset(atom: Value, value: Value) -> Result<Value, Error> {
    *expect_atom(&atom)?.borrow_mut() = value.clone();
    Ok(value)
}

/// `(swap! atom f & args)` stores and returns `(f @atom args...)`
fn builtin_swap(args: Vec<Value>) -> Result<Value, Error> {
    let [atom, func, extra @ ..] = args.as_slice() else {
        return Err(Error::arity_error(Arity::AtLeast(2), args.len()));
    };
    let cell = expect_atom(atom)?;
    // The cell is not borrowed while `func` runs; it may read the atom itself
    let current = cell.borrow().clone();
    let mut call_args = Vec::with_capacity(extra.len() + 1);
    call_args.push(current);
    call_args.extend_from_slice(extra);
    let updated = apply_function(func, call_args)?;
    *cell.borrow_mut() = updated.clone();
    Ok(updated)
}

fn builtin_fixed<Args, F>(f: F) -> Rc<OperationFn>
where
    F: IntoOperation<Args>,
{
    <F as IntoOperation<Args>>::into_operation(f)
}

fn builtin_variadic<Args, F>(f: F) -> Rc<OperationFn>
where
    F: IntoVariadicOperation<Args>,
{
    <F as IntoVariadicOperation<Args>>::into_variadic_operation(f)
}

fn builtin_raw(f: fn(Vec<Value>) -> Result<Value, Error>) -> Rc<OperationFn> {
    Rc::new(f)
}

/// All core natives, in the order they are installed.
///
/// Natives hold `Rc` closures, which cannot live in a shared static, so the table is
/// built once per global environment.
pub fn builtin_ops() -> Vec<BuiltinOp> {
    macro_rules! op {
        ($id:expr, $arity:expr, $func:expr) => {
            BuiltinOp {
                id: $id,
                arity: $arity,
                func: $func,
            }
        };
    }
    use Arity::{AtLeast, Even, Exact, Range};

    vec![
        // Equality, predicates and errors
        op!("=", Exact(2), builtin_fixed::<(Value, Value), _>(builtin_equal)),
        op!("throw", Exact(1), builtin_fixed::<(Value,), _>(builtin_throw)),
        op!("nil?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_nil)),
        op!("true?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_true)),
        op!("false?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_false)),
        op!("symbol?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_symbol)),
        op!("keyword?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_keyword)),
        op!("number?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_number)),
        op!("string?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_string)),
        op!("fn?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_fn)),
        op!("macro?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_macro)),
        op!("list?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_list)),
        op!("vector?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_vector)),
        op!("sequential?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_sequential)),
        op!("map?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_map)),
        op!("atom?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_atom)),
        op!("empty?", Exact(1), builtin_fixed::<(Value,), _>(builtin_is_empty)),
        // Constructors and conversions
        op!("symbol", Exact(1), builtin_fixed::<(&str,), _>(builtin_symbol)),
        op!("keyword", Exact(1), builtin_fixed::<(Value,), _>(builtin_keyword)),
        op!("list", AtLeast(0), builtin_raw(builtin_list)),
        op!("vector", AtLeast(0), builtin_raw(builtin_vector)),
        op!("vec", Exact(1), builtin_fixed::<(Value,), _>(builtin_vec)),
        op!("hash-map", Even, builtin_raw(builtin_hash_map)),
        op!("dict", Even, builtin_raw(builtin_hash_map)),
        op!("seq", Exact(1), builtin_fixed::<(Value,), _>(builtin_seq)),
        op!("atom", Exact(1), builtin_fixed::<(Value,), _>(builtin_atom)),
        // Strings and printing
        op!("pr-str", AtLeast(0), builtin_variadic::<(ValueIter<'static>,), _>(builtin_pr_str)),
        op!("str", AtLeast(0), builtin_variadic::<(ValueIter<'static>,), _>(builtin_str)),
        op!("prn", AtLeast(0), builtin_variadic::<(ValueIter<'static>,), _>(builtin_prn)),
        op!("println", AtLeast(0), builtin_variadic::<(ValueIter<'static>,), _>(builtin_println)),
        op!("read-string", Exact(1), builtin_fixed::<(&str,), _>(builtin_read_string)),
        op!("trim", Exact(1), builtin_fixed::<(&str,), _>(builtin_trim)),
        op!("join", Range(1, 2), builtin_raw(builtin_join)),
        // Arithmetic and comparison
        op!("+", AtLeast(0), builtin_variadic::<(NumIter<'static>,), _>(builtin_add)),
        op!("-", AtLeast(1), builtin_variadic::<(NumberType, NumIter<'static>), _>(builtin_sub)),
        op!("*", AtLeast(0), builtin_variadic::<(NumIter<'static>,), _>(builtin_mul)),
        op!("/", AtLeast(2), builtin_variadic::<(NumberType, NumIter<'static>), _>(builtin_div)),
        op!("<", AtLeast(2), builtin_variadic::<(NumberType, NumIter<'static>), _>(builtin_lt)),
        op!("<=", AtLeast(2), builtin_variadic::<(NumberType, NumIter<'static>), _>(builtin_le)),
        op!(">", AtLeast(2), builtin_variadic::<(NumberType, NumIter<'static>), _>(builtin_gt)),
        op!(">=", AtLeast(2), builtin_variadic::<(NumberType, NumIter<'static>), _>(builtin_ge)),
        op!("time-ms", Exact(0), builtin_fixed::<(), _>(builtin_time_ms)),
        // Sequences
        op!("cons", Exact(2), builtin_fixed::<(Value, Value), _>(builtin_cons)),
        op!("concat", AtLeast(0), builtin_raw(builtin_concat)),
        op!("conj", AtLeast(1), builtin_raw(builtin_conj)),
        op!("count", Exact(1), builtin_fixed::<(Value,), _>(builtin_count)),
        op!("first", Exact(1), builtin_fixed::<(Value,), _>(builtin_first)),
        op!("last", Exact(1), builtin_fixed::<(Value,), _>(builtin_last)),
        op!("rest", Exact(1), builtin_fixed::<(Value,), _>(builtin_rest)),
        op!("nth", Exact(2), builtin_fixed::<(Value, NumberType), _>(builtin_nth)),
        op!("map", Exact(2), builtin_fixed::<(Value, Value), _>(builtin_map)),
        op!("apply", AtLeast(1), builtin_raw(builtin_apply)),
        // Maps
        op!("assoc", AtLeast(1), builtin_raw(builtin_assoc)),
        op!("dissoc", AtLeast(1), builtin_raw(builtin_dissoc)),
        op!("get", Exact(2), builtin_fixed::<(Value, Value), _>(builtin_get)),
        op!("contains?", Exact(2), builtin_fixed::<(Value, Value), _>(builtin_contains)),
        op!("keys", Exact(1), builtin_fixed::<(Value,), _>(builtin_keys)),
        op!("vals", Exact(1), builtin_fixed::<(Value,), _>(builtin_vals)),
        // Metadata
        op!("meta", Exact(1), builtin_fixed::<(Value,), _>(builtin_meta)),
        op!("with-meta", Exact(2), builtin_fixed::<(Value, Value), _>(builtin_with_meta)),
        // Atoms
        op!("deref", Exact(1), builtin_fixed::<(Value,), _>(builtin_deref)),
        op!("reset!", Exact(2), builtin_fixed::<(Value, Value), _>(builtin_reset)),
        op!("swap!", AtLeast(2), builtin_raw(builtin_swap)),
    ]
}

/// Bind `op` in `env`, checking its arity before every call
fn install(env: &Environment, op: BuiltinOp) {
    let BuiltinOp { id, arity, func } = op;
    let checked: Rc<OperationFn> = Rc::new(move |args: Vec<Value>| {
        arity.validate(args.len())?;
        func(args)
    });
    env.set(
        id,
        Value::BuiltinFunction {
            id: id.to_owned(),
            func: checked,
            meta: None,
        },
    );
}

/// Definitions written in the language itself, evaluated into every global environment
const PRELUDE: &str = r#"
(def! *host-language* "rust")
(def! *ARGV* (list))
(def! not (fn* (a) (if a false true)))
(defmacro! cond
  (fn* (& xs)
    (if (> (count xs) 0)
      (list 'if (first xs)
        (if (> (count xs) 1) (nth xs 1) (throw "odd number of forms to cond"))
        (cons 'cond (rest (rest xs)))))))
"#;

fn load_prelude(env: &Environment, source: &str) {
    let forms = match read_all(source) {
        Ok(forms) => forms,
        Err(e) => {
            tracing::error!(error = %Error::from(e), "prelude failed to parse");
            return;
        }
    };
    for form in &forms {
        if let Err(e) = eval(form, env) {
            tracing::error!(error = %e, %form, "prelude form failed");
        }
    }
}

/// Create a root environment holding the core natives, `eval`, the prelude definitions
/// and, when enabled, the host I/O and JSON natives.
pub fn create_global_env() -> Environment {
    let env = Environment::new();
    for op in builtin_ops() {
        install(&env, op);
    }

    // `eval` always runs in the root environment; a weak handle avoids an Rc cycle
    let root = env.downgrade();
    install(
        &env,
        BuiltinOp {
            id: "eval",
            arity: Arity::Exact(1),
            func: Rc::new(move |args: Vec<Value>| {
                let root = root.upgrade().ok_or_else(|| {
                    Error::EvalError("eval: global environment no longer exists".to_owned())
                })?;
                match args.as_slice() {
                    [ast] => eval(ast, &root),
                    _ => Err(Error::arity_error(Arity::Exact(1), args.len())),
                }
            }),
        },
    );

    #[cfg(feature = "io")]
    crate::io::install(&env);
    #[cfg(feature = "json")]
    crate::json::install(&env);

    load_prelude(&env, PRELUDE);
    #[cfg(feature = "io")]
    load_prelude(&env, crate::io::PRELUDE);

    tracing::debug!(
        bindings = env.get_all_bindings().len(),
        "global environment ready"
    );
    env
}
