//! This module defines the core AST types and helper functions for representing values in
//! the interpreter. The main enum, [`Value`], is a closed sum type covering every runtime
//! value: scalars, keywords and symbols, the three collection shapes, native and user
//! functions, atoms and error values. Map keys are restricted to [`MapKey`], the canonical
//! form of keywords, strings and symbols.
//!
//! Ergonomic helpers such as [`val`], [`sym`], [`list`] and [`nil`] are provided for building
//! values in code and tests. Equality is structural and treats lists and vectors as
//! interchangeable; atoms and functions compare by identity.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::Error;
use crate::evaluator::Environment;
use crate::evaluator::intooperation::OperationFn;
use crate::printer::print_string;

/// Type alias for number values in interpreter
pub type NumberType = f64;

/// Optional metadata attached to collections and functions by `with-meta`
pub type Meta = Option<Rc<Value>>;

/// Ordered map payload of [`Value::Map`]
pub type MapType = IndexMap<MapKey, Value>;

/// Canonical map key. Keys from different namespaces never collide:
/// `:a`, `"a"` and `a` are three distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    /// Keyword, stored with its leading `:`
    Keyword(String),
    String(String),
    Symbol(String),
}

impl MapKey {
    /// Convert back into the value the key was derived from
    pub fn to_value(&self) -> Value {
        match self {
            MapKey::Keyword(k) => Value::Keyword(k.clone()),
            MapKey::String(s) => Value::String(s.clone()),
            MapKey::Symbol(s) => Value::Symbol(s.clone()),
        }
    }

    /// The key's name without any namespace marker
    pub fn name(&self) -> &str {
        match self {
            MapKey::Keyword(k) => k.strip_prefix(':').unwrap_or(k),
            MapKey::String(s) | MapKey::Symbol(s) => s,
        }
    }
}

impl TryFrom<&Value> for MapKey {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self, Error> {
        match value {
            Value::Keyword(k) => Ok(MapKey::Keyword(k.clone())),
            Value::String(s) => Ok(MapKey::String(s.clone())),
            Value::Symbol(s) => Ok(MapKey::Symbol(s.clone())),
            _ => Err(Error::TypeError("Invalid dictionary key".into())),
        }
    }
}

/// A user-defined function: parameter symbols, optional `&` rest parameter, body and the
/// environment captured at `fn*` time.
pub struct Closure {
    pub params: Vec<String>,
    pub rest: Option<String>,
    pub body: Value,
    pub env: Environment,
}

/// Payload of [`Value::Error`]
#[derive(Debug, Clone)]
pub struct ErrorValue {
    pub payload: Value,
    /// Kind of failure: `TypeError`, `ArityError`, `HostError`, or `Error` for `throw`
    pub name: String,
}

/// Core AST type in interpreter
///
/// To build an AST, use the ergonomic helper functions:
/// - `val(42)` for values, `sym("name")` for symbols, `nil()` for nil
/// - `list([sym("+"), val(1), val(2)])` for call forms
/// - `vector([1, 2, 3])` for vectors
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(NumberType),
    String(String),
    Symbol(String),
    /// Keywords keep their leading `:`
    Keyword(String),
    List(Rc<Vec<Value>>, Meta),
    Vector(Rc<Vec<Value>>, Meta),
    Map(Rc<MapType>, Meta),
    /// Native functions. Compared by identity of the underlying closure.
    BuiltinFunction {
        id: String,
        func: Rc<OperationFn>,
        meta: Meta,
    },
    /// User-defined functions and macros
    Function {
        closure: Rc<Closure>,
        is_macro: bool,
        meta: Meta,
    },
    /// The single mutable reference cell
    Atom(Rc<RefCell<Value>>),
    /// A recoverable failure value, as bound by `catch*`
    Error(Rc<ErrorValue>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Symbol(s) => write!(f, "Symbol({s})"),
            Value::Keyword(k) => write!(f, "Keyword({k})"),
            Value::List(items, _) => f.debug_tuple("List").field(&items.as_slice()).finish(),
            Value::Vector(items, _) => f.debug_tuple("Vector").field(&items.as_slice()).finish(),
            Value::Map(map, _) => f.debug_map().entries(map.iter()).finish(),
            Value::BuiltinFunction { id, .. } => write!(f, "BuiltinFunction({id})"),
            Value::Function {
                closure, is_macro, ..
            } => write!(
                f,
                "Function(params={:?}, rest={:?}, macro={is_macro}, body={:?})",
                closure.params, closure.rest, closure.body
            ),
            Value::Atom(cell) => write!(f, "Atom({:?})", cell.borrow()),
            Value::Error(e) => write!(f, "Error({}, {:?})", e.name, e.payload),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&print_string(self, true))
    }
}

// From trait implementations for Value - enables .into() conversion
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<NumberType> for Value {
    fn from(n: NumberType) -> Self {
        Value::Number(n)
    }
}

macro_rules! impl_from_integer {
    ($int_type:ty) => {
        impl From<$int_type> for Value {
            fn from(n: $int_type) -> Self {
                Value::Number(n as NumberType)
            }
        }
    };
}

impl_from_integer!(i8);
impl_from_integer!(i16);
impl_from_integer!(i32);
impl_from_integer!(i64);
impl_from_integer!(u8);
impl_from_integer!(u16);
impl_from_integer!(u32);
impl_from_integer!(usize);

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Nil, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(Rc::new(v.into_iter().map(Into::into).collect()), None)
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(arr: [T; N]) -> Self {
        Value::List(Rc::new(arr.into_iter().map(Into::into).collect()), None)
    }
}

impl From<MapType> for Value {
    fn from(map: MapType) -> Self {
        Value::Map(Rc::new(map), None)
    }
}

// Fallible conversions from `Value` back into primitive Rust types.

impl TryFrom<Value> for NumberType {
    type Error = Error;

    fn try_from(value: Value) -> Result<NumberType, Error> {
        if let Value::Number(n) = value {
            Ok(n)
        } else {
            Err(Error::TypeError("Invalid NumberNode".into()))
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<bool, Error> {
        if let Value::Bool(b) = value {
            Ok(b)
        } else {
            Err(Error::TypeError("Invalid BooleanNode".into()))
        }
    }
}

/// Helper function for creating symbols
pub fn sym<S: AsRef<str>>(name: S) -> Value {
    Value::Symbol(name.as_ref().to_owned())
}

/// Helper function for creating keywords; the leading `:` is added when missing
pub fn keyword<S: AsRef<str>>(name: S) -> Value {
    let name = name.as_ref();
    if name.starts_with(':') {
        Value::Keyword(name.to_owned())
    } else {
        Value::Keyword(format!(":{name}"))
    }
}

/// Helper function for creating Values from anything convertible
pub fn val<T: Into<Value>>(value: T) -> Value {
    value.into()
}

/// Helper function for creating nil
pub fn nil() -> Value {
    Value::Nil
}

/// Build a list from values
pub fn list<I: IntoIterator<Item = Value>>(items: I) -> Value {
    Value::List(Rc::new(items.into_iter().collect()), None)
}

/// Build a vector from anything convertible
pub fn vector<T: Into<Value>, I: IntoIterator<Item = T>>(items: I) -> Value {
    Value::Vector(Rc::new(items.into_iter().map(Into::into).collect()), None)
}

impl Value {
    /// Wrap a payload as an error value
    pub fn error(payload: Value, name: impl Into<String>) -> Value {
        Value::Error(Rc::new(ErrorValue {
            payload,
            name: name.into(),
        }))
    }

    pub fn atom(value: Value) -> Value {
        Value::Atom(Rc::new(RefCell::new(value)))
    }

    /// Only `nil` and `false` are falsy
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_macro(&self) -> bool {
        matches!(self, Value::Function { is_macro: true, .. })
    }

    /// Elements of a list or vector
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::List(items, _) | Value::Vector(items, _) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Elements of a list or vector, or a type error naming the shape that was expected
    pub fn expect_sequence(&self) -> Result<&[Value], Error> {
        self.as_sequence()
            .ok_or_else(|| Error::TypeError("Invalid sequential type".into()))
    }

    /// Metadata of a value that can carry it
    pub fn meta(&self) -> Result<Value, Error> {
        match self {
            Value::List(_, meta)
            | Value::Vector(_, meta)
            | Value::Map(_, meta)
            | Value::BuiltinFunction { meta, .. }
            | Value::Function { meta, .. } => {
                Ok(meta.as_deref().cloned().unwrap_or(Value::Nil))
            }
            _ => Err(Error::TypeError("Invalid metadata type".into())),
        }
    }

    /// Copy of this value with `meta` attached. Payloads are shared, not deep-copied.
    pub fn with_meta(&self, meta: Value) -> Result<Value, Error> {
        let meta = Some(Rc::new(meta));
        match self {
            Value::List(items, _) => Ok(Value::List(Rc::clone(items), meta)),
            Value::Vector(items, _) => Ok(Value::Vector(Rc::clone(items), meta)),
            Value::Map(map, _) => Ok(Value::Map(Rc::clone(map), meta)),
            Value::BuiltinFunction { id, func, .. } => Ok(Value::BuiltinFunction {
                id: id.clone(),
                func: Rc::clone(func),
                meta,
            }),
            Value::Function {
                closure, is_macro, ..
            } => Ok(Value::Function {
                closure: Rc::clone(closure),
                is_macro: *is_macro,
                meta,
            }),
            _ => Err(Error::TypeError("Invalid metadata type".into())),
        }
    }

    /// Short name of the variant, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Keyword(_) => "keyword",
            Value::List(..) => "list",
            Value::Vector(..) => "vector",
            Value::Map(..) => "map",
            Value::BuiltinFunction { .. } | Value::Function { .. } => "function",
            Value::Atom(_) => "atom",
            Value::Error(_) => "error",
        }
    }
}

impl PartialEq for Value {
    /// Structural equality, walked with an explicit stack so that arbitrarily deep values
    /// compare without exhausting the host stack.
    fn eq(&self, other: &Self) -> bool {
        let mut pending = vec![(self, other)];
        while let Some((a, b)) = pending.pop() {
            if !shallow_eq(a, b, &mut pending) {
                return false;
            }
        }
        true
    }
}

/// Compare the top level of `a` and `b`, queueing element pairs still to be compared
fn shallow_eq<'a>(a: &'a Value, b: &'a Value, pending: &mut Vec<(&'a Value, &'a Value)>) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Symbol(a), Value::Symbol(b)) => a == b,
        (Value::Keyword(a), Value::Keyword(b)) => a == b,
        (
            Value::List(a, _) | Value::Vector(a, _),
            Value::List(b, _) | Value::Vector(b, _),
        ) => {
            if a.len() != b.len() {
                return false;
            }
            pending.extend(a.iter().zip(b.iter()));
            true
        }
        (Value::Map(a, _), Value::Map(b, _)) => {
            if a.len() != b.len() {
                return false;
            }
            for (key, value) in a.iter() {
                match b.get(key) {
                    Some(other) => pending.push((value, other)),
                    None => return false,
                }
            }
            true
        }
        (Value::BuiltinFunction { func: f1, .. }, Value::BuiltinFunction { func: f2, .. }) => {
            Rc::ptr_eq(f1, f2)
        }
        (Value::Function { closure: c1, .. }, Value::Function { closure: c2, .. }) => {
            Rc::ptr_eq(c1, c2)
        }
        (Value::Atom(a), Value::Atom(b)) => Rc::ptr_eq(a, b),
        (Value::Error(a), Value::Error(b)) => {
            pending.push((&a.payload, &b.payload));
            true
        }
        _ => false,
    }
}

impl Drop for Value {
    // Children this value owns outright are moved onto a work list and released one
    // level at a time, so dropping a deeply nested value uses constant stack.
    fn drop(&mut self) {
        let mut pending = Vec::new();
        detach_children(self, &mut pending);
        while let Some(mut value) = pending.pop() {
            detach_children(&mut value, &mut pending);
        }
    }
}

/// Move out the children of `value` that no other handle shares
fn detach_children(value: &mut Value, out: &mut Vec<Value>) {
    match value {
        Value::List(items, meta) | Value::Vector(items, meta) => {
            if let Some(items) = Rc::get_mut(items) {
                out.append(items);
            }
            detach_meta(meta, out);
        }
        Value::Map(map, meta) => {
            if let Some(map) = Rc::get_mut(map) {
                out.extend(map.drain(..).map(|(_, item)| item));
            }
            detach_meta(meta, out);
        }
        Value::Atom(cell) => {
            if let Some(cell) = Rc::get_mut(cell) {
                out.push(std::mem::replace(cell.get_mut(), Value::Nil));
            }
        }
        Value::Error(error) => {
            if let Some(error) = Rc::get_mut(error) {
                out.push(std::mem::replace(&mut error.payload, Value::Nil));
            }
        }
        Value::BuiltinFunction { meta, .. } | Value::Function { meta, .. } => {
            detach_meta(meta, out);
        }
        Value::Nil
        | Value::Bool(_)
        | Value::Number(_)
        | Value::String(_)
        | Value::Symbol(_)
        | Value::Keyword(_) => {}
    }
}

fn detach_meta(meta: &mut Meta, out: &mut Vec<Value>) {
    if let Some(meta) = meta.take().and_then(|meta| Rc::try_unwrap(meta).ok()) {
        out.push(meta);
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod helper_function_tests {
    use super::*;

    #[test]
    fn test_helper_functions_data_driven() {
        let test_cases = vec![
            (val(42), Value::Number(42.0)),
            (val(-17), Value::Number(-17.0)),
            (val(2.5), Value::Number(2.5)),
            (val(255u8), Value::Number(255.0)),
            (val(true), Value::Bool(true)),
            (val("hello"), Value::String("hello".to_owned())),
            (val(""), Value::String(String::new())),
            (val(None::<i32>), Value::Nil),
            (val(Some("x")), Value::String("x".to_owned())),
            (sym("foo-bar?"), Value::Symbol("foo-bar?".to_owned())),
            (keyword("a"), Value::Keyword(":a".to_owned())),
            (keyword(":a"), Value::Keyword(":a".to_owned())),
            (nil(), Value::Nil),
            (
                val([1, 2, 3]),
                Value::List(
                    Rc::new(vec![
                        Value::Number(1.0),
                        Value::Number(2.0),
                        Value::Number(3.0),
                    ]),
                    None,
                ),
            ),
            (
                list([sym("+"), val(1), val("a")]),
                Value::List(
                    Rc::new(vec![
                        Value::Symbol("+".to_owned()),
                        Value::Number(1.0),
                        Value::String("a".to_owned()),
                    ]),
                    None,
                ),
            ),
        ];

        for (i, (actual, expected)) in test_cases.iter().enumerate() {
            assert_eq!(actual, expected, "Test case {} failed", i + 1);
        }
    }

    #[test]
    fn test_structural_equality() {
        // Lists and vectors are interchangeable
        assert_eq!(val([1, 2]), vector([1, 2]));
        assert_ne!(val([1, 2]), vector([1, 2, 3]));
        // Nested
        assert_eq!(list([val([1]), vector([2])]), vector([vector([1]), val([2])]));
        // Different variants never compare equal
        assert_ne!(val("a"), sym("a"));
        assert_ne!(keyword("a"), val(":a"));
        assert_ne!(nil(), val(false));
        assert_ne!(nil(), list([]));
        // NaN behaves like the host float
        assert_ne!(val(f64::NAN), val(f64::NAN));
    }

    #[test]
    fn test_map_equality_ignores_order() {
        let mut a = MapType::new();
        a.insert(MapKey::Keyword(":x".into()), val(1));
        a.insert(MapKey::String("y".into()), val(2));
        let mut b = MapType::new();
        b.insert(MapKey::String("y".into()), val(2));
        b.insert(MapKey::Keyword(":x".into()), val(1));
        assert_eq!(val(a.clone()), val(b));

        let mut c = MapType::new();
        c.insert(MapKey::Symbol("x".into()), val(1));
        c.insert(MapKey::String("y".into()), val(2));
        assert_ne!(val(a), val(c));
    }

    #[test]
    fn test_identity_equality_for_atoms() {
        let a = Value::atom(val(1));
        let alias = a.clone();
        assert_eq!(a, alias);
        assert_ne!(a, Value::atom(val(1)));
    }

    #[test]
    fn test_map_key_conversion() {
        assert_eq!(
            MapKey::try_from(&keyword("k")).unwrap(),
            MapKey::Keyword(":k".into())
        );
        assert_eq!(MapKey::try_from(&val("s")).unwrap().to_value(), val("s"));
        assert_eq!(MapKey::Keyword(":k".into()).name(), "k");
        let err = MapKey::try_from(&val(1)).unwrap_err();
        assert_eq!(err, Error::TypeError("Invalid dictionary key".into()));
    }

    #[test]
    fn test_metadata() {
        let v = vector([1, 2]);
        assert_eq!(v.meta().unwrap(), nil());
        let tagged = v.with_meta(keyword("tag")).unwrap();
        assert_eq!(tagged.meta().unwrap(), keyword("tag"));
        // Metadata does not take part in equality
        assert_eq!(tagged, v);
        assert!(val(1).meta().is_err());
        assert!(val("s").with_meta(nil()).is_err());
    }

    fn nested(depth: usize, inner: Value) -> Value {
        let mut value = inner;
        for i in 0..depth {
            value = if i % 2 == 0 { list([value]) } else { vector([value]) };
        }
        value
    }

    #[test]
    fn test_deep_values_compare_and_drop() {
        let a = nested(200_000, nil());
        let b = nested(200_000, nil());
        assert_eq!(a, a.clone());
        assert_eq!(a, b);
        assert_ne!(a, nested(200_000, val(1)));
        assert_ne!(a, nested(199_999, nil()));
        drop(a);
        drop(b);

        // Maps, atoms and error values release their children iteratively as well
        let mut value = nil();
        for i in 0..100_000 {
            value = match i % 3 {
                0 => {
                    let mut map = MapType::new();
                    map.insert(MapKey::Keyword(":k".into()), value);
                    val(map)
                }
                1 => Value::atom(value),
                _ => Value::error(value, "Error"),
            };
        }
        drop(value);
    }

    #[test]
    fn test_shared_children_survive_drop() {
        let shared = vector([1, 2]);
        let outer = list([shared.clone(), shared.clone()]);
        drop(outer);
        assert_eq!(shared, vector([1, 2]));

        let tagged = vector([3]).with_meta(shared.clone()).unwrap();
        drop(tagged);
        assert_eq!(shared, vector([1, 2]));
    }

    #[test]
    fn test_error_value_equality_uses_payload() {
        assert_eq!(Value::error(val("x"), "TypeError"), Value::error(val("x"), "Error"));
        assert_ne!(Value::error(val("x"), "Error"), Value::error(val("y"), "Error"));
    }

    #[test]
    fn test_truthiness() {
        for falsy in [nil(), val(false)] {
            assert!(!falsy.is_truthy());
        }
        for truthy in [val(0), val(""), list([]), vector(Vec::<Value>::new()), val(true)] {
            assert!(truthy.is_truthy());
        }
    }

    #[test]
    fn test_try_from_number() {
        let n: NumberType = val(3).try_into().unwrap();
        assert_eq!(n, 3.0);
        let err = NumberType::try_from(val("3")).unwrap_err();
        assert!(matches!(err, Error::TypeError(_)));
    }
}
