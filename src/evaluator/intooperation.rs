use crate::Error;
use crate::ast::{NumberType, Value};
use crate::builtinops::Arity;
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::rc::Rc;

// NOTE: This module is internal plumbing for the native library.
// It turns strongly-typed Rust functions into the erased `OperationFn`
// stored in `Value::BuiltinFunction`. Registration goes through
// `Environment::register_*` and the tables in `builtinops.rs`.

/// Canonical erased native function type.
///
/// Natives receive ownership of their argument vector, so implementations
/// can consume or rearrange arguments without cloning.
pub type OperationFn = dyn Fn(Vec<Value>) -> Result<Value, Error>;

// =====================================================================
// Fixed-parameter conversion
// =====================================================================

/// Turns one argument `Value` into a strongly-typed parameter.
///
/// `Param<'a>` is the type seen by the native for a given lifetime of the
/// argument slots, which lets `&str` and the iterators borrow in place.
pub trait FromParam {
    type Param<'a>;

    fn from_arg<'a>(value: &'a mut Value) -> Result<Self::Param<'a>, Error>;
}

impl FromParam for Value {
    type Param<'a> = Value;

    fn from_arg<'a>(value: &'a mut Value) -> Result<Self::Param<'a>, Error> {
        Ok(std::mem::replace(value, Value::Nil))
    }
}

macro_rules! impl_from_param_by_value {
    ($ty:ty) => {
        impl FromParam for $ty {
            type Param<'a> = $ty;

            fn from_arg<'a>(value: &'a mut Value) -> Result<Self::Param<'a>, Error> {
                <$ty>::try_from(std::mem::replace(value, Value::Nil))
            }
        }
    };
}

impl_from_param_by_value!(NumberType);
impl_from_param_by_value!(bool);

impl FromParam for &str {
    type Param<'a> = &'a str;

    fn from_arg<'a>(value: &'a mut Value) -> Result<Self::Param<'a>, Error> {
        if let Value::String(s) = value {
            Ok(s.as_str())
        } else {
            Err(Error::TypeError("Invalid StringNode".into()))
        }
    }
}

impl<'b, K> FromParam for TypedValueIter<'b, K>
where
    K: ValueElementKind,
{
    type Param<'a> = TypedValueIter<'a, K>;

    fn from_arg<'a>(value: &'a mut Value) -> Result<Self::Param<'a>, Error> {
        TypedValueIter::<K>::new(value.expect_sequence()?)
    }
}

// =====================================================================
// Typed iterators over argument slices and sequence arguments
// =====================================================================

/// Describes how to view a `Value` slice as typed elements. The slice is
/// validated once up front, then each element is projected.
#[doc(hidden)]
pub trait ValueElementKind {
    type Item<'a>;

    fn precheck(slice: &[Value]) -> Result<(), Error>;
    fn project<'a>(v: &'a Value) -> Self::Item<'a>;
}

#[doc(hidden)]
pub struct TypedValueIter<'a, K: ValueElementKind> {
    inner: std::slice::Iter<'a, Value>,
    _marker: PhantomData<K>,
}

impl<'a, K> TypedValueIter<'a, K>
where
    K: ValueElementKind,
{
    pub(crate) fn new(values: &'a [Value]) -> Result<Self, Error> {
        K::precheck(values)?;
        Ok(TypedValueIter {
            inner: values.iter(),
            _marker: PhantomData,
        })
    }

    /// The not-yet-consumed elements as raw values
    pub fn as_slice(&self) -> &'a [Value] {
        self.inner.as_slice()
    }
}

impl<'a, K> Iterator for TypedValueIter<'a, K>
where
    K: ValueElementKind,
{
    type Item = K::Item<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(K::project)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K> DoubleEndedIterator for TypedValueIter<'_, K>
where
    K: ValueElementKind,
{
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(K::project)
    }
}

impl<K> ExactSizeIterator for TypedValueIter<'_, K> where K: ValueElementKind {}
impl<K> FusedIterator for TypedValueIter<'_, K> where K: ValueElementKind {}

#[doc(hidden)]
pub struct ValueKind;

impl ValueElementKind for ValueKind {
    type Item<'a> = &'a Value;

    fn precheck(_slice: &[Value]) -> Result<(), Error> {
        Ok(())
    }

    fn project<'a>(v: &'a Value) -> Self::Item<'a> {
        v
    }
}

#[doc(hidden)]
pub struct NumberKind;

impl ValueElementKind for NumberKind {
    type Item<'a> = NumberType;

    fn precheck(slice: &[Value]) -> Result<(), Error> {
        match slice.iter().find(|v| !matches!(v, Value::Number(_))) {
            Some(other) => Err(Error::TypeError(format!(
                "Invalid NumberNode: expected number, got {}",
                other.type_name()
            ))),
            None => Ok(()),
        }
    }

    fn project<'a>(v: &'a Value) -> Self::Item<'a> {
        match v {
            Value::Number(n) => *n,
            _ => unreachable!("NumberKind::project saw non-number after precheck"),
        }
    }
}

#[doc(hidden)]
pub struct StringKind;

impl ValueElementKind for StringKind {
    type Item<'a> = &'a str;

    fn precheck(slice: &[Value]) -> Result<(), Error> {
        match slice.iter().find(|v| !matches!(v, Value::String(_))) {
            Some(other) => Err(Error::TypeError(format!(
                "Invalid StringNode: expected string, got {}",
                other.type_name()
            ))),
            None => Ok(()),
        }
    }

    fn project<'a>(v: &'a Value) -> Self::Item<'a> {
        match v {
            Value::String(s) => s.as_str(),
            _ => unreachable!("StringKind::project saw non-string after precheck"),
        }
    }
}

/// Borrowed iterator over raw values
pub type ValueIter<'a> = TypedValueIter<'a, ValueKind>;

/// Borrowed iterator over numbers; non-numbers are rejected before the native runs
pub type NumIter<'a> = TypedValueIter<'a, NumberKind>;

/// Borrowed iterator over strings; non-strings are rejected before the native runs
pub type StringIter<'a> = TypedValueIter<'a, StringKind>;

// =====================================================================
// Rest-parameter support for variadic operations
// =====================================================================

/// Builds the rest parameter from the tail of the argument slice.
pub trait FromRest {
    type Param<'a>;

    fn from_rest<'a>(slice: &'a [Value]) -> Result<Self::Param<'a>, Error>;
}

impl<K> FromRest for TypedValueIter<'static, K>
where
    K: ValueElementKind,
{
    type Param<'a> = TypedValueIter<'a, K>;

    fn from_rest<'a>(slice: &'a [Value]) -> Result<Self::Param<'a>, Error> {
        TypedValueIter::<K>::new(slice)
    }
}

// =====================================================================
// Return-type adaptation
// =====================================================================

/// Normalizes native return types to `Result<Value, Error>`.
pub trait IntoValueResult {
    fn into_value_result(self) -> Result<Value, Error>;
}

impl<T> IntoValueResult for Result<T, Error>
where
    T: Into<Value>,
{
    fn into_value_result(self) -> Result<Value, Error> {
        self.map(Into::into)
    }
}

impl<T> IntoValueResult for T
where
    T: Into<Value>,
{
    fn into_value_result(self) -> Result<Value, Error> {
        Ok(self.into())
    }
}

/// Converts a fixed-arity typed function into the erased [`OperationFn`],
/// parameterized by its argument tuple type.
pub trait IntoOperation<Args> {
    fn into_operation(self) -> Rc<OperationFn>;
}

/// Converts a function whose last parameter is a rest iterator into the
/// erased [`OperationFn`]. Total arity is validated by the caller.
pub trait IntoVariadicOperation<Args> {
    fn into_variadic_operation(self) -> Rc<OperationFn>;
}

// =====================================================================
// Variadic adapters
// =====================================================================

impl<F, I, R> IntoVariadicOperation<(I,)> for F
where
    I: FromRest,
    F: for<'a> Fn(<I as FromRest>::Param<'a>) -> R + 'static,
    R: IntoValueResult,
{
    fn into_variadic_operation(self) -> Rc<OperationFn> {
        Rc::new(move |args: Vec<Value>| {
            let rest_param = <I as FromRest>::from_rest(&args[..])?;
            (self)(rest_param).into_value_result()
        })
    }
}

macro_rules! impl_into_variadic_operation_for_prefix_and_rest {
    ($prefix:expr, $( $v:ident, $p:ident : $A:ident ),+ ) => {
        impl<F, I, R, $( $A ),+> IntoVariadicOperation<( $( $A, )+ I, )> for F
        where
            I: FromRest,
            $( $A: FromParam, )+
            F: for<'a> Fn(
                    $( <$A as FromParam>::Param<'a> ),+,
                    <I as FromRest>::Param<'a>,
                ) -> R
                + 'static,
            R: IntoValueResult,
        {
            fn into_variadic_operation(self) -> Rc<OperationFn> {
                Rc::new(move |mut args: Vec<Value>| {
                    let len = args.len();
                    match args.as_mut_slice() {
                        &mut [ $( ref mut $v ),+, ref mut rest @ .. ] => {
                            $(
                                let $p: <$A as FromParam>::Param<'_> =
                                    <$A as FromParam>::from_arg($v)?;
                            )+
                            let rest_param: <I as FromRest>::Param<'_> =
                                <I as FromRest>::from_rest(&*rest)?;
                            (self)( $( $p ),+, rest_param ).into_value_result()
                        }
                        _ => Err(Error::arity_error(Arity::AtLeast($prefix), len)),
                    }
                })
            }
        }
    };
}

impl_into_variadic_operation_for_prefix_and_rest!(1, v0, p0: A1);
impl_into_variadic_operation_for_prefix_and_rest!(2, v0, p0: A1, v1, p1: A2);
impl_into_variadic_operation_for_prefix_and_rest!(3, v0, p0: A1, v1, p1: A2, v2, p2: A3);

// =====================================================================
// Fixed-arity adapters
// =====================================================================

/// Implements `IntoOperation` for one arity: checks the argument count,
/// then converts each slot with `FromParam` before calling the native.
macro_rules! impl_into_operation_for_arity {
    ($arity:expr, $( $v:ident, $p:ident : $A:ident ),+ ) => {
        impl<F, R, $( $A ),+> IntoOperation<( $( $A, )+ )> for F
        where
            F: for<'a> Fn( $( <$A as FromParam>::Param<'a> ),+ ) -> R + 'static,
            $( $A: FromParam, )+
            R: IntoValueResult,
        {
            fn into_operation(self) -> Rc<OperationFn> {
                Rc::new(move |mut args: Vec<Value>| {
                    let len = args.len();
                    match args.as_mut_slice() {
                        &mut [ $( ref mut $v ),+ ] => {
                            $(
                                let $p: <$A as FromParam>::Param<'_> =
                                    <$A as FromParam>::from_arg($v)?;
                            )+
                            (self)( $( $p ),+ ).into_value_result()
                        }
                        _ => Err(Error::arity_error(Arity::Exact($arity), len)),
                    }
                })
            }
        }
    };
}

impl<F, R> IntoOperation<()> for F
where
    F: Fn() -> R + 'static,
    R: IntoValueResult,
{
    fn into_operation(self) -> Rc<OperationFn> {
        Rc::new(move |args: Vec<Value>| {
            if !args.is_empty() {
                return Err(Error::arity_error(Arity::Exact(0), args.len()));
            }
            (self)().into_value_result()
        })
    }
}

impl_into_operation_for_arity!(1, v0, p0: A1);
impl_into_operation_for_arity!(2, v0, p0: A1, v1, p1: A2);
impl_into_operation_for_arity!(3, v0, p0: A1, v1, p1: A2, v2, p2: A3);

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::{sym, val, vector};

    fn call(op: &Rc<OperationFn>, args: Vec<Value>) -> Result<Value, Error> {
        op(args)
    }

    #[test]
    fn test_fixed_arity_adapter() {
        fn sub(a: f64, b: f64) -> f64 {
            a - b
        }
        let op = <_ as IntoOperation<(f64, f64)>>::into_operation(sub);
        assert_eq!(call(&op, vec![val(5), val(3)]).unwrap(), val(2));
        assert_eq!(
            call(&op, vec![val(5)]).unwrap_err(),
            Error::arity_error(Arity::Exact(2), 1)
        );
        assert!(matches!(
            call(&op, vec![val(5), val("x")]).unwrap_err(),
            Error::TypeError(_)
        ));
    }

    #[test]
    fn test_str_and_value_params() {
        fn describe(name: &str, v: Value) -> String {
            format!("{name}={v}")
        }
        let op = <_ as IntoOperation<(&'static str, Value)>>::into_operation(describe);
        assert_eq!(
            call(&op, vec![val("x"), sym("y")]).unwrap(),
            val("x=y")
        );
        assert!(call(&op, vec![val(1), sym("y")]).is_err());
    }

    #[test]
    fn test_zero_arity_adapter() {
        fn answer() -> f64 {
            42.0
        }
        let op = <_ as IntoOperation<()>>::into_operation(answer);
        assert_eq!(call(&op, vec![]).unwrap(), val(42));
        assert!(call(&op, vec![val(1)]).is_err());
    }

    #[test]
    fn test_sequence_parameter_accepts_list_and_vector() {
        fn total(nums: NumIter<'_>) -> f64 {
            nums.sum()
        }
        let op = <_ as IntoOperation<(NumIter<'static>,)>>::into_operation(total);
        assert_eq!(call(&op, vec![val([1, 2, 3])]).unwrap(), val(6));
        assert_eq!(call(&op, vec![vector([4, 5])]).unwrap(), val(9));
        let err = call(&op, vec![val(1)]).unwrap_err();
        assert_eq!(err, Error::TypeError("Invalid sequential type".into()));
    }

    #[test]
    fn test_variadic_adapters() {
        fn join_all(sep: &str, parts: StringIter<'_>) -> String {
            parts.collect::<Vec<_>>().join(sep)
        }
        let op =
            <_ as IntoVariadicOperation<(&'static str, StringIter<'static>)>>::into_variadic_operation(
                join_all,
            );
        assert_eq!(
            call(&op, vec![val("-"), val("a"), val("b")]).unwrap(),
            val("a-b")
        );
        assert_eq!(
            call(&op, vec![]).unwrap_err(),
            Error::arity_error(Arity::AtLeast(1), 0)
        );
        assert!(matches!(
            call(&op, vec![val("-"), val(1)]).unwrap_err(),
            Error::TypeError(_)
        ));

        fn count_all(values: ValueIter<'_>) -> usize {
            values.len()
        }
        let op = <_ as IntoVariadicOperation<(ValueIter<'static>,)>>::into_variadic_operation(
            count_all,
        );
        assert_eq!(call(&op, vec![val(1), val("a")]).unwrap(), val(2));
    }

    #[test]
    fn test_result_returning_native() {
        fn checked(n: f64) -> Result<f64, Error> {
            if n < 0.0 {
                Err(Error::EvalError("negative".into()))
            } else {
                Ok(n.sqrt())
            }
        }
        let op = <_ as IntoOperation<(f64,)>>::into_operation(checked);
        assert_eq!(call(&op, vec![val(9)]).unwrap(), val(3));
        assert_eq!(
            call(&op, vec![val(-1)]).unwrap_err(),
            Error::EvalError("negative".into())
        );
    }
}
