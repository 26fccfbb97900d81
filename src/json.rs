//! JSON interop: conversion between `serde_json::Value` and interpreter values, and the
//! `json-parse` / `json-stringify` natives.
//!
//! Both natives are registered as host functions, so malformed input or an unencodable
//! value comes back to the program as an error value instead of unwinding evaluation.

use std::rc::Rc;

use crate::Error;
use crate::ast::{MapKey, MapType, Value};
use crate::builtinops::Arity;
use crate::evaluator::Environment;

/// Largest magnitude below which every integer is exactly representable in an f64
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Deepest nesting encoded, matching the limit `serde_json` applies when parsing
const MAX_JSON_DEPTH: usize = 128;

/// Objects become maps with string keys, arrays become vectors, `null` becomes `nil`
pub fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::Vector(
            Rc::new(items.into_iter().map(json_to_value).collect()),
            None,
        ),
        serde_json::Value::Object(fields) => {
            let map: MapType = fields
                .into_iter()
                .map(|(key, value)| (MapKey::String(key), json_to_value(value)))
                .collect();
            Value::from(map)
        }
    }
}

/// Encode a value as JSON. Map keys and keywords use their name; functions, atoms, error
/// values and non-finite numbers have no JSON form.
pub fn value_to_json(value: &Value) -> Result<serde_json::Value, Error> {
    encode(value, 0)
}

fn encode(value: &Value, depth: usize) -> Result<serde_json::Value, Error> {
    if depth >= MAX_JSON_DEPTH {
        return Err(Error::EvalError(format!(
            "cannot encode JSON nested deeper than {MAX_JSON_DEPTH}"
        )));
    }
    match value {
        Value::Nil => Ok(serde_json::Value::Null),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Number(n) => number_to_json(*n).map(serde_json::Value::Number),
        Value::String(s) | Value::Symbol(s) => Ok(serde_json::Value::String(s.clone())),
        Value::Keyword(k) => Ok(serde_json::Value::String(
            k.strip_prefix(':').unwrap_or(k).to_owned(),
        )),
        Value::List(items, _) | Value::Vector(items, _) => items
            .iter()
            .map(|item| encode(item, depth + 1))
            .collect::<Result<Vec<_>, _>>()
            .map(serde_json::Value::Array),
        Value::Map(map, _) => {
            let mut fields = serde_json::Map::with_capacity(map.len());
            for (key, item) in map.iter() {
                fields.insert(key.name().to_owned(), encode(item, depth + 1)?);
            }
            Ok(serde_json::Value::Object(fields))
        }
        other => Err(Error::TypeError(format!(
            "cannot encode {} as JSON",
            other.type_name()
        ))),
    }
}

fn number_to_json(n: f64) -> Result<serde_json::Number, Error> {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        // Integral values encode without a fractional part
        return Ok(serde_json::Number::from(n as i64));
    }
    serde_json::Number::from_f64(n)
        .ok_or_else(|| Error::TypeError(format!("cannot encode {n} as JSON")))
}

/// Parse JSON text into a value
pub fn parse_json(input: &str) -> Result<Value, Error> {
    let json: serde_json::Value = serde_json::from_str(input)
        .map_err(|e| Error::EvalError(format!("Invalid JSON: {e}")))?;
    Ok(json_to_value(json))
}

/// Compact JSON text for a value
pub fn to_json_string(value: &Value) -> Result<String, Error> {
    let json = value_to_json(value)?;
    serde_json::to_string(&json).map_err(|e| Error::EvalError(format!("JSON encoding failed: {e}")))
}

fn json_parse(args: &[Value]) -> Result<Value, Error> {
    match args {
        [Value::String(text)] => parse_json(text),
        [other] => Err(Error::TypeError(format!(
            "json-parse expects a string, got {}",
            other.type_name()
        ))),
        _ => Err(Error::arity_error(Arity::Exact(1), args.len())),
    }
}

fn json_stringify(args: &[Value]) -> Result<Value, Error> {
    match args {
        [value] => to_json_string(value).map(Value::String),
        _ => Err(Error::arity_error(Arity::Exact(1), args.len())),
    }
}

pub(crate) fn install(env: &Environment) {
    env.register_host_function("json-parse", json_parse);
    env.register_host_function("json-stringify", json_stringify);
}
