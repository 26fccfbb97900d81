//! Printer: projects values back into source-like text.
//!
//! In readable mode strings are quoted and escaped so that the output can be read back by
//! [`crate::reader`]; in raw mode strings are emitted verbatim (this is what `str` and
//! `println` use). Printing never performs I/O.

use std::fmt::Write;

use crate::ast::{NumberType, Value};

/// Render `value` as text. `print_readably` selects escaped, re-readable strings.
pub fn print_string(value: &Value, print_readably: bool) -> String {
    let mut out = String::new();
    write_value(&mut out, value, print_readably);
    out
}

/// Render several values joined by `separator`, as `pr-str`, `str`, `prn` and `println` do
pub fn print_joined<'a, I>(values: I, print_readably: bool, separator: &str) -> String
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut out = String::new();
    for (i, value) in values.into_iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        write_value(&mut out, value, print_readably);
    }
    out
}

/// A unit of pending output
enum Piece<'a> {
    Borrowed(&'a Value),
    /// Values produced while printing (map keys, atom contents)
    Owned(Value),
    Text(&'static str),
}

/// Render `value` with an explicit work stack, so nesting depth is bounded only by memory
fn write_value(out: &mut String, value: &Value, readably: bool) {
    let mut pending = vec![Piece::Borrowed(value)];
    while let Some(piece) = pending.pop() {
        match piece {
            Piece::Text(text) => out.push_str(text),
            Piece::Borrowed(value) => write_node(out, value, readably, &mut pending, Piece::Borrowed),
            Piece::Owned(value) => write_node(out, &value, readably, &mut pending, |child| {
                Piece::Owned(child.clone())
            }),
        }
    }
}

/// Write the leading text of `value` and queue its children, last child first
fn write_node<'v, 'a>(
    out: &mut String,
    value: &'v Value,
    readably: bool,
    pending: &mut Vec<Piece<'a>>,
    child: impl Fn(&'v Value) -> Piece<'a>,
) {
    match value {
        Value::Nil => out.push_str("nil"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(out, *n),
        Value::String(s) if readably => write_escaped(out, s),
        Value::String(s) => out.push_str(s),
        Value::Symbol(s) | Value::Keyword(s) => out.push_str(s),
        Value::List(items, _) => {
            out.push('(');
            push_sequence(pending, items, ")", child);
        }
        Value::Vector(items, _) => {
            out.push('[');
            push_sequence(pending, items, "]", child);
        }
        Value::Map(map, _) => {
            out.push('{');
            pending.push(Piece::Text("}"));
            for (i, (key, item)) in map.iter().enumerate().rev() {
                pending.push(child(item));
                pending.push(Piece::Text(" "));
                pending.push(Piece::Owned(key.to_value()));
                if i > 0 {
                    pending.push(Piece::Text(" "));
                }
            }
        }
        Value::BuiltinFunction { .. } | Value::Function { .. } => out.push_str("#<fn>"),
        Value::Atom(cell) => {
            out.push_str("(atom ");
            pending.push(Piece::Text(")"));
            pending.push(Piece::Owned(cell.borrow().clone()));
        }
        Value::Error(e) => pending.push(child(&e.payload)),
    }
}

fn push_sequence<'v, 'a>(
    pending: &mut Vec<Piece<'a>>,
    items: &'v [Value],
    close: &'static str,
    child: impl Fn(&'v Value) -> Piece<'a>,
) {
    pending.push(Piece::Text(close));
    for (i, item) in items.iter().enumerate().rev() {
        pending.push(child(item));
        if i > 0 {
            pending.push(Piece::Text(" "));
        }
    }
}

/// Integral values print without a fractional part, matching the reader's number syntax.
fn write_number(out: &mut String, n: NumberType) {
    if n.is_nan() {
        out.push_str("NaN");
    } else if n.is_infinite() {
        out.push_str(if n > 0.0 { "Infinity" } else { "-Infinity" });
    } else if n == 0.0 {
        // -0 prints as 0
        out.push('0');
    } else {
        let _ = write!(out, "{n}");
    }
}

fn write_escaped(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
}
