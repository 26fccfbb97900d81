//! Reader: tokenizer and recursive-descent parser.
//!
//! Tokenization is done with `nom` combinators and produces a flat token list terminated
//! by an empty sentinel token. The parser walks that list with a [`Reader`] cursor and
//! builds [`Value`] trees. Reader macros (`'`, `` ` ``, `~`, `~@`, `@`, `^`) expand into
//! ordinary list forms at read time.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{is_not, tag, take_while, take_while1},
    character::complete::{anychar, char, digit1, one_of},
    combinator::{all_consuming, opt, recognize},
    multi::many0_count,
    sequence::pair,
};

use crate::ast::{MapKey, MapType, Value, list, sym};
use crate::{MAX_READ_DEPTH, ReadError, ReadErrorKind};
use std::rc::Rc;

/// Characters that are tokens on their own
const SPECIAL_CHARS: &str = "[]{}()'`~^@";

/// A token and its byte offset in the source text
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token<'a> {
    pub text: &'a str,
    pub offset: usize,
}

impl Token<'_> {
    fn is_sentinel(&self) -> bool {
        self.text.is_empty()
    }
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || c == ','
}

/// Characters allowed in symbols, numbers and keywords
fn is_atom_char(c: char) -> bool {
    !is_separator(c) && !"[]{}()'\"`;".contains(c)
}

/// Whitespace, commas and `;` line comments
fn separators(input: &str) -> IResult<&str, usize> {
    many0_count(alt((
        take_while1(is_separator),
        recognize(pair(char(';'), take_while(|c: char| c != '\n'))),
    )))
    .parse(input)
}

/// Body of a string literal: escape pairs or runs of ordinary characters
fn string_body(input: &str) -> IResult<&str, usize> {
    many0_count(alt((recognize(pair(char('\\'), anychar)), is_not("\\\"")))).parse(input)
}

/// A string literal token; the closing quote is optional so that unterminated strings
/// still tokenize and can be reported by the parser.
fn string_literal(input: &str) -> IResult<&str, &str> {
    recognize((char('"'), string_body, opt(char('"')))).parse(input)
}

fn token(input: &str) -> IResult<&str, &str> {
    alt((
        tag("~@"),
        recognize(one_of(SPECIAL_CHARS)),
        string_literal,
        take_while1(is_atom_char),
    ))
    .parse(input)
}

fn nom_error(input: &str, error: nom::Err<nom::error::Error<&str>>) -> ReadError {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let offset = input.len().saturating_sub(e.input.len());
            ReadError::with_context(
                ReadErrorKind::InvalidSyntax,
                format!("Invalid token at position {offset}"),
                input,
                offset,
                e.input.chars().next().map(String::from),
            )
        }
        nom::Err::Incomplete(_) => ReadError::new(ReadErrorKind::Incomplete, "Incomplete input"),
    }
}

/// Split `input` into tokens. The result always ends with an empty sentinel token.
pub fn tokenize(input: &str) -> Result<Vec<Token<'_>>, ReadError> {
    let mut tokens = Vec::new();
    let mut rest = input;
    loop {
        let (after_separators, _) = separators(rest).map_err(|e| nom_error(input, e))?;
        if after_separators.is_empty() {
            break;
        }
        let (after_token, text) = token(after_separators).map_err(|e| nom_error(input, e))?;
        tokens.push(Token {
            text,
            offset: input.len() - after_separators.len(),
        });
        rest = after_token;
    }
    tokens.push(Token {
        text: "",
        offset: input.len(),
    });
    Ok(tokens)
}

/// Position-tracked cursor over a token list
pub struct Reader<'a> {
    input: &'a str,
    tokens: Vec<Token<'a>>,
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a str) -> Result<Self, ReadError> {
        Ok(Reader {
            input,
            tokens: tokenize(input)?,
            position: 0,
        })
    }

    /// Current token without advancing; `None` past the end
    pub fn peek(&self) -> Option<Token<'a>> {
        self.tokens.get(self.position).copied()
    }

    /// Current token, advancing the cursor; `None` past the end
    pub fn next_token(&mut self) -> Option<Token<'a>> {
        let token = self.peek()?;
        self.position += 1;
        Some(token)
    }

    /// True when only the sentinel (or nothing) remains
    pub fn at_end(&self) -> bool {
        self.peek().is_none_or(|t| t.is_sentinel())
    }

    fn error(&self, kind: ReadErrorKind, message: impl Into<String>, at: Option<Token<'a>>) -> ReadError {
        let offset = at.map_or(self.input.len(), |t| t.offset);
        let found = at
            .filter(|t| !t.is_sentinel())
            .map(|t| t.text.to_owned());
        ReadError::with_context(kind, message, self.input, offset, found)
    }
}

/// Read the first form of `input`. Input without any tokens reads as `nil`.
pub fn read_str(input: &str) -> Result<Value, ReadError> {
    let mut reader = Reader::new(input)?;
    if reader.at_end() {
        return Ok(Value::Nil);
    }
    read_form(&mut reader, 0)
}

/// Read every form of `input` in order
pub fn read_all(input: &str) -> Result<Vec<Value>, ReadError> {
    let mut reader = Reader::new(input)?;
    let mut forms = Vec::new();
    while !reader.at_end() {
        forms.push(read_form(&mut reader, 0)?);
    }
    Ok(forms)
}

/// Read one form at the cursor
pub fn read_form(reader: &mut Reader<'_>, depth: usize) -> Result<Value, ReadError> {
    if depth >= MAX_READ_DEPTH {
        return Err(reader.error(
            ReadErrorKind::TooDeeplyNested,
            format!("Expression too deeply nested (max depth: {MAX_READ_DEPTH})"),
            reader.peek(),
        ));
    }

    let token = match reader.peek() {
        Some(token) if !token.is_sentinel() => token,
        at => return Err(reader.error(ReadErrorKind::Incomplete, "unexpected EOF", at)),
    };

    match token.text {
        "'" => read_wrapped(reader, "quote", depth),
        "`" => read_wrapped(reader, "quasiquote", depth),
        "~" => read_wrapped(reader, "unquote", depth),
        "~@" => read_wrapped(reader, "splice-unquote", depth),
        "@" => read_wrapped(reader, "deref", depth),
        "^" => {
            reader.next_token();
            let meta = read_form(reader, depth + 1)?;
            let form = read_form(reader, depth + 1)?;
            Ok(list([sym("with-meta"), form, meta]))
        }
        "(" => {
            let items = read_sequence(reader, ")", depth)?;
            Ok(Value::List(Rc::new(items), None))
        }
        "[" => {
            let items = read_sequence(reader, "]", depth)?;
            Ok(Value::Vector(Rc::new(items), None))
        }
        "{" => {
            let items = read_sequence(reader, "}", depth)?;
            build_map(reader, token, items)
        }
        ")" | "]" | "}" => Err(reader.error(
            ReadErrorKind::UnexpectedDelimiter,
            format!("unexpected '{}'", token.text),
            Some(token),
        )),
        _ => {
            reader.next_token();
            read_atom(reader, token)
        }
    }
}

fn read_wrapped(reader: &mut Reader<'_>, symbol: &str, depth: usize) -> Result<Value, ReadError> {
    reader.next_token();
    let form = read_form(reader, depth + 1)?;
    Ok(list([sym(symbol), form]))
}

/// Read forms after an opening delimiter up to and including `close`
fn read_sequence(reader: &mut Reader<'_>, close: &str, depth: usize) -> Result<Vec<Value>, ReadError> {
    reader.next_token();
    let mut items = Vec::new();
    loop {
        match reader.peek() {
            Some(token) if token.text == close => {
                reader.next_token();
                return Ok(items);
            }
            Some(token) if !token.is_sentinel() => items.push(read_form(reader, depth + 1)?),
            at => {
                return Err(reader.error(
                    ReadErrorKind::Incomplete,
                    format!("expected '{close}', got EOF"),
                    at,
                ));
            }
        }
    }
}

fn build_map(reader: &Reader<'_>, open: Token<'_>, items: Vec<Value>) -> Result<Value, ReadError> {
    if items.len() % 2 != 0 {
        return Err(ReadError::with_context(
            ReadErrorKind::InvalidSyntax,
            "map literal requires an even number of forms",
            reader.input,
            open.offset,
            None,
        ));
    }
    let mut map = MapType::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        let key = MapKey::try_from(&key).map_err(|_| {
            ReadError::with_context(
                ReadErrorKind::InvalidSyntax,
                "Invalid dictionary key",
                reader.input,
                open.offset,
                Some(key.to_string()),
            )
        })?;
        map.insert(key, value);
    }
    Ok(Value::Map(Rc::new(map), None))
}

fn is_number(text: &str) -> bool {
    all_consuming(recognize((
        opt(char::<&str, nom::error::Error<&str>>('-')),
        digit1,
        opt(pair(char('.'), digit1)),
    )))
    .parse(text)
    .is_ok()
}

fn is_complete_string(text: &str) -> bool {
    all_consuming((char('"'), string_body, char('"')))
        .parse(text)
        .is_ok()
}

/// Classify a single token
fn read_atom<'a>(reader: &Reader<'a>, token: Token<'a>) -> Result<Value, ReadError> {
    let text = token.text;
    match text {
        "nil" => Ok(Value::Nil),
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        _ if is_number(text) => text.parse().map(Value::Number).map_err(|_| {
            reader.error(ReadErrorKind::InvalidSyntax, "invalid number", Some(token))
        }),
        _ if text.starts_with('"') => {
            if is_complete_string(text) {
                Ok(Value::String(unescape_string(&text[1..text.len() - 1])))
            } else {
                Err(reader.error(
                    ReadErrorKind::Incomplete,
                    "expected '\"', got EOF",
                    Some(token),
                ))
            }
        }
        _ if text.starts_with(':') => Ok(Value::Keyword(text.to_owned())),
        _ => Ok(Value::Symbol(text.to_owned())),
    }
}

/// Single left-to-right pass: `\n` becomes a newline and any other `\c` becomes `c`.
pub fn unescape_string(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::{keyword, nil, val, vector};
    use crate::printer::print_string;
    use proptest::prelude::*;

    fn texts(input: &str) -> Vec<&str> {
        tokenize(input).unwrap().iter().map(|t| t.text).collect()
    }

    #[test]
    fn test_tokenize_data_driven() {
        let cases: Vec<(&str, Vec<&str>)> = vec![
            ("(+ 1 2)", vec!["(", "+", "1", "2", ")", ""]),
            ("", vec![""]),
            ("   ,,, \n\t", vec![""]),
            ("; just a comment", vec![""]),
            ("1 ; trailing\n2", vec!["1", "2", ""]),
            ("~@x", vec!["~@", "x", ""]),
            ("'`~^@", vec!["'", "`", "~", "^", "@", ""]),
            ("[a,b]{:k v}", vec!["[", "a", "b", "]", "{", ":k", "v", "}", ""]),
            ("\"a b\" c", vec!["\"a b\"", "c", ""]),
            ("\"a\\\"b\"", vec!["\"a\\\"b\"", ""]),
            ("\"unterminated", vec!["\"unterminated", ""]),
            ("abc\"def\"", vec!["abc", "\"def\"", ""]),
            ("a@b a~b", vec!["a@b", "a~b", ""]),
            ("-12.5 :kw sym!", vec!["-12.5", ":kw", "sym!", ""]),
        ];
        for (input, expected) in cases {
            assert_eq!(texts(input), expected, "input: {input:?}");
        }
    }

    #[test]
    fn test_token_offsets() {
        let tokens = tokenize("(ab  \"c\")").unwrap();
        let offsets: Vec<usize> = tokens.iter().map(|t| t.offset).collect();
        assert_eq!(offsets, vec![0, 1, 5, 8, 9]);
    }

    #[test]
    fn test_reader_cursor() {
        let mut reader = Reader::new("a b").unwrap();
        assert_eq!(reader.peek().unwrap().text, "a");
        assert_eq!(reader.next_token().unwrap().text, "a");
        assert_eq!(reader.next_token().unwrap().text, "b");
        assert!(reader.at_end());
        assert_eq!(reader.next_token().unwrap().text, "");
        assert_eq!(reader.peek(), None);
        assert_eq!(reader.next_token(), None);
    }

    #[test]
    fn test_read_atoms_data_driven() {
        let cases = vec![
            ("nil", nil()),
            ("true", val(true)),
            ("false", val(false)),
            ("42", val(42)),
            ("-7", val(-7)),
            ("3.25", val(3.25)),
            ("-0.5", val(-0.5)),
            ("\"hi\"", val("hi")),
            ("\"\"", val("")),
            ("\"a\\nb\"", val("a\nb")),
            ("\"q\\\"q\"", val("q\"q")),
            ("\"back\\\\slash\"", val("back\\slash")),
            (":kw", keyword("kw")),
            ("abc", sym("abc")),
            ("-", sym("-")),
            ("-abc", sym("-abc")),
            ("1.", sym("1.")),
            ("1.2.3", sym("1.2.3")),
            ("nil?", sym("nil?")),
        ];
        for (input, expected) in cases {
            assert_eq!(read_str(input).unwrap(), expected, "input: {input:?}");
        }
    }

    #[test]
    fn test_unescape_is_single_pass() {
        // "\\n" is an escaped backslash followed by n, not a newline
        assert_eq!(unescape_string("\\\\n"), "\\n");
        assert_eq!(unescape_string("\\n"), "\n");
        assert_eq!(unescape_string("\\t"), "t");
        assert_eq!(unescape_string("plain"), "plain");
    }

    #[test]
    fn test_read_collections() {
        assert_eq!(
            read_str("(1 [2 3] (4))").unwrap(),
            list([val(1), vector([2, 3]), list([val(4)])])
        );
        assert!(matches!(read_str("[1 2]").unwrap(), Value::Vector(..)));
        assert!(matches!(read_str("(1 2)").unwrap(), Value::List(..)));
        assert_eq!(read_str("()").unwrap(), list([]));

        let map = read_str("{:a 1 \"b\" 2 c 3}").unwrap();
        let Value::Map(map, _) = &map else {
            panic!("expected map");
        };
        let keys: Vec<MapKey> = map.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                MapKey::Keyword(":a".into()),
                MapKey::String("b".into()),
                MapKey::Symbol("c".into()),
            ]
        );
    }

    #[test]
    fn test_reader_macros() {
        let cases = vec![
            ("'x", list([sym("quote"), sym("x")])),
            ("`x", list([sym("quasiquote"), sym("x")])),
            ("~x", list([sym("unquote"), sym("x")])),
            ("~@x", list([sym("splice-unquote"), sym("x")])),
            ("@a", list([sym("deref"), sym("a")])),
            ("^m x", list([sym("with-meta"), sym("x"), sym("m")])),
            (
                "^{:a 1} [1]",
                list([sym("with-meta"), vector([1]), read_str("{:a 1}").unwrap()]),
            ),
            (
                "'(1 ~@xs)",
                list([
                    sym("quote"),
                    list([val(1), list([sym("splice-unquote"), sym("xs")])]),
                ]),
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(read_str(input).unwrap(), expected, "input: {input:?}");
        }
    }

    #[test]
    fn test_read_errors_data_driven() {
        let cases = vec![
            ("(1 2", ReadErrorKind::Incomplete, "expected ')', got EOF"),
            ("[1 2", ReadErrorKind::Incomplete, "expected ']', got EOF"),
            ("{:a 1", ReadErrorKind::Incomplete, "expected '}', got EOF"),
            (")", ReadErrorKind::UnexpectedDelimiter, "unexpected ')'"),
            ("]", ReadErrorKind::UnexpectedDelimiter, "unexpected ']'"),
            ("(1 ]", ReadErrorKind::UnexpectedDelimiter, "unexpected ']'"),
            ("\"abc", ReadErrorKind::Incomplete, "expected '\"', got EOF"),
            ("\"abc\\\"", ReadErrorKind::Incomplete, "expected '\"', got EOF"),
            ("'", ReadErrorKind::Incomplete, "unexpected EOF"),
            ("^m", ReadErrorKind::Incomplete, "unexpected EOF"),
            (
                "{:a}",
                ReadErrorKind::InvalidSyntax,
                "map literal requires an even number of forms",
            ),
            ("{1 2}", ReadErrorKind::InvalidSyntax, "Invalid dictionary key"),
        ];
        for (input, kind, message) in cases {
            let err = read_str(input).unwrap_err();
            assert_eq!(err.kind, kind, "input: {input:?}");
            assert_eq!(err.message, message, "input: {input:?}");
        }
    }

    #[test]
    fn test_read_depth_limit() {
        let deep = "(".repeat(MAX_READ_DEPTH + 1);
        let err = read_str(&deep).unwrap_err();
        assert_eq!(err.kind, ReadErrorKind::TooDeeplyNested);

        let ok = format!("{}{}", "(".repeat(MAX_READ_DEPTH - 1), ")".repeat(MAX_READ_DEPTH - 1));
        assert!(read_str(&ok).is_ok());
    }

    #[test]
    fn test_read_str_and_read_all() {
        assert_eq!(read_str("").unwrap(), nil());
        assert_eq!(read_str("1 2 3").unwrap(), val(1));
        assert_eq!(read_all("1 (2) ; c\n:k").unwrap(), vec![val(1), list([val(2)]), keyword("k")]);
        assert!(read_all("").unwrap().is_empty());
        assert!(read_all("1 (").is_err());
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i32>().prop_map(val),
            (-1.0e6..1.0e6f64).prop_map(val),
            "[a-zA-Z0-9 ;,()\"\\\\\n]{0,12}".prop_map(Value::String),
            "[a-z][a-z0-9*+!?-]{0,8}"
                .prop_filter("reserved words", |s| !matches!(s.as_str(), "nil" | "true" | "false"))
                .prop_map(Value::Symbol),
            "[a-z]{1,6}".prop_map(|s| Value::Keyword(format!(":{s}"))),
            Just(Value::Nil),
            any::<bool>().prop_map(Value::Bool),
        ]
    }

    fn value_tree() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(list),
                prop::collection::vec(inner, 0..6).prop_map(vector),
            ]
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_print_read_round_trip(value in value_tree()) {
            let printed = print_string(&value, true);
            let read_back = read_str(&printed).unwrap();
            prop_assert_eq!(read_back, value);
        }

        #[test]
        fn prop_tokenize_ends_with_sentinel(input in "\\PC{0,40}") {
            let tokens = tokenize(&input).unwrap();
            prop_assert_eq!(tokens.last().map(|t| t.text), Some(""));
            prop_assert!(tokens[..tokens.len() - 1].iter().all(|t| !t.text.is_empty()));
        }
    }
}
