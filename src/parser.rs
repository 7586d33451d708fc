//! Decoding model replies into [`ActionCall`]s.
//!
//! Text-markup replies carry a `<think>` segment and an `<answer>` segment whose
//! body is one pseudo-code call, e.g.
//! `do(action="Swipe", start=[500,800], end=[500,200], thought="scroll down")`.
//! The call is read by a small recursive-descent parser; every malformed input
//! becomes a typed [`ParseError`] carrying the byte offset into the raw reply.
//!
//! Native replies are structured calls and map field by field.

use serde_json::Value;
use tracing::debug;

use crate::error::{ParseError, Segment};
use crate::model::{NativeCall, RawResponse};
use crate::types::{ActionCall, Dialect, ParamValue, Params, Point, normalize_name};

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";
pub const ANSWER_OPEN: &str = "<answer>";
pub const ANSWER_CLOSE: &str = "</answer>";

pub fn parse(raw: &RawResponse, dialect: Dialect) -> Result<ActionCall, ParseError> {
    match (dialect, raw) {
        (Dialect::Native, RawResponse::Call(call)) => parse_native(call),
        (Dialect::Native, RawResponse::Text(_)) => {
            Err(ParseError::MissingSegment(Segment::FunctionCall))
        }
        (Dialect::TextMarkup, RawResponse::Text(text)) => parse_text_markup(text),
        (Dialect::TextMarkup, RawResponse::Call(_)) => Err(ParseError::syntax(
            0,
            "expected a text reply with <think> and <answer>, got a function call",
        )),
    }
}

pub fn parse_native(call: &NativeCall) -> Result<ActionCall, ParseError> {
    let name = normalize_name(&call.name);
    if name.is_empty() {
        return Err(ParseError::syntax(0, "function call has no name"));
    }
    let empty = serde_json::Map::new();
    let arguments = match &call.arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(ParseError::syntax(
                0,
                format!("function arguments must be an object, got {other}"),
            ));
        }
    };

    let mut params = Params::new();
    let mut thought = None;
    for (key, value) in arguments {
        if key == "thought" {
            thought = value.as_str().map(str::to_string);
            continue;
        }
        if let Some(param) = json_to_param(value) {
            params.insert(key.clone(), param);
        }
    }

    let thought = thought
        .filter(|t| !t.trim().is_empty())
        .or_else(|| call.reasoning.clone())
        .unwrap_or_default();

    Ok(ActionCall {
        name,
        params,
        thought: thought.trim().to_string(),
    })
}

fn json_to_param(value: &Value) -> Option<ParamValue> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(ParamValue::Text(s.clone())),
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => ParamValue::Int(i),
            None => ParamValue::Text(n.to_string()),
        }),
        Value::Bool(b) => Some(ParamValue::Text(b.to_string())),
        Value::Array(items) => {
            let converted: Vec<ParamValue> = items.iter().filter_map(json_to_param).collect();
            Some(list_or_point(converted))
        }
        Value::Object(_) => Some(ParamValue::Text(value.to_string())),
    }
}

fn list_or_point(items: Vec<ParamValue>) -> ParamValue {
    match items.as_slice() {
        [ParamValue::Int(x), ParamValue::Int(y)] => ParamValue::Point(Point::new(*x, *y)),
        _ => ParamValue::List(items),
    }
}

/// Byte range of one tagged segment's body inside the raw reply.
#[derive(Debug, Clone, Copy)]
struct SegmentSpan {
    open_at: usize,
    body_start: usize,
    body_end: usize,
    close_end: usize,
}

fn find_segment(
    text: &str,
    open: &str,
    close: &str,
    which: Segment,
    quote_aware: bool,
) -> Result<SegmentSpan, ParseError> {
    let open_at = text.find(open).ok_or(ParseError::MissingSegment(which))?;
    let body_start = open_at + open.len();
    let body = &text[body_start..];
    let body_len = if quote_aware {
        find_unquoted(body, close)
    } else {
        body.find(close)
    }
    .ok_or_else(|| ParseError::syntax(body_start, format!("unterminated {which} segment")))?;
    let body_end = body_start + body_len;

    Ok(SegmentSpan {
        open_at,
        body_start,
        body_end,
        close_end: body_end + close.len(),
    })
}

/// First occurrence of `needle` outside `"..."` and `'...'` literals.
fn find_unquoted(haystack: &str, needle: &str) -> Option<usize> {
    let mut quote = None;
    let mut escaped = false;
    for (i, c) in haystack.char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None if haystack[i..].starts_with(needle) => return Some(i),
            None if c == '"' || c == '\'' => quote = Some(c),
            None => {}
        }
    }
    None
}

pub fn parse_text_markup(text: &str) -> Result<ActionCall, ParseError> {
    let think = find_segment(text, THINK_OPEN, THINK_CLOSE, Segment::Reasoning, false)?;
    let answer = find_segment(text, ANSWER_OPEN, ANSWER_CLOSE, Segment::Action, true)?;

    if answer.open_at < think.close_end {
        return Err(ParseError::syntax(
            answer.open_at,
            "<answer> must come after the closing </think>",
        ));
    }

    // Tags inside the answer's string literals are content; anywhere else they repeat a segment.
    let outside = [
        &text[..think.open_at],
        &text[think.body_start..think.body_end],
        &text[think.close_end..answer.open_at],
        &text[answer.close_end..],
    ];
    for (which, open, close) in [
        (Segment::Reasoning, THINK_OPEN, THINK_CLOSE),
        (Segment::Action, ANSWER_OPEN, ANSWER_CLOSE),
    ] {
        if outside.iter().any(|s| s.contains(open) || s.contains(close)) {
            return Err(ParseError::DuplicateSegment(which));
        }
    }
    if [outside[0], outside[2], outside[3]]
        .iter()
        .any(|s| !s.trim().is_empty())
    {
        debug!("ignoring text outside <think>/<answer> segments");
    }

    let reasoning = text[think.body_start..think.body_end].trim();
    let body = &text[answer.body_start..answer.body_end];

    let mut call = parse_call(body, answer.body_start)?;
    if call.thought.is_empty() {
        call.thought = reasoning.to_string();
    }
    Ok(call)
}

/// Parses a single `do(...)` or `finish(...)` expression. `base` is the offset of
/// `src` within the raw reply, used for error positions.
pub fn parse_call(src: &str, base: usize) -> Result<ActionCall, ParseError> {
    let mut cur = Cursor { src, pos: 0, base };

    cur.skip_ws();
    if cur.at_end() {
        return Err(cur.error("empty action segment"));
    }
    let callee_at = cur.pos;
    let callee = cur.ident()?;
    cur.skip_ws();
    cur.expect('(')?;
    let args = cur.arguments()?;
    cur.skip_ws();
    if !cur.at_end() {
        return Err(cur.error("unexpected text after the call expression"));
    }

    let mut params = Params::new();
    for (key, value, at) in args {
        if params.contains_key(&key) {
            return Err(ParseError::syntax(base + at, format!("duplicate argument '{key}'")));
        }
        params.insert(key, value);
    }

    let name = match callee {
        "finish" => "finish".to_string(),
        "do" => match params.remove("action") {
            Some(ParamValue::Text(action)) => normalize_name(&action),
            Some(other) => {
                return Err(ParseError::syntax(
                    base + callee_at,
                    format!("action= must be a string, got {other}"),
                ));
            }
            None => {
                return Err(ParseError::syntax(
                    base + callee_at,
                    "do(...) requires an action= argument",
                ));
            }
        },
        other => {
            return Err(ParseError::syntax(
                base + callee_at,
                format!("expected do(...) or finish(...), found {other}(...)"),
            ));
        }
    };

    let thought = match params.remove("thought") {
        Some(ParamValue::Text(t)) => t.trim().to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    };

    Ok(ActionCall {
        name,
        params,
        thought,
    })
}

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
    base: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::syntax(self.base + self.pos, message)
    }

    fn expect(&mut self, want: char) -> Result<(), ParseError> {
        match self.peek() {
            Some(c) if c == want => {
                self.bump();
                Ok(())
            }
            Some(c) => Err(self.error(format!("expected '{want}', found '{c}'"))),
            None => Err(self.error(format!("expected '{want}', found end of input"))),
        }
    }

    fn ident(&mut self) -> Result<&'a str, ParseError> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            Some(c) => return Err(self.error(format!("expected an identifier, found '{c}'"))),
            None => return Err(self.error("expected an identifier, found end of input")),
        }
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.bump();
        }
        Ok(&self.src[start..self.pos])
    }

    /// `key=value` pairs up to and including the closing parenthesis.
    fn arguments(&mut self) -> Result<Vec<(String, ParamValue, usize)>, ParseError> {
        let mut args = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(')') {
                self.bump();
                return Ok(args);
            }
            let key_at = self.pos;
            let key = self.ident()?.to_string();
            self.skip_ws();
            self.expect('=')?;
            self.skip_ws();
            let value = self.value()?;
            args.push((key, value, key_at));

            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(')') => return Ok(args),
                Some(c) => {
                    self.pos -= c.len_utf8();
                    return Err(self.error(format!("expected ',' or ')', found '{c}'")));
                }
                None => return Err(self.error("unclosed '(' in call")),
            }
        }
    }

    fn value(&mut self) -> Result<ParamValue, ParseError> {
        match self.peek() {
            Some(q @ ('"' | '\'')) => {
                self.bump();
                self.string(q).map(ParamValue::Text)
            }
            Some('[') => {
                self.bump();
                self.list()
            }
            Some(_) => self.scalar(),
            None => Err(self.error("expected a value, found end of input")),
        }
    }

    fn string(&mut self, quote: char) -> Result<String, ParseError> {
        let start = self.pos;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c @ ('\\' | '"' | '\'')) => out.push(c),
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => break,
                },
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
                None => break,
            }
        }
        Err(ParseError::syntax(
            self.base + start - 1,
            "unterminated string literal",
        ))
    }

    fn list(&mut self) -> Result<ParamValue, ParseError> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(']') {
                self.bump();
                return Ok(list_or_point(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(']') => return Ok(list_or_point(items)),
                Some(c) => {
                    self.pos -= c.len_utf8();
                    return Err(self.error(format!("expected ',' or ']', found '{c}'")));
                }
                None => return Err(self.error("unclosed '[' in value")),
            }
        }
    }

    /// A bare token: an integer or a word such as `True`.
    fn scalar(&mut self) -> Result<ParamValue, ParseError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| {
            !c.is_whitespace() && !matches!(c, ',' | '(' | ')' | '[' | ']' | '=' | '"' | '\'')
        }) {
            self.bump();
        }
        let token = &self.src[start..self.pos];
        if token.is_empty() {
            let found = self.peek().map(String::from).unwrap_or_default();
            return Err(self.error(format!("expected a value, found '{found}'")));
        }
        Ok(match token.parse::<i64>() {
            Ok(n) => ParamValue::Int(n),
            Err(_) => ParamValue::Text(token.to_string()),
        })
    }
}
