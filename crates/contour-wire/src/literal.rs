//! Literal-only parser for the frame syntax.
//!
//! The wire text looks like a Python literal (`{'kind': 'result', 'id': 3}`),
//! but this is a data parser, not an evaluator: names, calls, attribute access,
//! subscripts and operators are rejected as unsafe instead of being resolved.

use contour_types::{Frame, FrameValue};

use crate::error::WireError;

/// Deepest nesting of mappings and lists a frame may have, the frame itself
/// counting as the first level.
pub const MAX_DEPTH: usize = 64;

pub fn parse_frame(input: &str) -> Result<Frame, WireError> {
    match parse_value(input)? {
        FrameValue::Map(entries) => Ok(Frame::from_fields(entries)),
        other => Err(WireError::malformed(
            0,
            format!("frame must be a mapping, found {}", other.type_name()),
        )),
    }
}

pub fn parse_value(input: &str) -> Result<FrameValue, WireError> {
    let mut parser = Parser {
        src: input,
        pos: 0,
        depth: 0,
    };
    parser.skip_ws();
    let value = parser.value()?;
    parser.expect_end()?;
    Ok(value)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t' | '\r' | '\n')) {
            self.pos += 1;
        }
    }

    fn value(&mut self) -> Result<FrameValue, WireError> {
        let start = self.pos;
        let value = match self.peek() {
            None => return Err(WireError::malformed(start, "unexpected end of input")),
            Some('\'' | '"') => FrameValue::Str(self.string()?),
            Some('[') => self.sequence(']')?,
            Some('(') => self.sequence(')')?,
            Some('{') => self.mapping()?,
            Some('-' | '+') => self.signed_number()?,
            Some(c) if c.is_ascii_digit() || c == '.' => self.number_from(start)?,
            Some(c) if is_ident_start(c) => self.keyword_or_name()?,
            Some(c) => return Err(self.unexpected(c)),
        };
        self.check_postfix()?;
        Ok(value)
    }

    fn expect_end(&mut self) -> Result<(), WireError> {
        self.skip_ws();
        match self.peek() {
            None => Ok(()),
            Some(c) => Err(self.unexpected(c)),
        }
    }

    /// A complete value may only be followed by a separator or a closer.
    fn check_postfix(&mut self) -> Result<(), WireError> {
        self.skip_ws();
        let at = self.pos;
        match self.peek() {
            Some('(') => Err(WireError::unsafe_at(at, "call expression")),
            Some('.') => Err(WireError::unsafe_at(at, "attribute access")),
            Some('[') => Err(WireError::unsafe_at(at, "subscript expression")),
            Some(c) if is_operator(c) => Err(WireError::unsafe_at(
                at,
                format!("operator `{c}` in expression"),
            )),
            Some(c) if is_ident_start(c) => {
                Err(WireError::unsafe_at(at, "expression keyword after a value"))
            }
            _ => Ok(()),
        }
    }

    fn unexpected(&self, c: char) -> WireError {
        if is_operator(c) {
            WireError::unsafe_at(self.pos, format!("operator `{c}` in value position"))
        } else if is_ident_start(c) {
            WireError::unsafe_at(self.pos, "bare name in value position")
        } else {
            WireError::malformed(self.pos, format!("unexpected character `{c}`"))
        }
    }

    fn enter(&mut self) -> Result<(), WireError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(WireError::malformed(
                self.pos,
                format!("nesting deeper than {MAX_DEPTH} levels"),
            ));
        }
        Ok(())
    }

    fn sequence(&mut self, close: char) -> Result<FrameValue, WireError> {
        self.enter()?;
        self.bump();
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.bump();
                break;
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(c) if c == close => {
                    self.bump();
                    break;
                }
                Some(c) => return Err(self.unexpected(c)),
                None => {
                    return Err(WireError::malformed(
                        self.pos,
                        format!("unterminated sequence, expected `{close}`"),
                    ))
                }
            }
        }
        self.depth -= 1;
        Ok(FrameValue::List(items))
    }

    fn mapping(&mut self) -> Result<FrameValue, WireError> {
        self.enter()?;
        self.bump();
        let mut entries: Vec<(String, FrameValue)> = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.bump();
                break;
            }
            let key_at = self.pos;
            let key = self.value()?;
            self.skip_ws();
            match self.peek() {
                Some(':') => {
                    self.bump();
                }
                Some(',' | '}') => {
                    return Err(WireError::malformed(
                        self.pos,
                        "set literals are not part of the frame grammar",
                    ))
                }
                Some(c) => return Err(self.unexpected(c)),
                None => return Err(WireError::malformed(self.pos, "unterminated mapping")),
            }
            let FrameValue::Str(key) = key else {
                return Err(WireError::malformed(
                    key_at,
                    format!("mapping keys must be strings, found {}", key.type_name()),
                ));
            };
            if entries.iter().any(|(existing, _)| *existing == key) {
                return Err(WireError::malformed(key_at, format!("duplicate key `{key}`")));
            }
            self.skip_ws();
            let value = self.value()?;
            entries.push((key, value));
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some('}') => {
                    self.bump();
                    break;
                }
                Some(c) => return Err(self.unexpected(c)),
                None => return Err(WireError::malformed(self.pos, "unterminated mapping")),
            }
        }
        self.depth -= 1;
        Ok(FrameValue::Map(entries))
    }

    fn string(&mut self) -> Result<String, WireError> {
        let start = self.pos;
        let Some(quote) = self.bump() else {
            return Err(WireError::malformed(start, "unexpected end of input"));
        };
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n' | '\r') => {
                    return Err(WireError::malformed(start, "unterminated string"))
                }
                Some(c) if c == quote => break,
                Some('\\') => self.escape(&mut out, start)?,
                Some(c) => out.push(c),
            }
        }
        Ok(out)
    }

    fn escape(&mut self, out: &mut String, string_start: usize) -> Result<(), WireError> {
        let at = self.pos.saturating_sub(1);
        match self.bump() {
            None => return Err(WireError::malformed(string_start, "unterminated string")),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some('a') => out.push('\u{07}'),
            Some('b') => out.push('\u{08}'),
            Some('f') => out.push('\u{0c}'),
            Some('v') => out.push('\u{0b}'),
            Some('\n') => {}
            Some('x') => out.push(self.hex_escape(2, at)?),
            Some('u') => out.push(self.hex_escape(4, at)?),
            Some('U') => out.push(self.hex_escape(8, at)?),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
        }
        Ok(())
    }

    fn hex_escape(&mut self, digits: usize, at: usize) -> Result<char, WireError> {
        let mut code: u32 = 0;
        for _ in 0..digits {
            let digit = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| WireError::malformed(at, "truncated hex escape"))?;
            code = code * 16 + digit;
        }
        char::from_u32(code).ok_or_else(|| {
            WireError::malformed(at, format!("escape {code:#x} is not a valid character"))
        })
    }

    fn signed_number(&mut self) -> Result<FrameValue, WireError> {
        let start = self.pos;
        self.bump();
        match self.peek() {
            Some(c) if c.is_ascii_digit() || c == '.' => self.number_from(start),
            Some(c) if is_ident_start(c) => Err(WireError::unsafe_at(
                start,
                "unary operator applied to a name",
            )),
            _ => Err(WireError::malformed(start, "sign without a number")),
        }
    }

    fn number_from(&mut self, start: usize) -> Result<FrameValue, WireError> {
        let mut is_float = false;
        self.digits();
        if self.peek() == Some('.') {
            is_float = true;
            self.bump();
            self.digits();
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            is_float = true;
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            if !matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                return Err(WireError::malformed(start, "exponent without digits"));
            }
            self.digits();
        }
        if matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            return Err(WireError::malformed(start, "invalid numeric literal"));
        }
        let text = &self.src[start..self.pos];
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| WireError::malformed(start, format!("invalid float `{text}`")))?;
            if !value.is_finite() {
                return Err(WireError::malformed(start, "float literal out of range"));
            }
            Ok(FrameValue::Float(value))
        } else {
            text.parse::<i64>()
                .map(FrameValue::Int)
                .map_err(|_| WireError::malformed(start, format!("integer `{text}` out of range")))
        }
    }

    fn digits(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    fn keyword_or_name(&mut self) -> Result<FrameValue, WireError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_continue(c)) {
            self.bump();
        }
        let word = &self.src[start..self.pos];
        match word {
            "True" | "true" => Ok(FrameValue::Bool(true)),
            "False" | "false" => Ok(FrameValue::Bool(false)),
            "None" | "null" => Ok(FrameValue::Null),
            _ => {
                self.skip_ws();
                let reason = match self.peek() {
                    Some('(') => format!("call to `{word}`"),
                    Some('.') => format!("attribute access on `{word}`"),
                    Some('\'' | '"') => format!("prefixed string literal `{word}'...'`"),
                    _ => format!("reference to name `{word}`"),
                };
                Err(WireError::unsafe_at(start, reason))
            }
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_operator(c: char) -> bool {
    matches!(
        c,
        '+' | '-' | '*' | '/' | '%' | '@' | '|' | '&' | '^' | '<' | '>' | '=' | '!' | '~' | '`'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_unsafe(input: &str) {
        match parse_frame(input) {
            Err(WireError::Unsafe { .. }) => {}
            other => panic!("expected unsafe frame for {input:?}, got {other:?}"),
        }
    }

    fn assert_malformed(input: &str) {
        match parse_frame(input) {
            Err(WireError::Malformed { .. }) => {}
            other => panic!("expected malformed frame for {input:?}, got {other:?}"),
        }
    }

    #[test]
    fn parses_python_style_literals() {
        let frame = parse_frame(
            "{'kind': 'result', 'id': 7, 'ok': True, 'exit_code': None, 'ratio': -1.5e2, \
             'items': [1, (2, 3), {}], \"dq\": \"it's\"}",
        )
        .expect("parse");
        assert_eq!(frame.kind(), Some("result"));
        assert_eq!(frame.id(), Some(7));
        assert_eq!(frame.get("ok"), Some(&FrameValue::Bool(true)));
        assert_eq!(frame.get("exit_code"), Some(&FrameValue::Null));
        assert_eq!(frame.get("ratio"), Some(&FrameValue::Float(-150.0)));
        assert_eq!(
            frame.get("items"),
            Some(&FrameValue::List(vec![
                FrameValue::Int(1),
                FrameValue::List(vec![FrameValue::Int(2), FrameValue::Int(3)]),
                FrameValue::Map(Vec::new()),
            ]))
        );
        assert_eq!(frame.get_str("dq"), Some("it's"));
    }

    #[test]
    fn accepts_json_spelling_of_keywords_and_trailing_commas() {
        let frame = parse_frame(r#"{"a": true, "b": null, "c": [false,],}"#).expect("parse");
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.get("b"), Some(&FrameValue::Null));
    }

    #[test]
    fn decodes_escapes() {
        let value = parse_value(r"'a\nb\t\x41é\\\''").expect("parse");
        assert_eq!(value, FrameValue::Str("a\nb\tAé\\'".to_string()));
    }

    #[test]
    fn rejects_calls_names_and_attribute_access_as_unsafe() {
        assert_unsafe("{'x': __import__('os').system('id')}");
        assert_unsafe("{'x': open('/etc/passwd')}");
        assert_unsafe("{'x': os.environ}");
        assert_unsafe("{'x': 'abc'.upper()}");
        assert_unsafe("{'x': [1, 2][0]}");
        assert_unsafe("{'x': lambda: 1}");
        assert_unsafe("{'x': 1 + 2}");
        assert_unsafe("{'x': f'{secret}'}");
        assert_unsafe("{'x': [y for y in z]}");
        assert_unsafe("{'x': -inf}");
        assert_unsafe("{**globals()}");
        assert_unsafe("{'x': nan}");
        assert_unsafe("exec('print(1)')");
    }

    #[test]
    fn rejects_syntax_damage_as_malformed() {
        assert_malformed("{'x': 1");
        assert_malformed("{'x' 1}");
        assert_malformed("{'x': 'unterminated}");
        assert_malformed("{1: 'int key'}");
        assert_malformed("{'a': 1, 'a': 2}");
        assert_malformed("{'a', 'b'}");
        assert_malformed("['not', 'a', 'mapping']");
        assert_malformed("{'x': 0x1f}");
        assert_malformed("{'x': 99999999999999999999}");
        assert_malformed("{'x': 1e999}");
        assert_malformed("{'x': '\\x4'}");
        assert_malformed("");
    }

    #[test]
    fn rejects_excessive_nesting() {
        let deep = format!("{{'x': {}{}}}", "[".repeat(100), "]".repeat(100));
        assert_malformed(&deep);
    }
}
