//! Literal structure parser
//!
//! INI-era configs store whole structures (`ml_sequence`, `stream_sequence`,
//! `pyzm_overrides`, `poly_color`) as a single string such as
//! `{'general': {'model_sequence': 'object'}, 'resize': 800}`. This module
//! turns that text into a [`serde_yaml::Value`] so the rest of the crate only
//! ever sees typed structures.
//!
//! Supported grammar: dicts, lists, tuples (become sequences), single or
//! double quoted strings, integers, floats, `True`, `False` and `None`.

use serde_yaml::{Mapping, Value};

use crate::{HookError, Result};

/// Token types
#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    None,

    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Colon,

    Eof,
}

/// Token with its byte offset in the source
#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

/// Lexer for literal structures
struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }

        let Some((offset, ch)) = self.chars.next() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                offset: self.source.len(),
            });
        };

        let kind = match ch {
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '\'' | '"' => TokenKind::Str(self.read_string(ch, offset)?),
            c if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                self.read_number(offset)?
            }
            c if c.is_alphabetic() || c == '_' => self.read_word(offset)?,
            other => {
                return Err(error(offset, format!("unexpected character '{}'", other)));
            }
        };

        Ok(Token { kind, offset })
    }

    fn read_string(&mut self, quote: char, start: usize) -> Result<String> {
        let mut out = String::new();
        loop {
            let Some((_, ch)) = self.chars.next() else {
                return Err(error(start, "unterminated string"));
            };
            match ch {
                '\\' => {
                    let Some((_, escaped)) = self.chars.next() else {
                        return Err(error(start, "unterminated string"));
                    };
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '\\' => out.push('\\'),
                        '\'' => out.push('\''),
                        '"' => out.push('"'),
                        other => {
                            // unknown escapes are kept verbatim
                            out.push('\\');
                            out.push(other);
                        }
                    }
                }
                c if c == quote => return Ok(out),
                c => out.push(c),
            }
        }
    }

    fn read_number(&mut self, start: usize) -> Result<TokenKind> {
        let mut end = start + 1;
        while let Some(&(pos, c)) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '+' || c == '_' {
                end = pos + c.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        let text: String = self.source[start..end].chars().filter(|c| *c != '_').collect();

        if let Ok(v) = text.parse::<i64>() {
            return Ok(TokenKind::Int(v));
        }
        text.parse::<f64>()
            .map(TokenKind::Float)
            .map_err(|_| error(start, format!("invalid number '{}'", text)))
    }

    fn read_word(&mut self, start: usize) -> Result<TokenKind> {
        let mut end = start + 1;
        while let Some(&(pos, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                end = pos + c.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        match &self.source[start..end] {
            "True" => Ok(TokenKind::True),
            "False" => Ok(TokenKind::False),
            "None" => Ok(TokenKind::None),
            word => Err(error(start, format!("unexpected identifier '{}'", word))),
        }
    }
}

/// Recursive-descent parser producing YAML values
struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Result<Self> {
        let mut lexer = Lexer::new(source);
        let current = lexer.next_token()?;
        Ok(Self { lexer, current })
    }

    fn advance(&mut self) -> Result<Token> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<()> {
        if self.current.kind == kind {
            self.advance()?;
            Ok(())
        } else {
            Err(error(
                self.current.offset,
                format!("expected {}, got {:?}", what, self.current.kind),
            ))
        }
    }

    fn parse_document(&mut self) -> Result<Value> {
        let value = self.parse_value()?;
        if self.current.kind != TokenKind::Eof {
            return Err(error(
                self.current.offset,
                format!("trailing input {:?}", self.current.kind),
            ));
        }
        Ok(value)
    }

    fn parse_value(&mut self) -> Result<Value> {
        let token = self.advance()?;
        match token.kind {
            TokenKind::Int(v) => Ok(Value::Number(v.into())),
            TokenKind::Float(v) => Ok(Value::Number(v.into())),
            TokenKind::Str(s) => Ok(Value::String(s)),
            TokenKind::True => Ok(Value::Bool(true)),
            TokenKind::False => Ok(Value::Bool(false)),
            TokenKind::None => Ok(Value::Null),
            TokenKind::LBrace => self.parse_dict(),
            TokenKind::LBracket => self.parse_items(TokenKind::RBracket, "']'").map(Value::Sequence),
            TokenKind::LParen => self.parse_tuple(),
            other => Err(error(token.offset, format!("unexpected {:?}", other))),
        }
    }

    fn parse_dict(&mut self) -> Result<Value> {
        let mut map = Mapping::new();
        while self.current.kind != TokenKind::RBrace {
            let key = self.parse_value()?;
            self.expect(TokenKind::Colon, "':'")?;
            let value = self.parse_value()?;
            map.insert(key, value);

            if self.current.kind == TokenKind::Comma {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(Value::Mapping(map))
    }

    fn parse_items(&mut self, close: TokenKind, what: &str) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        while self.current.kind != close {
            items.push(self.parse_value()?);
            if self.current.kind == TokenKind::Comma {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(close, what)?;
        Ok(items)
    }

    fn parse_tuple(&mut self) -> Result<Value> {
        if self.current.kind == TokenKind::RParen {
            self.advance()?;
            return Ok(Value::Sequence(Vec::new()));
        }

        let first = self.parse_value()?;
        if self.current.kind == TokenKind::RParen {
            // `(x)` is just a parenthesized value
            self.advance()?;
            return Ok(first);
        }

        self.expect(TokenKind::Comma, "',' or ')'")?;
        let mut items = vec![first];
        items.extend(self.parse_items(TokenKind::RParen, "')'")?);
        Ok(Value::Sequence(items))
    }
}

fn error(offset: usize, message: impl Into<String>) -> HookError {
    HookError::Literal {
        offset,
        message: message.into(),
    }
}

/// Parse a literal structure string into a YAML value
pub fn parse_literal(source: &str) -> Result<Value> {
    Parser::new(source.trim())?.parse_document()
}
