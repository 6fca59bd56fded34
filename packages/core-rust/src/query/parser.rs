//! Recursive-descent parser for the textual predicate grammar.
//!
//! ```text
//! expr   := term ( OR term )*
//! term   := factor ( AND factor )*
//! factor := '(' expr ')' | IDENT OP '?'
//! OP     := '=' | '==' | '!=' | '<>' | '>' | '<' | '>=' | '<='
//! ```
//!
//! Keywords are case-insensitive. Each `?` consumes the next positional
//! argument.

use std::iter::Peekable;
use std::str::CharIndices;

use super::{CompareOp, Predicate};
use crate::error::{Result, StoreError};
use crate::types::{validate_field_name, Value};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Op(CompareOp),
    Placeholder,
    And,
    Or,
    LParen,
    RParen,
}

fn invalid(msg: impl Into<String>) -> StoreError {
    StoreError::InvalidQuery(msg.into())
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars: Peekable<CharIndices<'_>> = expr.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            '?' => tokens.push(Token::Placeholder),
            '=' => {
                if chars.peek().is_some_and(|(_, n)| *n == '=') {
                    chars.next();
                }
                tokens.push(Token::Op(CompareOp::Eq));
            }
            '!' => match chars.next() {
                Some((_, '=')) => tokens.push(Token::Op(CompareOp::Ne)),
                _ => return Err(invalid(format!("expected '=' after '!' at {pos}"))),
            },
            '<' | '>' => {
                let next = chars.peek().map(|(_, n)| *n);
                let op = match (c, next) {
                    ('<', Some('=')) => Some(CompareOp::Le),
                    ('>', Some('=')) => Some(CompareOp::Ge),
                    ('<', Some('>')) => Some(CompareOp::Ne),
                    _ => None,
                };
                if let Some(op) = op {
                    chars.next();
                    tokens.push(Token::Op(op));
                } else if c == '<' {
                    tokens.push(Token::Op(CompareOp::Lt));
                } else {
                    tokens.push(Token::Op(CompareOp::Gt));
                }
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut word = String::from(c);
                while let Some((_, n)) = chars.peek() {
                    if n.is_ascii_alphanumeric() || *n == '_' {
                        word.push(*n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = if word.eq_ignore_ascii_case("and") {
                    Token::And
                } else if word.eq_ignore_ascii_case("or") {
                    Token::Or
                } else {
                    Token::Ident(word)
                };
                tokens.push(token);
            }
            other => return Err(invalid(format!("unexpected character {other:?} at {pos}"))),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    args: &'a [Value],
    next_arg: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Predicate> {
        let mut node = self.term()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            node = node.or(self.term()?);
        }
        Ok(node)
    }

    fn term(&mut self) -> Result<Predicate> {
        let mut node = self.factor()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            node = node.and(self.factor()?);
        }
        Ok(node)
    }

    fn factor(&mut self) -> Result<Predicate> {
        match self.bump() {
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(invalid("missing closing parenthesis")),
                }
            }
            Some(Token::Ident(field)) => {
                validate_field_name(&field)?;
                let op = match self.bump() {
                    Some(Token::Op(op)) => op,
                    other => {
                        return Err(invalid(format!(
                            "expected comparison operator after {field:?}, found {other:?}"
                        )))
                    }
                };
                match self.bump() {
                    Some(Token::Placeholder) => {}
                    other => {
                        return Err(invalid(format!(
                            "expected '?' after {field} {}, found {other:?}",
                            op.symbol()
                        )))
                    }
                }
                let arg = self.args.get(self.next_arg).cloned().ok_or_else(|| {
                    invalid(format!(
                        "placeholder {} has no argument ({} supplied)",
                        self.next_arg + 1,
                        self.args.len()
                    ))
                })?;
                self.next_arg += 1;
                Ok(Predicate::Compare { field, op, arg })
            }
            other => Err(invalid(format!("expected field or '(', found {other:?}"))),
        }
    }
}

/// Parses `expr` with positional `args`. Empty input yields `None`.
pub(super) fn parse(expr: &str, args: &[Value]) -> Result<Option<Predicate>> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        if !args.is_empty() {
            return Err(invalid(format!(
                "empty expression given {} argument(s)",
                args.len()
            )));
        }
        return Ok(None);
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        args,
        next_arg: 0,
    };
    let predicate = parser.expr()?;

    if let Some(extra) = parser.peek() {
        return Err(invalid(format!("unexpected trailing token {extra:?}")));
    }
    if parser.next_arg != args.len() {
        return Err(invalid(format!(
            "expression uses {} argument(s) but {} were supplied",
            parser.next_arg,
            args.len()
        )));
    }
    Ok(Some(predicate))
}
