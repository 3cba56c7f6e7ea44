//! Boolean conditions over workflow context.
//!
//! Conditions gate task execution. The grammar is deliberately small:
//!
//! ```text
//! expr    := or
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | compare
//! compare := primary (("==" | "!=" | "<" | "<=" | ">" | ">=") primary)?
//! primary := number | string | "true" | "false" | "null" | path | "(" expr ")"
//! path    := ident ("." ident)*
//! ```
//!
//! Paths resolve against a JSON scope; missing values are `null`. There are
//! no function calls, arithmetic or assignments.
//!
//! ```
//! use maestro::core::Condition;
//! use serde_json::json;
//!
//! let cond = Condition::parse("env == \"prod\" && replicas >= 2").unwrap();
//! assert!(cond.evaluate(&json!({"env": "prod", "replicas": 3})));
//! assert!(!cond.evaluate(&json!({"env": "dev", "replicas": 3})));
//! ```

use serde_json::Value;

use crate::error::{Error, Result};

/// Deepest nesting of parentheses and negations accepted by `parse`.
pub const MAX_DEPTH: usize = 64;

/// Longest expression, in tokens, accepted by `parse`.
pub const MAX_TOKENS: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Op(CompareOp),
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse an expression.
    ///
    /// # Errors
    /// Returns `InvalidCondition` for unknown characters, unbalanced
    /// parentheses, trailing input, or expressions nested deeper than
    /// [`MAX_DEPTH`] or longer than [`MAX_TOKENS`].
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidCondition {
            expr: source.to_string(),
            reason,
        };

        let tokens = tokenize(source).map_err(invalid)?;
        if tokens.is_empty() {
            return Err(invalid("empty expression".to_string()));
        }
        if tokens.len() > MAX_TOKENS {
            return Err(invalid(format!("expression longer than {} tokens", MAX_TOKENS)));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.or().map_err(invalid)?;
        if let Some(tok) = parser.peek() {
            return Err(invalid(format!("unexpected token {:?}", tok)));
        }

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a JSON scope.
    pub fn evaluate(&self, scope: &Value) -> bool {
        truthy(&eval(&self.expr, scope))
    }
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(format!("expected `{}{}` at position {}", c, c, i));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' | '!' | '<' | '>' => {
                let eq_next = chars.get(i + 1) == Some(&'=');
                let tok = match (c, eq_next) {
                    ('=', true) => Token::Op(CompareOp::Eq),
                    ('!', true) => Token::Op(CompareOp::Ne),
                    ('<', true) => Token::Op(CompareOp::Le),
                    ('>', true) => Token::Op(CompareOp::Ge),
                    ('<', false) => Token::Op(CompareOp::Lt),
                    ('>', false) => Token::Op(CompareOp::Gt),
                    ('!', false) => Token::Not,
                    _ => return Err(format!("expected `==` at position {}", i)),
                };
                i += if eq_next { 2 } else { 1 };
                tokens.push(tok);
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(format!("unterminated string starting at position {}", i));
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number `{}`", text))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.' || chars[i] == '-')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character `{}` at position {}", other, i)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn descend(&mut self) -> std::result::Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("nesting too deep".to_string());
        }
        Ok(())
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn or(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> std::result::Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> std::result::Result<Expr, String> {
        let left = self.primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.primary()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> std::result::Result<Expr, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(path)) => Ok(Expr::Path(
                path.split('.').map(str::to_string).collect(),
            )),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.or()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("missing closing parenthesis".to_string()),
                }
            }
            Some(tok) => Err(format!("unexpected token {:?}", tok)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn eval(expr: &Expr, scope: &Value) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path(segments) => {
            let mut current = scope;
            for segment in segments {
                match current.get(segment) {
                    Some(next) => current = next,
                    None => return Value::Null,
                }
            }
            current.clone()
        }
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, scope))),
        Expr::And(l, r) => Value::Bool(truthy(&eval(l, scope)) && truthy(&eval(r, scope))),
        Expr::Or(l, r) => Value::Bool(truthy(&eval(l, scope)) || truthy(&eval(r, scope))),
        Expr::Compare(l, op, r) => Value::Bool(compare(&eval(l, scope), *op, &eval(r, scope))),
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    };

    match op {
        CompareOp::Eq => ordering == Some(Ordering::Equal) || (ordering.is_none() && left == right),
        CompareOp::Ne => !(ordering == Some(Ordering::Equal) || (ordering.is_none() && left == right)),
        CompareOp::Lt => ordering == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Gt => ordering == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
