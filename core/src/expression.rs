//! Expression evaluator for EVALUATE tasks and FOR loop conditions.
//!
//! Supported grammar, built-ins only:
//! - literals: strings, numbers, booleans, null
//! - variable references by name
//! - comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - boolean operators: `&&`, `||`, `!`
//! - arithmetic: `+`, `-`, `*`, `/`
//! - parentheses

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during expression evaluation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Empty expression")]
    Empty,
}

pub type ExpressionResult<T> = Result<T, ExpressionError>;

/// Compare two JSON values with a relational operator. Numbers compare
/// numerically, strings lexicographically; `==`/`!=` fall back to structural
/// equality for everything else.
pub fn compare_values(left: &Value, op: &str, right: &Value) -> Result<bool, String> {
    match op {
        "==" => Ok(loose_eq(left, right)),
        "!=" => Ok(!loose_eq(left, right)),
        "<" | "<=" | ">" | ">=" => {
            if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
                Ok(match op {
                    "<" => a < b,
                    "<=" => a <= b,
                    ">" => a > b,
                    _ => a >= b,
                })
            } else if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
                Ok(match op {
                    "<" => a < b,
                    "<=" => a <= b,
                    ">" => a > b,
                    _ => a >= b,
                })
            } else {
                Err(format!(
                    "cannot compare {left} {op} {right}: incompatible types"
                ))
            }
        }
        other => Err(format!("unknown operator '{other}'")),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a == b;
    }
    left == right
}

/// Whether a value counts as true in a boolean position.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Op(&'static str),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> ExpressionResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            ' ' | '\t' | '\n' | '\r' => pos += 1,
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            '+' => {
                tokens.push(Token::Op("+"));
                pos += 1;
            }
            '-' => {
                tokens.push(Token::Op("-"));
                pos += 1;
            }
            '*' => {
                tokens.push(Token::Op("*"));
                pos += 1;
            }
            '/' => {
                tokens.push(Token::Op("/"));
                pos += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next_eq = chars.get(pos + 1) == Some(&'=');
                let op = match (c, next_eq) {
                    ('=', true) => "==",
                    ('!', true) => "!=",
                    ('<', true) => "<=",
                    ('>', true) => ">=",
                    ('<', false) => "<",
                    ('>', false) => ">",
                    ('!', false) => "!",
                    ('=', false) => {
                        return Err(ExpressionError::Parse {
                            position: pos,
                            message: "single '=' is not an operator".to_string(),
                        })
                    }
                    _ => unreachable!(),
                };
                tokens.push(Token::Op(op));
                pos += if next_eq { 2 } else { 1 };
            }
            '&' | '|' => {
                if chars.get(pos + 1) == Some(&c) {
                    tokens.push(Token::Op(if c == '&' { "&&" } else { "||" }));
                    pos += 2;
                } else {
                    return Err(ExpressionError::Parse {
                        position: pos,
                        message: format!("expected '{c}{c}'"),
                    });
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start = pos + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(ExpressionError::Parse {
                        position: pos,
                        message: "unterminated string literal".to_string(),
                    });
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                pos = end + 1;
            }
            _ if c.is_ascii_digit() => {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                    pos += 1;
                }
                let text: String = chars[start..pos].iter().collect();
                let value = text.parse().map_err(|_| ExpressionError::Parse {
                    position: start,
                    message: format!("invalid number '{text}'"),
                })?;
                tokens.push(Token::Number(value));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = pos;
                while pos < chars.len()
                    && (chars[pos].is_alphanumeric() || chars[pos] == '_' || chars[pos] == '.')
                {
                    pos += 1;
                }
                let ident: String = chars[start..pos].iter().collect();
                tokens.push(match ident.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(ident),
                });
            }
            _ => {
                return Err(ExpressionError::Parse {
                    position: pos,
                    message: format!("unexpected character '{c}'"),
                })
            }
        }
    }

    Ok(tokens)
}

/// Evaluates expressions against a variable map.
pub struct ExpressionEvaluator<'a> {
    variables: &'a HashMap<String, Value>,
}

struct Parser<'a, 'b> {
    tokens: &'b [Token],
    pos: usize,
    evaluator: &'b ExpressionEvaluator<'a>,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(variables: &'a HashMap<String, Value>) -> Self {
        Self { variables }
    }

    /// Evaluate an expression to a JSON value.
    pub fn evaluate(&self, expression: &str) -> ExpressionResult<Value> {
        let tokens = tokenize(expression)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Empty);
        }
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            evaluator: self,
        };
        let value = parser.parse_or()?;
        if parser.pos != tokens.len() {
            return Err(ExpressionError::Parse {
                position: parser.pos,
                message: "trailing tokens after expression".to_string(),
            });
        }
        Ok(value)
    }

    /// Evaluate an expression and coerce the result to a boolean.
    pub fn evaluate_bool(&self, expression: &str) -> ExpressionResult<bool> {
        Ok(truthy(&self.evaluate(expression)?))
    }

    fn lookup(&self, name: &str) -> ExpressionResult<Value> {
        // Dotted identifiers traverse into json-typed variables.
        if let Some(value) = self.variables.get(name) {
            return Ok(value.clone());
        }
        let mut parts = name.split('.');
        let root = parts.next().unwrap_or_default();
        let mut current = self
            .variables
            .get(root)
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownVariable(name.to_string()))?;
        for part in parts {
            current = match &current {
                Value::Object(map) => map
                    .get(part)
                    .cloned()
                    .ok_or_else(|| ExpressionError::UnknownVariable(name.to_string()))?,
                Value::Array(items) => part
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| ExpressionError::UnknownVariable(name.to_string()))?,
                _ => return Err(ExpressionError::UnknownVariable(name.to_string())),
            };
        }
        Ok(current)
    }
}

impl Parser<'_, '_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> ExpressionResult<Value> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Op("||"))) {
            self.next();
            let right = self.parse_and()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ExpressionResult<Value> {
        let mut left = self.parse_comparison()?;
        while matches!(self.peek(), Some(Token::Op("&&"))) {
            self.next();
            let right = self.parse_comparison()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> ExpressionResult<Value> {
        let left = self.parse_additive()?;
        if let Some(Token::Op(op @ ("==" | "!=" | "<" | "<=" | ">" | ">="))) = self.peek() {
            let op = *op;
            self.next();
            let right = self.parse_additive()?;
            let result = compare_values(&left, op, &right).map_err(ExpressionError::Type)?;
            return Ok(Value::Bool(result));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> ExpressionResult<Value> {
        let mut left = self.parse_multiplicative()?;
        while let Some(Token::Op(op @ ("+" | "-"))) = self.peek() {
            let op = *op;
            self.next();
            let right = self.parse_multiplicative()?;
            left = arithmetic(&left, op, &right)?;
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> ExpressionResult<Value> {
        let mut left = self.parse_unary()?;
        while let Some(Token::Op(op @ ("*" | "/"))) = self.peek() {
            let op = *op;
            self.next();
            let right = self.parse_unary()?;
            left = arithmetic(&left, op, &right)?;
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ExpressionResult<Value> {
        match self.peek() {
            Some(Token::Op("!")) => {
                self.next();
                let value = self.parse_unary()?;
                Ok(Value::Bool(!truthy(&value)))
            }
            Some(Token::Op("-")) => {
                self.next();
                let value = self.parse_unary()?;
                let number = value
                    .as_f64()
                    .ok_or_else(|| ExpressionError::Type(format!("cannot negate {value}")))?;
                Ok(number_value(-number))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> ExpressionResult<Value> {
        let position = self.pos;
        match self.next().cloned() {
            Some(Token::Number(n)) => Ok(number_value(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Ident(name)) => self.evaluator.lookup(&name),
            Some(Token::LParen) => {
                let value = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(ExpressionError::Parse {
                        position,
                        message: "expected ')'".to_string(),
                    }),
                }
            }
            other => Err(ExpressionError::Parse {
                position,
                message: format!("unexpected token {other:?}"),
            }),
        }
    }
}

fn arithmetic(left: &Value, op: &str, right: &Value) -> ExpressionResult<Value> {
    // String concatenation rides on '+'.
    if op == "+" {
        if let (Value::String(a), Value::String(b)) = (left, right) {
            return Ok(Value::String(format!("{a}{b}")));
        }
    }

    let a = left
        .as_f64()
        .ok_or_else(|| ExpressionError::Type(format!("{left} is not a number")))?;
    let b = right
        .as_f64()
        .ok_or_else(|| ExpressionError::Type(format!("{right} is not a number")))?;

    let result = match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => {
            if b == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            a / b
        }
        _ => return Err(ExpressionError::Type(format!("unknown operator '{op}'"))),
    };
    Ok(number_value(result))
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
