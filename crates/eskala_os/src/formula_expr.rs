#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use eskala_kernel_contracts::versioned::CONFIG_VALUE_MAX_LEN;
use rust_decimal::Decimal;

/// Deepest allowed nesting of parentheses and unary minus.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Inputs a formula may reference, with the help text shown to editors.
pub const KNOWN_VARIABLES: &[(&str, &str)] = &[
    (
        "profit_l",
        "The actual profit amount earned by the company, measured in Honduran Lempiras (L)",
    ),
    (
        "expected_profit_pct",
        "The expected profit percentage - how much profit the company should make as a percentage",
    ),
    (
        "company_value_l",
        "The total estimated worth of the company in Honduran Lempiras (L)",
    ),
    (
        "investment_l",
        "The amount of money invested in the company, shown in Honduran Lempiras (L)",
    ),
    (
        "exchange_rate",
        "The conversion rate from Honduran Lempiras (L) to US Dollars ($)",
    ),
];

pub fn variable_description(name: &str) -> Option<&'static str> {
    KNOWN_VARIABLES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, d)| *d)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormulaError {
    #[error("formula is empty")]
    Empty,
    #[error("formula is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("formula nests deeper than {0} levels")]
    TooDeep(usize),
    #[error("unexpected character '{ch}' at position {position}")]
    UnexpectedCharacter { ch: char, position: usize },
    #[error("unexpected '{token}' at position {position}")]
    UnexpectedToken { token: String, position: usize },
    #[error("formula ends unexpectedly")]
    UnexpectedEnd,
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("no value supplied for variable '{0}'")]
    MissingVariable(String),
    #[error("result is not a finite number (division by zero or overflow)")]
    NotFinite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Number(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(s) | Token::Ident(s) => f.write_str(s),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>, FormulaError> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let tok = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '(' => Token::LParen,
            ')' => Token::RParen,
            c if c.is_ascii_digit() || c == '.' => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                out.push((Token::Number(chars[start..i].iter().collect()), start));
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                out.push((Token::Ident(chars[start..i].iter().collect()), start));
                continue;
            }
            other => {
                return Err(FormulaError::UnexpectedCharacter {
                    ch: other,
                    position: start,
                })
            }
        };
        out.push((tok, start));
        i += 1;
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Number(Decimal),
    Variable(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    tokens: &'a [(Token, usize)],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn unexpected(&self) -> FormulaError {
        match self.tokens.get(self.pos) {
            Some((tok, position)) => FormulaError::UnexpectedToken {
                token: tok.to_string(),
                position: *position,
            },
            None => FormulaError::UnexpectedEnd,
        }
    }

    fn descend(&mut self) -> Result<(), FormulaError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(FormulaError::TooDeep(MAX_NESTING_DEPTH));
        }
        self.depth += 1;
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if let Some(Token::Minus) = self.peek() {
            self.pos += 1;
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        let expr = match self.peek() {
            Some(Token::Number(s)) => {
                Expr::Number(Decimal::from_str(s).map_err(|_| self.unexpected())?)
            }
            Some(Token::Ident(name)) => {
                if variable_description(name).is_none() {
                    return Err(FormulaError::UnknownVariable(name.clone()));
                }
                Expr::Variable(name.clone())
            }
            Some(Token::LParen) => {
                self.pos += 1;
                self.descend()?;
                let inner = self.expr()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(self.unexpected());
                }
                self.depth -= 1;
                inner
            }
            _ => return Err(self.unexpected()),
        };
        self.pos += 1;
        Ok(expr)
    }
}

/// A parsed arithmetic formula over the known variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormulaExpression {
    tokens: Vec<Token>,
    root: Expr,
}

impl FormulaExpression {
    pub fn parse(text: &str) -> Result<Self, FormulaError> {
        if text.len() > CONFIG_VALUE_MAX_LEN {
            return Err(FormulaError::TooLong {
                len: text.len(),
                max: CONFIG_VALUE_MAX_LEN,
            });
        }
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(FormulaError::Empty);
        }
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.expr()?;
        if parser.pos != tokens.len() {
            return Err(parser.unexpected());
        }
        Ok(Self {
            tokens: tokens.into_iter().map(|(t, _)| t).collect(),
            root,
        })
    }

    /// Referenced variables in order of first use, without repeats.
    pub fn variables(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for tok in &self.tokens {
            if let Token::Ident(name) = tok {
                if !seen.contains(&name.as_str()) {
                    seen.push(name);
                }
            }
        }
        seen
    }

    pub fn describe_variables(&self) -> String {
        let vars = self.variables();
        if vars.is_empty() {
            return "No variables used in this formula".to_string();
        }
        vars.iter()
            .map(|v| format!("{v} = {}", variable_description(v).unwrap_or("")))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tokens joined by single spaces.
    pub fn canonical(&self) -> String {
        self.tokens
            .iter()
            .map(Token::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn evaluate(&self, bindings: &BTreeMap<String, Decimal>) -> Result<Decimal, FormulaError> {
        eval(&self.root, bindings)
    }
}

fn eval(expr: &Expr, bindings: &BTreeMap<String, Decimal>) -> Result<Decimal, FormulaError> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Variable(name) => bindings
            .get(name)
            .copied()
            .ok_or_else(|| FormulaError::MissingVariable(name.clone())),
        Expr::Neg(inner) => Ok(-eval(inner, bindings)?),
        Expr::Binary(op, lhs, rhs) => {
            let l = eval(lhs, bindings)?;
            let r = eval(rhs, bindings)?;
            let out = match op {
                BinOp::Add => l.checked_add(r),
                BinOp::Sub => l.checked_sub(r),
                BinOp::Mul => l.checked_mul(r),
                BinOp::Div => l.checked_div(r),
            };
            out.ok_or(FormulaError::NotFinite)
        }
    }
}
