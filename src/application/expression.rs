// Expression interpreter for derived signals
//
// Grammar:
//   expr    := term (('+' | '-') term)*
//   term    := unary (('*' | '/' | '%') unary)*
//   unary   := ('-' | '+') unary | power
//   power   := postfix ('^' unary)?
//   postfix := primary ('[' expr ']')*
//   primary := number | '${' name '}' | ident ['(' args ')'] | '(' expr ')'
use crate::domain::SignalData;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },
    #[error("unknown reference '${{{0}}}'")]
    UnknownReference(String),
    #[error("unknown name '{0}'")]
    UnknownName(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("{name}() takes {expected} argument(s), got {found}")]
    Arity {
        name: String,
        expected: &'static str,
        found: usize,
    },
    #[error("length mismatch in '{op}': {left} vs {right}")]
    LengthMismatch { op: char, left: usize, right: usize },
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("type error: {0}")]
    Type(String),
}

// ── Lexer ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Ref(String),
    Op(char),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '$' => {
                if chars.get(i + 1) != Some(&'{') {
                    return Err(syntax(i, "expected '{' after '$'"));
                }
                let close = chars[i + 2..]
                    .iter()
                    .position(|&ch| ch == '}')
                    .ok_or_else(|| syntax(i, "unterminated reference"))?;
                let name: String = chars[i + 2..i + 2 + close].iter().collect();
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(syntax(i, "empty reference"));
                }
                tokens.push((start, Token::Ref(name)));
                i += close + 3;
                continue;
            }
            c if c.is_ascii_digit() || c == '.' => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Exponent: 1e-3, 2.5E6
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse()
                    .map_err(|_| syntax(start, &format!("invalid number '{text}'")))?;
                tokens.push((start, Token::Number(value)));
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
                continue;
            }
            '+' | '-' | '*' | '/' | '^' | '%' => tokens.push((start, Token::Op(c))),
            '(' => tokens.push((start, Token::LParen)),
            ')' => tokens.push((start, Token::RParen)),
            '[' => tokens.push((start, Token::LBracket)),
            ']' => tokens.push((start, Token::RBracket)),
            ',' => tokens.push((start, Token::Comma)),
            other => return Err(syntax(i, &format!("unexpected character '{other}'"))),
        }
        i += 1;
    }

    Ok(tokens)
}

fn syntax(position: usize, message: &str) -> ExprError {
    ExprError::Syntax {
        position,
        message: message.to_string(),
    }
}

// ── AST ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// `${alias}`: a free variable bound to another signal.
    Ref(String),
    /// Bare identifier: `x`, `y`, `z` or a constant.
    Name(String),
    Call { name: String, args: Vec<Expr> },
    Index { target: Box<Expr>, index: Box<Expr> },
    Neg(Box<Expr>),
    Binary { op: char, lhs: Box<Expr>, rhs: Box<Expr> },
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
            depth: 0,
        };
        let expr = parser.expr()?;
        match parser.tokens.get(parser.pos) {
            None => Ok(expr),
            Some((position, token)) => Err(syntax(*position, &format!("unexpected {token:?}"))),
        }
    }

    /// Free variables in first-appearance order, without duplicates.
    pub fn references(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs(&self, out: &mut Vec<String>) {
        match self {
            Expr::Ref(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_refs(out)),
            Expr::Index { target, index } => {
                target.collect_refs(out);
                index.collect_refs(out);
            }
            Expr::Neg(inner) => inner.collect_refs(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_refs(out);
                rhs.collect_refs(out);
            }
            Expr::Number(_) | Expr::Name(_) => {}
        }
    }
}

/// True when `text` should be parsed as an expression rather than used as a
/// bare provider variable name.
pub fn is_expression(text: &str) -> bool {
    text.contains("${")
}

/// Deepest nesting the parser accepts, counting operator chains too.
const MAX_DEPTH: usize = 256;

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(p, _)| *p)
    }

    fn descend(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(syntax(self.position(), "expression nested too deeply"));
        }
        Ok(())
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T, ExprError>) -> Result<T, ExprError> {
        self.descend()?;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        let position = self.position();
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(syntax(position, &format!("expected {expected:?}, found {token:?}"))),
            None => Err(syntax(position, &format!("expected {expected:?}"))),
        }
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.term()?;
        let mut chain = 0;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            let op = *op;
            self.descend()?;
            chain += 1;
            self.pos += 1;
            let rhs = self.term()?;
            lhs = binary(op, lhs, rhs);
        }
        self.depth -= chain;
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        let mut chain = 0;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek() {
            let op = *op;
            self.descend()?;
            chain += 1;
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
        self.depth -= chain;
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                let inner = self.nested(Self::unary)?;
                Ok(Expr::Neg(Box::new(inner)))
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.nested(Self::unary)
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, ExprError> {
        let base = self.postfix()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exponent = self.nested(Self::unary)?;
            return Ok(binary('^', base, exponent));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut target = self.primary()?;
        let mut chain = 0;
        while let Some(Token::LBracket) = self.peek() {
            self.descend()?;
            chain += 1;
            self.pos += 1;
            let index = self.expr()?;
            self.expect(Token::RBracket)?;
            target = Expr::Index {
                target: Box::new(target),
                index: Box::new(index),
            };
        }
        self.depth -= chain;
        Ok(target)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let position = self.position();
        match self.next() {
            Some(Token::Number(v)) => Ok(Expr::Number(v)),
            Some(Token::Ref(name)) => Ok(Expr::Ref(name)),
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.pos += 1;
                    let args = self.nested(Self::arguments)?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Name(name))
                }
            }
            Some(Token::LParen) => self.nested(|parser| {
                let inner = parser.expr()?;
                parser.expect(Token::RParen)?;
                Ok(inner)
            }),
            Some(token) => Err(syntax(position, &format!("unexpected {token:?}"))),
            None => Err(syntax(position, "unexpected end of expression")),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                _ => return Err(syntax(self.position(), "expected ',' or ')'")),
            }
        }
    }
}

fn binary(op: char, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

// ── Evaluation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Array(Vec<f64>),
    Signal(SignalData),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Array(_) => "array",
            Value::Signal(_) => "signal",
        }
    }

    /// The sample values this value carries (a signal's y).
    fn samples(&self) -> &[f64] {
        match self {
            Value::Scalar(v) => std::slice::from_ref(v),
            Value::Array(values) => values,
            Value::Signal(signal) => &signal.y,
        }
    }

    fn map(self, f: impl Fn(f64) -> f64) -> Value {
        match self {
            Value::Scalar(v) => Value::Scalar(f(v)),
            Value::Array(values) => Value::Array(values.into_iter().map(f).collect()),
            Value::Signal(mut signal) => {
                signal.y = signal.y.into_iter().map(f).collect();
                signal.z = None;
                Value::Signal(signal)
            }
        }
    }
}

/// Named values an expression can see.
#[derive(Debug, Default)]
pub struct Scope {
    refs: HashMap<String, Value>,
    names: HashMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a `${name}` reference.
    pub fn bind_ref(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.refs.insert(name.into(), value);
        self
    }

    /// Bind a bare identifier such as `x`.
    pub fn bind_name(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.names.insert(name.into(), value);
        self
    }
}

pub fn evaluate(expr: &Expr, scope: &Scope) -> Result<Value, ExprError> {
    match expr {
        Expr::Number(v) => Ok(Value::Scalar(*v)),
        Expr::Ref(name) => scope
            .refs
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownReference(name.clone())),
        Expr::Name(name) => match scope.names.get(name) {
            Some(value) => Ok(value.clone()),
            None => match name.as_str() {
                "pi" => Ok(Value::Scalar(std::f64::consts::PI)),
                "e" => Ok(Value::Scalar(std::f64::consts::E)),
                _ => Err(ExprError::UnknownName(name.clone())),
            },
        },
        Expr::Neg(inner) => Ok(evaluate(inner, scope)?.map(|v| -v)),
        Expr::Binary { op, lhs, rhs } => {
            let lhs = evaluate(lhs, scope)?;
            let rhs = evaluate(rhs, scope)?;
            apply_binary(*op, lhs, rhs)
        }
        Expr::Index { target, index } => {
            let target = evaluate(target, scope)?;
            let index = match evaluate(index, scope)? {
                Value::Scalar(i) => i,
                other => {
                    return Err(ExprError::Type(format!("index must be a scalar, got {}", other.kind())));
                }
            };
            index_value(&target, index)
        }
        Expr::Call { name, args } => {
            let args = args
                .iter()
                .map(|a| evaluate(a, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, args)
        }
    }
}

fn arith(op: char, a: f64, b: f64) -> f64 {
    match op {
        '+' => a + b,
        '-' => a - b,
        '*' => a * b,
        '/' => a / b,
        '%' => a % b,
        _ => a.powf(b),
    }
}

fn zip_with(op: char, left: &[f64], right: &[f64]) -> Result<Vec<f64>, ExprError> {
    if left.len() != right.len() {
        return Err(ExprError::LengthMismatch {
            op,
            left: left.len(),
            right: right.len(),
        });
    }
    Ok(left.iter().zip(right).map(|(a, b)| arith(op, *a, *b)).collect())
}

fn combine_units(op: char, left: &str, right: &str) -> String {
    if left == right || right.is_empty() {
        left.to_string()
    } else if left.is_empty() {
        right.to_string()
    } else if op == '*' || op == '/' {
        format!("{left}{op}{right}")
    } else {
        left.to_string()
    }
}

fn apply_binary(op: char, lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    match (lhs, rhs) {
        (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(arith(op, a, b))),
        (Value::Scalar(a), other) => Ok(other.map(|b| arith(op, a, b))),
        (other, Value::Scalar(b)) => Ok(other.map(|a| arith(op, a, b))),
        (Value::Array(a), Value::Array(b)) => Ok(Value::Array(zip_with(op, &a, &b)?)),
        (Value::Signal(mut s), Value::Array(b)) => {
            s.y = zip_with(op, &s.y, &b)?;
            s.z = None;
            Ok(Value::Signal(s))
        }
        (Value::Array(a), Value::Signal(mut s)) => {
            s.y = zip_with(op, &a, &s.y)?;
            s.z = None;
            Ok(Value::Signal(s))
        }
        (Value::Signal(mut a), Value::Signal(b)) => {
            a.y = zip_with(op, &a.y, &b.y)?;
            a.y_unit = combine_units(op, &a.y_unit, &b.y_unit);
            a.z = None;
            Ok(Value::Signal(a))
        }
    }
}

fn index_value(target: &Value, index: f64) -> Result<Value, ExprError> {
    let samples = match target {
        Value::Scalar(_) => return Err(ExprError::Type("cannot index a scalar".to_string())),
        other => other.samples(),
    };
    let len = samples.len();
    let i = index.trunc() as i64;
    let resolved = if i < 0 { len as i64 + i } else { i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(ExprError::IndexOutOfRange { index: i, len });
    }
    Ok(Value::Scalar(samples[resolved as usize]))
}

fn reduce(values: &[f64], f: impl Fn(&[f64]) -> f64) -> Value {
    Value::Scalar(if values.is_empty() { f64::NAN } else { f(values) })
}

fn arity(name: &str, expected: &'static str, found: usize) -> ExprError {
    ExprError::Arity {
        name: name.to_string(),
        expected,
        found,
    }
}

fn call(name: &str, mut args: Vec<Value>) -> Result<Value, ExprError> {
    let unary: Option<fn(f64) -> f64> = match name {
        "abs" => Some(f64::abs),
        "sqrt" => Some(f64::sqrt),
        "exp" => Some(f64::exp),
        "ln" => Some(f64::ln),
        "log10" => Some(f64::log10),
        "sin" => Some(f64::sin),
        "cos" => Some(f64::cos),
        "tan" => Some(f64::tan),
        "floor" => Some(f64::floor),
        "ceil" => Some(f64::ceil),
        "round" => Some(f64::round),
        _ => None,
    };
    if let Some(f) = unary {
        if args.len() != 1 {
            return Err(arity(name, "1", args.len()));
        }
        return Ok(args.remove(0).map(f));
    }

    match name {
        "min" | "max" => {
            let pick: fn(f64, f64) -> f64 = if name == "min" { f64::min } else { f64::max };
            match args.len() {
                1 => Ok(reduce(args[0].samples(), |s| {
                    s.iter().copied().fold(s[0], pick)
                })),
                2 => {
                    let rhs = args.remove(1);
                    let lhs = args.remove(0);
                    elementwise2(lhs, rhs, pick)
                }
                _ => Err(arity(name, "1 or 2", args.len())),
            }
        }
        "mean" | "sum" | "first" | "last" | "len" => {
            if args.len() != 1 {
                return Err(arity(name, "1", args.len()));
            }
            let samples = args[0].samples();
            Ok(match name {
                "mean" => reduce(samples, |s| s.iter().sum::<f64>() / s.len() as f64),
                "sum" => Value::Scalar(samples.iter().sum()),
                "first" => reduce(samples, |s| s[0]),
                "last" => reduce(samples, |s| s[s.len() - 1]),
                _ => Value::Scalar(samples.len() as f64),
            })
        }
        "clip" => {
            if args.len() != 3 {
                return Err(arity(name, "3", args.len()));
            }
            let (lo, hi) = match (&args[1], &args[2]) {
                (Value::Scalar(lo), Value::Scalar(hi)) => (*lo, *hi),
                _ => return Err(ExprError::Type("clip bounds must be scalars".to_string())),
            };
            Ok(args.remove(0).map(|v| v.max(lo).min(hi)))
        }
        _ => Err(ExprError::UnknownFunction(name.to_string())),
    }
}

fn elementwise2(lhs: Value, rhs: Value, f: fn(f64, f64) -> f64) -> Result<Value, ExprError> {
    match (lhs, rhs) {
        (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(f(a, b))),
        (Value::Scalar(a), other) => Ok(other.map(|b| f(a, b))),
        (other, Value::Scalar(b)) => Ok(other.map(|a| f(a, b))),
        (lhs, rhs) => {
            let (left, right) = (lhs.samples(), rhs.samples());
            if left.len() != right.len() {
                return Err(ExprError::LengthMismatch {
                    op: ',',
                    left: left.len(),
                    right: right.len(),
                });
            }
            let values: Vec<f64> = left.iter().zip(right).map(|(a, b)| f(*a, *b)).collect();
            Ok(match lhs {
                Value::Signal(mut s) => {
                    s.y = values;
                    s.z = None;
                    Value::Signal(s)
                }
                _ => Value::Array(values),
            })
        }
    }
}
