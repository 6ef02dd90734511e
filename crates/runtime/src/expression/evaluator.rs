//! Reference expression evaluator
//!
//! A small recursive-descent language over JSON values:
//!
//! ```text
//! or      := and (("||" | "or") and)*
//! and     := not (("&&" | "and") not)*
//! not     := ("!" | "not") not | cmp
//! cmp     := sum (("==" | "!=" | "<" | "<=" | ">" | ">=" | "in" | "not in") sum)?
//! sum     := product (("+" | "-") product)*
//! product := unary (("*" | "/" | "%") unary)*
//! unary   := "-" unary | postfix
//! postfix := primary ("." IDENT | "[" or "]")*
//! primary := NUMBER | STRING | true | false | null | IDENT | "(" or ")" | "[" list "]"
//! ```
//!
//! Missing names, fields and indexes read as `null`.

use serde_json::{Number, Value};

use super::{truthy, ExpressionError, ExpressionEvaluator};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Number),
    Str(String),
    Ident(String),
    Dot,
    Comma,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eof,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LeftParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LeftBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RightBracket);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".into()),
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| "dangling escape".to_string())?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                let mut is_float = false;
                while let Some(ch) = chars.get(i) {
                    if ch.is_ascii_digit() {
                        i += 1;
                    } else if *ch == '.'
                        && !is_float
                        && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())
                    {
                        is_float = true;
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let number = if is_float {
                    text.parse::<f64>()
                        .ok()
                        .and_then(Number::from_f64)
                        .ok_or_else(|| format!("invalid number '{}'", text))?
                } else {
                    text.parse::<i64>()
                        .map(Number::from)
                        .map_err(|_| format!("invalid number '{}'", text))?
                };
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|ch| ch.is_alphanumeric() || *ch == '_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Name(String),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn parse(src: &str) -> Result<Expr, String> {
        let mut parser = Parser {
            tokens: tokenize(src)?,
            position: 0,
        };
        if parser.peek() == &Token::Eof {
            return Err("empty expression".into());
        }
        let expr = parser.parse_or()?;
        match parser.peek() {
            Token::Eof => Ok(expr),
            other => Err(format!("unexpected token {:?}", other)),
        }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.position + offset)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        self.position += 1;
        token
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Token::Ident(name) if name == word)
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        let token = self.advance();
        if token == expected {
            Ok(())
        } else {
            Err(format!("expected {:?}, found {:?}", expected, token))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == &Token::Or || self.is_keyword("or") {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_not()?;
        while self.peek() == &Token::And || self.is_keyword("and") {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.peek() == &Token::Not || self.is_keyword("not") {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_sum()?;
        let op = match self.peek() {
            Token::Eq => BinaryOp::Eq,
            Token::Ne => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            Token::Ident(w) if w == "in" => BinaryOp::In,
            Token::Ident(w)
                if w == "not" && matches!(self.peek_at(1), Token::Ident(n) if n == "in") =>
            {
                BinaryOp::NotIn
            }
            _ => return Ok(left),
        };
        if op == BinaryOp::NotIn {
            self.advance();
        }
        self.advance();
        let right = self.parse_sum()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_sum(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_product()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_product(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == &Token::Minus {
            self.advance();
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    match self.advance() {
                        Token::Ident(name) => expr = Expr::Field(Box::new(expr), name),
                        Token::Number(n) => {
                            let index = Expr::Literal(Value::Number(n));
                            expr = Expr::Index(Box::new(expr), Box::new(index));
                        }
                        other => {
                            return Err(format!(
                                "expected field name after '.', found {:?}",
                                other
                            ))
                        }
                    }
                }
                Token::LeftBracket => {
                    self.advance();
                    let index = self.parse_or()?;
                    self.expect(Token::RightBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(name) => Ok(match name.as_str() {
                "true" | "True" => Expr::Literal(Value::Bool(true)),
                "false" | "False" => Expr::Literal(Value::Bool(false)),
                "null" | "None" => Expr::Literal(Value::Null),
                _ => Expr::Name(name),
            }),
            Token::LeftParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RightParen)?;
                Ok(inner)
            }
            Token::LeftBracket => {
                let mut items = Vec::new();
                if self.peek() != &Token::RightBracket {
                    loop {
                        items.push(self.parse_or()?);
                        if self.peek() == &Token::Comma {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RightBracket)?;
                Ok(Expr::List(items))
            }
            Token::Eof => Err("unexpected end of expression".into()),
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(op: BinaryOp, a: &Value, b: &Value) -> Result<bool, String> {
    let ordering = match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .ok_or_else(|| "numbers are not comparable".to_string())?,
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => {
            return Err(format!(
                "cannot order {} and {}",
                crate::outcome::typename_of(a),
                crate::outcome::typename_of(b)
            ))
        }
    };
    Ok(match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, String> {
    match (haystack, needle) {
        (Value::Array(items), _) => Ok(items.iter().any(|item| loose_eq(item, needle))),
        (Value::String(s), Value::String(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        (Value::Null, _) => Ok(false),
        _ => Err(format!(
            "'in' is not supported for {} in {}",
            crate::outcome::typename_of(needle),
            crate::outcome::typename_of(haystack)
        )),
    }
}

fn arithmetic(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, String> {
    match (op, a, b) {
        (BinaryOp::Add, Value::String(x), Value::String(y)) => {
            Ok(Value::String(format!("{}{}", x, y)))
        }
        (BinaryOp::Add, Value::Array(x), Value::Array(y)) => {
            Ok(Value::Array(x.iter().chain(y.iter()).cloned().collect()))
        }
        (_, Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                let exact = match op {
                    BinaryOp::Add => x.checked_add(y),
                    BinaryOp::Sub => x.checked_sub(y),
                    BinaryOp::Mul => x.checked_mul(y),
                    BinaryOp::Rem if y != 0 => x.checked_rem(y),
                    _ => None,
                };
                if let Some(n) = exact {
                    return Ok(Value::from(n));
                }
            }
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            if matches!(op, BinaryOp::Div | BinaryOp::Rem) && y == 0.0 {
                return Err("division by zero".into());
            }
            let result = match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div => x / y,
                _ => x % y,
            };
            Number::from_f64(result)
                .map(Value::Number)
                .ok_or_else(|| "result is not a finite number".to_string())
        }
        _ => Err(format!(
            "unsupported operand types {} and {}",
            crate::outcome::typename_of(a),
            crate::outcome::typename_of(b)
        )),
    }
}

fn index(target: &Value, key: &Value) -> Value {
    match (target, key) {
        (Value::Object(map), Value::String(k)) => map.get(k).cloned().unwrap_or(Value::Null),
        (Value::Array(items), Value::Number(n)) => {
            let Some(i) = n.as_i64() else {
                return Value::Null;
            };
            let len = items.len() as i64;
            let i = if i < 0 { len + i } else { i };
            if (0..len).contains(&i) {
                items[i as usize].clone()
            } else {
                Value::Null
            }
        }
        _ => Value::Null,
    }
}

fn evaluate(expr: &Expr, bindings: &Value) -> Result<Value, String> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Name(name) => Ok(bindings.get(name).cloned().unwrap_or(Value::Null)),
        Expr::Field(target, name) => {
            let target = evaluate(target, bindings)?;
            Ok(target.get(name).cloned().unwrap_or(Value::Null))
        }
        Expr::Index(target, key) => {
            let target = evaluate(target, bindings)?;
            let key = evaluate(key, bindings)?;
            Ok(index(&target, &key))
        }
        Expr::List(items) => items
            .iter()
            .map(|item| evaluate(item, bindings))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&evaluate(inner, bindings)?))),
        Expr::Neg(inner) => match evaluate(inner, bindings)? {
            Value::Number(n) => {
                if let Some(i) = n.as_i64().and_then(i64::checked_neg) {
                    Ok(Value::from(i))
                } else {
                    Number::from_f64(-n.as_f64().unwrap_or(f64::NAN))
                        .map(Value::Number)
                        .ok_or_else(|| "cannot negate".to_string())
                }
            }
            other => Err(format!(
                "cannot negate {}",
                crate::outcome::typename_of(&other)
            )),
        },
        Expr::And(left, right) => {
            let left = evaluate(left, bindings)?;
            if truthy(&left) {
                evaluate(right, bindings)
            } else {
                Ok(left)
            }
        }
        Expr::Or(left, right) => {
            let left = evaluate(left, bindings)?;
            if truthy(&left) {
                Ok(left)
            } else {
                evaluate(right, bindings)
            }
        }
        Expr::Binary(op, left, right) => {
            let a = evaluate(left, bindings)?;
            let b = evaluate(right, bindings)?;
            match op {
                BinaryOp::Eq => Ok(Value::Bool(loose_eq(&a, &b))),
                BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&a, &b))),
                BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                    compare(*op, &a, &b).map(Value::Bool)
                }
                BinaryOp::In => contains(&b, &a).map(Value::Bool),
                BinaryOp::NotIn => contains(&b, &a).map(|found| Value::Bool(!found)),
                _ => arithmetic(*op, &a, &b),
            }
        }
    }
}

/// Evaluator for the built-in `${{ }}` expression language
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateEvaluator;

impl TemplateEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for TemplateEvaluator {
    fn validate(&self, expr: &str) -> Result<(), ExpressionError> {
        Parser::parse(expr)
            .map(|_| ())
            .map_err(|message| ExpressionError::Syntax {
                expr: expr.to_string(),
                message,
            })
    }

    fn eval(&self, expr: &str, bindings: &Value) -> Result<Value, ExpressionError> {
        let ast = Parser::parse(expr).map_err(|message| ExpressionError::Syntax {
            expr: expr.to_string(),
            message,
        })?;
        evaluate(&ast, bindings).map_err(|message| ExpressionError::Eval {
            expr: expr.to_string(),
            message,
        })
    }
}
