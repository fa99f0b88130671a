//! Safe evaluation of branch and loop expressions.
//!
//! The grammar is deliberately closed: arithmetic, comparison, boolean logic,
//! and member/index access into a fixed variable namespace supplied per call
//! site. There is no assignment, no call syntax, and no way to reach outside
//! the scope handed to [`CompiledExpr::eval`]. Expressions compile once into
//! an AST and are reused across iterations.

mod token;

use serde_json::{Number, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use token::{tokenize, Spanned, Token};

#[derive(Debug, Error)]
pub enum ExprError {
    /// The expression text is not part of the grammar.
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    /// The expression referenced a name or path absent from the namespace.
    #[error("undefined reference: {0}")]
    UndefinedReference(String),

    /// Operand types do not fit the operator.
    #[error("type error: {0}")]
    Type(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// The closed variable namespace an expression is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: BTreeMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

/// An expression compiled once and evaluated many times.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    source: String,
    ast: Expr,
}

impl CompiledExpr {
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser::new(&tokens, source.len());
        let ast = parser.parse_expr()?;
        parser.expect_end()?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, scope: &Scope) -> Result<Value, ExprError> {
        eval_expr(&self.ast, scope)
    }

    /// Evaluates and requires a boolean result, as branch and loop stop
    /// conditions do.
    pub fn eval_bool(&self, scope: &Scope) -> Result<bool, ExprError> {
        match self.eval(scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::Type(format!(
                "expression '{}' produced {} where a boolean was required",
                self.source,
                type_name(&other)
            ))),
        }
    }
}

struct Parser<'a> {
    tokens: &'a [Spanned],
    pos: usize,
    end_offset: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Spanned], end_offset: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            end_offset,
        }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn next(&mut self) -> Option<&'a Spanned> {
        let spanned = self.tokens.get(self.pos);
        if spanned.is_some() {
            self.pos += 1;
        }
        spanned
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|s| s.offset)
            .unwrap_or(self.end_offset)
    }

    fn syntax(&self, message: impl Into<String>) -> ExprError {
        ExprError::Syntax {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExprError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.syntax(format!("expected {}", what)))
        }
    }

    fn expect_end(&mut self) -> Result<(), ExprError> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(self.syntax("unexpected trailing input"))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.parse_equality()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::NotEq,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.next().map(|s| s.token.clone()) {
                    Some(Token::Ident(name)) => {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                    _ => return Err(self.syntax("expected member name after '.'")),
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_expr()?;
                self.expect(Token::RBracket, "']'")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let spanned = match self.next() {
            Some(s) => s.clone(),
            None => return Err(self.syntax("unexpected end of expression")),
        };
        match spanned.token {
            Token::Int(n) => Ok(Expr::Literal(Value::Number(n.into()))),
            Token::Float(f) => match Number::from_f64(f) {
                Some(n) => Ok(Expr::Literal(Value::Number(n))),
                None => Err(ExprError::Syntax {
                    offset: spanned.offset,
                    message: "non-finite number literal".to_string(),
                }),
            },
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => Ok(Expr::Var(name)),
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            other => Err(ExprError::Syntax {
                offset: spanned.offset,
                message: format!("unexpected token {:?}", other),
            }),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Best-effort textual path for undefined-reference messages.
fn path_of(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Var(name) => Some(name.clone()),
        Expr::Member(base, name) => Some(format!("{}.{}", path_of(base)?, name)),
        Expr::Index(base, index) => match index.as_ref() {
            Expr::Literal(Value::Number(n)) => Some(format!("{}[{}]", path_of(base)?, n)),
            Expr::Literal(Value::String(s)) => Some(format!("{}.{}", path_of(base)?, s)),
            _ => path_of(base),
        },
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn number(value: f64) -> Result<Value, ExprError> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| ExprError::Type("arithmetic produced a non-finite number".to_string()))
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (as_f64(left), as_f64(right)) {
        (Some(a), Some(b)) if left.is_number() && right.is_number() => a == b,
        _ => left == right,
    }
}

fn eval_expr(expr: &Expr, scope: &Scope) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),

        Expr::Var(name) => scope
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UndefinedReference(name.clone())),

        Expr::Member(base, name) => {
            let value = eval_expr(base, scope)?;
            match value {
                Value::Object(map) => map.get(name).cloned().ok_or_else(|| {
                    ExprError::UndefinedReference(
                        path_of(expr).unwrap_or_else(|| name.clone()),
                    )
                }),
                other => Err(ExprError::Type(format!(
                    "cannot access member '{}' on {}",
                    name,
                    type_name(&other)
                ))),
            }
        }

        Expr::Index(base, index) => {
            let value = eval_expr(base, scope)?;
            let key = eval_expr(index, scope)?;
            match (&value, &key) {
                (Value::Array(items), Value::Number(n)) => {
                    let idx = n.as_u64().ok_or_else(|| {
                        ExprError::Type("array index must be a non-negative integer".to_string())
                    })? as usize;
                    items.get(idx).cloned().ok_or_else(|| {
                        ExprError::UndefinedReference(
                            path_of(expr).unwrap_or_else(|| format!("[{}]", idx)),
                        )
                    })
                }
                (Value::Object(map), Value::String(name)) => {
                    map.get(name).cloned().ok_or_else(|| {
                        ExprError::UndefinedReference(
                            path_of(expr).unwrap_or_else(|| name.clone()),
                        )
                    })
                }
                (other, key) => Err(ExprError::Type(format!(
                    "cannot index {} with {}",
                    type_name(other),
                    type_name(key)
                ))),
            }
        }

        Expr::Not(inner) => match eval_expr(inner, scope)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(ExprError::Type(format!(
                "'!' requires a boolean, got {}",
                type_name(&other)
            ))),
        },

        Expr::Neg(inner) => {
            let value = eval_expr(inner, scope)?;
            if let Some(n) = value.as_i64().and_then(i64::checked_neg) {
                return Ok(Value::Number(n.into()));
            }
            match as_f64(&value) {
                Some(f) if value.is_number() => number(-f),
                _ => Err(ExprError::Type(format!(
                    "unary '-' requires a number, got {}",
                    type_name(&value)
                ))),
            }
        }

        Expr::Binary(op, left, right) => eval_binary(*op, left, right, scope),
    }
}

fn eval_binary(op: BinOp, left: &Expr, right: &Expr, scope: &Scope) -> Result<Value, ExprError> {
    // Boolean operators short-circuit.
    if matches!(op, BinOp::And | BinOp::Or) {
        let lhs = match eval_expr(left, scope)? {
            Value::Bool(b) => b,
            other => {
                return Err(ExprError::Type(format!(
                    "boolean operator requires booleans, got {}",
                    type_name(&other)
                )))
            }
        };
        match (op, lhs) {
            (BinOp::And, false) => return Ok(Value::Bool(false)),
            (BinOp::Or, true) => return Ok(Value::Bool(true)),
            _ => {}
        }
        return match eval_expr(right, scope)? {
            Value::Bool(b) => Ok(Value::Bool(b)),
            other => Err(ExprError::Type(format!(
                "boolean operator requires booleans, got {}",
                type_name(&other)
            ))),
        };
    }

    let lhs = eval_expr(left, scope)?;
    let rhs = eval_expr(right, scope)?;

    match op {
        BinOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
        BinOp::NotEq => Ok(Value::Bool(!values_equal(&lhs, &rhs))),

        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (&lhs, &rhs) {
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                _ if lhs.is_number() && rhs.is_number() => {
                    as_f64(&lhs).unwrap().partial_cmp(&as_f64(&rhs).unwrap())
                }
                _ => {
                    return Err(ExprError::Type(format!(
                        "cannot compare {} with {}",
                        type_name(&lhs),
                        type_name(&rhs)
                    )))
                }
            };
            let ordering = ordering
                .ok_or_else(|| ExprError::Type("incomparable values".to_string()))?;
            let result = match op {
                BinOp::Lt => ordering == std::cmp::Ordering::Less,
                BinOp::Le => ordering != std::cmp::Ordering::Greater,
                BinOp::Gt => ordering == std::cmp::Ordering::Greater,
                BinOp::Ge => ordering != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }

        BinOp::Add => match (&lhs, &rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            _ if lhs.is_number() && rhs.is_number() => {
                match (lhs.as_i64(), rhs.as_i64()) {
                    (Some(a), Some(b)) => match a.checked_add(b) {
                        Some(n) => Ok(Value::Number(n.into())),
                        None => number(a as f64 + b as f64),
                    },
                    _ => number(as_f64(&lhs).unwrap() + as_f64(&rhs).unwrap()),
                }
            }
            _ => Err(ExprError::Type(format!(
                "cannot add {} and {}",
                type_name(&lhs),
                type_name(&rhs)
            ))),
        },

        BinOp::Sub | BinOp::Mul => {
            if !(lhs.is_number() && rhs.is_number()) {
                return Err(ExprError::Type(format!(
                    "arithmetic requires numbers, got {} and {}",
                    type_name(&lhs),
                    type_name(&rhs)
                )));
            }
            if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
                let result = match op {
                    BinOp::Sub => a.checked_sub(b),
                    BinOp::Mul => a.checked_mul(b),
                    _ => unreachable!(),
                };
                match result {
                    Some(n) => Ok(Value::Number(n.into())),
                    None => number(match op {
                        BinOp::Sub => as_f64(&lhs).unwrap() - as_f64(&rhs).unwrap(),
                        BinOp::Mul => as_f64(&lhs).unwrap() * as_f64(&rhs).unwrap(),
                        _ => unreachable!(),
                    }),
                }
            } else {
                number(match op {
                    BinOp::Sub => as_f64(&lhs).unwrap() - as_f64(&rhs).unwrap(),
                    BinOp::Mul => as_f64(&lhs).unwrap() * as_f64(&rhs).unwrap(),
                    _ => unreachable!(),
                })
            }
        }

        BinOp::Div => {
            if !(lhs.is_number() && rhs.is_number()) {
                return Err(ExprError::Type(format!(
                    "arithmetic requires numbers, got {} and {}",
                    type_name(&lhs),
                    type_name(&rhs)
                )));
            }
            let divisor = as_f64(&rhs).unwrap();
            if divisor == 0.0 {
                return Err(ExprError::Type("division by zero".to_string()));
            }
            number(as_f64(&lhs).unwrap() / divisor)
        }

        BinOp::Rem => match (lhs.as_i64(), rhs.as_i64()) {
            (Some(_), Some(0)) => Err(ExprError::Type("remainder by zero".to_string())),
            (Some(a), Some(b)) => Ok(Value::Number((a % b).into())),
            _ => Err(ExprError::Type(
                "'%' requires integer operands".to_string(),
            )),
        },

        BinOp::And | BinOp::Or => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(src: &str, scope: &Scope) -> Result<Value, ExprError> {
        CompiledExpr::compile(src)?.eval(scope)
    }

    #[test]
    fn arithmetic_and_precedence() {
        let scope = Scope::new();
        assert_eq!(eval("1 + 2 * 3", &scope).unwrap(), json!(7));
        assert_eq!(eval("(1 + 2) * 3", &scope).unwrap(), json!(9));
        assert_eq!(eval("7 % 3", &scope).unwrap(), json!(1));
        assert_eq!(eval("5 / 2", &scope).unwrap(), json!(2.5));
        assert_eq!(eval("-4 + 1", &scope).unwrap(), json!(-3));
    }

    #[test]
    fn iteration_stop_condition() {
        let expr = CompiledExpr::compile("iteration >= 3").unwrap();
        for (iteration, expected) in [(1, false), (2, false), (3, true), (4, true)] {
            let scope = Scope::new().with("iteration", json!(iteration));
            assert_eq!(expr.eval_bool(&scope).unwrap(), expected);
        }
    }

    #[test]
    fn boolean_logic_short_circuits() {
        // The right side would be an undefined reference; && must not reach it.
        let scope = Scope::new().with("flag", json!(false));
        assert_eq!(
            eval("flag && missing > 1", &scope).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(eval("!flag || missing > 1", &scope).unwrap(), Value::Bool(true));
    }

    #[test]
    fn member_and_index_access() {
        let scope = Scope::new().with(
            "context",
            json!({"n1": {"items": [10, 20, 30], "name": "alpha"}}),
        );
        assert_eq!(eval("context.n1.items[1]", &scope).unwrap(), json!(20));
        assert_eq!(
            eval("context.n1.name == 'alpha'", &scope).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn undefined_reference_is_distinct_from_syntax_error() {
        let scope = Scope::new().with("input", json!({}));
        match eval("input.missing", &scope) {
            Err(ExprError::UndefinedReference(path)) => assert_eq!(path, "input.missing"),
            other => panic!("expected undefined reference, got {:?}", other),
        }
        assert!(matches!(
            CompiledExpr::compile("1 +"),
            Err(ExprError::Syntax { .. })
        ));
        assert!(matches!(
            CompiledExpr::compile("a b"),
            Err(ExprError::Syntax { .. })
        ));
    }

    #[test]
    fn numeric_cross_type_equality() {
        let scope = Scope::new().with("x", json!(1.0));
        assert_eq!(eval("x == 1", &scope).unwrap(), Value::Bool(true));
    }

    #[test]
    fn non_boolean_condition_is_a_type_error() {
        let expr = CompiledExpr::compile("1 + 1").unwrap();
        assert!(matches!(
            expr.eval_bool(&Scope::new()),
            Err(ExprError::Type(_))
        ));
    }

    #[test]
    fn division_by_zero_fails() {
        assert!(matches!(
            eval("1 / 0", &Scope::new()),
            Err(ExprError::Type(_))
        ));
    }
}
