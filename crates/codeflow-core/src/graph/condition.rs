//! Condition expressions evaluated against a run context.
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := operand ( ( "==" | "!=" | "<" | "<=" | ">" | ">=" | "contains" ) operand )?
//! operand := string | number | "true" | "false" | "null" | path | "(" or ")"
//! path    := ident ( "." ident )*
//! ```
//!
//! Paths look up (nested) keys in the context; a missing key reads as `null`.
//! A value used as a boolean must actually be a boolean.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use crate::types::RunContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Contains => "contains",
        };
        f.write_str(s)
    }
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, String> {
        parse(source)
    }

    /// Evaluate to a boolean.
    pub fn eval(&self, ctx: &RunContext) -> Result<bool, String> {
        match self.value(ctx)? {
            Value::Bool(b) => Ok(b),
            other => Err(format!("expected a boolean, got {}", type_name(&other))),
        }
    }

    fn value(&self, ctx: &RunContext) -> Result<Value, String> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Path(segments) => Ok(lookup(ctx, segments)),
            Self::Not(inner) => Ok(Value::Bool(!inner.eval(ctx)?)),
            Self::And(l, r) => Ok(Value::Bool(l.eval(ctx)? && r.eval(ctx)?)),
            Self::Or(l, r) => Ok(Value::Bool(l.eval(ctx)? || r.eval(ctx)?)),
            Self::Compare(l, op, r) => {
                let left = l.value(ctx)?;
                let right = r.value(ctx)?;
                compare(&left, *op, &right).map(Value::Bool)
            }
        }
    }
}

/// Parse and evaluate `source` against `ctx`.
pub fn evaluate(source: &str, ctx: &RunContext) -> Result<bool, String> {
    parse(source)?.eval(ctx)
}

/// Deepest nesting of parentheses and `!` a condition may use.
const MAX_NESTING: usize = 32;
/// Longest condition, in tokens.
const MAX_TOKENS: usize = 512;

pub(crate) fn parse(source: &str) -> Result<Expr, String> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    if tokens.len() > MAX_TOKENS {
        return Err(format!("expression longer than {MAX_TOKENS} tokens"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(tok) => Err(format!("unexpected {tok} after expression")),
    }
}

fn lookup(ctx: &RunContext, segments: &[String]) -> Value {
    let Some((first, rest)) = segments.split_first() else {
        return Value::Null;
    };
    let mut current = match ctx.get(first) {
        Some(v) => v,
        None => return Value::Null,
    };
    for segment in rest {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> Result<bool, String> {
    match op {
        CompareOp::Eq => Ok(values_equal(left, right)),
        CompareOp::Ne => Ok(!values_equal(left, right)),
        CompareOp::Contains => match (left, right) {
            (Value::String(hay), Value::String(needle)) => Ok(hay.contains(needle.as_str())),
            (Value::Array(items), needle) => Ok(items.iter().any(|i| values_equal(i, needle))),
            (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
            (Value::Null, _) => Ok(false),
            (l, r) => Err(format!(
                "cannot test whether {} contains {}",
                type_name(l),
                type_name(r)
            )),
        },
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    let (a, b) = (number(a)?, number(b)?);
                    a.partial_cmp(&b).ok_or("numbers are not comparable")?
                }
                (Value::String(a), Value::String(b)) => a.cmp(b),
                (l, r) => {
                    return Err(format!(
                        "cannot order {} {op} {}",
                        type_name(l),
                        type_name(r)
                    ))
                }
            };
            Ok(match op {
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Le => ordering != Ordering::Greater,
                CompareOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
    }
}

// 1 == 1.0 should hold, which plain `Value` equality does not give.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn number(n: &serde_json::Number) -> Result<f64, String> {
    n.as_f64().ok_or_else(|| format!("number {n} is out of range"))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(serde_json::Number),
    Op(&'static str),
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "'{s}'"),
            Self::Str(s) => write!(f, "string \"{s}\""),
            Self::Num(n) => write!(f, "number {n}"),
            Self::Op(op) => write!(f, "'{op}'"),
            Self::LParen => f.write_str("'('"),
            Self::RParen => f.write_str("')'"),
        }
    }
}

const OPERATORS: [&str; 9] = ["==", "!=", "<=", ">=", "&&", "||", "<", ">", "!"];

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    'outer: while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
                continue;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
                continue;
            }
            '"' | '\'' => {
                let (s, next) = read_string(&chars, i)?;
                tokens.push(Token::Str(s));
                i = next;
                continue;
            }
            _ => {}
        }

        let starts_number = c.is_ascii_digit()
            || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()));
        if starts_number {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let num: serde_json::Number = text
                .parse()
                .map_err(|_| format!("invalid number '{text}'"))?;
            tokens.push(Token::Num(num));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        for op in OPERATORS {
            let len = op.len();
            if i + len <= chars.len() && chars[i..i + len].iter().copied().eq(op.chars()) {
                tokens.push(Token::Op(op));
                i += len;
                continue 'outer;
            }
        }

        return Err(format!("unexpected character '{c}' at offset {i}"));
    }

    Ok(tokens)
}

fn read_string(chars: &[char], start: usize) -> Result<(String, usize), String> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| "unterminated escape in string".to_string())?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err("unterminated string literal".to_string())
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

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut left = self.and()?;
        while self.eat_op("||") {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while self.eat_op("&&") {
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    /// Parse `f` one nesting level down.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, String>) -> Result<T, String> {
        if self.depth >= MAX_NESTING {
            return Err(format!("expression nested deeper than {MAX_NESTING} levels"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat_op("!") {
            let inner = self.nested(Self::unary)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, String> {
        let left = self.operand()?;
        let op = match self.peek() {
            Some(Token::Op("==")) => CompareOp::Eq,
            Some(Token::Op("!=")) => CompareOp::Ne,
            Some(Token::Op("<")) => CompareOp::Lt,
            Some(Token::Op("<=")) => CompareOp::Le,
            Some(Token::Op(">")) => CompareOp::Gt,
            Some(Token::Op(">=")) => CompareOp::Ge,
            Some(Token::Ident(word)) if word == "contains" => CompareOp::Contains,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.operand()?;
        Ok(Expr::Compare(Box::new(left), op, Box::new(right)))
    }

    fn operand(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "contains" => Err("'contains' needs a left-hand operand".to_string()),
                _ => path(&word),
            },
            Some(Token::LParen) => {
                let inner = self.nested(Self::or)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(tok) => Err(format!("expected ')', found {tok}")),
                    None => Err("missing ')'".to_string()),
                }
            }
            Some(tok) => Err(format!("unexpected {tok}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn path(word: &str) -> Result<Expr, String> {
    let segments: Vec<String> = word.split('.').map(str::to_string).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(format!("invalid path '{word}'"));
    }
    Ok(Expr::Path(segments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> RunContext {
        match value {
            Value::Object(map) => map,
            _ => panic!("context must be an object"),
        }
    }

    #[test]
    fn test_comparisons() {
        let c = ctx(json!({"env": "prod", "coverage": 82.5, "retries": 2}));
        assert!(evaluate("env == 'prod'", &c).unwrap());
        assert!(evaluate("env != \"staging\"", &c).unwrap());
        assert!(evaluate("coverage >= 80", &c).unwrap());
        assert!(!evaluate("retries > 2", &c).unwrap());
        assert!(evaluate("retries == 2.0", &c).unwrap());
    }

    #[test]
    fn test_boolean_logic_and_precedence() {
        let c = ctx(json!({"approved": true, "blocked": false, "n": 3}));
        assert!(evaluate("approved && !blocked", &c).unwrap());
        assert!(evaluate("blocked || n < 5 && approved", &c).unwrap());
        assert!(!evaluate("(blocked || n < 5) && !approved", &c).unwrap());
    }

    #[test]
    fn test_nested_paths_and_missing_keys() {
        let c = ctx(json!({"pr": {"labels": ["bug", "urgent"], "author": {"name": "sam"}}}));
        assert!(evaluate("pr.labels contains 'urgent'", &c).unwrap());
        assert!(evaluate("pr.author.name == 'sam'", &c).unwrap());
        assert!(evaluate("pr.labels.0 == 'bug'", &c).unwrap());
        assert!(evaluate("pr.reviewer == null", &c).unwrap());
        assert!(!evaluate("missing contains 'x'", &c).unwrap());
    }

    #[test]
    fn test_type_mismatch_is_an_error() {
        let c = ctx(json!({"count": 3, "name": "x"}));
        assert!(evaluate("count", &c).is_err());
        assert!(evaluate("name < 3", &c).is_err());
        assert!(evaluate("!name", &c).is_err());
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "a ==", "(a == 1", "a == 1 b", "a @ b", "'open", "contains x"] {
            assert!(Expr::parse(bad).is_err(), "expected parse error for {bad:?}");
        }
    }

    #[test]
    fn test_nesting_is_capped() {
        let c = ctx(json!({"ready": true}));
        let shallow = format!("{}ready{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(evaluate(&shallow, &c).unwrap());
        assert!(evaluate(&format!("{}ready", "!".repeat(MAX_NESTING)), &c).unwrap());

        let deep = format!("{}ready{}", "(".repeat(10_000), ")".repeat(10_000));
        let err = Expr::parse(&deep).unwrap_err();
        assert!(err.contains("longer than"), "{err}");
        let deep = format!("{}ready{}", "(".repeat(MAX_NESTING + 1), ")".repeat(MAX_NESTING + 1));
        let err = Expr::parse(&deep).unwrap_err();
        assert!(err.contains("nested deeper"), "{err}");
        let err = Expr::parse(&format!("{}ready", "!".repeat(MAX_NESTING + 1))).unwrap_err();
        assert!(err.contains("nested deeper"), "{err}");
    }
}
