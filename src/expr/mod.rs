//! Expressions
//!
//! In-memory expression trees attached to declarations, call inputs, guards
//! and scatter collections. Expressions are written in documents using the
//! WDL surface syntax and parsed on load:
//!
//! ```text
//! x * 2
//! numerator / denominator
//! if defined(threads) then select_first([threads]) else 1
//! "~{sample}.sorted.bam"
//! align.bam
//! ```
//!
//! Dotted identifiers (`align.bam`) name call outputs or pair members;
//! resolution tries the full name first, then shorter prefixes followed by
//! member access.

mod parse;
pub mod stdlib;

use std::fmt;
use std::str::FromStr;

use indexmap::IndexSet;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::env::Bindings;
use crate::error::EvalError;
use crate::value::Value;

pub use stdlib::StdLib;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
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

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 6,
        }
    }
}

const UNARY_PRECEDENCE: u8 = 7;
const PRIMARY_PRECEDENCE: u8 = 8;

/// Piece of a string literal.
#[derive(Debug, Clone, PartialEq)]
pub enum StringPart {
    Text(String),
    /// `~{expr}` or `${expr}`
    Placeholder(Expr),
}

/// An expression tree.
///
/// Serialized as its source text. Deserializes from source text, or from a
/// bare number or boolean as written in YAML.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(into = "String")]
pub enum Expr {
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    String(Vec<StringPart>),
    Ident(String),
    Array(Vec<Expr>),
    Pair(Box<Expr>, Box<Expr>),
    Map(Vec<(Expr, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    IfThenElse {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Index {
        collection: Box<Expr>,
        index: Box<Expr>,
    },
    /// `.left` / `.right` on a computed pair
    Member {
        expr: Box<Expr>,
        member: String,
    },
    Apply {
        function: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn ident(name: impl Into<String>) -> Expr {
        Expr::Ident(name.into())
    }

    /// String literal without placeholders.
    pub fn string(text: impl Into<String>) -> Expr {
        Expr::String(vec![StringPart::Text(text.into())])
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn apply(function: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Apply {
            function: function.into(),
            args,
        }
    }

    /// Parses command text whose only special syntax is `~{expr}`.
    pub fn template(text: &str) -> Result<Expr, String> {
        parse::parse_template(text)
    }

    /// Names referenced by the expression, in first-occurrence order.
    pub fn free_variables(&self) -> Vec<String> {
        let mut names = IndexSet::new();
        self.visit(&mut |e| {
            if let Expr::Ident(name) = e {
                names.insert(name.clone());
            }
        });
        names.into_iter().collect()
    }

    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::String(parts) => parts.iter().for_each(|part| {
                if let StringPart::Placeholder(e) = part {
                    e.visit(f);
                }
            }),
            Expr::Array(items) | Expr::Apply { args: items, .. } => {
                items.iter().for_each(|e| e.visit(f))
            }
            Expr::Pair(left, right)
            | Expr::Binary { left, right, .. }
            | Expr::Index {
                collection: left,
                index: right,
            } => {
                left.visit(f);
                right.visit(f);
            }
            Expr::Map(entries) => entries.iter().for_each(|(k, v)| {
                k.visit(f);
                v.visit(f);
            }),
            Expr::Unary { operand: e, .. } | Expr::Member { expr: e, .. } => e.visit(f),
            Expr::IfThenElse {
                condition,
                then,
                otherwise,
            } => {
                condition.visit(f);
                then.visit(f);
                otherwise.visit(f);
            }
            Expr::Null | Expr::Boolean(_) | Expr::Int(_) | Expr::Float(_) | Expr::Ident(_) => {}
        }
    }

    /// Evaluates the expression against the visible bindings.
    pub fn eval(&self, env: &Bindings<Value>, stdlib: &StdLib) -> Result<Value, EvalError> {
        match self {
            Expr::Null => Ok(Value::Null),
            Expr::Boolean(b) => Ok(Value::Boolean(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(x) => Ok(Value::Float(*x)),
            Expr::String(parts) => {
                let mut text = String::new();
                for part in parts {
                    match part {
                        StringPart::Text(t) => text.push_str(t),
                        StringPart::Placeholder(e) => text.push_str(&e.eval(env, stdlib)?.to_string()),
                    }
                }
                Ok(Value::String(text))
            }
            Expr::Ident(name) => resolve(env, name),
            Expr::Array(items) => items
                .iter()
                .map(|e| e.eval(env, stdlib))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Pair(left, right) => Ok(Value::pair(
                left.eval(env, stdlib)?,
                right.eval(env, stdlib)?,
            )),
            Expr::Map(entries) => entries
                .iter()
                .map(|(k, v)| Ok((k.eval(env, stdlib)?, v.eval(env, stdlib)?)))
                .collect::<Result<Vec<_>, EvalError>>()
                .map(Value::Map),
            Expr::Unary { op, operand } => {
                let value = operand.eval(env, stdlib)?;
                match (op, value) {
                    (UnaryOp::Not, v) => Ok(Value::Boolean(!v.as_bool()?)),
                    (UnaryOp::Negate, Value::Int(i)) => i
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| EvalError::function("-", "integer overflow")),
                    (UnaryOp::Negate, Value::Float(x)) => Ok(Value::Float(-x)),
                    (UnaryOp::Negate, Value::Null) => {
                        Err(EvalError::NullValue(format!("operand of -{}", operand)))
                    }
                    (UnaryOp::Negate, v) => Err(EvalError::mismatch("Int or Float", v.type_name())),
                }
            }
            Expr::Binary {
                op: op @ (BinaryOp::And | BinaryOp::Or),
                left,
                right,
            } => {
                let lhs = left.eval(env, stdlib)?.as_bool()?;
                match (op, lhs) {
                    (BinaryOp::And, false) => Ok(Value::Boolean(false)),
                    (BinaryOp::Or, true) => Ok(Value::Boolean(true)),
                    _ => Ok(Value::Boolean(right.eval(env, stdlib)?.as_bool()?)),
                }
            }
            Expr::Binary { op, left, right } => {
                binary(*op, left.eval(env, stdlib)?, right.eval(env, stdlib)?)
            }
            Expr::IfThenElse {
                condition,
                then,
                otherwise,
            } => {
                if condition.eval(env, stdlib)?.as_bool()? {
                    then.eval(env, stdlib)
                } else {
                    otherwise.eval(env, stdlib)
                }
            }
            Expr::Index { collection, index } => {
                let collection = collection.eval(env, stdlib)?;
                let index = index.eval(env, stdlib)?;
                match collection {
                    Value::Array(items) => {
                        let i = index.as_int()?;
                        usize::try_from(i)
                            .ok()
                            .and_then(|u| items.get(u))
                            .cloned()
                            .ok_or(EvalError::IndexOutOfRange {
                                index: i,
                                len: items.len(),
                            })
                    }
                    Value::Map(entries) => entries
                        .into_iter()
                        .find(|(k, _)| values_equal(k, &index))
                        .map(|(_, v)| v)
                        .ok_or_else(|| EvalError::KeyNotFound(index.to_string())),
                    Value::Null => Err(EvalError::NullValue(format!("indexed value in {}", self))),
                    other => Err(EvalError::mismatch("Array or Map", other.type_name())),
                }
            }
            Expr::Member { expr, member } => member_access(expr.eval(env, stdlib)?, member),
            Expr::Apply { function, args } => {
                let args = args
                    .iter()
                    .map(|e| e.eval(env, stdlib))
                    .collect::<Result<Vec<_>, _>>()?;
                stdlib.apply(function, args)
            }
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::IfThenElse { .. } => 0,
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Unary { .. } => UNARY_PRECEDENCE,
            Expr::Int(i) if *i < 0 => UNARY_PRECEDENCE,
            Expr::Float(x) if x.is_sign_negative() => UNARY_PRECEDENCE,
            _ => PRIMARY_PRECEDENCE,
        }
    }
}

/// Looks up a possibly dotted name. `p.left` resolves to the `left` member
/// of `p` when no binding named `p.left` exists.
fn resolve(env: &Bindings<Value>, name: &str) -> Result<Value, EvalError> {
    if let Some(value) = env.get(name) {
        return Ok(value.clone());
    }
    let parts: Vec<&str> = name.split('.').collect();
    for cut in (1..parts.len()).rev() {
        if let Some(base) = env.get(&parts[..cut].join(".")) {
            return parts[cut..]
                .iter()
                .try_fold(base.clone(), |value, member| member_access(value, member));
        }
    }
    Err(EvalError::UnknownIdentifier(name.to_string()))
}

fn member_access(value: Value, member: &str) -> Result<Value, EvalError> {
    match (value, member) {
        (Value::Pair(left, _), "left") => Ok(*left),
        (Value::Pair(_, right), "right") => Ok(*right),
        (Value::Null, _) => Err(EvalError::NullValue(format!("member .{} of None", member))),
        (other, _) => Err(EvalError::mismatch(
            format!("Pair (for .{})", member),
            other.type_name(),
        )),
    }
}

/// Structural equality with numeric promotion and `String`/`File` equivalence.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        (Value::String(x) | Value::File(x), Value::String(y) | Value::File(y)) => x == y,
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Pair(l1, r1), Value::Pair(l2, r2)) => values_equal(l1, l2) && values_equal(r1, r2),
        (Value::Map(xs), Value::Map(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys)
                    .all(|((k1, v1), (k2, v2))| values_equal(k1, k2) && values_equal(v1, v2))
        }
        _ => a == b,
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, EvalError> {
    use std::cmp::Ordering;

    match op {
        BinaryOp::Eq => return Ok(Value::Boolean(values_equal(&left, &right))),
        BinaryOp::Ne => return Ok(Value::Boolean(!values_equal(&left, &right))),
        _ => {}
    }
    if left.is_null() || right.is_null() {
        return Err(EvalError::NullValue(format!("operand of {}", op.symbol())));
    }

    if matches!(op, BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge) {
        let ordering = match (&left, &right) {
            (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
            (Value::String(x) | Value::File(x), Value::String(y) | Value::File(y)) => Some(x.cmp(y)),
            (Value::Boolean(x), Value::Boolean(y)) => Some(x.cmp(y)),
            _ => left.as_float()?.partial_cmp(&right.as_float()?),
        };
        let holds = match ordering {
            Some(Ordering::Less) => matches!(op, BinaryOp::Lt | BinaryOp::Le),
            Some(Ordering::Equal) => matches!(op, BinaryOp::Le | BinaryOp::Ge),
            Some(Ordering::Greater) => matches!(op, BinaryOp::Gt | BinaryOp::Ge),
            None => false,
        };
        return Ok(Value::Boolean(holds));
    }

    match (op, &left, &right) {
        (BinaryOp::Add, Value::File(l), r) => return Ok(Value::File(format!("{}{}", l, r))),
        (BinaryOp::Add, Value::String(l), r) => return Ok(Value::String(format!("{}{}", l, r))),
        (BinaryOp::Add, l, Value::String(r) | Value::File(r)) => {
            return Ok(Value::String(format!("{}{}", l, r)))
        }
        _ => {}
    }

    match (left, right) {
        (Value::Int(x), Value::Int(y)) => {
            let result = match op {
                BinaryOp::Add => x.checked_add(y),
                BinaryOp::Sub => x.checked_sub(y),
                BinaryOp::Mul => x.checked_mul(y),
                BinaryOp::Div | BinaryOp::Rem if y == 0 => return Err(EvalError::DivisionByZero),
                BinaryOp::Div => x.checked_div(y),
                BinaryOp::Rem => x.checked_rem(y),
                _ => unreachable!("logical and comparison operators handled above"),
            };
            result
                .map(Value::Int)
                .ok_or_else(|| EvalError::function(op.symbol(), "integer overflow"))
        }
        (left, right) => {
            let (x, y) = (left.as_float()?, right.as_float()?);
            let result = match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div | BinaryOp::Rem if y == 0.0 => return Err(EvalError::DivisionByZero),
                BinaryOp::Div => x / y,
                BinaryOp::Rem => x % y,
                _ => unreachable!("logical and comparison operators handled above"),
            };
            Ok(Value::Float(result))
        }
    }
}

impl FromStr for Expr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse::parse(s)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Source {
            Int(i64),
            Float(f64),
            Boolean(bool),
            Text(String),
        }

        match Source::deserialize(deserializer)? {
            Source::Int(i) => Ok(Expr::Int(i)),
            Source::Float(x) => Ok(Expr::Float(x)),
            Source::Boolean(b) => Ok(Expr::Boolean(b)),
            Source::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

impl From<Expr> for String {
    fn from(expr: Expr) -> String {
        expr.to_string()
    }
}

/// Renders a child expression, parenthesized when it binds looser than `min`.
struct Operand<'a>(&'a Expr, u8);

impl fmt::Display for Operand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.precedence() < self.1 {
            write!(f, "({})", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

fn write_list<T>(
    f: &mut fmt::Formatter<'_>,
    items: &[T],
    mut write: impl FnMut(&mut fmt::Formatter<'_>, &T) -> fmt::Result,
) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write(f, item)?;
    }
    Ok(())
}

/// WDL-like source text.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Null => write!(f, "None"),
            Expr::Boolean(b) => write!(f, "{}", b),
            Expr::Int(i) => write!(f, "{}", i),
            Expr::Float(x) => write!(f, "{:?}", x),
            Expr::String(parts) => {
                write!(f, "\"")?;
                for part in parts {
                    match part {
                        StringPart::Text(text) => {
                            let mut chars = text.chars().peekable();
                            while let Some(c) = chars.next() {
                                match c {
                                    '"' => write!(f, "\\\"")?,
                                    '\\' => write!(f, "\\\\")?,
                                    '\n' => write!(f, "\\n")?,
                                    '\t' => write!(f, "\\t")?,
                                    '~' | '$' if chars.peek() == Some(&'{') => write!(f, "\\{}", c)?,
                                    c => write!(f, "{}", c)?,
                                }
                            }
                        }
                        StringPart::Placeholder(e) => write!(f, "~{{{}}}", e)?,
                    }
                }
                write!(f, "\"")
            }
            Expr::Ident(name) => write!(f, "{}", name),
            Expr::Array(items) => {
                write!(f, "[")?;
                write_list(f, items, |f, e| write!(f, "{}", e))?;
                write!(f, "]")
            }
            Expr::Pair(left, right) => write!(f, "({}, {})", left, right),
            Expr::Map(entries) => {
                write!(f, "{{")?;
                write_list(f, entries, |f, (k, v)| write!(f, "{}: {}", k, v))?;
                write!(f, "}}")
            }
            Expr::Unary { op, operand } => {
                let symbol = match op {
                    UnaryOp::Not => "!",
                    UnaryOp::Negate => "-",
                };
                write!(f, "{}{}", symbol, Operand(operand, UNARY_PRECEDENCE))
            }
            Expr::Binary { op, left, right } => write!(
                f,
                "{} {} {}",
                Operand(left, op.precedence()),
                op.symbol(),
                Operand(right, op.precedence() + 1)
            ),
            Expr::IfThenElse {
                condition,
                then,
                otherwise,
            } => write!(f, "if {} then {} else {}", condition, then, otherwise),
            Expr::Index { collection, index } => {
                write!(f, "{}[{}]", Operand(collection, PRIMARY_PRECEDENCE), index)
            }
            Expr::Member { expr, member } => {
                write!(f, "{}.{}", Operand(expr, PRIMARY_PRECEDENCE), member)
            }
            Expr::Apply { function, args } => {
                write!(f, "{}(", function)?;
                write_list(f, args, |f, e| write!(f, "{}", e))?;
                write!(f, ")")
            }
        }
    }
}
