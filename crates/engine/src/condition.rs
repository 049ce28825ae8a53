//! Comparison expressions for conditional connections and condition nodes.
//!
//! Grammar: `operand [op operand]`, with `op` one of `== != > < >= <=`.
//! An operand is a `${...}` template, a quoted string, `true`/`false`/`null`,
//! a number, or a bare word (taken as a string). Nothing else is evaluated.

use std::cmp::Ordering;
use std::fmt;

use serde_json::{Number, Value};

use crate::resolver::Template;
use crate::state::ExecutionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Template(Template),
    Literal(Value),
}

impl Operand {
    fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("missing operand".to_string());
        }

        for quote in ['"', '\''] {
            if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
                return Ok(Self::Literal(Value::String(text[1..text.len() - 1].to_string())));
            }
        }

        if text.contains("${") {
            let template = Template::parse(text);
            if template.has_references() {
                return Ok(Self::Template(template));
            }
        }

        let literal = match text {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" => Value::Null,
            _ => parse_number(text).unwrap_or_else(|| Value::String(text.to_string())),
        };
        Ok(Self::Literal(literal))
    }

    /// `None` when a reference cannot be resolved.
    fn value(&self, state: &ExecutionState) -> Option<Value> {
        match self {
            Self::Literal(v) => Some(v.clone()),
            Self::Template(t) => t.render(state).ok(),
        }
    }
}

fn parse_number(text: &str) -> Option<Value> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
        .map(Value::Number)
}

/// A parsed condition, ready to evaluate against any state.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    left: Operand,
    comparison: Option<(CompareOp, Operand)>,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, String> {
        if source.trim().is_empty() {
            return Err("empty expression".to_string());
        }

        let operators = find_operators(source)?;
        let condition = match operators.as_slice() {
            [] => Self {
                source: source.to_string(),
                left: Operand::parse(source)?,
                comparison: None,
            },
            [(pos, op)] => {
                let (lhs, rhs) = (&source[..*pos], &source[pos + op.symbol().len()..]);
                Self {
                    source: source.to_string(),
                    left: Operand::parse(lhs).map_err(|e| format!("{e} before '{op}'"))?,
                    comparison: Some((
                        *op,
                        Operand::parse(rhs).map_err(|e| format!("{e} after '{op}'"))?,
                    )),
                }
            }
            _ => return Err("only a single comparison operator is supported".to_string()),
        };
        Ok(condition)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `state`. Any unresolved reference makes the whole
    /// condition false.
    pub fn evaluate(&self, state: &ExecutionState) -> bool {
        let Some(left) = self.left.value(state) else {
            return false;
        };
        let Some((op, right)) = &self.comparison else {
            return truthy(&left);
        };
        let Some(right) = right.value(state) else {
            return false;
        };
        compare(&left, *op, &right)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Locate comparison operators outside of `${...}` and quoted strings.
fn find_operators(source: &str) -> Result<Vec<(usize, CompareOp)>, String> {
    let bytes = source.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut in_reference = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();

        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        if in_reference {
            if b == b'}' {
                in_reference = false;
            }
            i += 1;
            continue;
        }

        let (op, width) = match (b, next) {
            (b'"' | b'\'', _) => {
                quote = Some(b);
                (None, 1)
            }
            (b'$', Some(b'{')) => {
                in_reference = true;
                (None, 2)
            }
            (b'=', Some(b'=')) => (Some(CompareOp::Eq), 2),
            (b'!', Some(b'=')) => (Some(CompareOp::Ne), 2),
            (b'>', Some(b'=')) => (Some(CompareOp::Ge), 2),
            (b'<', Some(b'=')) => (Some(CompareOp::Le), 2),
            (b'>', _) => (Some(CompareOp::Gt), 1),
            (b'<', _) => (Some(CompareOp::Lt), 1),
            (b'=', _) => return Err(format!("unexpected '=' at offset {i}; use '=='")),
            _ => (None, 1),
        };

        if let Some(op) = op {
            found.push((i, op));
        }
        i += width;
    }

    if quote.is_some() {
        return Err("unterminated string literal".to_string());
    }
    Ok(found)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return match l.partial_cmp(&r) {
            Some(ordering) => ordering_holds(ordering, op),
            None => false,
        };
    }

    let equal = match (left, right) {
        (Value::Bool(l), Value::Bool(r)) => l == r,
        (Value::Bool(_), _) | (_, Value::Bool(_)) => false,
        (Value::String(l), Value::String(r)) => l == r,
        (l, r) => l == r,
    };

    match op {
        CompareOp::Eq => equal,
        CompareOp::Ne => !equal,
        _ => false,
    }
}

fn ordering_holds(ordering: Ordering, op: CompareOp) -> bool {
    match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
    }
}
