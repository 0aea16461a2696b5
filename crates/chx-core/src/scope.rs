//! Inclusion scope predicates.
//!
//! A scope decides whether a backing row is eligible for an active hash at
//! all. It is a plain expression tree so the same value can be evaluated
//! against an in-memory row here and rendered to SQL by chx-db.
//!
//! Evaluation follows SQL three-valued logic: a comparison involving NULL is
//! unknown (`None`), `Not(unknown)` stays unknown, and a row is in scope only
//! when the predicate is definitely true. Strict comparisons are strict at
//! the boundary: `gt accuracy 90` excludes a row whose accuracy is exactly 90,
//! on every code path.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Literal compared against a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for ScopeValue {
    fn from(v: bool) -> Self {
        ScopeValue::Bool(v)
    }
}

impl From<i64> for ScopeValue {
    fn from(v: i64) -> Self {
        ScopeValue::Int(v)
    }
}

impl From<i32> for ScopeValue {
    fn from(v: i32) -> Self {
        ScopeValue::Int(v as i64)
    }
}

impl From<f64> for ScopeValue {
    fn from(v: f64) -> Self {
        ScopeValue::Float(v)
    }
}

impl From<&str> for ScopeValue {
    fn from(v: &str) -> Self {
        ScopeValue::Text(v.to_string())
    }
}

impl From<String> for ScopeValue {
    fn from(v: String) -> Self {
        ScopeValue::Text(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    /// SQL operator token.
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
        }
    }

    fn holds(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Gte => ord != Ordering::Less,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Lte => ord != Ordering::Greater,
        }
    }
}

/// Boolean expression over a row's columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Compare {
        column: String,
        op: CompareOp,
        value: ScopeValue,
    },
    IsNull {
        column: String,
    },
    NotNull {
        column: String,
    },
    In {
        column: String,
        values: Vec<ScopeValue>,
    },
    All(Vec<Scope>),
    Any(Vec<Scope>),
    Not(Box<Scope>),
}

impl Scope {
    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<ScopeValue>) -> Self {
        Scope::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn equals(column: impl Into<String>, value: impl Into<ScopeValue>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<ScopeValue>) -> Self {
        Self::compare(column, CompareOp::Gt, value)
    }

    pub fn gte(column: impl Into<String>, value: impl Into<ScopeValue>) -> Self {
        Self::compare(column, CompareOp::Gte, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<ScopeValue>) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Scope::IsNull {
            column: column.into(),
        }
    }

    pub fn not_null(column: impl Into<String>) -> Self {
        Scope::NotNull {
            column: column.into(),
        }
    }

    pub fn one_of<V: Into<ScopeValue>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Scope::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn and(self, other: Scope) -> Self {
        match self {
            Scope::All(mut parts) => {
                parts.push(other);
                Scope::All(parts)
            }
            s => Scope::All(vec![s, other]),
        }
    }

    pub fn negate(self) -> Self {
        Scope::Not(Box::new(self))
    }

    /// Columns referenced anywhere in the tree (sorted, unique).
    pub fn columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_columns(&self, out: &mut Vec<String>) {
        match self {
            Scope::Compare { column, .. }
            | Scope::IsNull { column }
            | Scope::NotNull { column }
            | Scope::In { column, .. } => out.push(column.clone()),
            Scope::All(parts) | Scope::Any(parts) => {
                for p in parts {
                    p.collect_columns(out);
                }
            }
            Scope::Not(inner) => inner.collect_columns(out),
        }
    }

    /// Three-valued evaluation against a row (column name -> JSON value).
    /// Absent columns are treated as NULL.
    pub fn evaluate(&self, row: &Map<String, Value>) -> Option<bool> {
        match self {
            Scope::Compare { column, op, value } => {
                let cell = non_null(row, column)?;
                compare_cell(cell, value).map(|ord| op.holds(ord))
            }
            Scope::IsNull { column } => Some(non_null(row, column).is_none()),
            Scope::NotNull { column } => Some(non_null(row, column).is_some()),
            Scope::In { column, values } => {
                let cell = non_null(row, column)?;
                let mut unknown = false;
                for v in values {
                    match compare_cell(cell, v) {
                        Some(Ordering::Equal) => return Some(true),
                        Some(_) => {}
                        None => unknown = true,
                    }
                }
                if unknown {
                    None
                } else {
                    Some(false)
                }
            }
            Scope::All(parts) => {
                let mut unknown = false;
                for p in parts {
                    match p.evaluate(row) {
                        Some(false) => return Some(false),
                        Some(true) => {}
                        None => unknown = true,
                    }
                }
                if unknown {
                    None
                } else {
                    Some(true)
                }
            }
            Scope::Any(parts) => {
                let mut unknown = false;
                for p in parts {
                    match p.evaluate(row) {
                        Some(true) => return Some(true),
                        Some(false) => {}
                        None => unknown = true,
                    }
                }
                if unknown {
                    None
                } else {
                    Some(false)
                }
            }
            Scope::Not(inner) => inner.evaluate(row).map(|b| !b),
        }
    }

    /// `true` only when the predicate is definitely true for `row`.
    pub fn matches(&self, row: &Map<String, Value>) -> bool {
        self.evaluate(row) == Some(true)
    }
}

fn non_null<'a>(row: &'a Map<String, Value>, column: &str) -> Option<&'a Value> {
    match row.get(column) {
        None | Some(Value::Null) => None,
        Some(v) => Some(v),
    }
}

/// Orders a row cell against a literal. `None` when the types are not
/// comparable.
fn compare_cell(cell: &Value, literal: &ScopeValue) -> Option<Ordering> {
    match (cell, literal) {
        (Value::Bool(a), ScopeValue::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), ScopeValue::Int(b)) => match a.as_i64() {
            Some(ai) => Some(ai.cmp(b)),
            None => a.as_f64()?.partial_cmp(&(*b as f64)),
        },
        (Value::Number(a), ScopeValue::Float(b)) => a.as_f64()?.partial_cmp(b),
        (Value::String(a), ScopeValue::Text(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}
