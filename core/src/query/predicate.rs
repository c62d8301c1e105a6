//! Predicate trees.
//!
//! Queries carry a small boolean tree over record fields, built through the
//! constructor API (there is no textual query language here). The same tree
//! drives both planning and the executor's record-level filter, so every
//! plan's output is re-checked against the predicate it came from.

use serde::{Deserialize, Serialize};

use crate::record::Record;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    StartsWith,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Matches everything
    True,
    Compare { field: String, op: CompareOp, value: Value },
    /// The interval-valued field overlaps the query window `[from, to)`;
    /// either end may be open. A degenerate window (`from == to`) is a point
    /// probe: lo ≤ p < hi.
    Overlaps { field: String, from: Option<Value>, to: Option<Value> },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

/// Entry point of the builder API: `Predicate::field("age").gt(30)`.
pub struct FieldRef(String);

impl Predicate {
    pub fn field(name: impl Into<String>) -> FieldRef { FieldRef(name.into()) }

    pub fn overlaps(field: impl Into<String>, from: Option<Value>, to: Option<Value>) -> Predicate {
        Predicate::Overlaps { field: field.into(), from, to }
    }

    pub fn and(children: impl IntoIterator<Item = Predicate>) -> Predicate { Predicate::And(children.into_iter().collect()) }

    pub fn or(children: impl IntoIterator<Item = Predicate>) -> Predicate { Predicate::Or(children.into_iter().collect()) }

    #[allow(clippy::should_implement_trait)]
    pub fn not(child: Predicate) -> Predicate { Predicate::Not(Box::new(child)) }

    /// Evaluate against a record. Array-valued fields match when any element
    /// does (and for `Ne`, when no element equals the operand), mirroring how
    /// multi-valued index entries fan out.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::True => true,
            Predicate::And(children) => children.iter().all(|c| c.matches(record)),
            Predicate::Or(children) => children.iter().any(|c| c.matches(record)),
            Predicate::Not(child) => !child.matches(record),
            Predicate::Compare { field, op, value } => {
                let actual = record.field(field).unwrap_or(&Value::Null);
                match (actual, op) {
                    (Value::Array(items), CompareOp::Ne) => !items.iter().any(|i| compare_leaf(i, CompareOp::Eq, value)),
                    (Value::Array(items), op) => items.iter().any(|i| compare_leaf(i, *op, value)),
                    (actual, op) => compare_leaf(actual, *op, value),
                }
            }
            Predicate::Overlaps { field, from, to } => {
                let Some(Value::Tuple(pair)) = record.field(field) else { return false };
                let [lo, hi] = pair.as_slice() else { return false };
                if let Some(from) = from {
                    // hi > from
                    if hi.cmp_order(from) != std::cmp::Ordering::Greater {
                        return false;
                    }
                }
                if let Some(to) = to {
                    let point_probe = from.as_ref().map(|f| f.cmp_order(to) == std::cmp::Ordering::Equal).unwrap_or(false);
                    let cmp = lo.cmp_order(to);
                    let ok = if point_probe { cmp != std::cmp::Ordering::Greater } else { cmp == std::cmp::Ordering::Less };
                    if !ok {
                        return false;
                    }
                }
                true
            }
        }
    }
}

fn compare_leaf(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CompareOp::Eq => actual.cmp_order(expected) == Equal,
        CompareOp::Ne => actual.cmp_order(expected) != Equal,
        // Inequalities only relate values of the same type
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            if actual.type_order() != expected.type_order() {
                return false;
            }
            match (op, actual.cmp_order(expected)) {
                (CompareOp::Lt, Less) => true,
                (CompareOp::Le, Less | Equal) => true,
                (CompareOp::Gt, Greater) => true,
                (CompareOp::Ge, Greater | Equal) => true,
                _ => false,
            }
        }
        CompareOp::StartsWith => match (actual, expected) {
            (Value::String(a), Value::String(b)) => a.starts_with(b.as_str()),
            (Value::Bytes(a), Value::Bytes(b)) => a.starts_with(b.as_slice()),
            _ => false,
        },
        CompareOp::Contains => match (actual, expected) {
            (Value::String(a), Value::String(b)) => a.contains(b.as_str()),
            _ => false,
        },
    }
}

impl FieldRef {
    fn cmp(self, op: CompareOp, value: impl Into<Value>) -> Predicate { Predicate::Compare { field: self.0, op, value: value.into() } }

    pub fn eq(self, value: impl Into<Value>) -> Predicate { self.cmp(CompareOp::Eq, value) }

    pub fn ne(self, value: impl Into<Value>) -> Predicate { self.cmp(CompareOp::Ne, value) }

    pub fn lt(self, value: impl Into<Value>) -> Predicate { self.cmp(CompareOp::Lt, value) }

    pub fn le(self, value: impl Into<Value>) -> Predicate { self.cmp(CompareOp::Le, value) }

    pub fn gt(self, value: impl Into<Value>) -> Predicate { self.cmp(CompareOp::Gt, value) }

    pub fn ge(self, value: impl Into<Value>) -> Predicate { self.cmp(CompareOp::Ge, value) }

    pub fn starts_with(self, value: impl Into<Value>) -> Predicate { self.cmp(CompareOp::StartsWith, value) }

    pub fn contains(self, value: impl Into<Value>) -> Predicate { self.cmp(CompareOp::Contains, value) }

    pub fn is_null(self) -> Predicate { self.cmp(CompareOp::Eq, Value::Null) }
}
