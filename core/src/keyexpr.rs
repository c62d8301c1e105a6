//! Key expressions: how a record turns into tuple elements.
//!
//! An expression is a small tree evaluated against a record to produce one or
//! more tuples. Most expressions produce exactly one; a field holding an
//! array fans out to one tuple per element, and every downstream consumer
//! (index maintainers, primary keys) deals in the fan-out list.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ExpressionError;
use crate::tuple::Tuple;
use crate::value::Value;

/// Which end of a two-element interval value a boundary expression extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundarySide {
    Lower,
    Upper,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeyExpression {
    /// A named field of the record
    Field(String),
    /// Children evaluated left to right, outputs concatenated (cross product
    /// under fan-out)
    Concat(Vec<KeyExpression>),
    /// Evaluate `child` against the map value held by field `parent`
    Nest { parent: String, child: Box<KeyExpression> },
    /// A constant element
    Literal(Value),
    /// Zero columns
    Empty,
    /// One end of an interval-valued field
    Boundary { field: String, side: BoundarySide },
}

/// Anything a key expression can read fields out of.
pub trait FieldSource {
    fn field_value(&self, name: &str) -> Option<&Value>;
}

impl FieldSource for BTreeMap<String, Value> {
    fn field_value(&self, name: &str) -> Option<&Value> { self.get(name) }
}

impl KeyExpression {
    pub fn field(name: impl Into<String>) -> Self { KeyExpression::Field(name.into()) }

    pub fn concat(children: impl IntoIterator<Item = KeyExpression>) -> Self { KeyExpression::Concat(children.into_iter().collect()) }

    /// Concatenation of plain fields, the common compound-index shape.
    pub fn fields(names: impl IntoIterator<Item = &'static str>) -> Self {
        KeyExpression::Concat(names.into_iter().map(KeyExpression::field).collect())
    }

    pub fn nest(parent: impl Into<String>, child: KeyExpression) -> Self {
        KeyExpression::Nest { parent: parent.into(), child: Box::new(child) }
    }

    pub fn literal(value: impl Into<Value>) -> Self { KeyExpression::Literal(value.into()) }

    pub fn boundary_lower(field: impl Into<String>) -> Self { KeyExpression::Boundary { field: field.into(), side: BoundarySide::Lower } }

    pub fn boundary_upper(field: impl Into<String>) -> Self { KeyExpression::Boundary { field: field.into(), side: BoundarySide::Upper } }

    /// Shorthand for the interval-index root: lower boundary then upper.
    pub fn interval(field: &str) -> Self {
        KeyExpression::Concat(vec![KeyExpression::boundary_lower(field), KeyExpression::boundary_upper(field)])
    }

    /// Evaluate against a record, producing the fan-out list of tuples.
    /// `record_type` is only used to label errors.
    pub fn evaluate(&self, record_type: &str, source: &dyn FieldSource) -> Result<Vec<Tuple>, ExpressionError> {
        match self {
            KeyExpression::Field(name) => Ok(fan_out_field(source.field_value(name))),
            KeyExpression::Literal(v) => Ok(vec![Tuple::from_values(vec![v.clone()])]),
            KeyExpression::Empty => Ok(vec![Tuple::new()]),
            KeyExpression::Boundary { field, side } => {
                let bound = match source.field_value(field) {
                    None | Some(Value::Null) => Value::Null,
                    Some(Value::Tuple(pair)) if pair.len() == 2 => match side {
                        BoundarySide::Lower => pair[0].clone(),
                        BoundarySide::Upper => pair[1].clone(),
                    },
                    Some(_) => return Err(ExpressionError::NotAnInterval { field: field.clone() }),
                };
                Ok(vec![Tuple::from_values(vec![bound])])
            }
            KeyExpression::Concat(children) => {
                let mut outputs = vec![Tuple::new()];
                for child in children {
                    let child_outputs = child.evaluate(record_type, source)?;
                    let mut next = Vec::with_capacity(outputs.len() * child_outputs.len());
                    for prefix in &outputs {
                        for suffix in &child_outputs {
                            next.push(prefix.clone().concat(suffix));
                        }
                    }
                    outputs = next;
                }
                Ok(outputs)
            }
            KeyExpression::Nest { parent, child } => match source.field_value(parent) {
                Some(Value::Map(inner)) => child.evaluate(record_type, inner),
                Some(Value::Array(items)) => {
                    // One fan-out branch per nested map element
                    let mut outputs = Vec::new();
                    for item in items {
                        match item {
                            Value::Map(inner) => outputs.extend(child.evaluate(record_type, inner)?),
                            _ => outputs.extend(child.evaluate(record_type, &BTreeMap::new())?),
                        }
                    }
                    Ok(outputs)
                }
                _ => child.evaluate(record_type, &BTreeMap::new()),
            },
        }
    }

    /// Top-level field names this expression reads.
    pub fn referenced_fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            KeyExpression::Field(name) => out.push(name),
            KeyExpression::Boundary { field, .. } => out.push(field),
            KeyExpression::Nest { parent, .. } => out.push(parent),
            KeyExpression::Concat(children) => {
                for c in children {
                    c.collect_fields(out);
                }
            }
            KeyExpression::Literal(_) | KeyExpression::Empty => {}
        }
    }

    /// Number of tuple elements each evaluation output carries, assuming all
    /// referenced fields are scalar. Array-typed fields do not change the
    /// per-output width, only the number of outputs.
    pub fn scalar_column_count(&self) -> usize {
        match self {
            KeyExpression::Field(_) | KeyExpression::Literal(_) | KeyExpression::Boundary { .. } => 1,
            KeyExpression::Empty => 0,
            KeyExpression::Concat(children) => children.iter().map(|c| c.scalar_column_count()).sum(),
            KeyExpression::Nest { child, .. } => child.scalar_column_count(),
        }
    }

    /// The flat column list when this expression is a field/boundary prefix
    /// shape the planner can match against (None for literals, nesting or
    /// empty segments).
    pub fn flat_columns(&self) -> Option<Vec<Column<'_>>> {
        let mut out = Vec::new();
        if self.collect_columns(&mut out) {
            Some(out)
        } else {
            None
        }
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<Column<'a>>) -> bool {
        match self {
            KeyExpression::Field(name) => {
                out.push(Column::Field(name));
                true
            }
            KeyExpression::Boundary { field, side } => {
                out.push(Column::Boundary(field, *side));
                true
            }
            KeyExpression::Concat(children) => children.iter().all(|c| c.collect_columns(out)),
            _ => false,
        }
    }
}

/// One planner-visible column of an index root expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Column<'a> {
    Field(&'a str),
    Boundary(&'a str, BoundarySide),
}

fn fan_out_field(value: Option<&Value>) -> Vec<Tuple> {
    match value {
        None => vec![Tuple::from_values(vec![Value::Null])],
        Some(Value::Array(items)) => items.iter().map(|v| Tuple::from_values(vec![v.clone()])).collect(),
        Some(v) => vec![Tuple::from_values(vec![v.clone()])],
    }
}
