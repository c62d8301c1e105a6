//! Schema: the registry of record types and index definitions.
//!
//! A schema is immutable once built; migrations construct a replacement.
//! Construction validates every expression against the declared fields and
//! caches the per-type affected-index list the store consults on each write.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{ExpressionError, SchemaError, StoreError};
use crate::keyexpr::{BoundarySide, Column, KeyExpression};
use crate::record::Record;
use crate::tuple::Tuple;
use crate::value::{Value, ValueType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    pub ordinal: u32,
    pub value_type: ValueType,
    pub default: Option<Value>,
    /// Transient fields are serialized but never indexed
    pub transient: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordType {
    name: String,
    primary_key: KeyExpression,
    fields: Vec<FieldMeta>,
}

impl RecordType {
    pub fn new(name: impl Into<String>, primary_key: KeyExpression) -> Self {
        Self { name: name.into(), primary_key, fields: Vec::new() }
    }

    pub fn field(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        let ordinal = self.fields.len() as u32;
        self.fields.push(FieldMeta { name: name.into(), ordinal, value_type, default: None, transient: false });
        self
    }

    pub fn field_with_default(mut self, name: impl Into<String>, value_type: ValueType, default: impl Into<Value>) -> Self {
        let ordinal = self.fields.len() as u32;
        self.fields.push(FieldMeta { name: name.into(), ordinal, value_type, default: Some(default.into()), transient: false });
        self
    }

    pub fn transient_field(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        let ordinal = self.fields.len() as u32;
        self.fields.push(FieldMeta { name: name.into(), ordinal, value_type, default: None, transient: true });
        self
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn primary_key(&self) -> &KeyExpression { &self.primary_key }

    pub fn fields(&self) -> &[FieldMeta] { &self.fields }

    pub fn field_meta(&self, name: &str) -> Option<&FieldMeta> { self.fields.iter().find(|f| f.name == name) }

    /// Number of tuple elements in this type's primary keys.
    pub fn primary_key_columns(&self) -> usize { self.primary_key.scalar_column_count() }
}

/// Distance metric for vector indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
    Dot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorOptions {
    pub dimensions: usize,
    pub metric: DistanceMetric,
    /// Max neighbors per node on upper layers
    pub m: usize,
    /// Max neighbors per node on the ground layer
    pub m0: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl VectorOptions {
    pub fn new(dimensions: usize, metric: DistanceMetric) -> Self {
        Self { dimensions, metric, m: 16, m0: 32, ef_construction: 100, ef_search: 64 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialOptions {
    /// Quadtree cell level, 1..=30 (2 bits per level)
    pub level: u8,
    /// Pack a normalized altitude above the cell bits
    pub geo3d: bool,
    pub min_altitude: f64,
    pub max_altitude: f64,
}

impl SpatialOptions {
    pub fn level(level: u8) -> Self { Self { level, geo3d: false, min_altitude: 0.0, max_altitude: 0.0 } }

    pub fn geo3d(level: u8, min_altitude: f64, max_altitude: f64) -> Self {
        Self { level, geo3d: true, min_altitude, max_altitude }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexKind {
    Value,
    Covering,
    Unique,
    Count,
    Sum { field: String },
    Spatial(SpatialOptions),
    Vector(VectorOptions),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub kind: IndexKind,
    pub root: KeyExpression,
    /// Extra fields stored in the entry value (Covering kind only)
    pub covering: Option<KeyExpression>,
    /// Record types this index applies to; None means all
    pub record_types: Option<BTreeSet<String>>,
}

impl IndexDef {
    pub fn value(name: impl Into<String>, root: KeyExpression) -> Self {
        Self { name: name.into(), kind: IndexKind::Value, root, covering: None, record_types: None }
    }

    pub fn covering(name: impl Into<String>, root: KeyExpression, covering: KeyExpression) -> Self {
        Self { name: name.into(), kind: IndexKind::Covering, root, covering: Some(covering), record_types: None }
    }

    pub fn unique(name: impl Into<String>, root: KeyExpression) -> Self {
        Self { name: name.into(), kind: IndexKind::Unique, root, covering: None, record_types: None }
    }

    pub fn count(name: impl Into<String>, root: KeyExpression) -> Self {
        Self { name: name.into(), kind: IndexKind::Count, root, covering: None, record_types: None }
    }

    pub fn sum(name: impl Into<String>, root: KeyExpression, field: impl Into<String>) -> Self {
        Self { name: name.into(), kind: IndexKind::Sum { field: field.into() }, root, covering: None, record_types: None }
    }

    pub fn spatial(name: impl Into<String>, root: KeyExpression, options: SpatialOptions) -> Self {
        Self { name: name.into(), kind: IndexKind::Spatial(options), root, covering: None, record_types: None }
    }

    pub fn vector(name: impl Into<String>, root: KeyExpression, options: VectorOptions) -> Self {
        Self { name: name.into(), kind: IndexKind::Vector(options), root, covering: None, record_types: None }
    }

    /// Restrict the index to the given record types.
    pub fn for_types(mut self, types: impl IntoIterator<Item = &'static str>) -> Self {
        self.record_types = Some(types.into_iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn applies_to(&self, record_type: &str) -> bool {
        match &self.record_types {
            None => true,
            Some(set) => set.contains(record_type),
        }
    }

    /// The one record type this index applies to, when the filter names
    /// exactly one (required for covering reconstruction).
    pub fn single_record_type(&self) -> Option<&str> {
        match &self.record_types {
            Some(set) if set.len() == 1 => set.iter().next().map(|s| s.as_str()),
            _ => None,
        }
    }

    /// True when the root is a lower/upper boundary pair over one field —
    /// the shape interval statistics and overlap planning key off.
    pub fn is_interval(&self) -> bool {
        match self.root.flat_columns().as_deref() {
            Some([Column::Boundary(a, BoundarySide::Lower), Column::Boundary(b, BoundarySide::Upper)]) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    version: u32,
    types: BTreeMap<String, RecordType>,
    indexes: BTreeMap<String, IndexDef>,
    // Cached affected-index lists, one per record type
    by_type: BTreeMap<String, Vec<String>>,
}

impl Schema {
    pub fn builder(version: u32) -> SchemaBuilder { SchemaBuilder { version, types: Vec::new(), indexes: Vec::new() } }

    pub fn version(&self) -> u32 { self.version }

    pub fn record_type(&self, name: &str) -> Option<&RecordType> { self.types.get(name) }

    pub fn record_types(&self) -> impl Iterator<Item = &RecordType> { self.types.values() }

    pub fn index(&self, name: &str) -> Option<&IndexDef> { self.indexes.get(name) }

    pub fn indexes(&self) -> impl Iterator<Item = &IndexDef> { self.indexes.values() }

    pub fn index_names(&self) -> Vec<&str> { self.indexes.keys().map(|s| s.as_str()).collect() }

    /// Indexes maintained for records of the given type.
    pub fn indexes_for(&self, record_type: &str) -> Vec<&IndexDef> {
        match self.by_type.get(record_type) {
            Some(names) => names.iter().filter_map(|n| self.indexes.get(n)).collect(),
            None => Vec::new(),
        }
    }

    /// Evaluate the record's primary key expression; fan-out is not allowed
    /// in primary keys.
    pub fn primary_key(&self, record: &Record) -> Result<Tuple, StoreError> {
        let rt = self
            .record_type(record.record_type())
            .ok_or_else(|| SchemaError::UnknownRecordType(record.record_type().to_string()))?;
        let mut outputs = rt.primary_key.evaluate(rt.name(), record)?;
        if outputs.len() != 1 {
            return Err(ExpressionError::MultiValuedPrimaryKey(outputs.len()).into());
        }
        Ok(outputs.remove(0))
    }
}

pub struct SchemaBuilder {
    version: u32,
    types: Vec<RecordType>,
    indexes: Vec<IndexDef>,
}

impl SchemaBuilder {
    pub fn record_type(mut self, rt: RecordType) -> Self {
        self.types.push(rt);
        self
    }

    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        let mut types = BTreeMap::new();
        for rt in self.types {
            if rt.primary_key == KeyExpression::Empty || rt.primary_key.scalar_column_count() == 0 {
                return Err(SchemaError::MissingPrimaryKey(rt.name.clone()));
            }
            validate_expression(&rt.primary_key, &rt, &rt.name)?;
            if types.insert(rt.name.clone(), rt.clone()).is_some() {
                return Err(SchemaError::DuplicateRecordType(rt.name));
            }
        }

        let mut indexes = BTreeMap::new();
        let mut by_type: BTreeMap<String, Vec<String>> = types.keys().map(|t| (t.clone(), Vec::new())).collect();
        for index in self.indexes {
            validate_index(&index, &types)?;
            for (type_name, rt) in &types {
                if index.applies_to(type_name) {
                    validate_expression(&index.root, rt, &index.name)?;
                    if let Some(covering) = &index.covering {
                        validate_expression(covering, rt, &index.name)?;
                    }
                    by_type.get_mut(type_name).map(|v| v.push(index.name.clone()));
                }
            }
            if indexes.insert(index.name.clone(), index.clone()).is_some() {
                return Err(SchemaError::DuplicateIndex(index.name));
            }
        }

        Ok(Schema { version: self.version, types, indexes, by_type })
    }
}

fn validate_expression(expr: &KeyExpression, rt: &RecordType, label: &str) -> Result<(), SchemaError> {
    for field in expr.referenced_fields() {
        match rt.field_meta(field) {
            None => return Err(SchemaError::UnknownField { index: label.to_string(), field: field.to_string() }),
            Some(meta) if meta.transient => {
                return Err(SchemaError::InvalidIndex {
                    index: label.to_string(),
                    reason: format!("field {} is transient", field),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn validate_index(index: &IndexDef, types: &BTreeMap<String, RecordType>) -> Result<(), SchemaError> {
    if let Some(filter) = &index.record_types {
        for t in filter {
            if !types.contains_key(t) {
                return Err(SchemaError::UnknownRecordType(t.clone()));
            }
        }
    }
    let invalid = |reason: String| SchemaError::InvalidIndex { index: index.name.clone(), reason };
    match &index.kind {
        IndexKind::Covering => {
            if index.covering.is_none() {
                return Err(invalid("covering index without covering fields".into()));
            }
        }
        IndexKind::Sum { field } => {
            for (type_name, rt) in types {
                if index.applies_to(type_name) && rt.field_meta(field).is_none() {
                    return Err(SchemaError::UnknownField { index: index.name.clone(), field: field.clone() });
                }
            }
        }
        IndexKind::Spatial(opts) => {
            if opts.level == 0 || opts.level > 30 {
                return Err(invalid(format!("cell level {} out of range 1..=30", opts.level)));
            }
            if opts.geo3d {
                if opts.level > 18 {
                    return Err(invalid("geo3d cell level must leave altitude bits (max 18)".into()));
                }
                if !(opts.max_altitude > opts.min_altitude) {
                    return Err(invalid("geo3d altitude range is empty".into()));
                }
            }
        }
        IndexKind::Vector(opts) => {
            if opts.dimensions == 0 {
                return Err(invalid("vector index needs a dimension count".into()));
            }
            if opts.m == 0 || opts.m0 < opts.m {
                return Err(invalid("vector index needs 0 < m <= m0".into()));
            }
        }
        IndexKind::Value | IndexKind::Unique | IndexKind::Count => {}
    }
    if index.covering.is_some() && !matches!(index.kind, IndexKind::Covering) {
        return Err(invalid("covering fields are only valid on covering indexes".into()));
    }
    Ok(())
}
