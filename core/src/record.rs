//! Records and their wire format.
//!
//! A record is a typed bag of field values. The store keeps record bytes
//! opaque behind the [`RecordCodec`] trait so the primary read path and the
//! covering-index reconstruction path go through the same seam; the default
//! codec is bincode over the record value itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::keyexpr::{Column, FieldSource};
use crate::schema::{IndexDef, Schema};
use crate::tuple::Tuple;
use crate::value::Value;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    record_type: String,
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(record_type: impl Into<String>) -> Self { Self { record_type: record_type.into(), fields: BTreeMap::new() } }

    /// Builder-style field assignment.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) { self.fields.insert(name.into(), value.into()); }

    pub fn record_type(&self) -> &str { &self.record_type }

    pub fn field(&self, name: &str) -> Option<&Value> { self.fields.get(name) }

    /// Field access that reports absence as an error.
    pub fn field_required(&self, name: &str) -> Result<&Value, StoreError> {
        self.fields.get(name).ok_or_else(|| {
            StoreError::Expression(crate::error::ExpressionError::FieldNotFound {
                record_type: self.record_type.clone(),
                field: name.to_string(),
            })
        })
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> { self.fields.iter().map(|(k, v)| (k.as_str(), v)) }
}

impl FieldSource for Record {
    fn field_value(&self, name: &str) -> Option<&Value> { self.fields.get(name) }
}

/// Serialization seam for record bytes.
///
/// `reconstruct_from_covering` is an optional capability: codecs that cannot
/// rebuild a record from a covering index entry report so, and the planner
/// will not enumerate covering-only plans for those record types.
pub trait RecordCodec: Send + Sync {
    fn serialize(&self, record: &Record) -> Result<Vec<u8>, StoreError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Record, StoreError>;

    fn supports_reconstruction(&self, _record_type: &str) -> bool { false }

    fn reconstruct_from_covering(
        &self,
        _schema: &Schema,
        index: &IndexDef,
        _key: &Tuple,
        _value: &Tuple,
    ) -> Result<Record, StoreError> {
        Err(StoreError::ReconstructionNotImplemented {
            record_type: index.single_record_type().unwrap_or("<any>").to_string(),
        })
    }
}

/// Default codec: bincode over the record value.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl RecordCodec for BincodeCodec {
    fn serialize(&self, record: &Record) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(record).map_err(|e| StoreError::SerializationFailed(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Record, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::DeserializationFailed(e.to_string()))
    }
}

/// Bincode codec that additionally rebuilds records from covering entries
/// when the index and primary key are plain field concatenations: key
/// elements map back onto the root and primary-key field names, value
/// elements onto the covering field names.
#[derive(Debug, Default, Clone, Copy)]
pub struct FieldwiseCodec;

impl RecordCodec for FieldwiseCodec {
    fn serialize(&self, record: &Record) -> Result<Vec<u8>, StoreError> { BincodeCodec.serialize(record) }

    fn deserialize(&self, bytes: &[u8]) -> Result<Record, StoreError> { BincodeCodec.deserialize(bytes) }

    fn supports_reconstruction(&self, _record_type: &str) -> bool { true }

    fn reconstruct_from_covering(&self, schema: &Schema, index: &IndexDef, key: &Tuple, value: &Tuple) -> Result<Record, StoreError> {
        let record_type = index
            .single_record_type()
            .ok_or_else(|| StoreError::ReconstructionNotImplemented { record_type: "<any>".to_string() })?;
        let rt = schema.record_type(record_type).ok_or_else(|| crate::error::SchemaError::UnknownRecordType(record_type.to_string()))?;

        let mut names: Vec<&str> = Vec::new();
        for expr in [&index.root, rt.primary_key()] {
            let columns = expr
                .flat_columns()
                .ok_or_else(|| StoreError::ReconstructionNotImplemented { record_type: record_type.to_string() })?;
            for c in columns {
                match c {
                    Column::Field(f) => names.push(f),
                    Column::Boundary(..) => {
                        return Err(StoreError::ReconstructionNotImplemented { record_type: record_type.to_string() })
                    }
                }
            }
        }
        let covering = index
            .covering
            .as_ref()
            .and_then(|c| c.flat_columns())
            .ok_or_else(|| StoreError::ReconstructionNotImplemented { record_type: record_type.to_string() })?;

        if key.len() != names.len() || value.len() != covering.len() {
            return Err(StoreError::DeserializationFailed(format!(
                "covering entry shape mismatch for index {}: {} key / {} value elements",
                index.name,
                key.len(),
                value.len()
            )));
        }

        let mut record = Record::new(record_type);
        for (name, element) in names.iter().zip(key.elements()) {
            record.set(*name, element.clone());
        }
        for (column, element) in covering.iter().zip(value.elements()) {
            if let Column::Field(f) = column {
                record.set(*f, element.clone());
            }
        }
        Ok(record)
    }
}
