//! Count and sum maintainers.
//!
//! One counter cell per distinct root evaluation, mutated with the KVS's
//! atomic little-endian add so concurrent writers never conflict on the
//! counter itself.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::IndexError;
use crate::index::IndexMaintainer;
use crate::kv::{AtomicOp, KvTransaction};
use crate::record::Record;
use crate::schema::IndexDef;
use crate::subspace::Subspace;
use crate::tuple::Tuple;
use crate::value::Value;

fn add_deltas(
    deltas: &mut HashMap<Vec<u8>, i64>,
    index: &IndexDef,
    subspace: &Subspace,
    record: &Record,
    per_entry: i64,
) -> Result<(), IndexError> {
    for root in index.root.evaluate(record.record_type(), record)? {
        let key = subspace.pack(&root)?;
        *deltas.entry(key).or_insert(0) += per_entry;
    }
    Ok(())
}

fn apply_deltas(txn: &mut dyn KvTransaction, deltas: HashMap<Vec<u8>, i64>) {
    for (key, delta) in deltas {
        if delta != 0 {
            txn.atomic_op(&key, &delta.to_le_bytes(), AtomicOp::Add);
        }
    }
}

/// Read an aggregate cell; absent cells read as zero.
pub async fn read_aggregate(txn: &mut dyn KvTransaction, subspace: &Subspace, group: &Tuple) -> Result<i64, IndexError> {
    let key = subspace.pack(group)?;
    match txn.get(&key, false).await? {
        None => Ok(0),
        Some(bytes) => {
            let mut buf = [0u8; 8];
            let n = bytes.len().min(8);
            buf[..n].copy_from_slice(&bytes[..n]);
            Ok(i64::from_le_bytes(buf))
        }
    }
}

pub struct CountMaintainer {
    index: IndexDef,
    subspace: Subspace,
}

impl CountMaintainer {
    pub fn new(index: IndexDef, subspace: Subspace) -> Self { Self { index, subspace } }
}

#[async_trait]
impl IndexMaintainer for CountMaintainer {
    async fn update(&self, txn: &mut dyn KvTransaction, _pk: &Tuple, old: Option<&Record>, new: Option<&Record>) -> Result<(), IndexError> {
        let mut deltas = HashMap::new();
        if let Some(r) = old {
            add_deltas(&mut deltas, &self.index, &self.subspace, r, -1)?;
        }
        if let Some(r) = new {
            add_deltas(&mut deltas, &self.index, &self.subspace, r, 1)?;
        }
        apply_deltas(txn, deltas);
        Ok(())
    }

    async fn scan_record(&self, txn: &mut dyn KvTransaction, record: &Record, _pk: &Tuple) -> Result<(), IndexError> {
        let mut deltas = HashMap::new();
        add_deltas(&mut deltas, &self.index, &self.subspace, record, 1)?;
        apply_deltas(txn, deltas);
        Ok(())
    }

    fn subspace(&self) -> &Subspace { &self.subspace }
}

pub struct SumMaintainer {
    index: IndexDef,
    field: String,
    subspace: Subspace,
}

impl SumMaintainer {
    pub fn new(index: IndexDef, field: String, subspace: Subspace) -> Self { Self { index, field, subspace } }

    /// The summed field must be an integer; absent or null reads as zero.
    fn summand(&self, record: &Record) -> Result<i64, IndexError> {
        match record.field(&self.field) {
            None | Some(Value::Null) => Ok(0),
            Some(Value::Int(n)) => Ok(*n),
            Some(other) => Err(IndexError::InvalidArgument(format!(
                "sum index {} expects an integer in field {}, found {}",
                self.index.name, self.field, other
            ))),
        }
    }
}

#[async_trait]
impl IndexMaintainer for SumMaintainer {
    async fn update(&self, txn: &mut dyn KvTransaction, _pk: &Tuple, old: Option<&Record>, new: Option<&Record>) -> Result<(), IndexError> {
        let mut deltas = HashMap::new();
        if let Some(r) = old {
            add_deltas(&mut deltas, &self.index, &self.subspace, r, -self.summand(r)?)?;
        }
        if let Some(r) = new {
            add_deltas(&mut deltas, &self.index, &self.subspace, r, self.summand(r)?)?;
        }
        apply_deltas(txn, deltas);
        Ok(())
    }

    async fn scan_record(&self, txn: &mut dyn KvTransaction, record: &Record, _pk: &Tuple) -> Result<(), IndexError> {
        let mut deltas = HashMap::new();
        add_deltas(&mut deltas, &self.index, &self.subspace, record, self.summand(record)?)?;
        apply_deltas(txn, deltas);
        Ok(())
    }

    fn subspace(&self) -> &Subspace { &self.subspace }
}
