//! Value, covering and unique maintainers.
//!
//! Entry shape: key = indexSubspace ∥ pack(rootEval ∥ primaryKey), value =
//! empty (value/unique) or the packed covering fields (covering). Updates
//! apply only the symmetric difference of the old and new entry multisets,
//! so untouched entries generate no writes or conflicts.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::IndexError;
use crate::index::IndexMaintainer;
use crate::kv::{KvTransaction, RangeOptions, KeySelector};
use crate::record::Record;
use crate::schema::{IndexDef, IndexKind};
use crate::subspace::Subspace;
use crate::tuple::Tuple;

/// The (packed key → packed value) map an index holds for one record image.
pub(crate) fn entry_map(index: &IndexDef, subspace: &Subspace, record: &Record, pk: &Tuple) -> Result<HashMap<Vec<u8>, Vec<u8>>, IndexError> {
    let roots = index.root.evaluate(record.record_type(), record)?;
    let value_bytes = match (&index.kind, &index.covering) {
        (IndexKind::Covering, Some(covering)) => {
            let mut outputs = covering.evaluate(record.record_type(), record)?;
            if outputs.len() != 1 {
                return Err(IndexError::InvalidArgument(format!(
                    "covering fields of index {} fanned out to {} tuples",
                    index.name,
                    outputs.len()
                )));
            }
            outputs.remove(0).pack()?
        }
        _ => Vec::new(),
    };

    let mut entries = HashMap::with_capacity(roots.len());
    for root in roots {
        let key = subspace.pack(&root.concat(pk))?;
        entries.insert(key, value_bytes.clone());
    }
    Ok(entries)
}

/// Clear removed entries, set added or changed ones.
pub(crate) async fn apply_diff(
    txn: &mut dyn KvTransaction,
    old: HashMap<Vec<u8>, Vec<u8>>,
    new: HashMap<Vec<u8>, Vec<u8>>,
) -> Result<(), IndexError> {
    for key in old.keys() {
        if !new.contains_key(key) {
            txn.clear(key);
        }
    }
    for (key, value) in &new {
        if old.get(key) != Some(value) {
            txn.set(key, value);
        }
    }
    Ok(())
}

pub struct ValueMaintainer {
    index: IndexDef,
    subspace: Subspace,
}

impl ValueMaintainer {
    pub fn new(index: IndexDef, subspace: Subspace) -> Self { Self { index, subspace } }
}

#[async_trait]
impl IndexMaintainer for ValueMaintainer {
    async fn update(&self, txn: &mut dyn KvTransaction, pk: &Tuple, old: Option<&Record>, new: Option<&Record>) -> Result<(), IndexError> {
        let old_entries = match old {
            Some(r) => entry_map(&self.index, &self.subspace, r, pk)?,
            None => HashMap::new(),
        };
        let new_entries = match new {
            Some(r) => entry_map(&self.index, &self.subspace, r, pk)?,
            None => HashMap::new(),
        };
        apply_diff(txn, old_entries, new_entries).await
    }

    async fn scan_record(&self, txn: &mut dyn KvTransaction, record: &Record, pk: &Tuple) -> Result<(), IndexError> {
        for (key, value) in entry_map(&self.index, &self.subspace, record, pk)? {
            txn.set(&key, &value);
        }
        Ok(())
    }

    fn subspace(&self) -> &Subspace { &self.subspace }
}

/// Value maintainer plus a pre-write check that no other primary key already
/// claims the same root evaluation.
pub struct UniqueMaintainer {
    index: IndexDef,
    subspace: Subspace,
}

impl UniqueMaintainer {
    pub fn new(index: IndexDef, subspace: Subspace) -> Self { Self { index, subspace } }

    /// Any entry under `root`'s prefix belonging to a different primary key
    /// is a violation. The read is non-snapshot, so two racing inserts of
    /// the same value conflict instead of both committing.
    async fn check_unique(&self, txn: &mut dyn KvTransaction, root: &Tuple, pk: &Tuple) -> Result<(), IndexError> {
        let prefix = self.subspace.subspace(root)?;
        let (lo, hi) = prefix.range();
        let result = txn
            .get_range(
                KeySelector::first_greater_or_equal(lo),
                KeySelector::first_greater_or_equal(hi),
                RangeOptions { limit: Some(2), reverse: false, snapshot: false },
            )
            .await?;
        for (key, _) in result.pairs {
            let existing_pk = prefix.unpack(&key)?;
            if existing_pk.cmp_order(pk) != std::cmp::Ordering::Equal {
                return Err(IndexError::UniqueViolation { index: self.index.name.clone(), key: root.to_string() });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IndexMaintainer for UniqueMaintainer {
    async fn update(&self, txn: &mut dyn KvTransaction, pk: &Tuple, old: Option<&Record>, new: Option<&Record>) -> Result<(), IndexError> {
        let old_entries = match old {
            Some(r) => entry_map(&self.index, &self.subspace, r, pk)?,
            None => HashMap::new(),
        };
        if let Some(record) = new {
            let roots = self.index.root.evaluate(record.record_type(), record)?;
            for root in &roots {
                self.check_unique(txn, root, pk).await?;
            }
        }
        let new_entries = match new {
            Some(r) => entry_map(&self.index, &self.subspace, r, pk)?,
            None => HashMap::new(),
        };
        apply_diff(txn, old_entries, new_entries).await
    }

    async fn scan_record(&self, txn: &mut dyn KvTransaction, record: &Record, pk: &Tuple) -> Result<(), IndexError> {
        let roots = self.index.root.evaluate(record.record_type(), record)?;
        for root in &roots {
            self.check_unique(txn, root, pk).await?;
        }
        for (key, value) in entry_map(&self.index, &self.subspace, record, pk)? {
            txn.set(&key, &value);
        }
        Ok(())
    }

    fn subspace(&self) -> &Subspace { &self.subspace }
}
