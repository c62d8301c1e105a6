//! Index maintenance.
//!
//! A maintainer owns one index's subspace and knows how to apply the delta
//! between the old and new image of a record, inside the caller's
//! transaction. The record store fans out to maintainers on every save and
//! delete; the online indexer drives `scan_record` over existing data.

pub mod aggregate;
pub mod hnsw;
pub mod spatial;
pub mod state;
pub mod value;
pub mod vector;

pub use state::{IndexState, IndexStateManager};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{IndexError, TupleError};
use crate::kv::KvTransaction;
use crate::record::Record;
use crate::schema::{IndexDef, IndexKind};
use crate::subspace::Subspace;
use crate::tuple::Tuple;

#[async_trait]
pub trait IndexMaintainer: Send + Sync {
    /// Apply the difference between the old and new images of one record.
    /// `old == None` is an insert, `new == None` a delete; both present is an
    /// update. The primary key belongs to whichever image is present (they
    /// are equal on update by construction).
    async fn update(
        &self,
        txn: &mut dyn KvTransaction,
        pk: &Tuple,
        old: Option<&Record>,
        new: Option<&Record>,
    ) -> Result<(), IndexError>;

    /// Index one existing record during an online build. Equivalent to
    /// `update(txn, pk, None, Some(record))` for idempotent entry shapes.
    async fn scan_record(&self, txn: &mut dyn KvTransaction, record: &Record, pk: &Tuple) -> Result<(), IndexError>;

    /// Remove every entry this index owns.
    async fn clear(&self, txn: &mut dyn KvTransaction) -> Result<(), IndexError> {
        let (lo, hi) = self.subspace().range();
        txn.clear_range(&lo, &hi);
        Ok(())
    }

    fn subspace(&self) -> &Subspace;
}

/// Construct the maintainer for an index definition, rooted at the index's
/// subspace under the store.
pub fn maintainer_for(index: &IndexDef, subspace: Subspace) -> Result<Arc<dyn IndexMaintainer>, TupleError> {
    Ok(match &index.kind {
        IndexKind::Value | IndexKind::Covering => Arc::new(value::ValueMaintainer::new(index.clone(), subspace)),
        IndexKind::Unique => Arc::new(value::UniqueMaintainer::new(index.clone(), subspace)),
        IndexKind::Count => Arc::new(aggregate::CountMaintainer::new(index.clone(), subspace)),
        IndexKind::Sum { field } => Arc::new(aggregate::SumMaintainer::new(index.clone(), field.clone(), subspace)),
        IndexKind::Spatial(options) => Arc::new(spatial::SpatialMaintainer::new(index.clone(), options.clone(), subspace)),
        IndexKind::Vector(options) => Arc::new(vector::VectorMaintainer::new(index.clone(), options.clone(), subspace)?),
    })
}
