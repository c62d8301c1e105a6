//! The record store: primary-key CRUD with transactional index fan-out.
//!
//! A store exclusively owns one subspace of the KVS. Every save and delete
//! runs as a single transaction that writes the record bytes and brings all
//! maintained indexes of the record's type along atomically; a failing
//! maintainer abandons the whole transaction.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::StoreError;
use crate::index::{maintainer_for, IndexMaintainer, IndexStateManager};
use crate::kv::{Database, KvTransaction};
use crate::query::RecordQuery;
use crate::record::{Record, RecordCodec};
use crate::schema::Schema;
use crate::subspace::Subspace;
use crate::tuple::Tuple;

/// Key-layout tags under the store's root subspace.
pub(crate) const RECORDS: &str = "R";
pub(crate) const INDEXES: &str = "I";
pub(crate) const INDEX_STATES: &str = "IS";
pub(crate) const INDEX_RANGES: &str = "IR";
pub(crate) const STATISTICS: &str = "S";

#[derive(Clone)]
pub struct RecordStore {
    db: Database,
    root: Subspace,
    records: Subspace,
    schema: Arc<Schema>,
    codec: Arc<dyn RecordCodec>,
    states: Arc<IndexStateManager>,
    maintainers: Arc<HashMap<String, Arc<dyn IndexMaintainer>>>,
}

impl RecordStore {
    pub fn new(db: Database, root: Subspace, schema: Arc<Schema>, codec: Arc<dyn RecordCodec>) -> Result<Self, StoreError> {
        let records = root.sub(RECORDS)?;
        let states = Arc::new(IndexStateManager::new(root.sub(INDEX_STATES)?));
        let mut maintainers = HashMap::new();
        for index in schema.indexes() {
            let subspace = root.sub(INDEXES)?.sub(index.name.as_str())?;
            maintainers.insert(index.name.clone(), maintainer_for(index, subspace)?);
        }
        Ok(Self { db, root, records, schema, codec, states, maintainers: Arc::new(maintainers) })
    }

    pub fn database(&self) -> &Database { &self.db }

    pub fn schema(&self) -> &Arc<Schema> { &self.schema }

    pub fn codec(&self) -> &Arc<dyn RecordCodec> { &self.codec }

    pub fn state_manager(&self) -> &Arc<IndexStateManager> { &self.states }

    pub fn record_subspace(&self) -> &Subspace { &self.records }

    pub fn index_subspace(&self, index: &str) -> Result<Subspace, StoreError> {
        Ok(self.root.sub(INDEXES)?.sub(index)?)
    }

    pub fn range_set_subspace(&self, index: &str) -> Result<Subspace, StoreError> {
        Ok(self.root.sub(INDEX_RANGES)?.sub(index)?)
    }

    pub fn stats_subspace(&self) -> Result<Subspace, StoreError> { Ok(self.root.sub(STATISTICS)?) }

    pub fn maintainer(&self, index: &str) -> Option<&Arc<dyn IndexMaintainer>> { self.maintainers.get(index) }

    /// Insert or update one record and all maintained indexes atomically.
    pub async fn save(&self, record: &Record) -> Result<(), StoreError> {
        let this = self.clone();
        let record = record.clone();
        self.db
            .with_txn(move |txn| {
                let this = this.clone();
                let record = record.clone();
                Box::pin(async move { this.save_in_txn(txn, &record).await })
            })
            .await
    }

    pub async fn save_in_txn(&self, txn: &mut dyn KvTransaction, record: &Record) -> Result<(), StoreError> {
        let pk = self.schema.primary_key(record)?;
        let key = self.records.pack(&pk)?;
        // Non-snapshot read: concurrent writers of the same record conflict
        let old = match txn.get(&key, false).await? {
            Some(bytes) => Some(self.codec.deserialize(&bytes)?),
            None => None,
        };
        self.fan_out(txn, &pk, old.as_ref(), Some(record)).await?;
        txn.set(&key, &self.codec.serialize(record)?);
        debug!(record_type = record.record_type(), pk = %pk, "saved record");
        Ok(())
    }

    /// Fetch by primary key.
    pub async fn get(&self, pk: &Tuple) -> Result<Option<Record>, StoreError> {
        let this = self.clone();
        let pk = pk.clone();
        self.db
            .with_txn(move |txn| {
                let this = this.clone();
                let pk = pk.clone();
                Box::pin(async move { this.get_in_txn(txn, &pk).await })
            })
            .await
    }

    pub async fn get_in_txn(&self, txn: &mut dyn KvTransaction, pk: &Tuple) -> Result<Option<Record>, StoreError> {
        let key = self.records.pack(pk)?;
        match txn.get(&key, false).await? {
            Some(bytes) => Ok(Some(self.codec.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Like [`RecordStore::get`], but absence is an error.
    pub async fn get_required(&self, pk: &Tuple) -> Result<Record, StoreError> {
        self.get(pk).await?.ok_or_else(|| StoreError::RecordNotFound(pk.to_string()))
    }

    /// Delete by primary key; returns whether a record existed.
    pub async fn delete(&self, pk: &Tuple) -> Result<bool, StoreError> {
        let this = self.clone();
        let pk = pk.clone();
        self.db
            .with_txn(move |txn| {
                let this = this.clone();
                let pk = pk.clone();
                Box::pin(async move { this.delete_in_txn(txn, &pk).await })
            })
            .await
    }

    pub async fn delete_in_txn(&self, txn: &mut dyn KvTransaction, pk: &Tuple) -> Result<bool, StoreError> {
        let key = self.records.pack(pk)?;
        let Some(bytes) = txn.get(&key, false).await? else { return Ok(false) };
        let old = self.codec.deserialize(&bytes)?;
        self.fan_out(txn, pk, Some(&old), None).await?;
        txn.clear(&key);
        debug!(record_type = old.record_type(), pk = %pk, "deleted record");
        Ok(true)
    }

    /// Route the old → new image change to every affected, maintained index.
    /// A record changing type on update sees delete-side updates for the old
    /// type's indexes and insert-side updates for the new type's.
    async fn fan_out(
        &self,
        txn: &mut dyn KvTransaction,
        pk: &Tuple,
        old: Option<&Record>,
        new: Option<&Record>,
    ) -> Result<(), StoreError> {
        let mut names: Vec<&str> = Vec::new();
        for image in [old, new].into_iter().flatten() {
            for index in self.schema.indexes_for(image.record_type()) {
                if !names.contains(&index.name.as_str()) {
                    names.push(&index.name);
                }
            }
        }
        for name in names {
            if !self.states.state(txn, name).await?.is_maintained() {
                continue;
            }
            let Some(index) = self.schema.index(name) else { continue };
            let Some(maintainer) = self.maintainers.get(name) else { continue };
            let old_for = old.filter(|r| index.applies_to(r.record_type()));
            let new_for = new.filter(|r| index.applies_to(r.record_type()));
            maintainer.update(txn, pk, old_for, new_for).await?;
        }
        Ok(())
    }

    /// Read an aggregate (count or sum) cell for a grouping tuple.
    pub async fn aggregate(&self, index: &str, group: &Tuple) -> Result<i64, StoreError> {
        let subspace = self.index_subspace(index)?;
        self.db
            .with_txn(move |txn| {
                let subspace = subspace.clone();
                let group = group.clone();
                Box::pin(async move { Ok(crate::index::aggregate::read_aggregate(txn, &subspace, &group).await?) })
            })
            .await
    }

    /// Records whose spatial index cell falls inside the cell containing
    /// `(lat, lng)` at `level`. Requires the index to be readable.
    pub async fn nearby(&self, index: &str, lat: f64, lng: f64, level: u8) -> Result<Vec<Record>, StoreError> {
        let def = self
            .schema
            .index(index)
            .ok_or_else(|| StoreError::InvalidArgument(format!("unknown index {}", index)))?
            .clone();
        let crate::schema::IndexKind::Spatial(options) = &def.kind else {
            return Err(StoreError::InvalidArgument(format!("index {} is not spatial", index)));
        };
        if level > options.level {
            return Err(StoreError::InvalidArgument(format!(
                "query level {} is finer than index level {}",
                level, options.level
            )));
        }
        let (lo_token, hi_token) = crate::index::spatial::token_range(lat, lng, level, options.level);
        let subspace = self.index_subspace(index)?;
        let this = self.clone();
        let index_name = index.to_string();
        self.db
            .with_txn(move |txn| {
                let this = this.clone();
                let subspace = subspace.clone();
                let index_name = index_name.clone();
                Box::pin(async move {
                    let state = this.states.state(txn, &index_name).await?;
                    if state != crate::index::IndexState::Readable {
                        return Err(crate::error::IndexError::NotReadable { index: index_name.clone(), state }.into());
                    }
                    let lo = subspace.pack(&Tuple::single(lo_token as i64))?;
                    let hi = subspace.pack(&Tuple::single(hi_token as i64))?;
                    let mut scanner = crate::kv::RangeScanner::over(lo, hi, true);
                    let mut out = Vec::new();
                    while let Some((key, _)) = scanner.next(txn).await? {
                        let entry = subspace.unpack(&key)?;
                        // Skip the cell token element, the rest is the pk
                        let pk = Tuple::from_values(entry.elements()[1..].to_vec());
                        if let Some(record) = this.get_in_txn(txn, &pk).await? {
                            out.push(record);
                        }
                    }
                    Ok(out)
                })
            })
            .await
    }

    /// Begin building a query over one record type.
    pub fn query(&self, record_type: impl Into<String>) -> RecordQuery { RecordQuery::new(self.clone(), record_type.into()) }

    /// Administrative convenience: run a state transition in its own
    /// transaction.
    pub async fn enable_index(&self, index: &str) -> Result<(), StoreError> {
        let this = self.clone();
        let index = index.to_string();
        self.db
            .with_txn(move |txn| {
                let this = this.clone();
                let index = index.clone();
                Box::pin(async move { Ok(this.states.enable(txn, &index).await?) })
            })
            .await
    }

    pub async fn disable_index(&self, index: &str) -> Result<(), StoreError> {
        let this = self.clone();
        let index = index.to_string();
        self.db
            .with_txn(move |txn| {
                let this = this.clone();
                let index = index.clone();
                Box::pin(async move { Ok(this.states.disable(txn, &index).await?) })
            })
            .await
    }

    pub async fn index_state(&self, index: &str) -> Result<crate::index::IndexState, StoreError> {
        let this = self.clone();
        let index = index.to_string();
        self.db
            .with_txn(move |txn| {
                let this = this.clone();
                let index = index.clone();
                Box::pin(async move { Ok(this.states.state(txn, &index).await?) })
            })
            .await
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").field("root", &self.root.prefix()).field("schema_version", &self.schema.version()).finish()
    }
}
