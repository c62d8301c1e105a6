//! Streaming plan execution.
//!
//! Every plan node becomes a cursor pulling records one at a time inside a
//! single shared transaction. Cursors are single-consumer and lazy: nothing
//! is read until `next` is called, and a consumer that stops pulling stops
//! the scan. Intersection and union merge their children on the primary-key
//! suffix that terminates every index entry's key.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{IndexError, QueryError, StoreError};
use crate::index::hnsw::HnswGraph;
use crate::index::vector::flat_knn;
use crate::kv::{KvTransaction, RangeScanner};
use crate::record::Record;
use crate::schema::{IndexDef, VectorOptions};
use crate::store::RecordStore;
use crate::subspace::Subspace;
use crate::tuple::Tuple;
use crate::value::Value;

use super::planner::QueryPlan;
use super::predicate::Predicate;

pub type SharedTxn = Arc<tokio::sync::Mutex<Box<dyn KvTransaction>>>;

#[async_trait]
pub trait RecordCursor: Send {
    async fn next(&mut self) -> Result<Option<Record>, QueryError>;
}

/// Build the cursor tree for a plan.
pub fn build_cursor(
    store: &RecordStore,
    record_type: &str,
    plan: &QueryPlan,
    txn: SharedTxn,
) -> Result<Box<dyn RecordCursor>, QueryError> {
    match plan {
        QueryPlan::FullScan { filter } => {
            let (lo, hi) = store.record_subspace().range();
            Ok(Box::new(FullScanCursor {
                store: store.clone(),
                txn,
                scanner: RangeScanner::over(lo, hi, true),
                record_type: record_type.to_string(),
                filter: filter.clone(),
            }))
        }
        QueryPlan::IndexScan { index, prefix, lower, upper, filter, covering } => {
            let entries = entry_cursor(store, index, prefix, lower, upper, txn.clone())?;
            let def = store
                .schema()
                .index(index)
                .ok_or_else(|| QueryError::InvalidQuery(format!("unknown index {}", index)))?
                .clone();
            Ok(Box::new(IndexScanCursor {
                store: store.clone(),
                txn,
                entries,
                index: def,
                record_type: record_type.to_string(),
                filter: filter.clone(),
                covering: *covering,
            }))
        }
        QueryPlan::Intersection { children, filter } => {
            let mut entry_children = Vec::with_capacity(children.len());
            for child in children {
                let QueryPlan::IndexScan { index, prefix, lower, upper, .. } = child else {
                    return Err(QueryError::InvalidQuery("intersection children must be index scans".into()));
                };
                entry_children.push(entry_cursor(store, index, prefix, lower, upper, txn.clone())?);
            }
            Ok(Box::new(IntersectionCursor {
                store: store.clone(),
                txn,
                children: entry_children,
                heads: Vec::new(),
                started: false,
                record_type: record_type.to_string(),
                filter: filter.clone(),
            }))
        }
        QueryPlan::Union { children } => {
            let mut union_children = Vec::with_capacity(children.len());
            for child in children {
                let QueryPlan::IndexScan { index, prefix, lower, upper, filter, .. } = child else {
                    return Err(QueryError::InvalidQuery("union children must be index scans".into()));
                };
                union_children.push(UnionChild {
                    entries: entry_cursor(store, index, prefix, lower, upper, txn.clone())?,
                    head: None,
                    filter: filter.clone(),
                });
            }
            Ok(Box::new(UnionCursor {
                store: store.clone(),
                txn,
                children: union_children,
                started: false,
                record_type: record_type.to_string(),
            }))
        }
        QueryPlan::Limit { child, limit } => {
            let inner = build_cursor(store, record_type, child, txn)?;
            Ok(Box::new(LimitCursor { inner, remaining: *limit }))
        }
    }
}

/// One decoded index entry.
struct IndexEntry {
    key: Tuple,
    value: Vec<u8>,
    pk: Tuple,
    /// Packed pk, the merge key for intersections and unions
    pk_bytes: Vec<u8>,
}

/// Streams (key, value) pairs of one index range and splits off the
/// primary-key suffix.
struct EntryCursor {
    txn: SharedTxn,
    subspace: Subspace,
    scanner: RangeScanner,
    root_columns: usize,
}

impl EntryCursor {
    async fn next_entry(&mut self) -> Result<Option<IndexEntry>, QueryError> {
        let mut txn = self.txn.lock().await;
        match self.scanner.next(&mut **txn).await? {
            None => Ok(None),
            Some((key, value)) => {
                let key = self.subspace.unpack(&key)?;
                let elements = key.elements();
                if elements.len() < self.root_columns {
                    return Err(QueryError::InvalidQuery("index entry shorter than its root expression".into()));
                }
                let pk = Tuple::from_values(elements[self.root_columns..].to_vec());
                let pk_bytes = pk.pack()?;
                Ok(Some(IndexEntry { key, value, pk, pk_bytes }))
            }
        }
    }
}

fn entry_cursor(
    store: &RecordStore,
    index: &str,
    prefix: &[Value],
    lower: &Option<(Value, bool)>,
    upper: &Option<(Value, bool)>,
    txn: SharedTxn,
) -> Result<EntryCursor, QueryError> {
    let def = store.schema().index(index).ok_or_else(|| QueryError::InvalidQuery(format!("unknown index {}", index)))?;
    let subspace = store.index_subspace(index).map_err(QueryError::Store)?;
    let (lo, hi) = scan_bounds(&subspace, prefix, lower, upper)?;
    Ok(EntryCursor { txn, subspace, scanner: RangeScanner::over(lo, hi, true), root_columns: def.root.scalar_column_count() })
}

/// Byte bounds of an index scan: packed equality prefix, optionally
/// tightened by a bound on the next column. A 0x00/0xFF sentinel turns the
/// element boundary into the right open or closed edge, since no element
/// encoding starts with either byte.
fn scan_bounds(
    subspace: &Subspace,
    prefix: &[Value],
    lower: &Option<(Value, bool)>,
    upper: &Option<(Value, bool)>,
) -> Result<(Vec<u8>, Vec<u8>), QueryError> {
    let bound_key = |extra: &Value| -> Result<Vec<u8>, QueryError> {
        let mut values = prefix.to_vec();
        values.push(extra.clone());
        Ok(subspace.pack(&Tuple::from_values(values))?)
    };
    let base = subspace.pack(&Tuple::from_values(prefix.to_vec()))?;

    let lo = match lower {
        None => {
            let mut k = base.clone();
            k.push(0x00);
            k
        }
        Some((v, inclusive)) => {
            let mut k = bound_key(v)?;
            if !*inclusive {
                k.push(0xFF);
            }
            k
        }
    };
    let hi = match upper {
        None => {
            let mut k = base;
            k.push(0xFF);
            k
        }
        Some((v, inclusive)) => {
            let mut k = bound_key(v)?;
            if *inclusive {
                k.push(0xFF);
            }
            k
        }
    };
    Ok((lo, hi))
}

struct FullScanCursor {
    store: RecordStore,
    txn: SharedTxn,
    scanner: RangeScanner,
    record_type: String,
    filter: Predicate,
}

#[async_trait]
impl RecordCursor for FullScanCursor {
    async fn next(&mut self) -> Result<Option<Record>, QueryError> {
        loop {
            let pair = {
                let mut txn = self.txn.lock().await;
                self.scanner.next(&mut **txn).await?
            };
            let Some((_, bytes)) = pair else { return Ok(None) };
            let record = self.store.codec().deserialize(&bytes)?;
            if record.record_type() == self.record_type && self.filter.matches(&record) {
                return Ok(Some(record));
            }
        }
    }
}

struct IndexScanCursor {
    store: RecordStore,
    txn: SharedTxn,
    entries: EntryCursor,
    index: IndexDef,
    record_type: String,
    filter: Predicate,
    covering: bool,
}

#[async_trait]
impl RecordCursor for IndexScanCursor {
    async fn next(&mut self) -> Result<Option<Record>, QueryError> {
        loop {
            let Some(entry) = self.entries.next_entry().await? else { return Ok(None) };
            let record = if self.covering {
                let value = Tuple::unpack(&entry.value)?;
                Some(self.store.codec().reconstruct_from_covering(self.store.schema(), &self.index, &entry.key, &value)?)
            } else {
                let mut txn = self.txn.lock().await;
                self.store.get_in_txn(&mut **txn, &entry.pk).await?
            };
            // Entries can race record deletions within write-only windows;
            // a missing record is simply skipped
            let Some(record) = record else { continue };
            if record.record_type() == self.record_type && self.filter.matches(&record) {
                return Ok(Some(record));
            }
        }
    }
}

struct IntersectionCursor {
    store: RecordStore,
    txn: SharedTxn,
    children: Vec<EntryCursor>,
    heads: Vec<Option<IndexEntry>>,
    started: bool,
    record_type: String,
    filter: Predicate,
}

#[async_trait]
impl RecordCursor for IntersectionCursor {
    async fn next(&mut self) -> Result<Option<Record>, QueryError> {
        if !self.started {
            self.started = true;
            for child in self.children.iter_mut() {
                self.heads.push(child.next_entry().await?);
            }
        }
        'outer: loop {
            // All children must be positioned
            let mut target: Option<Vec<u8>> = None;
            for head in &self.heads {
                let Some(entry) = head else { return Ok(None) };
                target = Some(match target {
                    None => entry.pk_bytes.clone(),
                    Some(t) if entry.pk_bytes > t => entry.pk_bytes.clone(),
                    Some(t) => t,
                });
            }
            let Some(target) = target else { return Ok(None) };

            // Catch every child up to the largest primary key seen
            for (i, child) in self.children.iter_mut().enumerate() {
                loop {
                    match &self.heads[i] {
                        None => return Ok(None),
                        Some(entry) if entry.pk_bytes < target => {
                            self.heads[i] = child.next_entry().await?;
                        }
                        Some(entry) if entry.pk_bytes > target => {
                            // Overshot: restart around the new maximum
                            continue 'outer;
                        }
                        Some(_) => break,
                    }
                }
            }

            // Agreement: emit once, advance everyone
            let pk = match &self.heads[0] {
                Some(entry) => entry.pk.clone(),
                None => return Ok(None),
            };
            for (i, child) in self.children.iter_mut().enumerate() {
                self.heads[i] = child.next_entry().await?;
            }
            let record = {
                let mut txn = self.txn.lock().await;
                self.store.get_in_txn(&mut **txn, &pk).await?
            };
            if let Some(record) = record {
                if record.record_type() == self.record_type && self.filter.matches(&record) {
                    return Ok(Some(record));
                }
            }
        }
    }
}

struct UnionChild {
    entries: EntryCursor,
    head: Option<IndexEntry>,
    filter: Predicate,
}

struct UnionCursor {
    store: RecordStore,
    txn: SharedTxn,
    children: Vec<UnionChild>,
    started: bool,
    record_type: String,
}

#[async_trait]
impl RecordCursor for UnionCursor {
    async fn next(&mut self) -> Result<Option<Record>, QueryError> {
        if !self.started {
            self.started = true;
            for child in self.children.iter_mut() {
                child.head = child.entries.next_entry().await?;
            }
        }
        loop {
            // Smallest primary key among the heads
            let Some(min_pk) = self
                .children
                .iter()
                .filter_map(|c| c.head.as_ref().map(|e| e.pk_bytes.clone()))
                .min()
            else {
                return Ok(None);
            };

            let pk = self
                .children
                .iter()
                .find_map(|c| c.head.as_ref().filter(|e| e.pk_bytes == min_pk).map(|e| e.pk.clone()))
                .unwrap_or_default();

            // A record qualifies when any child positioned at this key
            // accepts it; duplicates collapse because every child at the key
            // advances together
            let record = {
                let mut txn = self.txn.lock().await;
                self.store.get_in_txn(&mut **txn, &pk).await?
            };
            let mut accepted = false;
            for child in self.children.iter_mut() {
                let at_key = child.head.as_ref().map(|e| e.pk_bytes == min_pk).unwrap_or(false);
                if at_key {
                    if let Some(record) = &record {
                        if record.record_type() == self.record_type && child.filter.matches(record) {
                            accepted = true;
                        }
                    }
                    child.head = child.entries.next_entry().await?;
                }
            }
            if accepted {
                if let Some(record) = record {
                    return Ok(Some(record));
                }
            }
        }
    }
}

pub(super) struct LimitCursor {
    inner: Box<dyn RecordCursor>,
    remaining: usize,
}

impl LimitCursor {
    pub(super) fn new(inner: Box<dyn RecordCursor>, limit: usize) -> Self { Self { inner, remaining: limit } }
}

#[async_trait]
impl RecordCursor for LimitCursor {
    async fn next(&mut self) -> Result<Option<Record>, QueryError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        match self.inner.next().await? {
            Some(record) => {
                self.remaining -= 1;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

pub(super) enum KnnMode {
    Graph,
    Flat,
}

/// Runs the nearest-neighbor search on first pull, then streams the ranked
/// records. Holds O(k) state.
pub(super) struct KnnCursor {
    pub store: RecordStore,
    pub txn: SharedTxn,
    pub index: String,
    pub options: VectorOptions,
    pub mode: KnnMode,
    pub target: Vec<f32>,
    pub k: usize,
    pub filter: Predicate,
    pub record_type: String,
    pub results: Option<VecDeque<(f64, Tuple)>>,
}

#[async_trait]
impl RecordCursor for KnnCursor {
    async fn next(&mut self) -> Result<Option<Record>, QueryError> {
        if self.results.is_none() {
            let subspace = self.store.index_subspace(&self.index).map_err(QueryError::Store)?;
            let mut txn = self.txn.lock().await;
            let found = match self.mode {
                KnnMode::Graph => {
                    let graph = HnswGraph::new(&subspace, self.options.clone())
                        .map_err(|e| QueryError::Store(StoreError::from(IndexError::from(e))))?;
                    graph.search(&mut **txn, &self.target, self.k).await?
                }
                KnnMode::Flat => flat_knn(&mut **txn, &subspace, self.options.metric, &self.target, self.k).await?,
            };
            self.results = Some(found.into_iter().collect());
        }
        loop {
            let Some((_, pk)) = self.results.as_mut().and_then(|r| r.pop_front()) else { return Ok(None) };
            let record = {
                let mut txn = self.txn.lock().await;
                self.store.get_in_txn(&mut **txn, &pk).await?
            };
            let Some(record) = record else { continue };
            if record.record_type() == self.record_type && self.filter.matches(&record) {
                return Ok(Some(record));
            }
        }
    }
}
