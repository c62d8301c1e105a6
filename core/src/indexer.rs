//! Online index building.
//!
//! Builds an index over a live record population in small throttled
//! transactions, tracking completed primary-key ranges in a range set so an
//! interrupted build resumes where it left off. Vector indexes get a second
//! phase that constructs the HNSW graph from the flat store before the index
//! flips to readable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::error::{IndexError, StoreError};
use crate::index::hnsw::HnswGraph;
use crate::index::vector::bytes_to_vector;
use crate::index::IndexState;
use crate::kv::RangeScanner;
use crate::rangeset::RangeSet;
use crate::schema::IndexKind;
use crate::store::RecordStore;

#[derive(Debug, Clone)]
pub struct IndexerThrottle {
    pub max_records_per_txn: usize,
    pub delay_between_txn: Duration,
    /// Stay well under the KVS's 10 MB transaction cap
    pub max_txn_bytes: usize,
    pub adaptive_batch: bool,
    /// Adaptive floor and ceiling for the per-transaction record budget
    pub min_records_per_txn: usize,
    pub max_records_ceiling: usize,
    pub growth_step: usize,
}

impl Default for IndexerThrottle {
    fn default() -> Self {
        Self {
            max_records_per_txn: 200,
            delay_between_txn: Duration::from_millis(5),
            max_txn_bytes: 9 * 1024 * 1024,
            adaptive_batch: true,
            min_records_per_txn: 10,
            max_records_ceiling: 5_000,
            growth_step: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexerPolicy {
    /// Clear index data and build progress before starting
    pub clear_existing: bool,
    /// Transition a disabled index to write-only before building
    pub enable_write_only: bool,
    pub mark_readable_on_complete: bool,
    pub allow_resume: bool,
    pub throttle: IndexerThrottle,
}

impl Default for IndexerPolicy {
    fn default() -> Self {
        Self {
            clear_existing: false,
            enable_write_only: true,
            mark_readable_on_complete: true,
            allow_resume: true,
            throttle: IndexerThrottle::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildProgress {
    pub scanned: u64,
    pub indexed: u64,
    /// Approximate completed fraction of the record keyspace
    pub fraction: f64,
    pub elapsed: Duration,
    /// Records per second over the whole run
    pub rate: f64,
}

#[derive(Default)]
struct ProgressInner {
    scanned: u64,
    indexed: u64,
    fraction: f64,
    started: Option<Instant>,
}

/// Sub-subspaces of the index's range-set: record scan and graph build
/// progress are tracked independently.
const RECORD_PROGRESS: &str = "r";
const GRAPH_PROGRESS: &str = "g";

pub struct OnlineIndexer {
    store: RecordStore,
    index: String,
    policy: IndexerPolicy,
    stop: Arc<AtomicBool>,
    progress: Arc<Mutex<ProgressInner>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl OnlineIndexer {
    pub fn new(store: RecordStore, index: impl Into<String>, policy: IndexerPolicy) -> Result<Self, StoreError> {
        let index = index.into();
        if store.schema().index(&index).is_none() {
            return Err(StoreError::InvalidArgument(format!("unknown index {}", index)));
        }
        Ok(Self {
            store,
            index,
            policy,
            stop: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(Mutex::new(ProgressInner::default())),
            last_error: Arc::new(Mutex::new(None)),
        })
    }

    /// Cooperative stop: the current batch finishes, then the loop exits.
    pub fn stop(&self) { self.stop.store(true, Ordering::SeqCst); }

    pub fn stop_handle(&self) -> Arc<AtomicBool> { Arc::clone(&self.stop) }

    pub fn progress(&self) -> BuildProgress {
        let inner = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = inner.started.map(|s| s.elapsed()).unwrap_or_default();
        let rate = if elapsed.as_secs_f64() > 0.0 { inner.scanned as f64 / elapsed.as_secs_f64() } else { 0.0 };
        BuildProgress { scanned: inner.scanned, indexed: inner.indexed, fraction: inner.fraction, elapsed, rate }
    }

    pub fn last_error(&self) -> Option<String> { self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone() }

    fn record_range_set(&self) -> Result<RangeSet, StoreError> {
        Ok(RangeSet::new(self.store.range_set_subspace(&self.index)?.sub(RECORD_PROGRESS)?))
    }

    fn graph_range_set(&self) -> Result<RangeSet, StoreError> {
        Ok(RangeSet::new(self.store.range_set_subspace(&self.index)?.sub(GRAPH_PROGRESS)?))
    }

    fn is_vector_index(&self) -> bool {
        matches!(self.store.schema().index(&self.index).map(|i| &i.kind), Some(IndexKind::Vector(_)))
    }

    /// Build from the beginning (honoring `clear_existing`), then flip to
    /// readable if configured. Returns early without error on cooperative
    /// stop; `resume` picks up from the recorded progress.
    pub async fn build(&self) -> Result<(), StoreError> {
        let outcome = self.build_inner().await;
        if let Err(e) = &outcome {
            *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
        }
        outcome
    }

    async fn build_inner(&self) -> Result<(), StoreError> {
        self.initialize().await?;
        self.run_to_completion().await
    }

    /// Resume an interrupted build. The index must already be write-only.
    pub async fn resume(&self) -> Result<(), StoreError> {
        if !self.policy.allow_resume {
            return Err(StoreError::InvalidArgument(format!("resume is disabled by policy for index {}", self.index)));
        }
        let state = self.store.index_state(&self.index).await?;
        if state != IndexState::WriteOnly {
            return Err(IndexError::NotReadable { index: self.index.clone(), state }.into());
        }
        self.stop.store(false, Ordering::SeqCst);
        let outcome = self.run_to_completion().await;
        if let Err(e) = &outcome {
            *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
        }
        outcome
    }

    async fn run_to_completion(&self) -> Result<(), StoreError> {
        {
            let mut inner = self.progress.lock().unwrap_or_else(|e| e.into_inner());
            if inner.started.is_none() {
                inner.started = Some(Instant::now());
            }
        }
        let complete = self.scan_records().await?;
        if !complete {
            info!(index = %self.index, "index build stopped before completion");
            return Ok(());
        }
        if self.is_vector_index() {
            let complete = self.build_graph().await?;
            if !complete {
                info!(index = %self.index, "graph build stopped before completion");
                return Ok(());
            }
        }
        if self.policy.mark_readable_on_complete {
            let store = self.store.clone();
            let index = self.index.clone();
            store
                .database()
                .clone()
                .with_txn(move |txn| {
                    let store = store.clone();
                    let index = index.clone();
                    Box::pin(async move {
                        // Rebuilding an already-readable index leaves it readable
                        if store.state_manager().state(txn, &index).await? == IndexState::WriteOnly {
                            store.state_manager().mark_readable(txn, &index).await?;
                        }
                        Ok::<_, StoreError>(())
                    })
                })
                .await?;
        }
        info!(index = %self.index, progress = ?self.progress(), "index build complete");
        Ok(())
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        let store = self.store.clone();
        let index = self.index.clone();
        let policy = self.policy.clone();
        let record_rs = self.record_range_set()?;
        let graph_rs = self.graph_range_set()?;
        store
            .database()
            .clone()
            .with_txn(move |txn| {
                let store = store.clone();
                let index = index.clone();
                let policy = policy.clone();
                let record_rs = record_rs.clone();
                let graph_rs = graph_rs.clone();
                Box::pin(async move {
                    let state = store.state_manager().state(txn, &index).await?;
                    if state == IndexState::Disabled {
                        if !policy.enable_write_only {
                            return Err(StoreError::InvalidArgument(format!(
                                "index {} is disabled; enable it first or configure enable_write_only",
                                index
                            )));
                        }
                        store.state_manager().enable(txn, &index).await?;
                    }
                    if policy.clear_existing {
                        if let Some(maintainer) = store.maintainer(&index) {
                            maintainer.clear(txn).await?;
                        }
                        record_rs.clear(txn).await?;
                        graph_rs.clear(txn).await?;
                    }
                    Ok(())
                })
            })
            .await
    }

    /// Phase one: scan the record extent, feeding each record to the
    /// maintainer. Returns false when stopped cooperatively.
    async fn scan_records(&self) -> Result<bool, StoreError> {
        let range_set = self.record_range_set()?;
        let (total_lo, total_hi) = self.store.record_subspace().range();
        let mut batch_size = self.policy.throttle.max_records_per_txn;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(false);
            }

            // Find the next gap
            let gap = {
                let range_set = range_set.clone();
                let (total_lo, total_hi) = (total_lo.clone(), total_hi.clone());
                self.store
                    .database()
                    .with_txn(move |txn| {
                        let range_set = range_set.clone();
                        let (total_lo, total_hi) = (total_lo.clone(), total_hi.clone());
                        Box::pin(async move { Ok::<_, StoreError>(range_set.next_incomplete(txn, &total_lo, &total_hi).await?) })
                    })
                    .await?
            };
            let Some((gap_lo, gap_hi)) = gap else { break };

            // Scan one batch
            let (scanned, indexed, last_key, bytes, exhausted) = self.scan_batch(&gap_lo, &gap_hi, batch_size).await?;

            // Record progress in its own transaction; insert is idempotent
            let done_hi = match (&last_key, exhausted) {
                (_, true) => gap_hi.clone(),
                (Some(k), false) => key_successor(k),
                (None, false) => gap_hi.clone(),
            };
            let fraction = {
                let range_set = range_set.clone();
                let (gap_lo, done_hi) = (gap_lo.clone(), done_hi.clone());
                let (total_lo, total_hi) = (total_lo.clone(), total_hi.clone());
                self.store
                    .database()
                    .with_txn(move |txn| {
                        let range_set = range_set.clone();
                        let (gap_lo, done_hi) = (gap_lo.clone(), done_hi.clone());
                        let (total_lo, total_hi) = (total_lo.clone(), total_hi.clone());
                        Box::pin(async move {
                            range_set.insert(txn, &gap_lo, &done_hi).await?;
                            Ok::<_, StoreError>(range_set.progress(txn, &total_lo, &total_hi).await?)
                        })
                    })
                    .await?
            };

            {
                let mut inner = self.progress.lock().unwrap_or_else(|e| e.into_inner());
                inner.scanned += scanned as u64;
                inner.indexed += indexed as u64;
                inner.fraction = fraction;
            }
            debug!(index = %self.index, scanned, indexed, bytes, fraction, "indexed batch");

            batch_size = self.adjust_batch(batch_size, bytes);
            tokio::time::sleep(self.policy.throttle.delay_between_txn).await;
        }
        Ok(true)
    }

    async fn scan_batch(
        &self,
        gap_lo: &[u8],
        gap_hi: &[u8],
        batch_size: usize,
    ) -> Result<(usize, usize, Option<Vec<u8>>, usize, bool), StoreError> {
        let store = self.store.clone();
        let index = self.index.clone();
        let max_bytes = self.policy.throttle.max_txn_bytes;
        let (gap_lo, gap_hi) = (gap_lo.to_vec(), gap_hi.to_vec());
        store
            .database()
            .clone()
            .with_txn(move |txn| {
                let store = store.clone();
                let index = index.clone();
                let (gap_lo, gap_hi) = (gap_lo.clone(), gap_hi.clone());
                Box::pin(async move {
                    let def = store
                        .schema()
                        .index(&index)
                        .ok_or_else(|| StoreError::InvalidArgument(format!("unknown index {}", index)))?;
                    let maintainer = store
                        .maintainer(&index)
                        .ok_or_else(|| StoreError::InvalidArgument(format!("unknown index {}", index)))?
                        .clone();
                    let records = store.record_subspace().clone();
                    // Snapshot reads: the build must not conflict with writers
                    let mut scanner = RangeScanner::over(gap_lo, gap_hi, true).limit(batch_size);
                    let mut scanned = 0usize;
                    let mut indexed = 0usize;
                    let mut last_key = None;
                    let mut exhausted = true;
                    loop {
                        let Some((key, value)) = scanner.next(txn).await? else { break };
                        scanned += 1;
                        last_key = Some(key.clone());
                        let record = store.codec().deserialize(&value)?;
                        if def.applies_to(record.record_type()) {
                            let pk = records.unpack(&key)?;
                            maintainer.scan_record(txn, &record, &pk).await?;
                            indexed += 1;
                        }
                        if scanned == batch_size || txn.mutation_size() >= max_bytes {
                            // The range may hold more; record only what we saw
                            exhausted = false;
                            break;
                        }
                    }
                    let bytes = txn.mutation_size();
                    Ok::<_, StoreError>((scanned, indexed, last_key, bytes, exhausted))
                })
            })
            .await
    }

    /// Phase two (vector indexes): insert every flat vector into the HNSW
    /// graph, a few per transaction, then stamp the graph as built.
    async fn build_graph(&self) -> Result<bool, StoreError> {
        let index_subspace = self.store.index_subspace(&self.index)?;
        let Some(IndexKind::Vector(options)) = self.store.schema().index(&self.index).map(|i| i.kind.clone()) else {
            return Ok(true);
        };
        let flat = crate::index::vector::flat_subspace(&index_subspace)?;
        let range_set = self.graph_range_set()?;
        let (total_lo, total_hi) = flat.range();
        // Graph inserts touch many nodes each; keep batches small
        let batch_size = (self.policy.throttle.max_records_per_txn / 10).max(1);

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let gap = {
                let range_set = range_set.clone();
                let (total_lo, total_hi) = (total_lo.clone(), total_hi.clone());
                self.store
                    .database()
                    .with_txn(move |txn| {
                        let range_set = range_set.clone();
                        let (total_lo, total_hi) = (total_lo.clone(), total_hi.clone());
                        Box::pin(async move { Ok::<_, StoreError>(range_set.next_incomplete(txn, &total_lo, &total_hi).await?) })
                    })
                    .await?
            };
            let Some((gap_lo, gap_hi)) = gap else { break };

            let (inserted, last_key) = {
                let store = self.store.clone();
                let flat = flat.clone();
                let options = options.clone();
                let index_subspace = index_subspace.clone();
                let (gap_lo, gap_hi) = (gap_lo.clone(), gap_hi.clone());
                store
                    .database()
                    .clone()
                    .with_txn(move |txn| {
                        let flat = flat.clone();
                        let options = options.clone();
                        let index_subspace = index_subspace.clone();
                        let (gap_lo, gap_hi) = (gap_lo.clone(), gap_hi.clone());
                        Box::pin(async move {
                            let graph = HnswGraph::new(&index_subspace, options).map_err(IndexError::from)?;
                            let mut rng = StdRng::from_entropy();
                            let mut scanner = RangeScanner::over(gap_lo, gap_hi, true).limit(batch_size);
                            let mut inserted = 0usize;
                            let mut last_key = None;
                            while let Some((key, value)) = scanner.next(txn).await? {
                                last_key = Some(key.clone());
                                let id = key
                                    .strip_prefix(flat.prefix())
                                    .ok_or_else(|| StoreError::InvalidArgument("flat entry outside subspace".into()))?;
                                let vector = bytes_to_vector(&value);
                                graph.insert(txn, &mut rng, id, &vector).await?;
                                inserted += 1;
                            }
                            Ok::<_, StoreError>((inserted, last_key))
                        })
                    })
                    .await?
            };

            let done_hi = match &last_key {
                Some(k) if inserted == batch_size => key_successor(k),
                _ => gap_hi.clone(),
            };
            {
                let range_set = range_set.clone();
                let (gap_lo, done_hi) = (gap_lo.clone(), done_hi.clone());
                self.store
                    .database()
                    .with_txn(move |txn| {
                        let range_set = range_set.clone();
                        let (gap_lo, done_hi) = (gap_lo.clone(), done_hi.clone());
                        Box::pin(async move { Ok::<_, StoreError>(range_set.insert(txn, &gap_lo, &done_hi).await?) })
                    })
                    .await?;
            }
            debug!(index = %self.index, inserted, "graph batch committed");
            tokio::time::sleep(self.policy.throttle.delay_between_txn).await;
        }

        // Stamp the graph as built
        let index_subspace2 = self.store.index_subspace(&self.index)?;
        self.store
            .database()
            .with_txn(move |txn| {
                let index_subspace = index_subspace2.clone();
                let options = options.clone();
                Box::pin(async move {
                    let graph = HnswGraph::new(&index_subspace, options).map_err(IndexError::from)?;
                    Ok::<_, StoreError>(graph.mark_built(txn).await?)
                })
            })
            .await?;
        Ok(true)
    }

    /// Tear a vector index back down to an empty write-only shell: disable,
    /// clear all index data (flat, graph, meta) and build progress, then
    /// re-enable write-only.
    pub async fn reset_vector_index(&self) -> Result<(), StoreError> {
        if !self.is_vector_index() {
            return Err(StoreError::InvalidArgument(format!("index {} is not a vector index", self.index)));
        }
        let store = self.store.clone();
        let index = self.index.clone();
        let record_rs = self.record_range_set()?;
        let graph_rs = self.graph_range_set()?;
        store
            .database()
            .clone()
            .with_txn(move |txn| {
                let store = store.clone();
                let index = index.clone();
                let record_rs = record_rs.clone();
                let graph_rs = graph_rs.clone();
                Box::pin(async move {
                    store.state_manager().disable(txn, &index).await?;
                    if let Some(maintainer) = store.maintainer(&index) {
                        maintainer.clear(txn).await?;
                    }
                    record_rs.clear(txn).await?;
                    graph_rs.clear(txn).await?;
                    store.state_manager().enable(txn, &index).await?;
                    Ok(())
                })
            })
            .await
    }

    fn adjust_batch(&self, current: usize, committed_bytes: usize) -> usize {
        let throttle = &self.policy.throttle;
        if !throttle.adaptive_batch {
            return current;
        }
        let cap = throttle.max_txn_bytes;
        if committed_bytes < cap / 2 {
            (current + throttle.growth_step).min(throttle.max_records_ceiling)
        } else if committed_bytes > cap * 4 / 5 {
            let shrunk = current.saturating_sub(throttle.growth_step).max(throttle.min_records_per_txn);
            warn!(index = %self.index, committed_bytes, shrunk, "batch near transaction byte cap, shrinking");
            shrunk
        } else {
            current
        }
    }
}

/// Smallest key strictly greater than `key`.
fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();
    out.push(0x00);
    out
}
