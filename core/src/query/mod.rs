//! Query building, planning and execution.
//!
//! A query is a predicate plus options, built fluently off the store:
//!
//! ```ignore
//! let adults = store
//!     .query("User")
//!     .filter(Predicate::field("age").ge(18i64))
//!     .execute()
//!     .await?;
//! ```
//!
//! Execution normalizes the predicate, reads index states and statistics,
//! plans, and streams the chosen plan's cursors inside one read transaction.

pub mod cursor;
pub mod normalize;
pub mod planner;
pub mod predicate;

pub use cursor::{RecordCursor, SharedTxn};
pub use normalize::{cache_key, normalize, MAX_DNF_TERMS};
pub use planner::{PlanChoice, PlannerInputs, QueryPlan};
pub use predicate::{CompareOp, Predicate};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use crate::error::{IndexError, QueryError};
use crate::index::hnsw::HnswGraph;
use crate::index::IndexState;
use crate::kv::KvTransaction;
use crate::record::Record;
use crate::schema::{IndexKind, VectorOptions};
use crate::stats::Statistics;
use crate::store::RecordStore;

/// Statistics older than this are ignored in favor of the heuristics.
fn stats_staleness() -> chrono::Duration { chrono::Duration::hours(24) }

#[derive(Debug, Clone)]
pub struct KnnClause {
    pub index: String,
    pub target: Vec<f32>,
    pub k: usize,
}

/// The chosen plan plus its costed alternatives, for inspection and tests.
#[derive(Debug, Clone)]
pub struct QueryExplanation {
    pub description: String,
    pub cost: f64,
    pub estimated_rows: f64,
    pub alternatives: Vec<(String, f64)>,
}

pub struct RecordQuery {
    store: RecordStore,
    record_type: String,
    predicate: Predicate,
    limit: Option<usize>,
    knn: Option<KnnClause>,
    allow_flat_fallback: bool,
}

impl RecordQuery {
    pub(crate) fn new(store: RecordStore, record_type: String) -> Self {
        Self { store, record_type, predicate: Predicate::True, limit: None, knn: None, allow_flat_fallback: false }
    }

    /// And-combine another predicate into the query.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = match self.predicate {
            Predicate::True => predicate,
            Predicate::And(mut children) => {
                children.push(predicate);
                Predicate::And(children)
            }
            existing => Predicate::And(vec![existing, predicate]),
        };
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Ask for the k nearest records by the given vector index.
    pub fn nearest(mut self, index: impl Into<String>, target: Vec<f32>, k: usize) -> Self {
        self.knn = Some(KnnClause { index: index.into(), target, k });
        self
    }

    /// Permit an exact flat scan when the HNSW graph is unavailable.
    pub fn allow_flat_fallback(mut self) -> Self {
        self.allow_flat_fallback = true;
        self
    }

    /// Stream results through a lazy cursor. The transaction stays open for
    /// the cursor's lifetime; long consumers should re-run rather than hold
    /// it past the KVS's transaction budget.
    pub async fn cursor(&self) -> Result<QueryExecution, QueryError> {
        let txn: SharedTxn = Arc::new(tokio::sync::Mutex::new(self.store.database().begin().await?));
        let root = {
            let mut guard = txn.lock().await;
            self.build(&mut **guard, txn.clone()).await?
        };
        Ok(QueryExecution { txn, root })
    }

    /// Run to completion and collect the results.
    pub async fn execute(&self) -> Result<Vec<Record>, QueryError> {
        let mut execution = self.cursor().await?;
        let mut out = Vec::new();
        while let Some(record) = execution.next().await? {
            out.push(record);
        }
        Ok(out)
    }

    /// Plan without executing.
    pub async fn explain(&self) -> Result<QueryExplanation, QueryError> {
        let txn: SharedTxn = Arc::new(tokio::sync::Mutex::new(self.store.database().begin().await?));
        let mut guard = txn.lock().await;
        if let Some(knn) = &self.knn {
            let (mode, _) = self.resolve_knn(&mut **guard, knn).await?;
            let description = format!(
                "knn({},k={},{})",
                knn.index,
                knn.k,
                match mode {
                    cursor::KnnMode::Graph => "hnsw",
                    cursor::KnnMode::Flat => "flat",
                }
            );
            return Ok(QueryExplanation { description, cost: knn.k as f64, estimated_rows: knn.k as f64, alternatives: Vec::new() });
        }
        let choice = self.plan_predicate(&mut **guard).await?;
        Ok(QueryExplanation {
            description: choice.plan.describe(),
            cost: choice.cost,
            estimated_rows: choice.estimated_rows,
            alternatives: choice.alternatives,
        })
    }

    async fn build(&self, txn: &mut dyn KvTransaction, shared: SharedTxn) -> Result<Box<dyn RecordCursor>, QueryError> {
        if let Some(knn) = &self.knn {
            let (mode, options) = self.resolve_knn(txn, knn).await?;
            let filter = normalize::normalize(&self.predicate);
            let knn_cursor = Box::new(cursor::KnnCursor {
                store: self.store.clone(),
                txn: shared,
                index: knn.index.clone(),
                options,
                mode,
                target: knn.target.clone(),
                k: knn.k,
                filter,
                record_type: self.record_type.clone(),
                results: None,
            });
            return Ok(match self.limit {
                Some(limit) if limit < knn.k => Box::new(cursor::LimitCursor::new(knn_cursor, limit)),
                _ => knn_cursor,
            });
        }
        let choice = self.plan_predicate(txn).await?;
        cursor::build_cursor(&self.store, &self.record_type, &choice.plan, shared)
    }

    async fn plan_predicate(&self, txn: &mut dyn KvTransaction) -> Result<PlanChoice, QueryError> {
        let normalized = normalize::normalize(&self.predicate);
        let schema = self.store.schema();
        let index_names: Vec<&str> = schema.indexes_for(&self.record_type).into_iter().map(|i| i.name.as_str()).collect();
        let states = self.store.state_manager().states(txn, &index_names).await?;
        let readable: HashSet<String> =
            states.iter().filter(|(_, s)| **s == IndexState::Readable).map(|(n, _)| n.clone()).collect();

        // Load statistics for readable indexes; stale snapshots fall back to
        // the heuristic selectivities
        let statistics = Statistics::new(self.store.stats_subspace()?);
        let mut value_stats = HashMap::new();
        let mut interval_stats = HashMap::new();
        let mut table_rows = None;
        for index in schema.indexes_for(&self.record_type) {
            if !readable.contains(&index.name) {
                continue;
            }
            if index.is_interval() {
                if let Some(stats) = statistics.load_interval(txn, &index.name).await? {
                    if Statistics::is_stale(stats.collected_at, stats_staleness()) {
                        warn!(index = %index.name, "interval statistics are stale, using heuristics");
                    } else {
                        table_rows = Some(table_rows.unwrap_or(0.0f64).max(stats.total as f64));
                        interval_stats.insert(index.name.clone(), stats);
                    }
                }
            } else if matches!(index.kind, IndexKind::Value | IndexKind::Covering | IndexKind::Unique) {
                if let Some(stats) = statistics.load_value(txn, &index.name).await? {
                    if Statistics::is_stale(stats.collected_at, stats_staleness()) {
                        warn!(index = %index.name, "value statistics are stale, using heuristics");
                    } else {
                        table_rows = Some(table_rows.unwrap_or(0.0f64).max(stats.total as f64));
                        value_stats.insert(index.name.clone(), stats);
                    }
                }
            }
        }

        let inputs = PlannerInputs {
            schema,
            record_type: &self.record_type,
            readable,
            value_stats,
            interval_stats,
            supports_covering: self.store.codec().supports_reconstruction(&self.record_type),
            table_rows,
        };
        Ok(planner::plan(&inputs, &normalized, self.limit))
    }

    /// Decide how a nearest-neighbor query runs. An unbuilt graph fails fast
    /// regardless of state; an unreadable index fails unless the flat
    /// fallback was requested.
    async fn resolve_knn(
        &self,
        txn: &mut dyn KvTransaction,
        knn: &KnnClause,
    ) -> Result<(cursor::KnnMode, VectorOptions), QueryError> {
        let def = self
            .store
            .schema()
            .index(&knn.index)
            .ok_or_else(|| QueryError::InvalidQuery(format!("unknown index {}", knn.index)))?;
        let IndexKind::Vector(options) = &def.kind else {
            return Err(QueryError::InvalidQuery(format!("index {} is not a vector index", knn.index)));
        };
        if knn.target.len() != options.dimensions {
            return Err(IndexError::VectorDimension {
                index: knn.index.clone(),
                expected: options.dimensions,
                got: knn.target.len(),
            }
            .into());
        }
        let subspace = self.store.index_subspace(&knn.index)?;
        let graph = HnswGraph::new(&subspace, options.clone()).map_err(IndexError::from)?;
        let meta = graph.meta(txn).await?;
        let state = self.store.state_manager().state(txn, &knn.index).await?;

        if meta.built && state == IndexState::Readable {
            return Ok((cursor::KnnMode::Graph, options.clone()));
        }
        if self.allow_flat_fallback {
            return Ok((cursor::KnnMode::Flat, options.clone()));
        }
        if !meta.built {
            Err(IndexError::HnswNotBuilt { index: knn.index.clone() }.into())
        } else {
            Err(IndexError::NotReadable { index: knn.index.clone(), state }.into())
        }
    }
}

/// A live, lazy query run holding its transaction open.
pub struct QueryExecution {
    #[allow(dead_code)]
    txn: SharedTxn,
    root: Box<dyn RecordCursor>,
}

impl QueryExecution {
    pub async fn next(&mut self) -> Result<Option<Record>, QueryError> { self.root.next().await }
}
