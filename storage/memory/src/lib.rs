//! In-memory ordered key-value backend.
//!
//! Implements the record layer's KVS contract faithfully enough to be the
//! reference backend: lexicographically ordered keys, optimistic serializable
//! transactions validated on read ranges at commit, snapshot reads that skip
//! conflict registration, atomic little-endian adds, versionstamped keys, and
//! the conventional byte/duration budgets. Intended for tests and embedding,
//! not durability.

mod transaction;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use keel_core::error::KvError;
use keel_core::kv::{KvDatabase, KvTransaction};

pub use transaction::MemoryTransaction;

#[derive(Debug, Clone)]
pub struct MemoryDatabaseOptions {
    /// Mutation-set budget per transaction (conventional 10 MB)
    pub max_txn_bytes: usize,
    /// Wall-clock budget per transaction (conventional 5 s)
    pub max_txn_duration: Duration,
    /// Committed versions retained for conflict validation
    pub retained_versions: usize,
}

impl Default for MemoryDatabaseOptions {
    fn default() -> Self {
        Self { max_txn_bytes: 10 * 1024 * 1024, max_txn_duration: Duration::from_secs(5), retained_versions: 100_000 }
    }
}

pub(crate) struct Shared {
    pub data: BTreeMap<Vec<u8>, Vec<u8>>,
    pub version: u64,
    /// Write ranges of recently committed versions, newest at the back
    pub recent_writes: VecDeque<(u64, Vec<(Vec<u8>, Vec<u8>)>)>,
    /// Injected failures: the next n commits abort with a conflict after
    /// discarding their writes (atomicity testing hook)
    pub fail_commits: usize,
}

pub struct MemoryDatabase {
    pub(crate) shared: Arc<Mutex<Shared>>,
    pub(crate) options: MemoryDatabaseOptions,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> { Self::with_options(MemoryDatabaseOptions::default()) }

    pub fn with_options(options: MemoryDatabaseOptions) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Mutex::new(Shared {
                data: BTreeMap::new(),
                version: 0,
                recent_writes: VecDeque::new(),
                fail_commits: 0,
            })),
            options,
        })
    }

    /// Make the next `n` commits fail with a conflict, discarding their
    /// mutations. Used to exercise atomicity guarantees.
    pub fn inject_commit_failures(&self, n: usize) {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.fail_commits = n;
        debug!(n, "injected commit failures");
    }

    /// Number of keys currently committed (diagnostics and tests).
    pub fn key_count(&self) -> usize { self.shared.lock().unwrap_or_else(|e| e.into_inner()).data.len() }

    /// Committed value of one key, bypassing any transaction.
    pub fn peek(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).data.get(key).cloned()
    }
}

#[async_trait]
impl KvDatabase for MemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn KvTransaction>, KvError> {
        let read_version = self.shared.lock().unwrap_or_else(|e| e.into_inner()).version;
        Ok(Box::new(MemoryTransaction::new(Arc::clone(&self.shared), self.options.clone(), read_version)))
    }
}
