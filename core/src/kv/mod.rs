//! The key-value store boundary.
//!
//! Everything the record layer needs from its KVS: transactions over
//! lexicographically ordered keys with serializable conflict detection,
//! snapshot reads that opt out of conflicts, ranged reads with selectors,
//! atomic mutations and versionstamps. Backends implement [`KvDatabase`] and
//! [`KvTransaction`]; the record layer only ever talks to these traits.

mod retry;
mod scan;

pub use retry::RetryOptions;
pub use scan::RangeScanner;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;

use crate::error::{KvError, MaybeRetryable};

/// Atomic read-modify-write operations applied at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    /// Little-endian i64 addition; missing keys read as zero
    Add,
    /// Overwrite a 12-byte placeholder in the key with the commit
    /// versionstamp; the placeholder offset rides in the last four
    /// little-endian bytes of the key parameter
    SetVersionstampedKey,
}

/// Resolves to a concrete key relative to the committed key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    FirstGreaterOrEqual(Vec<u8>),
    FirstGreaterThan(Vec<u8>),
    LastLessOrEqual(Vec<u8>),
}

impl KeySelector {
    pub fn first_greater_or_equal(key: impl Into<Vec<u8>>) -> Self { KeySelector::FirstGreaterOrEqual(key.into()) }

    pub fn first_greater_than(key: impl Into<Vec<u8>>) -> Self { KeySelector::FirstGreaterThan(key.into()) }

    pub fn last_less_or_equal(key: impl Into<Vec<u8>>) -> Self { KeySelector::LastLessOrEqual(key.into()) }

    pub fn key(&self) -> &[u8] {
        match self {
            KeySelector::FirstGreaterOrEqual(k) | KeySelector::FirstGreaterThan(k) | KeySelector::LastLessOrEqual(k) => k,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RangeOptions {
    /// Max pairs returned by this call; the backend may return fewer
    pub limit: Option<usize>,
    pub reverse: bool,
    /// Snapshot reads do not register conflict ranges
    pub snapshot: bool,
}

#[derive(Debug, Default)]
pub struct RangeResult {
    pub pairs: Vec<(Vec<u8>, Vec<u8>)>,
    /// True when the range was truncated by a limit and more data remains
    pub more: bool,
}

#[async_trait]
pub trait KvTransaction: Send {
    async fn get(&mut self, key: &[u8], snapshot: bool) -> Result<Option<Vec<u8>>, KvError>;

    async fn get_range(&mut self, begin: KeySelector, end: KeySelector, options: RangeOptions) -> Result<RangeResult, KvError>;

    fn set(&mut self, key: &[u8], value: &[u8]);

    fn clear(&mut self, key: &[u8]);

    fn clear_range(&mut self, lo: &[u8], hi: &[u8]);

    fn atomic_op(&mut self, key: &[u8], param: &[u8], op: AtomicOp);

    /// Estimated byte size of the mutations buffered so far; the online
    /// indexer uses this to stay under the store's transaction budget.
    fn mutation_size(&self) -> usize;

    /// Commit and return the commit version. Consumes the transaction.
    async fn commit(self: Box<Self>) -> Result<u64, KvError>;
}

#[async_trait]
pub trait KvDatabase: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn KvTransaction>, KvError>;
}

/// Handle combining a backend with the retry policy.
///
/// `with_txn` runs the closure against a fresh transaction, commits, and
/// retries the whole body on retryable failures (conflict, timeout, unknown
/// commit result) with exponential backoff. Bodies must be idempotent:
/// an unknown commit result means the previous attempt may have applied.
#[derive(Clone)]
pub struct Database {
    inner: Arc<dyn KvDatabase>,
    retry: RetryOptions,
}

impl Database {
    pub fn new(inner: Arc<dyn KvDatabase>) -> Self { Self { inner, retry: RetryOptions::default() } }

    pub fn with_retry(inner: Arc<dyn KvDatabase>, retry: RetryOptions) -> Self { Self { inner, retry } }

    pub async fn begin(&self) -> Result<Box<dyn KvTransaction>, KvError> { self.inner.begin().await }

    pub async fn with_txn<T, E, F>(&self, mut body: F) -> Result<T, E>
    where
        E: From<KvError> + MaybeRetryable,
        F: for<'t> FnMut(&'t mut dyn KvTransaction) -> BoxFuture<'t, Result<T, E>>,
    {
        let mut attempt = 0usize;
        loop {
            let mut txn = self.inner.begin().await.map_err(E::from)?;
            let outcome = body(txn.as_mut()).await;
            let error: E = match outcome {
                Ok(value) => match txn.commit().await {
                    Ok(_) => return Ok(value),
                    Err(e) => E::from(e),
                },
                Err(e) => e,
            };
            if !error.is_retryable_error() || attempt + 1 >= self.retry.max_attempts {
                return Err(error);
            }
            let delay = self.retry.delay(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying transaction");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
