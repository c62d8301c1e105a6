//! Index lifecycle state machine.
//!
//! One byte per index lives under the store's state subspace. Allowed
//! transitions: disabled → write-only (enable), write-only → readable
//! (mark-readable), anything → disabled (disable). Everything else fails.
//!
//! The manager is the single writer of state entries for its store and keeps
//! a short-TTL read cache; the cache is advisory only — writers drop the
//! cached entry rather than updating it, because the surrounding transaction
//! may still abort.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::info;

use crate::error::{IndexError, KvError};
use crate::kv::KvTransaction;
use crate::subspace::Subspace;
use crate::tuple::Tuple;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexState {
    /// Ignored by writers and queries; the default for a never-built index
    Disabled,
    /// Maintained on every write, not yet queryable
    WriteOnly,
    /// Fully built and queryable
    Readable,
}

impl IndexState {
    fn to_byte(self) -> u8 {
        match self {
            IndexState::Disabled => 0,
            IndexState::WriteOnly => 1,
            IndexState::Readable => 2,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(IndexState::Disabled),
            1 => Some(IndexState::WriteOnly),
            2 => Some(IndexState::Readable),
            _ => None,
        }
    }

    /// Maintained states receive index updates on record writes.
    pub fn is_maintained(self) -> bool { matches!(self, IndexState::WriteOnly | IndexState::Readable) }
}

const CACHE_TTL: Duration = Duration::from_secs(3);

pub struct IndexStateManager {
    subspace: Subspace,
    cache: DashMap<String, (IndexState, Instant)>,
    write_lock: tokio::sync::Mutex<()>,
    ttl: Duration,
}

impl IndexStateManager {
    pub fn new(subspace: Subspace) -> Self {
        Self { subspace, cache: DashMap::new(), write_lock: tokio::sync::Mutex::new(()), ttl: CACHE_TTL }
    }

    #[cfg(test)]
    pub fn with_ttl(subspace: Subspace, ttl: Duration) -> Self {
        Self { subspace, cache: DashMap::new(), write_lock: tokio::sync::Mutex::new(()), ttl }
    }

    fn state_key(&self, index: &str) -> Result<Vec<u8>, IndexError> { Ok(self.subspace.pack(&Tuple::single(index))?) }

    /// Current state, served from the TTL cache when fresh.
    pub async fn state(&self, txn: &mut dyn KvTransaction, index: &str) -> Result<IndexState, IndexError> {
        if let Some(entry) = self.cache.get(index) {
            let (state, at) = *entry;
            if at.elapsed() < self.ttl {
                return Ok(state);
            }
        }
        let state = self.read_state(txn, index).await?;
        self.cache.insert(index.to_string(), (state, Instant::now()));
        Ok(state)
    }

    /// Batch read, one transaction, bypassing the cache.
    pub async fn states(&self, txn: &mut dyn KvTransaction, names: &[&str]) -> Result<HashMap<String, IndexState>, IndexError> {
        let mut out = HashMap::with_capacity(names.len());
        for name in names {
            let state = self.read_state(txn, name).await?;
            self.cache.insert(name.to_string(), (state, Instant::now()));
            out.insert(name.to_string(), state);
        }
        Ok(out)
    }

    async fn read_state(&self, txn: &mut dyn KvTransaction, index: &str) -> Result<IndexState, IndexError> {
        let key = self.state_key(index)?;
        match txn.get(&key, false).await? {
            None => Ok(IndexState::Disabled),
            Some(bytes) => {
                let b = bytes.first().copied().unwrap_or(0);
                IndexState::from_byte(b)
                    .ok_or_else(|| IndexError::Kv(KvError::Backend(format!("corrupt state byte {} for index {}", b, index))))
            }
        }
    }

    /// disabled → write-only.
    pub async fn enable(&self, txn: &mut dyn KvTransaction, index: &str) -> Result<(), IndexError> {
        self.transition(txn, index, IndexState::WriteOnly, &[IndexState::Disabled]).await
    }

    /// write-only → readable.
    pub async fn mark_readable(&self, txn: &mut dyn KvTransaction, index: &str) -> Result<(), IndexError> {
        self.transition(txn, index, IndexState::Readable, &[IndexState::WriteOnly]).await
    }

    /// any → disabled.
    pub async fn disable(&self, txn: &mut dyn KvTransaction, index: &str) -> Result<(), IndexError> {
        self.transition(txn, index, IndexState::Disabled, &[IndexState::Disabled, IndexState::WriteOnly, IndexState::Readable]).await
    }

    async fn transition(
        &self,
        txn: &mut dyn KvTransaction,
        index: &str,
        to: IndexState,
        allowed_from: &[IndexState],
    ) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        let from = self.read_state(txn, index).await?;
        if !allowed_from.contains(&from) {
            return Err(IndexError::InvalidStateTransition { index: index.to_string(), from, to });
        }
        let key = self.state_key(index)?;
        txn.set(&key, &[to.to_byte()]);
        // Drop rather than update: the enclosing transaction may yet abort
        self.cache.remove(index);
        info!(index, ?from, ?to, "index state transition");
        Ok(())
    }
}
