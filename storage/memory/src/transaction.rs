//! Optimistic transaction over the shared tree.
//!
//! Reads see committed data overlaid with the transaction's own mutations
//! (read-your-writes). Non-snapshot reads record conflict ranges; commit
//! validates them against every version committed since the transaction
//! began and applies the mutation log atomically under the store lock.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;

use keel_core::error::KvError;
use keel_core::kv::{AtomicOp, KeySelector, KvTransaction, RangeOptions, RangeResult};

use crate::{MemoryDatabaseOptions, Shared};

#[derive(Debug, Clone)]
enum Mutation {
    Set(Vec<u8>),
    Clear,
    /// Pending little-endian add; resolved against the committed value at
    /// apply time unless a Set intervened
    Add(i64),
}

pub struct MemoryTransaction {
    shared: Arc<Mutex<Shared>>,
    options: MemoryDatabaseOptions,
    started: Instant,
    read_version: u64,
    /// Conflict ranges registered by non-snapshot reads
    reads: Vec<(Vec<u8>, Vec<u8>)>,
    /// Point mutations with their op sequence
    writes: BTreeMap<Vec<u8>, (u64, Mutation)>,
    /// Range clears with their op sequence
    clears: Vec<(u64, Vec<u8>, Vec<u8>)>,
    /// Versionstamped-key templates (offset rides in the last 4 bytes)
    stamped: Vec<(Vec<u8>, Vec<u8>)>,
    seq: u64,
    mutation_bytes: usize,
    closed: bool,
}

impl MemoryTransaction {
    pub(crate) fn new(shared: Arc<Mutex<Shared>>, options: MemoryDatabaseOptions, read_version: u64) -> Self {
        Self {
            shared,
            options,
            started: Instant::now(),
            read_version,
            reads: Vec::new(),
            writes: BTreeMap::new(),
            clears: Vec::new(),
            stamped: Vec::new(),
            seq: 0,
            mutation_bytes: 0,
            closed: false,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn track(&mut self, bytes: usize) { self.mutation_bytes += bytes; }

    /// Latest clear sequence covering the key, zero when none does.
    fn clear_seq_over(&self, key: &[u8]) -> u64 {
        self.clears.iter().filter(|(_, lo, hi)| lo.as_slice() <= key && key < hi.as_slice()).map(|(s, _, _)| *s).max().unwrap_or(0)
    }

    /// The key's value as this transaction sees it.
    fn effective_value(&self, committed: Option<&Vec<u8>>, key: &[u8]) -> Option<Vec<u8>> {
        let clear_seq = self.clear_seq_over(key);
        let base = if clear_seq == 0 { committed.cloned() } else { None };
        match self.writes.get(key) {
            Some((seq, mutation)) if *seq > clear_seq => match mutation {
                Mutation::Set(v) => Some(v.clone()),
                Mutation::Clear => None,
                Mutation::Add(delta) => Some(add_le(base.as_deref(), *delta)),
            },
            _ => base,
        }
    }

    /// Merged committed + overlay view of a key range.
    fn merged_range(&self, shared: &Shared, lo: &[u8], hi: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for (k, v) in shared.data.range::<[u8], _>((Bound::Included(lo), Bound::Excluded(hi))) {
            if let Some(value) = self.effective_value(Some(v), k) {
                merged.insert(k.clone(), value);
            }
        }
        for (k, _) in self.writes.range::<[u8], _>((Bound::Included(lo), Bound::Excluded(hi))) {
            if merged.contains_key(k) {
                continue;
            }
            if let Some(value) = self.effective_value(shared.data.get(k), k) {
                merged.insert(k.clone(), value);
            }
        }
        merged.into_iter().collect()
    }

    /// Resolve a selector to a byte position: begin selectors are inclusive
    /// at the position, end selectors exclusive.
    fn resolve_selector(&self, shared: &Shared, selector: &KeySelector) -> Vec<u8> {
        match selector {
            KeySelector::FirstGreaterOrEqual(k) => k.clone(),
            KeySelector::FirstGreaterThan(k) => {
                let mut key = k.clone();
                key.push(0x00);
                key
            }
            KeySelector::LastLessOrEqual(k) => {
                let mut probe = k.clone();
                probe.push(0x00);
                let below = self.merged_range(shared, &[], &probe);
                below.last().map(|(key, _)| key.clone()).unwrap_or_default()
            }
        }
    }

    fn guard_open(&self) -> Result<(), KvError> {
        if self.closed {
            return Err(KvError::TransactionClosed);
        }
        if self.mutation_bytes > self.options.max_txn_bytes {
            return Err(KvError::TransactionTooLarge { size: self.mutation_bytes, limit: self.options.max_txn_bytes });
        }
        Ok(())
    }
}

#[async_trait]
impl KvTransaction for MemoryTransaction {
    async fn get(&mut self, key: &[u8], snapshot: bool) -> Result<Option<Vec<u8>>, KvError> {
        self.guard_open()?;
        if !snapshot {
            let mut end = key.to_vec();
            end.push(0x00);
            self.reads.push((key.to_vec(), end));
        }
        let shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.effective_value(shared.data.get(key), key))
    }

    async fn get_range(&mut self, begin: KeySelector, end: KeySelector, options: RangeOptions) -> Result<RangeResult, KvError> {
        self.guard_open()?;
        let shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        let lo = self.resolve_selector(&shared, &begin);
        let hi = self.resolve_selector(&shared, &end);
        if lo >= hi {
            return Ok(RangeResult::default());
        }
        if !options.snapshot {
            self.reads.push((lo.clone(), hi.clone()));
        }
        let mut pairs = self.merged_range(&shared, &lo, &hi);
        if options.reverse {
            pairs.reverse();
        }
        let mut more = false;
        if let Some(limit) = options.limit {
            if pairs.len() > limit {
                pairs.truncate(limit);
                more = true;
            }
        }
        Ok(RangeResult { pairs, more })
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        let seq = self.next_seq();
        self.track(key.len() + value.len());
        self.writes.insert(key.to_vec(), (seq, Mutation::Set(value.to_vec())));
    }

    fn clear(&mut self, key: &[u8]) {
        let seq = self.next_seq();
        self.track(key.len());
        self.writes.insert(key.to_vec(), (seq, Mutation::Clear));
    }

    fn clear_range(&mut self, lo: &[u8], hi: &[u8]) {
        let seq = self.next_seq();
        self.track(lo.len() + hi.len());
        // Drop overlay point writes the clear supersedes
        let covered: Vec<Vec<u8>> = self
            .writes
            .range::<[u8], _>((Bound::Included(lo), Bound::Excluded(hi)))
            .map(|(k, _)| k.clone())
            .collect();
        for k in covered {
            self.writes.remove(&k);
        }
        self.clears.push((seq, lo.to_vec(), hi.to_vec()));
    }

    fn atomic_op(&mut self, key: &[u8], param: &[u8], op: AtomicOp) {
        match op {
            AtomicOp::Add => {
                let delta = i64_from_le(param);
                let seq = self.next_seq();
                self.track(key.len() + 8);
                let clear_seq = self.clear_seq_over(key);
                let folded = match self.writes.get(key) {
                    Some((prev_seq, mutation)) if *prev_seq > clear_seq => match mutation {
                        Mutation::Set(v) => Mutation::Set(add_le(Some(v), delta)),
                        Mutation::Add(d) => Mutation::Add(d + delta),
                        Mutation::Clear => Mutation::Set(add_le(None, delta)),
                    },
                    _ if clear_seq > 0 => Mutation::Set(add_le(None, delta)),
                    _ => Mutation::Add(delta),
                };
                self.writes.insert(key.to_vec(), (seq, folded));
            }
            AtomicOp::SetVersionstampedKey => {
                self.track(key.len() + param.len());
                self.stamped.push((key.to_vec(), param.to_vec()));
            }
        }
    }

    fn mutation_size(&self) -> usize { self.mutation_bytes }

    async fn commit(mut self: Box<Self>) -> Result<u64, KvError> {
        self.guard_open()?;
        self.closed = true;
        if self.started.elapsed() > self.options.max_txn_duration {
            return Err(KvError::Timeout);
        }

        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        if shared.fail_commits > 0 {
            shared.fail_commits -= 1;
            return Err(KvError::Conflict);
        }

        // Validate the read set against everything committed since we began
        if let Some((oldest, _)) = shared.recent_writes.front() {
            if self.read_version + 1 < *oldest && !self.reads.is_empty() {
                // History needed for validation is gone
                return Err(KvError::Conflict);
            }
        }
        for (version, write_ranges) in shared.recent_writes.iter() {
            if *version <= self.read_version {
                continue;
            }
            for (w_lo, w_hi) in write_ranges {
                for (r_lo, r_hi) in &self.reads {
                    if w_lo < r_hi && r_lo < w_hi {
                        return Err(KvError::Conflict);
                    }
                }
            }
        }

        shared.version += 1;
        let commit_version = shared.version;

        // Apply the mutation log in op order
        let mut ops: Vec<(u64, Op)> = Vec::with_capacity(self.writes.len() + self.clears.len());
        for (key, (seq, mutation)) in std::mem::take(&mut self.writes) {
            ops.push((seq, Op::Point(key, mutation)));
        }
        for (seq, lo, hi) in std::mem::take(&mut self.clears) {
            ops.push((seq, Op::ClearRange(lo, hi)));
        }
        ops.sort_by_key(|(seq, _)| *seq);

        let mut write_ranges = Vec::new();
        for (_, op) in ops {
            match op {
                Op::Point(key, mutation) => {
                    let mut end = key.clone();
                    end.push(0x00);
                    write_ranges.push((key.clone(), end));
                    match mutation {
                        Mutation::Set(v) => {
                            shared.data.insert(key, v);
                        }
                        Mutation::Clear => {
                            shared.data.remove(&key);
                        }
                        Mutation::Add(delta) => {
                            let next = add_le(shared.data.get(&key).map(|v| v.as_slice()), delta);
                            shared.data.insert(key, next);
                        }
                    }
                }
                Op::ClearRange(lo, hi) => {
                    let doomed: Vec<Vec<u8>> = shared
                        .data
                        .range::<[u8], _>((Bound::Included(lo.as_slice()), Bound::Excluded(hi.as_slice())))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in doomed {
                        shared.data.remove(&k);
                    }
                    write_ranges.push((lo, hi));
                }
            }
        }

        // Versionstamped keys: 8-byte big-endian commit version + 2-byte
        // batch order over the first ten placeholder bytes
        for (template, value) in std::mem::take(&mut self.stamped) {
            if template.len() < 4 {
                continue;
            }
            let (key_part, offset_part) = template.split_at(template.len() - 4);
            let offset = u32::from_le_bytes([offset_part[0], offset_part[1], offset_part[2], offset_part[3]]) as usize;
            let mut key = key_part.to_vec();
            if offset + 10 > key.len() {
                continue;
            }
            key[offset..offset + 8].copy_from_slice(&commit_version.to_be_bytes());
            key[offset + 8..offset + 10].copy_from_slice(&[0, 0]);
            let mut end = key.clone();
            end.push(0x00);
            write_ranges.push((key.clone(), end));
            shared.data.insert(key, value);
        }

        if !write_ranges.is_empty() {
            shared.recent_writes.push_back((commit_version, write_ranges));
            while shared.recent_writes.len() > self.options.retained_versions {
                shared.recent_writes.pop_front();
            }
        }
        Ok(commit_version)
    }
}

enum Op {
    Point(Vec<u8>, Mutation),
    ClearRange(Vec<u8>, Vec<u8>),
}

fn i64_from_le(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    i64::from_le_bytes(buf)
}

fn add_le(base: Option<&[u8]>, delta: i64) -> Vec<u8> {
    let current = base.map(i64_from_le).unwrap_or(0);
    current.wrapping_add(delta).to_le_bytes().to_vec()
}
