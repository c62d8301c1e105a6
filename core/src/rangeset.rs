//! Completed-interval tracking for online index builds.
//!
//! Each entry maps the lower bound of a completed half-open byte interval to
//! its upper bound. Inserts merge with overlapping and adjacent neighbors,
//! so the stored intervals are always pairwise disjoint and non-adjacent.
//! Everything runs inside the caller's transaction; insert is idempotent.

use crate::error::KvError;
use crate::kv::{KeySelector, KvTransaction, RangeOptions, RangeScanner};
use crate::subspace::Subspace;
use crate::tuple::Tuple;
use crate::value::Value;

#[derive(Clone)]
pub struct RangeSet {
    subspace: Subspace,
}

impl RangeSet {
    pub fn new(subspace: Subspace) -> Self { Self { subspace } }

    fn key(&self, lo: &[u8]) -> Result<Vec<u8>, KvError> {
        self.subspace.pack(&Tuple::single(Value::Bytes(lo.to_vec()))).map_err(|e| KvError::Backend(e.to_string()))
    }

    fn decode_lo(&self, key: &[u8]) -> Result<Vec<u8>, KvError> {
        let tuple = self.subspace.unpack(key).map_err(|e| KvError::Backend(e.to_string()))?;
        match tuple.into_values().pop() {
            Some(Value::Bytes(lo)) => Ok(lo),
            _ => Err(KvError::Backend("range set entry key is not a byte interval bound".into())),
        }
    }

    /// Record `[lo, hi)` as completed, merging with neighbors.
    pub async fn insert(&self, txn: &mut dyn KvTransaction, lo: &[u8], hi: &[u8]) -> Result<(), KvError> {
        if lo >= hi {
            return Ok(());
        }
        let mut new_lo = lo.to_vec();
        let mut new_hi = hi.to_vec();

        // Neighbor ending at or beyond lo: merge and absorb
        if let Some((prev_lo, prev_hi)) = self.previous_entry(txn, lo).await? {
            if prev_hi >= new_lo {
                if prev_lo <= new_lo && prev_hi >= new_hi {
                    return Ok(()); // already covered
                }
                txn.clear(&self.key(&prev_lo)?);
                new_lo = prev_lo;
                if prev_hi > new_hi {
                    new_hi = prev_hi;
                }
            }
        }

        // Absorb every interval starting inside [new_lo, hi] (== hi merges
        // adjacency away)
        let begin = KeySelector::first_greater_or_equal(self.key(&new_lo)?);
        let end = KeySelector::first_greater_than(self.key(hi)?);
        let mut scanner = RangeScanner::new(begin, end, false);
        while let Some((key, value)) = scanner.next(txn).await? {
            txn.clear(&key);
            if value > new_hi {
                new_hi = value;
            }
        }

        txn.set(&self.key(&new_lo)?, &new_hi);
        Ok(())
    }

    async fn previous_entry(&self, txn: &mut dyn KvTransaction, at: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, KvError> {
        let (range_lo, _) = self.subspace.range();
        let result = txn
            .get_range(
                KeySelector::first_greater_or_equal(range_lo),
                KeySelector::first_greater_than(self.key(at)?),
                RangeOptions { limit: Some(1), reverse: true, snapshot: false },
            )
            .await?;
        match result.pairs.into_iter().next() {
            Some((key, value)) => Ok(Some((self.decode_lo(&key)?, value))),
            None => Ok(None),
        }
    }

    /// The first uncompleted gap strictly inside `[after, total_end)`.
    /// When `after` falls inside a completed interval the search resumes at
    /// that interval's upper bound.
    pub async fn next_incomplete(
        &self,
        txn: &mut dyn KvTransaction,
        after: &[u8],
        total_end: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, KvError> {
        let mut cursor = after.to_vec();
        if let Some((_, prev_hi)) = self.previous_entry(txn, &cursor).await? {
            if prev_hi > cursor {
                cursor = prev_hi;
            }
        }
        loop {
            if cursor.as_slice() >= total_end {
                return Ok(None);
            }
            let begin = KeySelector::first_greater_or_equal(self.key(&cursor)?);
            let (_, range_hi) = self.subspace.range();
            let result = txn
                .get_range(
                    begin,
                    KeySelector::first_greater_or_equal(range_hi),
                    RangeOptions { limit: Some(1), reverse: false, snapshot: false },
                )
                .await?;
            match result.pairs.into_iter().next() {
                None => return Ok(Some((cursor, total_end.to_vec()))),
                Some((key, value)) => {
                    let next_lo = self.decode_lo(&key)?;
                    if next_lo > cursor {
                        let gap_hi = next_lo.min(total_end.to_vec());
                        return Ok(Some((cursor, gap_hi)));
                    }
                    // Entry starts exactly at the cursor; hop over it
                    cursor = value;
                }
            }
        }
    }

    /// All stored intervals in order (mainly for progress and tests).
    pub async fn ranges(&self, txn: &mut dyn KvTransaction) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        let (lo, hi) = self.subspace.range();
        let mut scanner = RangeScanner::over(lo, hi, true);
        let mut out = Vec::new();
        while let Some((key, value)) = scanner.next(txn).await? {
            out.push((self.decode_lo(&key)?, value));
        }
        Ok(out)
    }

    /// Completed fraction of `[total_lo, total_hi)`.
    ///
    /// Approximate: interval widths are byte-lexicographic, which does not
    /// correspond to record counts — treat this as an order-of-magnitude
    /// indicator, not an ETA.
    pub async fn progress(&self, txn: &mut dyn KvTransaction, total_lo: &[u8], total_hi: &[u8]) -> Result<f64, KvError> {
        let span = byte_fraction(total_hi) - byte_fraction(total_lo);
        if span <= 0.0 {
            return Ok(1.0);
        }
        let mut covered = 0.0;
        for (lo, hi) in self.ranges(txn).await? {
            let lo = lo.max(total_lo.to_vec());
            let hi = hi.min(total_hi.to_vec());
            if lo < hi {
                covered += byte_fraction(&hi) - byte_fraction(&lo);
            }
        }
        Ok((covered / span).clamp(0.0, 1.0))
    }

    pub async fn clear(&self, txn: &mut dyn KvTransaction) -> Result<(), KvError> {
        let (lo, hi) = self.subspace.range();
        txn.clear_range(&lo, &hi);
        Ok(())
    }
}

/// Position of a key in [0, 1) by reading its first eight bytes as a
/// big-endian fraction.
fn byte_fraction(key: &[u8]) -> f64 {
    let mut buf = [0u8; 8];
    let n = key.len().min(8);
    buf[..n].copy_from_slice(&key[..n]);
    u64::from_be_bytes(buf) as f64 / u64::MAX as f64
}
