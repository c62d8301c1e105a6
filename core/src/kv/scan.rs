use std::collections::VecDeque;

use crate::error::KvError;
use crate::kv::{KeySelector, KvTransaction, RangeOptions};

const DEFAULT_PAGE: usize = 256;

/// Streaming iteration over a key range.
///
/// Backends return ranges in bounded pages; the scanner re-issues
/// continuation reads so callers see one uninterrupted stream without the
/// whole range ever being resident.
pub struct RangeScanner {
    begin: KeySelector,
    end: KeySelector,
    snapshot: bool,
    reverse: bool,
    page_size: usize,
    remaining: Option<usize>,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    exhausted: bool,
}

impl RangeScanner {
    pub fn new(begin: KeySelector, end: KeySelector, snapshot: bool) -> Self {
        Self { begin, end, snapshot, reverse: false, page_size: DEFAULT_PAGE, remaining: None, buffer: VecDeque::new(), exhausted: false }
    }

    /// Scan the whole half-open interval `[lo, hi)`.
    pub fn over(lo: impl Into<Vec<u8>>, hi: impl Into<Vec<u8>>, snapshot: bool) -> Self {
        Self::new(KeySelector::first_greater_or_equal(lo), KeySelector::first_greater_or_equal(hi), snapshot)
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.remaining = Some(limit);
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn next(&mut self, txn: &mut dyn KvTransaction) -> Result<Option<(Vec<u8>, Vec<u8>)>, KvError> {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        if self.buffer.is_empty() && !self.exhausted {
            self.fill(txn).await?;
        }
        match self.buffer.pop_front() {
            Some(pair) => {
                if let Some(r) = self.remaining.as_mut() {
                    *r -= 1;
                }
                Ok(Some(pair))
            }
            None => Ok(None),
        }
    }

    async fn fill(&mut self, txn: &mut dyn KvTransaction) -> Result<(), KvError> {
        let page_limit = match self.remaining {
            Some(r) => r.min(self.page_size),
            None => self.page_size,
        };
        let result = txn
            .get_range(
                self.begin.clone(),
                self.end.clone(),
                RangeOptions { limit: Some(page_limit), reverse: self.reverse, snapshot: self.snapshot },
            )
            .await?;

        let full_page = result.pairs.len() == page_limit;
        if let Some((last_key, _)) = result.pairs.last() {
            if self.reverse {
                // Continue strictly below the smallest key seen so far
                self.end = KeySelector::first_greater_or_equal(last_key.clone());
            } else {
                self.begin = KeySelector::first_greater_than(last_key.clone());
            }
        }
        if !(result.more || full_page) {
            self.exhausted = true;
        }
        self.buffer.extend(result.pairs);
        if self.buffer.is_empty() {
            self.exhausted = true;
        }
        Ok(())
    }
}
