//! Index statistics and selectivity estimation.
//!
//! Collection samples an index's entries and persists a JSON snapshot under
//! the store's statistics subspace, keyed by (kind, index name). Snapshots
//! are overwritten on each collection and carry their collection time; stale
//! snapshots are still returned, the planner decides whether to trust them.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::kv::{KvTransaction, RangeScanner};
use crate::subspace::Subspace;
use crate::tuple::Tuple;
use crate::value::Value;

/// Heuristic selectivities used when no statistics exist.
pub const DEFAULT_EQ_SELECTIVITY: f64 = 0.01;
pub const DEFAULT_NE_SELECTIVITY: f64 = 0.99;
pub const DEFAULT_CMP_SELECTIVITY: f64 = 0.33;
pub const DEFAULT_STARTS_WITH_SELECTIVITY: f64 = 0.10;
pub const DEFAULT_CONTAINS_SELECTIVITY: f64 = 0.20;

const HISTOGRAM_BUCKETS: usize = 16;
const OVERLAP_PROBES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    Value,
    Interval,
}

impl StatsKind {
    fn as_str(self) -> &'static str {
        match self {
            StatsKind::Value => "value",
            StatsKind::Interval => "interval",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub lower: Value,
    pub upper: Value,
    pub count: u64,
    pub distinct: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueStats {
    /// Estimated distinct leading values across the whole index
    pub cardinality: u64,
    /// Estimated total entries
    pub total: u64,
    /// Equal-count buckets over the leading key element
    pub histogram: Vec<HistogramBucket>,
    pub collected_at: DateTime<Utc>,
    pub sample_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalStats {
    pub total: u64,
    pub avg_width: f64,
    /// Observed clustering relative to uniformly spread intervals
    pub overlap_factor: f64,
    /// Fraction of intervals containing a random probe point
    pub base_selectivity: f64,
    pub collected_at: DateTime<Utc>,
    pub sample_size: u64,
}

pub struct Statistics {
    subspace: Subspace,
}

impl Statistics {
    pub fn new(subspace: Subspace) -> Self { Self { subspace } }

    fn key(&self, kind: StatsKind, index: &str) -> Result<Vec<u8>, StoreError> {
        Ok(self.subspace.pack(&Tuple::from_values(vec![Value::String(kind.as_str().into()), Value::String(index.into())]))?)
    }

    pub fn is_stale(collected_at: DateTime<Utc>, threshold: chrono::Duration) -> bool { Utc::now() - collected_at > threshold }

    /// Sample a value index and persist the snapshot. `sample_rate` in
    /// (0, 1]; every entry is counted, roughly `rate` of them are sampled.
    pub async fn collect_value(
        &self,
        txn: &mut dyn KvTransaction,
        index_subspace: &Subspace,
        index: &str,
        sample_rate: f64,
        rng: &mut (dyn rand::RngCore + Send),
    ) -> Result<ValueStats, StoreError> {
        let (lo, hi) = index_subspace.range();
        let mut scanner = RangeScanner::over(lo, hi, true);
        let mut total = 0u64;
        let mut samples: Vec<Value> = Vec::new();
        while let Some((key, _)) = scanner.next(txn).await? {
            total += 1;
            if rng.gen::<f64>() <= sample_rate {
                let tuple = index_subspace.unpack(&key)?;
                if let Some(first) = tuple.elements().first() {
                    samples.push(first.clone());
                }
            }
        }
        samples.sort_by(|a, b| a.cmp_order(b));

        let distinct_sampled = count_distinct(&samples);
        let scale = if sample_rate > 0.0 { 1.0 / sample_rate } else { 1.0 };
        let stats = ValueStats {
            cardinality: (distinct_sampled as f64 * scale) as u64,
            total,
            histogram: build_histogram(&samples, scale),
            collected_at: Utc::now(),
            sample_size: samples.len() as u64,
        };
        self.persist(txn, StatsKind::Value, index, &stats)?;
        debug!(index, total, samples = stats.sample_size, "collected value statistics");
        Ok(stats)
    }

    /// Sample an interval index (lower/upper boundary pair root). Widths are
    /// averaged; overlap is probed at random points drawn from the sampled
    /// boundaries.
    pub async fn collect_interval(
        &self,
        txn: &mut dyn KvTransaction,
        index_subspace: &Subspace,
        index: &str,
        sample_rate: f64,
        rng: &mut (dyn rand::RngCore + Send),
    ) -> Result<IntervalStats, StoreError> {
        let (lo, hi) = index_subspace.range();
        let mut scanner = RangeScanner::over(lo, hi, true);
        let mut total = 0u64;
        let mut intervals: Vec<(f64, f64)> = Vec::new();
        while let Some((key, _)) = scanner.next(txn).await? {
            total += 1;
            if rng.gen::<f64>() <= sample_rate {
                let tuple = index_subspace.unpack(&key)?;
                if let (Some(lo_v), Some(hi_v)) = (tuple.elements().first(), tuple.elements().get(1)) {
                    if let (Some(a), Some(b)) = (lo_v.as_f64(), hi_v.as_f64()) {
                        if b >= a {
                            intervals.push((a, b));
                        }
                    }
                }
            }
        }

        let sample_size = intervals.len() as u64;
        let avg_width = if intervals.is_empty() {
            0.0
        } else {
            intervals.iter().map(|(a, b)| b - a).sum::<f64>() / intervals.len() as f64
        };

        // Probe random points inside the sampled span and measure how many
        // intervals cover each
        let (span_lo, span_hi) = intervals
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (a, b)| (lo.min(*a), hi.max(*b)));
        let base_selectivity = if intervals.is_empty() || span_hi <= span_lo {
            0.0
        } else {
            let mut acc = 0.0;
            for _ in 0..OVERLAP_PROBES {
                let p = rng.gen_range(span_lo..span_hi);
                let covering = intervals.iter().filter(|(a, b)| *a <= p && p < *b).count();
                acc += covering as f64 / intervals.len() as f64;
            }
            acc / OVERLAP_PROBES as f64
        };
        // Uniformly spread intervals would cover avg_width / span of the
        // line; the ratio to that is the clustering factor
        let overlap_factor = if span_hi > span_lo && avg_width > 0.0 {
            let uniform = avg_width / (span_hi - span_lo);
            if uniform > 0.0 {
                (base_selectivity / uniform).max(0.1)
            } else {
                1.0
            }
        } else {
            1.0
        };

        let stats =
            IntervalStats { total, avg_width, overlap_factor, base_selectivity, collected_at: Utc::now(), sample_size };
        self.persist(txn, StatsKind::Interval, index, &stats)?;
        debug!(index, total, sample_size, avg_width, "collected interval statistics");
        Ok(stats)
    }

    fn persist<S: Serialize>(&self, txn: &mut dyn KvTransaction, kind: StatsKind, index: &str, stats: &S) -> Result<(), StoreError> {
        let key = self.key(kind, index)?;
        let json = serde_json::to_vec(stats)?;
        txn.set(&key, &json);
        Ok(())
    }

    pub async fn load_value(&self, txn: &mut dyn KvTransaction, index: &str) -> Result<Option<ValueStats>, StoreError> {
        let key = self.key(StatsKind::Value, index)?;
        match txn.get(&key, true).await? {
            None => Ok(None),
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(stats) => Ok(Some(stats)),
                Err(e) => {
                    warn!(index, error = %e, "discarding unreadable value statistics");
                    Ok(None)
                }
            },
        }
    }

    pub async fn load_interval(&self, txn: &mut dyn KvTransaction, index: &str) -> Result<Option<IntervalStats>, StoreError> {
        let key = self.key(StatsKind::Interval, index)?;
        match txn.get(&key, true).await? {
            None => Ok(None),
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(stats) => Ok(Some(stats)),
                Err(e) => {
                    warn!(index, error = %e, "discarding unreadable interval statistics");
                    Ok(None)
                }
            },
        }
    }
}

fn count_distinct(sorted: &[Value]) -> u64 {
    let mut distinct = 0u64;
    let mut prev: Option<&Value> = None;
    for v in sorted {
        if prev.map(|p| p.cmp_order(v) != std::cmp::Ordering::Equal).unwrap_or(true) {
            distinct += 1;
        }
        prev = Some(v);
    }
    distinct
}

/// Equal-count buckets over sorted samples, scaled back to population counts.
fn build_histogram(sorted: &[Value], scale: f64) -> Vec<HistogramBucket> {
    if sorted.is_empty() {
        return Vec::new();
    }
    let per_bucket = (sorted.len() / HISTOGRAM_BUCKETS).max(1);
    let mut buckets = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let end = (i + per_bucket).min(sorted.len());
        let slice = &sorted[i..end];
        buckets.push(HistogramBucket {
            lower: slice[0].clone(),
            upper: slice[slice.len() - 1].clone(),
            count: (slice.len() as f64 * scale) as u64,
            distinct: count_distinct(slice),
        });
        i = end;
    }
    buckets
}

impl ValueStats {
    fn population(&self) -> f64 { self.histogram.iter().map(|b| b.count as f64).sum::<f64>().max(1.0) }

    /// Estimated fraction of entries equal to `v`; zero outside all buckets.
    pub fn selectivity_eq(&self, v: &Value) -> f64 {
        if self.histogram.is_empty() {
            return DEFAULT_EQ_SELECTIVITY;
        }
        let population = self.population();
        for bucket in &self.histogram {
            if in_bucket(v, bucket) {
                let per_value = bucket.count as f64 / bucket.distinct.max(1) as f64;
                return (per_value / population).clamp(0.0, 1.0);
            }
        }
        0.0
    }

    /// Estimated fraction of entries inside the (half-open or open-ended)
    /// range.
    pub fn selectivity_range(&self, lower: Option<&Value>, upper: Option<&Value>) -> f64 {
        if self.histogram.is_empty() {
            return DEFAULT_CMP_SELECTIVITY;
        }
        let population = self.population();
        let mut covered = 0.0;
        for bucket in &self.histogram {
            covered += bucket.count as f64 * bucket_fraction(bucket, lower, upper);
        }
        (covered / population).clamp(0.0, 1.0)
    }
}

fn in_bucket(v: &Value, bucket: &HistogramBucket) -> bool {
    use std::cmp::Ordering::*;
    !matches!(v.cmp_order(&bucket.lower), Less) && !matches!(v.cmp_order(&bucket.upper), Greater)
}

/// Fraction of one bucket covered by the query range: 1 when fully inside,
/// linear interpolation for numeric partial overlap, half otherwise.
fn bucket_fraction(bucket: &HistogramBucket, lower: Option<&Value>, upper: Option<&Value>) -> f64 {
    use std::cmp::Ordering::*;
    let below = |v: &Value, w: &Value| matches!(v.cmp_order(w), Less);

    if let Some(u) = upper {
        if below(u, &bucket.lower) || u.cmp_order(&bucket.lower) == Equal {
            return 0.0;
        }
    }
    if let Some(l) = lower {
        if below(&bucket.upper, l) {
            return 0.0;
        }
    }
    let lower_inside = lower.map(|l| below(&bucket.lower, l)).unwrap_or(false);
    let upper_inside = upper.map(|u| below(u, &bucket.upper)).unwrap_or(false);
    if !lower_inside && !upper_inside {
        return 1.0;
    }
    // Partial overlap: interpolate when the bounds are numeric
    match (bucket.lower.as_f64(), bucket.upper.as_f64()) {
        (Some(b_lo), Some(b_hi)) if b_hi > b_lo => {
            let q_lo = lower.and_then(|l| l.as_f64()).unwrap_or(b_lo).max(b_lo);
            let q_hi = upper.and_then(|u| u.as_f64()).unwrap_or(b_hi).min(b_hi);
            ((q_hi - q_lo) / (b_hi - b_lo)).clamp(0.0, 1.0)
        }
        _ => 0.5,
    }
}

impl IntervalStats {
    /// Estimated fraction of intervals overlapping a query window of the
    /// given width: min(1, (width / avgWidth) · overlapFactor · baseSelectivity).
    pub fn selectivity_overlap(&self, query_width: f64) -> f64 {
        if self.avg_width <= 0.0 {
            return self.base_selectivity.clamp(0.0, 1.0);
        }
        let ratio = query_width / self.avg_width;
        (ratio * self.overlap_factor * self.base_selectivity).clamp(0.0, 1.0)
    }
}

/// Independence-assumption combinators.
pub fn and_selectivity(a: f64, b: f64) -> f64 { (a * b).clamp(0.0, 1.0) }

pub fn or_selectivity(a: f64, b: f64) -> f64 { (1.0 - (1.0 - a) * (1.0 - b)).clamp(0.0, 1.0) }

pub fn not_selectivity(a: f64) -> f64 { (1.0 - a).clamp(0.0, 1.0) }
