//! Vector index: flat store and distance math.
//!
//! Saves only touch the flat store (pk → vector bytes); the HNSW graph next
//! to it is built offline by the online indexer's graph build and queried by
//! the k-NN cursor. Exact flat scans double as the opt-in fallback when the
//! graph is unavailable.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use async_trait::async_trait;

use crate::error::{IndexError, TupleError};
use crate::index::IndexMaintainer;
use crate::kv::{KvTransaction, RangeScanner};
use crate::record::Record;
use crate::schema::{DistanceMetric, IndexDef, VectorOptions};
use crate::subspace::Subspace;
use crate::tuple::Tuple;
use crate::value::Value;

/// Flat pk → vector entries
const FLAT: &str = "F";
/// HNSW node entries
const GRAPH: &str = "G";
/// Graph metadata (entry point, built flag)
const META: &str = "M";

pub fn flat_subspace(index_subspace: &Subspace) -> Result<Subspace, TupleError> { index_subspace.sub(FLAT) }

pub fn graph_subspace(index_subspace: &Subspace) -> Result<Subspace, TupleError> { index_subspace.sub(GRAPH) }

pub fn meta_subspace(index_subspace: &Subspace) -> Result<Subspace, TupleError> { index_subspace.sub(META) }

pub fn vector_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

pub fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

/// Distance under the index's metric. Smaller is closer for all three:
/// dot similarity is negated.
pub fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f64 {
    match metric {
        DistanceMetric::Euclidean => a.iter().zip(b).map(|(x, y)| (x - y) as f64 * (x - y) as f64).sum::<f64>().sqrt(),
        DistanceMetric::Dot => -a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum::<f64>(),
        DistanceMetric::Cosine => {
            let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
            let na: f64 = a.iter().map(|x| *x as f64 * *x as f64).sum::<f64>().sqrt();
            let nb: f64 = b.iter().map(|x| *x as f64 * *x as f64).sum::<f64>().sqrt();
            if na == 0.0 || nb == 0.0 {
                1.0
            } else {
                1.0 - dot / (na * nb)
            }
        }
    }
}

struct HeapEntry {
    distance: f64,
    pk: Tuple,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool { self.distance == other.distance }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering { self.distance.total_cmp(&other.distance) }
}

/// Bounded top-k collector: a max-heap of size k on distance.
pub struct KnnHeap {
    k: usize,
    heap: BinaryHeap<HeapEntry>,
}

impl KnnHeap {
    pub fn new(k: usize) -> Self { Self { k, heap: BinaryHeap::with_capacity(k + 1) } }

    pub fn push(&mut self, distance: f64, pk: Tuple) {
        if self.heap.len() < self.k {
            self.heap.push(HeapEntry { distance, pk });
        } else if let Some(worst) = self.heap.peek() {
            if distance < worst.distance {
                self.heap.pop();
                self.heap.push(HeapEntry { distance, pk });
            }
        }
    }

    /// Ascending by distance.
    pub fn into_sorted(self) -> Vec<(f64, Tuple)> {
        let mut out: Vec<(f64, Tuple)> = self.heap.into_iter().map(|e| (e.distance, e.pk)).collect();
        out.sort_by(|a, b| a.0.total_cmp(&b.0));
        out
    }
}

/// Exact k-NN over the flat store, O(k) memory.
pub async fn flat_knn(
    txn: &mut dyn KvTransaction,
    index_subspace: &Subspace,
    metric: DistanceMetric,
    target: &[f32],
    k: usize,
) -> Result<Vec<(f64, Tuple)>, IndexError> {
    let flat = flat_subspace(index_subspace)?;
    let (lo, hi) = flat.range();
    let mut scanner = RangeScanner::over(lo, hi, true);
    let mut heap = KnnHeap::new(k);
    while let Some((key, value)) = scanner.next(txn).await? {
        let pk = flat.unpack(&key)?;
        let vector = bytes_to_vector(&value);
        heap.push(distance(metric, target, &vector), pk);
    }
    Ok(heap.into_sorted())
}

pub struct VectorMaintainer {
    index: IndexDef,
    options: VectorOptions,
    flat: Subspace,
    subspace: Subspace,
}

impl VectorMaintainer {
    pub fn new(index: IndexDef, options: VectorOptions, subspace: Subspace) -> Result<Self, TupleError> {
        let flat = flat_subspace(&subspace)?;
        Ok(Self { index, options, flat, subspace })
    }

    /// The record's vector under this index, if any. A missing or null field
    /// simply has no entry; a malformed one is an error.
    fn vector_of(&self, record: &Record) -> Result<Option<Vec<f32>>, IndexError> {
        let mut outputs = self.index.root.evaluate(record.record_type(), record)?;
        if outputs.len() != 1 || outputs[0].len() != 1 {
            return Err(IndexError::InvalidArgument(format!("vector index {} expects a single vector field", self.index.name)));
        }
        match outputs.remove(0).into_values().remove(0) {
            Value::Null => Ok(None),
            Value::Vector(v) => {
                if v.len() != self.options.dimensions {
                    return Err(IndexError::VectorDimension {
                        index: self.index.name.clone(),
                        expected: self.options.dimensions,
                        got: v.len(),
                    });
                }
                Ok(Some(v))
            }
            other => {
                Err(IndexError::InvalidArgument(format!("vector index {} expects a vector value, found {}", self.index.name, other)))
            }
        }
    }
}

#[async_trait]
impl IndexMaintainer for VectorMaintainer {
    async fn update(&self, txn: &mut dyn KvTransaction, pk: &Tuple, old: Option<&Record>, new: Option<&Record>) -> Result<(), IndexError> {
        let key = self.flat.pack(pk)?;
        let old_vec = match old {
            Some(r) => self.vector_of(r)?,
            None => None,
        };
        let new_vec = match new {
            Some(r) => self.vector_of(r)?,
            None => None,
        };
        match (old_vec, new_vec) {
            (Some(_), None) => txn.clear(&key),
            (old, Some(v)) => {
                if old.as_deref() != Some(v.as_slice()) {
                    txn.set(&key, &vector_to_bytes(&v));
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    async fn scan_record(&self, txn: &mut dyn KvTransaction, record: &Record, pk: &Tuple) -> Result<(), IndexError> {
        if let Some(v) = self.vector_of(record)? {
            txn.set(&self.flat.pack(pk)?, &vector_to_bytes(&v));
        }
        Ok(())
    }

    fn subspace(&self) -> &Subspace { &self.subspace }
}
