//! HNSW graph persisted in the key-value store.
//!
//! Layered navigable-small-world search: each element gets a random level;
//! upper layers form coarse shortcuts, layer zero holds everyone. Nodes are
//! stored one key per element under the index's graph subspace, vectors come
//! from the flat store, and a small meta record carries the entry point and
//! the built flag. Inserts and searches run inside the caller's transaction,
//! so the online builder can construct the graph in batches and commit each
//! one.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, KvError, TupleError};
use crate::kv::KvTransaction;
use crate::schema::VectorOptions;
use crate::subspace::Subspace;
use crate::tuple::Tuple;

use super::vector::{bytes_to_vector, distance, flat_subspace, graph_subspace, meta_subspace};

const MAX_GRAPH_LEVEL: u8 = 16;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GraphMeta {
    pub built: bool,
    pub entry: Option<Vec<u8>>,
    pub max_level: u8,
    pub count: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct GraphNode {
    level: u8,
    /// Neighbor ids per layer, index 0 = ground layer
    neighbors: Vec<Vec<Vec<u8>>>,
}

impl GraphNode {
    fn new(level: u8) -> Self { Self { level, neighbors: vec![Vec::new(); level as usize + 1] } }
}

/// Distance-ordered candidate for the search heaps.
#[derive(Clone)]
struct Candidate(f64, Vec<u8>);

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool { self.0 == other.0 && self.1 == other.1 }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering { self.0.total_cmp(&other.0).then_with(|| self.1.cmp(&other.1)) }
}

pub struct HnswGraph {
    options: VectorOptions,
    flat: Subspace,
    graph: Subspace,
    meta_key: Vec<u8>,
    /// Level normalization factor, 1/ln(m)
    ml: f64,
}

impl HnswGraph {
    pub fn new(index_subspace: &Subspace, options: VectorOptions) -> Result<Self, TupleError> {
        let flat = flat_subspace(index_subspace)?;
        let graph = graph_subspace(index_subspace)?;
        let meta_key = meta_subspace(index_subspace)?.pack(&Tuple::new())?;
        let ml = 1.0 / (options.m as f64).ln();
        Ok(Self { options, flat, graph, meta_key, ml })
    }

    pub async fn meta(&self, txn: &mut dyn KvTransaction) -> Result<GraphMeta, IndexError> {
        match txn.get(&self.meta_key, false).await? {
            None => Ok(GraphMeta::default()),
            Some(bytes) => bincode::deserialize(&bytes).map_err(|e| KvError::Backend(format!("corrupt graph meta: {}", e)).into()),
        }
    }

    fn save_meta(&self, txn: &mut dyn KvTransaction, meta: &GraphMeta) -> Result<(), IndexError> {
        let bytes = bincode::serialize(meta).map_err(|e| KvError::Backend(format!("encode graph meta: {}", e)))?;
        txn.set(&self.meta_key, &bytes);
        Ok(())
    }

    pub async fn mark_built(&self, txn: &mut dyn KvTransaction) -> Result<(), IndexError> {
        let mut meta = self.meta(txn).await?;
        meta.built = true;
        self.save_meta(txn, &meta)
    }

    /// Drop the graph and its meta, leaving the flat store alone.
    pub async fn clear(&self, txn: &mut dyn KvTransaction) -> Result<(), IndexError> {
        let (lo, hi) = self.graph.range();
        txn.clear_range(&lo, &hi);
        txn.clear(&self.meta_key);
        Ok(())
    }

    fn node_key(&self, id: &[u8]) -> Vec<u8> {
        let mut key = self.graph.prefix().to_vec();
        key.extend_from_slice(id);
        key
    }

    async fn node(&self, txn: &mut dyn KvTransaction, id: &[u8]) -> Result<Option<GraphNode>, IndexError> {
        match txn.get(&self.node_key(id), false).await? {
            None => Ok(None),
            Some(bytes) => {
                Ok(Some(bincode::deserialize(&bytes).map_err(|e| KvError::Backend(format!("corrupt graph node: {}", e)))?))
            }
        }
    }

    fn save_node(&self, txn: &mut dyn KvTransaction, id: &[u8], node: &GraphNode) -> Result<(), IndexError> {
        let bytes = bincode::serialize(node).map_err(|e| KvError::Backend(format!("encode graph node: {}", e)))?;
        txn.set(&self.node_key(id), &bytes);
        Ok(())
    }

    async fn vector(
        &self,
        txn: &mut dyn KvTransaction,
        cache: &mut HashMap<Vec<u8>, Vec<f32>>,
        id: &[u8],
    ) -> Result<Vec<f32>, IndexError> {
        if let Some(v) = cache.get(id) {
            return Ok(v.clone());
        }
        let mut key = self.flat.prefix().to_vec();
        key.extend_from_slice(id);
        let bytes = txn
            .get(&key, true)
            .await?
            .ok_or_else(|| KvError::Backend(format!("graph references missing vector for id {:02x?}", id)))?;
        let v = bytes_to_vector(&bytes);
        cache.insert(id.to_vec(), v.clone());
        Ok(v)
    }

    /// Insert one element; ids are packed primary-key bytes. Re-inserting an
    /// existing id is a no-op, which makes interrupted builds resumable.
    pub async fn insert(&self, txn: &mut dyn KvTransaction, rng: &mut (dyn rand::RngCore + Send), id: &[u8], vector: &[f32]) -> Result<(), IndexError> {
        if self.node(txn, id).await?.is_some() {
            return Ok(());
        }
        let mut cache: HashMap<Vec<u8>, Vec<f32>> = HashMap::new();
        cache.insert(id.to_vec(), vector.to_vec());

        let mut meta = self.meta(txn).await?;
        let level = self.draw_level(rng);

        let Some(entry) = meta.entry.clone() else {
            self.save_node(txn, id, &GraphNode::new(level))?;
            meta.entry = Some(id.to_vec());
            meta.max_level = level;
            meta.count = 1;
            return self.save_meta(txn, &meta);
        };

        // Greedy descent through layers above the new element's level
        let entry_vec = self.vector(txn, &mut cache, &entry).await?;
        let mut eps = vec![Candidate(distance(self.options.metric, vector, &entry_vec), entry)];
        let mut lc = meta.max_level;
        while lc > level {
            eps = self.search_layer(txn, &mut cache, vector, eps, 1, lc).await?;
            lc -= 1;
        }

        // Connect on each layer from min(level, max_level) down to 0
        let mut node = GraphNode::new(level);
        let mut layer = level.min(meta.max_level);
        loop {
            let found = self.search_layer(txn, &mut cache, vector, eps.clone(), self.options.ef_construction, layer).await?;
            let max_links = self.max_links(layer);
            let selected: Vec<Candidate> = found.iter().take(max_links).map(|c| Candidate(c.0, c.1.clone())).collect();
            for Candidate(_, neighbor_id) in &selected {
                node.neighbors[layer as usize].push(neighbor_id.clone());
                self.link_back(txn, &mut cache, neighbor_id, id, layer).await?;
            }
            eps = found;
            if layer == 0 {
                break;
            }
            layer -= 1;
        }
        self.save_node(txn, id, &node)?;

        if level > meta.max_level {
            meta.max_level = level;
            meta.entry = Some(id.to_vec());
        }
        meta.count += 1;
        self.save_meta(txn, &meta)
    }

    /// Add the reverse edge, pruning the neighbor's list back to its budget
    /// by keeping the closest links.
    async fn link_back(
        &self,
        txn: &mut dyn KvTransaction,
        cache: &mut HashMap<Vec<u8>, Vec<f32>>,
        neighbor_id: &[u8],
        new_id: &[u8],
        layer: u8,
    ) -> Result<(), IndexError> {
        let Some(mut node) = self.node(txn, neighbor_id).await? else { return Ok(()) };
        if layer > node.level {
            return Ok(());
        }
        let links = &mut node.neighbors[layer as usize];
        if links.iter().any(|l| l == new_id) {
            return Ok(());
        }
        links.push(new_id.to_vec());
        let max_links = self.max_links(layer);
        if links.len() > max_links {
            let base = self.vector(txn, cache, neighbor_id).await?;
            let mut scored = Vec::with_capacity(links.len());
            for link in links.iter() {
                let v = self.vector(txn, cache, link).await?;
                scored.push(Candidate(distance(self.options.metric, &base, &v), link.clone()));
            }
            scored.sort();
            node.neighbors[layer as usize] = scored.into_iter().take(max_links).map(|c| c.1).collect();
        }
        self.save_node(txn, neighbor_id, &node)
    }

    /// Best-first expansion of one layer, returning up to `ef` closest
    /// candidates sorted by distance.
    async fn search_layer(
        &self,
        txn: &mut dyn KvTransaction,
        cache: &mut HashMap<Vec<u8>, Vec<f32>>,
        target: &[f32],
        eps: Vec<Candidate>,
        ef: usize,
        layer: u8,
    ) -> Result<Vec<Candidate>, IndexError> {
        let mut visited: HashSet<Vec<u8>> = eps.iter().map(|c| c.1.clone()).collect();
        let mut frontier: BinaryHeap<Reverse<Candidate>> = eps.iter().map(|c| Reverse(Candidate(c.0, c.1.clone()))).collect();
        let mut results: BinaryHeap<Candidate> = eps.into_iter().collect();

        while let Some(Reverse(Candidate(dist, id))) = frontier.pop() {
            let worst = results.peek().map(|c| c.0).unwrap_or(f64::INFINITY);
            if results.len() >= ef && dist > worst {
                break;
            }
            let Some(node) = self.node(txn, &id).await? else { continue };
            if layer > node.level {
                continue;
            }
            for neighbor in &node.neighbors[layer as usize] {
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                let v = self.vector(txn, cache, neighbor).await?;
                let d = distance(self.options.metric, target, &v);
                let worst = results.peek().map(|c| c.0).unwrap_or(f64::INFINITY);
                if results.len() < ef || d < worst {
                    results.push(Candidate(d, neighbor.clone()));
                    if results.len() > ef {
                        results.pop();
                    }
                    frontier.push(Reverse(Candidate(d, neighbor.clone())));
                }
            }
        }
        let mut out: Vec<Candidate> = results.into_vec();
        out.sort();
        Ok(out)
    }

    /// Top-k search. The caller is responsible for checking the built flag.
    pub async fn search(&self, txn: &mut dyn KvTransaction, target: &[f32], k: usize) -> Result<Vec<(f64, Tuple)>, IndexError> {
        let meta = self.meta(txn).await?;
        let Some(entry) = meta.entry else { return Ok(Vec::new()) };
        let mut cache = HashMap::new();
        let entry_vec = self.vector(txn, &mut cache, &entry).await?;
        let mut eps = vec![Candidate(distance(self.options.metric, target, &entry_vec), entry)];
        let mut lc = meta.max_level;
        while lc > 0 {
            eps = self.search_layer(txn, &mut cache, target, eps, 1, lc).await?;
            lc -= 1;
        }
        let ef = self.options.ef_search.max(k);
        let found = self.search_layer(txn, &mut cache, target, eps, ef, 0).await?;
        found.into_iter().take(k).map(|Candidate(d, id)| Ok((d, Tuple::unpack(&id)?))).collect()
    }

    fn max_links(&self, layer: u8) -> usize {
        if layer == 0 {
            self.options.m0
        } else {
            self.options.m
        }
    }

    fn draw_level(&self, rng: &mut (dyn rand::RngCore + Send)) -> u8 {
        let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
        ((-u.ln() * self.ml).floor() as u64).min(MAX_GRAPH_LEVEL as u64) as u8
    }
}
