//! Geographic cell indexing.
//!
//! Coordinates are projected onto a cube-face quadtree and walked along a
//! Hilbert curve, giving every point a 64-bit hierarchical cell id: 3 face
//! bits followed by 2 bits per level. Truncating a token's low bits yields
//! its ancestor cell, so one ordered scan covers a whole region. The geo3d
//! variant packs a normalized altitude above the cell bits, keeping the
//! total inside the positive i64 range.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::IndexError;
use crate::index::IndexMaintainer;
use crate::index::value::apply_diff;
use crate::kv::KvTransaction;
use crate::record::Record;
use crate::schema::{IndexDef, SpatialOptions};
use crate::subspace::Subspace;
use crate::tuple::Tuple;
use crate::value::Value;

/// Finest quadtree level (2 bits each).
pub const MAX_LEVEL: u8 = 30;

/// Cell token at `level`: `face << 2·level | hilbert_prefix`, a
/// `(3 + 2·level)`-bit integer that sorts hierarchically.
pub fn cell_token(lat_deg: f64, lng_deg: f64, level: u8) -> u64 {
    let (face, pos) = leaf_cell(lat_deg, lng_deg);
    let shift = 2 * (MAX_LEVEL - level) as u32;
    ((face as u64) << (2 * level as u32)) | (pos >> shift)
}

/// Child-token range `[lo, hi)` at `index_level` covered by the cell that
/// contains the point at `query_level`.
pub fn token_range(lat_deg: f64, lng_deg: f64, query_level: u8, index_level: u8) -> (u64, u64) {
    let parent = cell_token(lat_deg, lng_deg, query_level);
    let shift = 2 * (index_level - query_level) as u32;
    (parent << shift, (parent + 1) << shift)
}

/// Token with altitude packed above the cell bits. Bit 63 stays clear so the
/// value remains a non-negative i64 key element.
pub fn geo3d_token(lat_deg: f64, lng_deg: f64, altitude: f64, options: &SpatialOptions) -> u64 {
    let cell_bits = 3 + 2 * options.level as u32;
    let alt_bits = 62 - cell_bits;
    let span = options.max_altitude - options.min_altitude;
    let normalized = ((altitude - options.min_altitude) / span).clamp(0.0, 1.0);
    let alt = (normalized * ((1u64 << alt_bits) - 1) as f64) as u64;
    (alt << cell_bits) | cell_token(lat_deg, lng_deg, options.level)
}

fn leaf_cell(lat_deg: f64, lng_deg: f64) -> (u8, u64) {
    let lat = lat_deg.to_radians();
    let lng = lng_deg.to_radians();
    let (x, y, z) = (lat.cos() * lng.cos(), lat.cos() * lng.sin(), lat.sin());
    let (face, u, v) = face_uv(x, y, z);
    let i = st_to_ij(uv_to_st(u));
    let j = st_to_ij(uv_to_st(v));
    (face, hilbert_position(i, j))
}

fn face_uv(x: f64, y: f64, z: f64) -> (u8, f64, f64) {
    let (ax, ay, az) = (x.abs(), y.abs(), z.abs());
    if ax >= ay && ax >= az {
        if x > 0.0 {
            (0, y / x, z / x)
        } else {
            (3, z / x, y / x)
        }
    } else if ay >= az {
        if y > 0.0 {
            (1, -x / y, z / y)
        } else {
            (4, z / y, -x / y)
        }
    } else if z > 0.0 {
        (2, -x / z, -y / z)
    } else {
        (5, -y / z, -x / z)
    }
}

/// Quadratic uv→st transform: cheap and near-uniform cell areas.
fn uv_to_st(u: f64) -> f64 {
    if u >= 0.0 {
        0.5 * (1.0 + 3.0 * u).sqrt()
    } else {
        1.0 - 0.5 * (1.0 - 3.0 * u).sqrt()
    }
}

fn st_to_ij(s: f64) -> u64 {
    let max = (1u64 << MAX_LEVEL) - 1;
    ((s * (1u64 << MAX_LEVEL) as f64) as i64).clamp(0, max as i64) as u64
}

/// Hilbert curve index of (i, j) on the 2^30 grid. Truncating the result by
/// two bits per level walks up the quadtree.
fn hilbert_position(mut x: u64, mut y: u64) -> u64 {
    let n = 1u64 << MAX_LEVEL;
    let mut d: u64 = 0;
    let mut s = n / 2;
    while s > 0 {
        let rx = u64::from(x & s > 0);
        let ry = u64::from(y & s > 0);
        d += s * s * ((3 * rx) ^ ry);
        // Rotate the quadrant so the curve stays continuous
        if ry == 0 {
            if rx == 1 {
                x = n - 1 - x;
                y = n - 1 - y;
            }
            std::mem::swap(&mut x, &mut y);
        }
        s /= 2;
    }
    d
}

pub struct SpatialMaintainer {
    index: IndexDef,
    options: SpatialOptions,
    subspace: Subspace,
}

impl SpatialMaintainer {
    pub fn new(index: IndexDef, options: SpatialOptions, subspace: Subspace) -> Self { Self { index, options, subspace } }

    fn entry_map(&self, record: &Record, pk: &Tuple) -> Result<HashMap<Vec<u8>, Vec<u8>>, IndexError> {
        let mut entries = HashMap::new();
        for output in self.index.root.evaluate(record.record_type(), record)? {
            let coords = output.elements();
            let token = match coords {
                [lat, lng] if !self.options.geo3d => {
                    cell_token(float_coord(lat, &self.index.name)?, float_coord(lng, &self.index.name)?, self.options.level)
                }
                [lat, lng, alt] if self.options.geo3d => geo3d_token(
                    float_coord(lat, &self.index.name)?,
                    float_coord(lng, &self.index.name)?,
                    float_coord(alt, &self.index.name)?,
                    &self.options,
                ),
                _ => {
                    return Err(IndexError::InvalidArgument(format!(
                        "spatial index {} expects {} coordinates, found {}",
                        self.index.name,
                        if self.options.geo3d { 3 } else { 2 },
                        coords.len()
                    )))
                }
            };
            let key_tuple = Tuple::single(token as i64).concat(pk);
            entries.insert(self.subspace.pack(&key_tuple)?, Vec::new());
        }
        Ok(entries)
    }
}

fn float_coord(v: &Value, index: &str) -> Result<f64, IndexError> {
    v.as_f64().ok_or_else(|| IndexError::InvalidArgument(format!("spatial index {} expects numeric coordinates, found {}", index, v)))
}

#[async_trait]
impl IndexMaintainer for SpatialMaintainer {
    async fn update(&self, txn: &mut dyn KvTransaction, pk: &Tuple, old: Option<&Record>, new: Option<&Record>) -> Result<(), IndexError> {
        let old_entries = match old {
            Some(r) => self.entry_map(r, pk)?,
            None => HashMap::new(),
        };
        let new_entries = match new {
            Some(r) => self.entry_map(r, pk)?,
            None => HashMap::new(),
        };
        apply_diff(txn, old_entries, new_entries).await
    }

    async fn scan_record(&self, txn: &mut dyn KvTransaction, record: &Record, pk: &Tuple) -> Result<(), IndexError> {
        for (key, value) in self.entry_map(record, pk)? {
            txn.set(&key, &value);
        }
        Ok(())
    }

    fn subspace(&self) -> &Subspace { &self.subspace }
}
