//! Order-preserving tuple codec.
//!
//! Every record key, index key and range boundary in the store is a packed
//! tuple. The encoding guarantees that byte-wise comparison of packed tuples
//! matches element-wise comparison of the tuples themselves, with the
//! cross-type order null < bool < int < float < string < bytes < uuid <
//! timestamp < nested. Each element encoding is self-delimiting, so packed
//! elements are prefix-free against each other and `unpack` is the exact
//! inverse of `pack`.

mod codec;

use std::cmp::Ordering;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::TupleError;
use crate::value::Value;

pub use codec::strinc;

/// A twelve-byte transaction-ordered stamp: ten bytes assigned by the KVS at
/// commit time plus a two-byte user order. While the transaction version is
/// still unassigned the stamp is "incomplete" and packs as a placeholder that
/// the KVS overwrites via its versionstamped-key atomic op.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Versionstamp {
    bytes: [u8; 12],
}

impl Versionstamp {
    pub fn incomplete(user_version: u16) -> Self {
        let mut bytes = [0xFF; 12];
        bytes[10..].copy_from_slice(&user_version.to_be_bytes());
        Self { bytes }
    }

    pub fn complete(tx_version: [u8; 10], user_version: u16) -> Self {
        let mut bytes = [0; 12];
        bytes[..10].copy_from_slice(&tx_version);
        bytes[10..].copy_from_slice(&user_version.to_be_bytes());
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self { Self { bytes } }

    pub fn as_bytes(&self) -> &[u8; 12] { &self.bytes }

    /// False while the ten transaction bytes are still the 0xFF placeholder.
    pub fn is_complete(&self) -> bool { self.bytes[..10] != [0xFF; 10] }

    pub fn user_version(&self) -> u16 { u16::from_be_bytes([self.bytes[10], self.bytes[11]]) }
}

impl Display for Versionstamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_complete() {
            write!(f, "@{:02x?}+{}", &self.bytes[..10], self.user_version())
        } else {
            write!(f, "@incomplete+{}", self.user_version())
        }
    }
}

/// An ordered sequence of key-capable values.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Tuple(Vec<Value>);

impl Tuple {
    pub fn new() -> Self { Self(Vec::new()) }

    pub fn from_values(values: Vec<Value>) -> Self { Self(values) }

    pub fn single(value: impl Into<Value>) -> Self { Self(vec![value.into()]) }

    pub fn elements(&self) -> &[Value] { &self.0 }

    pub fn into_values(self) -> Vec<Value> { self.0 }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn push(&mut self, value: impl Into<Value>) { self.0.push(value.into()) }

    /// `self` followed by all of `other`'s elements.
    pub fn concat(mut self, other: &Tuple) -> Tuple {
        self.0.extend(other.0.iter().cloned());
        self
    }

    /// Element-wise order; matches the byte order of `pack` output.
    pub fn cmp_order(&self, other: &Tuple) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.cmp_order(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }

    /// Encode to order-preserving bytes. Incomplete versionstamps are
    /// rejected; use [`Tuple::pack_with_versionstamp`] for those.
    pub fn pack(&self) -> Result<Vec<u8>, TupleError> {
        let mut out = Vec::new();
        let mut stamps = Vec::new();
        for v in &self.0 {
            codec::encode_element(&mut out, v, &mut stamps)?;
        }
        if !stamps.is_empty() {
            return Err(TupleError::VersionstampCount(stamps.len()));
        }
        Ok(out)
    }

    /// Encode a tuple containing exactly one incomplete versionstamp,
    /// returning the packed bytes and the byte offset of the twelve-byte
    /// placeholder (the offset the KVS's versionstamped-key op expects).
    pub fn pack_with_versionstamp(&self) -> Result<(Vec<u8>, usize), TupleError> {
        let mut out = Vec::new();
        let mut stamps = Vec::new();
        for v in &self.0 {
            codec::encode_element(&mut out, v, &mut stamps)?;
        }
        if stamps.len() != 1 {
            return Err(TupleError::VersionstampCount(stamps.len()));
        }
        Ok((out, stamps[0]))
    }

    /// Decode packed bytes back into a tuple (round-trip inverse of `pack`).
    pub fn unpack(bytes: &[u8]) -> Result<Tuple, TupleError> {
        let mut values = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let (v, next) = codec::decode_element(bytes, pos)?;
            values.push(v);
            pos = next;
        }
        Ok(Tuple(values))
    }
}

impl From<Vec<Value>> for Tuple {
    fn from(values: Vec<Value>) -> Self { Tuple(values) }
}

impl FromIterator<Value> for Tuple {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self { Tuple(iter.into_iter().collect()) }
}

impl Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}
