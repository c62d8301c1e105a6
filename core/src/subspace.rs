//! Byte-prefix keyspaces.
//!
//! A subspace is nothing more than a prefix; children append packed tuples to
//! it. All key arithmetic the store performs (record extents, index extents,
//! range-set entries) goes through here so the prefix discipline stays in one
//! place.

use crate::error::TupleError;
use crate::tuple::Tuple;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self { Self { prefix: prefix.into() } }

    pub fn prefix(&self) -> &[u8] { &self.prefix }

    /// Child subspace: parent prefix followed by the packed tuple.
    pub fn subspace(&self, tuple: &Tuple) -> Result<Subspace, TupleError> { Ok(Subspace { prefix: self.pack(tuple)? }) }

    /// Convenience child keyed by a single element.
    pub fn sub(&self, element: impl Into<Value>) -> Result<Subspace, TupleError> { self.subspace(&Tuple::single(element)) }

    pub fn pack(&self, tuple: &Tuple) -> Result<Vec<u8>, TupleError> {
        let mut key = self.prefix.clone();
        key.extend(tuple.pack()?);
        Ok(key)
    }

    /// Strip the prefix and decode the remainder.
    pub fn unpack(&self, key: &[u8]) -> Result<Tuple, TupleError> {
        let rest = key.strip_prefix(self.prefix.as_slice()).ok_or(TupleError::OutsideSubspace)?;
        Tuple::unpack(rest)
    }

    pub fn contains(&self, key: &[u8]) -> bool { key.starts_with(&self.prefix) }

    /// Half-open interval of every key under this subspace.
    ///
    /// Element tags never use 0x00 or 0xFF, so `(prefix ∥ 0x00, prefix ∥ 0xFF)`
    /// brackets exactly the packed keys beneath the prefix.
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        let mut lo = self.prefix.clone();
        lo.push(0x00);
        let mut hi = self.prefix.clone();
        hi.push(0xFF);
        (lo, hi)
    }
}
