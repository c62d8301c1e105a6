//! Error types for the record layer.
//!
//! Two kinds flow through the crate: retryable transport errors from the
//! key-value store (conflicts, timeouts, unknown commit results) and fatal
//! logical errors (schema misuse, state-machine violations, decode failures).
//! `Database::with_txn` retries only the former; everything else surfaces to
//! the caller unchanged.

use thiserror::Error;

use crate::index::IndexState;
use crate::value::ValueType;

/// Errors raised by the underlying key-value store.
///
/// Returned from: every `KvTransaction` operation and `commit`.
#[derive(Debug, Error)]
pub enum KvError {
    /// The transaction's read or write set conflicted with a concurrent commit
    #[error("transaction conflict")]
    Conflict,

    /// The transaction exceeded the store's duration budget
    #[error("transaction timed out")]
    Timeout,

    /// The commit outcome is unknown (the caller must be idempotent on retry)
    #[error("commit result unknown")]
    CommitUnknown,

    /// The transaction's mutation set exceeded the store's byte budget
    #[error("transaction too large: {size} bytes (limit {limit})")]
    TransactionTooLarge { size: usize, limit: usize },

    /// The transaction was used after commit or abort
    #[error("transaction closed")]
    TransactionClosed,

    /// The backend does not support the requested operation
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Backend-specific failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl KvError {
    /// Whether a fresh transaction may succeed where this one failed.
    pub fn is_retryable(&self) -> bool { matches!(self, KvError::Conflict | KvError::Timeout | KvError::CommitUnknown) }
}

/// Errors from the tuple codec.
#[derive(Debug, Error)]
pub enum TupleError {
    /// NaN floats have no position in the key order
    #[error("NaN is not a valid key element")]
    NanKey,

    /// This value type cannot appear in a packed key
    #[error("{0:?} values cannot be packed into a tuple")]
    Unpackable(ValueType),

    /// `pack_with_versionstamp` requires exactly one incomplete versionstamp
    #[error("expected exactly one incomplete versionstamp, found {0}")]
    VersionstampCount(usize),

    /// Bytes do not decode as a packed tuple
    #[error("malformed tuple encoding at offset {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },

    /// `strinc` has no answer for an all-0xFF key
    #[error("key has no strict upper bound (all bytes 0xFF)")]
    NoUpperBound,

    /// The key does not start with the subspace prefix
    #[error("key is outside the subspace")]
    OutsideSubspace,
}

/// Errors from evaluating a key expression against a record.
#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("field not found: {record_type}.{field}")]
    FieldNotFound { record_type: String, field: String },

    /// Range boundaries apply to two-element interval values only
    #[error("field {field} does not hold a two-element interval")]
    NotAnInterval { field: String },

    /// A primary key expression must evaluate to exactly one tuple
    #[error("primary key expression fanned out to {0} tuples")]
    MultiValuedPrimaryKey(usize),

    #[error(transparent)]
    Tuple(#[from] TupleError),
}

/// Errors from schema construction.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("record type already declared: {0}")]
    DuplicateRecordType(String),

    #[error("index already declared: {0}")]
    DuplicateIndex(String),

    #[error("unknown record type: {0}")]
    UnknownRecordType(String),

    #[error("index {index} references unknown field {field}")]
    UnknownField { index: String, field: String },

    #[error("record type {0} has no primary key expression")]
    MissingPrimaryKey(String),

    #[error("invalid index definition for {index}: {reason}")]
    InvalidIndex { index: String, reason: String },
}

/// Errors raised while maintaining or interrogating an index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The requested lifecycle transition is not in the allowed table
    #[error("invalid index state transition for {index}: {from:?} -> {to:?}")]
    InvalidStateTransition { index: String, from: IndexState, to: IndexState },

    /// The index cannot serve reads in its current state
    #[error("index {index} is not readable (current state: {state:?})")]
    NotReadable { index: String, state: IndexState },

    /// A unique index rejected a second primary key for the same value
    #[error("unique violation on index {index} for key {key}")]
    UniqueViolation { index: String, key: String },

    /// The vector index has a flat store but its graph was never built;
    /// run the online indexer's graph build (or opt into the flat fallback)
    #[error("HNSW graph for index {index} has not been built; run the online graph build for it, or opt into the flat-scan fallback")]
    HnswNotBuilt { index: String },

    #[error("vector has {got} dimensions, index {index} expects {expected}")]
    VectorDimension { index: String, expected: usize, got: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Tuple(#[from] TupleError),

    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Errors from record store operations.
///
/// Returned from: `RecordStore::save`, `get`, `delete`, the online indexer
/// and statistics collection.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found for primary key {0}")]
    RecordNotFound(String),

    #[error("failed to serialize record: {0}")]
    SerializationFailed(String),

    #[error("failed to deserialize record: {0}")]
    DeserializationFailed(String),

    /// The record type's codec does not support rebuilding records from
    /// covering index entries
    #[error("covering reconstruction not implemented for record type {record_type}")]
    ReconstructionNotImplemented { record_type: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Tuple(#[from] TupleError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("statistics error: {0}")]
    Stats(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self { StoreError::Stats(e.to_string()) }
}

/// Errors from query planning and execution.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Tuple(#[from] TupleError),
}

/// Unified retryability probe used by the `with_txn` helper.
pub trait MaybeRetryable {
    /// True when the failure came from the KVS and a fresh attempt may succeed.
    fn is_retryable_error(&self) -> bool;
}

impl MaybeRetryable for KvError {
    fn is_retryable_error(&self) -> bool { self.is_retryable() }
}

impl MaybeRetryable for IndexError {
    fn is_retryable_error(&self) -> bool {
        match self {
            IndexError::Kv(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl MaybeRetryable for StoreError {
    fn is_retryable_error(&self) -> bool {
        match self {
            StoreError::Kv(e) => e.is_retryable(),
            StoreError::Index(e) => e.is_retryable_error(),
            _ => false,
        }
    }
}

impl MaybeRetryable for QueryError {
    fn is_retryable_error(&self) -> bool {
        match self {
            QueryError::Kv(e) => e.is_retryable(),
            QueryError::Store(e) => e.is_retryable_error(),
            QueryError::Index(e) => e.is_retryable_error(),
            _ => false,
        }
    }
}
