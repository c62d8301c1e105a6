//! Keel: a record layer over an ordered transactional key-value store.
//!
//! Typed records with tuple-encoded primary keys, transactionally maintained
//! secondary indexes (value, covering, unique, count, sum, spatial, vector),
//! an online index builder with resumable progress, and a cost-based query
//! planner streaming results through lazy cursors. The KVS itself stays
//! behind the traits in [`kv`]; `keel-storage-memory` ships the reference
//! backend.

pub mod error;
pub mod index;
pub mod indexer;
pub mod keyexpr;
pub mod kv;
pub mod query;
pub mod rangeset;
pub mod record;
pub mod schema;
pub mod stats;
pub mod store;
pub mod subspace;
pub mod tuple;
pub mod value;

pub use error::{ExpressionError, IndexError, KvError, QueryError, SchemaError, StoreError, TupleError};
pub use index::{IndexState, IndexStateManager};
pub use indexer::{BuildProgress, IndexerPolicy, IndexerThrottle, OnlineIndexer};
pub use keyexpr::{BoundarySide, KeyExpression};
pub use kv::{Database, KvDatabase, KvTransaction};
pub use query::{Predicate, QueryPlan, RecordQuery};
pub use record::{BincodeCodec, FieldwiseCodec, Record, RecordCodec};
pub use schema::{DistanceMetric, IndexDef, IndexKind, RecordType, Schema, SpatialOptions, VectorOptions};
pub use store::RecordStore;
pub use subspace::Subspace;
pub use tuple::{Tuple, Versionstamp};
pub use value::{Value, ValueType};
