//! ReflexDB Core - Reactive in-memory bucket store.
//!
//! Named buckets of schema-validated records with automatic metadata,
//! secondary and unique indexes, a change-event bus, cross-bucket
//! optimistic transactions, dependency-tracked reactive queries, TTL
//! expiration, and bounded-size eviction. Each bucket is a single-writer
//! actor; the store façade wires the pieces together.

pub mod bucket;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod index;
pub mod persist;
pub mod reactive;
pub mod record;
pub mod schema;
pub mod store;
pub mod txn;
pub mod value;

mod ttl;

pub use bucket::{BucketHandle, BucketSnapshot, BucketStats, Page, PageRequest};
pub use config::StoreOptions;
pub use error::{Error, IssueCode, ValidationIssue};
pub use events::{Event, EventBus, EventKind, EventSubscription, TopicPattern};
pub use filter::Filter;
pub use index::IndexManager;
pub use persist::{MemorySnapshotStore, SnapshotStore};
pub use reactive::{DependencySet, QueryBucket, QueryContext, QuerySubscription, ReactiveEngine};
pub use record::{records_value, Record};
pub use schema::{
    parse_duration, BucketDef, BucketOrder, DefaultValue, FieldDef, FieldType, Format, Generator,
    Schema, Ttl,
};
pub use store::{Store, StoreStats};
pub use txn::{Tx, TxBucket};
pub use value::{fields, Fields, Key, Value};
