//! Buckets: the per-bucket actor, its proxy handle, and record policies.

mod evict;
mod handle;
mod ordering;
mod server;
mod snapshot;

pub use handle::BucketHandle;
pub use ordering::{Page, PageRequest};
pub use server::BucketStats;
pub use snapshot::BucketSnapshot;

pub(crate) use ordering::{avg, max, min, paginate, sort_canonical, sum};
pub(crate) use server::{spawn, PendingWrite, TxDecision};
