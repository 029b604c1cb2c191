//! Change events: payloads, topics, and the asynchronous bus.

mod bus;
mod topic;

pub use bus::{EventBus, EventSubscription};
pub use topic::TopicPattern;

use std::sync::Arc;

use crate::record::Record;
use crate::value::Key;

/// A change event emitted by a bucket mutation.
#[derive(Debug, Clone)]
pub struct Event {
    /// The bucket the mutation applied to.
    pub bucket: String,
    /// Primary key of the affected record.
    pub key: Key,
    /// What happened, with the affected record(s).
    pub kind: EventKind,
}

/// Event payloads per mutation kind.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// A record was inserted.
    Inserted {
        /// The stored record.
        record: Arc<Record>,
    },
    /// A record was updated.
    Updated {
        /// The record before the update.
        old_record: Arc<Record>,
        /// The record after the update.
        new_record: Arc<Record>,
    },
    /// A record was deleted (explicitly, by TTL purge, or by eviction).
    Deleted {
        /// The record as it was before deletion.
        record: Arc<Record>,
    },
}

impl Event {
    /// Build an `inserted` event.
    pub fn inserted(bucket: impl Into<String>, key: Key, record: Record) -> Self {
        Self {
            bucket: bucket.into(),
            key,
            kind: EventKind::Inserted {
                record: Arc::new(record),
            },
        }
    }

    /// Build an `updated` event.
    pub fn updated(
        bucket: impl Into<String>,
        key: Key,
        old_record: Record,
        new_record: Record,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key,
            kind: EventKind::Updated {
                old_record: Arc::new(old_record),
                new_record: Arc::new(new_record),
            },
        }
    }

    /// Build a `deleted` event.
    pub fn deleted(bucket: impl Into<String>, key: Key, record: Record) -> Self {
        Self {
            bucket: bucket.into(),
            key,
            kind: EventKind::Deleted {
                record: Arc::new(record),
            },
        }
    }

    /// The concrete topic: `bucket.{name}.{inserted|updated|deleted}`.
    pub fn topic(&self) -> String {
        format!("bucket.{}.{}", self.bucket, self.action())
    }

    /// The action segment of the topic.
    pub fn action(&self) -> &'static str {
        match self.kind {
            EventKind::Inserted { .. } => "inserted",
            EventKind::Updated { .. } => "updated",
            EventKind::Deleted { .. } => "deleted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::fields;

    #[test]
    fn test_topics() {
        let record = Record::from_fields(fields([("id", "a".into())]));
        let event = Event::inserted("orders", Key::from("a"), record.clone());
        assert_eq!(event.topic(), "bucket.orders.inserted");

        let event = Event::updated("orders", Key::from("a"), record.clone(), record.clone());
        assert_eq!(event.topic(), "bucket.orders.updated");

        let event = Event::deleted("orders", Key::from("a"), record);
        assert_eq!(event.topic(), "bucket.orders.deleted");
    }
}
