//! Records and their reserved metadata fields.
//!
//! A record is a field map plus four store-owned metadata fields. Metadata
//! lives inside the map under reserved names so that snapshots, events, and
//! query results all carry it verbatim.

use serde::{Deserialize, Serialize};

use crate::value::{Fields, Key, Value};

/// Reserved field: monotonic version, starting at 1.
pub const FIELD_VERSION: &str = "_version";
/// Reserved field: insert time, milliseconds since epoch. Immutable.
pub const FIELD_CREATED_AT: &str = "_createdAt";
/// Reserved field: last successful update time, milliseconds since epoch.
pub const FIELD_UPDATED_AT: &str = "_updatedAt";
/// Reserved field: expiration time for TTL buckets, milliseconds since epoch.
pub const FIELD_EXPIRES_AT: &str = "_expiresAt";

/// All reserved metadata field names.
pub const METADATA_FIELDS: [&str; 4] = [
    FIELD_VERSION,
    FIELD_CREATED_AT,
    FIELD_UPDATED_AT,
    FIELD_EXPIRES_AT,
];

/// A stored record: caller fields plus store-owned metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: Fields,
}

impl Record {
    /// Wrap an already-prepared field map. The validator is responsible for
    /// having attached metadata.
    pub(crate) fn from_fields(fields: Fields) -> Self {
        Self { fields }
    }

    /// Borrow the underlying field map.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Consume into the underlying field map.
    pub fn into_fields(self) -> Fields {
        self.fields
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Record version; 1 after insert, +1 per successful update.
    pub fn version(&self) -> u64 {
        match self.fields.get(FIELD_VERSION) {
            Some(Value::Int(v)) => *v as u64,
            _ => 0,
        }
    }

    /// Insert timestamp in milliseconds since epoch.
    pub fn created_at(&self) -> i64 {
        match self.fields.get(FIELD_CREATED_AT) {
            Some(Value::Int(v)) => *v,
            _ => 0,
        }
    }

    /// Last update timestamp in milliseconds since epoch.
    pub fn updated_at(&self) -> i64 {
        match self.fields.get(FIELD_UPDATED_AT) {
            Some(Value::Int(v)) => *v,
            _ => 0,
        }
    }

    /// Expiration timestamp, present only in TTL buckets.
    pub fn expires_at(&self) -> Option<i64> {
        match self.fields.get(FIELD_EXPIRES_AT) {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Whether the record has expired as of `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at(), Some(at) if at <= now_ms)
    }

    /// Extract the primary key for the given key field.
    ///
    /// Returns `None` if the field is absent or not a string/integer.
    pub fn key(&self, key_field: &str) -> Option<Key> {
        self.fields.get(key_field).and_then(Key::from_value)
    }

    /// Overwrite the version. Used by the transaction overlay when an
    /// update lands on a record the same transaction inserted.
    pub(crate) fn set_version(&mut self, version: u64) {
        self.fields
            .insert(FIELD_VERSION.to_string(), Value::Int(version as i64));
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Map(record.into_fields())
    }
}

/// Convert records into an array value, the usual shape of a reactive
/// query result.
pub fn records_value(records: Vec<Record>) -> Value {
    Value::Array(records.into_iter().map(Value::from).collect())
}

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Remove the reserved metadata fields from caller input.
pub(crate) fn strip_metadata(input: &mut Fields) {
    for field in METADATA_FIELDS {
        input.remove(field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::fields;

    fn record(pairs: Fields) -> Record {
        Record::from_fields(pairs)
    }

    #[test]
    fn test_metadata_accessors() {
        let r = record(fields([
            ("id", "a".into()),
            (FIELD_VERSION, 3.into()),
            (FIELD_CREATED_AT, 100.into()),
            (FIELD_UPDATED_AT, 250.into()),
            (FIELD_EXPIRES_AT, 300.into()),
        ]));

        assert_eq!(r.version(), 3);
        assert_eq!(r.created_at(), 100);
        assert_eq!(r.updated_at(), 250);
        assert_eq!(r.expires_at(), Some(300));
        assert!(r.is_expired(300));
        assert!(r.is_expired(400));
        assert!(!r.is_expired(299));
    }

    #[test]
    fn test_expires_absent_means_no_expiry() {
        let r = record(fields([("id", "a".into())]));
        assert_eq!(r.expires_at(), None);
        assert!(!r.is_expired(i64::MAX));
    }

    #[test]
    fn test_key_extraction() {
        let r = record(fields([("id", "a".into()), ("n", 7.into())]));
        assert_eq!(r.key("id"), Some(Key::from("a")));
        assert_eq!(r.key("n"), Some(Key::from(7i64)));
        assert_eq!(r.key("missing"), None);
    }

    #[test]
    fn test_strip_metadata() {
        let mut input = fields([
            ("name", "A".into()),
            (FIELD_VERSION, 99.into()),
            (FIELD_CREATED_AT, 1.into()),
            (FIELD_UPDATED_AT, 2.into()),
            (FIELD_EXPIRES_AT, 3.into()),
        ]);
        strip_metadata(&mut input);

        assert_eq!(input.len(), 1);
        assert!(input.contains_key("name"));
    }

    #[test]
    fn test_serde_transparent_roundtrip() {
        let r = record(fields([
            ("id", "a".into()),
            (FIELD_VERSION, 1.into()),
            (FIELD_CREATED_AT, 100.into()),
            (FIELD_UPDATED_AT, 100.into()),
        ]));

        let blob = serde_json::to_vec(&r).unwrap();
        let back: Record = serde_json::from_slice(&blob).unwrap();
        assert_eq!(r, back);
    }
}
