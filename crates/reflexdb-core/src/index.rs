//! Per-bucket secondary and unique indexes.
//!
//! Each indexed field maps encoded values to posting lists of primary
//! keys, giving O(1) equality lookups. Unique fields share the same
//! structure; the uniqueness check simply refuses a second distinct key
//! per value. Null and absent values are exempt from uniqueness.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::Error;
use crate::filter::Filter;
use crate::record::Record;
use crate::value::{Key, Value};

/// Secondary and unique indexes for one bucket.
#[derive(Debug, Clone)]
pub struct IndexManager {
    bucket: String,
    /// Posting lists per indexed field, keyed by encoded value.
    indexes: BTreeMap<String, HashMap<Vec<u8>, BTreeSet<Key>>>,
    unique: BTreeSet<String>,
}

impl IndexManager {
    /// Create the index set for a bucket: one index per field in
    /// `indexed`, with the `unique` subset enforcing uniqueness.
    pub fn new(
        bucket: impl Into<String>,
        indexed: impl IntoIterator<Item = String>,
        unique: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            indexes: indexed.into_iter().map(|f| (f, HashMap::new())).collect(),
            unique: unique.into_iter().collect(),
        }
    }

    /// Index a new record. Fails without mutating anything if a unique
    /// field would collide.
    pub fn add(&mut self, key: &Key, record: &Record) -> Result<(), Error> {
        self.check_unique(key, record)?;

        for (field, postings) in self.indexes.iter_mut() {
            if let Some(value) = record.get(field) {
                postings
                    .entry(encode_value(value))
                    .or_default()
                    .insert(key.clone());
            }
        }
        Ok(())
    }

    /// Remove a record from every posting list; empty lists are dropped.
    pub fn remove(&mut self, key: &Key, record: &Record) {
        for (field, postings) in self.indexes.iter_mut() {
            if let Some(value) = record.get(field) {
                let encoded = encode_value(value);
                if let Some(list) = postings.get_mut(&encoded) {
                    list.remove(key);
                    if list.is_empty() {
                        postings.remove(&encoded);
                    }
                }
            }
        }
    }

    /// Patch the indexes for an update: only fields whose value changed
    /// move between posting lists. Fails without mutating if a changed
    /// unique field would collide.
    pub fn update(&mut self, key: &Key, old: &Record, new: &Record) -> Result<(), Error> {
        for field in &self.unique {
            if !self.indexes.contains_key(field) {
                continue;
            }
            let old_value = old.get(field);
            let new_value = new.get(field);
            if old_value == new_value {
                continue;
            }
            if let Some(value) = new_value {
                self.check_unique_value(key, field, value)?;
            }
        }

        let fields: Vec<String> = self.indexes.keys().cloned().collect();
        for field in fields {
            let old_value = old.get(&field).cloned();
            let new_value = new.get(&field).cloned();
            if old_value == new_value {
                continue;
            }
            let postings = self.indexes.get_mut(&field).expect("field is indexed");
            if let Some(value) = old_value {
                let encoded = encode_value(&value);
                if let Some(list) = postings.get_mut(&encoded) {
                    list.remove(key);
                    if list.is_empty() {
                        postings.remove(&encoded);
                    }
                }
            }
            if let Some(value) = new_value {
                postings
                    .entry(encode_value(&value))
                    .or_default()
                    .insert(key.clone());
            }
        }
        Ok(())
    }

    /// Look up the posting list for `(field, value)`.
    ///
    /// Returns `None` when the field has no index; an indexed field with no
    /// entry for the value yields an empty set.
    pub fn lookup(&self, field: &str, value: &Value) -> Option<BTreeSet<Key>> {
        let postings = self.indexes.get(field)?;
        Some(
            postings
                .get(&encode_value(value))
                .cloned()
                .unwrap_or_default(),
        )
    }

    /// Candidate keys for a filter: the intersection of posting lists for
    /// its indexed fields, smallest list first. `None` when no predicate
    /// is indexed (caller falls back to a full scan).
    pub fn candidates(&self, filter: &Filter) -> Option<BTreeSet<Key>> {
        let mut lists: Vec<BTreeSet<Key>> = Vec::new();
        for (field, value) in filter.predicates() {
            if let Some(list) = self.lookup(field, value) {
                lists.push(list);
            }
        }
        if lists.is_empty() {
            return None;
        }

        lists.sort_by_key(|l| l.len());
        let mut result = lists.remove(0);
        for list in lists {
            result.retain(|k| list.contains(k));
            if result.is_empty() {
                break;
            }
        }
        Some(result)
    }

    /// Rebuild all indexes from scratch (snapshot restore).
    pub fn rebuild<'a>(
        &mut self,
        records: impl IntoIterator<Item = (&'a Key, &'a Record)>,
    ) -> Result<(), Error> {
        for postings in self.indexes.values_mut() {
            postings.clear();
        }
        for (key, record) in records {
            self.add(key, record)?;
        }
        Ok(())
    }

    /// Drop every posting list.
    pub fn clear(&mut self) {
        for postings in self.indexes.values_mut() {
            postings.clear();
        }
    }

    /// Number of indexed fields.
    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    fn check_unique(&self, key: &Key, record: &Record) -> Result<(), Error> {
        for field in &self.unique {
            if let Some(value) = record.get(field) {
                self.check_unique_value(key, field, value)?;
            }
        }
        Ok(())
    }

    fn check_unique_value(&self, key: &Key, field: &str, value: &Value) -> Result<(), Error> {
        if value.is_null() {
            return Ok(());
        }
        if let Some(postings) = self.indexes.get(field) {
            if let Some(list) = postings.get(&encode_value(value)) {
                if list.iter().any(|existing| existing != key) {
                    return Err(Error::UniqueConstraint {
                        bucket: self.bucket.clone(),
                        field: field.to_string(),
                        value: value.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Encode a value for use as an index key: type tag + payload.
///
/// Floats are normalized so that every NaN bit pattern collides and
/// `-0.0` lands with `0.0`, keeping the encoding consistent with the
/// store's structural equality.
fn encode_value(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => buf.push(0x00),
        Value::Bool(b) => {
            buf.push(0x01);
            buf.push(u8::from(*b));
        }
        Value::Int(n) => {
            buf.push(0x02);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Float(n) => {
            buf.push(0x03);
            let normalized = if n.is_nan() {
                f64::NAN
            } else if *n == 0.0 {
                0.0
            } else {
                *n
            };
            buf.extend_from_slice(&normalized.to_le_bytes());
        }
        Value::String(s) => {
            buf.push(0x04);
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            buf.push(0x05);
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_into(item, buf);
            }
        }
        Value::Map(entries) => {
            buf.push(0x06);
            buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for (k, v) in entries {
                buf.extend_from_slice(&(k.len() as u32).to_le_bytes());
                buf.extend_from_slice(k.as_bytes());
                encode_into(v, buf);
            }
        }
    }
}
