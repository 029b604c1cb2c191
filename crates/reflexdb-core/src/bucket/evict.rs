//! Size-cap eviction policy.

use std::collections::BTreeMap;

use crate::record::Record;
use crate::value::Key;

/// Pick the record to evict on overflow: smallest `_createdAt`, primary
/// key as tiebreaker.
pub fn pick_victim(records: &BTreeMap<Key, Record>) -> Option<Key> {
    records
        .iter()
        .min_by(|(ka, a), (kb, b)| (a.created_at(), ka).cmp(&(b.created_at(), kb)))
        .map(|(key, _)| key.clone())
}
