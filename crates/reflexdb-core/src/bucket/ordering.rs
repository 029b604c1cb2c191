//! Canonical ordering, pagination, and aggregates over record sets.
//!
//! `Ordered` buckets enumerate by primary key ascending; `Insertion`
//! buckets by `_createdAt` ascending with the primary key as tiebreaker.
//! The same ordering backs `first`, `last`, `paginate`, and the committed
//! and transactional views alike.

use crate::record::Record;
use crate::schema::BucketOrder;
use crate::value::Key;

/// One page of results.
#[derive(Debug, Clone)]
pub struct Page {
    /// Records in canonical order.
    pub records: Vec<Record>,
    /// Cursor for the next page: the last primary key emitted.
    pub cursor: Option<Key>,
    /// Whether records remain past this page.
    pub has_more: bool,
}

/// Pagination parameters.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    /// Maximum records to return. `None` returns the rest.
    pub limit: Option<usize>,
    /// Resume strictly after this primary key.
    pub cursor: Option<Key>,
}

impl PageRequest {
    /// First page with the given limit.
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            cursor: None,
        }
    }

    /// Continue after a cursor.
    pub fn after(mut self, cursor: Key) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// Sort records into the bucket's canonical order.
pub fn sort_canonical(records: &mut [Record], order: BucketOrder, key_field: &str) {
    match order {
        BucketOrder::Ordered => {
            records.sort_by(|a, b| a.key(key_field).cmp(&b.key(key_field)));
        }
        BucketOrder::Insertion => {
            records.sort_by(|a, b| {
                (a.created_at(), a.key(key_field)).cmp(&(b.created_at(), b.key(key_field)))
            });
        }
    }
}

/// Page through canonically-sorted records.
pub fn paginate(
    sorted: Vec<Record>,
    request: &PageRequest,
    order: BucketOrder,
    key_field: &str,
) -> Page {
    let start = match &request.cursor {
        None => 0,
        Some(cursor) => match sorted.iter().position(|r| r.key(key_field).as_ref() == Some(cursor)) {
            // Resume strictly after the cursor record.
            Some(pos) => pos + 1,
            // The cursor record is gone. In key order we can still resume
            // at the next greater key; in insertion order its position is
            // unknowable, so the cursor is treated as past the end.
            None => match order {
                BucketOrder::Ordered => sorted
                    .iter()
                    .position(|r| r.key(key_field).as_ref() > Some(cursor))
                    .unwrap_or(sorted.len()),
                BucketOrder::Insertion => sorted.len(),
            },
        },
    };

    let remaining = sorted.len().saturating_sub(start);
    let take = request.limit.unwrap_or(remaining).min(remaining);
    let records: Vec<Record> = sorted.into_iter().skip(start).take(take).collect();

    Page {
        cursor: records.last().and_then(|r| r.key(key_field)),
        has_more: take < remaining,
        records,
    }
}

/// Sum of a numeric field; non-numeric and absent values are skipped.
/// The empty set sums to 0.
pub fn sum(records: &[Record], field: &str) -> f64 {
    records
        .iter()
        .filter_map(|r| r.get(field).and_then(|v| v.as_number()))
        .sum()
}

/// Average of a numeric field; 0 for the empty set.
pub fn avg(records: &[Record], field: &str) -> f64 {
    let values: Vec<f64> = records
        .iter()
        .filter_map(|r| r.get(field).and_then(|v| v.as_number()))
        .collect();
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Minimum of a numeric field; `None` for the empty set.
pub fn min(records: &[Record], field: &str) -> Option<f64> {
    records
        .iter()
        .filter_map(|r| r.get(field).and_then(|v| v.as_number()))
        .fold(None, |acc, n| match acc {
            Some(m) if m <= n => Some(m),
            _ => Some(n),
        })
}

/// Maximum of a numeric field; `None` for the empty set.
pub fn max(records: &[Record], field: &str) -> Option<f64> {
    records
        .iter()
        .filter_map(|r| r.get(field).and_then(|v| v.as_number()))
        .fold(None, |acc, n| match acc {
            Some(m) if m >= n => Some(m),
            _ => Some(n),
        })
}
