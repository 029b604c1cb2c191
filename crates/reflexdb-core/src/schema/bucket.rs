//! Bucket definitions and compiled schemas.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use regex::Regex;

use crate::error::Error;
use crate::schema::field::FieldDef;

/// Enumeration order for a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BucketOrder {
    /// Records enumerate in primary-key order.
    Ordered,
    /// Records enumerate in arrival order: `_createdAt` ascending with the
    /// primary key as tiebreaker.
    #[default]
    Insertion,
}

/// A TTL declaration: raw milliseconds or a suffix-tagged duration string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ttl {
    /// Milliseconds.
    Millis(u64),
    /// `<n>s|m|h|d`, resolved at define time.
    Text(String),
}

impl Ttl {
    /// Resolve to a concrete duration.
    pub fn resolve(&self) -> Result<Duration, Error> {
        match self {
            Ttl::Millis(ms) => Ok(Duration::from_millis(*ms)),
            Ttl::Text(text) => parse_duration(text),
        }
    }
}

impl From<u64> for Ttl {
    fn from(ms: u64) -> Self {
        Ttl::Millis(ms)
    }
}

impl From<&str> for Ttl {
    fn from(text: &str) -> Self {
        Ttl::Text(text.to_string())
    }
}

/// Parse a `<n>s|m|h|d` duration string.
pub fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = || Error::InvalidDuration {
        input: input.to_string(),
    };

    let trimmed = input.trim();
    let (last_idx, suffix) = match trimmed.char_indices().last() {
        Some(last) => last,
        None => return Err(invalid()),
    };

    let n: u64 = trimmed[..last_idx].parse().map_err(|_| invalid())?;

    let secs = match suffix {
        's' => n,
        'm' => n * 60,
        'h' => n * 3600,
        'd' => n * 86_400,
        _ => return Err(invalid()),
    };
    Ok(Duration::from_secs(secs))
}

/// A bucket definition: schema, key field, indexes, and lifecycle policies.
#[derive(Debug, Clone)]
pub struct BucketDef {
    /// The schema field whose value is the primary key.
    pub key: String,
    /// Field definitions, keyed by name.
    pub fields: BTreeMap<String, FieldDef>,
    /// Fields with secondary (non-unique) indexes.
    pub indexes: BTreeSet<String>,
    /// Fields declared unique. Each implies an index.
    pub unique: BTreeSet<String>,
    /// Enumeration order.
    pub order: BucketOrder,
    /// Per-bucket record expiration.
    pub ttl: Option<Ttl>,
    /// Cap on total records; overflow evicts the oldest.
    pub max_size: Option<usize>,
    /// Whether snapshots include this bucket. Defaults to true.
    pub persistent: bool,
}

impl BucketDef {
    /// Start a definition with the given primary key field.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
            indexes: BTreeSet::new(),
            unique: BTreeSet::new(),
            order: BucketOrder::default(),
            ttl: None,
            max_size: None,
            persistent: true,
        }
    }

    /// Add a field.
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    /// Add a secondary index on a field.
    pub fn index(mut self, field: impl Into<String>) -> Self {
        self.indexes.insert(field.into());
        self
    }

    /// Declare a field unique.
    pub fn unique(mut self, field: impl Into<String>) -> Self {
        self.unique.insert(field.into());
        self
    }

    /// Set the enumeration order.
    pub fn order(mut self, order: BucketOrder) -> Self {
        self.order = order;
        self
    }

    /// Set the TTL (milliseconds or `<n>s|m|h|d`).
    pub fn ttl(mut self, ttl: impl Into<Ttl>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    /// Cap the bucket size.
    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = Some(max);
        self
    }

    /// Exclude the bucket from snapshots.
    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }
}

/// A validated, compiled bucket schema.
///
/// Compilation checks the definition (key and index fields must exist, TTL
/// must parse, patterns must compile) and pre-compiles field regexes so the
/// validator never parses them on the hot path.
#[derive(Debug)]
pub struct Schema {
    /// Bucket name.
    pub name: String,
    /// The validated definition.
    pub def: BucketDef,
    /// Resolved TTL, if declared.
    pub ttl: Option<Duration>,
    /// Every indexed field: declared indexes plus unique fields.
    pub indexed_fields: BTreeSet<String>,
    patterns: BTreeMap<String, Regex>,
}

impl Schema {
    /// Validate and compile a bucket definition.
    pub fn compile(name: impl Into<String>, def: BucketDef) -> Result<Self, Error> {
        let name = name.into();
        let invalid = |reason: String| Error::InvalidDefinition {
            bucket: name.clone(),
            reason,
        };

        if !def.fields.contains_key(&def.key) {
            return Err(invalid(format!("key field '{}' is not in the schema", def.key)));
        }
        for field in def.indexes.iter().chain(def.unique.iter()) {
            if !def.fields.contains_key(field) {
                return Err(invalid(format!("indexed field '{field}' is not in the schema")));
            }
        }
        if let Some(max) = def.max_size {
            if max == 0 {
                return Err(invalid("maxSize must be at least 1".to_string()));
            }
        }

        let ttl = match &def.ttl {
            Some(spec) => Some(spec.resolve()?),
            None => None,
        };

        let mut patterns = BTreeMap::new();
        for field in def.fields.values() {
            if let Some(pattern) = &field.pattern {
                let regex = Regex::new(pattern).map_err(|e| {
                    invalid(format!("bad pattern on field '{}': {e}", field.name))
                })?;
                patterns.insert(field.name.clone(), regex);
            }
        }

        let mut indexed_fields = def.indexes.clone();
        indexed_fields.extend(def.unique.iter().cloned());

        Ok(Self {
            name,
            def,
            ttl,
            indexed_fields,
            patterns,
        })
    }

    /// The primary key field name.
    pub fn key_field(&self) -> &str {
        &self.def.key
    }

    /// The compiled regex for a field, if it declares a pattern.
    pub fn pattern(&self, field: &str) -> Option<&Regex> {
        self.patterns.get(field)
    }

    /// Whether a field is declared unique.
    pub fn is_unique(&self, field: &str) -> bool {
        self.def.unique.contains(field)
    }

    /// TTL in milliseconds, if declared.
    pub fn ttl_millis(&self) -> Option<i64> {
        self.ttl.map(|d| d.as_millis() as i64)
    }
}
