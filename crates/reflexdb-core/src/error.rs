//! Core error types.

use thiserror::Error;

use crate::value::{Key, Value};

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    /// The field the issue applies to.
    pub field: String,
    /// Machine-readable issue code.
    pub code: IssueCode,
    /// Human-readable description.
    pub message: String,
}

impl ValidationIssue {
    /// Create a new issue.
    pub fn new(field: impl Into<String>, code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.code)
    }
}

/// Validation issue codes, one per field rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueCode {
    /// Required field missing.
    Required,
    /// Value has the wrong type.
    Type,
    /// Value not in the allowed set.
    Enum,
    /// Numeric value below the minimum.
    Min,
    /// Numeric value above the maximum.
    Max,
    /// String shorter than the minimum length.
    MinLength,
    /// String longer than the maximum length.
    MaxLength,
    /// String does not match the pattern.
    Pattern,
    /// String does not match the declared format.
    Format,
}

impl std::fmt::Display for IssueCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IssueCode::Required => "required",
            IssueCode::Type => "type",
            IssueCode::Enum => "enum",
            IssueCode::Min => "min",
            IssueCode::Max => "max",
            IssueCode::MinLength => "minLength",
            IssueCode::MaxLength => "maxLength",
            IssueCode::Pattern => "pattern",
            IssueCode::Format => "format",
        };
        f.write_str(s)
    }
}

/// Core store errors.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Record failed schema validation on insert or update.
    #[error("validation failed: {}", format_issues(issues))]
    Validation {
        /// Every issue found, across all fields.
        issues: Vec<ValidationIssue>,
    },

    /// A unique field would collide with an existing record.
    #[error("unique constraint violated on {bucket}.{field}: duplicate value {value:?}")]
    UniqueConstraint {
        /// Bucket name.
        bucket: String,
        /// The unique field.
        field: String,
        /// The colliding value.
        value: Value,
    },

    /// Bucket name already registered.
    #[error("bucket '{name}' already exists")]
    BucketAlreadyExists {
        /// Bucket name.
        name: String,
    },

    /// Bucket name not registered.
    #[error("bucket '{name}' is not defined")]
    BucketNotDefined {
        /// Bucket name.
        name: String,
    },

    /// Reactive query name already registered.
    #[error("query '{name}' already defined")]
    QueryAlreadyDefined {
        /// Query name.
        name: String,
    },

    /// Reactive query name not registered.
    #[error("query '{name}' is not defined")]
    QueryNotDefined {
        /// Query name.
        name: String,
    },

    /// Optimistic version check failed at commit.
    #[error(
        "transaction conflict on {bucket}[{key}]: expected version {expected}, found {actual}"
    )]
    TransactionConflict {
        /// Bucket name.
        bucket: String,
        /// Record key.
        key: Key,
        /// Version observed inside the transaction.
        expected: u64,
        /// Live version at commit time.
        actual: u64,
    },

    /// Update on a key that does not exist.
    #[error("record {key} not found in bucket '{bucket}'")]
    NotFound {
        /// Bucket name.
        bucket: String,
        /// Record key.
        key: Key,
    },

    /// Bucket definition references a field not in its schema, or is
    /// otherwise malformed.
    #[error("invalid definition for bucket '{bucket}': {reason}")]
    InvalidDefinition {
        /// Bucket name.
        bucket: String,
        /// What is wrong with the definition.
        reason: String,
    },

    /// TTL duration string could not be parsed.
    #[error("invalid duration: {input:?} (expected milliseconds or <n>s|m|h|d)")]
    InvalidDuration {
        /// The rejected input.
        input: String,
    },

    /// The bucket's mailbox is gone (dropped bucket or stopped store).
    #[error("bucket '{name}' is closed")]
    BucketClosed {
        /// Bucket name.
        name: String,
    },

    /// Persistence adapter failure.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl Error {
    /// Build a validation error from collected issues.
    pub fn validation(issues: Vec<ValidationIssue>) -> Self {
        Error::Validation { issues }
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
