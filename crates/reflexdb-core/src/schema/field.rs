//! Field definitions for bucket schemas.

use crate::value::Value;

/// A field definition within a bucket schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Field data type.
    pub field_type: FieldType,
    /// Whether the field must be present and non-null after defaults apply.
    pub required: bool,
    /// Default value if not provided.
    pub default: Option<DefaultValue>,
    /// Generator invoked at insert when the caller supplies no value.
    pub generated: Option<Generator>,
    /// Allowed values (enum rule).
    pub allowed: Option<Vec<Value>>,
    /// Minimum numeric value (inclusive).
    pub min: Option<f64>,
    /// Maximum numeric value (inclusive).
    pub max: Option<f64>,
    /// Minimum string length in characters.
    pub min_length: Option<usize>,
    /// Maximum string length in characters.
    pub max_length: Option<usize>,
    /// Regex the string value must match. Compiled at define time.
    pub pattern: Option<String>,
    /// Well-known string format.
    pub format: Option<Format>,
}

/// Field data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// UTF-8 string.
    String,
    /// 64-bit signed integer.
    Int,
    /// 64-bit float. Also accepts integer input.
    Float,
    /// Boolean.
    Bool,
    /// Milliseconds since epoch, stored as an integer.
    Timestamp,
    /// Array of arbitrary values.
    Array,
    /// Nested mapping.
    Map,
    /// Any value; only presence rules apply.
    Any,
}

/// Default value for a field.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    /// Fixed value.
    Value(Value),
    /// Current time in milliseconds, evaluated at insert.
    CurrentTimestamp,
}

/// Identifier generators. Each fills the field at insert when the caller
/// left it unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generator {
    /// Random v4 UUID string.
    Uuid,
    /// Collision-resistant id: timestamp + counter + entropy, base36.
    Cuid,
    /// Per-bucket monotonic integer sequence, starting at 1.
    Autoincrement,
    /// Insert time in milliseconds.
    Timestamp,
}

/// Well-known string formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Loose email shape: local part, `@`, domain with a dot.
    Email,
    /// `http://` or `https://` URL.
    Url,
    /// Hyphenated hexadecimal UUID.
    Uuid,
}

impl FieldDef {
    /// Create a new optional field of the given type.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            default: None,
            generated: None,
            allowed: None,
            min: None,
            max: None,
            min_length: None,
            max_length: None,
            pattern: None,
            format: None,
        }
    }

    /// Shorthand for a string field.
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    /// Shorthand for an integer field.
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Int)
    }

    /// Shorthand for a float field.
    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Float)
    }

    /// Shorthand for a boolean field.
    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Bool)
    }

    /// Mark the field required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set a fixed default value.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Value(value.into()));
        self
    }

    /// Default to the insert timestamp.
    pub fn default_now(mut self) -> Self {
        self.default = Some(DefaultValue::CurrentTimestamp);
        self
    }

    /// Attach a generator.
    pub fn generated(mut self, generator: Generator) -> Self {
        self.generated = Some(generator);
        self
    }

    /// Restrict to a set of allowed values.
    pub fn allowed(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.allowed = Some(values.into_iter().collect());
        self
    }

    /// Set the inclusive numeric minimum.
    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Set the inclusive numeric maximum.
    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Set the minimum string length.
    pub fn min_length(mut self, len: usize) -> Self {
        self.min_length = Some(len);
        self
    }

    /// Set the maximum string length.
    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    /// Require the string to match a regex.
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Require a well-known string format.
    pub fn format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    /// Check if this field has a default value.
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Check if this field is generator-filled.
    pub fn is_generated(&self) -> bool {
        self.generated.is_some()
    }
}
