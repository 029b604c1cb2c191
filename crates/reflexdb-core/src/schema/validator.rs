//! Record preparation: generators, defaults, validation, metadata.
//!
//! Both entry points collect every issue across all fields before failing;
//! a record with three bad fields reports three issues in one error.

use rand::Rng;

use crate::error::{Error, IssueCode, ValidationIssue};
use crate::record::{
    strip_metadata, Record, FIELD_CREATED_AT, FIELD_EXPIRES_AT, FIELD_UPDATED_AT, FIELD_VERSION,
};
use crate::schema::bucket::Schema;
use crate::schema::field::{DefaultValue, FieldDef, FieldType, Format, Generator};
use crate::value::{Fields, Key, Value};

/// Per-insert context supplied by the owning bucket server.
///
/// The autoincrement generator is not pure: it draws from the server's
/// counter through `next_seq`.
pub struct InsertContext<'a> {
    /// Insert time, milliseconds since epoch.
    pub now_ms: i64,
    /// Bucket TTL in milliseconds, when declared.
    pub ttl_ms: Option<i64>,
    /// Draw the next autoincrement sequence value.
    pub next_seq: &'a mut dyn FnMut() -> i64,
}

/// Prepare caller input for insert.
///
/// Strips metadata, fills generated fields the caller left unset, applies
/// defaults, validates every field, then attaches `_version=1`, creation
/// timestamps, and `_expiresAt` for TTL buckets (unless the caller
/// explicitly supplied one).
pub fn prepare_insert(
    schema: &Schema,
    mut input: Fields,
    ctx: &mut InsertContext<'_>,
) -> Result<Record, Error> {
    let supplied_expiry = match input.get(FIELD_EXPIRES_AT) {
        Some(Value::Int(at)) => Some(*at),
        _ => None,
    };
    strip_metadata(&mut input);

    for field in schema.def.fields.values() {
        if !input.contains_key(&field.name) {
            if let Some(generator) = field.generated {
                input.insert(field.name.clone(), run_generator(generator, ctx));
            } else if let Some(default) = &field.default {
                input.insert(field.name.clone(), resolve_default(default, ctx.now_ms));
            }
        }
    }

    validate_fields(schema, &input)?;

    input.insert(FIELD_VERSION.to_string(), Value::Int(1));
    input.insert(FIELD_CREATED_AT.to_string(), Value::Int(ctx.now_ms));
    input.insert(FIELD_UPDATED_AT.to_string(), Value::Int(ctx.now_ms));
    if let Some(ttl_ms) = ctx.ttl_ms {
        let expires = supplied_expiry.unwrap_or(ctx.now_ms + ttl_ms);
        input.insert(FIELD_EXPIRES_AT.to_string(), Value::Int(expires));
    }

    Ok(Record::from_fields(input))
}

/// Prepare an update: sanitize changes, merge, re-validate, bump metadata.
///
/// Metadata fields, the primary key field, and generated fields are
/// stripped from the changes before the shallow merge.
pub fn prepare_update(
    schema: &Schema,
    existing: &Record,
    mut changes: Fields,
    now_ms: i64,
) -> Result<Record, Error> {
    strip_metadata(&mut changes);
    changes.remove(schema.key_field());
    for field in schema.def.fields.values() {
        if field.is_generated() {
            changes.remove(&field.name);
        }
    }

    let mut merged = existing.fields().clone();
    merged.extend(changes);

    validate_fields(schema, &merged)?;

    let next_version = existing.version() + 1;
    merged.insert(FIELD_VERSION.to_string(), Value::Int(next_version as i64));
    merged.insert(FIELD_UPDATED_AT.to_string(), Value::Int(now_ms));
    merged.insert(
        FIELD_CREATED_AT.to_string(),
        Value::Int(existing.created_at()),
    );

    Ok(Record::from_fields(merged))
}

fn resolve_default(default: &DefaultValue, now_ms: i64) -> Value {
    match default {
        DefaultValue::Value(v) => v.clone(),
        DefaultValue::CurrentTimestamp => Value::Int(now_ms),
    }
}

fn run_generator(generator: Generator, ctx: &mut InsertContext<'_>) -> Value {
    match generator {
        Generator::Uuid => Value::String(uuid::Uuid::new_v4().to_string()),
        Generator::Cuid => Value::String(new_cuid(ctx.now_ms)),
        Generator::Autoincrement => Value::Int((ctx.next_seq)()),
        Generator::Timestamp => Value::Int(ctx.now_ms),
    }
}

/// Collision-resistant id: `c` + timestamp + entropy, base36.
fn new_cuid(now_ms: i64) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let entropy: String = (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("c{}{}", to_base36(now_ms.max(0) as u64), entropy)
}

fn to_base36(mut n: u64) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 is ascii")
}

/// Validate every schema field against the (merged) field map, collecting
/// all issues. Unknown fields pass through unvalidated.
fn validate_fields(schema: &Schema, fields: &Fields) -> Result<(), Error> {
    let mut issues = Vec::new();

    for field in schema.def.fields.values() {
        validate_field(schema, field, fields.get(&field.name), &mut issues);
    }

    // The primary key is inherently required and must extract to a string
    // or integer key, whatever its field declaration says.
    match fields.get(schema.key_field()) {
        Some(value) if !value.is_null() => {
            if Key::from_value(value).is_none() {
                issues.push(ValidationIssue::new(
                    schema.key_field(),
                    IssueCode::Type,
                    format!(
                        "primary key must be a string or integer, got {}",
                        value.type_name()
                    ),
                ));
            }
        }
        _ => {
            if !issues.iter().any(|i| i.field == schema.key_field()) {
                issues.push(ValidationIssue::new(
                    schema.key_field(),
                    IssueCode::Required,
                    "primary key is required",
                ));
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(issues))
    }
}

fn validate_field(
    schema: &Schema,
    field: &FieldDef,
    value: Option<&Value>,
    issues: &mut Vec<ValidationIssue>,
) {
    let value = match value {
        None | Some(Value::Null) => {
            if field.required {
                issues.push(ValidationIssue::new(
                    &field.name,
                    IssueCode::Required,
                    "field is required",
                ));
            }
            return;
        }
        Some(v) => v,
    };

    if !type_matches(field.field_type, value) {
        issues.push(ValidationIssue::new(
            &field.name,
            IssueCode::Type,
            format!(
                "expected {}, got {}",
                type_name(field.field_type),
                value.type_name()
            ),
        ));
        return;
    }

    if let Some(allowed) = &field.allowed {
        if !allowed.iter().any(|a| a == value) {
            issues.push(ValidationIssue::new(
                &field.name,
                IssueCode::Enum,
                format!("value {value} is not in the allowed set"),
            ));
        }
    }

    if let Some(n) = value.as_number() {
        if let Some(min) = field.min {
            if n < min {
                issues.push(ValidationIssue::new(
                    &field.name,
                    IssueCode::Min,
                    format!("value {n} below minimum {min}"),
                ));
            }
        }
        if let Some(max) = field.max {
            if n > max {
                issues.push(ValidationIssue::new(
                    &field.name,
                    IssueCode::Max,
                    format!("value {n} above maximum {max}"),
                ));
            }
        }
    }

    if let Some(s) = value.as_str() {
        let chars = s.chars().count();
        if let Some(min_len) = field.min_length {
            if chars < min_len {
                issues.push(ValidationIssue::new(
                    &field.name,
                    IssueCode::MinLength,
                    format!("length {chars} below minimum {min_len}"),
                ));
            }
        }
        if let Some(max_len) = field.max_length {
            if chars > max_len {
                issues.push(ValidationIssue::new(
                    &field.name,
                    IssueCode::MaxLength,
                    format!("length {chars} above maximum {max_len}"),
                ));
            }
        }
        if let Some(regex) = schema.pattern(&field.name) {
            if !regex.is_match(s) {
                issues.push(ValidationIssue::new(
                    &field.name,
                    IssueCode::Pattern,
                    format!("value does not match pattern {:?}", regex.as_str()),
                ));
            }
        }
        if let Some(format) = field.format {
            if !format_matches(format, s) {
                issues.push(ValidationIssue::new(
                    &field.name,
                    IssueCode::Format,
                    format!("value is not a valid {}", format_name(format)),
                ));
            }
        }
    }
}

fn type_matches(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::String => matches!(value, Value::String(_)),
        FieldType::Int => matches!(value, Value::Int(_)),
        FieldType::Float => matches!(value, Value::Int(_) | Value::Float(_)),
        FieldType::Bool => matches!(value, Value::Bool(_)),
        FieldType::Timestamp => matches!(value, Value::Int(_)),
        FieldType::Array => matches!(value, Value::Array(_)),
        FieldType::Map => matches!(value, Value::Map(_)),
        FieldType::Any => true,
    }
}

fn type_name(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::String => "string",
        FieldType::Int => "int",
        FieldType::Float => "float",
        FieldType::Bool => "bool",
        FieldType::Timestamp => "timestamp",
        FieldType::Array => "array",
        FieldType::Map => "map",
        FieldType::Any => "any",
    }
}

fn format_name(format: Format) -> &'static str {
    match format {
        Format::Email => "email",
        Format::Url => "url",
        Format::Uuid => "uuid",
    }
}

fn format_matches(format: Format, s: &str) -> bool {
    match format {
        Format::Email => {
            let mut parts = s.splitn(2, '@');
            let local = parts.next().unwrap_or("");
            match parts.next() {
                Some(domain) => {
                    !local.is_empty()
                        && !domain.is_empty()
                        && domain.contains('.')
                        && !domain.starts_with('.')
                        && !domain.ends_with('.')
                        && !s.chars().any(char::is_whitespace)
                }
                None => false,
            }
        }
        Format::Url => {
            let rest = s
                .strip_prefix("http://")
                .or_else(|| s.strip_prefix("https://"));
            matches!(rest, Some(r) if !r.is_empty())
        }
        Format::Uuid => {
            let bytes = s.as_bytes();
            bytes.len() == 36
                && bytes.iter().enumerate().all(|(i, b)| match i {
                    8 | 13 | 18 | 23 => *b == b'-',
                    _ => b.is_ascii_hexdigit(),
                })
        }
    }
}
