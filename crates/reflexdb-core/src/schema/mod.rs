//! Bucket schemas: field definitions, compiled definitions, validation.

mod bucket;
mod field;
mod validator;

pub use bucket::{parse_duration, BucketDef, BucketOrder, Schema, Ttl};
pub use field::{DefaultValue, FieldDef, FieldType, Format, Generator};
pub use validator::{prepare_insert, prepare_update, InsertContext};
