//! Field names and small helpers for documents read from a dump.
use serde_json::{Map, Value};

pub const ID_FIELD: &str = "_id";
pub const TYPE_FIELD: &str = "@type";
pub const LAST_MODIFIED_DATE_TIME_FIELD: &str = "_lastModifiedDateTime";
pub const CREATED_DATE_TIME_FIELD: &str = "createdDateTime";
pub const REMOVED_DATE_TIME_FIELD: &str = "_removedDateTime";
pub const ARCHIVED_DATE_TIME_FIELD: &str = "_archivedDateTime";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const REMOVED_RECORD_FIELD: &str = "_removed";
pub const ARCHIVED_RECORD_FIELD: &str = "_archived";
pub const MONGO_DATE_FIELD: &str = "$date";
pub const MONGO_OID_FIELD: &str = "$oid";

pub const MONGO_DELETE: &str = "MONGO_DELETE";
pub const MONGO_IMPORT: &str = "MONGO_IMPORT";

/// Date fields that are flattened wherever they appear, including inside object ids.
pub const KNOWN_DATE_FIELDS: [&str; 4] = [
    CREATED_DATE_TIME_FIELD,
    LAST_MODIFIED_DATE_TIME_FIELD,
    REMOVED_DATE_TIME_FIELD,
    ARCHIVED_DATE_TIME_FIELD,
];

pub type Document = Map<String, Value>;

/// The string form of a JSON primitive, `None` for null, arrays and objects.
pub fn primitive_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_owned()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// If `value` is an object holding exactly one primitive under `key`, return its string form.
/// This is how mongo exports wrap dates (`{"$date": ...}`) and object ids (`{"$oid": ...}`).
pub fn single_key_wrapper(value: &Value, key: &str) -> Option<String> {
    match value {
        Value::Object(obj) if obj.len() == 1 => obj.get(key).and_then(primitive_string),
        _ => None,
    }
}

/// Copy `field` from `source` into `target`, replacing any existing value. Absent fields are skipped.
pub fn copy_field(field: &str, source: &Document, target: &mut Document) {
    if let Some(value) = source.get(field) {
        target.insert(field.to_owned(), value.clone());
    }
}
