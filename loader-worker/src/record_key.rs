use std::collections::BTreeMap;

use flate2::Crc;
use serde_json::{Map, Value};

use crate::document::ID_FIELD;
use crate::error::MappingError;

const CHECKSUM_LENGTH: usize = 4;

/// Derive the storage key of a record from its envelope.
///
/// The key is the CRC-32 of the record id, big-endian, followed by the id itself as JSON with
/// sorted top level keys. String and numeric ids are first wrapped as `{"id": "..."}`.
/// An envelope without a usable id yields an empty key.
pub fn record_key(envelope: &str) -> Result<Vec<u8>, MappingError> {
    let envelope: Value = serde_json::from_str(envelope)?;
    key_from_envelope(&envelope)
}

pub fn key_from_envelope(envelope: &Value) -> Result<Vec<u8>, MappingError> {
    let id = match identifier(envelope) {
        Some(id) => id,
        None => return Ok(Vec::new()),
    };

    let sorted: BTreeMap<&String, &Value> = id.iter().collect();
    let id = serde_json::to_vec(&sorted)?;

    let mut key = Vec::with_capacity(CHECKSUM_LENGTH + id.len());
    key.extend_from_slice(&checksum(&id));
    key.extend_from_slice(&id);
    Ok(key)
}

fn identifier(envelope: &Value) -> Option<Map<String, Value>> {
    match envelope.get("message")?.get(ID_FIELD)? {
        Value::Object(id) => Some(id.clone()),
        Value::String(id) => Some(wrap(id.to_owned())),
        Value::Number(id) => Some(wrap(id.to_string())),
        _ => None,
    }
}

fn wrap(id: String) -> Map<String, Value> {
    let mut wrapped = Map::new();
    wrapped.insert("id".to_owned(), Value::String(id));
    wrapped
}

fn checksum(bytes: &[u8]) -> [u8; CHECKSUM_LENGTH] {
    let mut crc = Crc::new();
    crc.update(bytes);
    crc.sum().to_be_bytes()
}

/// Render a key for logs: the checksum bytes escaped as `\xHH`, then the id.
pub fn printable_key(key: &[u8]) -> String {
    if key.len() <= CHECKSUM_LENGTH {
        return String::from_utf8_lossy(key).into_owned();
    }

    let (checksum, id) = key.split_at(CHECKSUM_LENGTH);
    let mut printable = String::with_capacity(CHECKSUM_LENGTH * 4 + id.len());
    for byte in checksum {
        printable.push_str(&format!("\\x{:02X}", byte));
    }
    printable.push_str(&String::from_utf8_lossy(id));
    printable
}
