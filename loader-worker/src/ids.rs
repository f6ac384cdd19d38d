use serde_json::Value;

use crate::dates::{flatten_known_dates, has_date_field};
use crate::document::{primitive_string, single_key_wrapper, KNOWN_DATE_FIELDS, MONGO_OID_FIELD};
use crate::error::MappingError;

/// What happened to a record identifier during normalization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdModification {
    /// An object id left as it was.
    UnmodifiedObjectId,
    /// A primitive id, kept as its string form.
    UnmodifiedStringId,
    /// `{"$oid": "..."}` reduced to the bare oid.
    FlattenedMongoId,
    /// An object id with embedded date wrappers that were flattened.
    FlattenedInnerDate,
    /// Null or an array.
    InvalidId,
}

impl IdModification {
    pub fn was_modified(&self) -> bool {
        matches!(
            self,
            IdModification::FlattenedMongoId | IdModification::FlattenedInnerDate
        )
    }

    /// Whether the normalized id renders as a JSON string rather than an object.
    pub fn is_string(&self) -> bool {
        matches!(
            self,
            IdModification::UnmodifiedStringId | IdModification::FlattenedMongoId
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedId {
    /// The bare id for string ids, otherwise the compact JSON of the id object.
    pub id: String,
    pub modification: IdModification,
}

impl NormalizedId {
    fn new(id: String, modification: IdModification) -> Self {
        NormalizedId { id, modification }
    }

    /// The id as it appears in the outgoing record.
    pub fn to_value(&self) -> Result<Value, MappingError> {
        match self.modification {
            IdModification::InvalidId => {
                Err(MappingError::InvalidRecord("record has an invalid _id".to_owned()))
            }
            modification if modification.is_string() => Ok(Value::String(self.id.clone())),
            _ => Ok(serde_json::from_str(&self.id)?),
        }
    }
}

/// Normalize a record identifier. The input is never mutated; date flattening happens on a copy.
pub fn normalize_id(id: Option<&Value>) -> Result<NormalizedId, MappingError> {
    match id {
        Some(id @ Value::Object(obj)) => {
            if let Some(oid) = single_key_wrapper(id, MONGO_OID_FIELD) {
                return Ok(NormalizedId::new(oid, IdModification::FlattenedMongoId));
            }

            if KNOWN_DATE_FIELDS
                .iter()
                .any(|field| has_date_field(obj, field))
            {
                let mut flattened = obj.clone();
                flatten_known_dates(&mut flattened, &KNOWN_DATE_FIELDS)?;
                return Ok(NormalizedId::new(
                    serde_json::to_string(&flattened)?,
                    IdModification::FlattenedInnerDate,
                ));
            }

            Ok(NormalizedId::new(
                serde_json::to_string(obj)?,
                IdModification::UnmodifiedObjectId,
            ))
        }
        None | Some(Value::Null) | Some(Value::Array(_)) => {
            Ok(NormalizedId::new(String::new(), IdModification::InvalidId))
        }
        Some(primitive) => Ok(NormalizedId::new(
            primitive_string(primitive).unwrap_or_default(),
            IdModification::UnmodifiedStringId,
        )),
    }
}
