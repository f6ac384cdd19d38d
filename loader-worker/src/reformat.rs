use serde_json::Value;
use tracing::warn;

use crate::document::{
    copy_field, Document, ARCHIVED_DATE_TIME_FIELD, ARCHIVED_RECORD_FIELD, ID_FIELD,
    LAST_MODIFIED_DATE_TIME_FIELD, MONGO_DELETE, REMOVED_DATE_TIME_FIELD, REMOVED_RECORD_FIELD,
    TIMESTAMP_FIELD, TYPE_FIELD,
};
use crate::error::MappingError;

/// Historic collections keep deleted documents nested under a wrapper field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletedRecord {
    Removed,
    Archived,
}

impl DeletedRecord {
    pub fn wrapper_field(&self) -> &'static str {
        match self {
            DeletedRecord::Removed => REMOVED_RECORD_FIELD,
            DeletedRecord::Archived => ARCHIVED_RECORD_FIELD,
        }
    }

    pub fn date_field(&self) -> &'static str {
        match self {
            DeletedRecord::Removed => REMOVED_DATE_TIME_FIELD,
            DeletedRecord::Archived => ARCHIVED_DATE_TIME_FIELD,
        }
    }
}

/// If `document` wraps a deleted record, replace it with the inner record turned into a delete
/// event, carrying over the outer modified, deleted and timestamp fields.
///
/// Returns the resulting document and whether it was rewritten.
pub fn reformat_deleted(
    document: Document,
    kind: DeletedRecord,
) -> Result<(Document, bool), MappingError> {
    let mut inner = match document.get(kind.wrapper_field()) {
        None => return Ok((document, false)),
        Some(Value::Object(inner)) => inner.clone(),
        Some(_) => {
            return Err(MappingError::InvalidRecord(format!(
                "{} is not an object",
                kind.wrapper_field()
            )))
        }
    };

    copy_field(LAST_MODIFIED_DATE_TIME_FIELD, &document, &mut inner);
    copy_field(kind.date_field(), &document, &mut inner);
    copy_field(TIMESTAMP_FIELD, &document, &mut inner);
    inner.insert(TYPE_FIELD.to_owned(), Value::String(MONGO_DELETE.to_owned()));

    Ok((inner, true))
}

/// Apply [`reformat_deleted`] for removed and then archived records.
///
/// Returns the document and whether each reformat took place.
pub fn reformat_deleted_records(
    document: Document,
) -> Result<(Document, bool, bool), MappingError> {
    if document.contains_key(REMOVED_RECORD_FIELD) && document.contains_key(ARCHIVED_RECORD_FIELD)
    {
        warn!(
            id = ?document.get(ID_FIELD),
            "record is both removed and archived, the removed copy takes precedence"
        );
    }

    let (document, removed) = reformat_deleted(document, DeletedRecord::Removed)?;
    let (document, archived) = reformat_deleted(document, DeletedRecord::Archived)?;
    Ok((document, removed, archived))
}
