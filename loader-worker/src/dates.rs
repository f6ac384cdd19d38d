use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::warn;

use crate::document::{
    primitive_string, single_key_wrapper, Document, CREATED_DATE_TIME_FIELD,
    LAST_MODIFIED_DATE_TIME_FIELD, MONGO_DATE_FIELD,
};
use crate::error::MappingError;

/// Stands in for a last modified date when a record carries neither a modified nor a created date.
pub const EPOCH: &str = "1980-01-01T00:00:00.000+0000";
pub const EPOCH_MILLIS: i64 = 315_532_800_000;

/// Dates as exported by mongo, always UTC.
const INCOMING_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";
/// Dates with an explicit offset, which includes every date this module writes.
const OFFSET_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%z";
const CANONICAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

/// Where the last modified date of a record was taken from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampSource {
    /// A plain `_lastModifiedDateTime`, passed through untouched.
    LastModified,
    /// A `_lastModifiedDateTime` that was unwrapped from `{"$date": ...}`.
    LastModifiedStripped,
    CreatedDateTime,
    Epoch,
}

impl TimestampSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampSource::LastModified => "_lastModifiedDateTime",
            TimestampSource::LastModifiedStripped => "_lastModifiedDateTimeStripped",
            TimestampSource::CreatedDateTime => "createdDateTime",
            TimestampSource::Epoch => "epoch",
        }
    }
}

/// The shapes a date field takes in a dump.
#[derive(Debug, PartialEq, Eq)]
pub enum DateValue {
    Absent,
    /// `{"$date": "..."}`
    Wrapped(String),
    Plain(String),
    /// Null, an array, or an object that is not a date wrapper.
    Malformed,
}

impl DateValue {
    pub fn of(value: Option<&Value>) -> Self {
        match value {
            None => DateValue::Absent,
            Some(value) => {
                if let Some(date) = single_key_wrapper(value, MONGO_DATE_FIELD) {
                    DateValue::Wrapped(date)
                } else if let Some(date) = primitive_string(value) {
                    DateValue::Plain(date)
                } else {
                    DateValue::Malformed
                }
            }
        }
    }
}

pub fn parse_date(date: &str) -> Result<DateTime<Utc>, MappingError> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(date, INCOMING_FORMAT) {
        return Ok(Utc.from_utc_datetime(&naive));
    }

    DateTime::parse_from_str(date, OFFSET_FORMAT)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| MappingError::UnparseableDate(date.to_owned()))
}

/// Re-render a date in the canonical `yyyy-MM-ddTHH:mm:ss.SSS+0000` form.
pub fn canonical_date(date: &str) -> Result<String, MappingError> {
    Ok(parse_date(date)?.format(CANONICAL_FORMAT).to_string())
}

pub fn timestamp_millis(date: &str) -> Result<i64, MappingError> {
    Ok(parse_date(date)?.timestamp_millis())
}

/// Read an optional date field of `parent`.
///
/// Returns the date to use and whether the field was modified: wrapped dates are unwrapped and
/// canonicalised, plain values are passed through, and anything else is replaced by an empty
/// string.
pub fn optional_field(field: &str, parent: &Document) -> Result<(String, bool), MappingError> {
    match DateValue::of(parent.get(field)) {
        DateValue::Absent => Ok((String::new(), false)),
        DateValue::Wrapped(date) => Ok((canonical_date(&date)?, true)),
        DateValue::Plain(date) => Ok((date, false)),
        DateValue::Malformed => {
            warn!(
                field,
                value = ?parent.get(field),
                "unexpected value for date field, it will be blanked"
            );
            Ok((String::new(), true))
        }
    }
}

/// Decide the last modified date of a record, falling back to its created date and then to
/// [`EPOCH`].
pub fn last_modified(
    last_modified: Option<&Value>,
    created: &str,
) -> Result<(String, TimestampSource), MappingError> {
    match DateValue::of(last_modified) {
        DateValue::Wrapped(date) => Ok((
            canonical_date(&date)?,
            TimestampSource::LastModifiedStripped,
        )),
        DateValue::Plain(date) => Ok((date, TimestampSource::LastModified)),
        DateValue::Absent | DateValue::Malformed if !created.trim().is_empty() => {
            Ok((created.to_owned(), TimestampSource::CreatedDateTime))
        }
        DateValue::Absent | DateValue::Malformed => Ok((EPOCH.to_owned(), TimestampSource::Epoch)),
    }
}

/// Convenience over [`last_modified`] for a whole document.
pub fn document_last_modified(
    document: &Document,
    created: &str,
) -> Result<(String, TimestampSource), MappingError> {
    last_modified(document.get(LAST_MODIFIED_DATE_TIME_FIELD), created)
}

/// Whether `field` of `parent` is a `{"$date": ...}` wrapper.
pub fn has_date_field(parent: &Document, field: &str) -> bool {
    matches!(DateValue::of(parent.get(field)), DateValue::Wrapped(_))
}

/// Replace every known date wrapper among the top level fields of `parent` with its canonical
/// date. Used on object ids, which may embed dates.
pub fn flatten_known_dates(
    parent: &mut Document,
    fields: &[&str],
) -> Result<(), MappingError> {
    for field in fields {
        if let DateValue::Wrapped(date) = DateValue::of(parent.get(*field)) {
            parent.insert((*field).to_owned(), Value::String(canonical_date(&date)?));
        }
    }
    Ok(())
}

/// Shortcut used by the mapper for the created date, which feeds the last modified fallback.
pub fn created_date(document: &Document) -> Result<(String, bool), MappingError> {
    optional_field(CREATED_DATE_TIME_FIELD, document)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_canonical_date() {
        assert_eq!(
            canonical_date("2019-07-04T07:27:35.104Z").unwrap(),
            "2019-07-04T07:27:35.104+0000"
        );
        assert_eq!(
            canonical_date("2019-07-04T07:27:35.104+0100").unwrap(),
            "2019-07-04T06:27:35.104+0000"
        );
        assert_eq!(
            canonical_date("2019-07-04T07:27:35.1Z").unwrap(),
            "2019-07-04T07:27:35.100+0000"
        );
    }

    #[test]
    fn test_canonical_date_is_idempotent() {
        let once = canonical_date("2019-12-14T15:01:02.000Z").unwrap();
        assert_eq!(canonical_date(&once).unwrap(), once);
    }

    #[test]
    fn test_canonical_date_rejects_garbage() {
        match canonical_date("2019-12-14") {
            Err(MappingError::UnparseableDate(date)) => assert_eq!(date, "2019-12-14"),
            other => panic!("expected unparseable date, got {:?}", other),
        }
        assert!(canonical_date("").is_err());
    }

    #[test]
    fn test_timestamp_millis() {
        assert_eq!(timestamp_millis(EPOCH).unwrap(), EPOCH_MILLIS);
        assert_eq!(
            timestamp_millis("2018-12-14T15:01:02.000+0000").unwrap(),
            1544799662000
        );
        assert_eq!(
            timestamp_millis("2018-12-14T15:01:02.000Z").unwrap(),
            1544799662000
        );
    }

    #[test]
    fn test_optional_field_wrapped_date() {
        let parent = doc(json!({"createdDateTime": {"$date": "2019-08-05T02:10:19.887Z"}}));
        assert_eq!(
            optional_field("createdDateTime", &parent).unwrap(),
            ("2019-08-05T02:10:19.887+0000".to_owned(), true)
        );
    }

    #[test]
    fn test_optional_field_plain_date_is_untouched() {
        let parent = doc(json!({"createdDateTime": "2019-08-05T02:10:19.887Z"}));
        assert_eq!(
            optional_field("createdDateTime", &parent).unwrap(),
            ("2019-08-05T02:10:19.887Z".to_owned(), false)
        );
    }

    #[test]
    fn test_optional_field_absent() {
        let parent = doc(json!({"other": 1}));
        assert_eq!(
            optional_field("createdDateTime", &parent).unwrap(),
            (String::new(), false)
        );
    }

    #[test]
    fn test_optional_field_malformed_is_blanked() {
        for value in [
            json!({"createdDateTime": {"$date": "2019", "additionalField": "ABC"}}),
            json!({"createdDateTime": null}),
            json!({"createdDateTime": ["2019-08-05T02:10:19.887Z"]}),
        ] {
            assert_eq!(
                optional_field("createdDateTime", &doc(value)).unwrap(),
                (String::new(), true)
            );
        }
    }

    #[test]
    fn test_optional_field_unparseable_wrapped_date() {
        let parent = doc(json!({"createdDateTime": {"$date": "yesterday"}}));
        assert!(matches!(
            optional_field("createdDateTime", &parent),
            Err(MappingError::UnparseableDate(_))
        ));
    }

    #[test]
    fn test_last_modified_plain() {
        let value = json!("2019-08-05T02:10:19.887Z");
        assert_eq!(
            last_modified(Some(&value), "").unwrap(),
            (
                "2019-08-05T02:10:19.887Z".to_owned(),
                TimestampSource::LastModified
            )
        );
    }

    #[test]
    fn test_last_modified_wrapped() {
        let value = json!({"$date": "2019-08-05T02:10:19.887Z"});
        let (date, source) = last_modified(Some(&value), "").unwrap();
        assert_eq!(date, "2019-08-05T02:10:19.887+0000");
        assert_eq!(source.as_str(), "_lastModifiedDateTimeStripped");
    }

    #[test]
    fn test_last_modified_falls_back_to_created() {
        let created = "2019-08-05T02:10:19.887+0000";
        let malformed = json!({"$date": "2019", "additionalField": "ABC"});

        for value in [None, Some(&Value::Null), Some(&malformed)] {
            assert_eq!(
                last_modified(value, created).unwrap(),
                (created.to_owned(), TimestampSource::CreatedDateTime)
            );
        }
    }

    #[test]
    fn test_last_modified_falls_back_to_epoch() {
        assert_eq!(
            last_modified(None, "").unwrap(),
            (EPOCH.to_owned(), TimestampSource::Epoch)
        );
        assert_eq!(
            last_modified(None, "   ").unwrap(),
            (EPOCH.to_owned(), TimestampSource::Epoch)
        );
    }

    #[test]
    fn test_has_date_field() {
        let parent = doc(json!({
            "wrapped": {"$date": "2019-08-05T02:10:19.887Z"},
            "plain": "2019-08-05T02:10:19.887Z",
            "other": {"$oid": "abc"},
        }));
        assert!(has_date_field(&parent, "wrapped"));
        assert!(!has_date_field(&parent, "plain"));
        assert!(!has_date_field(&parent, "other"));
        assert!(!has_date_field(&parent, "missing"));
    }
}
