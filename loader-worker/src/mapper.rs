use loader_common::cipher::CipherEngine;
use loader_common::domain::DataKeyResult;
use loader_common::keyservice::{KeyService, KeyServiceError};
use serde_json::Value;
use tracing::debug;

use crate::dates::{
    created_date, document_last_modified, optional_field, timestamp_millis, TimestampSource,
};
use crate::document::{
    Document, ARCHIVED_DATE_TIME_FIELD, CREATED_DATE_TIME_FIELD, ID_FIELD,
    LAST_MODIFIED_DATE_TIME_FIELD, REMOVED_DATE_TIME_FIELD,
};
use crate::envelope::{EnvelopeContent, MessageEnvelopeBuilder};
use crate::error::MappingError;
use crate::filter::{FilterPolicy, FilterStatus};
use crate::ids::{normalize_id, IdModification};
use crate::reader::Collection;
use crate::record_key::record_key;
use crate::reformat::reformat_deleted_records;

/// A record ready to be written.
#[derive(Clone, Debug, PartialEq)]
pub struct MappedRecord {
    pub key: Vec<u8>,
    pub envelope: String,
    /// Epoch milliseconds of the record's last modified date.
    pub version: i64,
    pub filter_status: FilterStatus,
}

/// Turns dump lines into encrypted, enveloped records.
///
/// Every record mapped by one instance is encrypted under the same data key.
pub struct RecordMapper {
    cipher: CipherEngine,
    filter: FilterPolicy,
    envelope_builder: MessageEnvelopeBuilder,
    data_key: DataKeyResult,
}

impl RecordMapper {
    pub fn new(
        cipher: CipherEngine,
        filter: FilterPolicy,
        envelope_builder: MessageEnvelopeBuilder,
        data_key: DataKeyResult,
    ) -> Self {
        Self {
            cipher,
            filter,
            envelope_builder,
            data_key,
        }
    }

    /// Fetch a data key and create a mapper that uses it.
    pub async fn initialize(
        key_service: &(dyn KeyService + Send + Sync),
        cipher: CipherEngine,
        filter: FilterPolicy,
        envelope_builder: MessageEnvelopeBuilder,
    ) -> Result<Self, KeyServiceError> {
        let data_key = key_service.issue_data_key().await?;
        debug!(
            key_encryption_key_id = %data_key.data_key_encryption_key_id,
            "issued data key"
        );
        Ok(Self::new(cipher, filter, envelope_builder, data_key))
    }

    pub fn unit_of_work_id(&self) -> &str {
        self.envelope_builder.unit_of_work_id()
    }

    pub fn map(&self, line: &str, collection: &Collection) -> Result<MappedRecord, MappingError> {
        let labels = [("collection", collection.to_string())];

        let result = self.map_record(line, collection);
        match &result {
            Ok(_) => metrics::counter!("records_mapped_total", &labels).increment(1),
            Err(_) => metrics::counter!("records_failed_total", &labels).increment(1),
        }
        result
    }

    fn map_record(&self, line: &str, collection: &Collection) -> Result<MappedRecord, MappingError> {
        let document = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(document)) => document,
            Ok(_) => {
                return Err(MappingError::InvalidRecord(
                    "record is not a JSON object".to_owned(),
                ))
            }
            Err(error) => {
                return Err(MappingError::InvalidRecord(format!(
                    "malformed JSON: {}",
                    error
                )))
            }
        };

        let (mut document, removed_record_was_altered, archived_record_was_altered) =
            reformat_deleted_records(document)?;

        let id = normalize_id(document.get(ID_FIELD))?;
        if id.modification == IdModification::InvalidId {
            return Err(MappingError::InvalidRecord(
                "record has a missing or invalid _id".to_owned(),
            ));
        }

        let (created, created_was_modified) = created_date(&document)?;
        let (removed, removed_was_modified) = optional_field(REMOVED_DATE_TIME_FIELD, &document)?;
        let (archived, archived_was_modified) =
            optional_field(ARCHIVED_DATE_TIME_FIELD, &document)?;
        let (last_modified, last_modified_source) = document_last_modified(&document, &created)?;

        if id.modification.was_modified() {
            document.insert(ID_FIELD.to_owned(), id.to_value()?);
        }
        if last_modified_source != TimestampSource::LastModified {
            overwrite(&mut document, LAST_MODIFIED_DATE_TIME_FIELD, &last_modified);
        }
        if created_was_modified {
            overwrite(&mut document, CREATED_DATE_TIME_FIELD, &created);
        }
        if removed_was_modified {
            overwrite(&mut document, REMOVED_DATE_TIME_FIELD, &removed);
        }
        if archived_was_modified {
            overwrite(&mut document, ARCHIVED_DATE_TIME_FIELD, &archived);
        }

        let version = timestamp_millis(&last_modified)?;

        let body = serde_json::to_string(&document)?;
        let encryption = self
            .cipher
            .encrypt(&self.data_key.plaintext_data_key, body.as_bytes())?;

        let envelope = self.envelope_builder.build(&EnvelopeContent {
            document: &document,
            id: &id,
            last_modified: &last_modified,
            last_modified_source,
            created_date_time_was_altered: altered(&created, created_was_modified),
            removed_date_time_was_altered: altered(&removed, removed_was_modified),
            archived_date_time_was_altered: altered(&archived, archived_was_modified),
            removed_record_was_altered,
            archived_record_was_altered,
            encryption: &encryption,
            data_key: &self.data_key,
            database: &collection.database,
            collection: &collection.collection,
        })?;

        let key = record_key(&envelope)?;

        Ok(MappedRecord {
            key,
            envelope,
            version,
            filter_status: self.filter.classify(version),
        })
    }
}

fn overwrite(document: &mut Document, field: &str, value: &str) {
    document.insert(field.to_owned(), Value::String(value.to_owned()));
}

fn altered(value: &str, was_modified: bool) -> bool {
    was_modified && !value.trim().is_empty()
}
