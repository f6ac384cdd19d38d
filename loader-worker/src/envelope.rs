use std::fs;
use std::path::Path;

use loader_common::domain::{DataKeyResult, EncryptionResult};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dates::TimestampSource;
use crate::document::{primitive_string, Document, MONGO_IMPORT, TYPE_FIELD};
use crate::error::MappingError;
use crate::ids::NormalizedId;
use crate::time::TimeSource;

pub const NOT_SET: &str = "NOT_SET";
const ENVELOPE_TYPE: &str = "HDI";

/// Everything about a mapped record that goes into its envelope.
pub struct EnvelopeContent<'a> {
    /// The document after date and id normalization.
    pub document: &'a Document,
    pub id: &'a NormalizedId,
    pub last_modified: &'a str,
    pub last_modified_source: TimestampSource,
    pub created_date_time_was_altered: bool,
    pub removed_date_time_was_altered: bool,
    pub archived_date_time_was_altered: bool,
    pub removed_record_was_altered: bool,
    pub archived_record_was_altered: bool,
    pub encryption: &'a EncryptionResult,
    pub data_key: &'a DataKeyResult,
    pub database: &'a str,
    pub collection: &'a str,
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "unitOfWorkId")]
    unit_of_work_id: &'a str,
    timestamp: String,
    #[serde(rename = "traceId")]
    trace_id: &'a str,
    #[serde(rename = "@type")]
    kind: &'a str,
    version: &'a str,
    message: Message<'a>,
}

#[derive(Serialize)]
struct Message<'a> {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "_id")]
    id: Value,
    mongo_format_stripped_from_id: bool,
    last_modified_date_time_was_altered: bool,
    created_date_time_was_altered: bool,
    removed_date_time_was_altered: bool,
    archived_date_time_was_altered: bool,
    historic_removed_record_altered_on_import: bool,
    historic_archived_record_altered_on_import: bool,
    #[serde(rename = "_lastModifiedDateTime")]
    last_modified_date_time: &'a str,
    timestamp_created_from: &'a str,
    collection: &'a str,
    db: &'a str,
    #[serde(rename = "dbObject")]
    db_object: &'a str,
    encryption: Encryption<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Encryption<'a> {
    key_encryption_key_id: &'a str,
    initialisation_vector: &'a str,
    encrypted_encryption_key: &'a str,
}

/// Builds the JSON envelope around an encrypted record.
///
/// A builder represents one unit of work: every envelope it builds shares the same
/// `unitOfWorkId` and trace id.
pub struct MessageEnvelopeBuilder {
    unit_of_work_id: String,
    trace_id: String,
    version: String,
    time_source: Box<dyn TimeSource + Send + Sync>,
}

impl MessageEnvelopeBuilder {
    /// Create a builder whose trace id is read from `correlation_id_file`, falling back to
    /// [`NOT_SET`] if the file is missing or empty.
    pub fn new(correlation_id_file: &Path, time_source: Box<dyn TimeSource + Send + Sync>) -> Self {
        Self::with_trace_id(&read_correlation_id(correlation_id_file), time_source)
    }

    pub fn with_trace_id(trace_id: &str, time_source: Box<dyn TimeSource + Send + Sync>) -> Self {
        Self {
            unit_of_work_id: Uuid::new_v4().to_string(),
            trace_id: trace_id.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            time_source,
        }
    }

    pub fn unit_of_work_id(&self) -> &str {
        &self.unit_of_work_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn build(&self, content: &EnvelopeContent) -> Result<String, MappingError> {
        let kind = content
            .document
            .get(TYPE_FIELD)
            .and_then(primitive_string)
            .unwrap_or_else(|| MONGO_IMPORT.to_owned());

        let envelope = Envelope {
            unit_of_work_id: &self.unit_of_work_id,
            timestamp: self.time_source.current_time(),
            trace_id: &self.trace_id,
            kind: ENVELOPE_TYPE,
            version: &self.version,
            message: Message {
                kind,
                id: content.id.to_value()?,
                mongo_format_stripped_from_id: content.id.modification.was_modified(),
                last_modified_date_time_was_altered: content.last_modified_source
                    != TimestampSource::LastModified,
                created_date_time_was_altered: content.created_date_time_was_altered,
                removed_date_time_was_altered: content.removed_date_time_was_altered,
                archived_date_time_was_altered: content.archived_date_time_was_altered,
                historic_removed_record_altered_on_import: content.removed_record_was_altered,
                historic_archived_record_altered_on_import: content.archived_record_was_altered,
                last_modified_date_time: content.last_modified,
                timestamp_created_from: content.last_modified_source.as_str(),
                collection: content.collection,
                db: content.database,
                db_object: &content.encryption.encrypted,
                encryption: Encryption {
                    key_encryption_key_id: &content.data_key.data_key_encryption_key_id,
                    initialisation_vector: &content.encryption.initialisation_vector,
                    encrypted_encryption_key: &content.data_key.ciphertext_data_key,
                },
            },
        };

        Ok(serde_json::to_string(&envelope)?)
    }
}

fn read_correlation_id(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => {
            let correlation_id = contents.trim().to_owned();
            info!(correlation_id, "read correlation id");
            correlation_id
        }
        Ok(_) => {
            warn!(path = %path.display(), "correlation id file is empty");
            NOT_SET.to_owned()
        }
        Err(error) => {
            warn!(path = %path.display(), %error, "could not read correlation id file");
            NOT_SET.to_owned()
        }
    }
}
