use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use base64::{engine::general_purpose::STANDARD, Engine};
use metrics::counter;
use serde::Serialize;

use crate::error::SinkError;
use crate::mapper::MappedRecord;
use crate::record_key::printable_key;

/// Destination for mapped records. Writes happen from blocking file workers.
pub trait RecordSink {
    fn write(&self, record: &MappedRecord) -> Result<(), SinkError>;
    fn flush(&self) -> Result<(), SinkError>;
}

pub struct PrintSink {}

impl RecordSink for PrintSink {
    fn write(&self, record: &MappedRecord) -> Result<(), SinkError> {
        tracing::info!(
            key = %printable_key(&record.key),
            version = record.version,
            "record: {}",
            record.envelope
        );
        counter!("records_written_total").increment(1);

        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Serialize)]
struct StoredRecord<'a> {
    key: String,
    version: i64,
    envelope: &'a str,
}

/// Appends one JSON object per record to a local file: the base64 key, the version and the
/// envelope.
pub struct JsonlFileSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlFileSink {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        Ok(Self {
            writer: Mutex::new(BufWriter::new(File::create(path)?)),
        })
    }
}

impl RecordSink for JsonlFileSink {
    fn write(&self, record: &MappedRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&StoredRecord {
            key: STANDARD.encode(&record.key),
            version: record.version,
            envelope: &record.envelope,
        })?;
        line.push(b'\n');

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&line)?;
        counter!("records_written_total").increment(1);

        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.flush()?;
        Ok(())
    }
}
