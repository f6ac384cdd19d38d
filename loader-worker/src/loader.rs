use std::fs;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use loader_common::cipher::CipherEngine;
use loader_common::keyservice::KeyService;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{LoaderError, SinkError};
use crate::filter::FilterStatus;
use crate::mapper::{MappedRecord, RecordMapper};
use crate::reader::{DumpReader, DATA_FILE_SUFFIX};
use crate::record_key::printable_key;
use crate::sink::RecordSink;

/// Counts of what happened to the records of one or more files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub files: u64,
    pub written: u64,
    pub filtered_too_early: u64,
    pub filtered_too_late: u64,
    pub failed: u64,
}

impl AddAssign for LoadSummary {
    fn add_assign(&mut self, other: Self) {
        self.files += other.files;
        self.written += other.written;
        self.filtered_too_early += other.filtered_too_early;
        self.filtered_too_late += other.filtered_too_late;
        self.failed += other.failed;
    }
}

/// List the encrypted dump files in `directory`, in name order.
pub fn list_input_files(directory: &Path) -> Result<Vec<PathBuf>, LoaderError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(directory).map_err(LoaderError::ListingError)? {
        let path = entry.map_err(LoaderError::ListingError)?.path();
        let is_dump = path
            .file_name()
            .map(|name| {
                name.to_string_lossy()
                    .to_lowercase()
                    .ends_with(DATA_FILE_SUFFIX)
            })
            .unwrap_or(false);

        if is_dump && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Loads dump files through a [`RecordMapper`] into a [`RecordSink`], several files at a time.
pub struct Loader {
    key_service: Arc<dyn KeyService + Send + Sync>,
    mapper: Arc<RecordMapper>,
    sink: Arc<dyn RecordSink + Send + Sync>,
    cipher: CipherEngine,
    /// Maximum number of files to process at the same time.
    max_concurrent_files: usize,
}

impl Loader {
    pub fn new(
        key_service: Arc<dyn KeyService + Send + Sync>,
        mapper: Arc<RecordMapper>,
        sink: Arc<dyn RecordSink + Send + Sync>,
        max_concurrent_files: usize,
    ) -> Self {
        Self {
            key_service,
            mapper,
            sink,
            cipher: CipherEngine::new(),
            max_concurrent_files: max_concurrent_files.max(1),
        }
    }

    /// Load every file in `files`.
    ///
    /// Records that fail to map are logged and counted. Any error opening or reading a file,
    /// including the key service giving up, stops the whole load. Files still in flight stop
    /// at their next line, and no record is written once this returns.
    pub async fn run(&self, files: Vec<PathBuf>) -> Result<LoadSummary, LoaderError> {
        info!(
            files = files.len(),
            unit_of_work_id = self.mapper.unit_of_work_id(),
            "starting load"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_files));
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        for path in files {
            let semaphore = semaphore.clone();
            let key_service = self.key_service.clone();
            let mapper = self.mapper.clone();
            let sink = self.sink.clone();
            let cipher = self.cipher;
            let cancelled = cancelled.clone();

            tasks.spawn(async move {
                let permit = semaphore.acquire_owned().await?;
                if cancelled.load(Ordering::SeqCst) {
                    return Ok(LoadSummary::default());
                }
                let result =
                    process_file(path, key_service, mapper, sink, cipher, cancelled).await;
                drop(permit);
                result
            });
        }

        let mut summary = LoadSummary::default();
        let mut failure = None;
        // Drain every task, even after a failure, so blocking work has stopped before returning.
        while let Some(result) = tasks.join_next().await {
            let result = match result {
                Ok(result) => result,
                Err(error) => Err(LoaderError::from(error)),
            };

            match result {
                Ok(file_summary) => summary += file_summary,
                Err(error) if failure.is_none() => {
                    error!("aborting load: {}", error);
                    cancelled.store(true, Ordering::SeqCst);
                    semaphore.close();
                    failure = Some(error);
                }
                Err(error) => debug!("ignoring error from aborted load: {}", error),
            }
        }

        if let Some(error) = failure {
            return Err(error);
        }

        self.sink.flush()?;
        info!(?summary, "load complete");
        Ok(summary)
    }
}

async fn process_file(
    path: PathBuf,
    key_service: Arc<dyn KeyService + Send + Sync>,
    mapper: Arc<RecordMapper>,
    sink: Arc<dyn RecordSink + Send + Sync>,
    cipher: CipherEngine,
    cancelled: Arc<AtomicBool>,
) -> Result<LoadSummary, LoaderError> {
    let now = tokio::time::Instant::now();

    let reader = DumpReader::open(&path, key_service.as_ref(), &cipher).await?;
    let labels = [("collection", reader.collection().to_string())];

    let summary = tokio::task::spawn_blocking(move || {
        load_records(reader, &mapper, sink.as_ref(), &cancelled)
    })
    .await??;

    metrics::counter!("files_loaded_total", &labels).increment(1);
    metrics::histogram!("file_processing_duration_seconds", &labels)
        .record(now.elapsed().as_secs_f64());
    info!(path = %path.display(), ?summary, "finished file");

    Ok(summary)
}

fn load_records(
    reader: DumpReader,
    mapper: &RecordMapper,
    sink: &(dyn RecordSink + Send + Sync),
    cancelled: &AtomicBool,
) -> Result<LoadSummary, LoaderError> {
    let collection = reader.collection().clone();
    let mut summary = LoadSummary {
        files: 1,
        ..Default::default()
    };

    for (index, line) in reader.enumerate() {
        if cancelled.load(Ordering::SeqCst) {
            warn!(%collection, line = index + 1, "load aborted, stopping file");
            break;
        }

        let line = line?;
        match mapper.map(&line, &collection) {
            Ok(record) => route_record(&record, sink, &mut summary)?,
            Err(error) => {
                error!(%collection, line = index + 1, "failed to map record: {}", error);
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

/// Write a record that passed the filter, or count why it was held back.
fn route_record(
    record: &MappedRecord,
    sink: &(dyn RecordSink + Send + Sync),
    summary: &mut LoadSummary,
) -> Result<(), SinkError> {
    match record.filter_status {
        FilterStatus::DoNotFilter if record.key.is_empty() => {
            error!(version = record.version, "record has an empty key, not writing it");
            metrics::counter!("records_failed_total", "reason" => "empty_key").increment(1);
            summary.failed += 1;
            return Ok(());
        }
        FilterStatus::DoNotFilter => {
            sink.write(record)?;
            summary.written += 1;
            return Ok(());
        }
        FilterStatus::FilterTooEarly => summary.filtered_too_early += 1,
        FilterStatus::FilterTooLate => summary.filtered_too_late += 1,
    }

    debug!(
        key = %printable_key(&record.key),
        version = record.version,
        status = %record.filter_status,
        "filtered record"
    );
    let labels = [("status", record.filter_status.to_string())];
    metrics::counter!("records_filtered_total", &labels).increment(1);

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct CollectingSink {
        records: Mutex<Vec<MappedRecord>>,
    }

    impl RecordSink for CollectingSink {
        fn write(&self, record: &MappedRecord) -> Result<(), SinkError> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        fn flush(&self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn record(key: &[u8], filter_status: FilterStatus) -> MappedRecord {
        MappedRecord {
            key: key.to_vec(),
            envelope: "{}".to_owned(),
            version: 1,
            filter_status,
        }
    }

    #[test]
    fn test_route_record() {
        let sink = CollectingSink::default();
        let mut summary = LoadSummary::default();

        for status in [
            FilterStatus::DoNotFilter,
            FilterStatus::FilterTooEarly,
            FilterStatus::FilterTooLate,
        ] {
            route_record(&record(b"\x01\x02\x03\x04{}", status), &sink, &mut summary).unwrap();
        }

        assert_eq!(
            summary,
            LoadSummary {
                written: 1,
                filtered_too_early: 1,
                filtered_too_late: 1,
                ..Default::default()
            }
        );
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_key_is_not_written() {
        let sink = CollectingSink::default();
        let mut summary = LoadSummary::default();

        route_record(&record(b"", FilterStatus::DoNotFilter), &sink, &mut summary).unwrap();

        assert_eq!(
            summary,
            LoadSummary {
                failed: 1,
                ..Default::default()
            }
        );
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[test]
    fn test_list_input_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "db.b.01.json.gz.enc",
            "db.a.01.json.gz.enc",
            "db.a.01.json.encryption.json",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("nested.json.gz.enc")).unwrap();

        let files = list_input_files(dir.path()).unwrap();

        assert_eq!(
            files,
            vec![
                dir.path().join("db.a.01.json.gz.enc"),
                dir.path().join("db.b.01.json.gz.enc"),
            ]
        );
    }

    #[test]
    fn test_list_missing_directory() {
        assert!(matches!(
            list_input_files(Path::new("/does/not/exist")),
            Err(LoaderError::ListingError(_))
        ));
    }

    #[test]
    fn test_summaries_add_up() {
        let mut total = LoadSummary::default();
        total += LoadSummary {
            files: 1,
            written: 2,
            filtered_too_early: 3,
            filtered_too_late: 4,
            failed: 5,
        };
        total += LoadSummary {
            files: 1,
            written: 1,
            ..Default::default()
        };
        assert_eq!(
            total,
            LoadSummary {
                files: 2,
                written: 3,
                filtered_too_early: 3,
                filtered_too_late: 4,
                failed: 5,
            }
        );
    }
}
