use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use loader_common::cipher::{CipherEngine, DecryptingReader};
use loader_common::domain::EncryptionMetadata;
use loader_common::keyservice::KeyService;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::error::ReaderError;

pub const DATA_FILE_SUFFIX: &str = ".json.gz.enc";
pub const UNSET: &str = "UNSET";

static FILENAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([\w-]+)\.([\w-]+)\.([0-9]+)\.json\.gz\.enc$")
        .expect("hard-coded regular expression to be valid")
});

/// The database and collection a dump file belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Collection {
    pub database: String,
    pub collection: String,
}

impl Collection {
    /// Read the collection from a `{database}.{collection}.{n}.json.gz.enc` file name.
    /// Names that do not match give [`UNSET`] for both parts.
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();

        match FILENAME_PATTERN.captures(&name) {
            Some(captures) => Collection {
                database: captures[1].to_owned(),
                collection: captures[2].to_owned(),
            },
            None => Collection {
                database: UNSET.to_owned(),
                collection: UNSET.to_owned(),
            },
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// The encryption metadata of `db.coll.01.json.gz.enc` lives in `db.coll.01.json.encryption.json`.
pub fn metadata_path(data_path: &Path) -> PathBuf {
    PathBuf::from(
        data_path
            .to_string_lossy()
            .replace("gz.enc", "encryption.json"),
    )
}

pub async fn read_metadata(data_path: &Path) -> Result<EncryptionMetadata, ReaderError> {
    let path = metadata_path(data_path);
    let contents = tokio::fs::read(&path)
        .await
        .map_err(|error| ReaderError::IoError {
            path: path.display().to_string(),
            error,
        })?;

    serde_json::from_slice(&contents).map_err(|error| ReaderError::MetadataError {
        path: path.display().to_string(),
        error,
    })
}

/// Line by line access to the plaintext of an encrypted, gzipped dump file.
pub struct DumpReader {
    lines: BufReader<MultiGzDecoder<DecryptingReader<File>>>,
    path: PathBuf,
    collection: Collection,
    buffer: Vec<u8>,
}

impl DumpReader {
    /// Open `path`, decrypting its data key through `key_service`.
    pub async fn open(
        path: &Path,
        key_service: &(dyn KeyService + Send + Sync),
        cipher: &CipherEngine,
    ) -> Result<Self, ReaderError> {
        let metadata = read_metadata(path).await?;

        let data_key = key_service
            .decrypt_key(
                &metadata.key_encryption_key_id,
                &metadata.encrypted_encryption_key,
            )
            .await
            .map_err(|error| ReaderError::KeyServiceError {
                path: path.display().to_string(),
                error,
            })?;

        let file = File::open(path).map_err(|error| ReaderError::IoError {
            path: path.display().to_string(),
            error,
        })?;
        let decoder = cipher
            .decompressing_decrypting_reader(file, &data_key, &metadata.initialisation_vector)
            .map_err(|error| ReaderError::CipherError {
                path: path.display().to_string(),
                error,
            })?;

        let collection = Collection::from_path(path);
        info!(path = %path.display(), %collection, "opened dump file");

        Ok(DumpReader {
            lines: BufReader::new(decoder),
            path: path.to_path_buf(),
            collection,
            buffer: Vec::new(),
        })
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// The next non blank line, or `None` at the end of the file.
    /// Invalid UTF-8 is replaced rather than failing the whole file.
    pub fn next_line(&mut self) -> Result<Option<String>, ReaderError> {
        loop {
            self.buffer.clear();
            let read = self
                .lines
                .read_until(b'\n', &mut self.buffer)
                .map_err(|error| ReaderError::IoError {
                    path: self.path.display().to_string(),
                    error,
                })?;
            if read == 0 {
                return Ok(None);
            }

            let line = String::from_utf8_lossy(&self.buffer);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                return Ok(Some(line.to_owned()));
            }
        }
    }
}

impl Iterator for DumpReader {
    type Item = Result<String, ReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_from_path() {
        assert_eq!(
            Collection::from_path(Path::new("/data/core.contract-claim.0001.json.gz.enc")),
            Collection {
                database: "core".to_owned(),
                collection: "contract-claim".to_owned(),
            }
        );
        assert_eq!(
            Collection::from_path(Path::new("Agent_Core.Address.12.JSON.GZ.ENC")),
            Collection {
                database: "Agent_Core".to_owned(),
                collection: "Address".to_owned(),
            }
        );
    }

    #[test]
    fn test_unmatched_file_names_are_unset() {
        for name in ["core.json.gz.enc", "core.contract.json.gz.enc", "core.contract.01.json"] {
            let collection = Collection::from_path(Path::new(name));
            assert_eq!(collection.database, UNSET, "{}", name);
            assert_eq!(collection.collection, UNSET, "{}", name);
        }
    }

    #[test]
    fn test_collection_display() {
        let collection = Collection {
            database: "db".to_owned(),
            collection: "coll".to_owned(),
        };
        assert_eq!(collection.to_string(), "db.coll");
    }

    #[test]
    fn test_metadata_path() {
        assert_eq!(
            metadata_path(Path::new("/data/db.coll.01.json.gz.enc")),
            PathBuf::from("/data/db.coll.01.json.encryption.json")
        );
    }
}
