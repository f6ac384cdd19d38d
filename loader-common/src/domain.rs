use std::fmt;

use serde::Deserialize;

/// A data key as issued by the key service.
/// The plaintext half is only used transiently to encrypt records, it is never written out.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataKeyResult {
    pub data_key_encryption_key_id: String,
    pub plaintext_data_key: String,
    pub ciphertext_data_key: String,
}

impl DataKeyResult {
    pub fn new(
        data_key_encryption_key_id: &str,
        plaintext_data_key: &str,
        ciphertext_data_key: &str,
    ) -> Self {
        Self {
            data_key_encryption_key_id: data_key_encryption_key_id.to_owned(),
            plaintext_data_key: plaintext_data_key.to_owned(),
            ciphertext_data_key: ciphertext_data_key.to_owned(),
        }
    }
}

impl fmt::Debug for DataKeyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKeyResult")
            .field("data_key_encryption_key_id", &self.data_key_encryption_key_id)
            .field("plaintext_data_key", &"<redacted>")
            .field("ciphertext_data_key", &self.ciphertext_data_key)
            .finish()
    }
}

/// The outcome of encrypting exactly one payload. Both fields are base64 encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionResult {
    pub initialisation_vector: String,
    pub encrypted: String,
}

/// Encryption metadata stored in a sidecar file next to every dump file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct EncryptionMetadata {
    pub key_encryption_key_id: String,
    pub encrypted_encryption_key: String,
    pub initialisation_vector: String,
    pub key_encryption_key_hash: String,
    pub encryption_cipher: String,
    pub key_encryption_cipher: String,
}
