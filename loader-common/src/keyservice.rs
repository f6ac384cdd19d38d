//! Client for the data key service which issues data keys and unwraps encrypted ones.
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::domain::DataKeyResult;
use crate::retry::{Attempt, RetryPolicy};

const ISSUE_DATA_KEY: &str = "issue_data_key";
const DECRYPT_KEY: &str = "decrypt_key";

/// Enumeration of errors returned by the data key service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyServiceError {
    #[error("{operation} failed as the data key service is unavailable, dks_correlation_id: '{correlation_id}': {reason}")]
    Unavailable {
        operation: &'static str,
        correlation_id: String,
        reason: String,
    },
    #[error("decrypting data key with key encryption key id '{key_encryption_key_id}' failed, dks_correlation_id: '{correlation_id}', data key service returned status code {status}")]
    DecryptionFailed {
        key_encryption_key_id: String,
        correlation_id: String,
        status: u16,
    },
}

impl KeyServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeyServiceError::Unavailable { .. })
    }
}

impl<T> From<Result<T, KeyServiceError>> for Attempt<T, KeyServiceError> {
    fn from(result: Result<T, KeyServiceError>) -> Self {
        match result {
            Ok(value) => Attempt::Success(value),
            Err(error) if error.is_retryable() => Attempt::Retryable(error),
            Err(error) => Attempt::Fatal(error),
        }
    }
}

#[async_trait]
pub trait KeyService {
    /// Request a fresh data key.
    async fn issue_data_key(&self) -> Result<DataKeyResult, KeyServiceError>;
    /// Exchange an encrypted data key for its plaintext.
    async fn decrypt_key(
        &self,
        key_encryption_key_id: &str,
        encrypted_key: &str,
    ) -> Result<String, KeyServiceError>;
    /// Forget every previously decrypted key.
    fn clear_cache(&self);
}

/// Decrypted data keys, keyed by the encrypted key and the id of the key that encrypted it.
/// Entries live until `clear` is called.
#[derive(Clone, Default)]
pub struct DecryptedKeyCache {
    keys: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl DecryptedKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, encrypted_key: &str, key_encryption_key_id: &str) -> Option<String> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(encrypted_key.to_owned(), key_encryption_key_id.to_owned()))
            .cloned()
    }

    pub fn put(&self, encrypted_key: &str, key_encryption_key_id: &str, plaintext_key: &str) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (encrypted_key.to_owned(), key_encryption_key_id.to_owned()),
                plaintext_key.to_owned(),
            );
    }

    pub fn clear(&self) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// PEM encoded certificate and PKCS#8 private key presented to the data key service.
#[derive(Debug)]
pub struct TlsIdentity {
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

/// Build the HTTP client used to talk to the data key service.
///
/// # Arguments
///
/// * `request_timeout`: Applied both to connecting and to the whole request.
/// * `identity`: Client identity for mutual TLS, if the service requires one.
/// * `trusted_certificate`: An additional PEM root certificate to trust.
pub fn build_http_client(
    request_timeout: time::Duration,
    identity: Option<&TlsIdentity>,
    trusted_certificate: Option<&[u8]>,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .user_agent("Historic Data Loader")
        .connect_timeout(request_timeout)
        .timeout(request_timeout);

    if let Some(identity) = identity {
        builder = builder.identity(reqwest::Identity::from_pkcs8_pem(
            &identity.certificate,
            &identity.private_key,
        )?);
    }

    if let Some(certificate) = trusted_certificate {
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(certificate)?);
    }

    builder.build()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecryptedKey {
    plaintext_data_key: String,
}

/// A `KeyService` backed by the HTTP data key service.
pub struct HttpKeyService {
    client: reqwest::Client,
    base_url: String,
    cache: DecryptedKeyCache,
}

impl HttpKeyService {
    pub fn new(client: reqwest::Client, base_url: &str, cache: DecryptedKeyCache) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            cache,
        }
    }

    pub fn cache(&self) -> &DecryptedKeyCache {
        &self.cache
    }
}

#[async_trait]
impl KeyService for HttpKeyService {
    async fn issue_data_key(&self) -> Result<DataKeyResult, KeyServiceError> {
        let correlation_id = Uuid::new_v4().to_string();
        let url = format!("{}/datakey", self.base_url);
        let unavailable = |reason: String| KeyServiceError::Unavailable {
            operation: ISSUE_DATA_KEY,
            correlation_id: correlation_id.clone(),
            reason,
        };

        info!(dks_url = %url, dks_correlation_id = %correlation_id, "calling issue_data_key");

        let response = self
            .client
            .get(&url)
            .query(&[("correlationId", &correlation_id)])
            .send()
            .await
            .map_err(|error| unavailable(format!("error contacting data key service: {}", error)))?;

        let status = response.status();
        info!(
            dks_url = %url,
            dks_correlation_id = %correlation_id,
            status_code = status.as_u16(),
            "called issue_data_key"
        );

        if status != StatusCode::CREATED {
            return Err(unavailable(format!(
                "data key service returned status code {}",
                status.as_u16()
            )));
        }

        response
            .json::<DataKeyResult>()
            .await
            .map_err(|error| unavailable(format!("invalid data key service response: {}", error)))
    }

    async fn decrypt_key(
        &self,
        key_encryption_key_id: &str,
        encrypted_key: &str,
    ) -> Result<String, KeyServiceError> {
        if let Some(plaintext_key) = self.cache.get(encrypted_key, key_encryption_key_id) {
            return Ok(plaintext_key);
        }

        let correlation_id = Uuid::new_v4().to_string();
        let url = format!("{}/datakey/actions/decrypt", self.base_url);
        let unavailable = |reason: String| KeyServiceError::Unavailable {
            operation: DECRYPT_KEY,
            correlation_id: correlation_id.clone(),
            reason,
        };

        info!(
            dks_url = %url,
            dks_correlation_id = %correlation_id,
            key_encryption_key_id,
            "calling decrypt_key"
        );

        let response = self
            .client
            .post(&url)
            .query(&[
                ("keyId", key_encryption_key_id),
                ("correlationId", correlation_id.as_str()),
            ])
            .header(header::CONTENT_TYPE, "text/plain")
            .body(encrypted_key.to_owned())
            .send()
            .await
            .map_err(|error| unavailable(format!("error contacting data key service: {}", error)))?;

        let status = response.status();
        info!(
            dks_url = %url,
            dks_correlation_id = %correlation_id,
            status_code = status.as_u16(),
            "called decrypt_key"
        );

        match status {
            StatusCode::OK => {
                let decrypted = response.json::<DecryptedKey>().await.map_err(|error| {
                    unavailable(format!("invalid data key service response: {}", error))
                })?;

                self.cache.put(
                    encrypted_key,
                    key_encryption_key_id,
                    &decrypted.plaintext_data_key,
                );

                Ok(decrypted.plaintext_data_key)
            }
            StatusCode::BAD_REQUEST => Err(KeyServiceError::DecryptionFailed {
                key_encryption_key_id: key_encryption_key_id.to_owned(),
                correlation_id: correlation_id.clone(),
                status: status.as_u16(),
            }),
            other => Err(unavailable(format!(
                "data key service returned status code {}",
                other.as_u16()
            ))),
        }
    }

    fn clear_cache(&self) {
        self.cache.clear();
    }
}

/// Wraps a `KeyService`, retrying calls that fail because the service is unavailable.
/// Permanent failures are returned immediately.
#[derive(Clone)]
pub struct RetryingKeyService {
    key_service: Arc<dyn KeyService + Send + Sync>,
    retry_policy: RetryPolicy,
}

impl RetryingKeyService {
    pub fn new(key_service: Arc<dyn KeyService + Send + Sync>, retry_policy: RetryPolicy) -> Self {
        Self {
            key_service,
            retry_policy,
        }
    }
}

#[async_trait]
impl KeyService for RetryingKeyService {
    async fn issue_data_key(&self) -> Result<DataKeyResult, KeyServiceError> {
        self.retry_policy
            .run(ISSUE_DATA_KEY, || async {
                Attempt::from(self.key_service.issue_data_key().await)
            })
            .await
    }

    async fn decrypt_key(
        &self,
        key_encryption_key_id: &str,
        encrypted_key: &str,
    ) -> Result<String, KeyServiceError> {
        self.retry_policy
            .run(DECRYPT_KEY, || async {
                Attempt::from(
                    self.key_service
                        .decrypt_key(key_encryption_key_id, encrypted_key)
                        .await,
                )
            })
            .await
    }

    fn clear_cache(&self) {
        self.key_service.clear_cache();
    }
}
