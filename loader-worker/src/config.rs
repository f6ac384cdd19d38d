use std::fs;
use std::io;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use loader_common::keyservice::TlsIdentity;
use loader_common::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "http://localhost:8090")]
    pub data_key_service_url: String,

    /// PEM certificate presented to the data key service.
    pub dks_identity_cert: Option<String>,

    /// PKCS#8 PEM private key matching `dks_identity_cert`.
    pub dks_identity_key: Option<String>,

    /// PEM certificate of a CA to trust in addition to the system roots.
    pub dks_trust_cert: Option<String>,

    #[envconfig(from = "DKS_REQUEST_TIMEOUT", default = "5000")]
    pub dks_request_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    pub filter_earlier_than: Option<String>,

    pub filter_later_than: Option<String>,

    #[envconfig(default = "/opt/emr/correlation_id.txt")]
    pub correlation_id_file: String,

    #[envconfig(default = "./data")]
    pub input_directory: String,

    /// Records are logged rather than written when unset.
    pub output_file: Option<String>,

    #[envconfig(default = "4")]
    pub max_concurrent_files: usize,

    /// Serve prometheus metrics on this address, for example `0.0.0.0:9090`.
    pub metrics_bind: Option<String>,
}

impl Config {
    /// Read the client certificate and key used for mutual TLS, if configured.
    pub fn tls_identity(&self) -> io::Result<Option<TlsIdentity>> {
        match (&self.dks_identity_cert, &self.dks_identity_key) {
            (Some(certificate), Some(private_key)) => Ok(Some(TlsIdentity {
                certificate: fs::read(certificate)?,
                private_key: fs::read(private_key)?,
            })),
            (None, None) => Ok(None),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "DKS_IDENTITY_CERT and DKS_IDENTITY_KEY must be set together",
            )),
        }
    }

    pub fn trust_certificate(&self) -> io::Result<Option<Vec<u8>>> {
        self.dks_trust_cert.as_ref().map(fs::read).transpose()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "RETRY_MAX_ATTEMPTS", default = "5")]
    pub max_attempts: u32,

    #[envconfig(from = "RETRY_INITIAL_BACKOFF", default = "1000")]
    pub initial_backoff: EnvMsDuration,

    #[envconfig(from = "RETRY_BACKOFF_MULTIPLIER", default = "2")]
    pub backoff_multiplier: u32,
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        RetryPolicy::new(
            config.max_attempts,
            config.initial_backoff.0,
            config.backoff_multiplier,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.data_key_service_url, "http://localhost:8090");
        assert_eq!(config.dks_request_timeout.0, time::Duration::from_millis(5000));
        assert_eq!(config.retry_policy.max_attempts, 5);
        assert_eq!(
            config.retry_policy.initial_backoff.0,
            time::Duration::from_secs(1)
        );
        assert_eq!(config.retry_policy.backoff_multiplier, 2);
        assert_eq!(config.correlation_id_file, "/opt/emr/correlation_id.txt");
        assert_eq!(config.max_concurrent_files, 4);
        assert!(config.filter_earlier_than.is_none());
        assert!(config.output_file.is_none());
        assert!(config.tls_identity().unwrap().is_none());
        assert!(config.trust_certificate().unwrap().is_none());
    }

    #[test]
    fn test_overrides() {
        let vars = HashMap::from([
            ("DATA_KEY_SERVICE_URL".to_owned(), "https://dks:8443".to_owned()),
            ("RETRY_MAX_ATTEMPTS".to_owned(), "3".to_owned()),
            ("RETRY_INITIAL_BACKOFF".to_owned(), "10".to_owned()),
            ("FILTER_EARLIER_THAN".to_owned(), "2020-01-01T00:00:00.000".to_owned()),
        ]);
        let config = Config::init_from_hashmap(&vars).unwrap();

        assert_eq!(config.data_key_service_url, "https://dks:8443");
        assert_eq!(
            config.filter_earlier_than.as_deref(),
            Some("2020-01-01T00:00:00.000")
        );

        let policy = RetryPolicy::from(&config.retry_policy);
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.time_until_next_retry(0), time::Duration::from_millis(10));
    }

    #[test]
    fn test_invalid_duration() {
        let vars = HashMap::from([("DKS_REQUEST_TIMEOUT".to_owned(), "soon".to_owned())]);
        assert!(Config::init_from_hashmap(&vars).is_err());
    }

    #[test]
    fn test_identity_requires_both_halves() {
        let vars = HashMap::from([("DKS_IDENTITY_CERT".to_owned(), "/cert.pem".to_owned())]);
        let config = Config::init_from_hashmap(&vars).unwrap();
        assert_eq!(
            config.tls_identity().unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }
}
