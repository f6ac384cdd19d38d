//! Load encrypted mongo dump files as encrypted, enveloped records.
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use loader_common::cipher::CipherEngine;
use loader_common::keyservice::{
    build_http_client, DecryptedKeyCache, HttpKeyService, KeyService, RetryingKeyService,
};
use loader_common::metrics::{serve, setup_metrics_router};
use loader_common::retry::RetryPolicy;
use loader_worker::config::Config;
use loader_worker::envelope::MessageEnvelopeBuilder;
use loader_worker::filter::FilterPolicy;
use loader_worker::loader::{list_input_files, Loader};
use loader_worker::mapper::RecordMapper;
use loader_worker::sink::{JsonlFileSink, PrintSink, RecordSink};
use loader_worker::time::SystemTime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;

    if let Some(bind) = config.metrics_bind.clone() {
        let router = setup_metrics_router().context("failed to install metrics recorder")?;
        tokio::task::spawn(async move {
            if let Err(error) = serve(router, &bind).await {
                error!("failed to serve metrics on {}: {}", bind, error);
            }
        });
    }

    let identity = config
        .tls_identity()
        .context("failed to read data key service client identity")?;
    let trusted = config
        .trust_certificate()
        .context("failed to read data key service trust certificate")?;
    let client = build_http_client(
        config.dks_request_timeout.0,
        identity.as_ref(),
        trusted.as_deref(),
    )
    .context("failed to construct data key service client")?;

    let key_service: Arc<dyn KeyService + Send + Sync> = Arc::new(RetryingKeyService::new(
        Arc::new(HttpKeyService::new(
            client,
            &config.data_key_service_url,
            DecryptedKeyCache::new(),
        )),
        RetryPolicy::from(&config.retry_policy),
    ));

    let filter = FilterPolicy::from_bounds(
        config.filter_earlier_than.as_deref(),
        config.filter_later_than.as_deref(),
    )
    .context("invalid filter bounds")?;

    let mapper = RecordMapper::initialize(
        key_service.as_ref(),
        CipherEngine::new(),
        filter,
        MessageEnvelopeBuilder::new(
            Path::new(&config.correlation_id_file),
            Box::new(SystemTime {}),
        ),
    )
    .await
    .context("failed to obtain a data key")?;

    let sink: Arc<dyn RecordSink + Send + Sync> = match &config.output_file {
        Some(path) => Arc::new(JsonlFileSink::create(Path::new(path))?),
        None => Arc::new(PrintSink {}),
    };

    let files = list_input_files(Path::new(&config.input_directory))?;
    info!(
        directory = %config.input_directory,
        files = files.len(),
        "found dump files"
    );

    let loader = Loader::new(
        key_service,
        Arc::new(mapper),
        sink,
        config.max_concurrent_files,
    );
    let summary = loader.run(files).await?;

    if summary.failed > 0 {
        error!(failed = summary.failed, "some records could not be mapped");
    }

    Ok(())
}
