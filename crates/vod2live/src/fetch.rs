// Manifest fetching: raw download of playlist documents with retry logic.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::FetchConfig;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },
    #[error("HTTP {status} fetching {uri}")]
    Status { status: u16, uri: String },
    #[error("max retries ({retries}) exceeded for {uri}: {reason}")]
    RetriesExhausted {
        retries: u32,
        uri: String,
        reason: String,
    },
}

/// Source of raw manifest documents. The engine only ever asks for whole
/// documents by URI; retries, proxies and caching live behind this seam.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<Bytes, FetchError>;
}

pub struct HttpManifestFetcher {
    http_client: Client,
    config: FetchConfig,
}

impl HttpManifestFetcher {
    pub fn new(http_client: Client, config: FetchConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    /// Fetches a manifest with retry logic.
    /// Retries on network errors and server errors (5xx).
    async fn fetch(&self, uri: &str) -> Result<Bytes, FetchError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .http_client
                .get(uri)
                .timeout(self.config.fetch_timeout)
                .send()
                .await
            {
                Ok(response) => {
                    if response.status().is_success() {
                        return response.bytes().await.map_err(FetchError::from);
                    } else if response.status().is_client_error() {
                        // Non-retryable client errors (4xx)
                        return Err(FetchError::Status {
                            status: response.status().as_u16(),
                            uri: uri.to_string(),
                        });
                    }
                    // Server errors (5xx) or other retryable issues
                    if attempts > self.config.max_retries {
                        return Err(FetchError::RetriesExhausted {
                            retries: self.config.max_retries,
                            uri: uri.to_string(),
                            reason: format!("last status {}", response.status()),
                        });
                    }
                    warn!(
                        "Retrying {uri} after HTTP {} (attempt {attempts})",
                        response.status()
                    );
                }
                Err(e) => {
                    if !e.is_connect() && !e.is_timeout() && !e.is_request() {
                        // Non-retryable network errors
                        return Err(FetchError::from(e));
                    }
                    if attempts > self.config.max_retries {
                        return Err(FetchError::RetriesExhausted {
                            retries: self.config.max_retries,
                            uri: uri.to_string(),
                            reason: e.to_string(),
                        });
                    }
                    warn!("Retrying {uri} after network error: {e} (attempt {attempts})");
                }
            }

            let delay = self.config.retry_delay_base * 2_u32.pow(attempts.saturating_sub(1));
            debug!("Backing off {delay:?} before attempt {}", attempts + 1);
            tokio::time::sleep(delay).await;
        }
    }
}
