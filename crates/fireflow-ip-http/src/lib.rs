// # HTTP Address Source
//
// Resolves the operator's public IPv4 address by fetching plain text from an
// IP-echo endpoint (e.g. https://4.ipw.cn) and running it through the core
// address validator.
//
// ## Behaviour
//
// - One GET per resolution; no caching, no retries, no background polling
// - Transport failures and non-2xx answers → `Error::AddressUnavailable`
// - Anything that is not a bare dotted quad → `Error::AddressInvalid`
// - Bodies are read chunk by chunk and abandoned past `MAX_BODY_BYTES`
//
// The engine wraps every call in its own timeout as well; the client timeout
// here only keeps a stuck connection from outliving the pass.

use async_trait::async_trait;
use fireflow_core::config::FireflowConfig;
use fireflow_core::traits::{AddressSource, validate_address};
use fireflow_core::{Error, Result};

use std::net::Ipv4Addr;
use std::time::Duration;

/// Largest body read from an IP-echo endpoint
///
/// Generous against whitespace padding; a real answer is at most a few
/// dozen bytes.
pub const MAX_BODY_BYTES: usize = 1024;

/// Address source backed by an HTTP IP-echo endpoint
#[derive(Debug, Clone)]
pub struct HttpAddressSource {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpAddressSource {
    /// Create a source whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fireflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    /// Create a source bounded by the engine's call timeout
    pub fn from_config(config: &FireflowConfig) -> Result<Self> {
        Self::new(config.engine.call_timeout())
    }

    /// Configured request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch(&self, source_url: &str) -> Result<String> {
        let mut response = self
            .client
            .get(source_url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::address_unavailable(format!(
                        "{} did not answer within {:?}",
                        source_url, self.timeout
                    ))
                } else {
                    Error::address_unavailable(format!("request to {} failed: {}", source_url, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::address_unavailable(format!(
                "{} answered HTTP {}",
                source_url, status
            )));
        }

        if let Some(length) = response.content_length()
            && length > MAX_BODY_BYTES as u64
        {
            return Err(Error::address_invalid(format!(
                "{} sent a {} byte body",
                source_url, length
            )));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            Error::address_unavailable(format!("failed to read response from {}: {}", source_url, e))
        })? {
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                return Err(Error::address_invalid(format!(
                    "{} sent more than {} bytes",
                    source_url, MAX_BODY_BYTES
                )));
            }
            body.extend_from_slice(&chunk);
        }

        String::from_utf8(body)
            .map_err(|_| Error::address_invalid(format!("{} sent a non-UTF-8 body", source_url)))
    }
}

#[async_trait]
impl AddressSource for HttpAddressSource {
    async fn resolve(&self, source_url: &str) -> Result<Ipv4Addr> {
        if source_url.trim().is_empty() {
            return Err(Error::address_unavailable("no address source URL configured"));
        }

        let body = self.fetch(source_url).await?;
        let address = validate_address(&body).inspect_err(|e| {
            tracing::warn!("Address source {} returned an unusable answer: {}", source_url, e);
        })?;

        tracing::debug!("Resolved public address {} from {}", address, source_url);
        Ok(address)
    }

    fn source_name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_reports_its_timeout() {
        let source = HttpAddressSource::new(Duration::from_secs(3)).unwrap();
        assert_eq!(source.timeout(), Duration::from_secs(3));
        assert_eq!(source.source_name(), "http");
    }

    #[test]
    fn from_config_uses_call_timeout() {
        let mut config = FireflowConfig::default();
        config.engine.call_timeout_secs = 7;
        let source = HttpAddressSource::from_config(&config).unwrap();
        assert_eq!(source.timeout(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn empty_url_is_unavailable() {
        let source = HttpAddressSource::new(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            source.resolve("  ").await,
            Err(Error::AddressUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        let source = HttpAddressSource::new(Duration::from_secs(2)).unwrap();
        // Port 9 on localhost: nothing listens there in CI
        let result = source.resolve("http://127.0.0.1:9/").await;
        assert!(matches!(result, Err(Error::AddressUnavailable(_))));
    }
}
