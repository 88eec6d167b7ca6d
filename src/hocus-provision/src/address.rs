//! Public address resolution.
//!
//! Ordered fallback chain: explicit override → cloud instance metadata →
//! public IP echo. The resolved address becomes the server certificate's
//! SAN, so exhausting the chain is fatal for the whole run.

use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const GCE_METADATA_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/network-interfaces/0/access-configs/0/external-ip";
const IP_ECHO_URL: &str = "https://api.ipify.org";

/// Address resolution failure: every source in the chain failed.
#[derive(Debug, Error)]
#[error("no address source succeeded (metadata: {metadata}; echo: {echo})")]
pub struct AddressError {
    pub metadata: String,
    pub echo: String,
}

/// Resolver configuration.
#[derive(Debug, Clone)]
pub struct AddressResolverConfig {
    /// Explicit address, skips all network lookups when set
    pub override_addr: Option<IpAddr>,
    pub metadata_url: String,
    pub echo_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for AddressResolverConfig {
    fn default() -> Self {
        Self {
            override_addr: None,
            metadata_url: GCE_METADATA_URL.to_string(),
            echo_url: IP_ECHO_URL.to_string(),
            timeout: Duration::from_secs(5),
            max_retries: 2,
        }
    }
}

/// Resolves the server's public address once per run.
pub struct AddressResolver {
    config: AddressResolverConfig,
    client: reqwest::Client,
}

impl AddressResolver {
    pub fn new(config: AddressResolverConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    /// Walk the chain, first hit wins.
    pub async fn resolve(&self) -> Result<IpAddr, AddressError> {
        if let Some(addr) = self.config.override_addr {
            info!(%addr, "using configured public address override");
            return Ok(addr);
        }

        let metadata_err = match self.fetch_metadata().await {
            Ok(addr) => {
                info!(%addr, "resolved public address via instance metadata");
                return Ok(addr);
            }
            Err(e) => {
                warn!(url = %self.config.metadata_url, error = %e, "metadata lookup failed");
                e
            }
        };

        let echo_err = match self.fetch_echo().await {
            Ok(addr) => {
                info!(%addr, "resolved public address via IP echo");
                return Ok(addr);
            }
            Err(e) => {
                warn!(url = %self.config.echo_url, error = %e, "IP echo lookup failed");
                e
            }
        };

        Err(AddressError {
            metadata: metadata_err,
            echo: echo_err,
        })
    }

    async fn fetch_metadata(&self) -> Result<IpAddr, String> {
        self.fetch_with_retries(&self.config.metadata_url, true).await
    }

    async fn fetch_echo(&self) -> Result<IpAddr, String> {
        self.fetch_with_retries(&self.config.echo_url, false).await
    }

    async fn fetch_with_retries(&self, url: &str, metadata: bool) -> Result<IpAddr, String> {
        let mut last_err = String::from("no attempts made");
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
            match self.fetch_once(url, metadata).await {
                Ok(addr) => return Ok(addr),
                Err(e) => {
                    debug!(url, attempt, error = %e, "address lookup attempt failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn fetch_once(&self, url: &str, metadata: bool) -> Result<IpAddr, String> {
        let mut request = self.client.get(url);
        if metadata {
            request = request.header("Metadata-Flavor", "Google");
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        let body = response.text().await.map_err(|e| e.to_string())?;
        body.trim()
            .parse()
            .map_err(|_| format!("response is not an address: {:?}", body.trim()))
    }
}
