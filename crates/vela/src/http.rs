use std::sync::OnceLock;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::Client;
use reqwest::header::{HeaderMap, RANGE};
use tracing::{debug, trace};
use url::Url;

use crate::config::HttpConfig;
use crate::error::AdapterError;

/// Installs the process-wide rustls crypto provider exactly once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate may have installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the HTTP client shared by every adapter of an engine.
pub fn create_client(config: &HttpConfig) -> Result<Client, reqwest::Error> {
    install_rustls_provider();

    let mut builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(reqwest::redirect::Policy::limited(10));

    if !config.timeout.is_zero() {
        builder = builder.timeout(config.timeout);
    }
    if !config.connect_timeout.is_zero() {
        builder = builder.connect_timeout(config.connect_timeout);
    }

    builder.build()
}

/// A byte range within a resource, as in `EXT-X-BYTERANGE` or DASH `indexRange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    /// Value for an HTTP `Range` header. Ranges are inclusive.
    pub fn header_value(&self) -> String {
        let end = self.offset + self.length.saturating_sub(1);
        format!("bytes={}-{}", self.offset, end)
    }
}

/// A fetched body with the time it took to download.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub data: Bytes,
    pub elapsed: Duration,
}

/// GET `url`, failing on any non-success status.
pub async fn fetch(
    client: &Client,
    url: &Url,
    headers: &HeaderMap,
    range: Option<ByteRange>,
) -> Result<Fetched, AdapterError> {
    let started = Instant::now();
    let mut request = client.get(url.clone()).headers(headers.clone());
    if let Some(range) = range {
        request = request.header(RANGE, range.header_value());
    }

    let response = request
        .send()
        .await
        .map_err(|e| AdapterError::from_reqwest(e, url))?;
    let status = response.status();
    if !status.is_success() {
        return Err(AdapterError::http_status(status, url.as_str()));
    }

    let data = response
        .bytes()
        .await
        .map_err(|e| AdapterError::from_reqwest(e, url))?;
    let elapsed = started.elapsed();
    trace!(%url, bytes = data.len(), elapsed_ms = elapsed.as_millis() as u64, "Fetched");
    Ok(Fetched { data, elapsed })
}

/// GET `url` as UTF-8 text, for manifests.
pub async fn fetch_text(
    client: &Client,
    url: &Url,
    headers: &HeaderMap,
) -> Result<(String, Fetched), AdapterError> {
    let fetched = fetch(client, url, headers, None).await?;
    let text = String::from_utf8(fetched.data.to_vec())
        .map_err(|_| AdapterError::manifest(format!("manifest at {url} is not valid UTF-8")))?;
    Ok((text, fetched))
}
