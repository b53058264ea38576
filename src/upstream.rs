//! Upstream HTTP access.
//!
//! All requests to origin servers go through here so the status gate
//! (200/206 only) and error classification are applied in one place.
//! Manifest fetches get [`fetch_with_retry`]; byte streams are opened once
//! with [`open_stream`] because a retried range request could splice two
//! different upstream bodies together.

use crate::error::{ProxyError, Result};
use crate::url_validation::SourceUrl;
use reqwest::header::{HeaderValue, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of manifest fetch attempts (1 initial + 1 retry).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Default backoff between attempts in milliseconds.
pub const DEFAULT_BACKOFF_MS: u64 = 250;

/// Configuration for [`fetch_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (minimum 1; 0 is treated as 1).
    pub max_attempts: u32,
    /// Sleep duration between consecutive attempts.
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
        }
    }
}

/// Upstream statuses the proxy is willing to serve from.
pub fn is_passthrough_status(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT
}

fn gate_status(response: Response) -> Result<Response> {
    let status = response.status();
    if is_passthrough_status(status) {
        Ok(response)
    } else {
        Err(ProxyError::UpstreamStatus(status.as_u16()))
    }
}

/// Failures worth a second attempt: connection-level errors and 5xx.
/// A 4xx will not change on retry and a timeout already cost the full budget.
fn is_retryable(err: &ProxyError) -> bool {
    match err {
        ProxyError::UpstreamUnreachable(_) => true,
        ProxyError::UpstreamStatus(code) => *code >= 500,
        _ => false,
    }
}

/// GET a URL with retry and backoff, returning a 200/206 response.
///
/// # Errors
///
/// Returns the last classified error once all attempts are exhausted.
pub async fn fetch_with_retry(
    client: &Client,
    url: &SourceUrl,
    config: &RetryConfig,
) -> Result<Response> {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = match client.get(url.as_url().clone()).send().await {
            Ok(response) => gate_status(response),
            Err(e) => Err(ProxyError::from(e)),
        };

        match result {
            Ok(response) => return Ok(response),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                warn!(
                    "Upstream fetch failed for {} (attempt {}/{}): {}; retrying in {}ms",
                    url,
                    attempt,
                    max_attempts,
                    e,
                    config.backoff.as_millis()
                );
                tokio::time::sleep(config.backoff).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(
                    "Upstream fetch failed for {} (attempt {}/{}): {}",
                    url, attempt, max_attempts, e
                );
                return Err(e);
            }
        }
    }
}

/// Open a streaming GET against the upstream, optionally forwarding `Range`.
///
/// Only the response headers have been read when this returns; the body is
/// still on the wire and is owned by the returned [`Response`].
pub async fn open_stream(
    client: &Client,
    url: &SourceUrl,
    range: Option<&HeaderValue>,
) -> Result<Response> {
    let mut request = client.get(url.as_url().clone());
    if let Some(range) = range {
        debug!("Forwarding Range {:?} to {}", range, url);
        request = request.header(RANGE, range.clone());
    }

    let response = request.send().await?;
    gate_status(response)
}

/// HEAD the upstream to learn type, size and range support.
pub async fn head(client: &Client, url: &SourceUrl) -> Result<Response> {
    let response = client.head(url.as_url().clone()).send().await?;
    gate_status(response)
}

/// Declared `Content-Length`, if present and numeric.
pub fn declared_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
