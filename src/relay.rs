//! Byte relay from an upstream response to the client.
//!
//! The upstream body is regrouped into fixed-size chunks and each chunk is
//! written as soon as it is full; the body is never held in memory as a
//! whole. A [`Transfer`] owns the upstream connection for the lifetime of the
//! response body, so the connection is released when the transfer ends,
//! fails, or the client goes away (axum drops the body stream).

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::metrics;
use crate::upstream::declared_length;
use crate::url_validation::SourceUrl;
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderValue, header},
    response::Response,
};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::io;
use tracing::{error, info, warn};

pub const DEFAULT_DIRECT_CONTENT_TYPE: &str = "application/octet-stream";
pub const DEFAULT_SEGMENT_CONTENT_TYPE: &str = "video/MP2T";
pub const DEFAULT_DOWNLOAD_CONTENT_TYPE: &str = "video/mp4";
pub const DEFAULT_DOWNLOAD_FILENAME: &str = "video.mp4";

const NO_CACHE: &str = "no-cache";

/// How one relayed response is framed for the client
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Short name used in logs and metrics ("direct", "segment", "download")
    pub label: &'static str,
    pub max_size: u64,
    pub chunk_size: usize,
    pub default_content_type: &'static str,
    pub cache_control: &'static str,
    /// Forward `Content-Range`/`Content-Disposition` and advertise byte serving
    pub range_passthrough: bool,
    /// Force `Content-Disposition: attachment` with this filename
    pub attachment: Option<String>,
}

impl RelayOptions {
    /// Direct single-file streams: range passthrough, not cached
    pub fn direct(config: &Config) -> Self {
        Self {
            label: "direct",
            max_size: config.max_file_size,
            chunk_size: config.chunk_size,
            default_content_type: DEFAULT_DIRECT_CONTENT_TYPE,
            cache_control: NO_CACHE,
            range_passthrough: true,
            attachment: None,
        }
    }

    /// HLS segments: range passthrough, cached for a year
    pub fn segment(config: &Config) -> Self {
        Self {
            label: "segment",
            default_content_type: DEFAULT_SEGMENT_CONTENT_TYPE,
            cache_control: crate::hls::rewriter::SEGMENT_CACHE_CONTROL,
            ..Self::direct(config)
        }
    }

    /// Full-body attachment download
    pub fn download(config: &Config, filename: String) -> Self {
        Self {
            label: "download",
            default_content_type: DEFAULT_DOWNLOAD_CONTENT_TYPE,
            range_passthrough: false,
            attachment: Some(filename),
            ..Self::direct(config)
        }
    }
}

/// Reject a response whose declared length exceeds `limit`.
///
/// Returns the declared length when there is one. Without a declared length
/// the ceiling is enforced while streaming instead.
pub fn enforce_size_ceiling(response: &reqwest::Response, limit: u64) -> Result<Option<u64>> {
    match declared_length(response) {
        Some(declared) if declared > limit => {
            warn!(
                "Upstream {} declares {} bytes, over the {} byte ceiling",
                response.url(),
                declared,
                limit
            );
            Err(ProxyError::ResourceTooLarge { declared, limit })
        }
        declared => Ok(declared),
    }
}

/// Build the client response for an upstream that already passed the
/// 200/206 gate. The upstream is dropped (connection closed) on error.
pub fn relay_response(upstream: reqwest::Response, options: RelayOptions) -> Result<Response> {
    enforce_size_ceiling(&upstream, options.max_size)?;

    let status = upstream.status();
    let upstream_headers = upstream.headers();
    let mut headers = HeaderMap::new();

    let content_type = upstream_headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(options.default_content_type));
    headers.insert(header::CONTENT_TYPE, content_type);

    if let Some(length) = upstream_headers.get(header::CONTENT_LENGTH) {
        headers.insert(header::CONTENT_LENGTH, length.clone());
    }

    if options.range_passthrough {
        for name in [header::CONTENT_RANGE, header::CONTENT_DISPOSITION] {
            if let Some(value) = upstream_headers.get(&name) {
                headers.insert(name, value.clone());
            }
        }
        // The proxy serves ranges whenever the upstream honours forwarded Range
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }

    if let Some(filename) = &options.attachment {
        let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
            .unwrap_or_else(|_| {
                HeaderValue::from_static("attachment; filename=\"video.mp4\"")
            });
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }

    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(options.cache_control),
    );

    info!(
        "Relaying {} from {} with status {}",
        options.label,
        upstream.url(),
        status
    );

    let transfer = Transfer::new(upstream, &options);
    let mut response = Response::new(Body::from_stream(transfer.into_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Per-request relay state. Owns the upstream body; dropping it closes the
/// upstream connection.
pub struct Transfer {
    label: &'static str,
    url: String,
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    upstream_done: bool,
    buffer: Vec<u8>,
    chunk_size: usize,
    limit: u64,
    received: u64,
    bytes_sent: u64,
    chunks_sent: u64,
    finished: bool,
}

impl Transfer {
    pub fn new(upstream: reqwest::Response, options: &RelayOptions) -> Self {
        let chunk_size = options.chunk_size.max(1);
        Self {
            label: options.label,
            url: upstream.url().to_string(),
            upstream: upstream.bytes_stream().boxed(),
            upstream_done: false,
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
            limit: options.max_size,
            received: 0,
            bytes_sent: 0,
            chunks_sent: 0,
            finished: false,
        }
    }

    /// Body stream yielding chunks in upstream order. Ends after the first
    /// error, which aborts the client connection.
    pub fn into_stream(self) -> impl futures_util::Stream<Item = io::Result<Bytes>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut transfer = state?;
            match transfer.next_chunk().await {
                Some(Ok(chunk)) => Some((Ok(chunk), Some(transfer))),
                Some(Err(e)) => Some((Err(e), None)),
                None => None,
            }
        })
    }

    async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        loop {
            if self.buffer.len() >= self.chunk_size {
                return Some(Ok(self.take(self.chunk_size)));
            }

            if self.upstream_done {
                if self.buffer.is_empty() {
                    self.finished = true;
                    return None;
                }
                let remaining = self.buffer.len();
                return Some(Ok(self.take(remaining)));
            }

            match self.upstream.next().await {
                Some(Ok(bytes)) => {
                    self.received += bytes.len() as u64;
                    if self.received > self.limit {
                        error!(
                            "Relay from {} passed the {} byte ceiling; aborting",
                            self.url, self.limit
                        );
                        return Some(Err(io::Error::other("size ceiling exceeded")));
                    }
                    self.buffer.extend_from_slice(&bytes);
                }
                Some(Err(e)) => {
                    error!(
                        "Upstream read failed for {} after {} bytes: {}",
                        self.url, self.received, e
                    );
                    return Some(Err(io::Error::other(e)));
                }
                None => self.upstream_done = true,
            }
        }
    }

    fn take(&mut self, len: usize) -> Bytes {
        let rest = self.buffer.split_off(len);
        let chunk = std::mem::replace(&mut self.buffer, rest);
        self.bytes_sent += chunk.len() as u64;
        self.chunks_sent += 1;
        Bytes::from(chunk)
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        metrics::record_relayed_bytes(self.label, self.bytes_sent);
        if self.finished {
            info!(
                "Relayed {} bytes in {} chunks from {}",
                self.bytes_sent, self.chunks_sent, self.url
            );
        } else {
            warn!(
                "Relay from {} ended early after {} bytes ({} chunks); upstream released",
                self.url, self.bytes_sent, self.chunks_sent
            );
        }
    }
}

/// Filename for a download: the URL's last path segment, or
/// [`DEFAULT_DOWNLOAD_FILENAME`] when that is empty or has no extension.
pub fn attachment_filename(url: &SourceUrl) -> String {
    let last = url
        .as_url()
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();

    let cleaned: String = last
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();

    if cleaned.is_empty() || !cleaned.contains('.') {
        DEFAULT_DOWNLOAD_FILENAME.to_string()
    } else {
        cleaned
    }
}
