pub mod audio;
pub mod download;
pub mod health;
pub mod stream;
pub mod validate;

use crate::{error::Result, metrics};
use axum::{http::StatusCode, response::Response};
use std::time::Instant;

/// Record request metrics for a finished handler and pass the result through.
pub(crate) fn finish(
    endpoint: &'static str,
    start: Instant,
    result: Result<Response>,
) -> Result<Response> {
    let status = match &result {
        Ok(response) => response.status(),
        Err(e) => {
            if e.is_upstream() {
                metrics::record_upstream_error(e.kind());
            }
            e.status()
        }
    };
    record(endpoint, start, status);
    result
}

pub(crate) fn record(endpoint: &'static str, start: Instant, status: StatusCode) {
    metrics::record_request(endpoint, status.as_u16());
    metrics::record_duration(endpoint, start);
}
