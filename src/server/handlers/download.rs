use crate::{
    error::{ProxyError, Result},
    relay::{RelayOptions, attachment_filename, relay_response},
    server::{handlers::finish, state::AppState},
    upstream::open_stream,
    url_validation::is_manifest_url,
};
use axum::{
    extract::{Query, State},
    response::Response,
};
use serde::Deserialize;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    pub url: Option<String>,
}

/// Relay a single file as an attachment.
///
/// The whole body is always requested; client `Range` headers are ignored.
/// Manifests are rejected before anything is fetched.
pub async fn serve_download(
    Query(params): Query<DownloadParams>,
    State(state): State<AppState>,
) -> Result<Response> {
    let start = Instant::now();
    let result = download(&state, params.url.as_deref()).await;
    finish("download", start, result)
}

async fn download(state: &AppState, raw: Option<&str>) -> Result<Response> {
    let url = state.validate(raw)?;

    if is_manifest_url(&url) {
        return Err(ProxyError::UnsupportedOperation(
            "HLS streams cannot be downloaded as a single file; use an HLS downloader"
                .to_string(),
        ));
    }

    let filename = attachment_filename(&url);
    info!("Downloading {} as {}", url, filename);

    let upstream = open_stream(&state.http_client, &url, None).await?;
    relay_response(upstream, RelayOptions::download(&state.config, filename))
}
