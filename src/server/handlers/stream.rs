use crate::{
    error::Result,
    hls::{
        resolver::{parse_manifest, read_manifest_body},
        rewriter::{
            PLAYLIST_CACHE_CONTROL, PLAYLIST_CONTENT_TYPE, is_playlist_response,
            rewrite_media_playlist,
        },
    },
    relay::{RelayOptions, relay_response},
    server::{handlers::finish, state::AppState},
    upstream::open_stream,
    url_validation::{SourceUrl, is_manifest_url},
};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub url: Option<String>,
    /// Exact variant bandwidth to select from a master playlist
    pub quality: Option<String>,
    /// Set on rewritten playlist URIs
    #[serde(default)]
    pub hls: bool,
}

/// Stream a source through the proxy.
///
/// Manifest URLs (and anything marked `hls=true`) go through playlist
/// rewriting; everything else is relayed byte-for-byte with the client's
/// `Range` forwarded upstream.
pub async fn serve_stream(
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();
    let result = stream(&state, &params, headers.get(header::RANGE)).await;
    finish("stream", start, result)
}

async fn stream(
    state: &AppState,
    params: &StreamParams,
    range: Option<&HeaderValue>,
) -> Result<Response> {
    let url = state.validate(params.url.as_deref())?;

    if params.hls || is_manifest_url(&url) {
        return serve_hls(state, &url, params.quality.as_deref(), range).await;
    }

    info!("Streaming {} (range: {:?})", url, range);
    let upstream = open_stream(&state.http_client, &url, range).await?;
    relay_response(upstream, RelayOptions::direct(&state.config))
}

/// Playlist or HLS segment.
///
/// URLs that name a manifest are fetched whole through the resolver (with
/// retry, never ranged). Anything else is opened once with the client's
/// `Range` and classified by its response.
async fn serve_hls(
    state: &AppState,
    url: &SourceUrl,
    quality: Option<&str>,
    range: Option<&HeaderValue>,
) -> Result<Response> {
    let document = if is_manifest_url(url) {
        state.resolver.fetch_document(url).await?
    } else {
        let upstream = open_stream(&state.http_client, url, range).await?;

        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        if !is_playlist_response(content_type.as_deref(), url) {
            debug!("Relaying HLS segment {}", url);
            return relay_response(upstream, RelayOptions::segment(&state.config));
        }

        if range.is_some() {
            // A ranged playlist body is only a slice; fetch it whole
            drop(upstream);
            state.resolver.fetch_document(url).await?
        } else {
            let body = read_manifest_body(upstream, state.config.max_manifest_bytes).await?;
            parse_manifest(url, body)?
        }
    };

    let media = if document.resolution.is_master() {
        state.resolver.resolve_variant(&document.resolution, quality).await?
    } else {
        document
    };

    let playlist = rewrite_media_playlist(&media.body, &media.resolution.original_url)?;
    info!(
        "Serving rewritten playlist {} for {}",
        media.resolution.original_url, url
    );

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE),
            (header::CACHE_CONTROL, PLAYLIST_CACHE_CONTROL),
        ],
        playlist,
    )
        .into_response())
}
