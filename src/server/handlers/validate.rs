use crate::{
    error::{ProxyError, Result},
    hls::resolver::{AudioTrack, SubtitleTrack, Variant},
    probe::{AudioStreamInfo, VideoStreamInfo},
    server::{handlers::record, state::AppState},
    upstream::{declared_length, head},
    url_validation::{SourceUrl, is_manifest_url},
};
use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct ValidateParams {
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
struct HlsValidation {
    valid: bool,
    #[serde(rename = "type")]
    source_type: &'static str,
    is_master: bool,
    variants: Vec<Variant>,
    audio_tracks: Vec<AudioTrack>,
    subtitles: Vec<SubtitleTrack>,
}

#[derive(Debug, Serialize)]
struct DirectValidation {
    valid: bool,
    #[serde(rename = "type")]
    source_type: &'static str,
    content_type: String,
    content_length: Option<u64>,
    accept_ranges: String,
    supports_range: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_streams: Option<Vec<VideoStreamInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_streams: Option<Vec<AudioStreamInfo>>,
}

/// Check that a source is reachable and describe it.
///
/// Failures are reported in the body as `valid: false` with the status the
/// error maps to.
pub async fn validate_url(
    Query(params): Query<ValidateParams>,
    State(state): State<AppState>,
) -> Response {
    let start = Instant::now();

    let response = match validate(&state, params.url.as_deref()).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Validation failed: {}", e);
            (
                e.status(),
                Json(json!({
                    "valid": false,
                    "kind": e.kind(),
                    "error": e.to_string(),
                })),
            )
                .into_response()
        }
    };

    record("validate", start, response.status());
    response
}

async fn validate(state: &AppState, raw: Option<&str>) -> Result<Response> {
    let url = state.validate(raw)?;

    if is_manifest_url(&url) {
        validate_hls(state, &url).await
    } else {
        validate_direct(state, &url).await
    }
}

async fn validate_hls(state: &AppState, url: &SourceUrl) -> Result<Response> {
    let resolution = state.resolver.resolve(url).await?;
    info!(
        "Validated HLS source {} ({} variants)",
        url,
        resolution.variants.len()
    );

    Ok(Json(HlsValidation {
        valid: true,
        source_type: "hls",
        is_master: resolution.is_master(),
        variants: resolution.variants,
        audio_tracks: resolution.audio_tracks,
        subtitles: resolution.subtitle_tracks,
    })
    .into_response())
}

async fn validate_direct(state: &AppState, url: &SourceUrl) -> Result<Response> {
    let (content_type, accept_ranges, content_length) = {
        let response = head(&state.http_client, url).await?;
        let header_str = |name: header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        (
            header_str(header::CONTENT_TYPE).unwrap_or_else(|| "unknown".to_string()),
            header_str(header::ACCEPT_RANGES).unwrap_or_else(|| "none".to_string()),
            declared_length(&response),
        )
    };

    if let Some(length) = content_length
        && length > state.config.max_file_size
    {
        return Err(ProxyError::ResourceTooLarge {
            declared: length,
            limit: state.config.max_file_size,
        });
    }

    let report = state.probe.probe(url).await;
    let (video_streams, audio_streams) = match report {
        Some(report) => (
            Some(report.video_streams).filter(|s| !s.is_empty()),
            Some(report.audio_streams).filter(|s| !s.is_empty()),
        ),
        None => (None, None),
    };

    info!("Validated direct source {} ({})", url, content_type);

    Ok((
        StatusCode::OK,
        Json(DirectValidation {
            valid: true,
            source_type: "direct",
            supports_range: accept_ranges.eq_ignore_ascii_case("bytes"),
            content_type,
            content_length,
            accept_ranges,
            video_streams,
            audio_streams,
        }),
    )
        .into_response())
}
