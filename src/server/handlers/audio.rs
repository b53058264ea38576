use crate::{
    error::{ProxyError, Result},
    hls::resolver::find_audio_variant,
    server::{handlers::finish, state::AppState},
};
use axum::{
    Json,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct AudioVariantParams {
    pub url: Option<String>,
    /// Audio group ID, language or track name
    pub audio: Option<String>,
}

/// Find the variant of a master playlist that plays with the requested audio.
///
/// When nothing matches, the highest-bandwidth variant is returned with
/// `exact_match: false`.
pub async fn audio_variant(
    Query(params): Query<AudioVariantParams>,
    State(state): State<AppState>,
) -> Result<Response> {
    let start = Instant::now();
    let result = lookup(&state, &params).await;
    finish("audio_variant", start, result)
}

async fn lookup(state: &AppState, params: &AudioVariantParams) -> Result<Response> {
    let url = state.validate(params.url.as_deref())?;
    let audio = params
        .audio
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| ProxyError::InvalidInput("Missing audio parameter".to_string()))?;

    let resolution = state.resolver.resolve(&url).await?;
    let found = find_audio_variant(&resolution, audio).ok_or_else(|| {
        ProxyError::InvalidInput(format!("{url} has no variant streams"))
    })?;

    if found.exact {
        info!("Audio '{}' maps to variant {}", audio, found.variant.url);
    } else {
        info!(
            "No variant for audio '{}' in {}, falling back to {}",
            audio, url, found.variant.url
        );
    }

    Ok(Json(json!({
        "url": found.variant.url,
        "bandwidth": found.variant.bandwidth,
        "resolution": found.variant.resolution,
        "audio_group": found.variant.audio_group,
        "exact_match": found.exact,
    }))
    .into_response())
}
