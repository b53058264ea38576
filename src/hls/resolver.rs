//! HLS manifest resolution.
//!
//! Turns a manifest URL into a [`ManifestResolution`]: variants (sorted,
//! highest bandwidth first), audio tracks and subtitle tracks, with every
//! URI resolved to an absolute [`SourceUrl`]. Nothing is cached; each call
//! goes back to the origin.

use crate::error::{ProxyError, Result};
use crate::upstream::{RetryConfig, declared_length, fetch_with_retry};
use crate::url_validation::{SourceUrl, check_origin_policy};
use futures_util::StreamExt;
use m3u8_rs::{AlternativeMediaType, MasterPlaylist, Playlist, parse_playlist_res};
use reqwest::{Client, Response};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    /// Enumerates at least one variant stream
    Master,
    /// Enumerates segments directly
    Media,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u64,
    pub height: u64,
}

/// One quality option from a master playlist
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variant {
    pub url: SourceUrl,
    pub bandwidth: u64,
    pub resolution: Option<Resolution>,
    /// `AUDIO` group this variant plays with, linking it to [`AudioTrack::group_id`]
    pub audio_group: Option<String>,
    pub codecs: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioTrack {
    pub language: Option<String>,
    pub name: String,
    /// `None` when the audio is muxed into the video segments
    pub url: Option<SourceUrl>,
    pub group_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtitleTrack {
    pub language: Option<String>,
    pub name: String,
    pub url: Option<SourceUrl>,
}

/// Everything learned from one manifest fetch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestResolution {
    pub kind: ManifestKind,
    pub variants: Vec<Variant>,
    pub audio_tracks: Vec<AudioTrack>,
    pub subtitle_tracks: Vec<SubtitleTrack>,
    pub original_url: SourceUrl,
}

impl ManifestResolution {
    pub fn is_master(&self) -> bool {
        self.kind == ManifestKind::Master
    }
}

/// A resolution together with the raw manifest text it came from
#[derive(Debug, Clone)]
pub struct ManifestDocument {
    pub resolution: ManifestResolution,
    pub body: String,
}

/// Result of an audio-group lookup; `exact` is false when variant 0 was
/// substituted because no variant references the requested group.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioVariantMatch<'a> {
    pub variant: &'a Variant,
    pub exact: bool,
}

/// Fetches and parses manifests against the shared upstream client
#[derive(Clone, Debug)]
pub struct ManifestResolver {
    client: Client,
    retry: RetryConfig,
    max_manifest_bytes: usize,
    /// Apply the private-address check to variant URLs taken from a master
    enforce_origin_policy: bool,
}

impl ManifestResolver {
    pub fn new(client: Client, retry: RetryConfig, max_manifest_bytes: usize) -> Self {
        Self {
            client,
            retry,
            max_manifest_bytes,
            enforce_origin_policy: false,
        }
    }

    pub fn with_origin_policy(mut self, enforce: bool) -> Self {
        self.enforce_origin_policy = enforce;
        self
    }

    /// Fetch and classify the manifest at `url`.
    pub async fn resolve(&self, url: &SourceUrl) -> Result<ManifestResolution> {
        Ok(self.fetch_document(url).await?.resolution)
    }

    /// Fetch the manifest and keep its text alongside the resolution.
    pub async fn fetch_document(&self, url: &SourceUrl) -> Result<ManifestDocument> {
        info!("Fetching manifest: {}", url);
        let response = fetch_with_retry(&self.client, url, &self.retry).await?;
        let body = read_manifest_body(response, self.max_manifest_bytes).await?;
        parse_manifest(url, body)
    }

    /// Select a variant of `master` and resolve it, one level deep.
    ///
    /// # Errors
    /// [`ProxyError::InvalidInput`] when the origin policy is on and the
    /// variant points at a private address (nothing is fetched).
    /// [`ProxyError::UnexpectedNestedMaster`] when the selected variant is
    /// itself a master playlist.
    pub async fn resolve_variant(
        &self,
        master: &ManifestResolution,
        quality: Option<&str>,
    ) -> Result<ManifestDocument> {
        let variant = select_variant(master, quality).ok_or_else(|| {
            ProxyError::MalformedManifest(format!(
                "{} has no variant streams",
                master.original_url
            ))
        })?;
        info!(
            "Selected variant {} ({} bps) from {}",
            variant.url, variant.bandwidth, master.original_url
        );

        if self.enforce_origin_policy {
            check_origin_policy(&variant.url)?;
        }

        let document = self.fetch_document(&variant.url).await?;
        if document.resolution.is_master() {
            return Err(ProxyError::UnexpectedNestedMaster(variant.url.to_string()));
        }
        Ok(document)
    }
}

/// Read a manifest body into memory, refusing anything over `limit` bytes.
pub async fn read_manifest_body(response: Response, limit: usize) -> Result<String> {
    if let Some(declared) = declared_length(&response)
        && declared > limit as u64
    {
        return Err(ProxyError::MalformedManifest(format!(
            "manifest declares {declared} bytes, limit is {limit}"
        )));
    }

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > limit {
            return Err(ProxyError::MalformedManifest(format!(
                "manifest exceeds {limit} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }

    let text = String::from_utf8(body)
        .map_err(|_| ProxyError::MalformedManifest("manifest is not valid UTF-8".to_string()))?;
    Ok(text.trim_start_matches('\u{feff}').to_string())
}

/// Parse manifest text fetched from `url`.
///
/// Parser panics are contained here and reported as
/// [`ProxyError::MalformedManifest`].
pub fn parse_manifest(url: &SourceUrl, body: String) -> Result<ManifestDocument> {
    let parsed = panic::catch_unwind(AssertUnwindSafe(|| {
        parse_playlist_res(body.as_bytes()).map_err(|e| format!("{e:?}"))
    }));

    let playlist = match parsed {
        Ok(Ok(playlist)) => playlist,
        Ok(Err(e)) => {
            debug!("m3u8 parse error for {}: {}", url, e);
            return Err(ProxyError::MalformedManifest(format!(
                "{url} is not a valid M3U8 playlist"
            )));
        }
        Err(_) => {
            warn!("m3u8 parser panicked on {}", url);
            return Err(ProxyError::MalformedManifest(format!(
                "{url} could not be parsed"
            )));
        }
    };

    let resolution = match playlist {
        Playlist::MasterPlaylist(master) => resolve_master(url, &master)?,
        Playlist::MediaPlaylist(_) => ManifestResolution {
            kind: ManifestKind::Media,
            variants: Vec::new(),
            audio_tracks: Vec::new(),
            subtitle_tracks: Vec::new(),
            original_url: url.clone(),
        },
    };

    debug!(
        "Resolved {} as {:?}: {} variants, {} audio, {} subtitles",
        url,
        resolution.kind,
        resolution.variants.len(),
        resolution.audio_tracks.len(),
        resolution.subtitle_tracks.len()
    );

    Ok(ManifestDocument { resolution, body })
}

fn resolve_master(url: &SourceUrl, master: &MasterPlaylist) -> Result<ManifestResolution> {
    let mut variants = master
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .map(|v| {
            Ok(Variant {
                url: url.join(v.uri.trim())?,
                bandwidth: v.bandwidth,
                resolution: v.resolution.as_ref().map(|r| Resolution {
                    width: r.width,
                    height: r.height,
                }),
                audio_group: v.audio.clone(),
                codecs: v.codecs.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    // Stable: equal bandwidths keep manifest order
    variants.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));

    let mut audio_tracks = Vec::new();
    let mut subtitle_tracks = Vec::new();
    for media in &master.alternatives {
        let media_url = media
            .uri
            .as_deref()
            .map(|uri| url.join(uri.trim()))
            .transpose()?;

        match media.media_type {
            AlternativeMediaType::Audio => audio_tracks.push(AudioTrack {
                language: media.language.clone(),
                name: media.name.clone(),
                url: media_url,
                group_id: media.group_id.clone(),
            }),
            AlternativeMediaType::Subtitles => subtitle_tracks.push(SubtitleTrack {
                language: media.language.clone(),
                name: media.name.clone(),
                url: media_url,
            }),
            _ => {}
        }
    }

    // A master tag set with no playable variant (e.g. only I-frame streams)
    // cannot be navigated, so it is served like a media playlist
    let kind = if variants.is_empty() {
        ManifestKind::Media
    } else {
        ManifestKind::Master
    };

    Ok(ManifestResolution {
        kind,
        variants,
        audio_tracks,
        subtitle_tracks,
        original_url: url.clone(),
    })
}

/// Pick the variant whose bandwidth matches `quality` exactly, else the
/// highest-bandwidth variant. `None` only when there are no variants.
pub fn select_variant<'a>(
    resolution: &'a ManifestResolution,
    quality: Option<&str>,
) -> Option<&'a Variant> {
    let requested = quality.map(str::trim).filter(|q| !q.is_empty());

    requested
        .and_then(|q| {
            resolution
                .variants
                .iter()
                .find(|v| v.bandwidth.to_string() == q)
        })
        .or_else(|| {
            if let Some(q) = requested {
                debug!("No variant with bandwidth {}, using highest", q);
            }
            resolution.variants.first()
        })
}

/// Find the first variant playing with audio `audio`, falling back to
/// variant 0.
///
/// `audio` is matched against group IDs first, then against track
/// languages and names (case-insensitive), which are mapped to their group.
pub fn find_audio_variant<'a>(
    resolution: &'a ManifestResolution,
    audio: &str,
) -> Option<AudioVariantMatch<'a>> {
    let in_group = |group: &str| {
        resolution
            .variants
            .iter()
            .find(|v| v.audio_group.as_deref() == Some(group))
    };

    let matched = in_group(audio).or_else(|| {
        resolution
            .audio_tracks
            .iter()
            .filter(|track| {
                track
                    .language
                    .as_deref()
                    .is_some_and(|lang| lang.eq_ignore_ascii_case(audio))
                    || track.name.eq_ignore_ascii_case(audio)
            })
            .find_map(|track| in_group(&track.group_id))
    });

    if let Some(variant) = matched {
        return Some(AudioVariantMatch {
            variant,
            exact: true,
        });
    }

    resolution.variants.first().map(|variant| AudioVariantMatch {
        variant,
        exact: false,
    })
}
