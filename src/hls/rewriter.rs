//! Media playlist rewriting.
//!
//! Every URI line of a media playlist is replaced with a path back into this
//! proxy's `/stream` endpoint, so the player never talks to the origin.
//! Tag, comment and blank lines are left byte-for-byte intact and the line
//! count never changes: tags such as `#EXTINF` and `#EXT-X-BYTERANGE` bind
//! to the URI line that follows them.

use crate::error::Result;
use crate::url_validation::{MANIFEST_EXTENSION, SourceUrl};
use tracing::debug;
use url::form_urlencoded;

pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Rewritten playlists embed proxy paths and must not be reused by caches.
pub const PLAYLIST_CACHE_CONTROL: &str = "no-store, no-cache";

/// Published segments never change.
pub const SEGMENT_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Endpoint rewritten URIs re-enter through.
pub const STREAM_ENDPOINT: &str = "/stream";

const COMMENT_MARKER: char = '#';

/// Same-origin proxy path carrying `target` as an opaque query value.
///
/// The `hls=true` marker routes the request through the HLS path, where the
/// response is classified as playlist or segment.
pub fn proxy_path(target: &SourceUrl) -> String {
    let encoded: String = form_urlencoded::byte_serialize(target.as_str().as_bytes()).collect();
    format!("{STREAM_ENDPOINT}?url={encoded}&hls=true")
}

/// Rewrite each URI reference in `manifest` to a proxied absolute URL.
///
/// Only URI lines are rewritten. Tag lines are copied verbatim, including
/// `URI="..."` attributes on `#EXT-X-KEY` and `#EXT-X-MAP`, so players fetch
/// keys and init segments directly from the origin (a relative attribute
/// resolves against the proxy path, not the origin).
///
/// # Errors
/// [`crate::error::ProxyError::MalformedManifest`] when a URI line cannot be
/// resolved against `base` to an http(s) URL.
pub fn rewrite_media_playlist(manifest: &str, base: &SourceUrl) -> Result<String> {
    let mut rewritten = Vec::new();
    let mut uri_lines = 0usize;

    for line in manifest.split('\n') {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(COMMENT_MARKER) {
            rewritten.push(line.to_string());
            continue;
        }

        let absolute = base.join(trimmed)?;
        rewritten.push(proxy_path(&absolute));
        uri_lines += 1;
    }

    debug!("Rewrote {} URI lines in playlist from {}", uri_lines, base);
    Ok(rewritten.join("\n"))
}

/// Decide whether a fetched resource is a playlist (rewrite) or a binary
/// segment (relay).
pub fn is_playlist_response(content_type: Option<&str>, url: &SourceUrl) -> bool {
    let declared_playlist = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("mpegurl"))
        .unwrap_or(false);

    declared_playlist
        || url
            .as_url()
            .path()
            .to_ascii_lowercase()
            .ends_with(MANIFEST_EXTENSION)
}
