//! Source URL validation.
//!
//! Every entry point turns the client-supplied string into a [`SourceUrl`]
//! here before any other component sees it. Nothing in this module touches
//! the network.

use crate::error::ProxyError;
use serde::{Serialize, Serializer};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// File extension identifying an HLS manifest.
pub const MANIFEST_EXTENSION: &str = ".m3u8";

/// An absolute http(s) URL with a non-empty host.
///
/// Only [`validate_source_url`] constructs one, so holding a `SourceUrl`
/// proves the input passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrl(Url);

impl SourceUrl {
    pub fn as_url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Resolve a (possibly relative) reference against this URL.
    ///
    /// References that already carry a scheme come back unchanged. The result
    /// goes through the same scheme/host checks as client input.
    pub fn join(&self, reference: &str) -> Result<SourceUrl, ProxyError> {
        let joined = self.0.join(reference).map_err(|e| {
            ProxyError::MalformedManifest(format!("Cannot resolve reference '{reference}': {e}"))
        })?;
        check_scheme_and_host(joined).map_err(|e| {
            ProxyError::MalformedManifest(format!("Reference '{reference}' rejected: {e}"))
        })
    }
}

impl fmt::Display for SourceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl Serialize for SourceUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}

/// Validate raw client input as a [`SourceUrl`].
///
/// # Errors
/// Returns [`ProxyError::InvalidInput`] for empty input, relative or
/// unparseable URLs, non-HTTP(S) schemes, and URLs without a host.
pub fn validate_source_url(raw: &str) -> Result<SourceUrl, ProxyError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ProxyError::InvalidInput("Missing url parameter".to_string()));
    }

    let parsed =
        Url::parse(raw).map_err(|_| ProxyError::InvalidInput(format!("Invalid URL: {raw}")))?;

    check_scheme_and_host(parsed)
}

fn check_scheme_and_host(parsed: Url) -> Result<SourceUrl, ProxyError> {
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ProxyError::InvalidInput(format!(
                "Scheme '{scheme}' not allowed, expected http or https"
            )));
        }
    }

    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(SourceUrl(parsed)),
        _ => Err(ProxyError::InvalidInput(format!("No host in URL: {parsed}"))),
    }
}

/// True when the URL path (query excluded) ends in `.m3u8`.
pub fn is_manifest_url(url: &SourceUrl) -> bool {
    url.as_url()
        .path()
        .to_ascii_lowercase()
        .ends_with(MANIFEST_EXTENSION)
}

/// Reject source URLs whose host is an IP literal in a private or reserved
/// range.
///
/// Hostnames are not resolved, so a name pointing at a private address
/// still passes.
pub fn check_origin_policy(url: &SourceUrl) -> Result<(), ProxyError> {
    if is_private_host(url.as_url()) {
        return Err(ProxyError::InvalidInput(format!(
            "Private or reserved address not allowed: {}",
            url.as_url().host_str().unwrap_or_default()
        )));
    }
    Ok(())
}

/// True when the URL's host is an IP literal in a blocked range.
///
/// Works on a bare [`Url`] so redirect targets can be checked before they
/// are followed.
pub fn is_private_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => is_blocked_ipv4(ip),
        Some(Host::Ipv6(ip)) => is_blocked_ipv6(ip),
        _ => false,
    }
}

/// 0/8, 10/8, 127/8, 169.254/16 (cloud metadata lives here), 172.16/12
/// and 192.168/16.
fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();

    a == 0
        || a == 10
        || a == 127
        || (a == 169 && b == 254)
        || (a == 172 && (16..=31).contains(&b))
        || (a == 192 && b == 168)
}

/// Returns `true` for IPv6 loopback (`::1`), link-local (`fe80::/10`) and
/// unique-local (`fc00::/7`) addresses.
fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    let s = ip.segments();

    ip.is_loopback() || (s[0] & 0xffc0) == 0xfe80 || (s[0] & 0xfe00) == 0xfc00
}
