use crate::{
    config::Config,
    error::Result,
    hls::ManifestResolver,
    probe::{self, MetadataProbe},
    upstream::RetryConfig,
    url_validation::{SourceUrl, check_origin_policy, is_private_host, validate_source_url},
};
use reqwest::{Client, redirect};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_REDIRECTS: usize = 10;

/// Application state shared across all handlers.
///
/// Everything here is immutable after startup; requests share no mutable
/// state beyond the HTTP client's own connection pool.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Shared HTTP client for connection pooling
    pub http_client: Client,
    pub resolver: ManifestResolver,
    /// Metadata enrichment for `/validate`
    pub probe: Arc<dyn MetadataProbe>,
    pub started_at: Instant,
}

impl AppState {
    /// Create a new AppState with the given configuration
    pub fn new(config: Config) -> std::result::Result<Self, reqwest::Error> {
        let http_client = Client::builder()
            .user_agent(concat!("streamgate/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .redirect(redirect_policy(config.allow_private_origins))
            .build()?;

        let resolver = ManifestResolver::new(
            http_client.clone(),
            RetryConfig {
                max_attempts: config.manifest_fetch_attempts,
                ..RetryConfig::default()
            },
            config.max_manifest_bytes,
        )
        .with_origin_policy(!config.allow_private_origins);

        let probe = probe::from_config(&config);

        Ok(Self {
            config: Arc::new(config),
            http_client,
            resolver,
            probe,
            started_at: Instant::now(),
        })
    }

    /// Replace the metadata probe (e.g. with a stub in tests)
    pub fn with_probe(mut self, probe: Arc<dyn MetadataProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Gate for every entry point: syntax checks, then the origin policy.
    pub fn validate(&self, raw: Option<&str>) -> Result<SourceUrl> {
        let url = validate_source_url(raw.unwrap_or_default())?;
        if !self.config.allow_private_origins {
            check_origin_policy(&url)?;
        }
        Ok(url)
    }
}

/// Redirect handling for upstream fetches.
///
/// With private origins disallowed every hop is checked, so a public URL
/// cannot redirect the proxy onto an internal address.
fn redirect_policy(allow_private_origins: bool) -> redirect::Policy {
    if allow_private_origins {
        return redirect::Policy::limited(MAX_REDIRECTS);
    }
    redirect::Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else if is_private_host(attempt.url()) {
            attempt.error("redirect to a private address is not allowed")
        } else {
            attempt.follow()
        }
    })
}
