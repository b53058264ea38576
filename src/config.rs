use std::env;
use std::time::Duration;

/// 10 GiB: largest upstream resource the relay will forward.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;
/// 1 MiB relay chunks.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
/// Manifests are text; anything past 8 MiB is not a playlist we want to parse.
pub const DEFAULT_MAX_MANIFEST_BYTES: usize = 8 * 1024 * 1024;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_addr: String,
    pub is_dev: bool,
    /// Size ceiling enforced on relayed and downloaded resources
    pub max_file_size: u64,
    /// Size of each chunk written to the client during relay
    pub chunk_size: usize,
    /// Upper bound on a manifest body read into memory
    pub max_manifest_bytes: usize,
    pub connect_timeout: Duration,
    /// Per-read timeout on upstream bodies (also bounds a stalled mid-stream read)
    pub read_timeout: Duration,
    /// Attempts for manifest fetches (segments and direct streams are never retried)
    pub manifest_fetch_attempts: u32,
    /// Run ffprobe to enrich `/validate` responses
    pub probe_enabled: bool,
    pub ffprobe_path: String,
    pub probe_timeout: Duration,
    /// Skip the private/reserved IP literal check on source URLs
    pub allow_private_origins: bool,
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT is required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string());

        let max_file_size = parse_or("MAX_FILE_SIZE_BYTES", DEFAULT_MAX_FILE_SIZE)?;
        let chunk_size = parse_or("CHUNK_SIZE_BYTES", DEFAULT_CHUNK_SIZE)?;
        if chunk_size == 0 {
            return Err("CHUNK_SIZE_BYTES must be greater than zero".into());
        }
        let max_manifest_bytes = parse_or("MAX_MANIFEST_BYTES", DEFAULT_MAX_MANIFEST_BYTES)?;

        let connect_timeout = Duration::from_secs(parse_or("CONNECT_TIMEOUT_SECS", 5)?);
        let read_timeout = Duration::from_secs(parse_or("READ_TIMEOUT_SECS", 30)?);
        let manifest_fetch_attempts: u32 = parse_or("MANIFEST_FETCH_ATTEMPTS", 2)?;

        let probe_enabled = env::var("PROBE_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);
        let ffprobe_path = env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string());
        let probe_timeout = Duration::from_secs(parse_or("PROBE_TIMEOUT_SECS", 10)?);

        // Private origins are convenient in dev (local test servers) and blocked in prod
        let allow_private_origins = env::var("ALLOW_PRIVATE_ORIGINS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(is_dev);

        Ok(Config {
            port,
            bind_addr,
            is_dev,
            max_file_size,
            chunk_size,
            max_manifest_bytes,
            connect_timeout,
            read_timeout,
            manifest_fetch_attempts,
            probe_enabled,
            ffprobe_path,
            probe_timeout,
            allow_private_origins,
        })
    }
}

impl Default for Config {
    /// Dev-mode defaults, without reading the environment.
    fn default() -> Self {
        Self {
            port: 5000,
            bind_addr: "0.0.0.0".to_string(),
            is_dev: true,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_manifest_bytes: DEFAULT_MAX_MANIFEST_BYTES,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            manifest_fetch_attempts: 2,
            probe_enabled: true,
            ffprobe_path: "ffprobe".to_string(),
            probe_timeout: Duration::from_secs(10),
            allow_private_origins: true,
        }
    }
}

/// Parse an optional numeric env var; a present-but-invalid value is an error.
fn parse_or<T>(key: &str, default: T) -> Result<T, Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("{key} has invalid value '{raw}': {e}").into()),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serialize all env-var tests to prevent races between parallel test threads.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "DEV_MODE",
        "PORT",
        "BIND_ADDR",
        "MAX_FILE_SIZE_BYTES",
        "CHUNK_SIZE_BYTES",
        "MAX_MANIFEST_BYTES",
        "CONNECT_TIMEOUT_SECS",
        "READ_TIMEOUT_SECS",
        "MANIFEST_FETCH_ATTEMPTS",
        "PROBE_ENABLED",
        "FFPROBE_PATH",
        "PROBE_TIMEOUT_SECS",
        "ALLOW_PRIVATE_ORIGINS",
    ];

    /// Clear every config var, set `set`, run `f`, then restore original state.
    fn with_env(set: &[(&str, &str)], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let saved: Vec<(&str, Option<String>)> =
            ALL_VARS.iter().map(|k| (*k, std::env::var(k).ok())).collect();

        for k in ALL_VARS {
            // SAFETY: ENV_LOCK serializes every env mutation in this module.
            unsafe { std::env::remove_var(k) };
        }
        for (k, v) in set {
            unsafe { std::env::set_var(k, v) };
        }

        f();

        for (k, old) in saved {
            match old {
                Some(v) => unsafe { std::env::set_var(k, v) },
                None => unsafe { std::env::remove_var(k) },
            }
        }
    }

    #[test]
    fn dev_mode_uses_defaults() {
        with_env(&[("DEV_MODE", "true")], || {
            let config = Config::from_env().expect("should succeed in dev mode");
            assert!(config.is_dev);
            assert_eq!(config.port, 5000);
            assert_eq!(config.max_file_size, 10 * 1024 * 1024 * 1024);
            assert_eq!(config.chunk_size, 1024 * 1024);
            assert_eq!(config.connect_timeout, Duration::from_secs(5));
            assert_eq!(config.read_timeout, Duration::from_secs(30));
            assert_eq!(config.manifest_fetch_attempts, 2);
            assert!(config.probe_enabled);
            assert_eq!(config.ffprobe_path, "ffprobe");
            assert!(config.allow_private_origins);
        });
    }

    #[test]
    fn prod_mode_requires_port() {
        with_env(&[], || {
            let result = Config::from_env();
            assert!(result.is_err(), "Should fail without PORT in prod mode");
        });
    }

    #[test]
    fn prod_mode_blocks_private_origins_by_default() {
        with_env(&[("PORT", "8080")], || {
            let config = Config::from_env().unwrap();
            assert!(!config.is_dev);
            assert_eq!(config.port, 8080);
            assert!(!config.allow_private_origins);
        });
    }

    #[test]
    fn explicit_private_origin_override() {
        with_env(
            &[("PORT", "8080"), ("ALLOW_PRIVATE_ORIGINS", "true")],
            || {
                let config = Config::from_env().unwrap();
                assert!(config.allow_private_origins);
            },
        );
    }

    #[test]
    fn size_limits_parsed() {
        with_env(
            &[
                ("DEV_MODE", "true"),
                ("MAX_FILE_SIZE_BYTES", "1048576"),
                ("CHUNK_SIZE_BYTES", "65536"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.max_file_size, 1_048_576);
                assert_eq!(config.chunk_size, 65_536);
            },
        );
    }

    #[test]
    fn invalid_numeric_value_is_an_error() {
        with_env(
            &[("DEV_MODE", "true"), ("MAX_FILE_SIZE_BYTES", "ten gigs")],
            || {
                assert!(Config::from_env().is_err());
            },
        );
    }

    #[test]
    fn zero_chunk_size_rejected() {
        with_env(&[("DEV_MODE", "true"), ("CHUNK_SIZE_BYTES", "0")], || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn probe_can_be_disabled() {
        with_env(
            &[
                ("DEV_MODE", "true"),
                ("PROBE_ENABLED", "false"),
                ("FFPROBE_PATH", "/opt/ffmpeg/bin/ffprobe"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert!(!config.probe_enabled);
                assert_eq!(config.ffprobe_path, "/opt/ffmpeg/bin/ffprobe");
            },
        );
    }
}
