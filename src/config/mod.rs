//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup, fails fast on malformed values.
//! Connection strings are wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::dispatch::RaceRetry;
use crate::error::{Error, Result};
use crate::fingerprint::DEFAULT_KEY_PREFIX;
use crate::model::{DuplicatePolicy, LockExpiry};

const DEFAULT_BACKEND: &str = "redis";
const DEFAULT_SCAN_COUNT: usize = 100;

/// Which lock backend to build and how to reach it.
#[derive(Debug)]
pub struct BackendConfig {
    /// Registry name of the backend (`redis`, `memory`, or a custom one).
    pub kind: String,
    pub url: Option<SecretString>,
    /// Sentinel master (service) name, required for `sentinel://` URLs.
    pub master_name: Option<String>,
    /// Page size hint for prefix scans.
    pub scan_count: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: DEFAULT_BACKEND.to_string(),
            url: None,
            master_name: None,
            scan_count: DEFAULT_SCAN_COUNT,
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub backend: BackendConfig,
    pub key_prefix: String,
    pub lock_expiry: LockExpiry,
    pub duplicate_policy: DuplicatePolicy,
    pub race_retry: RaceRetry,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            lock_expiry: LockExpiry::Never,
            duplicate_policy: DuplicatePolicy::AttachToExisting,
            race_retry: RaceRetry::default(),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let backend = BackendConfig {
            kind: var("SINGLETON_BACKEND").unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            url: resolve_backend_url(&var).map(SecretString::from),
            master_name: var("SINGLETON_SENTINEL_MASTER"),
            scan_count: parse_var(&var, "SINGLETON_SCAN_COUNT")?.unwrap_or(DEFAULT_SCAN_COUNT),
        };

        let lock_expiry: LockExpiry = parse_var::<f64, _>(&var, "SINGLETON_LOCK_EXPIRY")?
            .map(|secs| seconds("SINGLETON_LOCK_EXPIRY", secs))
            .transpose()?
            .into();

        let raise = match var("SINGLETON_RAISE_ON_DUPLICATE") {
            Some(v) => parse_bool("SINGLETON_RAISE_ON_DUPLICATE", &v)?,
            None => false,
        };

        let race_retry = RaceRetry {
            max_attempts: attempt_cap(
                "SINGLETON_RACE_MAX_ATTEMPTS",
                parse_var(&var, "SINGLETON_RACE_MAX_ATTEMPTS")?,
            )?,
            backoff: Duration::from_millis(
                parse_var(&var, "SINGLETON_RACE_BACKOFF_MS")?.unwrap_or(0),
            ),
        };

        Ok(Self {
            backend,
            key_prefix: var("SINGLETON_KEY_PREFIX").unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            lock_expiry,
            duplicate_policy: DuplicatePolicy::from_raise_flag(raise),
            race_retry,
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let defaults = Config::default();

        let lock_expiry: LockExpiry = file
            .lock_expiry_secs
            .map(|secs| seconds("lock_expiry_secs", secs))
            .transpose()?
            .into();

        Ok(Self {
            backend: BackendConfig {
                kind: file.backend.kind.unwrap_or(defaults.backend.kind),
                url: file.backend.url,
                master_name: file.backend.master_name,
                scan_count: file.backend.scan_count.unwrap_or(DEFAULT_SCAN_COUNT),
            },
            key_prefix: file.key_prefix.unwrap_or(defaults.key_prefix),
            lock_expiry,
            duplicate_policy: DuplicatePolicy::from_raise_flag(file.raise_on_duplicate),
            race_retry: RaceRetry {
                max_attempts: attempt_cap("race_retry.max_attempts", file.race_retry.max_attempts)?,
                backoff: Duration::from_millis(file.race_retry.backoff_ms),
            },
            otel_endpoint: file.otel_endpoint,
            log_level: file.log_level.unwrap_or(defaults.log_level),
        })
    }
}

/// `SINGLETON_BACKEND_URL`, else a `redis://` `RESULT_BACKEND`, else `BROKER_URL`.
fn resolve_backend_url(var: &impl Fn(&str) -> Option<String>) -> Option<String> {
    if let Some(url) = var("SINGLETON_BACKEND_URL") {
        return Some(url);
    }
    match var("RESULT_BACKEND") {
        Some(url) if url.starts_with("redis://") => Some(url),
        _ => var("BROKER_URL"),
    }
}

fn parse_var<T, F>(var: &F, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {name} `{v}`: {e}")))
        })
        .transpose()
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("invalid {name} `{value}`: expected a boolean"))),
    }
}

/// A cap of zero would never try to acquire at all.
fn attempt_cap(name: &str, cap: Option<u32>) -> Result<Option<u32>> {
    match cap {
        Some(0) => Err(Error::Config(format!("invalid {name} `0`: must be at least 1"))),
        cap => Ok(cap),
    }
}

fn seconds(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::Config(format!("invalid {name} `{secs}`: {e}")))
}

// ---------------------------------------------------------------------------
// TOML layout
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    backend: BackendSection,
    key_prefix: Option<String>,
    lock_expiry_secs: Option<f64>,
    #[serde(default)]
    raise_on_duplicate: bool,
    #[serde(default)]
    race_retry: RaceRetrySection,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackendSection {
    kind: Option<String>,
    url: Option<SecretString>,
    master_name: Option<String>,
    scan_count: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RaceRetrySection {
    max_attempts: Option<u32>,
    #[serde(default)]
    backoff_ms: u64,
}
