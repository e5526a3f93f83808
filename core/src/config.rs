//! Share configuration (spec §6), extending the teacher's `Config` shape
//! (`cache_strategy`, `cache_ttl_seconds`, ...) with the RQ-specific keys.

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    Ttl,
    Lru,
    None,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ShareConfig {
    /// Root of the cache on disk (`local.path`).
    pub local_path: PathBuf,
    /// TTL for `ListCache`, in milliseconds (`contentCacheTTL`, default 30000).
    pub content_cache_ttl_ms: u64,
    /// Disables NFKC normalization for path keys.
    pub no_unicode_normalize: bool,
    /// Minimum age (ms) before an RQ entry is eligible for processing.
    pub expiration_ms: u64,
    /// Retry ceiling before purge.
    pub max_retries: u32,
    /// Backoff base, in milliseconds.
    pub retry_delay_ms: u64,
    /// Processor poll period, in milliseconds.
    pub frequency_ms: u64,
    /// Per-request timeout for the remote transport, in milliseconds; an
    /// expired request is treated like a 5xx (§5 "Timeouts").
    pub remote_timeout_ms: u64,
    pub cache_strategy: CacheStrategy,
    pub attribute_cache_ttl_seconds: u64,
    pub attribute_cache_lru_capacity: usize,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            local_path: PathBuf::from("./cache"),
            content_cache_ttl_ms: 30_000,
            no_unicode_normalize: false,
            expiration_ms: 0,
            max_retries: 5,
            retry_delay_ms: 1_000,
            frequency_ms: 1_000,
            remote_timeout_ms: 30_000,
            cache_strategy: CacheStrategy::Ttl,
            attribute_cache_ttl_seconds: 5,
            attribute_cache_lru_capacity: 4096,
        }
    }
}

impl ShareConfig {
    /// Loads configuration from a TOML file, falling back to defaults on a
    /// missing file (logged at `warn`) or a parse failure (logged at
    /// `error`) — mirroring the teacher's `load_config`.
    pub fn load(path: &std::path::Path) -> Self {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Self::default();
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to read config, using defaults");
                return Self::default();
            }
        };

        match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to parse config, using defaults");
                Self::default()
            }
        }
    }
}
