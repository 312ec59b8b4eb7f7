//! API Configuration Module
//!
//! Server settings are loaded from environment variables with defaults
//! suitable for development.

use std::str::FromStr;
use std::time::Duration;

use classmark_core::CacheConfig;

use crate::error::{ApiError, ApiResult};

// ============================================================================
// API CONFIGURATION
// ============================================================================

/// API configuration for CORS, caching, sync limits and housekeeping.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    // ========================================================================
    // CORS Configuration
    // ========================================================================
    /// Allowed CORS origins (comma-separated in env var).
    /// Empty means allow all origins (dev mode).
    pub cors_origins: Vec<String>,

    /// Max age for CORS preflight cache in seconds.
    pub cors_max_age_secs: u64,

    // ========================================================================
    // Request Handling
    // ========================================================================
    /// Upper bound on how long one request may run.
    pub request_timeout: Duration,

    /// Largest push batch accepted in one request.
    pub max_push_items: usize,

    /// Largest pull page served in one response.
    pub pull_page_size: usize,

    // ========================================================================
    // View Cache
    // ========================================================================
    pub cache_default_ttl: Duration,

    /// Per view-kind TTL overrides, `kind=secs` pairs in the env var.
    pub cache_view_ttls: Vec<(String, Duration)>,

    // ========================================================================
    // Housekeeping
    // ========================================================================
    /// How often expired views are purged and the idempotency ledger pruned.
    pub housekeeping_interval: Duration,

    /// How long push outcomes are remembered for replay.
    pub ledger_retention: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            cors_origins: Vec::new(),
            cors_max_age_secs: 86400,
            request_timeout: Duration::from_secs(30),
            max_push_items: 500,
            pull_page_size: 500,
            cache_default_ttl: Duration::from_secs(300),
            cache_view_ttls: Vec::new(),
            housekeeping_interval: Duration::from_secs(60),
            ledger_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl ApiConfig {
    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `CLASSMARK_CORS_ORIGINS`: Comma-separated allowed origins (empty = allow all)
    /// - `CLASSMARK_CORS_MAX_AGE_SECS`: Preflight cache duration (default: 86400)
    /// - `CLASSMARK_REQUEST_TIMEOUT_SECS`: Per-request timeout (default: 30)
    /// - `CLASSMARK_MAX_PUSH_ITEMS`: Items accepted per push (default: 500)
    /// - `CLASSMARK_PULL_PAGE_SIZE`: Records served per pull page (default: 500)
    /// - `CLASSMARK_CACHE_TTL_SECS`: Default view TTL (default: 300)
    /// - `CLASSMARK_CACHE_VIEW_TTLS`: Overrides such as `student-attendance=60,section-attendance=120`
    /// - `CLASSMARK_HOUSEKEEPING_INTERVAL_SECS`: Purge interval (default: 60)
    /// - `CLASSMARK_LEDGER_RETENTION_SECS`: Replay window (default: 604800)
    ///
    /// Unparseable values fall back to their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|s| parse_trimmed::<u64>(&s));
        let secs = |key: &str, default: Duration| parse(key).map_or(default, Duration::from_secs);

        let cors_origins = lookup("CLASSMARK_CORS_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let cache_view_ttls = lookup("CLASSMARK_CACHE_VIEW_TTLS")
            .map(|s| parse_view_ttls(&s))
            .unwrap_or_default();

        Self {
            cors_origins,
            cors_max_age_secs: parse("CLASSMARK_CORS_MAX_AGE_SECS")
                .unwrap_or(defaults.cors_max_age_secs),
            request_timeout: secs("CLASSMARK_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            max_push_items: parse("CLASSMARK_MAX_PUSH_ITEMS")
                .map_or(defaults.max_push_items, |v| v as usize),
            pull_page_size: parse("CLASSMARK_PULL_PAGE_SIZE")
                .map_or(defaults.pull_page_size, |v| v as usize),
            cache_default_ttl: secs("CLASSMARK_CACHE_TTL_SECS", defaults.cache_default_ttl),
            cache_view_ttls,
            housekeeping_interval: secs(
                "CLASSMARK_HOUSEKEEPING_INTERVAL_SECS",
                defaults.housekeeping_interval,
            ),
            ledger_retention: secs("CLASSMARK_LEDGER_RETENTION_SECS", defaults.ledger_retention),
        }
    }

    /// View cache settings derived from this configuration.
    pub fn cache_config(&self) -> CacheConfig {
        self.cache_view_ttls.iter().fold(
            CacheConfig::default().with_default_ttl(self.cache_default_ttl),
            |config, (kind, ttl)| config.with_view_ttl(kind.clone(), *ttl),
        )
    }

    pub fn validate(&self) -> ApiResult<()> {
        if self.max_push_items == 0 {
            return Err(ApiError::invalid_input(
                "CLASSMARK_MAX_PUSH_ITEMS must be greater than 0",
            ));
        }
        if self.pull_page_size == 0 {
            return Err(ApiError::invalid_input(
                "CLASSMARK_PULL_PAGE_SIZE must be greater than 0",
            ));
        }
        if self.request_timeout.is_zero() || self.housekeeping_interval.is_zero() {
            return Err(ApiError::invalid_input("Timeouts and intervals must be positive"));
        }
        self.cache_config()
            .validate()
            .map_err(|e| ApiError::invalid_input(e.to_string()))
    }

    /// Check if a given origin is allowed.
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.cors_origins.is_empty() || self.cors_origins.iter().any(|allowed| allowed == origin)
    }
}

fn parse_trimmed<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}

/// Parse `kind=secs` pairs. Malformed pairs are skipped.
fn parse_view_ttls(raw: &str) -> Vec<(String, Duration)> {
    raw.split(',')
        .filter_map(|pair| {
            let (kind, secs) = pair.split_once('=')?;
            let kind = kind.trim();
            if kind.is_empty() {
                return None;
            }
            let secs = parse_trimmed::<u64>(secs)?;
            Some((kind.to_string(), Duration::from_secs(secs)))
        })
        .collect()
}
