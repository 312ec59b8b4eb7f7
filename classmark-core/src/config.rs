//! Configuration types

use crate::*;
use std::collections::HashMap;
use std::time::Duration;

/// Retry backoff for failed mutations.
///
/// The delay before attempt `n + 1` is `initial * multiplier^(n - 1)`,
/// capped at `max`. Once `max_attempts` sends have failed the mutation is
/// moved to terminal failure.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(300),
            multiplier: 2.0,
            max_attempts: 8,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the given number of attempts.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// Returns true once `attempts` sends have used up the retry budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn validate(&self) -> ClassmarkResult<()> {
        if self.initial.is_zero() {
            return Err(invalid("backoff.initial", format!("{:?}", self.initial), "must be positive"));
        }
        if self.max < self.initial {
            return Err(invalid(
                "backoff.max",
                format!("{:?}", self.max),
                "must be greater than or equal to backoff.initial",
            ));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(invalid(
                "backoff.multiplier",
                self.multiplier.to_string(),
                "must be a finite value >= 1.0",
            ));
        }
        if self.max_attempts == 0 {
            return Err(invalid("backoff.max_attempts", "0".to_string(), "must be greater than 0"));
        }
        Ok(())
    }
}

/// Client-side sync tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Maximum mutations per push request.
    pub max_batch_size: usize,
    /// Upper bound on batches sent in one push cycle.
    pub max_batches_per_cycle: usize,
    /// Per-request timeout for push and pull calls.
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 25,
            max_batches_per_cycle: 10,
            request_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_batches_per_cycle(mut self, batches: usize) -> Self {
        self.max_batches_per_cycle = batches;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> ClassmarkResult<()> {
        if self.max_batch_size == 0 {
            return Err(invalid("max_batch_size", "0".to_string(), "must be greater than 0"));
        }
        if self.max_batches_per_cycle == 0 {
            return Err(invalid("max_batches_per_cycle", "0".to_string(), "must be greater than 0"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid(
                "request_timeout",
                format!("{:?}", self.request_timeout),
                "must be positive",
            ));
        }
        self.backoff.validate()
    }
}

/// Aggregated view cache tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// TTL applied to views without an override.
    pub default_ttl: Duration,
    /// Per view-kind TTL overrides.
    pub ttl_overrides: HashMap<String, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            ttl_overrides: HashMap::new(),
        }
    }
}

impl CacheConfig {
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_view_ttl(mut self, view_kind: impl Into<String>, ttl: Duration) -> Self {
        self.ttl_overrides.insert(view_kind.into(), ttl);
        self
    }

    /// TTL for a given view kind.
    pub fn ttl_for(&self, view_kind: &str) -> Duration {
        self.ttl_overrides
            .get(view_kind)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    pub fn validate(&self) -> ClassmarkResult<()> {
        if self.default_ttl.is_zero() {
            return Err(invalid(
                "default_ttl",
                format!("{:?}", self.default_ttl),
                "must be positive",
            ));
        }
        for (kind, ttl) in &self.ttl_overrides {
            if ttl.is_zero() {
                return Err(invalid(
                    &format!("ttl_overrides.{kind}"),
                    format!("{:?}", ttl),
                    "must be positive",
                ));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, value: String, reason: &str) -> ClassmarkError {
    ClassmarkError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    })
}
