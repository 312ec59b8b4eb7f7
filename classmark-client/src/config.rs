//! Configuration loading for the sync client.
//!
//! All fields are required unless explicitly marked optional. No defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use classmark_core::{BackoffPolicy, ClassmarkError, SyncConfig, TenantId};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub tenant_id: uuid::Uuid,
    pub request_timeout_ms: u64,
    pub data_dir: PathBuf,
    pub outbox_max_size_mb: usize,
    pub auth: AuthConfig,
    pub sync: SyncSection,
    pub backoff: BackoffSection,
    pub connectivity: ConnectivitySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncSection {
    pub max_batch_size: usize,
    pub max_batches_per_cycle: usize,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffSection {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectivitySection {
    pub probe_interval_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientConfigError {
    #[error("Missing configuration file path (use --config or CLASSMARK_CLIENT_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl From<ClientConfigError> for ClassmarkError {
    fn from(e: ClientConfigError) -> Self {
        let config = match e {
            ClientConfigError::InvalidValue { field, reason } => {
                classmark_core::ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: String::new(),
                    reason,
                }
            }
            other => classmark_core::ConfigError::Load {
                path: "client config".to_string(),
                reason: other.to_string(),
            },
        };
        ClassmarkError::Config(config)
    }
}

impl ClientConfig {
    pub fn load() -> Result<Self, ClientConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ClientConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ClientConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ClientConfigError> {
        let config: ClientConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClientConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ClientConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.auth.api_key.is_none() && self.auth.bearer_token.is_none() {
            return Err(ClientConfigError::InvalidValue {
                field: "auth",
                reason: "api_key or bearer_token must be provided".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ClientConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ClientConfigError::InvalidValue {
                field: "data_dir",
                reason: "must not be empty".to_string(),
            });
        }
        if self.outbox_max_size_mb == 0 {
            return Err(ClientConfigError::InvalidValue {
                field: "outbox_max_size_mb",
                reason: "must be > 0".to_string(),
            });
        }
        if self.sync.max_batch_size == 0 {
            return Err(ClientConfigError::InvalidValue {
                field: "sync.max_batch_size",
                reason: "must be > 0".to_string(),
            });
        }
        if self.sync.max_batches_per_cycle == 0 {
            return Err(ClientConfigError::InvalidValue {
                field: "sync.max_batches_per_cycle",
                reason: "must be > 0".to_string(),
            });
        }
        if self.sync.interval_ms == 0 {
            return Err(ClientConfigError::InvalidValue {
                field: "sync.interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.backoff.initial_ms == 0 {
            return Err(ClientConfigError::InvalidValue {
                field: "backoff.initial_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.backoff.max_ms < self.backoff.initial_ms {
            return Err(ClientConfigError::InvalidValue {
                field: "backoff.max_ms",
                reason: "must be >= initial_ms".to_string(),
            });
        }
        if !(self.backoff.multiplier.is_finite() && self.backoff.multiplier >= 1.0) {
            return Err(ClientConfigError::InvalidValue {
                field: "backoff.multiplier",
                reason: "must be >= 1.0".to_string(),
            });
        }
        if self.backoff.max_attempts == 0 {
            return Err(ClientConfigError::InvalidValue {
                field: "backoff.max_attempts",
                reason: "must be > 0".to_string(),
            });
        }
        if self.connectivity.probe_interval_ms == 0 {
            return Err(ClientConfigError::InvalidValue {
                field: "connectivity.probe_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn tenant(&self) -> TenantId {
        TenantId::new(self.tenant_id)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync.interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.connectivity.probe_interval_ms)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.backoff.initial_ms),
            max: Duration::from_millis(self.backoff.max_ms),
            multiplier: self.backoff.multiplier,
            max_attempts: self.backoff.max_attempts,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig::default()
            .with_max_batch_size(self.sync.max_batch_size)
            .with_max_batches_per_cycle(self.sync.max_batches_per_cycle)
            .with_request_timeout(self.request_timeout())
            .with_backoff(self.backoff_policy())
    }

    /// Directory holding the LMDB outbox.
    pub fn outbox_path(&self) -> PathBuf {
        self.data_dir.join("outbox")
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("CLASSMARK_CLIENT_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
api_base_url = "https://sync.school.example/"
tenant_id = "018f6b0e-0000-7000-8000-000000000001"
request_timeout_ms = 15000
data_dir = "/var/lib/classmark"
outbox_max_size_mb = 64

[auth]
bearer_token = "token"

[sync]
max_batch_size = 20
max_batches_per_cycle = 5
interval_ms = 60000

[backoff]
initial_ms = 2000
max_ms = 300000
multiplier = 2.0
max_attempts = 8

[connectivity]
probe_interval_ms = 10000
"#;

    #[test]
    fn test_valid_config_maps_to_sync_config() {
        let config = ClientConfig::from_toml_str(VALID).unwrap();
        config.validate().unwrap();

        let sync = config.sync_config();
        assert_eq!(sync.max_batch_size, 20);
        assert_eq!(sync.max_batches_per_cycle, 5);
        assert_eq!(sync.request_timeout, Duration::from_secs(15));
        assert_eq!(sync.backoff.max_attempts, 8);
        sync.validate().unwrap();
        assert_eq!(config.outbox_path(), PathBuf::from("/var/lib/classmark/outbox"));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let raw = format!("{VALID}\nsurprise = true\n");
        assert!(matches!(
            ClientConfig::from_toml_str(&raw),
            Err(ClientConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let raw = VALID.replace("bearer_token = \"token\"", "");
        let config = ClientConfig::from_toml_str(&raw).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ClientConfigError::InvalidValue { field: "auth", .. })
        ));
    }

    #[test]
    fn test_backoff_bounds_checked() {
        let raw = VALID.replace("max_ms = 300000", "max_ms = 1000");
        let config = ClientConfig::from_toml_str(&raw).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ClientConfigError::InvalidValue {
                field: "backoff.max_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_from_path_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, VALID).unwrap();
        let config = ClientConfig::from_path(&path).unwrap();
        assert_eq!(config.tenant().to_string(), "018f6b0e-0000-7000-8000-000000000001");
    }
}
