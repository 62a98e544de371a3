//! Service configuration
//!
//! Layered as: built-in defaults → optional TOML file → `CHANNELD__*`
//! environment variables (`CHANNELD__LEASE__LEASE_DURATION_SECS=300`).
//! The binary applies CLI overrides on top, validates once, and passes the
//! result into the service.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

pub const ENV_PREFIX: &str = "CHANNELD";

/// Longest accepted lease: ten years.
pub const MAX_LEASE_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub lease: LeaseConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP server bind address
    pub http_addr: String,
    /// HTTP port
    pub http_port: u16,
    /// Enable CORS
    pub enable_cors: bool,
    /// Request timeout (seconds)
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0".to_string(),
            http_port: 8080,
            enable_cors: true,
            request_timeout_secs: 30,
        }
    }
}

/// Lease timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lifetime granted by every create or renew
    pub lease_duration_secs: u64,
    /// Period of the expiry sweep
    pub cleanup_interval_secs: u64,
    /// Budget for one sweep; an overrunning sweep is abandoned
    pub cleanup_timeout_secs: u64,
    /// Deadline for each individual store call
    pub store_timeout_ms: u64,
    /// Name of the counter that issues fresh indices
    pub sequence_name: String,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: 30 * 60,
            cleanup_interval_secs: 60,
            cleanup_timeout_secs: 30,
            store_timeout_ms: 5_000,
            sequence_name: "channel".to_string(),
        }
    }
}

impl LeaseConfig {
    /// Clamped to [`MAX_LEASE_DURATION_SECS`]; `validate` rejects larger values.
    pub fn lease_duration(&self) -> chrono::Duration {
        let secs = self.lease_duration_secs.min(MAX_LEASE_DURATION_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Journal,
}

/// Persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Journal,
            data_dir: PathBuf::from("data/channeld"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Prefix of the rolling log files
    pub app_name: String,
    pub log_dir: PathBuf,
    /// trace, debug, info, warn, error
    pub level: String,
    /// Emit JSON lines on stdout instead of pretty output
    pub json: bool,
    /// Colored console output and debug level
    pub debug_mode: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            app_name: "channeld".to_string(),
            log_dir: PathBuf::from("logs"),
            level: "info".to_string(),
            json: false,
            debug_mode: false,
        }
    }
}

impl AppConfig {
    /// Load defaults, then `path` (if any), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize::<AppConfig>())
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    /// Run every rule and report all violations at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let lease = &self.lease;
        if lease.lease_duration_secs == 0 {
            problems.push("lease.lease_duration_secs must be greater than 0".to_string());
        }
        if lease.lease_duration_secs > MAX_LEASE_DURATION_SECS {
            problems.push(format!(
                "lease.lease_duration_secs ({}) must not exceed {}",
                lease.lease_duration_secs, MAX_LEASE_DURATION_SECS
            ));
        }
        if lease.cleanup_interval_secs == 0 {
            problems.push("lease.cleanup_interval_secs must be greater than 0".to_string());
        }
        if lease.cleanup_timeout_secs == 0 {
            problems.push("lease.cleanup_timeout_secs must be greater than 0".to_string());
        }
        if lease.cleanup_timeout_secs > lease.cleanup_interval_secs {
            problems.push(format!(
                "lease.cleanup_timeout_secs ({}) must not exceed lease.cleanup_interval_secs ({})",
                lease.cleanup_timeout_secs, lease.cleanup_interval_secs
            ));
        }
        if lease.store_timeout_ms == 0 {
            problems.push("lease.store_timeout_ms must be greater than 0".to_string());
        }
        if lease.sequence_name.trim().is_empty() {
            problems.push("lease.sequence_name cannot be empty".to_string());
        }

        if self.storage.backend == StorageBackend::Journal
            && self.storage.data_dir.as_os_str().is_empty()
        {
            problems.push("storage.data_dir is required for the journal backend".to_string());
        }

        if self.log.level.parse::<tracing::Level>().is_err() {
            problems.push(format!("log.level '{}' is not a valid level", self.log.level));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lease.lease_duration(), chrono::Duration::minutes(30));
        assert_eq!(config.lease.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.lease.cleanup_timeout(), Duration::from_secs(30));
        assert_eq!(config.storage.backend, StorageBackend::Journal);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [lease]
            lease_duration_secs = 300

            [storage]
            backend = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(config.lease.lease_duration_secs, 300);
        assert_eq!(config.lease.cleanup_interval_secs, 60);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.server.http_port, 8080);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = AppConfig::default();
        config.lease.lease_duration_secs = 0;
        config.lease.cleanup_timeout_secs = 120;
        config.lease.sequence_name = " ".to_string();
        config.log.level = "loud".to_string();

        let message = match config.validate() {
            Err(Error::Config(message)) => message,
            other => panic!("expected config error, got {:?}", other),
        };

        assert!(message.contains("lease_duration_secs"));
        assert!(message.contains("cleanup_timeout_secs"));
        assert!(message.contains("sequence_name"));
        assert!(message.contains("log.level"));
    }

    #[test]
    fn test_oversized_lease_is_rejected() {
        let mut config = AppConfig::default();
        config.lease.lease_duration_secs = u64::MAX / 2;

        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert_eq!(
            config.lease.lease_duration(),
            chrono::Duration::seconds(MAX_LEASE_DURATION_SECS as i64)
        );

        config.lease.lease_duration_secs = u64::MAX;
        assert!(config.lease.lease_duration() > chrono::Duration::zero());

        config.lease.lease_duration_secs = MAX_LEASE_DURATION_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!(
            "channeld_config_{}_{}.toml",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        std::fs::write(
            &path,
            "[server]\nhttp_port = 9090\n\n[lease]\ncleanup_interval_secs = 10\ncleanup_timeout_secs = 5\n",
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.http_port, 9090);
        assert_eq!(config.lease.cleanup_interval_secs, 10);
        assert_eq!(config.lease.cleanup_timeout_secs, 5);
        assert!(config.validate().is_ok());

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = std::env::temp_dir().join("channeld_config_does_not_exist.toml");
        assert!(matches!(
            AppConfig::load(Some(&path)),
            Err(Error::Config(_))
        ));
    }
}
