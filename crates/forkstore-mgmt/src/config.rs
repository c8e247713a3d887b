use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use forkstore_meta::retention::{DEFAULT_GC_HORIZON, DEFAULT_GC_PERIOD, DEFAULT_PITR_INTERVAL};
use forkstore_meta::timeline::DEFAULT_LAYER_TARGET_SIZE;
use forkstore_meta::{GraphConfig, RetentionPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("metric_collection_endpoint {0:?} is not an http(s) URL")]
    InvalidEndpoint(String),
    #[error("metric_collection_interval must be greater than zero")]
    ZeroCollectionInterval,
    #[error("reporter.max_events_per_request must be greater than zero")]
    ZeroEventsPerRequest,
    #[error("tenant_config.layer_target_size must be greater than zero")]
    ZeroLayerSize,
}

/// Remote tier settings. When absent the tenant's `s3_storage_size` is zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStorageConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Defaults applied to every new timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    #[serde(with = "humantime_serde")]
    pub gc_period: Duration,
    pub gc_horizon: u64,
    #[serde(with = "humantime_serde")]
    pub pitr_interval: Duration,
    pub layer_target_size: u64,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            gc_period: DEFAULT_GC_PERIOD,
            gc_horizon: DEFAULT_GC_HORIZON,
            pitr_interval: DEFAULT_PITR_INTERVAL,
            layer_target_size: DEFAULT_LAYER_TARGET_SIZE,
        }
    }
}

impl TenantConfig {
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            gc_horizon: self.gc_horizon,
            gc_period: self.gc_period,
            pitr_interval: self.pitr_interval,
        }
    }

    pub fn graph_config(&self) -> GraphConfig {
        GraphConfig {
            default_policy: self.retention_policy(),
            layer_target_size: self.layer_target_size,
        }
    }
}

/// Billing endpoint delivery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub max_events_per_request: usize,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            max_events_per_request: 1000,
        }
    }
}

impl ReporterConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Billing collector URL; collection is disabled when unset.
    pub metric_collection_endpoint: Option<String>,
    #[serde(with = "humantime_serde")]
    pub metric_collection_interval: Duration,
    pub listen_http_addr: SocketAddr,
    pub remote_storage: Option<RemoteStorageConfig>,
    pub tenant_config: TenantConfig,
    pub reporter: ReporterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            metric_collection_endpoint: None,
            metric_collection_interval: Duration::from_secs(60),
            listen_http_addr: SocketAddr::from(([127, 0, 0, 1], 9898)),
            remote_storage: None,
            tenant_config: TenantConfig::default(),
            reporter: ReporterConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ServerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(endpoint) = &self.metric_collection_endpoint {
            let scheme_ok = reqwest::Url::parse(endpoint)
                .map(|url| matches!(url.scheme(), "http" | "https"))
                .unwrap_or(false);
            if !scheme_ok {
                return Err(ConfigError::InvalidEndpoint(endpoint.clone()));
            }
        }
        if self.metric_collection_interval.is_zero() {
            return Err(ConfigError::ZeroCollectionInterval);
        }
        if self.reporter.max_events_per_request == 0 {
            return Err(ConfigError::ZeroEventsPerRequest);
        }
        if self.tenant_config.layer_target_size == 0 {
            return Err(ConfigError::ZeroLayerSize);
        }
        Ok(())
    }

    pub fn collection_enabled(&self) -> bool {
        self.metric_collection_endpoint.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ServerConfig::default();
        assert!(config.metric_collection_endpoint.is_none());
        assert!(!config.collection_enabled());
        assert_eq!(config.metric_collection_interval, Duration::from_secs(60));
        assert_eq!(config.listen_http_addr, SocketAddr::from(([127, 0, 0, 1], 9898)));
        assert!(config.remote_storage.is_none());
        assert_eq!(config.tenant_config.gc_period, Duration::from_secs(100));
        assert_eq!(config.tenant_config.gc_horizon, 64 * 1024 * 1024);
        assert_eq!(config.reporter.max_retries, 3);
        assert_eq!(config.reporter.max_events_per_request, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
metric_collection_endpoint = "http://127.0.0.1:8080/billing/api/v1/usage_events"
metric_collection_interval = "10s"

[tenant_config]
gc_horizon = 196608
gc_period = "0s"
pitr_interval = "0sec"

[reporter]
max_retries = 5
initial_backoff = "50ms"
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert!(config.collection_enabled());
        assert_eq!(config.metric_collection_interval, Duration::from_secs(10));
        assert_eq!(config.tenant_config.gc_horizon, 0x30000);
        assert_eq!(config.tenant_config.gc_period, Duration::ZERO);
        assert_eq!(config.tenant_config.pitr_interval, Duration::ZERO);
        assert_eq!(config.tenant_config.layer_target_size, DEFAULT_LAYER_TARGET_SIZE);
        assert_eq!(config.reporter.max_retries, 5);
        assert_eq!(config.reporter.initial_backoff, Duration::from_millis(50));
        assert_eq!(config.reporter.max_backoff, Duration::from_secs(30));
        assert!(!config.tenant_config.retention_policy().periodic_gc_enabled());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "listen_http_addr": "0.0.0.0:7000",
                "remote_storage": {{ "bucket": "usage" }},
                "tenant_config": {{ "pitr_interval": "7 days" }}
            }}"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.listen_http_addr, SocketAddr::from(([0, 0, 0, 0], 7000)));
        assert_eq!(config.remote_storage.unwrap().bucket, "usage");
        assert_eq!(config.tenant_config.pitr_interval, Duration::from_secs(7 * 86400));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ServerConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_rejects_non_http_endpoint() {
        let config = ServerConfig {
            metric_collection_endpoint: Some("ftp://billing".to_string()),
            ..ServerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint("ftp://billing".to_string()))
        );

        let config = ServerConfig {
            metric_collection_endpoint: Some("not a url".to_string()),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let config = ServerConfig {
            metric_collection_interval: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroCollectionInterval));
    }

    #[test]
    fn test_retry_config_mirrors_reporter_settings() {
        let reporter = ReporterConfig {
            max_retries: 0,
            jitter: false,
            ..ReporterConfig::default()
        };
        let retry = reporter.retry_config();
        assert_eq!(retry.max_retries, 0);
        assert!(!retry.jitter);
        assert_eq!(retry.max_backoff, Duration::from_secs(30));
    }
}
