//! Configuration for logfed

mod daemon;
mod index;
mod logging;
mod proxy;
mod queue;

pub use daemon::{HttpConfig, ProcessorConfig};
pub use index::{IndexConfig, MAX_RETENTION_HOURS};
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use proxy::{ProxyConfig, SearchMode};
pub use queue::{NatsConfig, QueueBackend, QueueConfig};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration for a logfed instance or proxy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Shard naming, retention and indexing retry policy
    #[serde(default)]
    pub index: IndexConfig,
    /// HTTP API server configuration
    #[serde(default)]
    pub http: HttpConfig,
    /// Log processor configuration
    #[serde(default)]
    pub processor: ProcessorConfig,
    /// Ingest queue configuration
    #[serde(default)]
    pub queue: QueueConfig,
    /// Sharding proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML (used by `logfed init`)
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate all configuration fields.
    ///
    /// Collects all validation errors and reports them together.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // Index validation
        if self.index.base_prefix.as_os_str().is_empty() {
            errors.push("index base_prefix must not be empty".to_string());
        }
        if self.index.retention_hours == 0 {
            errors.push("retention_hours must be at least 1".to_string());
        }
        if self.index.retention_hours > MAX_RETENTION_HOURS {
            errors.push(format!(
                "retention_hours must be at most {} (got {})",
                MAX_RETENTION_HOURS, self.index.retention_hours
            ));
        }
        if self.index.open_timeout_secs == 0 {
            errors.push("open_timeout_secs must be positive".to_string());
        }
        if self.index.retry_attempts == 0 {
            errors.push("retry_attempts must be positive".to_string());
        }

        // HTTP validation
        if let Err(e) = self.http.listen_addr.parse::<std::net::SocketAddr>() {
            errors.push(format!("invalid http listen_addr '{}': {}", self.http.listen_addr, e));
        }
        if self.http.shutdown_deadline_secs == 0 {
            errors.push("shutdown_deadline_secs must be positive".to_string());
        }

        // Processor validation
        if self.processor.max_concurrency == 0 {
            errors.push("processor max_concurrency must be positive".to_string());
        }

        // Queue validation
        if self.queue.capacity == 0 {
            errors.push("queue capacity must be positive".to_string());
        }
        if self.queue.backend == QueueBackend::Nats {
            if self.queue.nats.url.is_empty() {
                errors.push("queue.nats.url must not be empty".to_string());
            }
            if self.queue.nats.subject.is_empty() {
                errors.push("queue.nats.subject must not be empty".to_string());
            }
            if self.queue.nats.stream.is_empty() {
                errors.push("queue.nats.stream must not be empty".to_string());
            }
        }

        // Proxy validation
        if self.proxy.virtual_nodes == 0 {
            errors.push("proxy virtual_nodes must be positive".to_string());
        }
        for backend in &self.proxy.backends {
            if !backend.starts_with("http://") && !backend.starts_with("https://") {
                errors.push(format!("proxy backend '{}' must be an http(s) URL", backend));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config::default()
    }

    #[test]
    fn default_config_passes_validation() {
        assert!(valid_config().validate().is_ok(), "default config should be valid");
    }

    #[test]
    fn validate_rejects_oversized_retention() {
        let mut cfg = valid_config();
        cfg.index.retention_hours = u64::MAX;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("retention_hours must be at most"));
        assert_eq!(
            cfg.index.retention(),
            chrono::Duration::hours(MAX_RETENTION_HOURS as i64)
        );
    }

    #[test]
    fn validate_rejects_zero_retention() {
        let mut cfg = valid_config();
        cfg.index.retention_hours = 0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("retention_hours"));
    }

    #[test]
    fn validate_collects_multiple_errors() {
        let mut cfg = valid_config();
        cfg.index.retry_attempts = 0;
        cfg.processor.max_concurrency = 0;
        cfg.http.listen_addr = "not-an-address".to_string();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("retry_attempts"));
        assert!(err.contains("max_concurrency"));
        assert!(err.contains("listen_addr"));
    }

    #[test]
    fn validate_rejects_non_http_backend() {
        let mut cfg = valid_config();
        cfg.proxy.backends = vec!["localhost:8082".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [index]
            base_prefix = "data/logs"
            retention_hours = 48

            [queue]
            backend = "nats"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.index.retention_hours, 48);
        assert_eq!(cfg.index.retry_attempts, 3);
        assert_eq!(cfg.queue.backend, QueueBackend::Nats);
        assert_eq!(cfg.queue.nats.subject, "logs.ingest");
        assert_eq!(cfg.proxy.search_mode, SearchMode::Merge);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let cfg = valid_config();
        let text = cfg.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.http.listen_addr, cfg.http.listen_addr);
    }
}
