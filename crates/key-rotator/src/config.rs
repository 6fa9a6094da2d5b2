//! Configuration loading and validation for the key-rotator job.
//!
//! Key-tools settings (`KEYTOOLS_*`) are loaded separately by
//! [`keytools::KeyToolsConfig::from_env`].

use anyhow::{Context, Result};
use serde::Deserialize;

/// Validated key-rotator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Folder whose files are rotated. **Required.**
    pub rotation_folder: String,

    /// Tracing log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OTLP/gRPC endpoint for trace export. Logs only when unset.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build key-rotator configuration")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise key-rotator configuration")?;

        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        if self.rotation_folder.trim().is_empty() {
            anyhow::bail!("ROTATION_FOLDER is required and must not be empty");
        }
        if let Some(endpoint) = &self.otel_exporter_otlp_endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                anyhow::bail!("OTEL_EXPORTER_OTLP_ENDPOINT must be an http(s) URL, got {endpoint:?}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            rotation_folder: "/warehouse/table".into(),
            log_level: default_log_level(),
            otel_exporter_otlp_endpoint: None,
        }
    }

    #[test]
    fn defaults() {
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn validate_accepts_valid_config() {
        assert!(valid().validate().is_ok());
        let with_otlp = Config {
            otel_exporter_otlp_endpoint: Some("http://127.0.0.1:4317".into()),
            ..valid()
        };
        assert!(with_otlp.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_folder() {
        let cfg = Config {
            rotation_folder: "  ".into(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_url_endpoint() {
        let cfg = Config {
            otel_exporter_otlp_endpoint: Some("collector:4317".into()),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }
}
