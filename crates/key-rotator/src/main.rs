//! `key-rotator`: master key rotation job.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] and [`KeyToolsConfig`] from environment variables.
//! 2. Initialise telemetry (JSON logs, plus OTLP traces when an endpoint is set).
//! 3. Rotate the key material of every file in `ROTATION_FOLDER` via AWS KMS.

mod config;
mod telemetry;

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use keytools::{
    kms::AwsKmsClientFactory, KeyToolkit, KeyToolsConfig, LocalFileSystem, SharedCacheRegistry,
};
use tracing::{error, info};

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: key-rotator configuration invalid: {e}");
        e
    })?;
    let key_tools = KeyToolsConfig::from_env().map_err(|e| {
        eprintln!("ERROR: key-tools configuration invalid: {e}");
        anyhow::Error::from(e)
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        folder = %cfg.rotation_folder,
        "key-rotator starting"
    );

    // -----------------------------------------------------------------------
    // 3. Rotation
    // -----------------------------------------------------------------------
    let toolkit = KeyToolkit::with_registry(
        Arc::new(AwsKmsClientFactory),
        SharedCacheRegistry::global(),
    );
    let result = toolkit
        .rotation_tool(Arc::new(LocalFileSystem::new()))
        .rotate_master_keys(Path::new(&cfg.rotation_folder), &key_tools)
        .await;

    let outcome = match result {
        Ok(summary) => {
            info!(
                files_rotated = summary.files_rotated,
                keys_rotated = summary.keys_rotated,
                files_skipped = summary.files_skipped.len(),
                "key-rotator finished"
            );
            Ok(())
        }
        Err(e) => {
            error!(kind = e.kind(), error = %e, retryable = e.is_retryable(), "rotation failed");
            Err(e).with_context(|| format!("failed to rotate master keys in {}", cfg.rotation_folder))
        }
    };

    telemetry::shutdown();
    outcome
}
