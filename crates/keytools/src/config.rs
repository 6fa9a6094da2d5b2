//! Configuration surface consumed by the unwrap, wrap and rotation paths.
//!
//! Values are read from `KEYTOOLS_*` environment variables, or built in code
//! with the `with_*` setters.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
    time::Duration,
};

use common::{protocol::DEFAULT_ACCESS_TOKEN, KeyToolsError};
use serde::Deserialize;

/// Validated key-tools configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyToolsConfig {
    /// Access token identifying the caller to the KMS. Also scopes the caches.
    #[serde(default = "default_access_token")]
    pub key_access_token: String,

    /// Lifetime (seconds) of cached KEKs and KMS clients for one token.
    #[serde(default = "default_cache_lifetime")]
    pub cache_lifetime_secs: u64,

    /// KMS instance id. Overrides the id stored in key material.
    #[serde(default)]
    pub kms_instance_id: Option<String>,

    /// KMS instance URL. Overrides the URL stored in key material.
    #[serde(default)]
    pub kms_instance_url: Option<String>,

    /// Write-side policy: wrap DEKs with a per-master-key KEK.
    #[serde(default = "default_double_wrapping")]
    pub double_wrapping: bool,

    /// Length of generated KEKs (16 or 32).
    #[serde(default = "default_key_length")]
    pub kek_length_bytes: usize,

    /// Length of generated DEKs (16 or 32).
    #[serde(default = "default_key_length")]
    pub dek_length_bytes: usize,

    /// Master key remapping applied by rotation, as `old=new` pairs separated
    /// by commas. Unmapped keys are re-wrapped under their current id.
    #[serde(default)]
    pub master_key_rotation: Option<String>,

    /// KMS instance learned from key material at runtime. Shared by every
    /// clone of this configuration.
    #[serde(skip)]
    pub resolved_kms_instance: ResolvedKmsInstance,
}

/// Write-once KMS instance id and URL, shared between configuration clones.
#[derive(Debug, Clone, Default)]
pub struct ResolvedKmsInstance(Arc<ResolvedKmsCells>);

#[derive(Debug, Default)]
struct ResolvedKmsCells {
    id: OnceLock<String>,
    url: OnceLock<String>,
}

fn default_access_token() -> String {
    DEFAULT_ACCESS_TOKEN.into()
}
fn default_cache_lifetime() -> u64 {
    600
}
fn default_double_wrapping() -> bool {
    true
}
fn default_key_length() -> usize {
    16
}

impl Default for KeyToolsConfig {
    fn default() -> Self {
        Self {
            key_access_token: default_access_token(),
            cache_lifetime_secs: default_cache_lifetime(),
            kms_instance_id: None,
            kms_instance_url: None,
            double_wrapping: default_double_wrapping(),
            kek_length_bytes: default_key_length(),
            dek_length_bytes: default_key_length(),
            master_key_rotation: None,
            resolved_kms_instance: ResolvedKmsInstance::default(),
        }
    }
}

impl KeyToolsConfig {
    /// Load and validate configuration from `KEYTOOLS_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`KeyToolsError::Config`] if a variable cannot be parsed or a
    /// value fails validation.
    pub fn from_env() -> Result<Self, KeyToolsError> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::with_prefix("KEYTOOLS").try_parsing(true))
            .build()
            .map_err(|e| KeyToolsError::Config(format!("failed to build key-tools configuration: {e}")))?;

        let c: KeyToolsConfig = cfg
            .try_deserialize()
            .map_err(|e| KeyToolsError::Config(format!("failed to deserialise key-tools configuration: {e}")))?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    pub fn validate(&self) -> Result<(), KeyToolsError> {
        if self.key_access_token.trim().is_empty() {
            return Err(KeyToolsError::Config(
                "KEYTOOLS_KEY_ACCESS_TOKEN must not be empty".into(),
            ));
        }
        if self.cache_lifetime_secs == 0 {
            return Err(KeyToolsError::Config(
                "KEYTOOLS_CACHE_LIFETIME_SECS must be > 0".into(),
            ));
        }
        for (name, len) in [
            ("KEYTOOLS_KEK_LENGTH_BYTES", self.kek_length_bytes),
            ("KEYTOOLS_DEK_LENGTH_BYTES", self.dek_length_bytes),
        ] {
            if len != 16 && len != 32 {
                return Err(KeyToolsError::Config(format!("{name} must be 16 or 32, got {len}")));
            }
        }
        self.master_key_mapping()?;
        Ok(())
    }

    pub fn cache_lifetime(&self) -> Duration {
        Duration::from_secs(self.cache_lifetime_secs)
    }

    /// Access token with surrounding whitespace removed.
    pub fn access_token(&self) -> &str {
        self.key_access_token.trim()
    }

    /// Configured KMS instance id, ignoring blank values. Falls back to the
    /// id recorded with [`KeyToolsConfig::remember_kms_instance`].
    pub fn configured_kms_instance_id(&self) -> Option<&str> {
        non_blank(self.kms_instance_id.as_deref())
            .or_else(|| self.resolved_kms_instance.0.id.get().map(String::as_str))
    }

    /// Configured KMS instance URL, ignoring blank values. Falls back to the
    /// URL recorded with [`KeyToolsConfig::remember_kms_instance`].
    pub fn configured_kms_instance_url(&self) -> Option<&str> {
        non_blank(self.kms_instance_url.as_deref())
            .or_else(|| self.resolved_kms_instance.0.url.get().map(String::as_str))
    }

    /// Record the KMS instance resolved from key material so that every clone
    /// of this configuration reuses it. Values already set are kept.
    pub fn remember_kms_instance(&self, id: &str, url: &str) {
        let cells = &self.resolved_kms_instance.0;
        if self.configured_kms_instance_id().is_none() {
            let _ = cells.id.set(id.to_owned());
        }
        if self.configured_kms_instance_url().is_none() {
            let _ = cells.url.set(url.to_owned());
        }
    }

    /// Parse [`KeyToolsConfig::master_key_rotation`] into an `old -> new` map.
    ///
    /// # Errors
    ///
    /// Returns [`KeyToolsError::Config`] on a pair without `=` or with an empty side.
    pub fn master_key_mapping(&self) -> Result<HashMap<String, String>, KeyToolsError> {
        let Some(raw) = non_blank(self.master_key_rotation.as_deref()) else {
            return Ok(HashMap::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((old, new)) if !old.trim().is_empty() && !new.trim().is_empty() => {
                    Ok((old.trim().to_owned(), new.trim().to_owned()))
                }
                _ => Err(KeyToolsError::Config(format!(
                    "invalid master key rotation pair '{pair}', expected old=new"
                ))),
            })
            .collect()
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.key_access_token = token.into();
        self
    }

    /// Whole seconds only; sub-second parts are dropped, so a lifetime under
    /// one second fails [`KeyToolsConfig::validate`].
    pub fn with_cache_lifetime(mut self, lifetime: Duration) -> Self {
        self.cache_lifetime_secs = lifetime.as_secs();
        self
    }

    pub fn with_kms_instance(mut self, id: impl Into<String>, url: impl Into<String>) -> Self {
        self.kms_instance_id = Some(id.into());
        self.kms_instance_url = Some(url.into());
        self
    }

    pub fn with_double_wrapping(mut self, double_wrapping: bool) -> Self {
        self.double_wrapping = double_wrapping;
        self
    }

    /// Add one `old=new` pair to the rotation remapping.
    pub fn with_master_key_rotation(mut self, old: &str, new: &str) -> Self {
        let pair = format!("{old}={new}");
        self.master_key_rotation = Some(match self.master_key_rotation.take() {
            Some(existing) if !existing.trim().is_empty() => format!("{existing},{pair}"),
            _ => pair,
        });
        self
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
