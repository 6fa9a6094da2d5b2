//! Common error types shared across crates.

use thiserror::Error;

/// Errors surfaced by the key-management layer.
///
/// None of these are retried internally. Callers can match on the variant to
/// tell a permission denial ([`KeyToolsError::AccessDenied`]) apart from an
/// infrastructure failure ([`KeyToolsError::Kms`], [`KeyToolsError::Storage`]).
#[derive(Debug, Error)]
pub enum KeyToolsError {
    /// The requested key id has no record in the key-material store.
    #[error("key material not found for key id in file: {0}")]
    MaterialNotFound(String),

    /// The key material (or key reference) could not be parsed, or carries the
    /// wrong protocol tag.
    #[error("malformed key material: {0}")]
    MalformedMaterial(String),

    /// Neither configuration nor key material names a KMS instance.
    #[error("KMS configuration missing: {0}")]
    KmsConfigMissing(String),

    /// The KMS denied the operation for the current principal.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The KMS returned an empty or invalid result for an authorised unwrap.
    #[error("unwrap failed: {0}")]
    UnwrapFailed(String),

    /// A KMS client was asked for a capability it does not implement.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// KMS transport or service failure that is not a permission problem.
    #[error("KMS failure: {0}")]
    Kms(String),

    /// Object-store I/O failure.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Local AEAD wrap/unwrap failure.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// A configuration value is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl KeyToolsError {
    /// Short machine-readable code, stable across releases. Safe to log.
    pub fn kind(&self) -> &'static str {
        match self {
            KeyToolsError::MaterialNotFound(_) => "material_not_found",
            KeyToolsError::MalformedMaterial(_) => "malformed_material",
            KeyToolsError::KmsConfigMissing(_) => "kms_config_missing",
            KeyToolsError::AccessDenied(_) => "access_denied",
            KeyToolsError::UnwrapFailed(_) => "unwrap_failed",
            KeyToolsError::Unsupported(_) => "unsupported",
            KeyToolsError::Kms(_) => "kms_failure",
            KeyToolsError::Storage(_) => "storage_failure",
            KeyToolsError::Crypto(_) => "crypto_failure",
            KeyToolsError::Config(_) => "invalid_config",
        }
    }

    /// Returns `true` for infrastructure failures a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeyToolsError::Kms(_) | KeyToolsError::Storage(_))
    }
}
