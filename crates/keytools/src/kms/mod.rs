//! KMS client capability, client construction, and the token-scoped client cache.
//!
//! Two kinds of client exist:
//! - server-side wrapping: the KMS wraps and unwraps keys itself and master
//!   keys never leave it;
//! - local wrapping only: the master key is fetched with
//!   [`KmsClient::get_key_from_server`] and keys are wrapped in-process, with
//!   the master key id as AAD.
//!
//! [`wrap_key`] and [`unwrap_key`] dispatch on the capability flag so callers
//! do not care which kind they hold.

pub mod aws;
pub mod memory;

pub use aws::{AwsKmsClient, AwsKmsClientFactory};
pub use memory::{InMemoryKms, InMemoryKmsFactory};

use std::sync::Arc;

use async_trait::async_trait;
use common::KeyToolsError;
use tracing::debug;

use crate::cache::SharedCacheRegistry;
use crate::config::KeyToolsConfig;
use crate::crypto::{unwrap_key_locally, wrap_key_locally, KeyBytes};

/// Shared handle to a live KMS client.
pub type KmsClientRef = Arc<dyn KmsClient>;

/// Operations a KMS client offers.
///
/// Implementations must report permission problems as
/// [`KeyToolsError::AccessDenied`] and everything else from the transport as
/// [`KeyToolsError::Kms`], never as an opaque error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KmsClient: Send + Sync {
    /// `true` if the KMS wraps and unwraps keys server-side.
    fn supports_server_side_wrapping(&self) -> bool;

    /// Fetch a raw key from the KMS. Only needed for local wrapping.
    ///
    /// # Errors
    ///
    /// [`KeyToolsError::Unsupported`] if the client never releases keys,
    /// [`KeyToolsError::AccessDenied`] if the caller may not read the key.
    async fn get_key_from_server(&self, key_identifier: &str) -> Result<KeyBytes, KeyToolsError>;

    /// Wrap `data_key` with the master key inside the KMS. Returns the opaque
    /// wrapped text as produced by the KMS.
    async fn wrap_data_key_in_server(
        &self,
        data_key: &[u8],
        master_key_identifier: &str,
    ) -> Result<String, KeyToolsError>;

    /// Unwrap a key previously produced by [`KmsClient::wrap_data_key_in_server`].
    async fn unwrap_data_key_in_server(
        &self,
        wrapped_data_key: &str,
        master_key_identifier: &str,
    ) -> Result<KeyBytes, KeyToolsError>;
}

/// Identity of a KMS instance plus the principal talking to it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KmsConnection {
    pub kms_instance_id: String,
    pub kms_instance_url: String,
    pub key_access_token: String,
}

impl std::fmt::Debug for KmsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsConnection")
            .field("kms_instance_id", &self.kms_instance_id)
            .field("kms_instance_url", &self.kms_instance_url)
            .field("key_access_token", &"[REDACTED]")
            .finish()
    }
}

/// Builds and initialises KMS clients on a cache miss.
#[async_trait]
pub trait KmsClientFactory: Send + Sync {
    async fn create_client(
        &self,
        config: &KeyToolsConfig,
        connection: &KmsConnection,
    ) -> Result<KmsClientRef, KeyToolsError>;
}

/// Cached client for `connection`, created through `factory` on a miss.
///
/// Clients are cached per access token and keyed by KMS instance id; the
/// factory runs at most once per key even under concurrent callers.
pub async fn get_or_create_client(
    registry: &SharedCacheRegistry,
    factory: &dyn KmsClientFactory,
    config: &KeyToolsConfig,
    connection: &KmsConnection,
) -> Result<KmsClientRef, KeyToolsError> {
    let bucket = registry
        .kms_client_cache()
        .bucket(&connection.key_access_token, config.cache_lifetime())
        .await;
    let slot = bucket.slot(&connection.kms_instance_id).await;
    let client = slot
        .get_or_try_init(|| async {
            debug!(kms_instance_id = %connection.kms_instance_id, "creating KMS client");
            factory.create_client(config, connection).await
        })
        .await?;
    Ok(Arc::clone(client))
}

/// Wrap `key` under `master_key_id`, in the KMS or locally.
pub async fn wrap_key(
    client: &dyn KmsClient,
    key: &[u8],
    master_key_id: &str,
) -> Result<String, KeyToolsError> {
    if client.supports_server_side_wrapping() {
        return client.wrap_data_key_in_server(key, master_key_id).await;
    }
    let master_key = client.get_key_from_server(master_key_id).await?;
    Ok(wrap_key_locally(key, master_key.as_slice(), master_key_id.as_bytes())?)
}

/// Unwrap `wrapped` under `master_key_id`, in the KMS or locally.
pub async fn unwrap_key(
    client: &dyn KmsClient,
    wrapped: &str,
    master_key_id: &str,
) -> Result<KeyBytes, KeyToolsError> {
    if client.supports_server_side_wrapping() {
        return client.unwrap_data_key_in_server(wrapped, master_key_id).await;
    }
    let master_key = client.get_key_from_server(master_key_id).await?;
    Ok(KeyBytes::new(unwrap_key_locally(
        wrapped,
        master_key.as_slice(),
        master_key_id.as_bytes(),
    )?))
}
