//! [`SharedCacheRegistry`]: the caches shared by every unwrapper and wrapper.

use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use tracing::info;

use super::TokenScopedCache;
use crate::crypto::KeyBytes;
use crate::kms::KmsClientRef;
use crate::wrapper::KeyEncryptionKey;

/// Owner of the token-scoped caches.
///
/// Pass one registry (in an `Arc`) to every component that should share
/// cached KEKs and KMS clients. Tests build an isolated registry per case;
/// hosts that do not care can use [`SharedCacheRegistry::global`].
pub struct SharedCacheRegistry {
    /// Read side: KEK id -> unwrapped KEK bytes.
    kek_cache: TokenScopedCache<KeyBytes>,
    /// KMS instance id -> live client.
    kms_client_cache: TokenScopedCache<KmsClientRef>,
    /// Write side: master key id -> generated KEK.
    write_kek_cache: TokenScopedCache<KeyEncryptionKey>,
}

impl SharedCacheRegistry {
    pub fn new() -> Self {
        Self {
            kek_cache: TokenScopedCache::new("kek"),
            kms_client_cache: TokenScopedCache::new("kms_client"),
            write_kek_cache: TokenScopedCache::new("write_kek"),
        }
    }

    /// Process-wide registry, created on first use.
    pub fn global() -> Arc<SharedCacheRegistry> {
        static GLOBAL: OnceLock<Arc<SharedCacheRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(SharedCacheRegistry::new())))
    }

    pub fn kek_cache(&self) -> &TokenScopedCache<KeyBytes> {
        &self.kek_cache
    }

    pub fn kms_client_cache(&self) -> &TokenScopedCache<KmsClientRef> {
        &self.kms_client_cache
    }

    pub fn write_kek_cache(&self) -> &TokenScopedCache<KeyEncryptionKey> {
        &self.write_kek_cache
    }

    /// Throttled sweep of expired token entries in every cache.
    pub async fn sweep_expired(&self, lifetime: Duration) {
        self.kek_cache.sweep_expired(lifetime).await;
        self.kms_client_cache.sweep_expired(lifetime).await;
        self.write_kek_cache.sweep_expired(lifetime).await;
    }

    /// Drop everything cached for one access token.
    pub async fn remove_cache_entries_for_token(&self, token: &str) {
        self.kek_cache.remove_token(token).await;
        self.kms_client_cache.remove_token(token).await;
        self.write_kek_cache.remove_token(token).await;
    }

    /// Drop everything cached for every token.
    pub async fn remove_cache_entries_for_all_tokens(&self) {
        self.kek_cache.clear().await;
        self.kms_client_cache.clear().await;
        self.write_kek_cache.clear().await;
        info!("cleared KEK and KMS client caches for all tokens");
    }
}

impl Default for SharedCacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}
