//! Decrypt path: key metadata in, data key out.
//!
//! # Flow
//!
//! 1. Key metadata is either the serialised [`KeyMaterial`] itself, or a
//!    [`KeyReference`] naming a record in the bound key-material store.
//! 2. The KMS client is resolved once per unwrapper: instance id and URL come
//!    from configuration first and from the key material otherwise.
//! 3. Single wrapping: one KMS unwrap of the DEK.
//! 4. Double wrapping: the KEK is looked up in the token's KEK cache bucket
//!    (one KMS unwrap on a miss), then the DEK is unwrapped locally with the
//!    decoded KEK id as AAD.

use std::{sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{protocol::KeyMaterial, KeyReference, KeyToolsError};
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use crate::config::KeyToolsConfig;
use crate::crypto::{unwrap_key_locally, KeyBytes, KeyWithMasterId};
use crate::kms::{self, KmsClientRef, KmsConnection};
use crate::material::KeyMaterialStore;
use crate::toolkit::KeyToolkit;

struct ResolvedKms {
    connection: KmsConnection,
    client: KmsClientRef,
}

/// Resolves data keys for one file read (or one rotation pass).
///
/// Safe to share across tasks: every method takes `&self`.
pub struct KeyUnwrapper {
    toolkit: KeyToolkit,
    config: KeyToolsConfig,
    material_store: Option<Arc<dyn KeyMaterialStore>>,
    access_token: String,
    cache_lifetime: Duration,
    kms: OnceCell<ResolvedKms>,
}

impl KeyUnwrapper {
    /// Construction validates `config` and runs the throttled expiry sweep
    /// of the shared caches.
    pub async fn new(
        toolkit: KeyToolkit,
        config: KeyToolsConfig,
        material_store: Option<Arc<dyn KeyMaterialStore>>,
    ) -> Result<Self, KeyToolsError> {
        config.validate()?;
        let cache_lifetime = config.cache_lifetime();
        toolkit.registry().sweep_expired(cache_lifetime).await;
        Ok(Self {
            access_token: config.access_token().to_owned(),
            toolkit,
            config,
            material_store,
            cache_lifetime,
            kms: OnceCell::new(),
        })
    }

    /// The KMS connection this unwrapper settled on, once a key was resolved.
    pub fn kms_connection(&self) -> Option<&KmsConnection> {
        self.kms.get().map(|k| &k.connection)
    }

    /// Resolve the data key described by `key_metadata` (the bytes stored in
    /// the file for one key).
    ///
    /// # Errors
    ///
    /// - [`KeyToolsError::MaterialNotFound`] if the referenced key id is absent from the store.
    /// - [`KeyToolsError::MalformedMaterial`] on unparsable metadata or a wrong protocol tag.
    /// - [`KeyToolsError::KmsConfigMissing`] if no KMS instance id or URL is known.
    /// - [`KeyToolsError::UnwrapFailed`] if the KMS returns an empty key.
    /// - Whatever the KMS client reports, e.g. [`KeyToolsError::AccessDenied`].
    pub async fn resolve_data_key(&self, key_metadata: &[u8]) -> Result<KeyWithMasterId, KeyToolsError> {
        let text = std::str::from_utf8(key_metadata)
            .map_err(|e| KeyToolsError::MalformedMaterial(format!("key metadata is not UTF-8: {e}")))?;

        let material = match &self.material_store {
            Some(store) => {
                let reference = KeyReference::parse(text)?;
                store
                    .get_key_material(&reference.key_id_in_file)
                    .await?
                    .ok_or(KeyToolsError::MaterialNotFound(reference.key_id_in_file))?
            }
            None => text.to_owned(),
        };

        self.unwrap_material(&material).await
    }

    /// Unwrap one serialised key-material record.
    #[instrument(skip_all, fields(master_key_id, double_wrapping))]
    pub async fn unwrap_material(&self, key_material: &str) -> Result<KeyWithMasterId, KeyToolsError> {
        let material = KeyMaterial::parse(key_material)?;
        let span = tracing::Span::current();
        span.record("master_key_id", material.master_key_id.as_str());
        span.record("double_wrapping", material.double_wrapping);

        let client = &self.kms_client(&material).await?.client;
        let master_key_id = material.master_key_id.as_str();

        let data_key = if !material.double_wrapping {
            let dek = kms::unwrap_key(client.as_ref(), &material.wrapped_dek, master_key_id).await?;
            if dek.is_empty() {
                return Err(KeyToolsError::UnwrapFailed(format!(
                    "empty data key after unwrapping in KMS with master key {master_key_id}"
                )));
            }
            dek
        } else {
            let (kek_id, wrapped_kek) = match (&material.kek_id, &material.wrapped_kek) {
                (Some(id), Some(wrapped)) => (id.as_str(), wrapped.as_str()),
                _ => {
                    return Err(KeyToolsError::MalformedMaterial(
                        "double-wrapped key material without KEK".into(),
                    ))
                }
            };
            let kek = self.kek(client, kek_id, wrapped_kek, master_key_id).await?;
            let aad = STANDARD
                .decode(kek_id)
                .map_err(|e| KeyToolsError::MalformedMaterial(format!("KEK id is not base64: {e}")))?;
            KeyBytes::new(unwrap_key_locally(&material.wrapped_dek, kek.as_slice(), &aad)?)
        };

        Ok(KeyWithMasterId::new(data_key, master_key_id))
    }

    /// KEK for `kek_id` from this token's bucket, unwrapped in the KMS on a miss.
    async fn kek(
        &self,
        client: &KmsClientRef,
        kek_id: &str,
        wrapped_kek: &str,
        master_key_id: &str,
    ) -> Result<KeyBytes, KeyToolsError> {
        let bucket = self
            .toolkit
            .registry()
            .kek_cache()
            .bucket(&self.access_token, self.cache_lifetime)
            .await;
        let slot = bucket.slot(kek_id).await;
        let kek = slot
            .get_or_try_init(|| async {
                debug!(kek_id, "KEK cache miss; unwrapping in KMS");
                let kek = kms::unwrap_key(client.as_ref(), wrapped_kek, master_key_id).await?;
                if kek.is_empty() {
                    return Err(KeyToolsError::UnwrapFailed(format!(
                        "empty KEK after unwrapping in KMS with master key {master_key_id}"
                    )));
                }
                Ok(kek)
            })
            .await?;
        Ok(kek.clone())
    }

    async fn kms_client(&self, material: &KeyMaterial) -> Result<&ResolvedKms, KeyToolsError> {
        self.kms
            .get_or_try_init(|| async {
                let connection = self.connection_for(material)?;
                debug!(
                    kms_instance_id = %connection.kms_instance_id,
                    kms_instance_url = %connection.kms_instance_url,
                    "resolving KMS client"
                );
                let client = kms::get_or_create_client(
                    self.toolkit.registry(),
                    self.toolkit.kms_factory().as_ref(),
                    &self.config,
                    &connection,
                )
                .await?;
                Ok(ResolvedKms { connection, client })
            })
            .await
    }

    /// Configuration wins over key material; the result is kept for every
    /// later key of this unwrapper.
    fn connection_for(&self, material: &KeyMaterial) -> Result<KmsConnection, KeyToolsError> {
        let kms_instance_id = self
            .config
            .configured_kms_instance_id()
            .or(material.kms_instance_id.as_deref())
            .ok_or_else(|| {
                KeyToolsError::KmsConfigMissing(
                    "KMS instance ID is missing both in configuration and file key material".into(),
                )
            })?;
        let kms_instance_url = self
            .config
            .configured_kms_instance_url()
            .or(material.kms_instance_url.as_deref())
            .ok_or_else(|| {
                KeyToolsError::KmsConfigMissing(
                    "KMS instance URL is missing both in configuration and file key material".into(),
                )
            })?;
        // Column key material does not carry the instance; later unwrappers
        // built from this configuration pick it up from here.
        self.config.remember_kms_instance(kms_instance_id, kms_instance_url);
        Ok(KmsConnection {
            kms_instance_id: kms_instance_id.to_owned(),
            kms_instance_url: kms_instance_url.to_owned(),
            key_access_token: self.access_token.clone(),
        })
    }
}
