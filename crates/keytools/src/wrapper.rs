//! Encrypt path: data key in, key metadata out.
//!
//! With double wrapping on, one KEK is generated per master key per token and
//! cache window. It is wrapped once by the KMS and every DEK under that
//! master key is wrapped locally with it, using the KEK id bytes as AAD.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{
    protocol::{
        KeyMaterial, COLUMN_KEY_ID_IN_FILE_PREFIX, DEFAULT_KMS_INSTANCE_ID,
        DEFAULT_KMS_INSTANCE_URL, FOOTER_KEY_ID_IN_FILE,
    },
    KeyReference, KeyToolsError,
};
use tracing::{debug, instrument};

use crate::config::KeyToolsConfig;
use crate::crypto::{
    cipher::KEK_ID_LEN, random_bytes, wrap_key_locally, KeyBytes,
};
use crate::kms::{self, KmsClientRef, KmsConnection};
use crate::material::KeyMaterialStore;
use crate::toolkit::KeyToolkit;

/// A generated KEK together with its id and its KMS-wrapped form.
#[derive(Clone)]
pub struct KeyEncryptionKey {
    bytes: KeyBytes,
    id: Vec<u8>,
    encoded_id: String,
    wrapped: String,
}

impl KeyEncryptionKey {
    pub fn bytes(&self) -> &KeyBytes {
        &self.bytes
    }

    /// Raw id bytes; the AAD of every DEK wrapped with this KEK.
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// Base64 id as written to `keyEncryptionKeyID`.
    pub fn encoded_id(&self) -> &str {
        &self.encoded_id
    }

    pub fn wrapped(&self) -> &str {
        &self.wrapped
    }
}

impl fmt::Debug for KeyEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEncryptionKey")
            .field("encoded_id", &self.encoded_id)
            .finish_non_exhaustive()
    }
}

/// Builds key metadata for one file write (or one rotated file).
pub struct KeyWrapper {
    toolkit: KeyToolkit,
    config: KeyToolsConfig,
    material_store: Option<Arc<dyn KeyMaterialStore>>,
    access_token: String,
    cache_lifetime: Duration,
    connection: KmsConnection,
    client: KmsClientRef,
    column_key_counter: AtomicUsize,
}

impl KeyWrapper {
    /// Resolves the KMS client up front. Instance id and URL fall back to the
    /// `DEFAULT` sentinels when not configured.
    pub async fn new(
        toolkit: KeyToolkit,
        config: KeyToolsConfig,
        material_store: Option<Arc<dyn KeyMaterialStore>>,
    ) -> Result<Self, KeyToolsError> {
        config.validate()?;
        let cache_lifetime = config.cache_lifetime();
        toolkit.registry().sweep_expired(cache_lifetime).await;

        let connection = KmsConnection {
            kms_instance_id: config
                .configured_kms_instance_id()
                .unwrap_or(DEFAULT_KMS_INSTANCE_ID)
                .to_owned(),
            kms_instance_url: config
                .configured_kms_instance_url()
                .unwrap_or(DEFAULT_KMS_INSTANCE_URL)
                .to_owned(),
            key_access_token: config.access_token().to_owned(),
        };
        let client = kms::get_or_create_client(
            toolkit.registry(),
            toolkit.kms_factory().as_ref(),
            &config,
            &connection,
        )
        .await?;

        Ok(Self {
            access_token: connection.key_access_token.clone(),
            toolkit,
            config,
            material_store,
            cache_lifetime,
            connection,
            client,
            column_key_counter: AtomicUsize::new(0),
        })
    }

    pub fn kms_connection(&self) -> &KmsConnection {
        &self.connection
    }

    /// Fresh random DEK of the configured length.
    pub fn generate_data_key(&self) -> KeyBytes {
        KeyBytes::new(random_bytes(self.config.dek_length_bytes))
    }

    /// Wrap `data_key` under `master_key_id` and return the bytes to embed in
    /// the file.
    ///
    /// Without a bound store that is the serialised key material. With one,
    /// the material is added to the store under `key_id_in_file` (or
    /// `footerKey` / a generated `columnKeyN`) and a serialised
    /// [`KeyReference`] is returned. The caller saves the store.
    #[instrument(skip_all, fields(master_key_id, is_footer_key, double_wrapping = self.config.double_wrapping))]
    pub async fn build_key_metadata(
        &self,
        data_key: &[u8],
        master_key_id: &str,
        is_footer_key: bool,
        key_id_in_file: Option<&str>,
    ) -> Result<Vec<u8>, KeyToolsError> {
        tracing::Span::current().record("master_key_id", master_key_id);
        tracing::Span::current().record("is_footer_key", is_footer_key);

        let material = if self.config.double_wrapping {
            let kek = self.kek_for(master_key_id).await?;
            let wrapped_dek = wrap_key_locally(data_key, kek.bytes().as_slice(), kek.id())?;
            KeyMaterial::double_wrapped(
                is_footer_key,
                master_key_id,
                wrapped_dek,
                kek.encoded_id(),
                kek.wrapped(),
            )
        } else {
            let wrapped_dek = kms::wrap_key(self.client.as_ref(), data_key, master_key_id).await?;
            KeyMaterial::single_wrapped(is_footer_key, master_key_id, wrapped_dek)
        };

        let mut material = material.with_internal_storage(self.material_store.is_none());
        if is_footer_key {
            material = material.with_kms_instance(
                self.connection.kms_instance_id.as_str(),
                self.connection.kms_instance_url.as_str(),
            );
        }
        let serialized = material.serialize()?;

        let Some(store) = &self.material_store else {
            return Ok(serialized.into_bytes());
        };

        let key_id = match key_id_in_file {
            Some(id) => id.to_owned(),
            None if is_footer_key => FOOTER_KEY_ID_IN_FILE.to_owned(),
            None => format!(
                "{COLUMN_KEY_ID_IN_FILE_PREFIX}{}",
                self.column_key_counter.fetch_add(1, Ordering::SeqCst)
            ),
        };
        store.add_key_material(&key_id, serialized).await?;
        debug!(key_id = %key_id, "key material added to store");
        Ok(KeyReference::new(key_id).serialize()?.into_bytes())
    }

    /// KEK for `master_key_id` from this token's write cache, generated and
    /// wrapped in the KMS on a miss.
    async fn kek_for(&self, master_key_id: &str) -> Result<KeyEncryptionKey, KeyToolsError> {
        let bucket = self
            .toolkit
            .registry()
            .write_kek_cache()
            .bucket(&self.access_token, self.cache_lifetime)
            .await;
        let slot = bucket.slot(master_key_id).await;
        let kek = slot
            .get_or_try_init(|| async {
                let bytes = KeyBytes::new(random_bytes(self.config.kek_length_bytes));
                let id = random_bytes(KEK_ID_LEN);
                let wrapped = kms::wrap_key(self.client.as_ref(), bytes.as_slice(), master_key_id).await?;
                debug!(master_key_id, "generated new KEK");
                Ok::<_, KeyToolsError>(KeyEncryptionKey {
                    encoded_id: STANDARD.encode(&id),
                    bytes,
                    id,
                    wrapped,
                })
            })
            .await?;
        Ok(kek.clone())
    }
}
