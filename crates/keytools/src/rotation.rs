//! Master key rotation over a folder of encrypted files.
//!
//! Each file is handled on its own: every key is unwrapped from the primary
//! material store, re-wrapped into a temporary store next to it, and the
//! temporary object then replaces the primary with one atomic rename. A
//! failure before the rename leaves the primary untouched.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use common::{protocol::FOOTER_KEY_ID_IN_FILE, KeyToolsError};
use tracing::{info, instrument, warn};

use crate::config::KeyToolsConfig;
use crate::crypto::KeyWithMasterId;
use crate::material::{KeyMaterialStore, ObjectKeyMaterialStore};
use crate::storage::ObjectStore;
use crate::toolkit::KeyToolkit;

/// Outcome of one [`KeyRotationTool::rotate_master_keys`] run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RotationSummary {
    pub files_rotated: usize,
    pub keys_rotated: usize,
    /// Visible objects without key material.
    pub files_skipped: Vec<PathBuf>,
}

pub struct KeyRotationTool {
    toolkit: KeyToolkit,
    objects: Arc<dyn ObjectStore>,
}

impl KeyRotationTool {
    pub fn new(toolkit: KeyToolkit, objects: Arc<dyn ObjectStore>) -> Self {
        Self { toolkit, objects }
    }

    /// Rotate the key material of every visible file directly under `folder`.
    ///
    /// Files are processed in listing order. Master key ids are remapped with
    /// [`KeyToolsConfig::master_key_mapping`]; unmapped keys are re-wrapped
    /// under the same id. All caches are cleared after every rotated file.
    ///
    /// # Errors
    ///
    /// Stops at the first file that fails. Files already rotated stay rotated
    /// and re-running the tool is safe.
    pub async fn rotate_master_keys(
        &self,
        folder: &Path,
        config: &KeyToolsConfig,
    ) -> Result<RotationSummary, KeyToolsError> {
        config.validate()?;
        let mapping = config.master_key_mapping()?;
        let registry = self.toolkit.registry();

        // Cached KEKs may predate the master key change being rolled out.
        registry.remove_cache_entries_for_all_tokens().await;

        let mut summary = RotationSummary::default();
        for data_file in self.objects.list_visible(folder).await? {
            match self.rotate_file(&data_file, config, &mapping).await? {
                0 => summary.files_skipped.push(data_file),
                keys => {
                    summary.files_rotated += 1;
                    summary.keys_rotated += keys;
                    registry.remove_cache_entries_for_all_tokens().await;
                }
            }
        }

        info!(
            folder = %folder.display(),
            files_rotated = summary.files_rotated,
            keys_rotated = summary.keys_rotated,
            files_skipped = summary.files_skipped.len(),
            "master key rotation finished"
        );
        Ok(summary)
    }

    /// Rotate one file. Returns the number of keys re-wrapped; 0 means the
    /// file has no key material.
    #[instrument(skip_all, fields(file = %data_file.display()))]
    async fn rotate_file(
        &self,
        data_file: &Path,
        config: &KeyToolsConfig,
        mapping: &HashMap<String, String>,
    ) -> Result<usize, KeyToolsError> {
        let source: Arc<dyn KeyMaterialStore> = Arc::new(ObjectKeyMaterialStore::open(
            Arc::clone(&self.objects),
            data_file,
            false,
        ));
        let key_ids = source.key_id_set().await?;
        if key_ids.is_empty() {
            warn!("no key material found; skipping");
            return Ok(0);
        }

        // The footer key carries the KMS instance, so it goes first.
        let mut ordered: Vec<&String> = key_ids.iter().collect();
        ordered.sort_by_key(|id| id.as_str() != FOOTER_KEY_ID_IN_FILE);

        let unwrapper = self
            .toolkit
            .key_unwrapper(config.clone(), Some(Arc::clone(&source)))
            .await?;
        let mut keys: Vec<(&str, KeyWithMasterId)> = Vec::with_capacity(ordered.len());
        for key_id in ordered {
            let material = source
                .get_key_material(key_id)
                .await?
                .ok_or_else(|| KeyToolsError::MaterialNotFound(key_id.clone()))?;
            keys.push((key_id.as_str(), unwrapper.unwrap_material(&material).await?));
        }

        // New footer material must name the same KMS instance the old one did.
        let mut wrap_config = config.clone();
        if let Some(connection) = unwrapper.kms_connection() {
            if wrap_config.configured_kms_instance_id().is_none() {
                wrap_config.kms_instance_id = Some(connection.kms_instance_id.clone());
            }
            if wrap_config.configured_kms_instance_url().is_none() {
                wrap_config.kms_instance_url = Some(connection.kms_instance_url.clone());
            }
        }

        let temp = Arc::new(ObjectKeyMaterialStore::open(
            Arc::clone(&self.objects),
            data_file,
            true,
        ));
        let rewrapped = self.rewrap_into(&temp, wrap_config, &keys, mapping).await;
        if let Err(err) = rewrapped {
            if let Err(cleanup) = temp.remove_material().await {
                warn!(error = %cleanup, "failed to remove temporary key material");
            }
            return Err(err);
        }

        temp.move_material_to(source.as_ref()).await?;
        info!(keys = keys.len(), "rotated key material");
        Ok(keys.len())
    }

    async fn rewrap_into(
        &self,
        temp: &Arc<ObjectKeyMaterialStore>,
        config: KeyToolsConfig,
        keys: &[(&str, KeyWithMasterId)],
        mapping: &HashMap<String, String>,
    ) -> Result<(), KeyToolsError> {
        let target: Arc<dyn KeyMaterialStore> = Arc::clone(temp) as Arc<dyn KeyMaterialStore>;
        let wrapper = self.toolkit.key_wrapper(config, Some(target)).await?;
        for (key_id, key) in keys {
            let master_key_id = mapping
                .get(&key.master_key_id)
                .unwrap_or(&key.master_key_id);
            wrapper
                .build_key_metadata(
                    key.data_key.as_slice(),
                    master_key_id,
                    *key_id == FOOTER_KEY_ID_IN_FILE,
                    Some(*key_id),
                )
                .await?;
        }
        temp.save_material().await
    }
}
