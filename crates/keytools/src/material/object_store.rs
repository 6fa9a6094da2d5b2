//! [`ObjectKeyMaterialStore`]: key material kept in one JSON object next to
//! the data file.
//!
//! For data file `<dir>/<name>` the primary object is
//! `<dir>/_KEY_MATERIAL_FOR_<name>.json` and the temporary one is
//! `<dir>/_TMP_KEY_MATERIAL_FOR_<name>.json`. Both names are hidden, so they
//! are never mistaken for data files. The object is a JSON map from key id
//! to serialised key material.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use common::KeyToolsError;
use tokio::sync::Mutex;
use tracing::debug;

use super::KeyMaterialStore;
use crate::storage::ObjectStore;

pub const KEY_MATERIAL_FILE_PREFIX: &str = "_KEY_MATERIAL_FOR_";
pub const TEMP_FILE_PREFIX: &str = "_TMP";
pub const KEY_MATERIAL_FILE_SUFFIX: &str = ".json";

pub struct ObjectKeyMaterialStore {
    objects: Arc<dyn ObjectStore>,
    path: PathBuf,
    temporary: bool,
    /// `None` until loaded from (or initialised for) the backing object.
    materials: Mutex<Option<BTreeMap<String, String>>>,
}

impl ObjectKeyMaterialStore {
    /// Bind a store to the material location of `data_file`.
    ///
    /// A temporary store starts empty and ignores any leftover temporary
    /// object from an earlier interrupted run.
    pub fn open(objects: Arc<dyn ObjectStore>, data_file: &Path, temporary: bool) -> Self {
        Self {
            objects,
            path: material_path(data_file, temporary),
            temporary,
            materials: Mutex::new(temporary.then(BTreeMap::new)),
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, KeyToolsError> {
        match self.objects.read(&self.path).await? {
            None => Ok(BTreeMap::new()),
            Some(raw) => serde_json::from_slice(&raw).map_err(|e| {
                KeyToolsError::MalformedMaterial(format!(
                    "failed to parse key material object {}: {e}",
                    self.path.display()
                ))
            }),
        }
    }

    /// Run `f` against the loaded map, loading it first if needed.
    async fn with_materials<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> T,
    ) -> Result<T, KeyToolsError> {
        let mut guard = self.materials.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        Ok(f(guard.get_or_insert_with(BTreeMap::new)))
    }
}

/// Material object location for `data_file`.
pub fn material_path(data_file: &Path, temporary: bool) -> PathBuf {
    let name = data_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = if temporary { TEMP_FILE_PREFIX } else { "" };
    let object_name = format!("{prefix}{KEY_MATERIAL_FILE_PREFIX}{name}{KEY_MATERIAL_FILE_SUFFIX}");
    match data_file.parent() {
        Some(parent) => parent.join(object_name),
        None => PathBuf::from(object_name),
    }
}

#[async_trait]
impl KeyMaterialStore for ObjectKeyMaterialStore {
    async fn add_key_material(&self, key_id_in_file: &str, material: String) -> Result<(), KeyToolsError> {
        self.with_materials(|m| {
            m.insert(key_id_in_file.to_owned(), material);
        })
        .await
    }

    async fn get_key_material(&self, key_id_in_file: &str) -> Result<Option<String>, KeyToolsError> {
        self.with_materials(|m| m.get(key_id_in_file).cloned()).await
    }

    async fn save_material(&self) -> Result<(), KeyToolsError> {
        let serialized = self
            .with_materials(|m| serde_json::to_vec(&*m))
            .await?
            .map_err(|e| KeyToolsError::Storage(format!("failed to serialise key material: {e}")))?;
        self.objects.write(&self.path, Bytes::from(serialized)).await?;
        debug!(path = %self.path.display(), "key material saved");
        Ok(())
    }

    async fn key_id_set(&self) -> Result<BTreeSet<String>, KeyToolsError> {
        self.with_materials(|m| m.keys().cloned().collect()).await
    }

    async fn remove_material(&self) -> Result<(), KeyToolsError> {
        self.objects.delete(&self.path).await?;
        *self.materials.lock().await = None;
        debug!(path = %self.path.display(), "key material removed");
        Ok(())
    }

    async fn move_material_to(&self, target: &dyn KeyMaterialStore) -> Result<(), KeyToolsError> {
        self.objects.rename(&self.path, target.storage_path()).await?;
        debug!(
            from = %self.path.display(),
            to = %target.storage_path().display(),
            "key material moved"
        );
        Ok(())
    }

    fn storage_path(&self) -> &Path {
        &self.path
    }
}
