//! Per-file persistence of key-material records, keyed by in-file key id.
//!
//! A store is created fresh per file per access and bound to one data file.
//! The temporary variant lives at a distinct side location so rotation can
//! build new material next to the old and swap it in with one rename.

pub mod object_store;

pub use object_store::ObjectKeyMaterialStore;

use std::{collections::BTreeSet, path::Path};

use async_trait::async_trait;
use common::KeyToolsError;

#[async_trait]
pub trait KeyMaterialStore: Send + Sync {
    /// Insert or overwrite one record in memory. Last write wins.
    async fn add_key_material(&self, key_id_in_file: &str, material: String) -> Result<(), KeyToolsError>;

    /// The record for `key_id_in_file`, or `None` if the store has none.
    async fn get_key_material(&self, key_id_in_file: &str) -> Result<Option<String>, KeyToolsError>;

    /// Persist every in-memory record to the bound location.
    async fn save_material(&self) -> Result<(), KeyToolsError>;

    /// All key ids known to the store, loading from the backing location if needed.
    async fn key_id_set(&self) -> Result<BTreeSet<String>, KeyToolsError>;

    /// Delete the backing location. The store is stale afterwards.
    async fn remove_material(&self) -> Result<(), KeyToolsError>;

    /// Atomically replace `target`'s backing location with this store's.
    /// This store is stale afterwards.
    async fn move_material_to(&self, target: &dyn KeyMaterialStore) -> Result<(), KeyToolsError>;

    /// Physical location of the backing object.
    fn storage_path(&self) -> &Path;
}
