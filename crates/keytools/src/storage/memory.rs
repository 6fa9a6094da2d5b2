//! [`InMemoryObjectStore`]: object store held in process memory.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use common::KeyToolsError;
use tokio::sync::Mutex;

use super::{is_hidden, ObjectStore};

/// Objects keyed by full path. Cloning shares the same objects.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<PathBuf, Bytes>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All object paths, hidden ones included.
    pub async fn paths(&self) -> Vec<PathBuf> {
        self.objects.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn list_visible(&self, folder: &Path) -> Result<Vec<PathBuf>, KeyToolsError> {
        let objects = self.objects.lock().await;
        Ok(objects
            .keys()
            .filter(|p| p.parent() == Some(folder) && !is_hidden(p))
            .cloned()
            .collect())
    }

    async fn read(&self, path: &Path) -> Result<Option<Bytes>, KeyToolsError> {
        Ok(self.objects.lock().await.get(path).cloned())
    }

    async fn write(&self, path: &Path, contents: Bytes) -> Result<(), KeyToolsError> {
        self.objects.lock().await.insert(path.to_path_buf(), contents);
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<(), KeyToolsError> {
        self.objects.lock().await.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), KeyToolsError> {
        // One lock for remove + insert: readers never see neither object.
        let mut objects = self.objects.lock().await;
        let contents = objects.remove(from).ok_or_else(|| {
            KeyToolsError::Storage(format!("rename {}: no such object", from.display()))
        })?;
        objects.insert(to.to_path_buf(), contents);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rename_replaces_destination() {
        let store = InMemoryObjectStore::new();
        let from = Path::new("/t/_tmp");
        let to = Path::new("/t/_primary");
        store.write(from, Bytes::from_static(b"new")).await.unwrap();
        store.write(to, Bytes::from_static(b"old")).await.unwrap();

        store.rename(from, to).await.unwrap();
        assert_eq!(store.read(to).await.unwrap().unwrap(), Bytes::from_static(b"new"));
        assert!(store.read(from).await.unwrap().is_none());
        assert!(store.rename(from, to).await.is_err());
    }

    #[tokio::test]
    async fn lists_direct_visible_children_only() {
        let store = InMemoryObjectStore::new();
        for p in ["/t/a", "/t/_hidden", "/t/sub/b", "/other/c"] {
            store.write(Path::new(p), Bytes::from_static(b"x")).await.unwrap();
        }
        assert_eq!(
            store.list_visible(Path::new("/t")).await.unwrap(),
            vec![PathBuf::from("/t/a")]
        );
    }
}
