//! [`LocalFileSystem`]: object store backed by a local directory tree.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use common::KeyToolsError;
use tokio::{fs, io::AsyncWriteExt};

use super::{is_hidden, ObjectStore};

/// Local-disk object store. `rename` maps to `rename(2)`, which replaces the
/// destination atomically on the same filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

fn storage_error(op: &str, path: &Path, e: std::io::Error) -> KeyToolsError {
    KeyToolsError::Storage(format!("{op} {}: {e}", path.display()))
}

#[async_trait]
impl ObjectStore for LocalFileSystem {
    async fn list_visible(&self, folder: &Path) -> Result<Vec<PathBuf>, KeyToolsError> {
        let mut dir = fs::read_dir(folder)
            .await
            .map_err(|e| storage_error("list", folder, e))?;
        let mut out = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| storage_error("list", folder, e))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| storage_error("stat", &path, e))?;
            if file_type.is_file() && !is_hidden(&path) {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    async fn read(&self, path: &Path) -> Result<Option<Bytes>, KeyToolsError> {
        match fs::read(path).await {
            Ok(contents) => Ok(Some(Bytes::from(contents))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("read", path, e)),
        }
    }

    async fn write(&self, path: &Path, contents: Bytes) -> Result<(), KeyToolsError> {
        let mut file = fs::File::create(path)
            .await
            .map_err(|e| storage_error("create", path, e))?;
        file.write_all(&contents)
            .await
            .map_err(|e| storage_error("write", path, e))?;
        // Durable before anyone renames it into place.
        file.sync_all()
            .await
            .map_err(|e| storage_error("sync", path, e))
    }

    async fn delete(&self, path: &Path) -> Result<(), KeyToolsError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error("delete", path, e)),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), KeyToolsError> {
        fs::rename(from, to)
            .await
            .map_err(|e| storage_error("rename", from, e))
    }
}
