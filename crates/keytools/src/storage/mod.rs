//! Hierarchical object storage used to persist key-material objects.
//!
//! This is the only filesystem dependency of the crate. Implementations must
//! make [`ObjectStore::rename`] replace the destination atomically: a reader
//! sees either the old or the new object, never a mix or a gap.

pub mod local;
pub mod memory;

pub use local::LocalFileSystem;
pub use memory::InMemoryObjectStore;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use common::KeyToolsError;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Objects directly under `folder` whose name is not hidden, sorted.
    async fn list_visible(&self, folder: &Path) -> Result<Vec<PathBuf>, KeyToolsError>;

    /// Contents of `path`, or `None` if it does not exist.
    async fn read(&self, path: &Path) -> Result<Option<Bytes>, KeyToolsError>;

    /// Create or overwrite `path`.
    async fn write(&self, path: &Path, contents: Bytes) -> Result<(), KeyToolsError>;

    /// Delete `path`. Deleting a missing object is not an error.
    async fn delete(&self, path: &Path) -> Result<(), KeyToolsError>;

    /// Move `from` to `to`, atomically replacing any existing `to`.
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), KeyToolsError>;
}

/// Names starting with `_` or `.` are hidden: key-material objects, temp
/// objects, and dot-files never count as data files.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('_') || n.starts_with('.'))
}
