//! Envelope-encryption key management for encrypted columnar files.
//!
//! - [`KeyUnwrapper`] turns the key metadata stored in a file back into a
//!   data key, caching KEKs per access token.
//! - [`KeyWrapper`] produces key metadata for new data keys.
//! - [`KeyRotationTool`] re-wraps every key of every file in a folder and
//!   swaps the new material in atomically.
//!
//! All three are built from a [`KeyToolkit`], which holds the shared caches
//! and the KMS client factory.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod kms;
pub mod material;
pub mod rotation;
pub mod storage;
pub mod toolkit;
pub mod unwrapper;
pub mod wrapper;

pub use cache::SharedCacheRegistry;
pub use common::{KeyMaterial, KeyReference, KeyToolsError};
pub use config::KeyToolsConfig;
pub use crypto::{KeyBytes, KeyWithMasterId};
pub use kms::{KmsClient, KmsClientFactory, KmsConnection};
pub use material::{KeyMaterialStore, ObjectKeyMaterialStore};
pub use rotation::{KeyRotationTool, RotationSummary};
pub use storage::{LocalFileSystem, ObjectStore};
pub use toolkit::KeyToolkit;
pub use unwrapper::KeyUnwrapper;
pub use wrapper::{KeyEncryptionKey, KeyWrapper};
