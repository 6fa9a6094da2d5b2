//! Shared fixtures for the keytools integration tests.

#![allow(dead_code)]

use std::{path::Path, sync::Arc};

use bytes::Bytes;
use common::protocol::FOOTER_KEY_ID_IN_FILE;
use keytools::{
    kms::{InMemoryKms, InMemoryKmsFactory},
    storage::InMemoryObjectStore,
    KeyMaterialStore, KeyReference, KeyToolkit, KeyToolsConfig, KeyToolsError, KeyWithMasterId,
    ObjectKeyMaterialStore, ObjectStore,
};

pub const KF: &[u8] = b"footer-master-k!";
pub const KF2: &[u8] = b"footer-master-2!";
pub const KC1: &[u8] = b"column-master-k1";
pub const KC2: &[u8] = b"column-master-k2";

pub const DEK_FOOTER: &[u8] = b"0123456789abcdef";
pub const DEK_COL1: &[u8] = b"fedcba9876543210";

/// In-memory KMS holding `kf`, `kf2`, `kc1` and `kc2`.
pub fn kms(server_side_wrapping: bool) -> Arc<InMemoryKms> {
    Arc::new(
        InMemoryKms::new(server_side_wrapping)
            .with_master_key("kf", KF)
            .with_master_key("kf2", KF2)
            .with_master_key("kc1", KC1)
            .with_master_key("kc2", KC2),
    )
}

/// Toolkit with an isolated cache registry over `kms`.
pub fn toolkit(kms: &Arc<InMemoryKms>) -> (KeyToolkit, Arc<InMemoryKmsFactory>) {
    let factory = Arc::new(InMemoryKmsFactory::new(Arc::clone(kms)));
    (KeyToolkit::new(Arc::clone(&factory) as _), factory)
}

pub fn material_store(objects: &InMemoryObjectStore, data_file: &str) -> Arc<dyn KeyMaterialStore> {
    Arc::new(ObjectKeyMaterialStore::open(
        Arc::new(objects.clone()),
        Path::new(data_file),
        false,
    ))
}

/// Write a data file object plus its external key material. `keys` holds
/// `(key id in file, master key id, data key)`.
pub async fn write_encrypted_file(
    objects: &InMemoryObjectStore,
    toolkit: &KeyToolkit,
    config: &KeyToolsConfig,
    data_file: &str,
    keys: &[(&str, &str, &[u8])],
) {
    objects
        .write(Path::new(data_file), Bytes::from_static(b"PAR1"))
        .await
        .unwrap();
    let store = material_store(objects, data_file);
    let wrapper = toolkit
        .key_wrapper(config.clone(), Some(Arc::clone(&store)))
        .await
        .unwrap();
    for (key_id, master_key_id, dek) in keys {
        wrapper
            .build_key_metadata(dek, master_key_id, *key_id == FOOTER_KEY_ID_IN_FILE, Some(*key_id))
            .await
            .unwrap();
    }
    store.save_material().await.unwrap();
}

/// Resolve `key_id` of `data_file` through a fresh unwrapper bound to the
/// file's primary material store.
pub async fn read_key(
    objects: &InMemoryObjectStore,
    toolkit: &KeyToolkit,
    config: &KeyToolsConfig,
    data_file: &str,
    key_id: &str,
) -> Result<KeyWithMasterId, KeyToolsError> {
    let unwrapper = toolkit
        .key_unwrapper(config.clone(), Some(material_store(objects, data_file)))
        .await?;
    let reference = KeyReference::new(key_id).serialize()?;
    unwrapper.resolve_data_key(reference.as_bytes()).await
}
