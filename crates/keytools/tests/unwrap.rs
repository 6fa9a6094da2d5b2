mod support;

use std::{sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::protocol::FOOTER_KEY_ID_IN_FILE;
use keytools::{
    kms::InMemoryKms, storage::InMemoryObjectStore, KeyMaterial, KeyToolkit, KeyToolsConfig,
    KeyToolsError,
};
use support::*;

fn config() -> KeyToolsConfig {
    KeyToolsConfig::default().with_kms_instance("kms-1", "https://kms.example.com")
}

/// Inline key metadata for `dek` under `master_key_id`.
async fn inline_metadata(
    toolkit: &KeyToolkit,
    config: &KeyToolsConfig,
    dek: &[u8],
    master_key_id: &str,
    is_footer_key: bool,
) -> Vec<u8> {
    toolkit
        .key_wrapper(config.clone(), None)
        .await
        .unwrap()
        .build_key_metadata(dek, master_key_id, is_footer_key, None)
        .await
        .unwrap()
}

#[tokio::test]
async fn double_wrapped_round_trip() {
    let kms = kms(true);
    let (toolkit, _) = toolkit(&kms);
    let metadata = inline_metadata(&toolkit, &config(), DEK_COL1, "kc1", false).await;

    let unwrapper = toolkit.key_unwrapper(config(), None).await.unwrap();
    let key = unwrapper.resolve_data_key(&metadata).await.unwrap();
    assert_eq!(key.data_key.as_slice(), DEK_COL1);
    assert_eq!(key.master_key_id, "kc1");
}

#[tokio::test]
async fn single_wrapped_round_trip() {
    let kms = kms(true);
    let (toolkit, _) = toolkit(&kms);
    let config = config().with_double_wrapping(false);
    let metadata = inline_metadata(&toolkit, &config, DEK_FOOTER, "kf", true).await;

    let unwrapper = toolkit.key_unwrapper(config, None).await.unwrap();
    let key = unwrapper.resolve_data_key(&metadata).await.unwrap();
    assert_eq!(key.data_key.as_slice(), DEK_FOOTER);
    assert_eq!(kms.unwrap_calls(), 1);
}

#[tokio::test]
async fn local_wrapping_kms_round_trip() {
    let kms = kms(false);
    let (toolkit, _) = toolkit(&kms);
    for double_wrapping in [true, false] {
        let config = config().with_double_wrapping(double_wrapping);
        let metadata = inline_metadata(&toolkit, &config, DEK_COL1, "kc2", false).await;
        let key = toolkit
            .key_unwrapper(config, None)
            .await
            .unwrap()
            .resolve_data_key(&metadata)
            .await
            .unwrap();
        assert_eq!(key.data_key.as_slice(), DEK_COL1);
    }
    assert_eq!(kms.unwrap_calls(), 0);
    assert!(kms.key_fetches() >= 2);
}

#[tokio::test]
async fn external_store_resolves_references() {
    let kms = kms(true);
    let (toolkit, _) = toolkit(&kms);
    let objects = InMemoryObjectStore::new();
    write_encrypted_file(
        &objects,
        &toolkit,
        &config(),
        "/data/part-0.parquet",
        &[(FOOTER_KEY_ID_IN_FILE, "kf", DEK_FOOTER), ("col-1", "kc1", DEK_COL1)],
    )
    .await;

    let footer = read_key(&objects, &toolkit, &config(), "/data/part-0.parquet", FOOTER_KEY_ID_IN_FILE)
        .await
        .unwrap();
    assert_eq!(footer.data_key.as_slice(), DEK_FOOTER);
    let column = read_key(&objects, &toolkit, &config(), "/data/part-0.parquet", "col-1")
        .await
        .unwrap();
    assert_eq!(column.data_key.as_slice(), DEK_COL1);
    assert_eq!(column.master_key_id, "kc1");

    assert!(matches!(
        read_key(&objects, &toolkit, &config(), "/data/part-0.parquet", "col-9").await,
        Err(KeyToolsError::MaterialNotFound(id)) if id == "col-9"
    ));
}

#[tokio::test]
async fn kms_instance_missing_everywhere_is_config_error() {
    let kms = kms(true);
    let (toolkit, _) = toolkit(&kms);
    // Column material does not record the KMS instance.
    let metadata = inline_metadata(&toolkit, &KeyToolsConfig::default(), DEK_COL1, "kc1", false).await;

    let unwrapper = toolkit.key_unwrapper(KeyToolsConfig::default(), None).await.unwrap();
    let err = unwrapper.resolve_data_key(&metadata).await.unwrap_err();
    assert!(matches!(err, KeyToolsError::KmsConfigMissing(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn configured_kms_instance_wins_over_material() {
    let kms = kms(true);
    let (toolkit, factory) = toolkit(&kms);
    let write_config = KeyToolsConfig::default().with_kms_instance("kms-west", "https://west");
    let metadata = inline_metadata(&toolkit, &write_config, DEK_FOOTER, "kf", true).await;

    // Material alone: the unwrapper adopts the recorded instance.
    let from_material = toolkit.key_unwrapper(KeyToolsConfig::default(), None).await.unwrap();
    from_material.resolve_data_key(&metadata).await.unwrap();
    assert_eq!(
        from_material.kms_connection().map(|c| c.kms_instance_id.as_str()),
        Some("kms-west")
    );

    // Configuration present: it overrides the material.
    let east = KeyToolsConfig::default().with_kms_instance("kms-east", "https://east");
    let from_config = toolkit.key_unwrapper(east, None).await.unwrap();
    from_config.resolve_data_key(&metadata).await.unwrap();
    let connection = from_config.kms_connection().unwrap();
    assert_eq!(connection.kms_instance_id, "kms-east");
    assert_eq!(connection.kms_instance_url, "https://east");
    assert!(factory
        .connections()
        .iter()
        .any(|c| c.kms_instance_id == "kms-east"));
}

#[tokio::test(start_paused = true)]
async fn kek_cache_expires_after_lifetime() {
    let kms = kms(true);
    let (toolkit, _) = toolkit(&kms);
    let config = config().with_cache_lifetime(Duration::from_secs(60));
    let metadata = inline_metadata(&toolkit, &config, DEK_COL1, "kc1", false).await;

    let unwrapper = toolkit.key_unwrapper(config.clone(), None).await.unwrap();
    unwrapper.resolve_data_key(&metadata).await.unwrap();
    unwrapper.resolve_data_key(&metadata).await.unwrap();
    assert_eq!(kms.unwrap_calls(), 1);

    tokio::time::advance(Duration::from_secs(59)).await;
    unwrapper.resolve_data_key(&metadata).await.unwrap();
    assert_eq!(kms.unwrap_calls(), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    let key = unwrapper.resolve_data_key(&metadata).await.unwrap();
    assert_eq!(key.data_key.as_slice(), DEK_COL1);
    assert_eq!(kms.unwrap_calls(), 2);
}

#[tokio::test]
async fn kek_cache_is_scoped_by_token() {
    let kms = kms(true);
    let (toolkit, _) = toolkit(&kms);
    let metadata = inline_metadata(&toolkit, &config(), DEK_COL1, "kc1", false).await;
    let material = KeyMaterial::parse(std::str::from_utf8(&metadata).unwrap()).unwrap();
    let kek_id = material.kek_id.unwrap();

    let alice = toolkit.key_unwrapper(config().with_access_token("alice"), None).await.unwrap();
    alice.resolve_data_key(&metadata).await.unwrap();
    assert!(toolkit.registry().kek_cache().contains("alice", &kek_id).await);
    assert!(!toolkit.registry().kek_cache().contains("bob", &kek_id).await);

    let bob = toolkit.key_unwrapper(config().with_access_token("bob"), None).await.unwrap();
    bob.resolve_data_key(&metadata).await.unwrap();
    assert_eq!(kms.unwrap_calls(), 2);

    toolkit.registry().remove_cache_entries_for_token("alice").await;
    assert!(!toolkit.registry().kek_cache().contains("alice", &kek_id).await);
    assert!(toolkit.registry().kek_cache().contains("bob", &kek_id).await);
}

#[tokio::test]
async fn altered_kek_id_fails_authentication() {
    let kms = kms(true);
    let (toolkit, _) = toolkit(&kms);
    let metadata = inline_metadata(&toolkit, &config(), DEK_COL1, "kc1", false).await;
    let mut material = KeyMaterial::parse(std::str::from_utf8(&metadata).unwrap()).unwrap();
    material.kek_id = Some(STANDARD.encode(b"some-other-kekid"));
    let tampered = material.serialize().unwrap();

    let unwrapper = toolkit.key_unwrapper(config(), None).await.unwrap();
    assert!(matches!(
        unwrapper.resolve_data_key(tampered.as_bytes()).await,
        Err(KeyToolsError::Crypto(_))
    ));
}

#[tokio::test]
async fn wrong_material_type_is_rejected() {
    let kms = kms(true);
    let (toolkit, _) = toolkit(&kms);
    let metadata = inline_metadata(&toolkit, &config(), DEK_COL1, "kc1", false).await;
    let tampered = String::from_utf8(metadata).unwrap().replace("PKMT1", "PKMT9");

    let unwrapper = toolkit.key_unwrapper(config(), None).await.unwrap();
    assert!(matches!(
        unwrapper.resolve_data_key(tampered.as_bytes()).await,
        Err(KeyToolsError::MalformedMaterial(_))
    ));
    assert_eq!(kms.unwrap_calls(), 0);
}

#[tokio::test]
async fn access_denied_is_propagated() {
    let kms = kms(true);
    let (writer, _) = toolkit(&kms);
    let metadata = inline_metadata(&writer, &config(), DEK_COL1, "kc1", false).await;

    // A KMS that knows none of the master keys.
    let (reader, _) = toolkit(&Arc::new(InMemoryKms::new(true)));
    let err = reader
        .key_unwrapper(config(), None)
        .await
        .unwrap()
        .resolve_data_key(&metadata)
        .await
        .unwrap_err();
    assert!(matches!(err, KeyToolsError::AccessDenied(_)));
    assert!(!err.is_retryable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cold_cache_unwraps_call_kms_once() {
    let kms = kms(true);
    let (toolkit, _) = toolkit(&kms);
    let metadata = inline_metadata(&toolkit, &config(), DEK_COL1, "kc1", false).await;
    let unwrapper = Arc::new(toolkit.key_unwrapper(config(), None).await.unwrap());

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let unwrapper = Arc::clone(&unwrapper);
            let metadata = metadata.clone();
            tokio::spawn(async move { unwrapper.resolve_data_key(&metadata).await })
        })
        .collect();

    for task in tasks {
        let key = task.await.unwrap().unwrap();
        assert_eq!(key.data_key.as_slice(), DEK_COL1);
    }
    assert_eq!(kms.unwrap_calls(), 1);
}

#[tokio::test]
async fn column_key_reuses_kms_instance_learned_from_footer() {
    let kms = kms(true);
    let (toolkit, factory) = toolkit(&kms);
    let objects = InMemoryObjectStore::new();
    let write_config = KeyToolsConfig::default().with_kms_instance("kms-west", "https://west");
    write_encrypted_file(
        &objects,
        &toolkit,
        &write_config,
        "/data/part-0.parquet",
        &[(FOOTER_KEY_ID_IN_FILE, "kf", DEK_FOOTER), ("col-1", "kc1", DEK_COL1)],
    )
    .await;

    // The reader knows nothing about the KMS; only the footer material does.
    let read_config = KeyToolsConfig::default();
    let footer = read_key(&objects, &toolkit, &read_config, "/data/part-0.parquet", FOOTER_KEY_ID_IN_FILE)
        .await
        .unwrap();
    assert_eq!(footer.data_key.as_slice(), DEK_FOOTER);

    // A second, fresh unwrapper reads a column key that carries no instance.
    let column = read_key(&objects, &toolkit, &read_config, "/data/part-0.parquet", "col-1")
        .await
        .unwrap();
    assert_eq!(column.data_key.as_slice(), DEK_COL1);
    assert_eq!(read_config.configured_kms_instance_id(), Some("kms-west"));
    assert!(factory
        .connections()
        .iter()
        .all(|c| c.kms_instance_id == "kms-west"));
}

#[tokio::test]
async fn sub_second_cache_lifetime_is_rejected() {
    let kms = kms(true);
    let (toolkit, _) = toolkit(&kms);
    let config = config().with_cache_lifetime(Duration::from_millis(500));

    assert!(matches!(
        toolkit.key_unwrapper(config.clone(), None).await,
        Err(KeyToolsError::Config(_))
    ));
    assert!(matches!(
        toolkit.key_wrapper(config, None).await,
        Err(KeyToolsError::Config(_))
    ));
}
