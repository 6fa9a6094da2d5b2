//! [`InMemoryKms`]: a KMS whose master keys live in process memory.
//!
//! Useful for tests, demos and local development. It can act as either kind
//! of client: server-side wrapping (keys never released) or local wrapping
//! only (keys released through `get_key_from_server`).

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use common::KeyToolsError;

use super::{KmsClient, KmsClientFactory, KmsClientRef, KmsConnection};
use crate::config::KeyToolsConfig;
use crate::crypto::{unwrap_key_locally, wrap_key_locally, KeyBytes};

pub struct InMemoryKms {
    master_keys: HashMap<String, KeyBytes>,
    server_side_wrapping: bool,
    unwrap_calls: AtomicUsize,
    wrap_calls: AtomicUsize,
    key_fetches: AtomicUsize,
}

impl InMemoryKms {
    /// A KMS with no master keys. `server_side_wrapping` picks the client kind.
    pub fn new(server_side_wrapping: bool) -> Self {
        Self {
            master_keys: HashMap::new(),
            server_side_wrapping,
            unwrap_calls: AtomicUsize::new(0),
            wrap_calls: AtomicUsize::new(0),
            key_fetches: AtomicUsize::new(0),
        }
    }

    /// Register a master key (16 or 32 bytes).
    pub fn with_master_key(mut self, id: impl Into<String>, key: &[u8]) -> Self {
        self.master_keys.insert(id.into(), KeyBytes::from(key));
        self
    }

    /// Number of server-side unwraps served.
    pub fn unwrap_calls(&self) -> usize {
        self.unwrap_calls.load(Ordering::SeqCst)
    }

    /// Number of server-side wraps served.
    pub fn wrap_calls(&self) -> usize {
        self.wrap_calls.load(Ordering::SeqCst)
    }

    /// Number of master keys released through `get_key_from_server`.
    pub fn key_fetches(&self) -> usize {
        self.key_fetches.load(Ordering::SeqCst)
    }

    fn master_key(&self, id: &str) -> Result<&KeyBytes, KeyToolsError> {
        self.master_keys
            .get(id)
            .ok_or_else(|| KeyToolsError::AccessDenied(format!("master key '{id}' is not accessible")))
    }

    fn require_server_side(&self, op: &str) -> Result<(), KeyToolsError> {
        if self.server_side_wrapping {
            Ok(())
        } else {
            Err(KeyToolsError::Unsupported(format!(
                "{op}: this KMS only supports local wrapping"
            )))
        }
    }
}

#[async_trait]
impl KmsClient for InMemoryKms {
    fn supports_server_side_wrapping(&self) -> bool {
        self.server_side_wrapping
    }

    async fn get_key_from_server(&self, key_identifier: &str) -> Result<KeyBytes, KeyToolsError> {
        if self.server_side_wrapping {
            return Err(KeyToolsError::Unsupported(
                "get_key_from_server: master keys never leave this KMS".into(),
            ));
        }
        tokio::task::yield_now().await;
        let key = self.master_key(key_identifier)?.clone();
        self.key_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(key)
    }

    async fn wrap_data_key_in_server(
        &self,
        data_key: &[u8],
        master_key_identifier: &str,
    ) -> Result<String, KeyToolsError> {
        self.require_server_side("wrap_data_key_in_server")?;
        tokio::task::yield_now().await;
        let master_key = self.master_key(master_key_identifier)?;
        self.wrap_calls.fetch_add(1, Ordering::SeqCst);
        Ok(wrap_key_locally(
            data_key,
            master_key.as_slice(),
            master_key_identifier.as_bytes(),
        )?)
    }

    async fn unwrap_data_key_in_server(
        &self,
        wrapped_data_key: &str,
        master_key_identifier: &str,
    ) -> Result<KeyBytes, KeyToolsError> {
        self.require_server_side("unwrap_data_key_in_server")?;
        // Stand-in for the network round trip.
        tokio::task::yield_now().await;
        let master_key = self.master_key(master_key_identifier)?;
        self.unwrap_calls.fetch_add(1, Ordering::SeqCst);
        let key = unwrap_key_locally(
            wrapped_data_key,
            master_key.as_slice(),
            master_key_identifier.as_bytes(),
        )
        .map_err(|e| KeyToolsError::Kms(format!("KMS rejected wrapped key: {e}")))?;
        Ok(KeyBytes::new(key))
    }
}

/// Factory that hands out one shared [`InMemoryKms`] and records every
/// connection it was asked to create a client for.
pub struct InMemoryKmsFactory {
    kms: Arc<InMemoryKms>,
    connections: std::sync::Mutex<Vec<KmsConnection>>,
}

impl InMemoryKmsFactory {
    pub fn new(kms: Arc<InMemoryKms>) -> Self {
        Self {
            kms,
            connections: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn kms(&self) -> &Arc<InMemoryKms> {
        &self.kms
    }

    /// Connections passed to `create_client`, in call order.
    pub fn connections(&self) -> Vec<KmsConnection> {
        self.connections
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl KmsClientFactory for InMemoryKmsFactory {
    async fn create_client(
        &self,
        _config: &KeyToolsConfig,
        connection: &KmsConnection,
    ) -> Result<KmsClientRef, KeyToolsError> {
        if let Ok(mut seen) = self.connections.lock() {
            seen.push(connection.clone());
        }
        Ok(Arc::clone(&self.kms) as KmsClientRef)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KF: &[u8] = b"0123456789012345";

    #[tokio::test]
    async fn server_side_round_trip() {
        let kms = InMemoryKms::new(true).with_master_key("kf", KF);
        let wrapped = kms.wrap_data_key_in_server(b"abcdefghijklmnop", "kf").await.unwrap();
        let key = kms.unwrap_data_key_in_server(&wrapped, "kf").await.unwrap();
        assert_eq!(key.as_slice(), b"abcdefghijklmnop");
        assert_eq!(kms.wrap_calls(), 1);
        assert_eq!(kms.unwrap_calls(), 1);
        assert!(matches!(
            kms.get_key_from_server("kf").await,
            Err(KeyToolsError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn local_only_refuses_server_side_calls() {
        let kms = InMemoryKms::new(false).with_master_key("kf", KF);
        assert!(matches!(
            kms.wrap_data_key_in_server(b"k", "kf").await,
            Err(KeyToolsError::Unsupported(_))
        ));
        assert!(matches!(
            kms.unwrap_data_key_in_server("x", "kf").await,
            Err(KeyToolsError::Unsupported(_))
        ));
        assert_eq!(kms.get_key_from_server("kf").await.unwrap().as_slice(), KF);
        assert_eq!(kms.key_fetches(), 1);
    }

    #[tokio::test]
    async fn unknown_master_key_is_access_denied() {
        let kms = InMemoryKms::new(true);
        assert!(matches!(
            kms.wrap_data_key_in_server(b"k", "nope").await,
            Err(KeyToolsError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn factory_records_connections() {
        let factory = InMemoryKmsFactory::new(Arc::new(InMemoryKms::new(true)));
        let conn = KmsConnection {
            kms_instance_id: "kms-1".into(),
            kms_instance_url: "https://kms".into(),
            key_access_token: "t".into(),
        };
        factory
            .create_client(&KeyToolsConfig::default(), &conn)
            .await
            .unwrap();
        assert_eq!(factory.connections(), vec![conn]);
    }
}
