//! [`KeyToolkit`]: the shared context every unwrapper, wrapper and rotation
//! run is built from.

use std::sync::Arc;

use common::KeyToolsError;

use crate::cache::SharedCacheRegistry;
use crate::config::KeyToolsConfig;
use crate::kms::KmsClientFactory;
use crate::material::KeyMaterialStore;
use crate::rotation::KeyRotationTool;
use crate::storage::ObjectStore;
use crate::unwrapper::KeyUnwrapper;
use crate::wrapper::KeyWrapper;

/// Cache registry plus KMS client factory.
///
/// Cheap to clone; clones share the same caches.
#[derive(Clone)]
pub struct KeyToolkit {
    registry: Arc<SharedCacheRegistry>,
    kms_factory: Arc<dyn KmsClientFactory>,
}

impl KeyToolkit {
    /// Toolkit with its own, isolated cache registry.
    pub fn new(kms_factory: Arc<dyn KmsClientFactory>) -> Self {
        Self::with_registry(kms_factory, Arc::new(SharedCacheRegistry::new()))
    }

    pub fn with_registry(
        kms_factory: Arc<dyn KmsClientFactory>,
        registry: Arc<SharedCacheRegistry>,
    ) -> Self {
        Self {
            registry,
            kms_factory,
        }
    }

    pub fn registry(&self) -> &Arc<SharedCacheRegistry> {
        &self.registry
    }

    pub fn kms_factory(&self) -> &Arc<dyn KmsClientFactory> {
        &self.kms_factory
    }

    /// Decrypt-path retriever. `material_store` is `None` when key material
    /// travels inline in the file metadata.
    pub async fn key_unwrapper(
        &self,
        config: KeyToolsConfig,
        material_store: Option<Arc<dyn KeyMaterialStore>>,
    ) -> Result<KeyUnwrapper, KeyToolsError> {
        KeyUnwrapper::new(self.clone(), config, material_store).await
    }

    /// Encrypt-path metadata builder.
    pub async fn key_wrapper(
        &self,
        config: KeyToolsConfig,
        material_store: Option<Arc<dyn KeyMaterialStore>>,
    ) -> Result<KeyWrapper, KeyToolsError> {
        KeyWrapper::new(self.clone(), config, material_store).await
    }

    pub fn rotation_tool(&self, objects: Arc<dyn ObjectStore>) -> KeyRotationTool {
        KeyRotationTool::new(self.clone(), objects)
    }
}
