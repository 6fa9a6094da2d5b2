//! AWS KMS binding: server-side wrapping through `Encrypt` / `Decrypt`.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kms::{
    config::Region,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::Blob,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{
    protocol::{DEFAULT_KMS_INSTANCE_ID, DEFAULT_KMS_INSTANCE_URL},
    KeyToolsError,
};
use tracing::debug;

use super::{KmsClient, KmsClientFactory, KmsClientRef, KmsConnection};
use crate::config::KeyToolsConfig;
use crate::crypto::KeyBytes;

/// Error codes AWS uses for authentication and authorisation failures.
const ACCESS_DENIED_CODES: &[&str] = &[
    "AccessDeniedException",
    "AccessDenied",
    "UnrecognizedClientException",
    "InvalidClientTokenId",
    "ExpiredTokenException",
    "InvalidSignatureException",
    "IncompleteSignature",
];

/// KMS client backed by the AWS SDK. Master keys never leave AWS.
#[derive(Clone, Debug)]
pub struct AwsKmsClient {
    kms: aws_sdk_kms::Client,
}

impl AwsKmsClient {
    pub fn new(kms: aws_sdk_kms::Client) -> Self {
        Self { kms }
    }

    /// Build a client for `connection`.
    ///
    /// Credentials come from the standard AWS credential chain. A non-default
    /// instance id is used as the region and a non-default instance URL as the
    /// endpoint override.
    pub async fn connect(connection: &KmsConnection) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let mut builder = aws_sdk_kms::config::Builder::from(&sdk_config);
        if connection.kms_instance_id != DEFAULT_KMS_INSTANCE_ID {
            builder = builder.region(Region::new(connection.kms_instance_id.clone()));
        }
        if connection.kms_instance_url != DEFAULT_KMS_INSTANCE_URL {
            builder = builder.endpoint_url(connection.kms_instance_url.clone());
        }
        Self::new(aws_sdk_kms::Client::from_conf(builder.build()))
    }
}

/// `true` if an AWS error code denotes a permission or credential problem.
pub fn is_access_denied_code(code: &str) -> bool {
    ACCESS_DENIED_CODES.contains(&code)
}

fn map_sdk_error<E, R>(operation: &str, err: SdkError<E, R>) -> KeyToolsError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err.code() {
        Some(code) if is_access_denied_code(code) => {
            KeyToolsError::AccessDenied(format!("KMS {operation}: {code}"))
        }
        _ => KeyToolsError::Kms(format!("KMS {operation}: {}", DisplayErrorContext(&err))),
    }
}

#[async_trait]
impl KmsClient for AwsKmsClient {
    fn supports_server_side_wrapping(&self) -> bool {
        true
    }

    async fn get_key_from_server(&self, _key_identifier: &str) -> Result<KeyBytes, KeyToolsError> {
        Err(KeyToolsError::Unsupported(
            "AWS KMS does not release master keys; use server-side wrapping".into(),
        ))
    }

    async fn wrap_data_key_in_server(
        &self,
        data_key: &[u8],
        master_key_identifier: &str,
    ) -> Result<String, KeyToolsError> {
        let resp = self
            .kms
            .encrypt()
            .key_id(master_key_identifier)
            .plaintext(Blob::new(data_key.to_vec()))
            .send()
            .await
            .map_err(|e| map_sdk_error("encrypt", e))?;

        let blob = resp
            .ciphertext_blob()
            .ok_or_else(|| KeyToolsError::Kms("KMS encrypt response contained no ciphertext".into()))?;
        debug!(master_key_id = master_key_identifier, "data key wrapped in KMS");
        Ok(STANDARD.encode(blob.as_ref()))
    }

    async fn unwrap_data_key_in_server(
        &self,
        wrapped_data_key: &str,
        master_key_identifier: &str,
    ) -> Result<KeyBytes, KeyToolsError> {
        let ciphertext = STANDARD.decode(wrapped_data_key).map_err(|e| {
            KeyToolsError::MalformedMaterial(format!("wrapped key is not base64: {e}"))
        })?;

        let resp = self
            .kms
            .decrypt()
            .key_id(master_key_identifier)
            .ciphertext_blob(Blob::new(ciphertext))
            .send()
            .await
            .map_err(|e| map_sdk_error("decrypt", e))?;

        let plaintext = resp.plaintext().ok_or_else(|| {
            KeyToolsError::UnwrapFailed(format!(
                "KMS decrypt with master key {master_key_identifier} returned no plaintext"
            ))
        })?;
        Ok(KeyBytes::from(plaintext.as_ref()))
    }
}

/// Creates an [`AwsKmsClient`] per KMS instance.
#[derive(Debug, Clone, Default)]
pub struct AwsKmsClientFactory;

#[async_trait]
impl KmsClientFactory for AwsKmsClientFactory {
    async fn create_client(
        &self,
        _config: &KeyToolsConfig,
        connection: &KmsConnection,
    ) -> Result<KmsClientRef, KeyToolsError> {
        Ok(std::sync::Arc::new(AwsKmsClient::connect(connection).await))
    }
}
