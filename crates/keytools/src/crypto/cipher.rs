//! AES-GCM-SIV wrapping of key bytes under a KEK or a local master key.
//!
//! **Algorithm choice:** AES-GCM-SIV (RFC 8452) is nonce-misuse-resistant, so a
//! repeated random nonce under the same KEK leaks equality of the wrapped keys
//! and nothing more. The key length selects AES-128 or AES-256.

use aes_gcm_siv::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    Aes128GcmSiv, Aes256GcmSiv, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::KeyToolsError;
use thiserror::Error;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of a generated KEK identifier.
pub const KEK_ID_LEN: usize = 16;

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The wrapping key is neither 16 nor 32 bytes.
    #[error("invalid wrapping key length: {0} bytes (expected 16 or 32)")]
    InvalidKeyLength(usize),

    /// AES-GCM-SIV encryption or decryption failed. On decryption this means
    /// a wrong key, tampered ciphertext, or mismatched AAD.
    #[error("aead operation failed")]
    AeadFailure,

    /// The wrapped key text is not base64 of `nonce || ciphertext || tag`.
    #[error("invalid wrapped key encoding")]
    InvalidFormat,
}

impl From<CipherError> for KeyToolsError {
    fn from(e: CipherError) -> Self {
        KeyToolsError::Crypto(e.to_string())
    }
}

enum WrappingCipher {
    Aes128(Aes128GcmSiv),
    Aes256(Aes256GcmSiv),
}

impl WrappingCipher {
    fn new(key: &[u8]) -> Result<Self, CipherError> {
        match key.len() {
            16 => Aes128GcmSiv::new_from_slice(key)
                .map(Self::Aes128)
                .map_err(|_| CipherError::InvalidKeyLength(key.len())),
            32 => Aes256GcmSiv::new_from_slice(key)
                .map(Self::Aes256)
                .map_err(|_| CipherError::InvalidKeyLength(key.len())),
            other => Err(CipherError::InvalidKeyLength(other)),
        }
    }

    fn encrypt(&self, nonce: &Nonce, payload: Payload<'_, '_>) -> Result<Vec<u8>, CipherError> {
        match self {
            Self::Aes128(c) => c.encrypt(nonce, payload),
            Self::Aes256(c) => c.encrypt(nonce, payload),
        }
        .map_err(|_| CipherError::AeadFailure)
    }

    fn decrypt(&self, nonce: &Nonce, payload: Payload<'_, '_>) -> Result<Vec<u8>, CipherError> {
        match self {
            Self::Aes128(c) => c.decrypt(nonce, payload),
            Self::Aes256(c) => c.decrypt(nonce, payload),
        }
        .map_err(|_| CipherError::AeadFailure)
    }
}

/// Fill a fresh buffer of `len` bytes from the OS CSPRNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Wrap `key` under `wrapping_key`, binding it to `aad`.
///
/// Returns `base64(nonce || ciphertext || tag)`.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `wrapping_key` is not 16 or 32 bytes.
pub fn wrap_key_locally(key: &[u8], wrapping_key: &[u8], aad: &[u8]) -> Result<String, CipherError> {
    let cipher = WrappingCipher::new(wrapping_key)?;

    let nonce_bytes = random_bytes(NONCE_LEN);
    let ciphertext = cipher.encrypt(
        Nonce::from_slice(&nonce_bytes),
        Payload { msg: key, aad },
    )?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(out))
}

/// Reverse of [`wrap_key_locally`].
///
/// # Errors
///
/// Returns [`CipherError::InvalidFormat`] for bad base64 or a truncated blob,
/// and [`CipherError::AeadFailure`] if authentication fails (wrong key,
/// tampered data, or different AAD).
pub fn unwrap_key_locally(
    wrapped: &str,
    wrapping_key: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let cipher = WrappingCipher::new(wrapping_key)?;
    let blob = STANDARD
        .decode(wrapped)
        .map_err(|_| CipherError::InvalidFormat)?;
    if blob.len() <= NONCE_LEN {
        return Err(CipherError::InvalidFormat);
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    cipher.decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
}
