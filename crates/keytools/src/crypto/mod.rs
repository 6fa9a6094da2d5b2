//! Key byte buffers and AES-GCM-SIV key wrapping primitives.
//!
//! This module is intentionally free of KMS and storage dependencies.
//!
//! # Wrapped key format
//!
//! ```text
//! base64(nonce || ciphertext || tag)
//! ```

pub mod cipher;
pub mod key_bytes;

pub use cipher::{random_bytes, unwrap_key_locally, wrap_key_locally, CipherError};
pub use key_bytes::{KeyBytes, KeyWithMasterId};
