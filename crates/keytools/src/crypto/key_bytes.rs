//! [`KeyBytes`]: owned key material that is zeroed when dropped.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Plaintext key bytes (DEK, KEK, or local master key).
///
/// When this type is dropped, the memory is overwritten with zeroes to
/// minimise the window during which plaintext key material lives in RAM.
/// Clones are independent buffers and are zeroed independently.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyBytes(Vec<u8>);

impl KeyBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for KeyBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for KeyBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for KeyBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        write!(f, "KeyBytes([REDACTED; {}])", self.0.len())
    }
}

/// An unwrapped data key together with the master key that protects it.
///
/// Returned by value; the data key is zeroed when this value is dropped.
#[derive(Clone, Debug)]
pub struct KeyWithMasterId {
    pub data_key: KeyBytes,
    pub master_key_id: String,
}

impl KeyWithMasterId {
    pub fn new(data_key: KeyBytes, master_key_id: impl Into<String>) -> Self {
        Self {
            data_key,
            master_key_id: master_key_id.into(),
        }
    }
}
