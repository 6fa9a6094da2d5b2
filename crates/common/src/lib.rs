//! Common types, protocol definitions, and errors shared across the keytools crates.

pub mod error;
pub mod protocol;

pub use error::KeyToolsError;
pub use protocol::{KeyMaterial, KeyReference};
