//! Key-material records exchanged between the wrap and unwrap paths.
//!
//! Both records are flat JSON objects. Field names are protocol constants and
//! must not change: files written by one implementation are read by another.
//! Serialisation follows struct field order and omits absent optional fields,
//! so a parsed record serialises back to the same bytes.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::KeyToolsError;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// Expected value of the `keyMaterialType` field.
pub const KEY_MATERIAL_TYPE: &str = "PKMT1";

pub const KEY_MATERIAL_TYPE_FIELD: &str = "keyMaterialType";
pub const KEY_REFERENCE_FIELD: &str = "keyReference";

/// Reserved in-file identifier of the footer key.
pub const FOOTER_KEY_ID_IN_FILE: &str = "footerKey";

/// Prefix of generated column key identifiers (`columnKey0`, `columnKey1`, ...).
pub const COLUMN_KEY_ID_IN_FILE_PREFIX: &str = "columnKey";

/// Access token used when the caller supplies none.
pub const DEFAULT_ACCESS_TOKEN: &str = "DEFAULT";

/// Sentinel for a KMS instance id or URL the client resolves by itself.
pub const DEFAULT_KMS_INSTANCE_ID: &str = "DEFAULT";
pub const DEFAULT_KMS_INSTANCE_URL: &str = "DEFAULT";

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// How one data key is wrapped, and under which master key and KMS instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    #[serde(rename = "keyMaterialType")]
    pub key_material_type: String,

    /// `true` when the record travels inside the file's key metadata.
    #[serde(
        rename = "internalStorage",
        default,
        deserialize_with = "opt_bool_or_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub internal_storage: Option<bool>,

    #[serde(rename = "isFooterKey", default, deserialize_with = "bool_or_string")]
    pub is_footer_key: bool,

    #[serde(rename = "kmsInstanceID", default, skip_serializing_if = "Option::is_none")]
    pub kms_instance_id: Option<String>,

    #[serde(rename = "kmsInstanceURL", default, skip_serializing_if = "Option::is_none")]
    pub kms_instance_url: Option<String>,

    #[serde(rename = "masterKeyID")]
    pub master_key_id: String,

    /// Base64 text of the wrapped data key.
    #[serde(rename = "wrappedDEK")]
    pub wrapped_dek: String,

    #[serde(rename = "doubleWrapping", default, deserialize_with = "bool_or_string")]
    pub double_wrapping: bool,

    /// Base64 identifier of the KEK. Its decoded bytes are the AAD of the
    /// locally wrapped DEK.
    #[serde(rename = "keyEncryptionKeyID", default, skip_serializing_if = "Option::is_none")]
    pub kek_id: Option<String>,

    #[serde(rename = "wrappedKEK", default, skip_serializing_if = "Option::is_none")]
    pub wrapped_kek: Option<String>,
}

impl KeyMaterial {
    /// A single-wrapped record: the DEK is wrapped directly by the master key.
    pub fn single_wrapped(
        is_footer_key: bool,
        master_key_id: impl Into<String>,
        wrapped_dek: impl Into<String>,
    ) -> Self {
        Self {
            key_material_type: KEY_MATERIAL_TYPE.to_owned(),
            internal_storage: None,
            is_footer_key,
            kms_instance_id: None,
            kms_instance_url: None,
            master_key_id: master_key_id.into(),
            wrapped_dek: wrapped_dek.into(),
            double_wrapping: false,
            kek_id: None,
            wrapped_kek: None,
        }
    }

    /// A double-wrapped record: the DEK is wrapped by a KEK, which is wrapped
    /// by the master key.
    pub fn double_wrapped(
        is_footer_key: bool,
        master_key_id: impl Into<String>,
        wrapped_dek: impl Into<String>,
        kek_id: impl Into<String>,
        wrapped_kek: impl Into<String>,
    ) -> Self {
        Self {
            double_wrapping: true,
            kek_id: Some(kek_id.into()),
            wrapped_kek: Some(wrapped_kek.into()),
            ..Self::single_wrapped(is_footer_key, master_key_id, wrapped_dek)
        }
    }

    /// Record the KMS instance this material was wrapped with.
    pub fn with_kms_instance(mut self, id: impl Into<String>, url: impl Into<String>) -> Self {
        self.kms_instance_id = Some(id.into());
        self.kms_instance_url = Some(url.into());
        self
    }

    pub fn with_internal_storage(mut self, internal: bool) -> Self {
        self.internal_storage = Some(internal);
        self
    }

    /// Parse a serialised record.
    ///
    /// # Errors
    ///
    /// Returns [`KeyToolsError::MalformedMaterial`] if the text is not a JSON
    /// object, if `keyMaterialType` is not [`KEY_MATERIAL_TYPE`], if a required
    /// field is missing, or if a double-wrapped record lacks its KEK fields.
    ///
    /// Flags may be JSON booleans or strings (`"true"` in any case is true,
    /// any other string is false). Absent `isFooterKey` and `doubleWrapping`
    /// read as false.
    pub fn parse(text: &str) -> Result<Self, KeyToolsError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| KeyToolsError::MalformedMaterial(format!("failed to parse key material: {e}")))?;

        // Check the tag before the shape so an incompatible record is reported as such.
        match value.get(KEY_MATERIAL_TYPE_FIELD).and_then(|v| v.as_str()) {
            Some(KEY_MATERIAL_TYPE) => {}
            other => {
                return Err(KeyToolsError::MalformedMaterial(format!(
                    "wrong key material type: {} vs {KEY_MATERIAL_TYPE}",
                    other.unwrap_or("<missing>")
                )))
            }
        }

        let material: KeyMaterial = serde_json::from_value(value)
            .map_err(|e| KeyToolsError::MalformedMaterial(format!("invalid key material: {e}")))?;

        if material.double_wrapping && (material.kek_id.is_none() || material.wrapped_kek.is_none()) {
            return Err(KeyToolsError::MalformedMaterial(
                "double-wrapped key material without KEK id or wrapped KEK".into(),
            ));
        }
        Ok(material)
    }

    /// Serialise to the protocol's JSON text.
    pub fn serialize(&self) -> Result<String, KeyToolsError> {
        serde_json::to_string(self)
            .map_err(|e| KeyToolsError::MalformedMaterial(format!("failed to serialise key material: {e}")))
    }
}

/// Boolean flag as written by either a JSON boolean or its string form.
#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

impl From<Flag> for bool {
    fn from(flag: Flag) -> Self {
        match flag {
            Flag::Bool(b) => b,
            Flag::Text(s) => s.trim().eq_ignore_ascii_case("true"),
        }
    }
}

fn bool_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Flag::deserialize(deserializer).map(bool::from)
}

fn opt_bool_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    Ok(Option::<Flag>::deserialize(deserializer)?.map(bool::from))
}

// ---------------------------------------------------------------------------
// Key reference
// ---------------------------------------------------------------------------

/// Embedded in the file instead of the material when the material lives in an
/// external key-material store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyReference {
    #[serde(rename = "keyReference")]
    pub key_id_in_file: String,
}

impl KeyReference {
    pub fn new(key_id_in_file: impl Into<String>) -> Self {
        Self {
            key_id_in_file: key_id_in_file.into(),
        }
    }

    /// # Errors
    ///
    /// Returns [`KeyToolsError::MalformedMaterial`] if the text is not a key reference.
    pub fn parse(text: &str) -> Result<Self, KeyToolsError> {
        serde_json::from_str(text)
            .map_err(|e| KeyToolsError::MalformedMaterial(format!("failed to parse key reference: {e}")))
    }

    pub fn serialize(&self) -> Result<String, KeyToolsError> {
        serde_json::to_string(self)
            .map_err(|e| KeyToolsError::MalformedMaterial(format!("failed to serialise key reference: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_wrapped_text_is_stable() {
        let material = KeyMaterial::double_wrapped(true, "kf", "d2Rlaw==", "a2VrLWlk", "d2tlaw==")
            .with_kms_instance("kms-1", "https://kms.example.com")
            .with_internal_storage(false);
        let text = material.serialize().unwrap();
        assert_eq!(
            text,
            r#"{"keyMaterialType":"PKMT1","internalStorage":false,"isFooterKey":true,"kmsInstanceID":"kms-1","kmsInstanceURL":"https://kms.example.com","masterKeyID":"kf","wrappedDEK":"d2Rlaw==","doubleWrapping":true,"keyEncryptionKeyID":"a2VrLWlk","wrappedKEK":"d2tlaw=="}"#
        );
        let parsed = KeyMaterial::parse(&text).unwrap();
        assert_eq!(parsed, material);
        assert_eq!(parsed.serialize().unwrap(), text);
    }

    #[test]
    fn single_wrapped_omits_optional_fields() {
        let text = KeyMaterial::single_wrapped(false, "kc1", "abc").serialize().unwrap();
        assert!(!text.contains("kmsInstanceID"));
        assert!(!text.contains("keyEncryptionKeyID"));
        assert!(!text.contains("wrappedKEK"));
        assert!(text.contains(r#""doubleWrapping":false"#));
    }

    #[test]
    fn rejects_wrong_type_tag() {
        let text = KeyMaterial::single_wrapped(false, "kc1", "abc")
            .serialize()
            .unwrap()
            .replace("PKMT1", "PKMT2");
        let err = KeyMaterial::parse(&text).unwrap_err();
        assert!(matches!(err, KeyToolsError::MalformedMaterial(_)));
        assert!(err.to_string().contains("PKMT2"));
    }

    #[test]
    fn rejects_missing_type_tag() {
        let text = r#"{"isFooterKey":false,"masterKeyID":"k","wrappedDEK":"x","doubleWrapping":false}"#;
        assert!(matches!(
            KeyMaterial::parse(text),
            Err(KeyToolsError::MalformedMaterial(_))
        ));
    }

    #[test]
    fn rejects_double_wrapping_without_kek_fields() {
        let text = r#"{"keyMaterialType":"PKMT1","isFooterKey":false,"masterKeyID":"k","wrappedDEK":"x","doubleWrapping":true}"#;
        assert!(matches!(
            KeyMaterial::parse(text),
            Err(KeyToolsError::MalformedMaterial(_))
        ));
    }

    #[test]
    fn accepts_string_encoded_flags() {
        let text = r#"{"keyMaterialType":"PKMT1","internalStorage":"false","isFooterKey":"TRUE","masterKeyID":"kf","wrappedDEK":"abc","doubleWrapping":"true","keyEncryptionKeyID":"a2VrLWlk","wrappedKEK":"d2tlaw=="}"#;
        let material = KeyMaterial::parse(text).unwrap();
        assert_eq!(material.internal_storage, Some(false));
        assert!(material.is_footer_key);
        assert!(material.double_wrapping);
        // Written back with JSON booleans.
        assert!(material.serialize().unwrap().contains(r#""isFooterKey":true"#));
    }

    #[test]
    fn absent_flags_read_as_false() {
        let text = r#"{"keyMaterialType":"PKMT1","masterKeyID":"kc1","wrappedDEK":"abc"}"#;
        let material = KeyMaterial::parse(text).unwrap();
        assert_eq!(material, KeyMaterial::single_wrapped(false, "kc1", "abc"));
    }

    #[test]
    fn unrecognised_flag_text_is_false() {
        let text = r#"{"keyMaterialType":"PKMT1","isFooterKey":"yes","masterKeyID":"kc1","wrappedDEK":"abc","doubleWrapping":false}"#;
        assert!(!KeyMaterial::parse(text).unwrap().is_footer_key);
    }

    #[test]
    fn rejects_non_boolean_flag_type() {
        let text = r#"{"keyMaterialType":"PKMT1","isFooterKey":1,"masterKeyID":"kc1","wrappedDEK":"abc"}"#;
        assert!(matches!(
            KeyMaterial::parse(text),
            Err(KeyToolsError::MalformedMaterial(_))
        ));
    }

    #[test]
    fn rejects_non_json() {
        assert!(KeyMaterial::parse("not json").is_err());
        assert!(KeyReference::parse("{").is_err());
    }

    #[test]
    fn key_reference_round_trip() {
        let text = KeyReference::new("columnKey7").serialize().unwrap();
        assert_eq!(text, r#"{"keyReference":"columnKey7"}"#);
        assert_eq!(KeyReference::parse(&text).unwrap().key_id_in_file, "columnKey7");
    }
}
