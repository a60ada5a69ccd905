//! Public key material published by devices and served in prekey bundles.
//!
//! Key bytes are opaque here: the service never verifies signatures, it only
//! checks that the blobs are present. All byte fields travel as standard
//! base64 in JSON.

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::KeysError;

/// Serde adapter for `Vec<u8>` as standard base64.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }

    /// Same encoding for optional fields.
    pub mod option {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        use serde::{Deserialize, Deserializer, Serializer};

        #[allow(clippy::ref_option)] // serde `with` hands us `&Option<T>`
        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Long-term identity public key for one namespace of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKey(#[serde(with = "base64_bytes")] pub Vec<u8>);

impl IdentityKey {
    pub fn validate(&self) -> Result<(), KeysError> {
        if self.0.is_empty() {
            return Err(KeysError::Validation("identity key is empty".into()));
        }
        Ok(())
    }
}

/// Unsigned one-time elliptic-curve prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcPreKey {
    pub key_id: u32,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
}

/// Medium-term elliptic-curve prekey signed by the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcSignedPreKey {
    pub key_id: u32,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

/// Post-quantum (KEM) prekey signed by the identity key. Used both for
/// one-time keys and for the last-resort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KemSignedPreKey {
    pub key_id: u32,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl EcPreKey {
    pub fn validate(&self) -> Result<(), KeysError> {
        if self.public_key.is_empty() {
            return Err(KeysError::Validation(format!(
                "prekey {} has an empty public key",
                self.key_id
            )));
        }
        Ok(())
    }
}

impl EcSignedPreKey {
    pub fn validate(&self) -> Result<(), KeysError> {
        validate_signed("signed prekey", self.key_id, &self.public_key, &self.signature)
    }
}

impl KemSignedPreKey {
    pub fn validate(&self) -> Result<(), KeysError> {
        validate_signed("pq prekey", self.key_id, &self.public_key, &self.signature)
    }
}

fn validate_signed(
    kind: &str,
    key_id: u32,
    public_key: &[u8],
    signature: &[u8],
) -> Result<(), KeysError> {
    if public_key.is_empty() {
        return Err(KeysError::Validation(format!(
            "{kind} {key_id} has an empty public key"
        )));
    }
    if signature.is_empty() {
        return Err(KeysError::Validation(format!(
            "{kind} {key_id} has an empty signature"
        )));
    }
    Ok(())
}

/// Body of a prekey upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyState {
    #[serde(default)]
    pub identity_key: Option<IdentityKey>,
    #[serde(default)]
    pub signed_pre_key: Option<EcSignedPreKey>,
    #[serde(default)]
    pub pre_keys: Vec<EcPreKey>,
    #[serde(default)]
    pub pq_pre_keys: Vec<KemSignedPreKey>,
    #[serde(default)]
    pub pq_last_resort_pre_key: Option<KemSignedPreKey>,
}

impl PreKeyState {
    /// Reject structurally malformed uploads before anything is written.
    pub fn validate(&self) -> Result<(), KeysError> {
        if let Some(ref key) = self.identity_key {
            key.validate()?;
        }
        if let Some(ref key) = self.signed_pre_key {
            key.validate()?;
        }
        if let Some(ref key) = self.pq_last_resort_pre_key {
            key.validate()?;
        }
        for key in &self.pre_keys {
            key.validate()?;
        }
        for key in &self.pq_pre_keys {
            key.validate()?;
        }
        Ok(())
    }
}

/// Remaining one-time prekeys for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyCount {
    pub count: u32,
    pub pq_count: u32,
}

/// Per-device entry of a prekey bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyResponseItem {
    pub device_id: DeviceId,
    pub registration_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_pre_key: Option<EcSignedPreKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_key: Option<EcPreKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pq_pre_key: Option<KemSignedPreKey>,
}

/// Keys returned to a peer that wants to open sessions with a target's devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyResponse {
    pub identity_key: Option<IdentityKey>,
    pub devices: Vec<PreKeyResponseItem>,
}
