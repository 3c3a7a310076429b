use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::*;

/// A device's self-signed identity key bundle, as uploaded to and queried
/// from the homeserver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceKeys {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub algorithms: Vec<String>,
    /// `"<algorithm>:<device_id>"` -> unpadded base64 public key.
    pub keys: BTreeMap<String, String>,
    #[serde(default)]
    pub signatures: KeySignatures,
    /// Server-added data, never covered by the signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,
}

impl DeviceKeys {
    /// An unsigned bundle advertising the given identity keys.
    pub fn new(
        user_id: impl Into<UserId>,
        device_id: impl Into<DeviceId>,
        ed25519: impl Into<String>,
        curve25519: impl Into<String>,
    ) -> Self {
        let device_id = device_id.into();
        let mut keys = BTreeMap::new();
        keys.insert(key_id(ED25519, &device_id), ed25519.into());
        keys.insert(key_id(CURVE25519, &device_id), curve25519.into());
        Self {
            user_id: user_id.into(),
            device_id,
            algorithms: vec![OLM_V1_ALGORITHM.to_string(), MEGOLM_V1_ALGORITHM.to_string()],
            keys,
            signatures: KeySignatures::new(),
            unsigned: None,
        }
    }

    /// The device's Ed25519 fingerprint key.
    pub fn ed25519_key(&self) -> Option<&str> {
        self.key(ED25519)
    }

    /// The device's Curve25519 identity key.
    pub fn curve25519_key(&self) -> Option<&str> {
        self.key(CURVE25519)
    }

    fn key(&self, algorithm: &str) -> Option<&str> {
        self.keys
            .get(&key_id(algorithm, &self.device_id))
            .map(String::as_str)
    }

    pub fn supports(&self, algorithm: &str) -> bool {
        self.algorithms.iter().any(|a| a == algorithm)
    }

    #[must_use]
    pub fn with_signatures(mut self, signatures: KeySignatures) -> Self {
        self.signatures = signatures;
        self
    }
}

/// A signed one-time key (`signed_curve25519:<key_id>` in uploads and claims).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedKey {
    pub key: String,
    #[serde(default)]
    pub signatures: KeySignatures,
}

impl SignedKey {
    pub fn unsigned(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            signatures: KeySignatures::new(),
        }
    }

    #[must_use]
    pub fn with_signatures(mut self, signatures: KeySignatures) -> Self {
        self.signatures = signatures;
        self
    }
}

/// One-time keys as uploaded: `"signed_curve25519:<key_id>"` -> signed key.
pub type OneTimeKeys = BTreeMap<String, SignedKey>;

/// Device bundles returned by a key query: user id -> device id -> bundle.
pub type QueriedDeviceKeys = BTreeMap<UserId, BTreeMap<DeviceId, DeviceKeys>>;

/// Body of a key upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeysUpload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: OneTimeKeys,
}

impl KeysUpload {
    pub fn is_empty(&self) -> bool {
        self.device_keys.is_none() && self.one_time_keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_upload_serializes_to_empty_object() {
        let upload = KeysUpload::default();
        assert!(upload.is_empty());
        assert_eq!(serde_json::to_value(&upload).unwrap(), json!({}));
    }

    #[test]
    fn device_keys_wire_shape() {
        let keys = DeviceKeys::new("@alice:x", "ALICEDEV", "edkey", "curvekey").with_signatures(
            KeySignatures::new().with_signature("@alice:x", "ed25519:ALICEDEV", "sig"),
        );
        let json = serde_json::to_value(&keys).unwrap();
        assert_eq!(
            json,
            json!({
                "user_id": "@alice:x",
                "device_id": "ALICEDEV",
                "algorithms": [OLM_V1_ALGORITHM, MEGOLM_V1_ALGORITHM],
                "keys": {
                    "ed25519:ALICEDEV": "edkey",
                    "curve25519:ALICEDEV": "curvekey",
                },
                "signatures": {"@alice:x": {"ed25519:ALICEDEV": "sig"}},
            })
        );
    }

    #[test]
    fn key_accessors_use_own_device_id() {
        let keys = DeviceKeys::new("@alice:x", "D1", "ed", "curve");
        assert_eq!(keys.ed25519_key(), Some("ed"));
        assert_eq!(keys.curve25519_key(), Some("curve"));
        assert!(keys.supports(MEGOLM_V1_ALGORITHM));

        let mut other = keys.clone();
        other.device_id = "D2".into();
        assert_eq!(other.ed25519_key(), None);
    }

    #[test]
    fn signatures_default_when_missing() {
        let json = json!({
            "user_id": "@bob:x",
            "device_id": "B",
            "algorithms": [],
            "keys": {},
        });
        let keys: DeviceKeys = serde_json::from_value(json).unwrap();
        assert!(keys.signatures.is_empty());
        assert!(keys.unsigned.is_none());
    }
}
