use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Fully-qualified Matrix user id, e.g. `@alice:example.org`.
pub type UserId = String;

/// Device identifier assigned by the homeserver at login.
pub type DeviceId = String;

/// Room identifier, e.g. `!abc:example.org`.
pub type RoomId = String;

// ── Algorithms ────────────────────────────────────────────────────────

/// Pairwise encryption algorithm (Olm, curve25519 + AES-SHA2 ratchet).
pub const OLM_V1_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";

/// Group encryption algorithm (Megolm).
pub const MEGOLM_V1_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// Key algorithm names used as the prefix of key ids.
pub const ED25519: &str = "ed25519";
pub const CURVE25519: &str = "curve25519";
pub const SIGNED_CURVE25519: &str = "signed_curve25519";

// ── Event types ───────────────────────────────────────────────────────

pub const ROOM_KEY_EVENT: &str = "m.room_key";
pub const FORWARDED_ROOM_KEY_EVENT: &str = "m.forwarded_room_key";
pub const ROOM_ENCRYPTED_EVENT: &str = "m.room.encrypted";

/// Build a key id of the form `<algorithm>:<id>`.
pub fn key_id(algorithm: &str, id: &str) -> String {
    format!("{algorithm}:{id}")
}

/// Split a key id into `(algorithm, id)`.
pub fn split_key_id(key_id: &str) -> Result<(&str, &str), ProtocolError> {
    match key_id.split_once(':') {
        Some((algorithm, id)) if !algorithm.is_empty() && !id.is_empty() => Ok((algorithm, id)),
        _ => Err(ProtocolError::MalformedKeyId(key_id.to_string())),
    }
}

/// Signatures attached to a signed JSON object: user id -> key id -> signature.
///
/// Values of this type are never mutated in place. The signing path builds a
/// new value with [`KeySignatures::with_signature`], so a bundle being
/// verified can never alias one being signed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySignatures(BTreeMap<UserId, BTreeMap<String, String>>);

impl KeySignatures {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of these signatures with one more entry.
    #[must_use]
    pub fn with_signature(
        mut self,
        user_id: impl Into<UserId>,
        key_id: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        self.0
            .entry(user_id.into())
            .or_default()
            .insert(key_id.into(), signature.into());
        self
    }

    pub fn get(&self, user_id: &str, key_id: &str) -> Option<&str> {
        self.0
            .get(user_id)
            .and_then(|keys| keys.get(key_id))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }
}

impl FromIterator<(UserId, BTreeMap<String, String>)> for KeySignatures {
    fn from_iter<T: IntoIterator<Item = (UserId, BTreeMap<String, String>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
