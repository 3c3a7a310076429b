use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::*;

/// Content of an `m.room_key` to-device event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomKeyContent {
    pub algorithm: String,
    pub room_id: RoomId,
    /// Session id claimed by the sender. When present it must match the id
    /// derived from `session_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub session_key: String,
}

/// Content of an `m.forwarded_room_key` to-device event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedRoomKeyContent {
    pub algorithm: String,
    pub room_id: RoomId,
    /// Curve25519 key of the device that originally created the session.
    pub sender_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Exported session key (starts at `chain_index`).
    pub session_key: String,
    pub sender_claimed_ed25519_key: String,
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_index: Option<u32>,
}

/// A key-sharing to-device event, decoded once from its type and content.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySharingEvent {
    RoomKey(RoomKeyContent),
    ForwardedRoomKey(ForwardedRoomKeyContent),
}

impl KeySharingEvent {
    /// Decode a to-device event. Returns `Ok(None)` for event types that
    /// carry no room key.
    pub fn from_event(event_type: &str, content: Value) -> Result<Option<Self>, ProtocolError> {
        match event_type {
            ROOM_KEY_EVENT => Ok(Some(Self::RoomKey(serde_json::from_value(content)?))),
            FORWARDED_ROOM_KEY_EVENT => Ok(Some(Self::ForwardedRoomKey(
                serde_json::from_value(content)?,
            ))),
            _ => Ok(None),
        }
    }

    pub fn algorithm(&self) -> &str {
        match self {
            Self::RoomKey(c) => &c.algorithm,
            Self::ForwardedRoomKey(c) => &c.algorithm,
        }
    }

    pub fn room_id(&self) -> &str {
        match self {
            Self::RoomKey(c) => &c.room_id,
            Self::ForwardedRoomKey(c) => &c.room_id,
        }
    }

    pub fn claimed_session_id(&self) -> Option<&str> {
        match self {
            Self::RoomKey(c) => c.session_id.as_deref(),
            Self::ForwardedRoomKey(c) => c.session_id.as_deref(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RoomKey(_) => ROOM_KEY_EVENT,
            Self::ForwardedRoomKey(_) => FORWARDED_ROOM_KEY_EVENT,
        }
    }
}

/// Content of an `m.room.encrypted` room event using Megolm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MegolmEncryptedContent {
    pub algorithm: String,
    pub sender_key: String,
    pub ciphertext: String,
    pub session_id: String,
    pub device_id: DeviceId,
}

/// Plaintext wrapped inside a Megolm ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MegolmPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: Value,
    pub room_id: RoomId,
}

/// One Olm ciphertext addressed to a single recipient identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmCiphertextBody {
    /// 0 = pre-key message, 1 = normal message.
    #[serde(rename = "type")]
    pub message_type: u8,
    pub body: String,
}

/// Content of an `m.room.encrypted` to-device event using Olm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OlmEncryptedContent {
    pub algorithm: String,
    pub sender_key: String,
    /// Recipient Curve25519 identity key -> ciphertext.
    pub ciphertext: BTreeMap<String, OlmCiphertextBody>,
}

/// Plaintext wrapped inside an Olm ciphertext. Binds the event to the
/// sender and recipient so it cannot be replayed to another device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OlmPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: Value,
    pub sender: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_device: Option<DeviceId>,
    pub recipient: UserId,
    /// Sender's keys, `{"ed25519": <key>}`.
    pub keys: BTreeMap<String, String>,
    /// Recipient's keys, `{"ed25519": <key>}`.
    pub recipient_keys: BTreeMap<String, String>,
}

/// A single to-device message ready to be handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToDeviceMessage {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub content: Value,
}
