use mxe2e_protocol::ProtocolError;
use thiserror::Error;

/// Checked failures reported by a [`CryptoEngine`](crate::engine::CryptoEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("session creation failed: {0}")]
    SessionCreation(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("bad signature: {0}")]
    Signature(String),

    #[error("pickle error: {0}")]
    Pickle(String),
}

/// Reasons a device key bundle is refused by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceKeyError {
    #[error("bundle for {found} was returned in slot {expected}")]
    SlotMismatch { expected: String, found: String },

    #[error("device {user_id}/{device_id} is missing its {algorithm} key")]
    MissingKey {
        user_id: String,
        device_id: String,
        algorithm: &'static str,
    },

    #[error("bad self-signature on device {user_id}/{device_id}")]
    BadSignature { user_id: String, device_id: String },

    #[error("ed25519 key of device {user_id}/{device_id} changed")]
    KeyChanged { user_id: String, device_id: String },
}

#[derive(Debug, Error)]
pub enum E2eError {
    #[error("identity not initialised: call initialise() first")]
    NotInitialised,

    #[error("crypto error: {0}")]
    Crypto(#[from] EngineError),

    #[error("failed to decrypt with session {session_id}: {source}")]
    Decryption {
        session_id: String,
        #[source]
        source: EngineError,
    },

    #[error("room key mismatch: event claims session {claimed}, key derives {derived}")]
    RoomKeyMismatch { claimed: String, derived: String },

    #[error("inbound group session {session_id} in {room_id} is not connected to the stored ratchet")]
    UnconnectedSession { room_id: String, session_id: String },

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("state error: {0}")]
    State(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("device keys rejected: {0}")]
    DeviceKeys(#[from] DeviceKeyError),

    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("persistence error: {0}")]
    Persistence(#[source] anyhow::Error),
}

pub type Result<T, E = E2eError> = std::result::Result<T, E>;
