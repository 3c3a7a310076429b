//! The cryptographic primitive boundary.
//!
//! Everything above this module treats ratchet state as opaque. A
//! [`CryptoEngine`] owns key agreement, the Olm and Megolm ratchets, and
//! Ed25519 signing; callers pass it state objects and base64 strings. All
//! keys, signatures and ciphertexts use unpadded base64, as on the wire.

use std::collections::BTreeMap;

use crate::error::EngineError;

mod vodozemac_engine;

pub use self::vodozemac_engine::VodozemacEngine;

/// Olm message type of a pre-key (session-establishing) message.
pub const OLM_PREKEY_MESSAGE: u8 = 0;

/// Olm message type of a normal message on an established session.
pub const OLM_NORMAL_MESSAGE: u8 = 1;

/// Public identity keys of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKeys {
    /// Ed25519 fingerprint key, used to sign device key bundles.
    pub ed25519: String,
    /// Curve25519 identity key, used for Olm key agreement.
    pub curve25519: String,
}

/// An Olm ciphertext together with its message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OlmCiphertext {
    pub message_type: u8,
    pub body: String,
}

impl OlmCiphertext {
    pub fn is_prekey(&self) -> bool {
        self.message_type == OLM_PREKEY_MESSAGE
    }
}

/// A Megolm plaintext together with the ratchet index it was encrypted at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPlaintext {
    pub plaintext: Vec<u8>,
    pub message_index: u32,
}

/// How one inbound Megolm ratchet relates to another with the same session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSessionOrdering {
    /// Same ratchet, same first known index.
    Equal,
    /// Same ratchet, and this one reaches further back.
    Better,
    /// Same ratchet, but the other one reaches further back.
    Worse,
    /// Different ratchets sharing a public key.
    Unconnected,
}

/// The operation contract the session layer needs from a crypto library.
///
/// Engines are plain values injected into each component, so two engines
/// never share hidden state.
pub trait CryptoEngine: Send + Sync + 'static {
    /// Long-term identity keys plus the one-time key pool.
    type Account: Send + Sync;
    /// Pairwise Olm ratchet.
    type Session: Send;
    /// Sending half of a Megolm ratchet.
    type OutboundGroupSession: Send;
    /// Receiving half of a Megolm ratchet.
    type InboundGroupSession: Send;

    // ── Account ──────────────────────────────────────────────────────

    fn generate_account(&self) -> Self::Account;
    fn identity_keys(&self, account: &Self::Account) -> IdentityKeys;
    /// Extend the pool by `count` keys, returning only the new ones.
    fn generate_one_time_keys(
        &self,
        account: &mut Self::Account,
        count: usize,
    ) -> BTreeMap<String, String>;
    /// Generated keys that have not been marked as published yet.
    fn unpublished_one_time_keys(&self, account: &Self::Account) -> BTreeMap<String, String>;
    fn max_one_time_keys(&self, account: &Self::Account) -> usize;
    fn mark_one_time_keys_published(&self, account: &mut Self::Account);
    fn sign(&self, account: &Self::Account, message: &str) -> String;
    fn verify_ed25519(
        &self,
        signature: &str,
        public_key: &str,
        message: &str,
    ) -> Result<(), EngineError>;

    // ── Olm ──────────────────────────────────────────────────────────

    fn init_outbound_session(
        &self,
        account: &Self::Account,
        peer_identity_key: &str,
        peer_one_time_key: &str,
    ) -> Result<Self::Session, EngineError>;

    /// Create a session from a pre-key message and decrypt that message.
    ///
    /// The one-time key the message references is removed from the account
    /// as part of this call, so a second pre-key message naming the same key
    /// fails.
    fn init_inbound_session(
        &self,
        account: &mut Self::Account,
        sender_identity_key: &str,
        message: &OlmCiphertext,
    ) -> Result<(Self::Session, Vec<u8>), EngineError>;

    /// Whether a pre-key message belongs to an existing session.
    fn session_matches_inbound(&self, session: &Self::Session, message: &OlmCiphertext) -> bool;
    fn session_id(&self, session: &Self::Session) -> String;
    fn encrypt_message(&self, session: &mut Self::Session, plaintext: &[u8]) -> OlmCiphertext;
    fn decrypt_message(
        &self,
        session: &mut Self::Session,
        message: &OlmCiphertext,
    ) -> Result<Vec<u8>, EngineError>;

    // ── Megolm ───────────────────────────────────────────────────────

    fn new_outbound_group_session(&self) -> Self::OutboundGroupSession;
    fn outbound_group_session_id(&self, session: &Self::OutboundGroupSession) -> String;
    fn session_key(&self, session: &Self::OutboundGroupSession) -> String;
    fn message_index(&self, session: &Self::OutboundGroupSession) -> u32;
    fn group_encrypt(&self, session: &mut Self::OutboundGroupSession, plaintext: &[u8]) -> String;

    fn new_inbound_group_session_from_key(
        &self,
        session_key: &str,
    ) -> Result<Self::InboundGroupSession, EngineError>;
    fn import_inbound_group_session(
        &self,
        exported: &str,
    ) -> Result<Self::InboundGroupSession, EngineError>;
    fn inbound_group_session_id(&self, session: &Self::InboundGroupSession) -> String;
    fn first_known_index(&self, session: &Self::InboundGroupSession) -> u32;
    /// Compare `session` against `other`. Both may be advanced internally to
    /// line their indices up; neither loses messages it could decrypt.
    fn compare_group_sessions(
        &self,
        session: &mut Self::InboundGroupSession,
        other: &mut Self::InboundGroupSession,
    ) -> GroupSessionOrdering;
    /// Export the session ratcheted forward to `from_index`. `None` when the
    /// index is below the first known index.
    fn export_session(
        &self,
        session: &mut Self::InboundGroupSession,
        from_index: u32,
    ) -> Option<String>;
    fn group_decrypt(
        &self,
        session: &mut Self::InboundGroupSession,
        ciphertext: &str,
    ) -> Result<GroupPlaintext, EngineError>;

    // ── Pickling ─────────────────────────────────────────────────────

    fn pickle_account(&self, account: &Self::Account) -> Result<String, EngineError>;
    fn unpickle_account(&self, pickle: &str) -> Result<Self::Account, EngineError>;
    fn pickle_session(&self, session: &Self::Session) -> Result<String, EngineError>;
    fn unpickle_session(&self, pickle: &str) -> Result<Self::Session, EngineError>;
    fn pickle_outbound_group_session(
        &self,
        session: &Self::OutboundGroupSession,
    ) -> Result<String, EngineError>;
    fn unpickle_outbound_group_session(
        &self,
        pickle: &str,
    ) -> Result<Self::OutboundGroupSession, EngineError>;
    fn pickle_inbound_group_session(
        &self,
        session: &Self::InboundGroupSession,
    ) -> Result<String, EngineError>;
    fn unpickle_inbound_group_session(
        &self,
        pickle: &str,
    ) -> Result<Self::InboundGroupSession, EngineError>;
}
