//! Megolm group sessions.
//!
//! Each room has at most one current outbound session. Every outbound
//! session we create is mirrored into an inbound session at index 0, so we
//! can read our own messages back. Inbound sessions received from others
//! are keyed by `(room_id, session_id)`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::RotationPolicy;
use crate::engine::{CryptoEngine, GroupPlaintext, GroupSessionOrdering};
use crate::error::{E2eError, Result};
use crate::identity::E2eIdentity;
use crate::now_millis;
use crate::persistence::{InboundGroupSessionRecord, OutboundGroupSessionRecord};
use crate::stores::{lock, InboundInsert, KeyStore};

/// The sending half of a Megolm session for one room.
pub struct OutboundGroupSession<E: CryptoEngine> {
    engine: Arc<E>,
    session_id: String,
    room_id: String,
    created_at: u64,
    ratchet: Mutex<E::OutboundGroupSession>,
}

impl<E: CryptoEngine> std::fmt::Debug for OutboundGroupSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl<E: CryptoEngine> OutboundGroupSession<E> {
    pub fn new(engine: Arc<E>, room_id: impl Into<String>) -> Self {
        let ratchet = engine.new_outbound_group_session();
        Self {
            session_id: engine.outbound_group_session_id(&ratchet),
            engine,
            room_id: room_id.into(),
            created_at: now_millis(),
            ratchet: Mutex::new(ratchet),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Index the next encrypted message will carry.
    pub fn message_index(&self) -> u32 {
        self.engine.message_index(&lock(&self.ratchet))
    }

    /// Session key at the current index. Holders can decrypt messages from
    /// this index on.
    pub fn session_key(&self) -> String {
        self.engine.session_key(&lock(&self.ratchet))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        self.engine.group_encrypt(&mut lock(&self.ratchet), plaintext)
    }

    pub(crate) fn to_record(&self) -> Result<OutboundGroupSessionRecord> {
        let pickle = self
            .engine
            .pickle_outbound_group_session(&lock(&self.ratchet))?;
        Ok(OutboundGroupSessionRecord {
            room_id: self.room_id.clone(),
            created_at: self.created_at,
            pickle: pickle.into(),
        })
    }

    pub(crate) fn from_record(engine: Arc<E>, record: &OutboundGroupSessionRecord) -> Result<Self> {
        let ratchet = engine.unpickle_outbound_group_session(&record.pickle)?;
        Ok(Self {
            session_id: engine.outbound_group_session_id(&ratchet),
            engine,
            room_id: record.room_id.clone(),
            created_at: record.created_at,
            ratchet: Mutex::new(ratchet),
        })
    }
}

/// An inbound session exported from a given index, ready to hand to
/// another device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedGroupSession {
    pub export_blob: String,
    pub first_known_index: u32,
}

/// The receiving half of a Megolm session.
pub struct InboundGroupSession<E: CryptoEngine> {
    engine: Arc<E>,
    session_id: String,
    room_id: String,
    sender_key: Option<String>,
    signing_key: Option<String>,
    forwarding_chain: Vec<String>,
    imported: bool,
    first_known_index: u32,
    ratchet: Mutex<E::InboundGroupSession>,
}

impl<E: CryptoEngine> std::fmt::Debug for InboundGroupSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("first_known_index", &self.first_known_index)
            .field("imported", &self.imported)
            .finish_non_exhaustive()
    }
}

impl<E: CryptoEngine> InboundGroupSession<E> {
    fn from_ratchet(
        engine: Arc<E>,
        room_id: String,
        ratchet: E::InboundGroupSession,
        sender_key: Option<String>,
        signing_key: Option<String>,
        forwarding_chain: Vec<String>,
        imported: bool,
    ) -> Self {
        Self {
            session_id: engine.inbound_group_session_id(&ratchet),
            first_known_index: engine.first_known_index(&ratchet),
            engine,
            room_id,
            sender_key,
            signing_key,
            forwarding_chain,
            imported,
            ratchet: Mutex::new(ratchet),
        }
    }

    /// Build an inbound session from a session key shared in an
    /// `m.room_key` event.
    pub fn from_session_key(
        engine: Arc<E>,
        room_id: impl Into<String>,
        session_key: &str,
        sender_key: Option<String>,
        signing_key: Option<String>,
    ) -> Result<Self> {
        let ratchet = engine.new_inbound_group_session_from_key(session_key)?;
        Ok(Self::from_ratchet(
            engine,
            room_id.into(),
            ratchet,
            sender_key,
            signing_key,
            Vec::new(),
            false,
        ))
    }

    /// Build an inbound session from an exported (forwarded or backed up)
    /// session.
    pub fn import(
        engine: Arc<E>,
        room_id: impl Into<String>,
        export_blob: &str,
        sender_key: Option<String>,
        signing_key: Option<String>,
        forwarding_chain: Vec<String>,
    ) -> Result<Self> {
        let ratchet = engine.import_inbound_group_session(export_blob)?;
        Ok(Self::from_ratchet(
            engine,
            room_id.into(),
            ratchet,
            sender_key,
            signing_key,
            forwarding_chain,
            true,
        ))
    }

    /// The inbound counterpart of one of our own outbound sessions, starting
    /// at the outbound session's current index.
    pub fn mirror_of(
        outbound: &OutboundGroupSession<E>,
        sender_key: Option<String>,
        signing_key: Option<String>,
    ) -> Result<Self> {
        Self::from_session_key(
            outbound.engine.clone(),
            outbound.room_id.clone(),
            &outbound.session_key(),
            sender_key,
            signing_key,
        )
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Curve25519 key of the device that created the session, when known.
    pub fn sender_key(&self) -> Option<&str> {
        self.sender_key.as_deref()
    }

    /// Ed25519 key the creating device claimed, when known.
    pub fn signing_key(&self) -> Option<&str> {
        self.signing_key.as_deref()
    }

    /// Curve25519 keys of the devices this session was forwarded through.
    pub fn forwarding_chain(&self) -> &[String] {
        &self.forwarding_chain
    }

    pub fn imported(&self) -> bool {
        self.imported
    }

    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<GroupPlaintext> {
        self.engine
            .group_decrypt(&mut lock(&self.ratchet), ciphertext)
            .map_err(|source| E2eError::Decryption {
                session_id: self.session_id.clone(),
                source,
            })
    }

    /// Export at the first known index.
    pub fn export(&self) -> Result<ExportedGroupSession> {
        self.exported_at(self.first_known_index).ok_or_else(|| {
            E2eError::State(format!(
                "inbound group session {} cannot export its own first index",
                self.session_id
            ))
        })
    }

    /// Export from `index` on. `None` when `index` precedes the first known
    /// index.
    pub fn exported_at(&self, index: u32) -> Option<ExportedGroupSession> {
        let export_blob = self
            .engine
            .export_session(&mut lock(&self.ratchet), index)?;
        Some(ExportedGroupSession {
            export_blob,
            first_known_index: index,
        })
    }

    /// How this session relates to `stored`, a session already held under
    /// the same id.
    pub(crate) fn compare_with(&mut self, stored: &Self) -> GroupSessionOrdering {
        let ratchet = self
            .ratchet
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        self.engine
            .compare_group_sessions(ratchet, &mut lock(&stored.ratchet))
    }

    /// Take over the creator keys of `stored` when they were learned from
    /// the creator itself rather than from a forward.
    pub(crate) fn keep_creator_of(&mut self, stored: &Self) {
        if stored.imported {
            return;
        }
        if self.sender_key != stored.sender_key || self.signing_key != stored.signing_key {
            warn!(
                room_id = %self.room_id,
                session_id = %self.session_id,
                "forwarded key names a different creator, keeping the original"
            );
        }
        self.sender_key = stored.sender_key.clone();
        self.signing_key = stored.signing_key.clone();
    }

    pub(crate) fn to_record(&self) -> Result<InboundGroupSessionRecord> {
        let pickle = self
            .engine
            .pickle_inbound_group_session(&lock(&self.ratchet))?;
        Ok(InboundGroupSessionRecord {
            room_id: self.room_id.clone(),
            sender_key: self.sender_key.clone(),
            signing_key: self.signing_key.clone(),
            forwarding_chain: self.forwarding_chain.clone(),
            imported: self.imported,
            pickle: pickle.into(),
        })
    }

    pub(crate) fn from_record(engine: Arc<E>, record: &InboundGroupSessionRecord) -> Result<Self> {
        let ratchet = engine.unpickle_inbound_group_session(&record.pickle)?;
        Ok(Self::from_ratchet(
            engine,
            record.room_id.clone(),
            ratchet,
            record.sender_key.clone(),
            record.signing_key.clone(),
            record.forwarding_chain.clone(),
            record.imported,
        ))
    }
}

/// Whether `session` has hit either rotation threshold at `now_ms`.
pub fn rotation_due<E: CryptoEngine>(
    session: &OutboundGroupSession<E>,
    policy: &RotationPolicy,
    now_ms: u64,
) -> bool {
    let elapsed = Duration::from_millis(now_ms.saturating_sub(session.created_at()));
    session.message_index() >= policy.max_messages || elapsed >= policy.max_lifetime
}

pub struct GroupSessionManager<E: CryptoEngine> {
    engine: Arc<E>,
    store: Arc<KeyStore<E>>,
    identity: Arc<E2eIdentity<E>>,
}

impl<E: CryptoEngine> GroupSessionManager<E> {
    pub fn new(engine: Arc<E>, store: Arc<KeyStore<E>>, identity: Arc<E2eIdentity<E>>) -> Self {
        Self {
            engine,
            store,
            identity,
        }
    }

    pub fn find_outbound_group_session(&self, room_id: &str) -> Option<Arc<OutboundGroupSession<E>>> {
        self.store.find_outbound_group_session(room_id)
    }

    /// Create a new outbound session for a room, replacing the current one.
    ///
    /// The mirrored inbound session is stored in the same step, and both
    /// are persisted before this returns.
    pub fn new_outbound_group_session(&self, room_id: &str) -> Result<Arc<OutboundGroupSession<E>>> {
        self.identity.ensure_initialised()?;
        let keys = self.identity.identity_keys()?;

        let outbound = Arc::new(OutboundGroupSession::new(self.engine.clone(), room_id));
        let inbound = InboundGroupSession::mirror_of(
            &outbound,
            Some(keys.curve25519),
            Some(keys.ed25519),
        )?;
        self.store.store_outbound_with_mirror(outbound.clone(), inbound)?;
        self.store.flush()?;

        info!(
            room_id,
            session_id = outbound.session_id(),
            "created outbound group session"
        );
        Ok(outbound)
    }

    pub fn needs_rotation(&self, session: &OutboundGroupSession<E>, policy: &RotationPolicy) -> bool {
        rotation_due(session, policy, now_millis())
    }

    pub fn find_inbound_group_session(
        &self,
        room_id: &str,
        session_id: &str,
    ) -> Option<Arc<InboundGroupSession<E>>> {
        self.store.find_inbound_group_session(room_id, session_id)
    }

    /// Store an inbound session received from another device and persist it.
    ///
    /// Fails without touching the store when a different ratchet is already
    /// held under the same session id.
    pub fn add_inbound_group_session(&self, session: InboundGroupSession<E>) -> Result<InboundInsert> {
        let room_id = session.room_id().to_string();
        let session_id = session.session_id().to_string();
        let outcome = self.store.store_inbound_group_session(session)?;
        if outcome != InboundInsert::KeptExisting {
            self.store.flush()?;
        }
        debug!(%room_id, %session_id, ?outcome, "inbound group session offered");
        Ok(outcome)
    }

    pub fn decrypt(&self, session: &InboundGroupSession<E>, ciphertext: &str) -> Result<GroupPlaintext> {
        session.decrypt(ciphertext)
    }

    pub fn export(&self, session: &InboundGroupSession<E>) -> Result<ExportedGroupSession> {
        session.export()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::VodozemacEngine;

    fn manager() -> GroupSessionManager<VodozemacEngine> {
        let engine = Arc::new(VodozemacEngine::new());
        let store = Arc::new(KeyStore::new(engine.clone()));
        let identity = Arc::new(E2eIdentity::new(
            engine.clone(),
            store.clone(),
            "@alice:example.org",
            "ALICE",
        ));
        identity.initialise().unwrap();
        GroupSessionManager::new(engine, store, identity)
    }

    #[test]
    fn own_messages_decrypt_through_mirror() {
        let groups = manager();
        let outbound = groups.new_outbound_group_session("!room:x").unwrap();
        let inbound = groups
            .find_inbound_group_session("!room:x", outbound.session_id())
            .unwrap();
        assert_eq!(inbound.first_known_index(), 0);
        assert!(inbound.sender_key().is_some());

        for plaintext in ["", "hello", "ünïcödé ☃"] {
            let ciphertext = outbound.encrypt(plaintext.as_bytes());
            let decrypted = groups.decrypt(&inbound, &ciphertext).unwrap();
            assert_eq!(decrypted.plaintext, plaintext.as_bytes());
        }
    }

    #[test]
    fn new_session_replaces_current_for_room() {
        let groups = manager();
        let first = groups.new_outbound_group_session("!room:x").unwrap();
        let second = groups.new_outbound_group_session("!room:x").unwrap();
        assert_ne!(first.session_id(), second.session_id());
        let current = groups.find_outbound_group_session("!room:x").unwrap();
        assert_eq!(current.session_id(), second.session_id());
        // Old mirror stays, so history stays readable.
        assert!(groups
            .find_inbound_group_session("!room:x", first.session_id())
            .is_some());
    }

    #[test]
    fn rotation_after_message_limit() {
        let groups = manager();
        let policy = RotationPolicy::messages_only(5);
        let session = groups.new_outbound_group_session("!room:x").unwrap();
        for _ in 0..4 {
            session.encrypt(b"m");
            assert!(!groups.needs_rotation(&session, &policy));
        }
        session.encrypt(b"m");
        assert!(groups.needs_rotation(&session, &policy));
    }

    #[test]
    fn rotation_after_lifetime() {
        let groups = manager();
        let policy = RotationPolicy {
            max_messages: 100,
            max_lifetime: Duration::from_secs(60),
        };
        let session = groups.new_outbound_group_session("!room:x").unwrap();
        let created = session.created_at();
        assert!(!rotation_due(&session, &policy, created + 59_999));
        assert!(rotation_due(&session, &policy, created + 60_000));
        // A clock that went backwards never triggers rotation.
        assert!(!rotation_due(&session, &policy, created.saturating_sub(10)));
    }

    #[test]
    fn export_from_later_index() {
        let groups = manager();
        let outbound = groups.new_outbound_group_session("!room:x").unwrap();
        let inbound = groups
            .find_inbound_group_session("!room:x", outbound.session_id())
            .unwrap();
        let early = outbound.encrypt(b"early");
        let late = outbound.encrypt(b"late");

        let exported = inbound.exported_at(1).unwrap();
        let imported = InboundGroupSession::import(
            Arc::new(VodozemacEngine::new()),
            "!room:x",
            &exported.export_blob,
            None,
            None,
            vec!["forwarder".into()],
        )
        .unwrap();
        assert!(imported.imported());
        assert_eq!(imported.first_known_index(), 1);
        assert_eq!(imported.decrypt(&late).unwrap().message_index, 1);
        assert!(matches!(
            imported.decrypt(&early),
            Err(E2eError::Decryption { .. })
        ));
        assert!(imported.exported_at(0).is_none());
    }

    #[test]
    fn full_export_matches_first_index() {
        let groups = manager();
        let outbound = groups.new_outbound_group_session("!room:x").unwrap();
        let inbound = groups
            .find_inbound_group_session("!room:x", outbound.session_id())
            .unwrap();
        let exported = groups.export(&inbound).unwrap();
        assert_eq!(exported.first_known_index, 0);
    }

    #[test]
    fn requires_initialised_identity() {
        let engine = Arc::new(VodozemacEngine::new());
        let store = Arc::new(KeyStore::new(engine.clone()));
        let identity = Arc::new(E2eIdentity::new(engine.clone(), store.clone(), "@a:x", "A"));
        let groups = GroupSessionManager::new(engine, store, identity);
        assert!(matches!(
            groups.new_outbound_group_session("!r:x"),
            Err(E2eError::NotInitialised)
        ));
    }
}
