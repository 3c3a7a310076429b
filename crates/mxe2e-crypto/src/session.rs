//! Pairwise Olm session establishment and message encryption/decryption.
//!
//! Sessions are keyed by the peer's Curve25519 identity key. Several
//! sessions may exist per peer (both sides can start one at the same time),
//! and each is told apart by its session id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::{CryptoEngine, OlmCiphertext};
use crate::error::{E2eError, EngineError, Result};
use crate::identity::E2eIdentity;
use crate::now_millis;
use crate::persistence::OlmSessionRecord;
use crate::stores::{lock, KeyStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionDirection {
    Outbound,
    Inbound,
}

/// One Olm ratchet shared with one peer device.
pub struct OlmSession<E: CryptoEngine> {
    engine: Arc<E>,
    session_id: String,
    peer_identity_key: String,
    direction: SessionDirection,
    created_at: u64,
    last_used: AtomicU64,
    ratchet: Mutex<E::Session>,
}

impl<E: CryptoEngine> std::fmt::Debug for OlmSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmSession")
            .field("session_id", &self.session_id)
            .field("peer_identity_key", &self.peer_identity_key)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl<E: CryptoEngine> OlmSession<E> {
    pub fn new(
        engine: Arc<E>,
        peer_identity_key: String,
        direction: SessionDirection,
        ratchet: E::Session,
    ) -> Self {
        let session_id = engine.session_id(&ratchet);
        let now = now_millis();
        Self {
            engine,
            session_id,
            peer_identity_key,
            direction,
            created_at: now,
            last_used: AtomicU64::new(now),
            ratchet: Mutex::new(ratchet),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn peer_identity_key(&self) -> &str {
        &self.peer_identity_key
    }

    pub fn direction(&self) -> SessionDirection {
        self.direction
    }

    /// Creation time, milliseconds since the Unix epoch.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> OlmCiphertext {
        let message = self
            .engine
            .encrypt_message(&mut lock(&self.ratchet), plaintext);
        self.touch();
        message
    }

    pub fn decrypt(&self, message: &OlmCiphertext) -> Result<Vec<u8>> {
        let plaintext = self
            .engine
            .decrypt_message(&mut lock(&self.ratchet), message)?;
        self.touch();
        Ok(plaintext)
    }

    /// Whether a pre-key message continues this session.
    pub fn matches_inbound(&self, message: &OlmCiphertext) -> bool {
        self.engine
            .session_matches_inbound(&lock(&self.ratchet), message)
    }

    fn touch(&self) {
        self.last_used.fetch_max(now_millis(), Ordering::Relaxed);
    }

    pub(crate) fn to_record(&self) -> Result<OlmSessionRecord> {
        let pickle = self.engine.pickle_session(&lock(&self.ratchet))?;
        Ok(OlmSessionRecord {
            peer_identity_key: self.peer_identity_key.clone(),
            direction: self.direction,
            created_at: self.created_at,
            last_used: self.last_used(),
            pickle: pickle.into(),
        })
    }

    pub(crate) fn from_record(engine: Arc<E>, record: &OlmSessionRecord) -> Result<Self> {
        let ratchet = engine.unpickle_session(&record.pickle)?;
        Ok(Self {
            session_id: engine.session_id(&ratchet),
            engine,
            peer_identity_key: record.peer_identity_key.clone(),
            direction: record.direction,
            created_at: record.created_at,
            last_used: AtomicU64::new(record.last_used),
            ratchet: Mutex::new(ratchet),
        })
    }
}

/// Result of handling a pre-key message.
#[derive(Debug)]
pub struct InboundSession<E: CryptoEngine> {
    pub session: Arc<OlmSession<E>>,
    /// Plaintext of the pre-key message that was handled.
    pub plaintext: Vec<u8>,
    /// `false` when the message continued an existing session.
    pub created: bool,
}

pub struct SessionManager<E: CryptoEngine> {
    engine: Arc<E>,
    store: Arc<KeyStore<E>>,
    identity: Arc<E2eIdentity<E>>,
}

impl<E: CryptoEngine> SessionManager<E> {
    pub fn new(engine: Arc<E>, store: Arc<KeyStore<E>>, identity: Arc<E2eIdentity<E>>) -> Self {
        Self {
            engine,
            store,
            identity,
        }
    }

    /// Start a fresh session with a peer from one of its one-time keys.
    ///
    /// Never reuses an existing session. The new session is persisted
    /// before it is returned.
    pub fn outbound_session(
        &self,
        peer_identity_key: &str,
        peer_one_time_key: &str,
    ) -> Result<Arc<OlmSession<E>>> {
        self.identity.ensure_initialised()?;
        let ratchet = self.store.with_identity(|account| {
            self.engine
                .init_outbound_session(account, peer_identity_key, peer_one_time_key)
        })??;
        let session = Arc::new(OlmSession::new(
            self.engine.clone(),
            peer_identity_key.to_string(),
            SessionDirection::Outbound,
            ratchet,
        ));
        self.store.store_olm_session(session.clone());
        self.store.flush()?;

        info!(
            peer = peer_identity_key,
            session_id = session.session_id(),
            "created outbound olm session"
        );
        Ok(session)
    }

    /// Handle a pre-key message from a peer.
    ///
    /// A stored session that the message continues is reused. Only when none
    /// matches is a new session created, consuming the one-time key the
    /// message names. The whole check-then-create runs with the peer's
    /// session slot held, so two racing pre-key messages from the same
    /// conversation cannot produce two sessions.
    pub fn inbound_session(
        &self,
        sender_identity_key: &str,
        message: &OlmCiphertext,
    ) -> Result<InboundSession<E>> {
        self.identity.ensure_initialised()?;
        if !message.is_prekey() {
            return Err(EngineError::MalformedMessage(
                "inbound sessions are only created from pre-key messages".into(),
            )
            .into());
        }

        let outcome = self
            .store
            .with_peer_sessions(sender_identity_key, |sessions| -> Result<InboundSession<E>> {
                if let Some(existing) = sessions.iter().find(|s| s.matches_inbound(message)) {
                    let plaintext = existing.decrypt(message)?;
                    return Ok(InboundSession {
                        session: existing.clone(),
                        plaintext,
                        created: false,
                    });
                }

                let (ratchet, plaintext) = self.store.with_identity(|account| {
                    self.engine
                        .init_inbound_session(account, sender_identity_key, message)
                })??;
                let session = Arc::new(OlmSession::new(
                    self.engine.clone(),
                    sender_identity_key.to_string(),
                    SessionDirection::Inbound,
                    ratchet,
                ));
                sessions.push(session.clone());
                Ok(InboundSession {
                    session,
                    plaintext,
                    created: true,
                })
            })?;

        if outcome.created {
            // Session and the account (minus the consumed one-time key) go
            // to disk together. The message key is spent either way, so the
            // plaintext is returned even when the write fails.
            if let Err(e) = self.store.flush() {
                warn!(
                    peer = sender_identity_key,
                    session_id = outcome.session.session_id(),
                    "failed to persist inbound olm session: {e}"
                );
            }
            info!(
                peer = sender_identity_key,
                session_id = outcome.session.session_id(),
                "created inbound olm session"
            );
        } else {
            debug!(
                peer = sender_identity_key,
                session_id = outcome.session.session_id(),
                "pre-key message continues existing session"
            );
        }
        Ok(outcome)
    }

    /// Decrypt any Olm message from a peer.
    ///
    /// Pre-key messages go through [`Self::inbound_session`]; normal
    /// messages are tried against each stored session with the peer.
    pub fn decrypt(&self, sender_identity_key: &str, message: &OlmCiphertext) -> Result<Vec<u8>> {
        if message.is_prekey() {
            return Ok(self.inbound_session(sender_identity_key, message)?.plaintext);
        }
        self.identity.ensure_initialised()?;

        let sessions = self.store.all_olm_sessions(sender_identity_key);
        for session in &sessions {
            match session.decrypt(message) {
                Ok(plaintext) => return Ok(plaintext),
                Err(e) => debug!(
                    peer = sender_identity_key,
                    session_id = session.session_id(),
                    "session could not decrypt message: {e}"
                ),
            }
        }
        Err(EngineError::Decryption(format!(
            "no session with peer could decrypt message ({} tried)",
            sessions.len()
        ))
        .into())
    }

    /// The session to encrypt with for a peer: the most recently used one.
    pub fn session_for(&self, peer_identity_key: &str) -> Option<Arc<OlmSession<E>>> {
        self.store
            .all_olm_sessions(peer_identity_key)
            .into_iter()
            .max_by_key(|s| s.last_used())
    }

    pub fn has_session(&self, peer_identity_key: &str) -> bool {
        !self.store.all_olm_sessions(peer_identity_key).is_empty()
    }

    pub fn encrypt(&self, peer_identity_key: &str, plaintext: &[u8]) -> Result<OlmCiphertext> {
        self.identity.ensure_initialised()?;
        let session = self.session_for(peer_identity_key).ok_or_else(|| {
            E2eError::State(format!("no olm session with {peer_identity_key}"))
        })?;
        Ok(session.encrypt(plaintext))
    }
}
