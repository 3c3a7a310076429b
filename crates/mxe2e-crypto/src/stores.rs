//! The key store: exclusive owner of the account, Olm sessions and Megolm
//! sessions.
//!
//! Locking is per scope rather than global:
//! - the account (identity + one-time keys) sits behind one mutex;
//! - Olm sessions are grouped per peer identity key in a `DashMap`, and
//!   [`KeyStore::with_peer_sessions`] holds that peer's entry for the whole
//!   closure, which is what makes check-then-create atomic per peer;
//! - outbound group sessions are keyed by room, inbound ones by
//!   `(room_id, session_id)`.
//!
//! Lock order is peer entry -> account, and outbound room entry -> inbound
//! entry. Nothing takes them the other way round.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::engine::{CryptoEngine, GroupSessionOrdering, IdentityKeys};
use crate::error::{E2eError, Result};
use crate::group::{InboundGroupSession, OutboundGroupSession};
use crate::persistence::{
    EncryptedFileStore, InboundGroupSessionRecord, OlmSessionRecord,
    OutboundGroupSessionRecord, StoreSnapshot,
};
use crate::session::OlmSession;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What happened to an inbound group session offered to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundInsert {
    /// No session with this id was known for the room.
    Inserted,
    /// The new session reaches further back and replaced the stored one.
    Replaced,
    /// The stored session was at least as good; the new one was dropped.
    KeptExisting,
}

pub struct KeyStore<E: CryptoEngine> {
    engine: Arc<E>,
    account: Mutex<Option<E::Account>>,
    olm_sessions: DashMap<String, Vec<Arc<OlmSession<E>>>>,
    outbound_group_sessions: DashMap<String, Arc<OutboundGroupSession<E>>>,
    inbound_group_sessions: DashMap<(String, String), Arc<InboundGroupSession<E>>>,
    file: Option<EncryptedFileStore>,
    flush_lock: Mutex<()>,
}

impl<E: CryptoEngine> KeyStore<E> {
    /// An empty, memory-only store.
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            account: Mutex::new(None),
            olm_sessions: DashMap::new(),
            outbound_group_sessions: DashMap::new(),
            inbound_group_sessions: DashMap::new(),
            file: None,
            flush_lock: Mutex::new(()),
        }
    }

    /// A store mirrored to an encrypted file. Existing contents are loaded.
    pub fn open(engine: Arc<E>, path: &Path, passphrase: &str, kdf_iterations: u32) -> Result<Self> {
        let (file, snapshot) = EncryptedFileStore::open(path, passphrase, kdf_iterations)
            .map_err(E2eError::Persistence)?;
        let mut store = match snapshot {
            Some(snapshot) => Self::restore(engine, &snapshot)?,
            None => Self::new(engine),
        };
        store.file = Some(file);
        Ok(store)
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    // ── Account ──────────────────────────────────────────────────────

    pub fn has_identity(&self) -> bool {
        lock(&self.account).is_some()
    }

    /// Run `f` with exclusive access to the account.
    ///
    /// Fails with [`E2eError::State`] when no identity has been stored.
    pub fn with_identity<R>(&self, f: impl FnOnce(&mut E::Account) -> R) -> Result<R> {
        let mut guard = lock(&self.account);
        let account = guard
            .as_mut()
            .ok_or_else(|| E2eError::State("no identity in key store".into()))?;
        Ok(f(account))
    }

    pub fn identity_keys(&self) -> Result<IdentityKeys> {
        self.with_identity(|account| self.engine.identity_keys(account))
    }

    pub fn put_identity(&self, account: E::Account) {
        *lock(&self.account) = Some(account);
    }

    /// Store an account produced by `generate` unless one already exists.
    /// Returns `true` when a new account was stored.
    pub fn put_identity_if_absent(&self, generate: impl FnOnce() -> E::Account) -> bool {
        let mut guard = lock(&self.account);
        if guard.is_some() {
            return false;
        }
        *guard = Some(generate());
        true
    }

    // ── Olm sessions ─────────────────────────────────────────────────

    /// Store a session under its peer identity key, replacing any stored
    /// session with the same id.
    pub fn store_olm_session(&self, session: Arc<OlmSession<E>>) {
        self.with_peer_sessions(session.peer_identity_key(), |sessions| {
            upsert_olm_session(sessions, session.clone());
        });
    }

    /// All sessions with a peer. Empty when there are none.
    pub fn all_olm_sessions(&self, peer_identity_key: &str) -> Vec<Arc<OlmSession<E>>> {
        self.olm_sessions
            .get(peer_identity_key)
            .map(|sessions| sessions.clone())
            .unwrap_or_default()
    }

    /// Run `f` while holding the peer's session slot exclusively.
    ///
    /// `f` must not call back into the Olm session methods of this store.
    pub fn with_peer_sessions<R>(
        &self,
        peer_identity_key: &str,
        f: impl FnOnce(&mut Vec<Arc<OlmSession<E>>>) -> R,
    ) -> R {
        let mut entry = self
            .olm_sessions
            .entry(peer_identity_key.to_string())
            .or_default();
        f(entry.value_mut())
    }

    // ── Megolm sessions ──────────────────────────────────────────────

    pub fn store_outbound_group_session(&self, session: Arc<OutboundGroupSession<E>>) {
        self.outbound_group_sessions
            .insert(session.room_id().to_string(), session);
    }

    /// Store an outbound session together with its mirrored inbound session.
    ///
    /// The inbound half is written first while the room's outbound slot is
    /// held, so a reader that sees the new outbound session always finds
    /// its inbound counterpart.
    pub fn store_outbound_with_mirror(
        &self,
        outbound: Arc<OutboundGroupSession<E>>,
        inbound: InboundGroupSession<E>,
    ) -> Result<()> {
        let slot = self
            .outbound_group_sessions
            .entry(outbound.room_id().to_string());
        self.store_inbound_group_session(inbound)?;
        slot.insert(outbound);
        Ok(())
    }

    pub fn find_outbound_group_session(&self, room_id: &str) -> Option<Arc<OutboundGroupSession<E>>> {
        self.outbound_group_sessions
            .get(room_id)
            .map(|session| session.clone())
    }

    /// Store an inbound group session.
    ///
    /// When the id is already known the ratchets are compared: the offered
    /// session replaces the stored one only if it is the same ratchet and
    /// reaches further back, and creator keys learned directly from the
    /// creator are never replaced by forwarded claims. A different ratchet
    /// under a known id is refused with [`E2eError::UnconnectedSession`].
    pub fn store_inbound_group_session(&self, mut session: InboundGroupSession<E>) -> Result<InboundInsert> {
        let key = (
            session.room_id().to_string(),
            session.session_id().to_string(),
        );
        match self.inbound_group_sessions.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(session));
                Ok(InboundInsert::Inserted)
            }
            Entry::Occupied(mut slot) => match session.compare_with(slot.get()) {
                GroupSessionOrdering::Better => {
                    debug!(
                        room_id = session.room_id(),
                        session_id = session.session_id(),
                        "replacing inbound group session with an earlier-starting copy"
                    );
                    session.keep_creator_of(slot.get());
                    slot.insert(Arc::new(session));
                    Ok(InboundInsert::Replaced)
                }
                // Same ratchet, but now from the creator itself.
                GroupSessionOrdering::Equal if slot.get().imported() && !session.imported() => {
                    slot.insert(Arc::new(session));
                    Ok(InboundInsert::Replaced)
                }
                GroupSessionOrdering::Equal | GroupSessionOrdering::Worse => {
                    Ok(InboundInsert::KeptExisting)
                }
                GroupSessionOrdering::Unconnected => {
                    warn!(
                        room_id = session.room_id(),
                        session_id = session.session_id(),
                        "refusing inbound group session with a different ratchet"
                    );
                    Err(E2eError::UnconnectedSession {
                        room_id: session.room_id().to_string(),
                        session_id: session.session_id().to_string(),
                    })
                }
            },
        }
    }

    pub fn find_inbound_group_session(
        &self,
        room_id: &str,
        session_id: &str,
    ) -> Option<Arc<InboundGroupSession<E>>> {
        self.inbound_group_sessions
            .get(&(room_id.to_string(), session_id.to_string()))
            .map(|session| session.clone())
    }

    /// All inbound group sessions known for a room.
    pub fn inbound_group_sessions_for_room(&self, room_id: &str) -> Vec<Arc<InboundGroupSession<E>>> {
        self.inbound_group_sessions
            .iter()
            .filter(|entry| entry.key().0 == room_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Pickle everything in the store.
    ///
    /// Takes each lock on its own, so it must not be called while the
    /// caller holds the account or a session slot.
    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        let account = {
            let guard = lock(&self.account);
            match guard.as_ref() {
                Some(account) => Some(self.engine.pickle_account(account)?.into()),
                None => None,
            }
        };

        let peer_sessions: Vec<Arc<OlmSession<E>>> = self
            .olm_sessions
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        let olm_sessions = peer_sessions
            .iter()
            .map(|session| session.to_record())
            .collect::<Result<Vec<OlmSessionRecord>>>()?;

        let outbound: Vec<_> = self
            .outbound_group_sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let outbound_group_sessions = outbound
            .iter()
            .map(|session| session.to_record())
            .collect::<Result<Vec<OutboundGroupSessionRecord>>>()?;

        let inbound: Vec<_> = self
            .inbound_group_sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let inbound_group_sessions = inbound
            .iter()
            .map(|session| session.to_record())
            .collect::<Result<Vec<InboundGroupSessionRecord>>>()?;

        Ok(StoreSnapshot {
            account,
            olm_sessions,
            outbound_group_sessions,
            inbound_group_sessions,
        })
    }

    /// Rebuild a memory-only store from a snapshot.
    pub fn restore(engine: Arc<E>, snapshot: &StoreSnapshot) -> Result<Self> {
        let store = Self::new(engine.clone());
        if let Some(pickle) = &snapshot.account {
            store.put_identity(engine.unpickle_account(pickle)?);
        }
        for record in &snapshot.olm_sessions {
            store.store_olm_session(Arc::new(OlmSession::from_record(engine.clone(), record)?));
        }
        for record in &snapshot.outbound_group_sessions {
            store.store_outbound_group_session(Arc::new(OutboundGroupSession::from_record(
                engine.clone(),
                record,
            )?));
        }
        for record in &snapshot.inbound_group_sessions {
            store.store_inbound_group_session(InboundGroupSession::from_record(
                engine.clone(),
                record,
            )?)?;
        }
        Ok(store)
    }

    pub fn is_persistent(&self) -> bool {
        self.file.is_some()
    }

    /// Write the current contents to the attached file. No-op in memory.
    pub fn flush(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        // Serialises snapshot + write so an older snapshot never lands last.
        let _flushing = lock(&self.flush_lock);
        let snapshot = self.snapshot()?;
        file.save(&snapshot).map_err(|e| {
            warn!("key store flush failed: {e:#}");
            E2eError::Persistence(e)
        })
    }
}

fn upsert_olm_session<E: CryptoEngine>(sessions: &mut Vec<Arc<OlmSession<E>>>, session: Arc<OlmSession<E>>) {
    match sessions
        .iter_mut()
        .find(|s| s.session_id() == session.session_id())
    {
        Some(existing) => *existing = session,
        None => sessions.push(session),
    }
}
