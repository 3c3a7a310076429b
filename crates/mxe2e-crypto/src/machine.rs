//! The client-facing entry point tying the E2E components together.
//!
//! [`CryptoClient`] owns one device's key store and exposes the operations
//! a Matrix client's send path and sync loop call. Network access goes
//! through a [`KeyTransport`]; no store lock is held across an `.await`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mxe2e_protocol::keys::DeviceKeys;
use mxe2e_protocol::messages::{
    ForwardedRoomKeyContent, KeySharingEvent, MegolmEncryptedContent, MegolmPayload,
    OlmCiphertextBody, OlmEncryptedContent, OlmPayload, RoomKeyContent, ToDeviceMessage,
};
use mxe2e_protocol::types::{
    split_key_id, CURVE25519, ED25519, FORWARDED_ROOM_KEY_EVENT, MEGOLM_V1_ALGORITHM,
    OLM_V1_ALGORITHM, ROOM_ENCRYPTED_EVENT, ROOM_KEY_EVENT, SIGNED_CURVE25519,
};
use mxe2e_protocol::ProtocolError;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{CryptoConfig, RotationPolicy};
use crate::devices::DeviceKeyDirectory;
use crate::engine::{CryptoEngine, OlmCiphertext};
use crate::error::{DeviceKeyError, E2eError, Result};
use crate::group::{GroupSessionManager, OutboundGroupSession};
use crate::identity::E2eIdentity;
use crate::one_time_keys::prepare_upload;
use crate::room_keys::{KeySender, RoomKeyOutcome, RoomKeyProtocol};
use crate::session::SessionManager;
use crate::stores::KeyStore;
use crate::transport::KeyTransport;

/// Result of decrypting a Megolm room event.
#[derive(Debug)]
pub enum RoomEventDecryption {
    Decrypted {
        event: MegolmPayload,
        message_index: u32,
        /// Curve25519 key of the device that created the session.
        sender_key: Option<String>,
        /// The key reached us through a forward rather than from its creator.
        forwarded: bool,
    },
    Undecryptable {
        session_id: String,
        reason: String,
    },
}

/// What became of a received to-device event.
#[derive(Debug)]
pub enum ToDeviceOutcome {
    RoomKey(RoomKeyOutcome),
    /// Decrypted, but not a key-sharing event.
    Decrypted(OlmPayload),
    Dropped(E2eError),
    /// Not an encrypted event; room keys are only accepted over Olm.
    NotEncrypted,
}

pub struct CryptoClient<E: CryptoEngine> {
    config: CryptoConfig,
    rotation: RotationPolicy,
    store: Arc<KeyStore<E>>,
    identity: Arc<E2eIdentity<E>>,
    sessions: SessionManager<E>,
    groups: Arc<GroupSessionManager<E>>,
    devices: DeviceKeyDirectory<E>,
    room_keys: RoomKeyProtocol<E>,
    device_keys_uploaded: AtomicBool,
}

impl<E: CryptoEngine> CryptoClient<E> {
    /// A client with a memory-only key store.
    pub fn new(config: CryptoConfig, engine: Arc<E>) -> Result<Self> {
        let store = Arc::new(KeyStore::new(engine.clone()));
        Self::with_store(config, engine, store)
    }

    /// A client whose key store is mirrored to `config.store_path`,
    /// encrypted under `passphrase`. Falls back to memory when no path is
    /// configured.
    pub fn open(config: CryptoConfig, engine: Arc<E>, passphrase: &str) -> Result<Self> {
        let store = match &config.store_path {
            Some(path) => KeyStore::open(
                engine.clone(),
                Path::new(path),
                passphrase,
                config.kdf_iterations,
            )?,
            None => KeyStore::new(engine.clone()),
        };
        Self::with_store(config, engine, Arc::new(store))
    }

    pub fn with_store(config: CryptoConfig, engine: Arc<E>, store: Arc<KeyStore<E>>) -> Result<Self> {
        let identity = Arc::new(E2eIdentity::new(
            engine.clone(),
            store.clone(),
            config.user_id.clone(),
            config.device_id.clone(),
        ));
        identity.initialise()?;

        let sessions = SessionManager::new(engine.clone(), store.clone(), identity.clone());
        let groups = Arc::new(GroupSessionManager::new(
            engine.clone(),
            store.clone(),
            identity.clone(),
        ));
        let room_keys = RoomKeyProtocol::new(engine.clone(), groups.clone());
        let devices = DeviceKeyDirectory::new(engine);

        Ok(Self {
            rotation: config.rotation_policy(),
            config,
            store,
            identity,
            sessions,
            groups,
            devices,
            room_keys,
            device_keys_uploaded: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CryptoConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<KeyStore<E>> {
        &self.store
    }

    pub fn identity(&self) -> &E2eIdentity<E> {
        &self.identity
    }

    pub fn sessions(&self) -> &SessionManager<E> {
        &self.sessions
    }

    pub fn groups(&self) -> &GroupSessionManager<E> {
        &self.groups
    }

    pub fn devices(&self) -> &DeviceKeyDirectory<E> {
        &self.devices
    }

    pub fn room_keys(&self) -> &RoomKeyProtocol<E> {
        &self.room_keys
    }

    // ── Key upload ───────────────────────────────────────────────────

    /// Upload the device keys (first call only) and enough one-time keys to
    /// bring the server's count, currently `server_count`, up to target.
    /// Returns the server's count after the upload.
    pub async fn upload_keys<T>(&self, transport: &T, server_count: usize) -> Result<usize>
    where
        T: KeyTransport + ?Sized,
    {
        let include_device_keys = !self.device_keys_uploaded.load(Ordering::Acquire);
        let upload = prepare_upload(
            &self.identity,
            server_count,
            self.config.one_time_key_target_fraction,
            include_device_keys,
        )?;
        if upload.is_empty() {
            debug!(server_count, "no keys to upload");
            return Ok(server_count);
        }

        let count = transport
            .upload_keys(&upload)
            .await
            .map_err(E2eError::Transport)?;
        if upload.device_keys.is_some() {
            self.device_keys_uploaded.store(true, Ordering::Release);
        }
        self.identity.mark_one_time_keys_published()?;
        info!(
            one_time_keys = upload.one_time_keys.len(),
            device_keys = upload.device_keys.is_some(),
            server_count = count,
            "uploaded keys"
        );
        Ok(count)
    }

    // ── Sending ──────────────────────────────────────────────────────

    /// The room's outbound session, replaced first if the rotation policy
    /// says it is spent.
    fn current_outbound(&self, room_id: &str) -> Result<Arc<OutboundGroupSession<E>>> {
        match self.groups.find_outbound_group_session(room_id) {
            Some(session) if !self.groups.needs_rotation(&session, &self.rotation) => Ok(session),
            Some(session) => {
                info!(
                    room_id,
                    session_id = session.session_id(),
                    message_index = session.message_index(),
                    "rotating outbound group session"
                );
                self.groups.new_outbound_group_session(room_id)
            }
            None => self.groups.new_outbound_group_session(room_id),
        }
    }

    /// Megolm-encrypt a room event.
    ///
    /// Call [`Self::share_room_key`] first: a rotation here starts a
    /// session the room members have not received yet.
    pub fn encrypt_room_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<MegolmEncryptedContent> {
        self.identity.ensure_initialised()?;
        let session = self.current_outbound(room_id)?;
        let payload = MegolmPayload {
            event_type: event_type.to_string(),
            content,
            room_id: room_id.to_string(),
        };
        let plaintext = serde_json::to_vec(&payload).map_err(ProtocolError::from)?;
        let ciphertext = session.encrypt(&plaintext);
        let own = self.identity.identity_keys()?;

        Ok(MegolmEncryptedContent {
            algorithm: MEGOLM_V1_ALGORITHM.to_string(),
            sender_key: own.curve25519,
            ciphertext,
            session_id: session.session_id().to_string(),
            device_id: self.config.device_id.clone(),
        })
    }

    /// Send the room's current session key to each device over Olm.
    ///
    /// Devices with an invalid bundle, or for which no Olm session can be
    /// set up, are skipped with a warning. Returns the number of devices
    /// the key was sent to.
    pub async fn share_room_key<T>(&self, room_id: &str, devices: &[DeviceKeys], transport: &T) -> Result<usize>
    where
        T: KeyTransport + ?Sized,
    {
        let session = self.current_outbound(room_id)?;
        let room_key = RoomKeyContent {
            algorithm: MEGOLM_V1_ALGORITHM.to_string(),
            room_id: room_id.to_string(),
            session_id: Some(session.session_id().to_string()),
            session_key: session.session_key(),
        };
        let room_key = serde_json::to_value(&room_key).map_err(ProtocolError::from)?;

        let mut messages = Vec::with_capacity(devices.len());
        for device in devices {
            if device.user_id == self.config.user_id && device.device_id == self.config.device_id {
                continue;
            }
            if !device.supports(OLM_V1_ALGORITHM) || !device.supports(MEGOLM_V1_ALGORITHM) {
                warn!(user_id = %device.user_id, device_id = %device.device_id, "skipping device without olm/megolm support");
                continue;
            }
            if !self.devices.verify_device_keys(device) {
                warn!(user_id = %device.user_id, device_id = %device.device_id, "skipping device with invalid keys");
                continue;
            }
            if !self.ensure_olm_session(device, transport).await? {
                warn!(user_id = %device.user_id, device_id = %device.device_id, "no olm session, room key not sent");
                continue;
            }
            let encrypted = self.encrypt_for_device(device, ROOM_KEY_EVENT, room_key.clone())?;
            messages.push(ToDeviceMessage {
                user_id: device.user_id.clone(),
                device_id: device.device_id.clone(),
                content: serde_json::to_value(&encrypted).map_err(ProtocolError::from)?,
            });
        }

        if messages.is_empty() {
            return Ok(0);
        }
        transport
            .send_to_device(ROOM_ENCRYPTED_EVENT, &messages)
            .await
            .map_err(E2eError::Transport)?;
        info!(
            room_id,
            session_id = session.session_id(),
            devices = messages.len(),
            "shared room key"
        );
        Ok(messages.len())
    }

    /// Make sure an Olm session with `device` exists, claiming one of its
    /// one-time keys when needed. `false` when the device has no usable
    /// one-time key.
    pub async fn ensure_olm_session<T>(&self, device: &DeviceKeys, transport: &T) -> Result<bool>
    where
        T: KeyTransport + ?Sized,
    {
        let curve25519 = device_key(device, CURVE25519)?;
        if self.sessions.has_session(curve25519) {
            return Ok(true);
        }

        let claimed = transport
            .claim_one_time_key(&device.user_id, &device.device_id)
            .await
            .map_err(E2eError::Transport)?;
        let Some(claimed) = claimed else {
            return Ok(false);
        };
        match split_key_id(&claimed.key_id) {
            Ok((SIGNED_CURVE25519, _)) => {}
            _ => {
                warn!(
                    user_id = %device.user_id,
                    device_id = %device.device_id,
                    key_id = %claimed.key_id,
                    "claimed key is not a signed curve25519 key"
                );
                return Ok(false);
            }
        }
        if !self.devices.verify_one_time_key(device, &claimed.key) {
            warn!(
                user_id = %device.user_id,
                device_id = %device.device_id,
                key_id = %claimed.key_id,
                "claimed one-time key has a bad signature"
            );
            return Ok(false);
        }
        self.sessions.outbound_session(curve25519, &claimed.key.key)?;
        Ok(true)
    }

    /// Olm-encrypt a to-device event for one device. An Olm session with
    /// the device must already exist.
    pub fn encrypt_for_device(
        &self,
        device: &DeviceKeys,
        event_type: &str,
        content: Value,
    ) -> Result<OlmEncryptedContent> {
        let own = self.identity.identity_keys()?;
        let curve25519 = device_key(device, CURVE25519)?;
        let ed25519 = device_key(device, ED25519)?;

        let payload = OlmPayload {
            event_type: event_type.to_string(),
            content,
            sender: self.config.user_id.clone(),
            sender_device: Some(self.config.device_id.clone()),
            recipient: device.user_id.clone(),
            keys: BTreeMap::from([(ED25519.to_string(), own.ed25519)]),
            recipient_keys: BTreeMap::from([(ED25519.to_string(), ed25519.to_string())]),
        };
        let plaintext = serde_json::to_vec(&payload).map_err(ProtocolError::from)?;
        let message = self.sessions.encrypt(curve25519, &plaintext)?;

        Ok(OlmEncryptedContent {
            algorithm: OLM_V1_ALGORITHM.to_string(),
            sender_key: own.curve25519,
            ciphertext: BTreeMap::from([(
                curve25519.to_string(),
                OlmCiphertextBody {
                    message_type: message.message_type,
                    body: message.body,
                },
            )]),
        })
    }

    /// Build a forwarded room key for one of our inbound sessions.
    pub fn forward_room_key(&self, room_id: &str, session_id: &str) -> Result<ForwardedRoomKeyContent> {
        let session = self
            .groups
            .find_inbound_group_session(room_id, session_id)
            .ok_or_else(|| E2eError::State(format!("no inbound group session {session_id} in {room_id}")))?;
        let (Some(sender_key), Some(signing_key)) = (session.sender_key(), session.signing_key()) else {
            return Err(E2eError::State(format!(
                "inbound group session {session_id} has no known creator"
            )));
        };
        let exported = self.groups.export(&session)?;

        Ok(ForwardedRoomKeyContent {
            algorithm: MEGOLM_V1_ALGORITHM.to_string(),
            room_id: room_id.to_string(),
            sender_key: sender_key.to_string(),
            session_id: Some(session_id.to_string()),
            session_key: exported.export_blob,
            sender_claimed_ed25519_key: signing_key.to_string(),
            forwarding_curve25519_key_chain: session.forwarding_chain().to_vec(),
            chain_index: Some(exported.first_known_index),
        })
    }

    // ── Receiving ────────────────────────────────────────────────────

    /// Handle a to-device event from `sender`. Never fails: anything that
    /// cannot be decrypted or validated is logged and dropped.
    pub fn receive_to_device(&self, sender: &str, event_type: &str, content: Value) -> ToDeviceOutcome {
        if event_type != ROOM_ENCRYPTED_EVENT {
            debug!(sender, event_type, "ignoring unencrypted to-device event");
            return ToDeviceOutcome::NotEncrypted;
        }

        let (payload, key_sender) = match self.decrypt_to_device(sender, content) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                warn!(sender, "dropping to-device event: {e}");
                return ToDeviceOutcome::Dropped(e);
            }
        };

        if payload.event_type != ROOM_KEY_EVENT && payload.event_type != FORWARDED_ROOM_KEY_EVENT {
            return ToDeviceOutcome::Decrypted(payload);
        }
        match KeySharingEvent::from_event(&payload.event_type, payload.content) {
            Ok(Some(event)) => ToDeviceOutcome::RoomKey(self.room_keys.handle(event, &key_sender)),
            Ok(None) => ToDeviceOutcome::Dropped(E2eError::State(format!(
                "unexpected key-sharing event type {}",
                payload.event_type
            ))),
            Err(e) => {
                warn!(sender, event_type = %payload.event_type, "malformed key-sharing event: {e}");
                ToDeviceOutcome::Dropped(e.into())
            }
        }
    }

    fn decrypt_to_device(&self, sender: &str, content: Value) -> Result<(OlmPayload, KeySender)> {
        let content: OlmEncryptedContent =
            serde_json::from_value(content).map_err(ProtocolError::from)?;
        if content.algorithm != OLM_V1_ALGORITHM {
            return Err(E2eError::UnsupportedAlgorithm(content.algorithm));
        }
        let own = self.identity.identity_keys()?;
        let body = content
            .ciphertext
            .get(&own.curve25519)
            .ok_or_else(|| E2eError::State("event not encrypted for this device".into()))?;
        let message = OlmCiphertext {
            message_type: body.message_type,
            body: body.body.clone(),
        };

        let plaintext = self.sessions.decrypt(&content.sender_key, &message)?;
        let payload: OlmPayload = serde_json::from_slice(&plaintext).map_err(ProtocolError::from)?;

        if payload.sender != sender {
            return Err(E2eError::State(format!(
                "payload claims sender {}, event came from {sender}",
                payload.sender
            )));
        }
        if payload.recipient != self.config.user_id
            || payload.recipient_keys.get(ED25519) != Some(&own.ed25519)
        {
            return Err(E2eError::State("payload addressed to another device".into()));
        }
        let claimed_ed25519 = payload.keys.get(ED25519).cloned();
        if let Some(device) = self.devices.device_by_curve25519(sender, &content.sender_key) {
            if device.ed25519_key() != claimed_ed25519.as_deref() {
                return Err(E2eError::State(format!(
                    "ed25519 key in payload does not match device {}",
                    device.device_id
                )));
            }
        }

        Ok((
            payload,
            KeySender {
                curve25519: Some(content.sender_key),
                ed25519: claimed_ed25519,
            },
        ))
    }

    /// Decrypt a Megolm room event. Never fails: problems are reported as
    /// [`RoomEventDecryption::Undecryptable`].
    pub fn decrypt_room_event(&self, room_id: &str, content: &MegolmEncryptedContent) -> RoomEventDecryption {
        match self.try_decrypt_room_event(room_id, content) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                warn!(room_id, session_id = %content.session_id, "undecryptable room event: {e}");
                RoomEventDecryption::Undecryptable {
                    session_id: content.session_id.clone(),
                    reason: e.to_string(),
                }
            }
        }
    }

    fn try_decrypt_room_event(
        &self,
        room_id: &str,
        content: &MegolmEncryptedContent,
    ) -> Result<RoomEventDecryption> {
        if content.algorithm != MEGOLM_V1_ALGORITHM {
            return Err(E2eError::UnsupportedAlgorithm(content.algorithm.clone()));
        }
        let session = self
            .groups
            .find_inbound_group_session(room_id, &content.session_id)
            .ok_or_else(|| E2eError::State("unknown inbound group session".into()))?;
        if let Some(sender_key) = session.sender_key() {
            if sender_key != content.sender_key {
                return Err(E2eError::State(
                    "sender key does not match the session creator".into(),
                ));
            }
        }

        let decrypted = self.groups.decrypt(&session, &content.ciphertext)?;
        let event: MegolmPayload =
            serde_json::from_slice(&decrypted.plaintext).map_err(ProtocolError::from)?;
        if event.room_id != room_id {
            return Err(E2eError::State(format!(
                "event was encrypted for room {}",
                event.room_id
            )));
        }

        Ok(RoomEventDecryption::Decrypted {
            event,
            message_index: decrypted.message_index,
            sender_key: session.sender_key().map(str::to_string),
            forwarded: !session.forwarding_chain().is_empty(),
        })
    }
}

fn device_key<'a>(device: &'a DeviceKeys, algorithm: &'static str) -> Result<&'a str> {
    let key = match algorithm {
        ED25519 => device.ed25519_key(),
        _ => device.curve25519_key(),
    };
    key.ok_or_else(|| {
        DeviceKeyError::MissingKey {
            user_id: device.user_id.clone(),
            device_id: device.device_id.clone(),
            algorithm,
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::VodozemacEngine;
    use crate::transport::ClaimedKey;
    use async_trait::async_trait;
    use mxe2e_protocol::keys::{KeysUpload, QueriedDeviceKeys};
    use serde_json::json;

    fn client(user: &str, device: &str) -> CryptoClient<VodozemacEngine> {
        CryptoClient::new(
            CryptoConfig::for_device(user, device),
            Arc::new(VodozemacEngine::new()),
        )
        .unwrap()
    }

    #[test]
    fn own_room_events_decrypt() {
        let alice = client("@alice:x", "ALICE");
        let content = alice
            .encrypt_room_event("!room:x", "m.room.message", json!({"body": "hi"}))
            .unwrap();
        assert_eq!(content.device_id, "ALICE");

        match alice.decrypt_room_event("!room:x", &content) {
            RoomEventDecryption::Decrypted {
                event,
                message_index,
                forwarded,
                ..
            } => {
                assert_eq!(event.event_type, "m.room.message");
                assert_eq!(event.content, json!({"body": "hi"}));
                assert_eq!(message_index, 0);
                assert!(!forwarded);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn event_replayed_into_other_room_is_undecryptable() {
        let alice = client("@alice:x", "ALICE");
        let content = alice
            .encrypt_room_event("!room:x", "m.room.message", json!({}))
            .unwrap();
        assert!(matches!(
            alice.decrypt_room_event("!other:x", &content),
            RoomEventDecryption::Undecryptable { .. }
        ));
    }

    #[test]
    fn rotates_after_configured_message_count() {
        let mut config = CryptoConfig::for_device("@alice:x", "ALICE");
        config.rotation_max_messages = 2;
        let alice = CryptoClient::new(config, Arc::new(VodozemacEngine::new())).unwrap();

        let first = alice.encrypt_room_event("!room:x", "m", json!({})).unwrap();
        let second = alice.encrypt_room_event("!room:x", "m", json!({})).unwrap();
        let third = alice.encrypt_room_event("!room:x", "m", json!({})).unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_ne!(second.session_id, third.session_id);
        // History stays readable after rotation.
        assert!(matches!(
            alice.decrypt_room_event("!room:x", &first),
            RoomEventDecryption::Decrypted { .. }
        ));
    }

    #[test]
    fn unencrypted_room_key_is_ignored() {
        let alice = client("@alice:x", "ALICE");
        let outcome = alice.receive_to_device(
            "@mallory:x",
            "m.room_key",
            json!({
                "algorithm": MEGOLM_V1_ALGORITHM,
                "room_id": "!room:x",
                "session_id": "sid",
                "session_key": "key",
            }),
        );
        assert!(matches!(outcome, ToDeviceOutcome::NotEncrypted));
    }

    #[test]
    fn garbage_to_device_is_dropped() {
        let alice = client("@alice:x", "ALICE");
        let outcome = alice.receive_to_device("@bob:x", ROOM_ENCRYPTED_EVENT, json!({"nope": 1}));
        assert!(matches!(outcome, ToDeviceOutcome::Dropped(E2eError::Protocol(_))));
    }

    struct ClaimOnly(Option<ClaimedKey>);

    #[async_trait]
    impl KeyTransport for ClaimOnly {
        async fn upload_keys(&self, _: &KeysUpload) -> anyhow::Result<usize> {
            Ok(0)
        }
        async fn query_keys(&self, _: &[String]) -> anyhow::Result<QueriedDeviceKeys> {
            Ok(QueriedDeviceKeys::new())
        }
        async fn claim_one_time_key(&self, _: &str, _: &str) -> anyhow::Result<Option<ClaimedKey>> {
            Ok(self.0.clone())
        }
        async fn send_to_device(&self, _: &str, _: &[ToDeviceMessage]) -> anyhow::Result<()> {
            anyhow::bail!("nothing should be sent")
        }
    }

    #[tokio::test]
    async fn claimed_key_of_wrong_algorithm_is_refused() {
        let alice = client("@alice:x", "ALICE");
        let bob = client("@bob:x", "BOB");
        bob.identity().generate_one_time_keys(1).unwrap();
        let (key_id, key) = bob
            .identity()
            .signed_one_time_keys()
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        let bob_device = bob.identity().device_keys().unwrap();

        let mislabelled = ClaimOnly(Some(ClaimedKey {
            key_id: key_id.replace(SIGNED_CURVE25519, CURVE25519),
            key: key.clone(),
        }));
        assert!(!alice.ensure_olm_session(&bob_device, &mislabelled).await.unwrap());
        assert!(!alice.sessions().has_session(bob_device.curve25519_key().unwrap()));

        let proper = ClaimOnly(Some(ClaimedKey { key_id, key }));
        assert!(alice.ensure_olm_session(&bob_device, &proper).await.unwrap());
    }

    #[tokio::test]
    async fn devices_without_megolm_get_no_room_key() {
        let alice = client("@alice:x", "ALICE");
        let bob = client("@bob:x", "BOB");
        let mut bob_device = bob.identity().device_keys().unwrap();
        bob_device.algorithms.retain(|a| a == OLM_V1_ALGORITHM);

        let sent = alice
            .share_room_key("!room:x", &[bob_device], &ClaimOnly(None))
            .await
            .unwrap();
        assert_eq!(sent, 0);
    }

    #[test]
    fn forwarding_own_session() {
        let alice = client("@alice:x", "ALICE");
        let content = alice.encrypt_room_event("!room:x", "m", json!({})).unwrap();
        let forwarded = alice.forward_room_key("!room:x", &content.session_id).unwrap();
        assert_eq!(forwarded.chain_index, Some(0));
        assert_eq!(forwarded.sender_key, content.sender_key);
        assert!(forwarded.forwarding_curve25519_key_chain.is_empty());
        assert!(alice.forward_room_key("!room:x", "unknown").is_err());
    }
}
