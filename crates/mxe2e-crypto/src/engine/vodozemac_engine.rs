//! [`CryptoEngine`] backed by vodozemac's Olm and Megolm implementations.

use std::collections::{BTreeMap, HashSet};

use vodozemac::megolm::{
    ExportedSessionKey, GroupSession, GroupSessionPickle, InboundGroupSession,
    InboundGroupSessionPickle, MegolmMessage, SessionConfig as MegolmSessionConfig, SessionKey,
    SessionOrdering,
};
use vodozemac::olm::{Account, AccountPickle, OlmMessage, Session, SessionConfig, SessionPickle};
use vodozemac::{
    base64_decode, base64_encode, Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature,
};

use super::{CryptoEngine, GroupPlaintext, GroupSessionOrdering, IdentityKeys, OlmCiphertext};
use crate::error::EngineError;

/// Olm v1 / Megolm v1 engine. Holds no state of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct VodozemacEngine;

impl VodozemacEngine {
    pub fn new() -> Self {
        Self
    }
}

fn curve_key(key: &str) -> Result<Curve25519PublicKey, EngineError> {
    Curve25519PublicKey::from_base64(key).map_err(|e| EngineError::InvalidKey(e.to_string()))
}

/// Olm bodies travel as unpadded base64 of the raw message bytes.
fn olm_message(message: &OlmCiphertext) -> Result<OlmMessage, EngineError> {
    let body = base64_decode(&message.body)
        .map_err(|e| EngineError::MalformedMessage(e.to_string()))?;
    OlmMessage::from_parts(message.message_type as usize, &body)
        .map_err(|e| EngineError::MalformedMessage(e.to_string()))
}

fn to_pickle_string<T: serde::Serialize>(pickle: &T) -> Result<String, EngineError> {
    serde_json::to_string(pickle).map_err(|e| EngineError::Pickle(e.to_string()))
}

fn from_pickle_string<T: serde::de::DeserializeOwned>(pickle: &str) -> Result<T, EngineError> {
    serde_json::from_str(pickle).map_err(|e| EngineError::Pickle(e.to_string()))
}

impl CryptoEngine for VodozemacEngine {
    type Account = Account;
    type Session = Session;
    type OutboundGroupSession = GroupSession;
    type InboundGroupSession = InboundGroupSession;

    fn generate_account(&self) -> Account {
        Account::new()
    }

    fn identity_keys(&self, account: &Account) -> IdentityKeys {
        let keys = account.identity_keys();
        IdentityKeys {
            ed25519: keys.ed25519.to_base64(),
            curve25519: keys.curve25519.to_base64(),
        }
    }

    fn generate_one_time_keys(&self, account: &mut Account, count: usize) -> BTreeMap<String, String> {
        let before: HashSet<String> = account
            .one_time_keys()
            .keys()
            .map(|id| id.to_base64())
            .collect();
        let _ = account.generate_one_time_keys(count);
        account
            .one_time_keys()
            .into_iter()
            .map(|(id, key)| (id.to_base64(), key.to_base64()))
            .filter(|(id, _)| !before.contains(id))
            .collect()
    }

    fn unpublished_one_time_keys(&self, account: &Account) -> BTreeMap<String, String> {
        account
            .one_time_keys()
            .into_iter()
            .map(|(id, key)| (id.to_base64(), key.to_base64()))
            .collect()
    }

    fn max_one_time_keys(&self, account: &Account) -> usize {
        account.max_number_of_one_time_keys()
    }

    fn mark_one_time_keys_published(&self, account: &mut Account) {
        account.mark_keys_as_published();
    }

    fn sign(&self, account: &Account, message: &str) -> String {
        account.sign(message).to_base64()
    }

    fn verify_ed25519(&self, signature: &str, public_key: &str, message: &str) -> Result<(), EngineError> {
        let key = Ed25519PublicKey::from_base64(public_key)
            .map_err(|e| EngineError::InvalidKey(e.to_string()))?;
        let signature = Ed25519Signature::from_base64(signature)
            .map_err(|e| EngineError::Signature(e.to_string()))?;
        key.verify(message.as_bytes(), &signature)
            .map_err(|e| EngineError::Signature(e.to_string()))
    }

    fn init_outbound_session(
        &self,
        account: &Account,
        peer_identity_key: &str,
        peer_one_time_key: &str,
    ) -> Result<Session, EngineError> {
        let identity_key = curve_key(peer_identity_key)?;
        let one_time_key = curve_key(peer_one_time_key)?;
        Ok(account.create_outbound_session(SessionConfig::version_1(), identity_key, one_time_key))
    }

    fn init_inbound_session(
        &self,
        account: &mut Account,
        sender_identity_key: &str,
        message: &OlmCiphertext,
    ) -> Result<(Session, Vec<u8>), EngineError> {
        let sender = curve_key(sender_identity_key)?;
        let OlmMessage::PreKey(prekey) = olm_message(message)? else {
            return Err(EngineError::MalformedMessage(
                "expected a pre-key message".into(),
            ));
        };
        let result = account
            .create_inbound_session(sender, &prekey)
            .map_err(|e| EngineError::SessionCreation(e.to_string()))?;
        Ok((result.session, result.plaintext))
    }

    fn session_matches_inbound(&self, session: &Session, message: &OlmCiphertext) -> bool {
        match olm_message(message) {
            Ok(OlmMessage::PreKey(prekey)) => prekey.session_id() == session.session_id(),
            _ => false,
        }
    }

    fn session_id(&self, session: &Session) -> String {
        session.session_id()
    }

    fn encrypt_message(&self, session: &mut Session, plaintext: &[u8]) -> OlmCiphertext {
        let (message_type, body) = session.encrypt(plaintext).to_parts();
        OlmCiphertext {
            message_type: message_type as u8,
            body: base64_encode(body),
        }
    }

    fn decrypt_message(&self, session: &mut Session, message: &OlmCiphertext) -> Result<Vec<u8>, EngineError> {
        let message = olm_message(message)?;
        session
            .decrypt(&message)
            .map_err(|e| EngineError::Decryption(e.to_string()))
    }

    fn new_outbound_group_session(&self) -> GroupSession {
        GroupSession::new(MegolmSessionConfig::version_1())
    }

    fn outbound_group_session_id(&self, session: &GroupSession) -> String {
        session.session_id()
    }

    fn session_key(&self, session: &GroupSession) -> String {
        session.session_key().to_base64()
    }

    fn message_index(&self, session: &GroupSession) -> u32 {
        session.message_index()
    }

    fn group_encrypt(&self, session: &mut GroupSession, plaintext: &[u8]) -> String {
        session.encrypt(plaintext).to_base64()
    }

    fn new_inbound_group_session_from_key(&self, session_key: &str) -> Result<InboundGroupSession, EngineError> {
        let key = SessionKey::from_base64(session_key)
            .map_err(|e| EngineError::InvalidKey(e.to_string()))?;
        Ok(InboundGroupSession::new(&key, MegolmSessionConfig::version_1()))
    }

    fn import_inbound_group_session(&self, exported: &str) -> Result<InboundGroupSession, EngineError> {
        let key = ExportedSessionKey::from_base64(exported)
            .map_err(|e| EngineError::InvalidKey(e.to_string()))?;
        Ok(InboundGroupSession::import(&key, MegolmSessionConfig::version_1()))
    }

    fn inbound_group_session_id(&self, session: &InboundGroupSession) -> String {
        session.session_id()
    }

    fn first_known_index(&self, session: &InboundGroupSession) -> u32 {
        session.first_known_index()
    }

    fn compare_group_sessions(
        &self,
        session: &mut InboundGroupSession,
        other: &mut InboundGroupSession,
    ) -> GroupSessionOrdering {
        match session.compare(other) {
            SessionOrdering::Equal => GroupSessionOrdering::Equal,
            SessionOrdering::Better => GroupSessionOrdering::Better,
            SessionOrdering::Worse => GroupSessionOrdering::Worse,
            SessionOrdering::Unconnected => GroupSessionOrdering::Unconnected,
        }
    }

    fn export_session(&self, session: &mut InboundGroupSession, from_index: u32) -> Option<String> {
        session.export_at(from_index).map(|key| key.to_base64())
    }

    fn group_decrypt(&self, session: &mut InboundGroupSession, ciphertext: &str) -> Result<GroupPlaintext, EngineError> {
        let message = MegolmMessage::from_base64(ciphertext)
            .map_err(|e| EngineError::MalformedMessage(e.to_string()))?;
        let decrypted = session
            .decrypt(&message)
            .map_err(|e| EngineError::Decryption(e.to_string()))?;
        Ok(GroupPlaintext {
            plaintext: decrypted.plaintext,
            message_index: decrypted.message_index,
        })
    }

    fn pickle_account(&self, account: &Account) -> Result<String, EngineError> {
        to_pickle_string(&account.pickle())
    }

    fn unpickle_account(&self, pickle: &str) -> Result<Account, EngineError> {
        let pickle: AccountPickle = from_pickle_string(pickle)?;
        Ok(Account::from_pickle(pickle))
    }

    fn pickle_session(&self, session: &Session) -> Result<String, EngineError> {
        to_pickle_string(&session.pickle())
    }

    fn unpickle_session(&self, pickle: &str) -> Result<Session, EngineError> {
        let pickle: SessionPickle = from_pickle_string(pickle)?;
        Ok(Session::from_pickle(pickle))
    }

    fn pickle_outbound_group_session(&self, session: &GroupSession) -> Result<String, EngineError> {
        to_pickle_string(&session.pickle())
    }

    fn unpickle_outbound_group_session(&self, pickle: &str) -> Result<GroupSession, EngineError> {
        let pickle: GroupSessionPickle = from_pickle_string(pickle)?;
        Ok(GroupSession::from_pickle(pickle))
    }

    fn pickle_inbound_group_session(&self, session: &InboundGroupSession) -> Result<String, EngineError> {
        to_pickle_string(&session.pickle())
    }

    fn unpickle_inbound_group_session(&self, pickle: &str) -> Result<InboundGroupSession, EngineError> {
        let pickle: InboundGroupSessionPickle = from_pickle_string(pickle)?;
        Ok(InboundGroupSession::from_pickle(pickle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_keys_are_stable_per_account() {
        let engine = VodozemacEngine::new();
        let account = engine.generate_account();
        assert_eq!(engine.identity_keys(&account), engine.identity_keys(&account));
        let other = engine.generate_account();
        assert_ne!(engine.identity_keys(&account), engine.identity_keys(&other));
    }

    #[test]
    fn generate_returns_only_new_keys() {
        let engine = VodozemacEngine::new();
        let mut account = engine.generate_account();
        let first = engine.generate_one_time_keys(&mut account, 3);
        let second = engine.generate_one_time_keys(&mut account, 2);
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
        assert!(first.keys().all(|id| !second.contains_key(id)));
        assert_eq!(engine.unpublished_one_time_keys(&account).len(), 5);

        engine.mark_one_time_keys_published(&mut account);
        assert!(engine.unpublished_one_time_keys(&account).is_empty());
    }

    #[test]
    fn verify_rejects_garbage_signature() {
        let engine = VodozemacEngine::new();
        let account = engine.generate_account();
        let key = engine.identity_keys(&account).ed25519;
        assert!(engine.verify_ed25519("not base64!", &key, "m").is_err());
    }

    #[test]
    fn olm_roundtrip() {
        let engine = VodozemacEngine::new();
        let alice = engine.generate_account();
        let mut bob = engine.generate_account();
        let otk = engine
            .generate_one_time_keys(&mut bob, 1)
            .into_values()
            .next()
            .unwrap();
        let bob_keys = engine.identity_keys(&bob);

        let mut outbound = engine
            .init_outbound_session(&alice, &bob_keys.curve25519, &otk)
            .unwrap();
        let message = engine.encrypt_message(&mut outbound, b"hello");
        assert!(message.is_prekey());

        let alice_curve = engine.identity_keys(&alice).curve25519;
        let (inbound, plaintext) = engine
            .init_inbound_session(&mut bob, &alice_curve, &message)
            .unwrap();
        assert_eq!(plaintext, b"hello");
        assert!(engine.session_matches_inbound(&inbound, &message));
        assert_eq!(engine.session_id(&inbound), engine.session_id(&outbound));
    }

    #[test]
    fn megolm_roundtrip_and_pickles() {
        let engine = VodozemacEngine::new();
        let mut outbound = engine.new_outbound_group_session();
        let key = engine.session_key(&outbound);
        let inbound = engine.new_inbound_group_session_from_key(&key).unwrap();

        let pickle = engine.pickle_inbound_group_session(&inbound).unwrap();
        let mut restored = engine.unpickle_inbound_group_session(&pickle).unwrap();

        let ciphertext = engine.group_encrypt(&mut outbound, "ünïcödé".as_bytes());
        let decrypted = engine.group_decrypt(&mut restored, &ciphertext).unwrap();
        assert_eq!(decrypted.plaintext, "ünïcödé".as_bytes());
        assert_eq!(decrypted.message_index, 0);
        assert_eq!(engine.message_index(&outbound), 1);
    }

    #[test]
    fn compare_orders_connected_sessions() {
        let engine = VodozemacEngine::new();
        let mut outbound = engine.new_outbound_group_session();
        let key = engine.session_key(&outbound);
        let mut full = engine.new_inbound_group_session_from_key(&key).unwrap();
        let late = engine.export_session(&mut full, 2).unwrap();
        let mut late = engine.import_inbound_group_session(&late).unwrap();
        let mut same = engine.new_inbound_group_session_from_key(&key).unwrap();

        assert_eq!(engine.compare_group_sessions(&mut full, &mut late), GroupSessionOrdering::Better);
        assert_eq!(engine.compare_group_sessions(&mut late, &mut full), GroupSessionOrdering::Worse);
        assert_eq!(engine.compare_group_sessions(&mut full, &mut same), GroupSessionOrdering::Equal);

        let other = engine.new_outbound_group_session();
        let mut other = engine
            .new_inbound_group_session_from_key(&engine.session_key(&other))
            .unwrap();
        assert_eq!(
            engine.compare_group_sessions(&mut full, &mut other),
            GroupSessionOrdering::Unconnected
        );

        // Comparing must not cost the full session its early messages.
        let first = engine.group_encrypt(&mut outbound, b"first");
        assert_eq!(engine.group_decrypt(&mut full, &first).unwrap().message_index, 0);
    }

    #[test]
    fn olm_body_is_base64() {
        let engine = VodozemacEngine::new();
        let alice = engine.generate_account();
        let mut bob = engine.generate_account();
        let otk = engine
            .generate_one_time_keys(&mut bob, 1)
            .into_values()
            .next()
            .unwrap();
        let mut session = engine
            .init_outbound_session(&alice, &engine.identity_keys(&bob).curve25519, &otk)
            .unwrap();
        let message = engine.encrypt_message(&mut session, b"hi");
        assert!(base64_decode(&message.body).is_ok());
        assert!(!message.body.ends_with('='));

        let garbage = OlmCiphertext {
            message_type: 0,
            body: "not base64!".into(),
        };
        assert!(matches!(olm_message(&garbage), Err(EngineError::MalformedMessage(_))));
    }

    #[test]
    fn bad_session_key_is_invalid_key() {
        let engine = VodozemacEngine::new();
        let err = engine.new_inbound_group_session_from_key("AAAA").err();
        assert!(matches!(err, Some(EngineError::InvalidKey(_))));
    }
}
