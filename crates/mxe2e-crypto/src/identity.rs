//! The device's long-term E2E identity.
//!
//! One account per device: an Ed25519 fingerprint key, a Curve25519
//! identity key and a pool of one-time keys. The account is created on the
//! first call to [`E2eIdentity::initialise`] and reused after that.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mxe2e_protocol::codec::signable_json;
use mxe2e_protocol::keys::{DeviceKeys, OneTimeKeys, SignedKey};
use mxe2e_protocol::types::{key_id, KeySignatures, ED25519, SIGNED_CURVE25519};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::{CryptoEngine, IdentityKeys};
use crate::error::{E2eError, Result};
use crate::stores::KeyStore;

pub struct E2eIdentity<E: CryptoEngine> {
    engine: Arc<E>,
    store: Arc<KeyStore<E>>,
    user_id: String,
    device_id: String,
    initialised: AtomicBool,
}

impl<E: CryptoEngine> E2eIdentity<E> {
    pub fn new(
        engine: Arc<E>,
        store: Arc<KeyStore<E>>,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            store,
            user_id: user_id.into(),
            device_id: device_id.into(),
            initialised: AtomicBool::new(false),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Load the stored account, or create and persist a new one.
    ///
    /// Idempotent: later calls return the same identity keys. If persisting
    /// fails the identity stays uninitialised and the next call retries the
    /// write.
    pub fn initialise(&self) -> Result<IdentityKeys> {
        let created = self
            .store
            .put_identity_if_absent(|| self.engine.generate_account());
        // Until a flush has succeeded the account may only exist in memory.
        if !self.initialised.load(Ordering::Acquire) {
            self.store.flush()?;
        }
        self.initialised.store(true, Ordering::Release);

        let keys = self.store.identity_keys()?;
        if created {
            info!(
                user_id = %self.user_id,
                device_id = %self.device_id,
                ed25519 = %keys.ed25519,
                "created new device identity"
            );
        } else {
            debug!(device_id = %self.device_id, "using existing device identity");
        }
        Ok(keys)
    }

    pub fn ensure_initialised(&self) -> Result<()> {
        if self.initialised.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(E2eError::NotInitialised)
        }
    }

    pub fn identity_keys(&self) -> Result<IdentityKeys> {
        self.ensure_initialised()?;
        self.store.identity_keys()
    }

    pub fn max_one_time_keys(&self) -> Result<usize> {
        self.ensure_initialised()?;
        self.store
            .with_identity(|account| self.engine.max_one_time_keys(account))
    }

    /// Generate up to `count` one-time keys, clamped to the account maximum.
    ///
    /// The account is persisted before the keys are returned, so keys handed
    /// out for upload can always be found again after a restart.
    pub fn generate_one_time_keys(&self, count: usize) -> Result<BTreeMap<String, String>> {
        self.ensure_initialised()?;
        let keys = self.store.with_identity(|account| {
            let max = self.engine.max_one_time_keys(account);
            if count > max {
                warn!(requested = count, max, "clamping one-time key generation");
            }
            self.engine.generate_one_time_keys(account, count.min(max))
        })?;
        self.store.flush()?;
        debug!(count = keys.len(), "generated one-time keys");
        Ok(keys)
    }

    pub fn unpublished_one_time_keys(&self) -> Result<BTreeMap<String, String>> {
        self.ensure_initialised()?;
        self.store
            .with_identity(|account| self.engine.unpublished_one_time_keys(account))
    }

    /// Mark the current one-time keys as uploaded.
    ///
    /// A failed flush is only logged: the worst case after a crash is that
    /// the same keys are offered for upload again.
    pub fn mark_one_time_keys_published(&self) -> Result<()> {
        self.ensure_initialised()?;
        self.store
            .with_identity(|account| self.engine.mark_one_time_keys_published(account))?;
        if let Err(e) = self.store.flush() {
            warn!("failed to persist published one-time keys: {e}");
        }
        Ok(())
    }

    /// Ed25519-sign a string with the device's fingerprint key.
    pub fn sign(&self, message: &str) -> Result<String> {
        self.ensure_initialised()?;
        self.store
            .with_identity(|account| self.engine.sign(account, message))
    }

    /// Check an Ed25519 signature. Any failure, malformed input included,
    /// yields `false`.
    pub fn verify_signature(&self, signature: &str, public_key: &str, message: &str) -> bool {
        match self.engine.verify_ed25519(signature, public_key, message) {
            Ok(()) => true,
            Err(e) => {
                debug!("signature check failed: {e}");
                false
            }
        }
    }

    /// Sign the canonical form of a JSON object, ignoring its `signatures`
    /// and `unsigned` members.
    pub fn sign_json<T: Serialize>(&self, value: &T) -> Result<String> {
        let canonical = signable_json(value)?;
        self.sign(&canonical)
    }

    fn own_signature(&self, value: &impl Serialize) -> Result<KeySignatures> {
        let signature = self.sign_json(value)?;
        Ok(KeySignatures::new().with_signature(
            &self.user_id,
            key_id(ED25519, &self.device_id),
            signature,
        ))
    }

    /// This device's key bundle, self-signed.
    pub fn device_keys(&self) -> Result<DeviceKeys> {
        let keys = self.identity_keys()?;
        let unsigned = DeviceKeys::new(
            &self.user_id,
            &self.device_id,
            keys.ed25519,
            keys.curve25519,
        );
        let signatures = self.own_signature(&unsigned)?;
        Ok(unsigned.with_signatures(signatures))
    }

    /// The unpublished one-time keys as signed `signed_curve25519` objects,
    /// ready for upload.
    pub fn signed_one_time_keys(&self) -> Result<OneTimeKeys> {
        self.unpublished_one_time_keys()?
            .into_iter()
            .map(|(id, key)| {
                let unsigned = SignedKey::unsigned(key);
                let signatures = self.own_signature(&unsigned)?;
                Ok((
                    key_id(SIGNED_CURVE25519, &id),
                    unsigned.with_signatures(signatures),
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::VodozemacEngine;
    use crate::signing::verify_json;

    fn identity() -> E2eIdentity<VodozemacEngine> {
        let engine = Arc::new(VodozemacEngine::new());
        let store = Arc::new(KeyStore::new(engine.clone()));
        E2eIdentity::new(engine, store, "@alice:example.org", "ALICE")
    }

    #[test]
    fn operations_require_initialise() {
        let identity = identity();
        assert!(matches!(identity.identity_keys(), Err(E2eError::NotInitialised)));
        assert!(matches!(identity.sign("m"), Err(E2eError::NotInitialised)));
        assert!(matches!(
            identity.generate_one_time_keys(1),
            Err(E2eError::NotInitialised)
        ));
    }

    #[test]
    fn initialise_is_idempotent() {
        let identity = identity();
        let first = identity.initialise().unwrap();
        let second = identity.initialise().unwrap();
        assert_eq!(first, second);
        assert_eq!(identity.identity_keys().unwrap(), first);
    }

    #[test]
    fn failed_first_write_is_retried() {
        let engine = Arc::new(VodozemacEngine::new());
        let dir = crate::test_support::RemovableDir::new();
        let store = Arc::new(KeyStore::open(engine.clone(), &dir.store_path(), "pw", 1000).unwrap());
        let identity = E2eIdentity::new(engine.clone(), store, "@alice:example.org", "ALICE");

        dir.remove();
        assert!(matches!(identity.initialise(), Err(E2eError::Persistence(_))));
        assert!(matches!(identity.identity_keys(), Err(E2eError::NotInitialised)));

        dir.restore();
        let keys = identity.initialise().unwrap();
        let reopened = KeyStore::open(engine, &dir.store_path(), "pw", 1000).unwrap();
        assert_eq!(reopened.identity_keys().unwrap(), keys);
    }

    #[test]
    fn signature_roundtrip() {
        let identity = identity();
        let keys = identity.initialise().unwrap();
        for message in ["", "{", "\"", "\\", "hello world", "ünïcödé"] {
            let signature = identity.sign(message).unwrap();
            assert!(identity.verify_signature(&signature, &keys.ed25519, message));
            assert!(!identity.verify_signature(&signature, &keys.ed25519, "other"));
        }
    }

    #[test]
    fn verify_with_malformed_inputs_is_false() {
        let identity = identity();
        let keys = identity.initialise().unwrap();
        assert!(!identity.verify_signature("%%%", &keys.ed25519, "m"));
        assert!(!identity.verify_signature("AAAA", "not-a-key", "m"));
    }

    #[test]
    fn generation_is_clamped_to_max() {
        let identity = identity();
        identity.initialise().unwrap();
        let max = identity.max_one_time_keys().unwrap();
        let keys = identity.generate_one_time_keys(max + 10).unwrap();
        assert_eq!(keys.len(), max);
    }

    #[test]
    fn publish_clears_unpublished() {
        let identity = identity();
        identity.initialise().unwrap();
        identity.generate_one_time_keys(3).unwrap();
        assert_eq!(identity.unpublished_one_time_keys().unwrap().len(), 3);
        identity.mark_one_time_keys_published().unwrap();
        assert!(identity.unpublished_one_time_keys().unwrap().is_empty());
    }

    #[test]
    fn device_keys_are_self_signed() {
        let identity = identity();
        let keys = identity.initialise().unwrap();
        let device_keys = identity.device_keys().unwrap();
        assert_eq!(device_keys.ed25519_key(), Some(keys.ed25519.as_str()));
        assert_eq!(device_keys.curve25519_key(), Some(keys.curve25519.as_str()));
        assert!(verify_json(
            &VodozemacEngine::new(),
            &device_keys,
            "@alice:example.org",
            "ed25519:ALICE",
            &keys.ed25519,
        ));
    }

    #[test]
    fn one_time_keys_are_signed() {
        let identity = identity();
        let keys = identity.initialise().unwrap();
        identity.generate_one_time_keys(2).unwrap();
        let signed = identity.signed_one_time_keys().unwrap();
        assert_eq!(signed.len(), 2);
        for (id, key) in &signed {
            assert!(id.starts_with("signed_curve25519:"));
            assert!(verify_json(
                &VodozemacEngine::new(),
                key,
                "@alice:example.org",
                "ed25519:ALICE",
                &keys.ed25519,
            ));
        }
    }
}
