//! Directory of other devices' key bundles.
//!
//! Bundles are only stored after their self-signature checks out, and a
//! device's Ed25519 key is pinned once seen: a later bundle advertising a
//! different key for the same device is refused.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use mxe2e_protocol::keys::{DeviceKeys, SignedKey};
use mxe2e_protocol::types::{key_id, CURVE25519, ED25519};
use tracing::{debug, info, warn};

use crate::engine::CryptoEngine;
use crate::error::{DeviceKeyError, E2eError, Result};
use crate::signing::verify_json;
use crate::transport::KeyTransport;

/// What storing a bundle changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceUpdate {
    New,
    Updated,
    Unchanged,
}

pub struct DeviceKeyDirectory<E: CryptoEngine> {
    engine: Arc<E>,
    devices: DashMap<String, BTreeMap<String, DeviceKeys>>,
}

impl<E: CryptoEngine> DeviceKeyDirectory<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            devices: DashMap::new(),
        }
    }

    /// Whether a bundle is signed by the Ed25519 key it advertises.
    pub fn verify_device_keys(&self, keys: &DeviceKeys) -> bool {
        let Some(ed25519) = keys.ed25519_key() else {
            return false;
        };
        verify_json(
            self.engine.as_ref(),
            keys,
            &keys.user_id,
            &key_id(ED25519, &keys.device_id),
            ed25519,
        )
    }

    /// Store a bundle under the user and device it names.
    pub fn add_device_keys(&self, keys: DeviceKeys) -> Result<DeviceUpdate, DeviceKeyError> {
        let user_id = keys.user_id.clone();
        let device_id = keys.device_id.clone();
        self.insert_queried(&user_id, &device_id, keys)
    }

    /// Store a bundle returned for the `(user_id, device_id)` slot of a
    /// key query.
    pub fn insert_queried(
        &self,
        user_id: &str,
        device_id: &str,
        keys: DeviceKeys,
    ) -> Result<DeviceUpdate, DeviceKeyError> {
        if keys.user_id != user_id || keys.device_id != device_id {
            return Err(DeviceKeyError::SlotMismatch {
                expected: format!("{user_id}/{device_id}"),
                found: format!("{}/{}", keys.user_id, keys.device_id),
            });
        }
        let missing = |algorithm| DeviceKeyError::MissingKey {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            algorithm,
        };
        let ed25519 = keys.ed25519_key().ok_or_else(|| missing(ED25519))?;
        keys.curve25519_key().ok_or_else(|| missing(CURVE25519))?;
        if !self.verify_device_keys(&keys) {
            return Err(DeviceKeyError::BadSignature {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
            });
        }

        let mut user_devices = self.devices.entry(user_id.to_string()).or_default();
        let update = match user_devices.get(device_id) {
            Some(existing) if existing.ed25519_key() != Some(ed25519) => {
                return Err(DeviceKeyError::KeyChanged {
                    user_id: user_id.to_string(),
                    device_id: device_id.to_string(),
                });
            }
            Some(existing) if *existing == keys => DeviceUpdate::Unchanged,
            Some(_) => DeviceUpdate::Updated,
            None => DeviceUpdate::New,
        };
        if update != DeviceUpdate::Unchanged {
            user_devices.insert(device_id.to_string(), keys);
        }
        Ok(update)
    }

    pub fn get_device(&self, user_id: &str, device_id: &str) -> Option<DeviceKeys> {
        self.devices
            .get(user_id)
            .and_then(|devices| devices.get(device_id).cloned())
    }

    pub fn user_devices(&self, user_id: &str) -> Vec<DeviceKeys> {
        self.devices
            .get(user_id)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The device of `user_id` whose Curve25519 identity key is `curve25519`.
    pub fn device_by_curve25519(&self, user_id: &str, curve25519: &str) -> Option<DeviceKeys> {
        self.devices.get(user_id).and_then(|devices| {
            devices
                .values()
                .find(|d| d.curve25519_key() == Some(curve25519))
                .cloned()
        })
    }

    pub fn tracked_users(&self) -> Vec<String> {
        self.devices.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Whether a claimed one-time key was signed by the device it was
    /// claimed for.
    pub fn verify_one_time_key(&self, device: &DeviceKeys, key: &SignedKey) -> bool {
        let Some(ed25519) = device.ed25519_key() else {
            return false;
        };
        verify_json(
            self.engine.as_ref(),
            key,
            &device.user_id,
            &key_id(ED25519, &device.device_id),
            ed25519,
        )
    }

    /// Query the homeserver for the given users and update the directory.
    ///
    /// Bundles that fail validation are logged and skipped. Devices a user
    /// no longer has are dropped. Returns the number of new or changed
    /// devices.
    pub async fn refresh<T>(&self, transport: &T, user_ids: &[String]) -> Result<usize>
    where
        T: KeyTransport + ?Sized,
    {
        let response = transport
            .query_keys(user_ids)
            .await
            .map_err(E2eError::Transport)?;

        let mut changed = 0;
        for (user_id, devices) in response {
            if let Some(mut known) = self.devices.get_mut(&user_id) {
                let before = known.len();
                known.retain(|device_id, _| devices.contains_key(device_id));
                if known.len() != before {
                    info!(%user_id, removed = before - known.len(), "devices removed");
                }
            }
            for (device_id, keys) in devices {
                match self.insert_queried(&user_id, &device_id, keys) {
                    Ok(DeviceUpdate::Unchanged) => {}
                    Ok(update) => {
                        debug!(%user_id, %device_id, ?update, "device keys stored");
                        changed += 1;
                    }
                    Err(e) => warn!(%user_id, %device_id, "refusing device keys: {e}"),
                }
            }
        }
        Ok(changed)
    }
}
