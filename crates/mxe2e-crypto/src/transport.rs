//! The homeserver endpoints the E2E layer needs, kept abstract.
//!
//! Implementations wrap whatever HTTP client the application uses. No
//! key-store lock is held while any of these calls is awaited.

use async_trait::async_trait;
use mxe2e_protocol::keys::{KeysUpload, QueriedDeviceKeys, SignedKey};
use mxe2e_protocol::messages::ToDeviceMessage;

/// A one-time key claimed for another device.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedKey {
    /// `"signed_curve25519:<id>"`.
    pub key_id: String,
    pub key: SignedKey,
}

#[async_trait]
pub trait KeyTransport: Send + Sync {
    /// Upload device and/or one-time keys. Returns the number of
    /// `signed_curve25519` keys the server holds afterwards.
    async fn upload_keys(&self, upload: &KeysUpload) -> anyhow::Result<usize>;

    /// Fetch the device key bundles of the given users.
    async fn query_keys(&self, user_ids: &[String]) -> anyhow::Result<QueriedDeviceKeys>;

    /// Claim one signed one-time key of a device. `None` when the device
    /// has run out.
    async fn claim_one_time_key(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> anyhow::Result<Option<ClaimedKey>>;

    /// Send one event type to a set of devices.
    async fn send_to_device(
        &self,
        event_type: &str,
        messages: &[ToDeviceMessage],
    ) -> anyhow::Result<()>;
}
