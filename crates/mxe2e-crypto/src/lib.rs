//! Matrix end-to-end encryption core.
//!
//! This crate provides:
//! - Device identity and one-time key management (Olm accounts)
//! - Pairwise Olm sessions for to-device messages
//! - Megolm group sessions for room messages, with rotation
//! - A verified directory of other devices' key bundles
//! - Validation of received room keys
//! - Encrypted persistence of all key material
//!
//! Cryptographic primitives sit behind the [`engine::CryptoEngine`] trait;
//! [`engine::VodozemacEngine`] is the production implementation.

pub mod config;
pub mod devices;
pub mod engine;
pub mod error;
pub mod group;
pub mod identity;
pub mod machine;
pub mod one_time_keys;
pub mod persistence;
pub mod room_keys;
pub mod session;
pub mod signing;
pub mod stores;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export key types for convenience
pub use config::{CryptoConfig, RotationPolicy};
pub use engine::{CryptoEngine, VodozemacEngine};
pub use error::{E2eError, EngineError, Result};
pub use identity::E2eIdentity;
pub use machine::{CryptoClient, RoomEventDecryption, ToDeviceOutcome};
pub use stores::KeyStore;
pub use transport::KeyTransport;

/// Milliseconds since the Unix epoch. A clock before 1970 reads as 0.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
