//! One-time key supply.
//!
//! One-time keys are single-use Curve25519 keys the homeserver hands out so
//! other devices can open Olm sessions with us. The client keeps the
//! server-side count near a fraction of the account maximum and tops it up
//! when the server reports it has dropped.

use mxe2e_protocol::keys::KeysUpload;
use tracing::debug;

use crate::engine::CryptoEngine;
use crate::error::Result;
use crate::identity::E2eIdentity;

/// How many new keys to generate so the server ends up holding
/// `floor(max * target_fraction)` keys.
///
/// Keys generated earlier but not yet published count towards the target.
pub fn keys_to_generate(
    server_count: usize,
    unpublished: usize,
    max: usize,
    target_fraction: f64,
) -> usize {
    let target = (max as f64 * target_fraction.clamp(0.0, 1.0)).floor() as usize;
    target.saturating_sub(server_count + unpublished)
}

/// Build the next key upload.
///
/// Tops up the one-time key pool and returns every unpublished key signed.
/// The device key bundle is included when `include_device_keys` is set.
pub fn prepare_upload<E: CryptoEngine>(
    identity: &E2eIdentity<E>,
    server_count: usize,
    target_fraction: f64,
    include_device_keys: bool,
) -> Result<KeysUpload> {
    let unpublished = identity.unpublished_one_time_keys()?.len();
    let max = identity.max_one_time_keys()?;
    let count = keys_to_generate(server_count, unpublished, max, target_fraction);
    if count > 0 {
        identity.generate_one_time_keys(count)?;
    }

    let device_keys = if include_device_keys {
        Some(identity.device_keys()?)
    } else {
        None
    };
    let one_time_keys = identity.signed_one_time_keys()?;
    debug!(
        server_count,
        generated = count,
        uploading = one_time_keys.len(),
        "prepared key upload"
    );
    Ok(KeysUpload {
        device_keys,
        one_time_keys,
    })
}
