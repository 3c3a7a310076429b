//! Signed-JSON checks.

use mxe2e_protocol::codec::signable_json;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::engine::CryptoEngine;

/// Check the signature `user_id` made over `value` with `key_id`.
///
/// The signature is looked up in the value's own `signatures` member and
/// checked against the canonical form of the value without `signatures`
/// and `unsigned`. Missing signatures and malformed input yield `false`.
pub fn verify_json<E: CryptoEngine, T: Serialize>(
    engine: &E,
    value: &T,
    user_id: &str,
    key_id: &str,
    public_key: &str,
) -> bool {
    let json = match serde_json::to_value(value) {
        Ok(json) => json,
        Err(e) => {
            debug!("cannot serialize signed value: {e}");
            return false;
        }
    };
    let Some(signature) = json
        .get("signatures")
        .and_then(|s| s.get(user_id))
        .and_then(|s| s.get(key_id))
        .and_then(Value::as_str)
    else {
        debug!(user_id, key_id, "signature missing");
        return false;
    };

    let canonical = match signable_json(&json) {
        Ok(canonical) => canonical,
        Err(e) => {
            debug!("cannot canonicalise signed value: {e}");
            return false;
        }
    };
    match engine.verify_ed25519(signature, public_key, &canonical) {
        Ok(()) => true,
        Err(e) => {
            debug!(user_id, key_id, "signature check failed: {e}");
            false
        }
    }
}
