//! Canonical JSON encoding used for signing and verifying key bundles.
//!
//! Canonical JSON is compact (no insignificant whitespace), UTF-8, and has
//! object keys sorted lexicographically at every nesting level. The sort is
//! done explicitly rather than relying on `serde_json`'s map ordering, which
//! changes when the `preserve_order` feature is unified in.

use serde::Serialize;
use serde_json::Value;

use crate::error::ProtocolError;

/// Top-level fields that are never covered by a signature.
const UNSIGNED_FIELDS: [&str; 2] = ["signatures", "unsigned"];

/// Encode a JSON value as canonical JSON.
pub fn to_canonical_json(value: &Value) -> Result<String, ProtocolError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// Canonical JSON of an object with `signatures` and `unsigned` removed:
/// the exact byte string an Ed25519 signature over the object covers.
pub fn signable_json<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let mut value = serde_json::to_value(value)?;
    let kind = json_kind(&value);
    let object = value
        .as_object_mut()
        .ok_or(ProtocolError::NotAnObject(kind))?;
    for field in UNSIGNED_FIELDS {
        object.remove(field);
    }
    to_canonical_json(&value)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), ProtocolError> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(val, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_recursively() {
        let value = json!({"b": 1, "a": {"d": true, "c": null}});
        assert_eq!(
            to_canonical_json(&value).unwrap(),
            r#"{"a":{"c":null,"d":true},"b":1}"#
        );
    }

    #[test]
    fn arrays_keep_their_order() {
        let value = json!({"list": [3, 1, 2]});
        assert_eq!(to_canonical_json(&value).unwrap(), r#"{"list":[3,1,2]}"#);
    }

    #[test]
    fn non_ascii_is_not_escaped() {
        let value = json!({"name": "日本語"});
        assert_eq!(to_canonical_json(&value).unwrap(), r#"{"name":"日本語"}"#);
    }

    #[test]
    fn json_significant_characters_are_escaped() {
        let value = json!({"k": "{\"\\"});
        assert_eq!(to_canonical_json(&value).unwrap(), r#"{"k":"{\"\\"}"#);
    }

    #[test]
    fn signable_json_strips_signatures_and_unsigned() {
        let value = json!({
            "user_id": "@a:x",
            "signatures": {"@a:x": {"ed25519:A": "sig"}},
            "unsigned": {"device_display_name": "phone"},
        });
        assert_eq!(signable_json(&value).unwrap(), r#"{"user_id":"@a:x"}"#);
    }

    #[test]
    fn signable_json_rejects_non_objects() {
        let err = signable_json(&json!([1, 2])).unwrap_err();
        assert!(matches!(err, ProtocolError::NotAnObject("array")));
    }
}
