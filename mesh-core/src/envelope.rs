//! HMAC-SHA256-signed server-to-server envelopes (spec §4.1, §6).
//!
//! `{data, timestamp, signature}` where `signature = HMAC-SHA256(secret,
//! "{timestamp}:{canonical_json(data)}")`. Canonical JSON sorts object keys
//! lexicographically at every level — the same recursive-`Value` approach
//! as `freeq-server/src/policy/canonical.rs`'s JCS canonicalizer, just
//! without JCS's number-formatting rules (the wire format here only ever
//! carries integers and strings, not floats needing RFC 8785 precision).

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::error::MeshError;

type HmacSha256 = Hmac<Sha256>;

/// Default replay window, seconds (spec §6 `signed_envelope_window_s`).
pub const DEFAULT_REPLAY_WINDOW_S: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub data: Value,
    pub timestamp: i64,
    pub signature: String,
}

/// Canonicalize a JSON value: object keys sorted lexicographically at every
/// nesting level, arrays left in order, primitives serialized via serde_json.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| k.as_str());
            let mut out = String::from("{");
            for (i, (k, v)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).expect("string key serializes"));
                out.push(':');
                out.push_str(&canonical_json(v));
            }
            out.push('}');
            out
        }
        Value::Array(items) => {
            let mut out = String::from("[");
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&canonical_json(v));
            }
            out.push(']');
            out
        }
        other => serde_json::to_string(other).expect("primitive serializes"),
    }
}

fn signing_input(timestamp: i64, data: &Value) -> String {
    format!("{timestamp}:{}", canonical_json(data))
}

fn hmac_hex(secret: &str, input: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(input.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Sign `data` at `timestamp` (caller supplies the clock so tests are
/// deterministic; production callers pass `now_unix()`).
pub fn sign(secret: &str, data: Value, timestamp: i64) -> SignedEnvelope {
    let signature = hmac_hex(secret, &signing_input(timestamp, &data));
    SignedEnvelope {
        data,
        timestamp,
        signature,
    }
}

/// Verify a signed envelope against the shared secret and current time.
/// `now` and `window_s` are passed explicitly (no ambient clock) so the
/// boundary cases in spec §8 (`±window` reject, `±(window-1)` accept) are
/// trivial to exercise in tests.
pub fn verify(secret: &str, env: &SignedEnvelope, now: i64, window_s: i64) -> Result<(), MeshError> {
    if (now - env.timestamp).abs() > window_s {
        return Err(MeshError::ExpiredTimestamp);
    }
    // `Mac::verify_slice` compares in constant time, so the signature check
    // itself doesn't leak timing information about how many bytes matched.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(signing_input(env.timestamp, &env.data).as_bytes());
    let signature_bytes = hex::decode(&env.signature).map_err(|_| MeshError::BadSignature)?;
    mac.verify_slice(&signature_bytes)
        .map_err(|_| MeshError::BadSignature)
}

/// Unix seconds, for production call sites (`verify`/`sign` take an
/// explicit timestamp so tests never depend on wall-clock time).
pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let v = json!({"z": {"b": 1, "a": 2}, "a": []});
        assert_eq!(canonical_json(&v), r#"{"a":[],"z":{"a":2,"b":1}}"#);
    }

    #[test]
    fn sign_then_verify_succeeds_within_window() {
        let data = json!({"method": "ping"});
        let env = sign("topsecret", data, 1_000_000);
        assert!(verify("topsecret", &env, 1_000_000 + 10, DEFAULT_REPLAY_WINDOW_S).is_ok());
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let env = sign("topsecret", json!({"a": 1}), 1_000_000);
        let err = verify("wrong-secret", &env, 1_000_000, DEFAULT_REPLAY_WINDOW_S).unwrap_err();
        assert_eq!(err, MeshError::BadSignature);
    }

    #[test]
    fn verify_rejects_exactly_at_window_boundary() {
        let env = sign("s", json!({}), 0);
        // |now - ts| == window -> reject
        assert_eq!(
            verify("s", &env, DEFAULT_REPLAY_WINDOW_S, DEFAULT_REPLAY_WINDOW_S).unwrap_err(),
            MeshError::ExpiredTimestamp
        );
        // |now - ts| == window - 1 -> accept
        assert!(verify("s", &env, DEFAULT_REPLAY_WINDOW_S - 1, DEFAULT_REPLAY_WINDOW_S).is_ok());
    }

    #[test]
    fn tampered_data_fails_verification() {
        let mut env = sign("s", json!({"x": 1}), 5);
        env.data = json!({"x": 2});
        assert_eq!(verify("s", &env, 5, DEFAULT_REPLAY_WINDOW_S).unwrap_err(), MeshError::BadSignature);
    }
}
