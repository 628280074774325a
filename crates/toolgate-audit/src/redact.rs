use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use toolgate_protocol::Sensitivity;

pub const REDACTED: &str = "[REDACTED]";

/// Strings longer than this are elided from medium-sensitivity records.
pub const MEDIUM_MAX_STRING_CHARS: usize = 256;

const SECRET_MARKERS: &[&str] = &[
    "token",
    "secret",
    "password",
    "passwd",
    "authorization",
    "api_key",
    "apikey",
    "private_key",
    "credential",
];

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|marker| key.contains(marker))
}

/// Arguments as they may be written to the audit trail.
///
/// Secret-looking keys are masked at every level. `Medium` additionally elides
/// long strings; `High` keeps only a digest of the original arguments so a
/// record can still be matched against a known payload.
pub fn redact_args(args: &Value, sensitivity: Sensitivity) -> Value {
    match sensitivity {
        Sensitivity::Low => mask(args, None),
        Sensitivity::Medium => mask(args, Some(MEDIUM_MAX_STRING_CHARS)),
        Sensitivity::High => {
            let digest = serde_json::to_vec(args)
                .map(|bytes| hex::encode(Sha256::digest(bytes)))
                .unwrap_or_default();
            json!({ "redacted": true, "sha256": digest })
        }
    }
}

fn mask(value: &Value, max_chars: Option<usize>) -> Value {
    match value {
        Value::Object(object) => Value::Object(
            object
                .iter()
                .map(|(key, value)| {
                    let masked = if is_secret_key(key) {
                        Value::String(REDACTED.to_owned())
                    } else {
                        mask(value, max_chars)
                    };
                    (key.clone(), masked)
                })
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|item| mask(item, max_chars)).collect()),
        Value::String(text) => match max_chars {
            Some(limit) if text.chars().count() > limit => {
                Value::String(format!("[ELIDED {} chars]", text.chars().count()))
            }
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}
