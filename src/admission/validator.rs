//! Payload validation: size and structure checks over untrusted JSON input.
//!
//! Both checks are pure functions. The structure walk exists independently of
//! the byte limit because a small payload can still be adversarially deep or
//! wide. Object keys are strings by construction in `serde_json::Value`; the
//! walk enforces the key-length bound on top of that.

use serde_json::Value;

use crate::config::{StructureLimits, MAX_KEY_LEN};
use crate::error::AdmissionError;

/// Reject payloads whose serialized form exceeds `max_bytes`.
pub fn check_size(payload: &Value, max_bytes: usize) -> Result<(), AdmissionError> {
    let size = match serde_json::to_vec(payload) {
        Ok(bytes) => bytes.len(),
        Err(err) => {
            return Err(AdmissionError::InvalidStructure {
                reason: format!("payload is not serializable: {}", err),
            })
        }
    };
    if size > max_bytes {
        return Err(AdmissionError::PayloadTooLarge {
            size,
            limit: max_bytes,
        });
    }
    Ok(())
}

/// Recursively reject payloads that violate a structural bound.
///
/// Checks nesting depth, string length, array length and key length; the
/// first violation found wins.
pub fn check_structure(payload: &Value, limits: &StructureLimits) -> Result<(), AdmissionError> {
    walk(payload, 0, limits).map_err(|reason| AdmissionError::InvalidStructure { reason })
}

fn walk(value: &Value, depth: usize, limits: &StructureLimits) -> Result<(), String> {
    match value {
        Value::String(s) => {
            if s.chars().count() > limits.max_string_len {
                return Err(format!(
                    "string exceeds {} characters",
                    limits.max_string_len
                ));
            }
            Ok(())
        }
        Value::Array(items) => {
            if depth >= limits.max_depth {
                return Err(format!("nesting exceeds {} levels", limits.max_depth));
            }
            if items.len() > limits.max_array_len {
                return Err(format!("array exceeds {} elements", limits.max_array_len));
            }
            for item in items {
                walk(item, depth + 1, limits)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            if depth >= limits.max_depth {
                return Err(format!("nesting exceeds {} levels", limits.max_depth));
            }
            for (key, item) in map {
                if key.chars().count() > MAX_KEY_LEN {
                    return Err(format!("object key exceeds {} characters", MAX_KEY_LEN));
                }
                walk(item, depth + 1, limits)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
