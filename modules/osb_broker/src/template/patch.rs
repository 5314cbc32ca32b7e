//! JSON pointer and merge-patch helpers for the renderer and the update
//! provisioner.

use serde_json::{Map, Value};

use crate::error::BrokerError;

/// Write `value` into `body` at `pointer`, creating parent objects/arrays as
/// needed (add semantics).
pub fn apply_add(body: &mut Value, pointer: &str, value: Value) -> Result<(), BrokerError> {
    let ptr = jsonptr::Pointer::parse(pointer)
        .map_err(|e| BrokerError::configuration(format!("invalid JSON pointer {pointer:?}: {e}")))?;
    ptr.assign(body, value)
        .map_err(|e| BrokerError::configuration(format!("cannot patch {pointer:?}: {e}")))?;
    Ok(())
}

/// Compute the RFC 7386 merge patch that turns `original` into `updated`.
/// Applying the result to `original` with `json_patch::merge` yields
/// `updated`; applying it to a drifted live object carries the same edits
/// over without clobbering fields the broker never set.
pub fn merge_diff(original: &Value, updated: &Value) -> Value {
    match (original, updated) {
        (Value::Object(original), Value::Object(updated)) => {
            let mut patch = Map::new();
            for (key, new_value) in updated {
                match original.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value) => {
                        patch.insert(key.clone(), merge_diff(old_value, new_value));
                    }
                    None => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for key in original.keys() {
                if !updated.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => updated.clone(),
    }
}
