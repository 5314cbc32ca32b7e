//! Provisioning state machines.
//!
//! Each flow has a synchronous `prepare` phase that runs on the API handler's
//! call stack (rendering, registry staging) and an asynchronous `run` phase
//! dispatched to a background task that talks to the platform. Completion is
//! delivered through the operation table's one-shot signal.

mod create;
mod deprovision;
mod update;

pub use create::{CreateProvisioner, ProvisionScope};
pub use deprovision::DeprovisionProvisioner;
pub use update::UpdateProvisioner;

use serde_json::{Map, Value};

use crate::error::BrokerError;
use crate::platform::OwnerRef;

/// Annotation carrying the canonical rendered JSON of the object, so updates
/// can diff against the creator's intent without being confused by backend
/// mutations.
pub const CANONICAL_ANNOTATION: &str = "broker.templar.io/canonical";

fn metadata_mut(object: &mut Value) -> Result<&mut Map<String, Value>, BrokerError> {
    let root = object
        .as_object_mut()
        .ok_or_else(|| BrokerError::configuration("rendered template body is not an object"))?;
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    metadata
        .as_object_mut()
        .ok_or_else(|| BrokerError::configuration("resource metadata is not an object"))
}

/// Set the object's target namespace.
pub(crate) fn set_namespace(object: &mut Value, namespace: &str) -> Result<(), BrokerError> {
    metadata_mut(object)?.insert(
        "namespace".to_string(),
        Value::String(namespace.to_string()),
    );
    Ok(())
}

/// Append an owner reference, deduplicating by uid.
pub(crate) fn attach_owner(object: &mut Value, owner: &OwnerRef) -> Result<(), BrokerError> {
    let metadata = metadata_mut(object)?;
    let refs = metadata
        .entry("ownerReferences")
        .or_insert_with(|| Value::Array(Vec::new()));
    let refs = refs
        .as_array_mut()
        .ok_or_else(|| BrokerError::configuration("metadata.ownerReferences is not a list"))?;
    let already = refs
        .iter()
        .any(|existing| existing.get("uid").and_then(Value::as_str) == Some(owner.uid.as_str()));
    if !already {
        refs.push(owner.to_value());
    }
    Ok(())
}

pub(crate) fn set_annotation(
    object: &mut Value,
    key: &str,
    value: String,
) -> Result<(), BrokerError> {
    let metadata = metadata_mut(object)?;
    let annotations = metadata
        .entry("annotations")
        .or_insert_with(|| Value::Object(Map::new()));
    let annotations = annotations
        .as_object_mut()
        .ok_or_else(|| BrokerError::configuration("metadata.annotations is not an object"))?;
    annotations.insert(key.to_string(), Value::String(value));
    Ok(())
}

pub(crate) fn get_annotation<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    object
        .pointer("/metadata/annotations")?
        .get(key)?
        .as_str()
}
