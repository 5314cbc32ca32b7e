//! Backing orchestration platform abstraction.
//!
//! The broker only ever talks to the platform through this narrow interface:
//! typed resource apply/get/update/delete within a namespace, plus a
//! key-value store used to persist registry entries. The concrete wiring
//! (a Kubernetes client, typically) lives outside the core.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryPlatform;

/// Platform-level failure. `AlreadyExists` is a first-class discriminator
/// because the singleton create path branches on it.
#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("platform error: {0}")]
    Other(String),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// Fully-qualified address of a platform resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} {}/{}",
            self.api_version, self.kind, self.namespace, self.name
        )
    }
}

/// Read the `(apiVersion, kind, metadata.name)` triple out of a resource
/// object and combine it with the target namespace.
pub fn object_ref(namespace: &str, object: &Value) -> Result<ResourceRef, PlatformError> {
    let api_version = object
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| PlatformError::Other("resource has no apiVersion".to_string()))?;
    let kind = object
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| PlatformError::Other("resource has no kind".to_string()))?;
    let name = object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .ok_or_else(|| PlatformError::Other("resource has no metadata.name".to_string()))?;
    Ok(ResourceRef {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    })
}

/// Opaque owner handle returned by the persistence backend. Attached to every
/// resource created on an entry's behalf so the backend can garbage-collect
/// them when the entry goes away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

impl OwnerRef {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("owner reference serializes")
    }
}

/// A persisted key-value record. `uid` and `resource_version` are assigned by
/// the backend on first write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvRecord {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[async_trait]
pub trait Platform: Send + Sync + 'static {
    /// Fetch a resource by typed name.
    async fn get(&self, resource: &ResourceRef) -> Result<Value, PlatformError>;

    /// Create a resource; the object carries its own apiVersion/kind/name.
    async fn create(&self, namespace: &str, object: &Value) -> Result<Value, PlatformError>;

    /// Replace an existing resource.
    async fn update(&self, namespace: &str, object: &Value) -> Result<Value, PlatformError>;

    /// Delete a resource by typed name.
    async fn delete(&self, resource: &ResourceRef) -> Result<(), PlatformError>;

    /// Fetch a KV record; `None` when absent.
    async fn kv_get(&self, namespace: &str, name: &str)
        -> Result<Option<KvRecord>, PlatformError>;

    /// Create or update a KV record; returns the stored record with backend
    /// metadata (uid, resource version) filled in.
    async fn kv_put(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<KvRecord, PlatformError>;

    /// Delete a KV record. Deleting an absent record is not an error.
    async fn kv_delete(&self, namespace: &str, name: &str) -> Result<(), PlatformError>;

    /// Owner handle for resources created on behalf of the given KV record.
    fn kv_owner_ref(&self, record: &KvRecord) -> OwnerRef;
}
