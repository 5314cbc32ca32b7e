//! Per-entity persistent registry.
//!
//! Every service instance and service binding owns one [`Entry`]: a string
//! key-value map persisted through the platform KV interface. System keys
//! carry a read/write policy towards templates; user keys are free-form.
//! Mutations are staged in memory and only hit the backend on [`Entry::commit`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::BrokerError;
use crate::platform::{KvRecord, OwnerRef, Platform};

/// Reserved system key names.
pub mod keys {
    pub const NAMESPACE: &str = "namespace";
    pub const INSTANCE_ID: &str = "instance-id";
    pub const BINDING_ID: &str = "binding-id";
    pub const SERVICE_ID: &str = "service-id";
    pub const PLAN_ID: &str = "plan-id";
    pub const CONTEXT: &str = "context";
    pub const PARAMETERS: &str = "parameters";
    pub const OPERATION: &str = "operation";
    pub const OPERATION_ID: &str = "operation-id";
    pub const OPERATION_STATUS: &str = "operation-status";
    pub const DASHBOARD_URL: &str = "dashboard-url";
    pub const CREDENTIALS: &str = "credentials";
}

/// Identity keys are visible to templates but may not be overwritten by them.
const TEMPLATE_READ_ONLY: &[&str] = &[
    keys::NAMESPACE,
    keys::INSTANCE_ID,
    keys::BINDING_ID,
    keys::SERVICE_ID,
    keys::PLAN_ID,
];

/// Operation bookkeeping keys are invisible to templates in both directions.
const TEMPLATE_HIDDEN: &[&str] = &[
    keys::CONTEXT,
    keys::PARAMETERS,
    keys::OPERATION,
    keys::OPERATION_ID,
    keys::OPERATION_STATUS,
];

/// Whether a key may be read by a template source.
pub fn template_readable(key: &str) -> bool {
    !TEMPLATE_HIDDEN.contains(&key)
}

/// Whether a key may be written by a template destination.
pub fn template_writable(key: &str) -> bool {
    !TEMPLATE_HIDDEN.contains(&key) && !TEMPLATE_READ_ONLY.contains(&key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    ServiceInstance,
    ServiceBinding,
}

impl EntryKind {
    fn prefix(&self) -> &'static str {
        match self {
            Self::ServiceInstance => "service-instance-",
            Self::ServiceBinding => "service-binding-",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::ServiceInstance => "service instance",
            Self::ServiceBinding => "service binding",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    ReadWrite,
    ReadOnly,
}

/// A loaded (or about-to-be-created) registry entry.
pub struct Entry {
    platform: Arc<dyn Platform>,
    namespace: String,
    kind: EntryKind,
    id: String,
    mode: EntryMode,
    data: BTreeMap<String, String>,
    record: Option<KvRecord>,
}

impl Entry {
    /// Load the persisted entry for `(kind, id)`. A missing entry opened
    /// `ReadWrite` starts as an empty in-memory shadow that is only persisted
    /// on the first `commit`.
    pub async fn open(
        platform: Arc<dyn Platform>,
        namespace: &str,
        kind: EntryKind,
        id: &str,
        mode: EntryMode,
    ) -> Result<Self, BrokerError> {
        let name = format!("{}{}", kind.prefix(), id);
        let record = platform.kv_get(namespace, &name).await?;
        let data = record.as_ref().map(|r| r.data.clone()).unwrap_or_default();
        Ok(Self {
            platform,
            namespace: namespace.to_string(),
            kind,
            id: id.to_string(),
            mode,
            data,
            record,
        })
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    /// True once the entry has a backing record.
    pub fn is_persisted(&self) -> bool {
        self.record.is_some()
    }

    fn storage_name(&self) -> String {
        format!("{}{}", self.kind.prefix(), self.id)
    }

    /// Deep copy for synchronous response paths. The clone can never commit,
    /// so the handler and the background provisioner cannot race on it.
    pub fn readonly_clone(&self) -> Entry {
        Entry {
            platform: Arc::clone(&self.platform),
            namespace: self.namespace.clone(),
            kind: self.kind,
            id: self.id.clone(),
            mode: EntryMode::ReadOnly,
            data: self.data.clone(),
            record: self.record.clone(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.data.get(key)?;
        serde_json::from_str(raw).ok()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.data.insert(key.to_string(), value.into());
    }

    pub fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), BrokerError> {
        let raw = serde_json::to_string(value)
            .map_err(|e| BrokerError::internal(format!("failed to encode {key}: {e}")))?;
        self.data.insert(key.to_string(), raw);
        Ok(())
    }

    pub fn unset(&mut self, key: &str) {
        self.data.remove(key);
    }

    /// Template-facing read, applying key policy. Hidden keys read as absent.
    pub fn get_user(&self, key: &str) -> Option<&str> {
        if !template_readable(key) {
            return None;
        }
        self.get(key)
    }

    /// Template-facing write, applying key policy.
    pub fn set_user(&mut self, key: &str, value: impl Into<String>) -> Result<(), BrokerError> {
        if !template_writable(key) {
            return Err(BrokerError::configuration(format!(
                "registry key {key:?} is reserved and cannot be written by a template"
            )));
        }
        self.set(key, value);
        Ok(())
    }

    /// All keys a template is allowed to read. Used to seed binding entries
    /// from their parent instance.
    pub fn template_visible_data(&self) -> BTreeMap<String, String> {
        self.data
            .iter()
            .filter(|(k, _)| template_readable(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Merge externally prepared data into the shadow (binding seeding).
    pub fn absorb(&mut self, data: BTreeMap<String, String>) {
        for (k, v) in data {
            self.data.insert(k, v);
        }
    }

    /// Persist the staged state. The first commit creates the backing record;
    /// later commits update it in place.
    pub async fn commit(&mut self) -> Result<(), BrokerError> {
        if self.mode == EntryMode::ReadOnly {
            return Err(BrokerError::internal(format!(
                "attempt to commit read-only {} entry {}",
                self.kind.describe(),
                self.id
            )));
        }
        let record = self
            .platform
            .kv_put(&self.namespace, &self.storage_name(), self.data.clone())
            .await?;
        self.record = Some(record);
        Ok(())
    }

    /// Remove the backing record.
    pub async fn delete(&mut self) -> Result<(), BrokerError> {
        if self.mode == EntryMode::ReadOnly {
            return Err(BrokerError::internal(format!(
                "attempt to delete read-only {} entry {}",
                self.kind.describe(),
                self.id
            )));
        }
        self.platform
            .kv_delete(&self.namespace, &self.storage_name())
            .await?;
        self.record = None;
        Ok(())
    }

    /// Stable owner handle for resources created under this entry. Only
    /// available once the entry is persisted.
    pub fn owner_reference(&self) -> Option<OwnerRef> {
        self.record
            .as_ref()
            .map(|record| self.platform.kv_owner_ref(record))
    }
}
