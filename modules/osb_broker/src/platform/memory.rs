//! In-memory platform used by tests and `--mock` runs.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use super::{object_ref, KvRecord, OwnerRef, Platform, PlatformError, ResourceRef};

#[derive(Default)]
pub struct MemoryPlatform {
    resources: DashMap<ResourceRef, Value>,
    kv: DashMap<(String, String), KvRecord>,
    version_counter: AtomicU64,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        self.version_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Test helper: snapshot a stored resource.
    pub fn resource(&self, resource: &ResourceRef) -> Option<Value> {
        self.resources.get(resource).map(|v| v.clone())
    }

    /// Test helper: snapshot a stored KV record.
    pub fn kv_record(&self, namespace: &str, name: &str) -> Option<KvRecord> {
        self.kv
            .get(&(namespace.to_string(), name.to_string()))
            .map(|r| r.clone())
    }

    /// Test helper: number of stored resources.
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn get(&self, resource: &ResourceRef) -> Result<Value, PlatformError> {
        self.resources
            .get(resource)
            .map(|v| v.clone())
            .ok_or_else(|| PlatformError::NotFound(format!("{resource} not found")))
    }

    async fn create(&self, namespace: &str, object: &Value) -> Result<Value, PlatformError> {
        let key = object_ref(namespace, object)?;
        match self.resources.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(PlatformError::AlreadyExists(format!("{key} already exists")))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(object.clone());
                Ok(object.clone())
            }
        }
    }

    async fn update(&self, namespace: &str, object: &Value) -> Result<Value, PlatformError> {
        let key = object_ref(namespace, object)?;
        match self.resources.get_mut(&key) {
            Some(mut existing) => {
                *existing = object.clone();
                Ok(object.clone())
            }
            None => Err(PlatformError::NotFound(format!("{key} not found"))),
        }
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), PlatformError> {
        self.resources
            .remove(resource)
            .map(|_| ())
            .ok_or_else(|| PlatformError::NotFound(format!("{resource} not found")))
    }

    async fn kv_get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KvRecord>, PlatformError> {
        Ok(self
            .kv
            .get(&(namespace.to_string(), name.to_string()))
            .map(|r| r.clone()))
    }

    async fn kv_put(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<KvRecord, PlatformError> {
        let mut entry = self
            .kv
            .entry((namespace.to_string(), name.to_string()))
            .or_insert_with(|| KvRecord {
                name: name.to_string(),
                uid: Uuid::new_v4().to_string(),
                resource_version: 0,
                data: BTreeMap::new(),
            });
        entry.data = data;
        entry.resource_version = self.next_version();
        Ok(entry.clone())
    }

    async fn kv_delete(&self, namespace: &str, name: &str) -> Result<(), PlatformError> {
        let removed = self.kv.remove(&(namespace.to_string(), name.to_string()));

        // Emulate the backend's garbage collector: resources owned solely by
        // the deleted record go away, shared resources just lose the owner.
        if let Some((_, record)) = removed {
            let uid = record.uid;
            let mut orphaned = Vec::new();
            for mut item in self.resources.iter_mut() {
                let Some(refs) = item
                    .value_mut()
                    .pointer_mut("/metadata/ownerReferences")
                    .and_then(Value::as_array_mut)
                else {
                    continue;
                };
                let before = refs.len();
                refs.retain(|r| r.get("uid").and_then(Value::as_str) != Some(uid.as_str()));
                if before > 0 && refs.is_empty() {
                    orphaned.push(item.key().clone());
                }
            }
            for key in orphaned {
                self.resources.remove(&key);
            }
        }
        Ok(())
    }

    fn kv_owner_ref(&self, record: &KvRecord) -> OwnerRef {
        OwnerRef {
            api_version: "v1".to_string(),
            kind: "KeyValue".to_string(),
            name: record.name.clone(),
            uid: record.uid.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_object(name: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name },
            "data": { "k": "v" }
        })
    }

    #[tokio::test]
    async fn create_then_get_then_delete() {
        let platform = MemoryPlatform::new();
        let object = sample_object("one");
        platform.create("ns", &object).await.unwrap();

        let resource = object_ref("ns", &object).unwrap();
        let fetched = platform.get(&resource).await.unwrap();
        assert_eq!(fetched, object);

        platform.delete(&resource).await.unwrap();
        let err = platform.get(&resource).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn double_create_reports_already_exists() {
        let platform = MemoryPlatform::new();
        let object = sample_object("dup");
        platform.create("ns", &object).await.unwrap();
        let err = platform.create("ns", &object).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn update_requires_existing_resource() {
        let platform = MemoryPlatform::new();
        let object = sample_object("missing");
        let err = platform.update("ns", &object).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn kv_put_assigns_uid_and_bumps_version() {
        let platform = MemoryPlatform::new();
        let mut data = BTreeMap::new();
        data.insert("animal".to_string(), "cat".to_string());

        let first = platform.kv_put("ns", "entry", data.clone()).await.unwrap();
        assert!(!first.uid.is_empty());

        data.insert("color".to_string(), "black".to_string());
        let second = platform.kv_put("ns", "entry", data).await.unwrap();
        assert_eq!(first.uid, second.uid);
        assert!(second.resource_version > first.resource_version);

        let owner = platform.kv_owner_ref(&second);
        assert_eq!(owner.uid, second.uid);
        assert_eq!(owner.name, "entry");
    }

    #[tokio::test]
    async fn kv_delete_is_idempotent() {
        let platform = MemoryPlatform::new();
        platform.kv_delete("ns", "nope").await.unwrap();
    }

    #[tokio::test]
    async fn kv_delete_reaps_solely_owned_resources() {
        let platform = MemoryPlatform::new();
        let record = platform.kv_put("ns", "entry", BTreeMap::new()).await.unwrap();
        let owner = platform.kv_owner_ref(&record);

        let mut owned = sample_object("owned");
        owned["metadata"]["ownerReferences"] = json!([&owner]);
        platform.create("ns", &owned).await.unwrap();

        let other = platform.kv_put("ns", "other", BTreeMap::new()).await.unwrap();
        let mut shared = sample_object("shared");
        shared["metadata"]["ownerReferences"] =
            json!([&owner, &platform.kv_owner_ref(&other)]);
        platform.create("ns", &shared).await.unwrap();

        platform.kv_delete("ns", "entry").await.unwrap();

        // Solely-owned resource is gone, the shared one lost one owner.
        assert!(platform.resource(&object_ref("ns", &owned).unwrap()).is_none());
        let shared_now = platform
            .resource(&object_ref("ns", &shared).unwrap())
            .unwrap();
        let refs = shared_now.pointer("/metadata/ownerReferences").unwrap();
        assert_eq!(refs.as_array().unwrap().len(), 1);
    }
}
