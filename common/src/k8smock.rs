use crate::{Error, ResourceKind, Result, store::ObjectStore};
use async_trait::async_trait;
use kube::api::DynamicObject;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

/// Write operation recorded by the [`MemoryStore`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Create(ResourceKind, String),
    Update(ResourceKind, String),
    Patch(ResourceKind, String),
    PatchStatus(ResourceKind, String),
    Delete(ResourceKind, String),
}

type ObjKey = (ResourceKind, String, String);

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ObjKey, DynamicObject>,
    next_version: u64,
    conflicts: HashMap<ObjKey, u32>,
    failures: HashMap<ObjKey, String>,
    log: Vec<Operation>,
}

impl MemoryState {
    fn bump(&mut self, obj: &mut DynamicObject) {
        self.next_version += 1;
        obj.metadata.resource_version = Some(self.next_version.to_string());
    }

    fn check_injected(&mut self, key: &ObjKey) -> Result<()> {
        if let Some(message) = self.failures.get(key) {
            return Err(Error::Other(message.clone()));
        }
        if let Some(left) = self.conflicts.get_mut(key) {
            if *left > 0 {
                *left -= 1;
                return Err(conflict(key, "injected conflict"));
            }
        }
        Ok(())
    }
}

fn not_found(key: &ObjKey) -> Error {
    Error::NotFound {
        kind: key.0.to_string(),
        namespace: key.1.clone(),
        name: key.2.clone(),
    }
}

fn conflict(key: &ObjKey, message: &str) -> Error {
    Error::Conflict {
        kind: key.0.to_string(),
        namespace: key.1.clone(),
        name: key.2.clone(),
        message: message.to_string(),
    }
}

fn matches_selector(obj: &DynamicObject, selector: &str) -> bool {
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(|l| l == v).unwrap_or(false),
            None => labels.contains_key(term),
        })
}

/// In memory `ObjectStore` used by the tests.
///
/// It keeps a resource version per object, honours
/// `metadata.resourceVersion` in merge patches, records every write and
/// can be told to answer the next writes to an object with conflicts.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an object without recording an operation
    pub fn insert(&self, kind: ResourceKind, obj: DynamicObject) {
        let mut state = self.lock();
        let mut obj = obj;
        state.bump(&mut obj);
        let key = (
            kind,
            obj.metadata.namespace.clone().unwrap_or_default(),
            obj.metadata.name.clone().unwrap_or_default(),
        );
        state.objects.insert(key, obj);
    }

    /// Mutate an object the way an external actor would (bumps its version)
    pub fn mutate<F: FnOnce(&mut DynamicObject)>(&self, kind: ResourceKind, namespace: &str, name: &str, f: F) {
        let mut state = self.lock();
        let key = (kind, namespace.to_string(), name.to_string());
        if let Some(mut obj) = state.objects.remove(&key) {
            f(&mut obj);
            state.bump(&mut obj);
            state.objects.insert(key, obj);
        }
    }

    /// Answer the next `count` writes to that object with a conflict
    pub fn inject_conflicts(&self, kind: ResourceKind, namespace: &str, name: &str, count: u32) {
        self.lock()
            .conflicts
            .insert((kind, namespace.to_string(), name.to_string()), count);
    }

    /// Fail every write to that object
    pub fn inject_failure(&self, kind: ResourceKind, namespace: &str, name: &str, message: &str) {
        self.lock()
            .failures
            .insert((kind, namespace.to_string(), name.to_string()), message.to_string());
    }

    pub fn peek(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.lock()
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.lock().log.clone()
    }

    pub fn count<F: Fn(&Operation) -> bool>(&self, filter: F) -> usize {
        self.lock().log.iter().filter(|op| filter(op)).count()
    }

    pub fn clear_operations(&self) {
        self.lock().log.clear();
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<DynamicObject> {
        let key = (kind, namespace.to_string(), name.to_string());
        self.lock().objects.get(&key).cloned().ok_or_else(|| not_found(&key))
    }

    async fn list(&self, kind: ResourceKind, namespace: &str, selector: &str) -> Result<Vec<DynamicObject>> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((k, ns, _), obj)| *k == kind && ns == namespace && matches_selector(obj, selector))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, kind: ResourceKind, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject> {
        let mut state = self.lock();
        let name = obj.metadata.name.clone().unwrap_or_default();
        let key = (kind, namespace.to_string(), name.clone());
        state.check_injected(&key)?;
        if state.objects.contains_key(&key) {
            return Err(conflict(&key, "already exists"));
        }
        let mut obj = obj.clone();
        obj.metadata.namespace = Some(namespace.to_string());
        state.bump(&mut obj);
        state.objects.insert(key, obj.clone());
        state.log.push(Operation::Create(kind, name));
        Ok(obj)
    }

    async fn update(&self, kind: ResourceKind, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject> {
        let mut state = self.lock();
        let name = obj.metadata.name.clone().unwrap_or_default();
        let key = (kind, namespace.to_string(), name.clone());
        state.check_injected(&key)?;
        let current = state.objects.get(&key).ok_or_else(|| not_found(&key))?;
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != current.metadata.resource_version
        {
            return Err(conflict(&key, "resource version mismatch"));
        }
        let mut obj = obj.clone();
        state.bump(&mut obj);
        state.objects.insert(key, obj.clone());
        state.log.push(Operation::Update(kind, name));
        Ok(obj)
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject> {
        let mut state = self.lock();
        let key = (kind, namespace.to_string(), name.to_string());
        state.check_injected(&key)?;
        let current = state.objects.get(&key).ok_or_else(|| not_found(&key))?;
        if let Some(rv) = patch.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()) {
            if Some(rv.to_string()) != current.metadata.resource_version {
                return Err(conflict(&key, "resource version mismatch"));
            }
        }
        let mut doc = serde_json::to_value(current)?;
        json_patch::merge(&mut doc, patch);
        let mut obj: DynamicObject = serde_json::from_value(doc)?;
        state.bump(&mut obj);
        state.objects.insert(key, obj.clone());
        state.log.push(Operation::Patch(kind, name.to_string()));
        Ok(obj)
    }

    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject> {
        let mut state = self.lock();
        let key = (kind, namespace.to_string(), name.to_string());
        state.check_injected(&key)?;
        let current = state.objects.get(&key).ok_or_else(|| not_found(&key))?;
        let mut doc = serde_json::to_value(current)?;
        if let Some(status) = patch.get("status") {
            json_patch::merge(&mut doc, &serde_json::json!({ "status": status }));
        }
        let mut obj: DynamicObject = serde_json::from_value(doc)?;
        state.bump(&mut obj);
        state.objects.insert(key, obj.clone());
        state.log.push(Operation::PatchStatus(kind, name.to_string()));
        Ok(obj)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        let key = (kind, namespace.to_string(), name.to_string());
        state.check_injected(&key)?;
        state.objects.remove(&key).ok_or_else(|| not_found(&key))?;
        state.log.push(Operation::Delete(kind, name.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn configmap(name: &str) -> DynamicObject {
        let mut obj = ResourceKind::ConfigMap.template();
        obj.metadata.name = Some(name.to_string());
        obj.metadata.namespace = Some("ns".to_string());
        obj.metadata.labels = Some(BTreeMap::from([("app".to_string(), name.to_string())]));
        obj.data = json!({"data": {"a": "1"}});
        obj
    }

    #[tokio::test]
    async fn test_patch_with_stale_version_conflicts() {
        let store = MemoryStore::new();
        store.insert(ResourceKind::ConfigMap, configmap("cm"));
        let live = store.get(ResourceKind::ConfigMap, "ns", "cm").await.unwrap();
        let rv = live.metadata.resource_version.clone().unwrap();
        store.mutate(ResourceKind::ConfigMap, "ns", "cm", |o| o.data["data"]["a"] = json!("2"));
        let res = store
            .patch(
                ResourceKind::ConfigMap,
                "ns",
                "cm",
                &json!({"metadata": {"resourceVersion": rv}, "data": {"a": "3"}}),
            )
            .await;
        assert!(res.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_merge_patch_null_removes_key() {
        let store = MemoryStore::new();
        store.insert(ResourceKind::ConfigMap, configmap("cm"));
        let obj = store
            .patch(ResourceKind::ConfigMap, "ns", "cm", &json!({"data": {"a": null, "b": "2"}}))
            .await
            .unwrap();
        assert_eq!(obj.data["data"], json!({"b": "2"}));
        assert_eq!(store.operations(), vec![Operation::Patch(ResourceKind::ConfigMap, "cm".to_string())]);
    }

    #[tokio::test]
    async fn test_list_filters_by_selector() {
        let store = MemoryStore::new();
        store.insert(ResourceKind::ConfigMap, configmap("one"));
        store.insert(ResourceKind::ConfigMap, configmap("two"));
        let found = store.list(ResourceKind::ConfigMap, "ns", "app=two").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.name.as_deref(), Some("two"));
        assert_eq!(store.list(ResourceKind::ConfigMap, "ns", "").await.unwrap().len(), 2);
        assert!(store.list(ResourceKind::ConfigMap, "other", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_conflicts_run_out() {
        let store = MemoryStore::new();
        store.insert(ResourceKind::ConfigMap, configmap("cm"));
        store.inject_conflicts(ResourceKind::ConfigMap, "ns", "cm", 1);
        let patch = json!({"data": {"a": "2"}});
        assert!(store.patch(ResourceKind::ConfigMap, "ns", "cm", &patch).await.is_err());
        assert!(store.patch(ResourceKind::ConfigMap, "ns", "cm", &patch).await.is_ok());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get(ResourceKind::Secret, "ns", "nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.get_opt(ResourceKind::Secret, "ns", "nope").await.unwrap().is_none());
    }
}
