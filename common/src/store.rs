use crate::{Error, ResourceKind, Result, get_client_name};
use async_trait::async_trait;
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
};
use serde::Serialize;

/// Typed access to the versioned object store.
///
/// `patch` takes a JSON merge patch. When the patch carries
/// `metadata.resourceVersion` the write only succeeds against that exact
/// version and fails with [`Error::Conflict`] otherwise.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<DynamicObject>;

    async fn list(&self, kind: ResourceKind, namespace: &str, selector: &str) -> Result<Vec<DynamicObject>>;

    async fn create(&self, kind: ResourceKind, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn update(&self, kind: ResourceKind, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject>;

    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject>;

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()>;

    async fn get_opt(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<DynamicObject>> {
        match self.get(kind, namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Convert any typed object to its dynamic form
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// `ObjectStore` backed by the kubernetes api server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> KubeStore {
        KubeStore { client }
    }

    fn api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }

    fn map_err(kind: ResourceKind, namespace: &str, name: &str, e: kube::Error) -> Error {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => Error::NotFound {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ae) if ae.code == 409 => Error::Conflict {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: ae.message,
            },
            e => Error::KubeError(e),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<DynamicObject> {
        self.api(kind, namespace)
            .get(name)
            .await
            .map_err(|e| Self::map_err(kind, namespace, name, e))
    }

    async fn list(&self, kind: ResourceKind, namespace: &str, selector: &str) -> Result<Vec<DynamicObject>> {
        let lp = ListParams::default().labels(selector);
        self.api(kind, namespace)
            .list(&lp)
            .await
            .map(|l| l.items)
            .map_err(|e| Self::map_err(kind, namespace, "", e))
    }

    async fn create(&self, kind: ResourceKind, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.api(kind, namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Self::map_err(kind, namespace, &name, e))
    }

    async fn update(&self, kind: ResourceKind, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.api(kind, namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| Self::map_err(kind, namespace, &name, e))
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject> {
        let pp = PatchParams {
            field_manager: Some(get_client_name()),
            ..PatchParams::default()
        };
        self.api(kind, namespace)
            .patch(name, &pp, &Patch::Merge(patch))
            .await
            .map_err(|e| Self::map_err(kind, namespace, name, e))
    }

    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject> {
        let pp = PatchParams {
            field_manager: Some(get_client_name()),
            ..PatchParams::default()
        };
        self.api(kind, namespace)
            .patch_status(name, &pp, &Patch::Merge(patch))
            .await
            .map_err(|e| Self::map_err(kind, namespace, name, e))
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        match self
            .api(kind, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(either::Left(_)) => {
                tracing::debug!("Deleting {kind} {namespace}/{name} started");
                Ok(())
            }
            Ok(either::Right(_)) => Ok(()),
            Err(e) => Err(Self::map_err(kind, namespace, name, e)),
        }
    }
}
