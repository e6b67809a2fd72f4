use crate::instance::LedgerNode;
use k8s_openapi::api::{
    apps::v1::Deployment,
    batch::v1::Job,
    core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service},
    networking::v1::Ingress,
};
use kube::api::{ApiResource, DynamicObject};
use serde::{Deserialize, Serialize};

/// Kinds of object the operator reads or writes
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Deployment,
    Service,
    PersistentVolumeClaim,
    ConfigMap,
    Secret,
    Ingress,
    Job,
    Pod,
    LedgerNode,
}

impl ResourceKind {
    pub fn api_resource(&self) -> ApiResource {
        match self {
            ResourceKind::Deployment => ApiResource::erase::<Deployment>(&()),
            ResourceKind::Service => ApiResource::erase::<Service>(&()),
            ResourceKind::PersistentVolumeClaim => ApiResource::erase::<PersistentVolumeClaim>(&()),
            ResourceKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            ResourceKind::Secret => ApiResource::erase::<Secret>(&()),
            ResourceKind::Ingress => ApiResource::erase::<Ingress>(&()),
            ResourceKind::Job => ApiResource::erase::<Job>(&()),
            ResourceKind::Pod => ApiResource::erase::<Pod>(&()),
            ResourceKind::LedgerNode => ApiResource::erase::<LedgerNode>(&()),
        }
    }

    /// Top level keys of the object body that carry observed state
    /// rather than desired state
    pub fn observed_keys(&self) -> &'static [&'static str] {
        &["status"]
    }

    /// Empty object of that kind, ready to be handed to a builder
    pub fn template(&self) -> DynamicObject {
        DynamicObject::new("", &self.api_resource()).data(serde_json::json!({}))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Service => "Service",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::Ingress => "Ingress",
            ResourceKind::Job => "Job",
            ResourceKind::Pod => "Pod",
            ResourceKind::LedgerNode => "LedgerNode",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_carries_type_meta() {
        let obj = ResourceKind::Deployment.template();
        let types = obj.types.unwrap();
        assert_eq!(types.kind, "Deployment");
        assert_eq!(types.api_version, "apps/v1");
        assert!(obj.data.is_object());
    }

    #[test]
    fn test_ledgernode_api_resource() {
        let ar = ResourceKind::LedgerNode.api_resource();
        assert_eq!(ar.group, "ledgerops.dev");
        assert_eq!(ar.plural, "ledgernodes");
    }
}
