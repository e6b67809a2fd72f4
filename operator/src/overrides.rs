use async_trait::async_trait;
use common::{
    LedgerNode, ResourceKind,
    config::OperatorConfig,
    context::get_labels,
    instance::{ComponentKind, StateDb},
    resource::{OverrideAction, OverrideFn, OverrideTable, ReconcileHook, ResourceManager, ResourceSet},
    store::ObjectStore,
};
use kube::{ResourceExt, api::DynamicObject};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

pub const DATA_PATH: &str = "/var/ledger/data";
pub const CONFIG_PATH: &str = "/etc/ledger";
pub const CONFIG_KEY: &str = "core.json";

pub fn pvc_name(node: &LedgerNode) -> String {
    format!("{}-pvc", node.name_any())
}

pub fn config_name(node: &LedgerNode) -> String {
    format!("{}-config", node.name_any())
}

pub fn ingress_host(node: &LedgerNode, domain: &str) -> String {
    format!("{}.{}", node.name_any(), domain)
}

fn builder_error(kind: ResourceKind, message: &str) -> common::Error {
    common::Error::Builder {
        kind: kind.to_string(),
        message: message.to_string(),
    }
}

fn env(node: &LedgerNode) -> Vec<Value> {
    let mut env = vec![
        json!({"name": "LEDGER_COMPONENT", "value": node.spec.component.as_str()}),
        json!({"name": "LEDGER_VERSION", "value": node.spec.version}),
        json!({"name": "LEDGER_CONFIG_PATH", "value": CONFIG_PATH}),
    ];
    if let Some(hsm) = &node.spec.hsm {
        env.push(json!({"name": "HSM_ENDPOINT", "value": hsm.endpoint}));
    }
    if node.spec.component == ComponentKind::Peer {
        match node.spec.state_db.unwrap_or_default() {
            StateDb::CouchDb => {
                env.push(json!({"name": "STATE_DATABASE", "value": "CouchDB"}));
                env.push(json!({"name": "COUCHDB_ADDRESS", "value": format!("{}-statedb:5984", node.name_any())}));
            }
            StateDb::LevelDb => env.push(json!({"name": "STATE_DATABASE", "value": "goleveldb"})),
        }
    }
    env
}

fn deployment(node: &LedgerNode, obj: &mut DynamicObject, _action: OverrideAction) -> common::Result<()> {
    if node.spec.image.is_empty() {
        return Err(builder_error(ResourceKind::Deployment, "spec.image is empty"));
    }
    let labels = get_labels(node);
    let ports: Vec<Value> = node
        .spec
        .component
        .ports()
        .into_iter()
        .map(|(name, port)| json!({"name": name, "containerPort": port}))
        .collect();
    let data = if node.spec.storage.is_some() {
        json!({"name": "data", "persistentVolumeClaim": {"claimName": pvc_name(node)}})
    } else {
        json!({"name": "data", "emptyDir": {}})
    };
    let desired = json!({
        "spec": {
            "replicas": node.spec.replicas.unwrap_or(1),
            "selector": {"matchLabels": labels},
            "template": {
                "metadata": {"labels": labels},
                "spec": {
                    "containers": [{
                        "name": node.spec.component.as_str(),
                        "image": node.spec.image,
                        "ports": ports,
                        "env": env(node),
                        "resources": {},
                        "volumeMounts": [
                            {"name": "data", "mountPath": DATA_PATH},
                            {"name": "config", "mountPath": CONFIG_PATH},
                        ],
                    }],
                    "volumes": [
                        data,
                        {"name": "config", "configMap": {"name": config_name(node)}},
                    ],
                }
            }
        }
    });
    json_patch::merge(&mut obj.data, &desired);
    Ok(())
}

fn service(node: &LedgerNode, obj: &mut DynamicObject, _action: OverrideAction) -> common::Result<()> {
    let ports: Vec<Value> = node
        .spec
        .component
        .ports()
        .into_iter()
        .map(|(name, port)| json!({"name": name, "port": port, "targetPort": port}))
        .collect();
    let desired = json!({
        "spec": {
            "type": "ClusterIP",
            "selector": get_labels(node),
            "ports": ports,
        }
    });
    json_patch::merge(&mut obj.data, &desired);
    Ok(())
}

fn pvc(node: &LedgerNode, obj: &mut DynamicObject, action: OverrideAction) -> common::Result<()> {
    let Some(storage) = &node.spec.storage else {
        return Err(builder_error(ResourceKind::PersistentVolumeClaim, "spec.storage is not set"));
    };
    if storage.size.is_empty() {
        return Err(builder_error(ResourceKind::PersistentVolumeClaim, "spec.storage.size is empty"));
    }
    // a bound claim only accepts a bigger size
    let desired = match action {
        OverrideAction::Create => {
            let mut spec = json!({
                "accessModes": ["ReadWriteOnce"],
                "resources": {"requests": {"storage": storage.size}},
            });
            if let Some(class) = &storage.class {
                spec["storageClassName"] = json!(class);
            }
            json!({ "spec": spec })
        }
        OverrideAction::Update => json!({"spec": {"resources": {"requests": {"storage": storage.size}}}}),
    };
    json_patch::merge(&mut obj.data, &desired);
    Ok(())
}

fn configmap(node: &LedgerNode, obj: &mut DynamicObject, _action: OverrideAction) -> common::Result<()> {
    let core = node.spec.config_override.clone().unwrap_or_else(|| json!({}));
    let desired = json!({
        "data": {
            CONFIG_KEY: serde_json::to_string(&core)?,
            "nodeOUs": (!node.spec.node_ou_disabled.unwrap_or(false)).to_string(),
        }
    });
    json_patch::merge(&mut obj.data, &desired);
    Ok(())
}

fn ingress(node: &LedgerNode, obj: &mut DynamicObject, _action: OverrideAction) -> common::Result<()> {
    let Some(domain) = &node.spec.ingress_domain else {
        return Err(builder_error(ResourceKind::Ingress, "spec.ingressDomain is not set"));
    };
    let Some((port, _)) = node.spec.component.ports().into_iter().next() else {
        return Err(builder_error(ResourceKind::Ingress, "component exposes no port"));
    };
    let desired = json!({
        "spec": {
            "rules": [{
                "host": ingress_host(node, domain),
                "http": {"paths": [{
                    "path": "/",
                    "pathType": "Prefix",
                    "backend": {"service": {"name": node.name_any(), "port": {"name": port}}},
                }]},
            }],
        }
    });
    json_patch::merge(&mut obj.data, &desired);
    Ok(())
}

/// Builders of every kind the operator owns
pub fn default_table() -> OverrideTable {
    OverrideTable::new()
        .with(ResourceKind::Deployment, Arc::new(deployment) as OverrideFn)
        .with(ResourceKind::Service, Arc::new(service) as OverrideFn)
        .with(ResourceKind::PersistentVolumeClaim, Arc::new(pvc) as OverrideFn)
        .with(ResourceKind::ConfigMap, Arc::new(configmap) as OverrideFn)
        .with(ResourceKind::Ingress, Arc::new(ingress) as OverrideFn)
}

/// Remove the ingress of instances that stopped asking for one
pub struct IngressCleanup {
    ingress: ResourceManager,
}

#[async_trait]
impl ReconcileHook for IngressCleanup {
    async fn post_reconcile(&self, node: &LedgerNode, _update_requested: bool) -> common::Result<()> {
        if node.spec.ingress_domain.is_none() && self.ingress.exists(node).await? {
            self.ingress.delete(node).await?;
            info!("Deleted ingress of {}", node.key());
        }
        Ok(())
    }
}

/// Managers and hooks of a `LedgerNode`
pub fn resource_set(store: Arc<dyn ObjectStore>, config: &OperatorConfig) -> common::Result<ResourceSet> {
    let table = default_table();
    let detector = Arc::new(config.drift_detector()?);
    let retries = config.retry_policy();
    let manager = |kind| ResourceManager::new(kind, store.clone(), &table, detector.clone(), retries);

    let mut config_map = manager(ResourceKind::ConfigMap)?;
    config_map.set_custom_name("config");
    let mut claim = manager(ResourceKind::PersistentVolumeClaim)?.when(|n| n.spec.storage.is_some());
    claim.set_custom_name("pvc");
    let ingress = manager(ResourceKind::Ingress)?.when(|n| n.spec.ingress_domain.is_some());

    Ok(ResourceSet::new(vec![
        config_map,
        claim,
        manager(ResourceKind::Service)?,
        manager(ResourceKind::Deployment)?,
        ingress.clone(),
    ])
    .with_hook(Arc::new(IngressCleanup { ingress })))
}
