use crate::{Result, ResourceKind, store::ObjectStore};
use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt, api::DynamicObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::debug;

/// Describe one managed ledger network component
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "LedgerNode",
    status = "LedgerNodeStatus",
    shortname = "lnode",
    group = "ledgerops.dev",
    version = "v1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing a peer, orderer or CA node of a ledger network",
    printcolumn = r#"
    {"name":"component", "type":"string", "description":"Component", "jsonPath":".spec.component"},
    {"name":"version",   "type":"string", "description":"Requested version", "jsonPath":".spec.version"},
    {"name":"current",   "type":"string", "description":"Reconciled version", "jsonPath":".status.version"},
    {"name":"state",     "type":"string", "description":"State", "jsonPath":".status.type"},
    {"name":"reason",    "type":"string", "description":"Reason", "jsonPath":".status.reason"},
    {"name":"last_updated", "type":"date", "description":"Last heartbeat", "format": "date-time", "jsonPath":".status.lastHeartbeatTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LedgerNodeSpec {
    /// Which product this node runs
    pub component: ComponentKind,
    /// Product version, used for migration decisions
    pub version: String,
    /// Container image of the main workload
    pub image: String,
    /// Number of workload replicas
    pub replicas: Option<i32>,
    /// Persistent storage of the node
    pub storage: Option<StorageSpec>,
    /// Free form configuration override merged into the node configuration
    pub config_override: Option<serde_json::Value>,
    /// How the node enrolls against its certificate authority
    pub enrollment: Option<EnrollmentSpec>,
    /// HSM proxy used for key custody
    pub hsm: Option<HsmSpec>,
    /// State database flavour (peer only)
    pub state_db: Option<StateDb>,
    /// Disable node organizational units in the MSP configuration
    pub node_ou_disabled: Option<bool>,
    /// Renew certificates automatically before they expire
    pub auto_renew: Option<bool>,
    /// Expose the node through an ingress under that domain
    pub ingress_domain: Option<String>,
    /// One shot actions, cleared once consumed
    pub action: Option<ActionSpec>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    #[default]
    Peer,
    Orderer,
    Ca,
}

impl ComponentKind {
    /// Named ports exposed by the product
    pub fn ports(&self) -> Vec<(&'static str, i32)> {
        match self {
            ComponentKind::Peer => vec![("peer", 7051), ("operations", 9443)],
            ComponentKind::Orderer => vec![("orderer", 7050), ("admin", 9443), ("operations", 8443)],
            ComponentKind::Ca => vec![("ca", 7054), ("operations", 9443)],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Peer => "peer",
            ComponentKind::Orderer => "orderer",
            ComponentKind::Ca => "ca",
        }
    }
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum StateDb {
    #[default]
    LevelDb,
    CouchDb,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Requested size (ie: 10Gi)
    pub size: String,
    /// Storage class, platform default when absent
    pub class: Option<String>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentSpec {
    pub ca_host: String,
    pub ca_port: u16,
    pub ca_name: String,
    /// Identity used to enroll
    pub enroll_id: String,
    /// Secret holding the enrollment secret under the `secret` key
    pub enroll_secret_ref: String,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct HsmSpec {
    /// host:port of the HSM proxy
    pub endpoint: String,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    /// Restart the workload once
    pub restart: Option<bool>,
    /// Renew certificates right away
    pub reenroll: Option<ReenrollAction>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReenrollAction {
    pub ecert: Option<bool>,
    pub tls: Option<bool>,
}

/// Overall state reported in `status.type`
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum NodeStatusType {
    #[default]
    Deploying,
    Deployed,
    Warning,
    Error,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
pub enum ConditionsType {
    #[default]
    Ready,
    ResourcesReconciled,
    DriftRestored,
    Migrated,
    CertificatesValid,
    Restarted,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
pub enum ConditionsStatus {
    #[default]
    True,
    False,
}

/// ApplicationCondition contains details about one step of the reconciliation
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationCondition {
    /// LastTransitionTime is the time the condition was last observed
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Message contains human-readable message indicating details about condition
    pub message: String,
    /// Type is an application condition type
    #[serde(rename = "type")]
    pub condition_type: ConditionsType,
    /// Status ("True" or "False") describe if the condition is enbled
    pub status: ConditionsStatus,
    /// Generation for that status
    pub generation: i64,
}

impl ApplicationCondition {
    #[must_use]
    pub fn new(
        message: &str,
        status: ConditionsStatus,
        condition_type: ConditionsType,
        generation: i64,
    ) -> ApplicationCondition {
        ApplicationCondition {
            last_transition_time: Some(chrono::offset::Utc::now()),
            status,
            condition_type,
            message: message.to_string(),
            generation,
        }
    }

    pub fn ready_ok(generation: i64) -> ApplicationCondition {
        ApplicationCondition::new(
            "Node deployed",
            ConditionsStatus::True,
            ConditionsType::Ready,
            generation,
        )
    }

    pub fn ready_ko(message: &str, generation: i64) -> ApplicationCondition {
        ApplicationCondition::new(message, ConditionsStatus::False, ConditionsType::Ready, generation)
    }

    pub fn resources_ok(generation: i64) -> ApplicationCondition {
        ApplicationCondition::new(
            "Resources reconciled",
            ConditionsStatus::True,
            ConditionsType::ResourcesReconciled,
            generation,
        )
    }

    pub fn drift_restored(paths: &[String], generation: i64) -> ApplicationCondition {
        ApplicationCondition::new(
            &format!("Restored drifted fields: {}", paths.join(", ")),
            ConditionsStatus::True,
            ConditionsType::DriftRestored,
            generation,
        )
    }

    pub fn migration_running(target: &str, generation: i64) -> ApplicationCondition {
        ApplicationCondition::new(
            &format!("Migration to {target} running"),
            ConditionsStatus::False,
            ConditionsType::Migrated,
            generation,
        )
    }

    pub fn migrated(target: &str, generation: i64) -> ApplicationCondition {
        ApplicationCondition::new(
            &format!("Migrated to {target}"),
            ConditionsStatus::True,
            ConditionsType::Migrated,
            generation,
        )
    }

    pub fn certificates(valid: bool, message: &str, generation: i64) -> ApplicationCondition {
        ApplicationCondition::new(
            message,
            if valid {
                ConditionsStatus::True
            } else {
                ConditionsStatus::False
            },
            ConditionsType::CertificatesValid,
            generation,
        )
    }

    pub fn restarted(reasons: &str, generation: i64) -> ApplicationCondition {
        ApplicationCondition::new(
            &format!("Restarted for: {reasons}"),
            ConditionsStatus::True,
            ConditionsType::Restarted,
            generation,
        )
    }
}

/// The status object of `LedgerNode`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LedgerNodeStatus {
    /// Overall state
    #[serde(rename = "type")]
    pub status_type: Option<NodeStatusType>,
    /// Machine readable reason of the current state
    pub reason: Option<String>,
    /// Human readable message
    pub message: Option<String>,
    /// Version reconciled last (migrations included)
    pub version: Option<String>,
    /// Generation reconciled last
    pub observed_generation: Option<i64>,
    /// Digests of the inputs that require a restart when they change
    #[serde(default)]
    pub digests: BTreeMap<String, String>,
    /// Last time the status was written
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Conditions
    #[serde(default)]
    pub conditions: Vec<ApplicationCondition>,
}

/// Identity of one instance, used to key per instance state
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub namespace: String,
    pub name: String,
}

impl InstanceKey {
    pub fn new(namespace: &str, name: &str) -> InstanceKey {
        InstanceKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl From<&LedgerNode> for InstanceKey {
    fn from(node: &LedgerNode) -> Self {
        InstanceKey {
            namespace: node.namespace().unwrap_or_default(),
            name: node.name_any(),
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub const DIGEST_CONFIG_OVERRIDE: &str = "configOverride";
pub const DIGEST_NODE_OU: &str = "nodeOU";
pub const DIGEST_ADMIN_CERTS: &str = "adminCerts";

impl LedgerNode {
    pub fn key(&self) -> InstanceKey {
        InstanceKey::from(self)
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(1)
    }

    /// An update is requested whenever the spec changed since the last pass
    pub fn update_requested(&self) -> bool {
        match self.status.as_ref().and_then(|s| s.observed_generation) {
            Some(observed) => observed != self.generation(),
            None => true,
        }
    }

    /// Version that was fully reconciled last
    pub fn current_version(&self) -> Option<String> {
        self.status.as_ref().and_then(|s| s.version.clone())
    }

    pub fn status_digest(&self, key: &str) -> Option<String> {
        self.status.as_ref().and_then(|s| s.digests.get(key).cloned())
    }

    pub fn config_override_digest(&self) -> String {
        match &self.spec.config_override {
            Some(opt) => sha256::digest(opt.to_string()),
            None => sha256::digest(""),
        }
    }

    pub fn node_ou_digest(&self) -> String {
        self.spec.node_ou_disabled.unwrap_or(false).to_string()
    }

    pub fn restart_requested(&self) -> bool {
        self.spec
            .action
            .as_ref()
            .and_then(|a| a.restart)
            .unwrap_or(false)
    }

    pub fn auto_renew(&self, default: bool) -> bool {
        self.spec.auto_renew.unwrap_or(default)
    }

    pub fn uses_couchdb(&self) -> bool {
        self.spec.component == ComponentKind::Peer && self.spec.state_db == Some(StateDb::CouchDb)
    }

    /// Conditions currently in the status minus the given types
    pub fn conditions_excluding(&self, exclude: &[ConditionsType]) -> Vec<ApplicationCondition> {
        let mut ret = Vec::new();
        if let Some(status) = &self.status {
            for c in &status.conditions {
                if !exclude.contains(&c.condition_type) {
                    ret.push(c.clone());
                }
            }
        }
        ret
    }
}

/// Write the status subresource of an instance through the store
pub async fn patch_status(
    store: &dyn ObjectStore,
    key: &InstanceKey,
    status: serde_json::Value,
) -> Result<DynamicObject> {
    let mut status = status;
    if let Some(obj) = status.as_object_mut() {
        obj.insert("lastHeartbeatTime".to_string(), json!(Utc::now()));
    }
    store
        .patch_status(ResourceKind::LedgerNode, &key.namespace, &key.name, &json!({ "status": status }))
        .await
}

/// Conditions that did not change keep the transition time they had
fn keep_transition_times(previous: &[ApplicationCondition], conditions: &mut [Value]) -> Result<()> {
    for condition in conditions.iter_mut() {
        let Some(prev) = previous
            .iter()
            .find(|p| serde_json::to_value(&p.condition_type).ok().as_ref() == condition.get("type"))
        else {
            continue;
        };
        let mut prev = serde_json::to_value(prev)?;
        let time = prev.get("lastTransitionTime").cloned().unwrap_or(Value::Null);
        if let (Some(p), Some(c)) = (prev.as_object_mut(), condition.as_object()) {
            p.insert(
                "lastTransitionTime".to_string(),
                c.get("lastTransitionTime").cloned().unwrap_or(Value::Null),
            );
        }
        if prev == *condition {
            if let Some(c) = condition.as_object_mut() {
                c.insert("lastTransitionTime".to_string(), time);
            }
        }
    }
    Ok(())
}

/// Write the status of an instance unless nothing but timestamps would
/// change. Returns whether it was written.
pub async fn update_status(store: &dyn ObjectStore, node: &LedgerNode, status: Value) -> Result<bool> {
    let mut status = status;
    let previous = node.status.clone().unwrap_or_default();
    if let Some(Value::Array(conditions)) = status.get_mut("conditions") {
        keep_transition_times(&previous.conditions, conditions)?;
    }
    let current = serde_json::to_value(&previous)?;
    let mut merged = current.clone();
    json_patch::merge(&mut merged, &status);
    if merged == current {
        debug!("Status of {} unchanged", node.key());
        return Ok(false);
    }
    patch_status(store, &node.key(), status).await?;
    Ok(true)
}

/// Parse a `LedgerNode` out of what the store returned
pub fn from_dynamic(obj: DynamicObject) -> Result<LedgerNode> {
    let value = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(value)?)
}
