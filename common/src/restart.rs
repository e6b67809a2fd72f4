use crate::{InstanceKey, LedgerNode, Result, resource::ResourceManager};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
};
use tracing::{info, warn};

pub const RESTARTED_AT_ANNOTATION: &str = "ledgerops.dev/restartedAt";
pub const RESTART_REASONS_ANNOTATION: &str = "ledgerops.dev/restartReasons";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RestartReason {
    CertUpdate,
    ConfigOverride,
    #[serde(rename = "NodeOU")]
    NodeOu,
    AdminCertUpdate,
    RestartAction,
    Migration,
}

impl RestartReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartReason::CertUpdate => "CertUpdate",
            RestartReason::ConfigOverride => "ConfigOverride",
            RestartReason::NodeOu => "NodeOU",
            RestartReason::AdminCertUpdate => "AdminCertUpdate",
            RestartReason::RestartAction => "RestartAction",
            RestartReason::Migration => "Migration",
        }
    }
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn join_reasons(reasons: &BTreeSet<RestartReason>) -> String {
    reasons.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(",")
}

/// Coalesce every restart request of an instance into a single rollout
#[derive(Default)]
pub struct RestartCoordinator {
    pending: Mutex<HashMap<InstanceKey, BTreeSet<RestartReason>>>,
    disabled: bool,
}

impl RestartCoordinator {
    #[must_use]
    pub fn new(disabled: bool) -> RestartCoordinator {
        RestartCoordinator {
            pending: Mutex::new(HashMap::new()),
            disabled,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceKey, BTreeSet<RestartReason>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, key: &InstanceKey, reason: RestartReason) {
        if self.lock().entry(key.clone()).or_default().insert(reason) {
            info!("Restart of {key} requested for {reason}");
        }
    }

    pub fn pending(&self, key: &InstanceKey) -> BTreeSet<RestartReason> {
        self.lock().get(key).cloned().unwrap_or_default()
    }

    /// Drop the pending reasons of a deleted instance
    pub fn forget(&self, key: &InstanceKey) {
        self.lock().remove(key);
    }

    fn take(&self, key: &InstanceKey) -> BTreeSet<RestartReason> {
        self.lock().remove(key).unwrap_or_default()
    }

    fn merge_back(&self, key: &InstanceKey, reasons: BTreeSet<RestartReason>) {
        self.lock().entry(key.clone()).or_default().extend(reasons);
    }

    /// Restart the workload once if any reason is pending.
    /// Returns the reasons that were served.
    pub async fn trigger_if_needed(
        &self,
        node: &LedgerNode,
        workload: &ResourceManager,
    ) -> Result<Option<BTreeSet<RestartReason>>> {
        let key = node.key();
        let reasons = self.take(&key);
        if reasons.is_empty() {
            return Ok(None);
        }
        if self.disabled {
            info!(
                "Restarts are disabled, dropping pending restart of {key} ({})",
                join_reasons(&reasons)
            );
            return Ok(None);
        }
        let marker = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let joined = join_reasons(&reasons);
        let patch = json!({
            "spec": { "template": { "metadata": { "annotations": {
                RESTARTED_AT_ANNOTATION: marker,
                RESTART_REASONS_ANNOTATION: joined,
            }}}}
        });
        match workload
            .resilient_patch(node, workload.retries().update_retries, |_| {
                Ok(Some((patch.clone(), ())))
            })
            .await
        {
            Ok(_) => {
                info!("Restarted {} {key} for {joined}", workload.kind());
                Ok(Some(reasons))
            }
            Err(e) => {
                warn!("Restart of {key} failed, keeping {joined} for the next pass: {e}");
                self.merge_back(&key, reasons);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ResourceKind,
        drift::DriftDetector,
        instance::LedgerNodeSpec,
        k8smock::{MemoryStore, Operation},
        resource::{OverrideAction, OverrideFn, OverrideTable, RetryPolicy},
    };
    use kube::api::DynamicObject;
    use std::sync::Arc;

    fn node() -> LedgerNode {
        let mut n = LedgerNode::new("orderer0", LedgerNodeSpec::default());
        n.metadata.namespace = Some("ord".to_string());
        n.metadata.uid = Some("uid-2".to_string());
        n
    }

    async fn workload(store: &MemoryStore) -> ResourceManager {
        let builder: OverrideFn = Arc::new(|_: &LedgerNode, obj: &mut DynamicObject, _: OverrideAction| {
            obj.data["spec"] = json!({"template": {"spec": {"containers": [{"name": "orderer"}]}}});
            Ok(())
        });
        let m = ResourceManager::new(
            ResourceKind::Deployment,
            Arc::new(store.clone()),
            &OverrideTable::new().with(ResourceKind::Deployment, builder),
            Arc::new(DriftDetector::default()),
            RetryPolicy::default(),
        )
        .unwrap();
        m.reconcile(&node(), false).await.unwrap();
        store.clear_operations();
        m
    }

    fn patches(store: &MemoryStore) -> usize {
        store.count(|op| matches!(op, Operation::Patch(ResourceKind::Deployment, _)))
    }

    #[tokio::test]
    async fn test_nothing_pending_does_nothing() {
        let store = MemoryStore::new();
        let m = workload(&store).await;
        let rc = RestartCoordinator::new(false);
        assert_eq!(rc.trigger_if_needed(&node(), &m).await.unwrap(), None);
        assert_eq!(patches(&store), 0);
    }

    #[tokio::test]
    async fn test_reasons_coalesce_into_one_restart() {
        let store = MemoryStore::new();
        let m = workload(&store).await;
        let rc = RestartCoordinator::new(false);
        let key = node().key();
        rc.register(&key, RestartReason::CertUpdate);
        rc.register(&key, RestartReason::ConfigOverride);
        rc.register(&key, RestartReason::CertUpdate);
        assert_eq!(rc.pending(&key).len(), 2);
        let served = rc.trigger_if_needed(&node(), &m).await.unwrap().unwrap();
        assert_eq!(
            served,
            BTreeSet::from([RestartReason::CertUpdate, RestartReason::ConfigOverride])
        );
        assert_eq!(patches(&store), 1);
        assert!(rc.pending(&key).is_empty());
        assert_eq!(rc.trigger_if_needed(&node(), &m).await.unwrap(), None);
        assert_eq!(patches(&store), 1);

        let obj = store.peek(ResourceKind::Deployment, "ord", "orderer0").unwrap();
        let annotations = &obj.data["spec"]["template"]["metadata"]["annotations"];
        assert!(annotations[RESTARTED_AT_ANNOTATION].is_string());
        assert_eq!(annotations[RESTART_REASONS_ANNOTATION], "CertUpdate,ConfigOverride");
    }

    #[tokio::test]
    async fn test_late_registration_waits_for_next_pass() {
        let store = MemoryStore::new();
        let m = workload(&store).await;
        let rc = RestartCoordinator::new(false);
        let key = node().key();
        rc.register(&key, RestartReason::NodeOu);
        rc.trigger_if_needed(&node(), &m).await.unwrap();
        rc.register(&key, RestartReason::Migration);
        assert_eq!(rc.pending(&key), BTreeSet::from([RestartReason::Migration]));
    }

    #[tokio::test]
    async fn test_failed_restart_keeps_reasons() {
        let store = MemoryStore::new();
        let m = workload(&store).await;
        let rc = RestartCoordinator::new(false);
        let key = node().key();
        rc.register(&key, RestartReason::AdminCertUpdate);
        store.inject_failure(ResourceKind::Deployment, "ord", "orderer0", "api down");
        assert!(rc.trigger_if_needed(&node(), &m).await.is_err());
        rc.register(&key, RestartReason::RestartAction);
        assert_eq!(
            rc.pending(&key),
            BTreeSet::from([RestartReason::AdminCertUpdate, RestartReason::RestartAction])
        );
    }

    #[tokio::test]
    async fn test_disabled_drops_reasons() {
        let store = MemoryStore::new();
        let m = workload(&store).await;
        let rc = RestartCoordinator::new(true);
        let key = node().key();
        rc.register(&key, RestartReason::CertUpdate);
        assert_eq!(rc.trigger_if_needed(&node(), &m).await.unwrap(), None);
        assert!(rc.pending(&key).is_empty());
        assert_eq!(patches(&store), 0);
    }

    #[test]
    fn test_forget_and_isolation() {
        let rc = RestartCoordinator::default();
        let a = InstanceKey::new("ns", "a");
        let b = InstanceKey::new("ns", "b");
        rc.register(&a, RestartReason::CertUpdate);
        rc.register(&b, RestartReason::Migration);
        rc.forget(&a);
        assert!(rc.pending(&a).is_empty());
        assert_eq!(rc.pending(&b).len(), 1);
    }

    #[test]
    fn test_reason_names() {
        assert_eq!(serde_json::to_value(RestartReason::NodeOu).unwrap(), "NodeOU");
        assert_eq!(RestartReason::NodeOu.to_string(), "NodeOU");
    }
}
