use crate::{
    Error, LedgerNode, ResourceKind, Result,
    context::{get_labels, get_owner},
    drift::{DriftDetector, DriftReport, merge_patch, restore_target},
    store::ObjectStore,
};
use async_trait::async_trait;
use kube::{ResourceExt, api::DynamicObject};
use serde_json::{Value, json};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info, warn};

/// Why a builder is called
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverrideAction {
    Create,
    Update,
}

/// Desired state builder: mutates the template it is given into the
/// desired state of the instance.
pub type OverrideFn =
    Arc<dyn Fn(&LedgerNode, &mut DynamicObject, OverrideAction) -> Result<()> + Send + Sync>;

/// Builders keyed by the kind they produce
#[derive(Clone, Default)]
pub struct OverrideTable {
    builders: HashMap<ResourceKind, OverrideFn>,
}

impl OverrideTable {
    #[must_use]
    pub fn new() -> OverrideTable {
        OverrideTable::default()
    }

    #[must_use]
    pub fn with(mut self, kind: ResourceKind, builder: OverrideFn) -> OverrideTable {
        self.builders.insert(kind, builder);
        self
    }

    pub fn get(&self, kind: ResourceKind) -> Result<OverrideFn> {
        self.builders
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::MissingBuilder(kind.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub update_retries: u32,
    pub restore_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            update_retries: 3,
            restore_retries: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Object body that carries desired state (observed keys removed)
fn desired_body(kind: ResourceKind, obj: &DynamicObject) -> Value {
    let mut body = obj.data.clone();
    if let Some(map) = body.as_object_mut() {
        for key in kind.observed_keys() {
            map.remove(*key);
        }
    }
    body
}

fn strip_observed(kind: ResourceKind, obj: &DynamicObject) -> Result<Value> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        for key in kind.observed_keys() {
            map.remove(*key);
        }
    }
    Ok(value)
}

fn is_empty_patch(patch: &Value) -> bool {
    patch.as_object().map(|m| m.is_empty()).unwrap_or(false)
}

/// Manage one kind of child object for every instance
#[derive(Clone)]
pub struct ResourceManager {
    kind: ResourceKind,
    store: Arc<dyn ObjectStore>,
    builder: OverrideFn,
    detector: Arc<DriftDetector>,
    retries: RetryPolicy,
    suffix: Option<String>,
    condition: Option<fn(&LedgerNode) -> bool>,
}

impl ResourceManager {
    /// Resolve the builder for `kind` once, fail if none is registered
    pub fn new(
        kind: ResourceKind,
        store: Arc<dyn ObjectStore>,
        table: &OverrideTable,
        detector: Arc<DriftDetector>,
        retries: RetryPolicy,
    ) -> Result<ResourceManager> {
        Ok(ResourceManager {
            kind,
            store,
            builder: table.get(kind)?,
            detector,
            retries,
            suffix: None,
            condition: None,
        })
    }

    /// Only manage the object for instances matching `condition`
    #[must_use]
    pub fn when(mut self, condition: fn(&LedgerNode) -> bool) -> ResourceManager {
        self.condition = Some(condition);
        self
    }

    pub fn applies_to(&self, node: &LedgerNode) -> bool {
        self.condition.map(|c| c(node)).unwrap_or(true)
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn retries(&self) -> RetryPolicy {
        self.retries
    }

    pub fn set_custom_name(&mut self, suffix: &str) {
        self.suffix = if suffix.is_empty() {
            None
        } else {
            Some(suffix.to_string())
        };
    }

    pub fn name(&self, node: &LedgerNode) -> String {
        match &self.suffix {
            Some(suffix) => format!("{}-{}", node.name_any(), suffix),
            None => node.name_any(),
        }
    }

    fn namespace(node: &LedgerNode) -> String {
        node.namespace().unwrap_or_default()
    }

    fn not_reconciled(&self, node: &LedgerNode) -> Error {
        Error::NotFound {
            kind: self.kind.to_string(),
            namespace: Self::namespace(node),
            name: self.name(node),
        }
    }

    /// Stamp name, namespace, labels and owner from the instance
    fn apply_identity(&self, node: &LedgerNode, obj: &mut DynamicObject) -> Result<()> {
        obj.metadata.name = Some(self.name(node));
        obj.metadata.namespace = Some(Self::namespace(node));
        let mut labels = obj.metadata.labels.clone().unwrap_or_default();
        labels.extend(get_labels(node));
        obj.metadata.labels = Some(labels);
        obj.metadata.owner_references = Some(vec![get_owner(node)?]);
        Ok(())
    }

    fn build(&self, node: &LedgerNode, obj: &mut DynamicObject, action: OverrideAction) -> Result<()> {
        (self.builder)(node, obj, action).map_err(|e| match e {
            Error::Builder { .. } => e,
            e => Error::Builder {
                kind: self.kind.to_string(),
                message: e.to_string(),
            },
        })
    }

    /// Create the object when missing, patch it when an update is requested
    pub async fn reconcile(&self, node: &LedgerNode, update_requested: bool) -> Result<ReconcileOutcome> {
        let ns = Self::namespace(node);
        let name = self.name(node);
        match self.store.get_opt(self.kind, &ns, &name).await? {
            None => {
                let mut obj = self.kind.template();
                self.build(node, &mut obj, OverrideAction::Create)?;
                self.apply_identity(node, &mut obj)?;
                self.store.create(self.kind, &ns, &obj).await?;
                info!("Created {} {}/{}", self.kind, ns, name);
                Ok(ReconcileOutcome::Created)
            }
            Some(_) if update_requested => {
                let patched = self
                    .resilient_patch(node, self.retries.update_retries, |live| {
                        let mut updated = live.clone();
                        self.build(node, &mut updated, OverrideAction::Update)?;
                        self.apply_identity(node, &mut updated)?;
                        let patch = merge_patch(
                            &strip_observed(self.kind, live)?,
                            &strip_observed(self.kind, &updated)?,
                        );
                        Ok(if is_empty_patch(&patch) {
                            None
                        } else {
                            Some((patch, ()))
                        })
                    })
                    .await?;
                Ok(match patched {
                    Some(()) => {
                        info!("Updated {} {}/{}", self.kind, ns, name);
                        ReconcileOutcome::Updated
                    }
                    None => ReconcileOutcome::Unchanged,
                })
            }
            Some(_) => Ok(ReconcileOutcome::Unchanged),
        }
    }

    pub async fn exists(&self, node: &LedgerNode) -> Result<bool> {
        Ok(self
            .store
            .get_opt(self.kind, &Self::namespace(node), &self.name(node))
            .await?
            .is_some())
    }

    pub async fn get(&self, node: &LedgerNode) -> Result<DynamicObject> {
        self.store
            .get(self.kind, &Self::namespace(node), &self.name(node))
            .await
    }

    pub async fn delete(&self, node: &LedgerNode) -> Result<()> {
        self.store
            .delete(self.kind, &Self::namespace(node), &self.name(node))
            .await
    }

    /// What the builder would make of the live object
    fn expected(&self, node: &LedgerNode, live: &DynamicObject) -> Result<DynamicObject> {
        let mut expected = live.clone();
        self.build(node, &mut expected, OverrideAction::Create)?;
        Ok(expected)
    }

    fn report_for(&self, node: &LedgerNode, live: &DynamicObject) -> Result<DriftReport> {
        let expected = self.expected(node, live)?;
        Ok(self
            .detector
            .compare(&desired_body(self.kind, live), &desired_body(self.kind, &expected)))
    }

    pub async fn drift_report(&self, node: &LedgerNode) -> Result<DriftReport> {
        let live = self.get(node).await?;
        self.report_for(node, &live)
    }

    /// Fail with the violating paths when the live object drifted away
    pub async fn check_state(&self, node: &LedgerNode) -> Result<()> {
        let report = self.drift_report(node).await?;
        if report.is_clean() {
            return Ok(());
        }
        let mut paths = report.violation_paths();
        if report.truncated {
            paths.push("(truncated)".to_string());
        }
        Err(Error::DriftDetected {
            instance: node.key().to_string(),
            kind: self.kind.to_string(),
            paths,
        })
    }

    /// Write the expected value back on every violating path.
    /// Returns the restored paths.
    pub async fn restore_state(&self, node: &LedgerNode) -> Result<Vec<String>> {
        let restored = self
            .resilient_patch(node, self.retries.restore_retries, |live| {
                let report = self.report_for(node, live)?;
                if report.is_clean() {
                    return Ok(None);
                }
                let body = desired_body(self.kind, live);
                let target = restore_target(&body, &report)?;
                let patch = merge_patch(&body, &target);
                if is_empty_patch(&patch) {
                    return Ok(None);
                }
                Ok(Some((patch, report.violation_paths())))
            })
            .await?;
        let restored = restored.unwrap_or_default();
        if !restored.is_empty() {
            info!(
                "Restored {} {}/{}: {}",
                self.kind,
                Self::namespace(node),
                self.name(node),
                restored.join(", ")
            );
        }
        Ok(restored)
    }

    /// Merge patch guarded by the live resource version.
    ///
    /// `compute` gets a fresh copy of the live object on every attempt and
    /// returns the patch to send, or `None` when there is nothing to write.
    /// Conflicts are retried up to `attempts` times.
    pub async fn resilient_patch<R, F>(&self, node: &LedgerNode, attempts: u32, compute: F) -> Result<Option<R>>
    where
        F: Fn(&DynamicObject) -> Result<Option<(Value, R)>> + Send + Sync,
        R: Send,
    {
        let ns = Self::namespace(node);
        let name = self.name(node);
        let mut last = None;
        for attempt in 1..=attempts.max(1) {
            let live = match self.store.get_opt(self.kind, &ns, &name).await? {
                Some(live) => live,
                None => return Err(self.not_reconciled(node)),
            };
            let Some((mut patch, out)) = compute(&live)? else {
                return Ok(None);
            };
            if let Some(map) = patch.as_object_mut() {
                let meta = map.entry("metadata").or_insert_with(|| json!({}));
                if let Some(meta) = meta.as_object_mut() {
                    meta.insert(
                        "resourceVersion".to_string(),
                        json!(live.metadata.resource_version.clone().unwrap_or_default()),
                    );
                }
            }
            match self.store.patch(self.kind, &ns, &name, &patch).await {
                Ok(_) => return Ok(Some(out)),
                Err(e) if e.is_conflict() => {
                    debug!("Conflict patching {} {ns}/{name} (attempt {attempt}/{attempts})", self.kind);
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        warn!("Giving up patching {} {ns}/{name} after {attempts} conflicts", self.kind);
        Err(last.unwrap_or_else(|| self.not_reconciled(node)))
    }
}

/// Extension points around the resource reconciliation of an instance
#[async_trait]
pub trait ReconcileHook: Send + Sync {
    async fn pre_reconcile(&self, _node: &LedgerNode) -> Result<()> {
        Ok(())
    }

    async fn post_reconcile(&self, _node: &LedgerNode, _update_requested: bool) -> Result<()> {
        Ok(())
    }
}

/// The managers of an instance plus the hooks of its variant
#[derive(Clone, Default)]
pub struct ResourceSet {
    managers: Vec<ResourceManager>,
    hooks: Vec<Arc<dyn ReconcileHook>>,
}

impl ResourceSet {
    #[must_use]
    pub fn new(managers: Vec<ResourceManager>) -> ResourceSet {
        ResourceSet {
            managers,
            hooks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn ReconcileHook>) -> ResourceSet {
        self.hooks.push(hook);
        self
    }

    pub fn managers(&self) -> &[ResourceManager] {
        &self.managers
    }

    pub fn manager(&self, kind: ResourceKind) -> Option<&ResourceManager> {
        self.managers.iter().find(|m| m.kind() == kind)
    }

    pub async fn reconcile(&self, node: &LedgerNode, update_requested: bool) -> Result<()> {
        for hook in &self.hooks {
            hook.pre_reconcile(node).await?;
        }
        for manager in self.managers.iter().filter(|m| m.applies_to(node)) {
            manager.reconcile(node, update_requested).await?;
        }
        for hook in &self.hooks {
            hook.post_reconcile(node, update_requested).await?;
        }
        Ok(())
    }

    /// Check every object, restore the drifted ones.
    /// Returns the kinds that were restored with their paths.
    pub async fn check_and_restore(&self, node: &LedgerNode) -> Result<Vec<(ResourceKind, Vec<String>)>> {
        let mut restored = Vec::new();
        for manager in self.managers.iter().filter(|m| m.applies_to(node)) {
            match manager.check_state(node).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!("{} not reconciled yet, skipping drift check", manager.kind()),
                Err(Error::DriftDetected { paths, .. }) => {
                    warn!("Drift detected on {} of {}: {}", manager.kind(), node.key(), paths.join(", "));
                    let paths = manager.restore_state(node).await?;
                    restored.push((manager.kind(), paths));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        drift::{IgnorePolicy, default_ignore_rules},
        instance::LedgerNodeSpec,
        k8smock::{MemoryStore, Operation},
    };
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    fn node() -> LedgerNode {
        let mut n = LedgerNode::new("peer0", LedgerNodeSpec {
            version: "2.5.4".to_string(),
            image: "ledger/peer:2.5.4".to_string(),
            ..Default::default()
        });
        n.metadata.namespace = Some("org1".to_string());
        n.metadata.uid = Some("uid-1".to_string());
        n
    }

    fn deployment_builder() -> OverrideFn {
        Arc::new(|node: &LedgerNode, obj: &mut DynamicObject, _action: OverrideAction| {
            obj.data["spec"] = json!({
                "replicas": node.spec.replicas.unwrap_or(1),
                "template": {"spec": {"containers": [{"name": "peer", "image": node.spec.image}]}}
            });
            Ok(())
        })
    }

    fn manager(store: &MemoryStore) -> ResourceManager {
        let table = OverrideTable::new().with(ResourceKind::Deployment, deployment_builder());
        let detector = DriftDetector::new(IgnorePolicy::new(&default_ignore_rules()).unwrap(), 32, 100);
        ResourceManager::new(
            ResourceKind::Deployment,
            Arc::new(store.clone()),
            &table,
            Arc::new(detector),
            RetryPolicy::default(),
        )
        .unwrap()
    }

    fn patches(store: &MemoryStore) -> usize {
        store.count(|op| matches!(op, Operation::Patch(..)))
    }

    #[test]
    fn test_missing_builder_is_an_error() {
        let store = MemoryStore::new();
        let res = ResourceManager::new(
            ResourceKind::Service,
            Arc::new(store),
            &OverrideTable::new(),
            Arc::new(DriftDetector::default()),
            RetryPolicy::default(),
        );
        assert!(matches!(res, Err(Error::MissingBuilder(_))));
    }

    #[tokio::test]
    async fn test_reconcile_creates_with_identity() {
        let store = MemoryStore::new();
        let m = manager(&store);
        let n = node();
        assert!(!m.exists(&n).await.unwrap());
        assert_eq!(m.reconcile(&n, false).await.unwrap(), ReconcileOutcome::Created);
        let obj = store.peek(ResourceKind::Deployment, "org1", "peer0").unwrap();
        assert_eq!(obj.metadata.labels.unwrap()["app"], "peer0");
        assert_eq!(obj.metadata.owner_references.unwrap()[0].uid, "uid-1");
        assert_eq!(obj.data["spec"]["template"]["spec"]["containers"][0]["image"], "ledger/peer:2.5.4");
        assert!(m.exists(&n).await.unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let store = MemoryStore::new();
        let m = manager(&store);
        let n = node();
        m.reconcile(&n, false).await.unwrap();
        assert_eq!(m.reconcile(&n, false).await.unwrap(), ReconcileOutcome::Unchanged);
        assert_eq!(m.reconcile(&n, true).await.unwrap(), ReconcileOutcome::Unchanged);
        assert_eq!(store.count(|op| matches!(op, Operation::Create(..))), 1);
        assert_eq!(patches(&store), 0);
    }

    #[tokio::test]
    async fn test_custom_name_suffix() {
        let store = MemoryStore::new();
        let mut m = manager(&store);
        m.set_custom_name("statedb");
        m.reconcile(&node(), false).await.unwrap();
        assert!(store.peek(ResourceKind::Deployment, "org1", "peer0-statedb").is_some());
    }

    #[tokio::test]
    async fn test_update_applies_new_spec() {
        let store = MemoryStore::new();
        let m = manager(&store);
        let mut n = node();
        m.reconcile(&n, false).await.unwrap();
        n.spec.image = "ledger/peer:2.5.5".to_string();
        assert_eq!(m.reconcile(&n, false).await.unwrap(), ReconcileOutcome::Unchanged);
        assert_eq!(m.reconcile(&n, true).await.unwrap(), ReconcileOutcome::Updated);
        let obj = store.peek(ResourceKind::Deployment, "org1", "peer0").unwrap();
        assert_eq!(obj.data["spec"]["template"]["spec"]["containers"][0]["image"], "ledger/peer:2.5.5");
    }

    #[tokio::test]
    async fn test_update_retries_on_conflict() {
        let store = MemoryStore::new();
        let m = manager(&store);
        let mut n = node();
        m.reconcile(&n, false).await.unwrap();
        n.spec.replicas = Some(2);
        store.inject_conflicts(ResourceKind::Deployment, "org1", "peer0", 2);
        assert_eq!(m.reconcile(&n, true).await.unwrap(), ReconcileOutcome::Updated);
        let obj = store.peek(ResourceKind::Deployment, "org1", "peer0").unwrap();
        assert_eq!(obj.data["spec"]["replicas"], 2);
    }

    #[tokio::test]
    async fn test_update_gives_up_after_retries() {
        let store = MemoryStore::new();
        let m = manager(&store);
        let mut n = node();
        m.reconcile(&n, false).await.unwrap();
        n.spec.replicas = Some(2);
        store.inject_conflicts(ResourceKind::Deployment, "org1", "peer0", 3);
        let err = m.reconcile(&n, true).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_rebuilds_on_fresh_copy_after_conflict() {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let builder: OverrideFn = {
            let calls = calls.clone();
            let seen = seen.clone();
            Arc::new(move |node: &LedgerNode, obj: &mut DynamicObject, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push(obj.metadata.resource_version.clone());
                obj.data["spec"] = json!({"replicas": node.spec.replicas.unwrap_or(1)});
                Ok(())
            })
        };
        let m = ResourceManager::new(
            ResourceKind::Deployment,
            Arc::new(store.clone()),
            &OverrideTable::new().with(ResourceKind::Deployment, builder),
            Arc::new(DriftDetector::default()),
            RetryPolicy::default(),
        )
        .unwrap();
        let mut n = node();
        m.reconcile(&n, false).await.unwrap();
        n.spec.replicas = Some(3);
        store.inject_conflicts(ResourceKind::Deployment, "org1", "peer0", 1);
        m.reconcile(&n, true).await.unwrap();
        // one create, two update attempts
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], None);
        assert!(seen[1].is_some());
        assert_eq!(seen[1], seen[2]);
    }

    #[tokio::test]
    async fn test_get_and_check_on_missing_are_not_found() {
        let store = MemoryStore::new();
        let m = manager(&store);
        assert!(m.get(&node()).await.unwrap_err().is_not_found());
        assert!(m.check_state(&node()).await.unwrap_err().is_not_found());
        assert!(m.restore_state(&node()).await.unwrap_err().is_not_found());
        assert!(m.delete(&node()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_check_state_ignores_platform_defaults() {
        let store = MemoryStore::new();
        let m = manager(&store);
        let n = node();
        m.reconcile(&n, false).await.unwrap();
        store.mutate(ResourceKind::Deployment, "org1", "peer0", |o| {
            o.data["spec"]["template"]["spec"]["schedulerName"] = json!("default-scheduler");
            o.data["spec"]["template"]["spec"]["containers"][0]["terminationMessagePath"] =
                json!("/dev/termination-log");
            o.data["status"] = json!({"readyReplicas": 1});
        });
        m.check_state(&n).await.unwrap();
        let report = m.drift_report(&n).await.unwrap();
        assert_eq!(report.entries.len(), 2);
        assert!(report.entries.iter().all(|e| e.ignored));
    }

    #[tokio::test]
    async fn test_check_state_names_drifted_image() {
        let store = MemoryStore::new();
        let m = manager(&store);
        let n = node();
        m.reconcile(&n, false).await.unwrap();
        store.mutate(ResourceKind::Deployment, "org1", "peer0", |o| {
            o.data["spec"]["template"]["spec"]["containers"][0]["image"] = json!("evil/peer:1.0");
        });
        match m.check_state(&n).await {
            Err(Error::DriftDetected { instance, kind, paths }) => {
                assert_eq!(instance, "org1/peer0");
                assert_eq!(kind, "Deployment");
                assert_eq!(paths, vec!["spec.template.spec.containers[0].image"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restore_only_writes_violations() {
        let store = MemoryStore::new();
        let m = manager(&store);
        let n = node();
        m.reconcile(&n, false).await.unwrap();
        store.mutate(ResourceKind::Deployment, "org1", "peer0", |o| {
            o.data["spec"]["template"]["spec"]["containers"][0]["image"] = json!("evil/peer:1.0");
            o.data["spec"]["template"]["spec"]["dnsPolicy"] = json!("ClusterFirst");
        });
        let restored = m.restore_state(&n).await.unwrap();
        assert_eq!(restored, vec!["spec.template.spec.containers[0].image"]);
        let obj = store.peek(ResourceKind::Deployment, "org1", "peer0").unwrap();
        assert_eq!(obj.data["spec"]["template"]["spec"]["containers"][0]["image"], "ledger/peer:2.5.4");
        assert_eq!(obj.data["spec"]["template"]["spec"]["dnsPolicy"], "ClusterFirst");
        m.check_state(&n).await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_on_clean_object_writes_nothing() {
        let store = MemoryStore::new();
        let m = manager(&store);
        let n = node();
        m.reconcile(&n, false).await.unwrap();
        assert!(m.restore_state(&n).await.unwrap().is_empty());
        assert_eq!(patches(&store), 0);
    }

    #[tokio::test]
    async fn test_restore_uses_its_own_retry_budget() {
        let store = MemoryStore::new();
        let m = manager(&store);
        let n = node();
        m.reconcile(&n, false).await.unwrap();
        store.mutate(ResourceKind::Deployment, "org1", "peer0", |o| {
            o.data["spec"]["replicas"] = json!(5);
        });
        store.inject_conflicts(ResourceKind::Deployment, "org1", "peer0", 2);
        assert!(m.restore_state(&n).await.unwrap_err().is_conflict());
        store.inject_conflicts(ResourceKind::Deployment, "org1", "peer0", 1);
        assert_eq!(m.restore_state(&n).await.unwrap(), vec!["spec.replicas"]);
    }

    #[tokio::test]
    async fn test_builder_errors_are_wrapped() {
        let store = MemoryStore::new();
        let builder: OverrideFn = Arc::new(|_: &LedgerNode, _: &mut DynamicObject, _| {
            Err(Error::Other("no image".to_string()))
        });
        let m = ResourceManager::new(
            ResourceKind::ConfigMap,
            Arc::new(store),
            &OverrideTable::new().with(ResourceKind::ConfigMap, builder),
            Arc::new(DriftDetector::default()),
            RetryPolicy::default(),
        )
        .unwrap();
        match m.reconcile(&node(), false).await {
            Err(Error::Builder { kind, message }) => {
                assert_eq!(kind, "ConfigMap");
                assert!(message.contains("no image"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    struct CountingHook {
        pre: AtomicUsize,
        post: AtomicUsize,
    }

    #[async_trait]
    impl ReconcileHook for CountingHook {
        async fn pre_reconcile(&self, _node: &LedgerNode) -> Result<()> {
            self.pre.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn post_reconcile(&self, _node: &LedgerNode, _update: bool) -> Result<()> {
            self.post.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_resource_set_runs_hooks_and_conditions() {
        let store = MemoryStore::new();
        let hook = Arc::new(CountingHook {
            pre: AtomicUsize::new(0),
            post: AtomicUsize::new(0),
        });
        let mut statedb = manager(&store).when(|n| n.uses_couchdb());
        statedb.set_custom_name("statedb");
        let set = ResourceSet::new(vec![manager(&store), statedb]).with_hook(hook.clone());
        set.reconcile(&node(), false).await.unwrap();
        assert_eq!(hook.pre.load(Ordering::SeqCst), 1);
        assert_eq!(hook.post.load(Ordering::SeqCst), 1);
        assert!(store.peek(ResourceKind::Deployment, "org1", "peer0").is_some());
        assert!(store.peek(ResourceKind::Deployment, "org1", "peer0-statedb").is_none());
    }

    #[tokio::test]
    async fn test_resource_set_restores_drift() {
        let store = MemoryStore::new();
        let set = ResourceSet::new(vec![manager(&store)]);
        let n = node();
        assert!(set.check_and_restore(&n).await.unwrap().is_empty());
        set.reconcile(&n, false).await.unwrap();
        store.mutate(ResourceKind::Deployment, "org1", "peer0", |o| {
            o.data["spec"]["replicas"] = json!(0);
        });
        let restored = set.check_and_restore(&n).await.unwrap();
        assert_eq!(restored, vec![(ResourceKind::Deployment, vec!["spec.replicas".to_string()])]);
        assert!(set.check_and_restore(&n).await.unwrap().is_empty());
    }
}
