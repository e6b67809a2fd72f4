use crate::{
    LedgerNode, ResourceKind, Result, Semver,
    context::{LABEL_DOMAIN, get_labels},
    instance::ComponentKind,
    store::ObjectStore,
};
use async_trait::async_trait;
use kube::{ResourceExt, api::DynamicObject};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, error, info, warn};

pub const MIGRATION_CONTAINER: &str = "migration";

/// What a job runner can tell about one container of a job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Terminated { exit_code: i32 },
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationState {
    NotFound,
    Running,
    Completed,
    Failed,
    Unknown,
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Create the migration job of `node` towards `target`, returns its name
    async fn create_job(&self, node: &LedgerNode, target: &Semver) -> Result<String>;

    /// State of `container` in the pod of `job`
    async fn container_state(&self, namespace: &str, job: &str, container: &str) -> Result<ContainerState>;
}

/// Labels carried by the migration jobs of an instance
pub fn migration_labels(node: &LedgerNode) -> BTreeMap<String, String> {
    let mut labels = get_labels(node);
    labels.insert(format!("{LABEL_DOMAIN}/job"), "migration".to_string());
    labels
}

pub fn migration_selector(node: &LedgerNode) -> String {
    format!(
        "app.kubernetes.io/instance={},{LABEL_DOMAIN}/job=migration",
        node.name_any()
    )
}

fn job_failed(job: &DynamicObject) -> bool {
    job.data
        .pointer("/status/conditions")
        .and_then(|c| c.as_array())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c["type"] == "Failed" && c["status"] == "True")
        })
        .unwrap_or(false)
}

/// Run one-shot data migrations when an instance crosses a version boundary
pub struct MigrationOrchestrator {
    store: Arc<dyn ObjectStore>,
    runner: Arc<dyn JobRunner>,
    boundaries: HashMap<ComponentKind, Vec<Semver>>,
}

impl MigrationOrchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        runner: Arc<dyn JobRunner>,
        boundaries: HashMap<ComponentKind, Vec<Semver>>,
    ) -> MigrationOrchestrator {
        MigrationOrchestrator {
            store,
            runner,
            boundaries,
        }
    }

    /// Highest boundary crossed between the reconciled and the requested
    /// version, if any
    pub fn needs_migration(&self, node: &LedgerNode) -> Option<Semver> {
        let from = node.current_version()?;
        let to = &node.spec.version;
        self.boundaries
            .get(&node.spec.component)?
            .iter()
            .filter(|b| Semver::crosses(&from, to, b))
            .max()
            .cloned()
    }

    pub async fn job_state(&self, job: &DynamicObject) -> Result<MigrationState> {
        if job_failed(job) {
            return Ok(MigrationState::Failed);
        }
        let ns = job.namespace().unwrap_or_default();
        Ok(
            match self
                .runner
                .container_state(&ns, &job.name_any(), MIGRATION_CONTAINER)
                .await?
            {
                ContainerState::Running => MigrationState::Running,
                ContainerState::Terminated { exit_code: 0 } => MigrationState::Completed,
                ContainerState::Terminated { .. } => MigrationState::Failed,
                ContainerState::Unknown => MigrationState::Unknown,
            },
        )
    }

    async fn delete_matching(&self, kind: ResourceKind, namespace: &str, selector: &str) -> Result<()> {
        for obj in self.store.list(kind, namespace, selector).await? {
            match self.store.delete(kind, namespace, &obj.name_any()).await {
                Ok(()) => debug!("Deleted {kind} {namespace}/{}", obj.name_any()),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn cleanup(&self, node: &LedgerNode, job: &DynamicObject) -> Result<()> {
        let ns = job.namespace().unwrap_or_default();
        let name = job.name_any();
        match self.store.delete(ResourceKind::Job, &ns, &name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.delete_matching(ResourceKind::Pod, &ns, &format!("job-name={name}"))
            .await?;
        if node.uses_couchdb() {
            self.delete_matching(ResourceKind::Pod, &ns, &format!("app={}-statedb", node.name_any()))
                .await?;
        }
        Ok(())
    }

    /// Drive the migration jobs matching `selector`.
    /// Returns whether a migration is still running.
    pub async fn handle_migration_jobs(&self, selector: &str, node: &LedgerNode, target: &Semver) -> Result<bool> {
        let ns = node.namespace().unwrap_or_default();
        let jobs = self.store.list(ResourceKind::Job, &ns, selector).await?;
        if jobs.is_empty() {
            let job = self.runner.create_job(node, target).await?;
            info!("Started migration job {ns}/{job} of {} to {target}", node.key());
            return Ok(true);
        }
        let mut running = false;
        for job in &jobs {
            let name = job.name_any();
            match self.job_state(job).await? {
                MigrationState::Completed => {
                    info!("Migration job {ns}/{name} completed, cleaning up");
                    self.cleanup(node, job).await?;
                }
                MigrationState::Failed => {
                    error!("Migration job {ns}/{name} failed, leaving it for inspection");
                    running = true;
                }
                MigrationState::Running | MigrationState::NotFound => {
                    debug!("Migration job {ns}/{name} still running");
                    running = true;
                }
                MigrationState::Unknown => {
                    warn!("Migration job {ns}/{name} is in an unknown state");
                    running = true;
                }
            }
        }
        Ok(running)
    }
}
