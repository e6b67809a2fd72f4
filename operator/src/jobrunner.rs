use crate::overrides::{DATA_PATH, pvc_name};
use async_trait::async_trait;
use common::{
    LedgerNode, ResourceKind, Result, Semver,
    context::get_owner,
    migration::{ContainerState, JobRunner, MIGRATION_CONTAINER, migration_labels},
    store::ObjectStore,
};
use kube::{ResourceExt, api::DynamicObject};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

/// Job names only accept lowercase alphanumerics and dashes
fn job_name(node: &LedgerNode, target: &Semver) -> String {
    let target: String = target
        .to_string()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{}-migrate-{}", node.name_any(), target)
}

fn container_state_of(pod: &DynamicObject, container: &str) -> ContainerState {
    let Some(statuses) = pod
        .data
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
    else {
        return ContainerState::Unknown;
    };
    let Some(status) = statuses.iter().find(|s| s["name"] == container) else {
        return ContainerState::Unknown;
    };
    let state = &status["state"];
    if let Some(code) = state.pointer("/terminated/exitCode").and_then(Value::as_i64) {
        ContainerState::Terminated {
            exit_code: i32::try_from(code).unwrap_or(i32::MAX),
        }
    } else if state.get("running").is_some() || state.get("waiting").is_some() {
        ContainerState::Running
    } else {
        ContainerState::Unknown
    }
}

/// Run migrations as kubernetes jobs
pub struct KubeJobRunner {
    store: Arc<dyn ObjectStore>,
    image: String,
}

impl KubeJobRunner {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, image: &str) -> KubeJobRunner {
        KubeJobRunner {
            store,
            image: image.to_string(),
        }
    }

    fn job(&self, node: &LedgerNode, target: &Semver) -> Result<DynamicObject> {
        let labels = migration_labels(node);
        let mut container = json!({
            "name": MIGRATION_CONTAINER,
            "image": self.image,
            "imagePullPolicy": "IfNotPresent",
            "env": [
                {"name": "COMPONENT", "value": node.spec.component.as_str()},
                {"name": "FROM_VERSION", "value": node.current_version().unwrap_or_default()},
                {"name": "TO_VERSION", "value": target.to_string()},
                {"name": "DATA_PATH", "value": DATA_PATH},
            ],
        });
        let mut volumes = Vec::new();
        if node.spec.storage.is_some() {
            container["volumeMounts"] = json!([{"name": "data", "mountPath": DATA_PATH}]);
            volumes.push(json!({"name": "data", "persistentVolumeClaim": {"claimName": pvc_name(node)}}));
        }
        let mut job = ResourceKind::Job.template();
        job.metadata.name = Some(job_name(node, target));
        job.metadata.namespace = node.namespace();
        job.metadata.labels = Some(labels.clone());
        job.metadata.owner_references = Some(vec![get_owner(node)?]);
        job.data = json!({
            "spec": {
                "backoffLimit": 0,
                "template": {
                    "metadata": {"labels": labels},
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [container],
                        "volumes": volumes,
                    }
                }
            }
        });
        Ok(job)
    }
}

#[async_trait]
impl JobRunner for KubeJobRunner {
    async fn create_job(&self, node: &LedgerNode, target: &Semver) -> Result<String> {
        let job = self.job(node, target)?;
        let name = job.name_any();
        self.store
            .create(ResourceKind::Job, &node.namespace().unwrap_or_default(), &job)
            .await?;
        Ok(name)
    }

    async fn container_state(&self, namespace: &str, job: &str, container: &str) -> Result<ContainerState> {
        let pods = self
            .store
            .list(ResourceKind::Pod, namespace, &format!("job-name={job}"))
            .await?;
        let states: Vec<ContainerState> = pods.iter().map(|p| container_state_of(p, container)).collect();
        debug!("Container {container} of job {namespace}/{job}: {states:?}");
        if let Some(terminated) = states
            .iter()
            .find(|s| matches!(s, ContainerState::Terminated { .. }))
        {
            return Ok(terminated.clone());
        }
        if states.contains(&ContainerState::Running) {
            return Ok(ContainerState::Running);
        }
        Ok(ContainerState::Unknown)
    }
}
