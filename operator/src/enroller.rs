use async_trait::async_trait;
use common::{
    Error, ResourceKind, Result,
    certificate::{Enroller, RenewalRequest},
    context::{LABEL_DOMAIN, get_labels, get_owner},
    store::ObjectStore,
};
use kube::{ResourceExt, api::DynamicObject};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

pub const ENROLLER_CONTAINER: &str = "enroller";

/// Renew certificates with a one-shot re-enroll job
pub struct JobEnroller {
    store: Arc<dyn ObjectStore>,
    image: String,
}

impl JobEnroller {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, image: &str) -> JobEnroller {
        JobEnroller {
            store,
            image: image.to_string(),
        }
    }

    pub fn job_name(request: &RenewalRequest) -> String {
        format!("{}-reenroll-{}", request.instance.name_any(), request.cert_type)
    }

    fn job(&self, request: &RenewalRequest) -> Result<DynamicObject> {
        let node = &request.instance;
        let Some(enrollment) = &request.enrollment else {
            return Err(Error::Enrollment(format!("{} has no enrollment spec", node.key())));
        };
        let mut labels = get_labels(node);
        labels.insert(format!("{LABEL_DOMAIN}/job"), "reenroll".to_string());
        let mut env = vec![
            json!({"name": "CA_HOST", "value": enrollment.ca_host}),
            json!({"name": "CA_PORT", "value": enrollment.ca_port.to_string()}),
            json!({"name": "CA_NAME", "value": enrollment.ca_name}),
            json!({"name": "ENROLL_ID", "value": enrollment.enroll_id}),
            json!({"name": "ENROLL_SECRET", "valueFrom": {"secretKeyRef": {
                "name": enrollment.enroll_secret_ref,
                "key": "secret",
            }}}),
            json!({"name": "CERT_TYPE", "value": request.cert_type.as_str()}),
            json!({"name": "STORAGE_PATH", "value": request.storage_path}),
            json!({"name": "TARGET_SECRET", "value": request.cert_type.signcert_secret(&node.name_any())}),
        ];
        if let Some(hsm) = &node.spec.hsm {
            env.push(json!({"name": "HSM_ENDPOINT", "value": hsm.endpoint}));
        }
        let mut job = ResourceKind::Job.template();
        job.metadata.name = Some(Self::job_name(request));
        job.metadata.namespace = node.namespace();
        job.metadata.labels = Some(labels.clone());
        job.metadata.owner_references = Some(vec![get_owner(node)?]);
        job.data = json!({
            "spec": {
                "backoffLimit": 0,
                "ttlSecondsAfterFinished": 3600,
                "template": {
                    "metadata": {"labels": labels},
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": ENROLLER_CONTAINER,
                            "image": self.image,
                            "imagePullPolicy": "IfNotPresent",
                            "env": env,
                            "volumeMounts": [{"name": "crypto", "mountPath": request.storage_path}],
                        }],
                        "volumes": [{"name": "crypto", "emptyDir": {}}],
                    }
                }
            }
        });
        Ok(job)
    }
}

#[async_trait]
impl Enroller for JobEnroller {
    async fn renew(&self, request: RenewalRequest) -> Result<()> {
        let job = self.job(&request)?;
        let ns = request.instance.namespace().unwrap_or_default();
        let name = job.name_any();
        match self.store.delete(ResourceKind::Job, &ns, &name).await {
            Ok(()) => debug!("Deleted previous re-enroll job {ns}/{name}"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.store.create(ResourceKind::Job, &ns, &job).await?;
        info!("Started re-enroll job {ns}/{name}");
        Ok(())
    }
}
