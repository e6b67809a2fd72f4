use crate::{
    Metrics, Result,
    enroller::JobEnroller,
    events::KubeEventSink,
    jobrunner::KubeJobRunner,
    ledgernode::{self, NodeLifecycle},
};
use chrono::{DateTime, Utc};
use common::{LedgerNode, config::OperatorConfig, context::get_reporter, store::KubeStore};
use futures::{FutureExt, StreamExt, future::BoxFuture};
use k8s_openapi::api::{apps::v1::Deployment, batch::v1::Job};
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{controller::Controller, events::Reporter, watcher::Config},
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Reconcile pass state and collaborators
    pub lifecycle: Arc<NodeLifecycle>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: get_reporter(),
        }
    }
}

/// Data owned by the Manager
#[derive(Clone, Default)]
pub struct Manager {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics shared with the reconciler
    metrics: Metrics,
}

/// Manager that owns a Controller for LedgerNode
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller` + a future to be awaited
    /// It is up to `main` to wait for the controller stream.
    pub async fn new(config: OperatorConfig) -> Result<(Self, BoxFuture<'static, ()>)> {
        let client = Client::try_default().await?;
        let manager = Manager::default();
        let store = Arc::new(KubeStore::new(client.clone()));
        let lifecycle = NodeLifecycle::new(
            store.clone(),
            config.clone(),
            Arc::new(JobEnroller::new(store.clone(), &config.enroller.image)),
            Arc::new(KubeJobRunner::new(store, &config.migration.image)),
            Arc::new(KubeEventSink::new(client.clone())),
            manager.metrics.clone(),
        )?;
        let context = Arc::new(Context {
            client: client.clone(),
            lifecycle: Arc::new(lifecycle),
            metrics: manager.metrics.clone(),
            diagnostics: manager.diagnostics.clone(),
        });

        let nodes = Api::<LedgerNode>::all(client.clone());
        // Ensure CRD is installed before loop-watching
        if let Err(e) = nodes.list(&ListParams::default().limit(1)).await {
            tracing::error!("is the crd installed? please run: cargo run --bin crdgen | kubectl apply -f -");
            return Err(e.into());
        }

        // All good. Start controller and return its future.
        let controller = Controller::new(nodes, Config::default().any_semantic())
            .owns(Api::<Deployment>::all(client.clone()), Config::default())
            .owns(Api::<Job>::all(client), Config::default())
            .shutdown_on_signal()
            .run(ledgernode::reconcile, ledgernode::error_policy, context)
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .boxed();

        Ok((manager, controller))
    }

    /// Metrics getter
    #[must_use]
    pub fn metrics(&self) -> String {
        self.metrics.encode()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}
