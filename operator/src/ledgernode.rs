use crate::{
    Error, Metrics, Reconciler, Result,
    events::{self, EventSink},
    manager::Context,
    overrides, telemetry,
};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use common::{
    InstanceKey, LedgerNode, ResourceKind, Semver,
    certificate::{CertState, CertType, CertificateCoordinator, Enroller},
    config::OperatorConfig,
    instance::{
        ApplicationCondition, ConditionsStatus, ConditionsType, DIGEST_ADMIN_CERTS, DIGEST_CONFIG_OVERRIDE, DIGEST_NODE_OU,
        NodeStatusType, patch_status, update_status,
    },
    is_digest,
    migration::{JobRunner, MigrationOrchestrator, migration_selector},
    netcheck::check_reachable,
    resource::ResourceSet,
    restart::{RestartCoordinator, RestartReason, join_reasons},
    store::ObjectStore,
};
use kube::{
    ResourceExt,
    api::Api,
    runtime::{
        controller::Action,
        finalizer::{Event as Finalizer, finalizer},
    },
};
use opentelemetry::trace::TraceId;
use serde_json::{Map, Value, json};
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::Duration;
use tracing::{Span, debug, field, info, instrument, warn};

pub const FINALIZER: &str = "ledgernodes.ledgerops.dev";
pub const PRECHECK_REQUEUE: Duration = Duration::from_secs(60);
pub const MIGRATION_POLL: Duration = Duration::from_secs(30);

pub fn admin_certs_secret(node: &LedgerNode) -> String {
    format!("{}-admincerts", node.name_any())
}

fn set_condition(conditions: &mut Vec<ApplicationCondition>, condition: ApplicationCondition) {
    conditions.retain(|c| c.condition_type != condition.condition_type);
    conditions.push(condition);
}

/// Everything one reconcile pass of a `LedgerNode` works with
pub struct NodeLifecycle {
    pub store: Arc<dyn ObjectStore>,
    pub config: OperatorConfig,
    pub resources: ResourceSet,
    pub certificates: CertificateCoordinator,
    pub restarts: RestartCoordinator,
    pub migrations: MigrationOrchestrator,
    pub events: Arc<dyn EventSink>,
    pub metrics: Metrics,
}

impl NodeLifecycle {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: OperatorConfig,
        enroller: Arc<dyn Enroller>,
        runner: Arc<dyn JobRunner>,
        events: Arc<dyn EventSink>,
        metrics: Metrics,
    ) -> Result<NodeLifecycle> {
        Ok(NodeLifecycle {
            resources: overrides::resource_set(store.clone(), &config)?,
            certificates: CertificateCoordinator::new(store.clone(), enroller, config.warning_window()),
            restarts: RestartCoordinator::new(config.restart.disabled),
            migrations: MigrationOrchestrator::new(store.clone(), runner, config.migration_boundaries()?),
            store,
            config,
            events,
            metrics,
        })
    }

    async fn publish(&self, node: &LedgerNode, ev: kube::runtime::events::Event) {
        if let Err(e) = self.events.publish(node, ev).await {
            warn!("Failed to publish an event for {}: {e}", node.key());
        }
    }

    async fn fail_precheck(&self, node: &LedgerNode, reason: &str, message: &str) -> Result<()> {
        warn!("{} {reason}: {message}", node.key());
        let mut conditions = node.conditions_excluding(&[ConditionsType::Ready]);
        conditions.push(ApplicationCondition::ready_ko(message, node.generation()));
        update_status(
            self.store.as_ref(),
            node,
            json!({
                "type": NodeStatusType::Error,
                "reason": reason,
                "message": message,
                "conditions": conditions,
            }),
        )
        .await?;
        self.publish(node, events::from_precheck_failed(&node.name_any(), message))
            .await;
        Ok(())
    }

    /// Whether the pass may go on
    async fn prechecks(&self, node: &LedgerNode) -> Result<Option<Action>> {
        if let Some(hsm) = &node.spec.hsm {
            if let Err(e) = check_reachable(&hsm.endpoint, self.config.hsm_dial_timeout()).await {
                self.fail_precheck(node, "HsmUnreachable", &e.to_string()).await?;
                return Ok(Some(Action::requeue(PRECHECK_REQUEUE)));
            }
        }
        let version = &node.spec.version;
        if !is_digest(version) && Semver::opt_parse(version).is_none() {
            self.fail_precheck(node, "InvalidVersion", &format!("`{version}` is not a valid version"))
                .await?;
            return Ok(Some(Action::await_change()));
        }
        Ok(None)
    }

    /// Drive the migration if the requested version crosses a boundary.
    /// Returns the action to take while it is still running.
    async fn migrate(&self, node: &LedgerNode, conditions: &mut Vec<ApplicationCondition>) -> Result<Option<Action>> {
        let Some(target) = self.migrations.needs_migration(node) else {
            return Ok(None);
        };
        let target_str = target.to_string();
        let announced = node.conditions_excluding(&[]).iter().any(|c| {
            c.condition_type == ConditionsType::Migrated
                && c.status == ConditionsStatus::False
                && c.message.contains(&target_str)
        });
        if self
            .migrations
            .handle_migration_jobs(&migration_selector(node), node, &target)
            .await?
        {
            self.metrics.lifecycle.migration("running");
            if !announced {
                self.publish(node, events::from_migration_started(&node.name_any(), &target_str))
                    .await;
            }
            set_condition(conditions, ApplicationCondition::migration_running(&target_str, node.generation()));
            update_status(
                self.store.as_ref(),
                node,
                json!({
                    "type": NodeStatusType::Deploying,
                    "reason": "MigrationRunning",
                    "message": format!("Migrating to {target_str}"),
                    "conditions": conditions,
                }),
            )
            .await?;
            return Ok(Some(Action::requeue(MIGRATION_POLL)));
        }
        self.metrics.lifecycle.migration("completed");
        self.publish(node, events::from_migration_completed(&node.name_any(), &target_str))
            .await;
        set_condition(conditions, ApplicationCondition::migrated(&target_str, node.generation()));
        // the job is gone, record the migration before anything else can fail
        patch_status(
            self.store.as_ref(),
            &node.key(),
            json!({
                "version": node.spec.version,
                "conditions": conditions,
            }),
        )
        .await?;
        self.restarts.register(&node.key(), RestartReason::Migration);
        Ok(None)
    }

    /// Check expiry, keep the renewal timers armed and serve the
    /// re-enroll actions. Returns the certificate part of the status.
    async fn check_certificates(
        &self,
        node: &LedgerNode,
        conditions: &mut Vec<ApplicationCondition>,
        clear: &mut Map<String, Value>,
    ) -> Result<(NodeStatusType, String)> {
        let key = node.key();
        let check = self
            .certificates
            .check_certificates_for_expire(node, self.config.warning_window())
            .await?;
        set_condition(
            conditions,
            ApplicationCondition::certificates(check.state == CertState::Valid, &check.message, node.generation()),
        );
        if node.auto_renew(self.config.certificates.auto_renew) {
            for cert_type in CertType::ALL {
                if let Some(fire_at) = self.certificates.ensure_certificate_timer(node, cert_type).await? {
                    self.metrics.lifecycle.renewals.inc();
                    self.publish(
                        node,
                        events::from_renewal(
                            &node.name_any(),
                            cert_type.as_str(),
                            &fire_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                        ),
                    )
                    .await;
                }
            }
        } else {
            self.certificates.cancel_scheduled(&key);
        }
        if let Some(reenroll) = node.spec.action.as_ref().and_then(|a| a.reenroll.as_ref()) {
            for (cert_type, requested) in [(CertType::Ecert, reenroll.ecert), (CertType::Tls, reenroll.tls)] {
                if requested.unwrap_or(false) {
                    info!("Re-enroll of {cert_type} certificate of {key} requested");
                    self.certificates.renew_now(node, cert_type).await?;
                    self.metrics.lifecycle.renewals.inc();
                }
            }
            clear.insert("reenroll".to_string(), Value::Null);
        }
        Ok((check.status, check.message))
    }

    /// Compare the restart inputs with the digests of the last pass and
    /// register a reason for every change
    async fn digests(&self, node: &LedgerNode) -> Result<BTreeMap<String, String>> {
        let key = node.key();
        let mut digests = BTreeMap::from([
            (DIGEST_CONFIG_OVERRIDE.to_string(), node.config_override_digest()),
            (DIGEST_NODE_OU.to_string(), node.node_ou_digest()),
        ]);
        for cert_type in CertType::ALL {
            if let Some(digest) = self.certificates.cert_digest(node, cert_type).await? {
                digests.insert(cert_type.as_str().to_string(), digest);
            }
        }
        if let Some(secret) = self
            .store
            .get_opt(
                ResourceKind::Secret,
                &node.namespace().unwrap_or_default(),
                &admin_certs_secret(node),
            )
            .await?
        {
            let data = secret.data.get("data").cloned().unwrap_or(Value::Null);
            digests.insert(DIGEST_ADMIN_CERTS.to_string(), sha256::digest(data.to_string()));
        }
        for (name, digest) in &digests {
            let Some(previous) = node.status_digest(name) else {
                continue;
            };
            if &previous == digest {
                continue;
            }
            let reason = match name.as_str() {
                DIGEST_CONFIG_OVERRIDE => RestartReason::ConfigOverride,
                DIGEST_NODE_OU => RestartReason::NodeOu,
                DIGEST_ADMIN_CERTS => RestartReason::AdminCertUpdate,
                _ => RestartReason::CertUpdate,
            };
            debug!("{name} of {key} changed");
            self.restarts.register(&key, reason);
        }
        Ok(digests)
    }

    async fn clear_actions(&self, node: &LedgerNode, clear: Map<String, Value>) -> Result<()> {
        if clear.is_empty() {
            return Ok(());
        }
        let key = node.key();
        self.store
            .patch(
                ResourceKind::LedgerNode,
                &key.namespace,
                &key.name,
                &json!({"spec": {"action": clear}}),
            )
            .await?;
        debug!("Cleared consumed actions of {key}");
        Ok(())
    }

    /// One reconcile pass
    pub async fn apply(&self, node: &LedgerNode) -> Result<Action> {
        let key = node.key();
        let generation = node.generation();
        debug!("Reconciling LedgerNode {key}");

        // ── Pre-checks ────────────────────────────────────────────────────────
        if let Some(action) = self.prechecks(node).await? {
            return Ok(action);
        }

        // ── Resources ─────────────────────────────────────────────────────────
        let mut conditions = node.conditions_excluding(&[
            ConditionsType::Ready,
            ConditionsType::ResourcesReconciled,
            ConditionsType::CertificatesValid,
        ]);
        self.resources.reconcile(node, node.update_requested()).await?;
        conditions.push(ApplicationCondition::resources_ok(generation));

        // ── Drift ─────────────────────────────────────────────────────────────
        for (kind, paths) in self.resources.check_and_restore(node).await? {
            if paths.is_empty() {
                continue;
            }
            self.metrics.lifecycle.drift_restored(kind.as_str());
            self.publish(node, events::from_drift_restored(&node.name_any(), kind.as_str(), &paths))
                .await;
            set_condition(&mut conditions, ApplicationCondition::drift_restored(&paths, generation));
        }

        // ── Migration ─────────────────────────────────────────────────────────
        if let Some(action) = self.migrate(node, &mut conditions).await? {
            return Ok(action);
        }

        // ── Certificates ──────────────────────────────────────────────────────
        let mut clear = Map::new();
        let (status_type, message) = self.check_certificates(node, &mut conditions, &mut clear).await?;

        // ── Restart reasons ───────────────────────────────────────────────────
        let digests = self.digests(node).await?;
        if node.restart_requested() {
            self.restarts.register(&key, RestartReason::RestartAction);
            clear.insert("restart".to_string(), Value::Null);
        }
        self.clear_actions(node, clear).await?;
        if let Some(workload) = self.resources.manager(ResourceKind::Deployment) {
            if let Some(reasons) = self.restarts.trigger_if_needed(node, workload).await? {
                let joined = join_reasons(&reasons);
                self.metrics.lifecycle.restarts.inc();
                self.publish(node, events::from_restart(&node.name_any(), &joined))
                    .await;
                set_condition(&mut conditions, ApplicationCondition::restarted(&joined, generation));
            }
        }

        // ── Status ────────────────────────────────────────────────────────────
        let (reason, message) = if status_type == NodeStatusType::Deployed {
            conditions.push(ApplicationCondition::ready_ok(generation));
            ("Reconciled", "Node deployed".to_string())
        } else {
            conditions.push(ApplicationCondition::ready_ko(&message, generation));
            ("CertificateExpiring", message)
        };
        update_status(
            self.store.as_ref(),
            node,
            json!({
                "type": status_type,
                "reason": reason,
                "message": message,
                "version": node.spec.version,
                "observedGeneration": generation,
                "digests": digests,
                "conditions": conditions,
            }),
        )
        .await?;
        debug!("Reconciling LedgerNode {key} done");
        Ok(Action::requeue(self.config.requeue()))
    }

    /// Drop the in-memory state of a deleted instance. Children go away
    /// with their owner.
    pub fn cleanup(&self, key: &InstanceKey) -> Action {
        self.certificates.cancel_timers(key);
        self.restarts.forget(key);
        info!("Cleaned up LedgerNode {key}");
        Action::await_change()
    }
}

// ── Controller entry points ───────────────────────────────────────────────────

#[async_trait]
impl Reconciler for LedgerNode {
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        ctx.lifecycle.apply(self).await
    }

    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        ctx.diagnostics.write().await.last_event = Utc::now();
        Ok(ctx.lifecycle.cleanup(&self.key()))
    }
}

#[instrument(skip(ctx, node), fields(trace_id))]
pub async fn reconcile(node: Arc<LedgerNode>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.reconcile.count_and_measure(&trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = node.namespace().unwrap_or_default();
    let nodes: Api<LedgerNode> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&nodes, FINALIZER, node, |event| async {
        match event {
            Finalizer::Apply(node) => node.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(node) => node.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

#[must_use]
pub fn error_policy(node: Arc<LedgerNode>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        "reconcile failed for LedgerNode '{:?}.{:?}': {:?}",
        node.metadata.namespace, node.metadata.name, error
    );
    ctx.metrics.reconcile.reconcile_failure(&node, error);
    Action::requeue(Duration::from_secs(5 * 60))
}
