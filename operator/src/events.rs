use crate::{Error, Result};
use async_trait::async_trait;
use common::{LedgerNode, context::get_reporter};
use kube::{
    Client, Resource,
    runtime::events::{Event, EventType, Recorder},
};

#[must_use]
pub fn from_drift_restored(name: &str, kind: &str, paths: &[String]) -> Event {
    Event {
        type_: EventType::Warning,
        reason: "DriftRestored".to_string(),
        note: Some(format!(
            "Restored {kind} of `{name}` on {}",
            paths.join(", ")
        )),
        action: format!("Restoring {kind}"),
        secondary: None,
    }
}

#[must_use]
pub fn from_restart(name: &str, reasons: &str) -> Event {
    Event {
        type_: EventType::Normal,
        reason: "Restarted".to_string(),
        note: Some(format!("Restarting `{name}` for {reasons}")),
        action: "Restarting".to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn from_migration_started(name: &str, target: &str) -> Event {
    Event {
        type_: EventType::Normal,
        reason: "MigrationRunning".to_string(),
        note: Some(format!("Migrating `{name}` to {target}")),
        action: "Migrating".to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn from_migration_completed(name: &str, target: &str) -> Event {
    Event {
        type_: EventType::Normal,
        reason: "Migrated".to_string(),
        note: Some(format!("`{name}` migrated to {target}")),
        action: "Migrating".to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn from_renewal(name: &str, cert_type: &str, fire_at: &str) -> Event {
    Event {
        type_: EventType::Normal,
        reason: "RenewalScheduled".to_string(),
        note: Some(format!("Renewal of the {cert_type} certificate of `{name}` scheduled at {fire_at}")),
        action: "Scheduling renewal".to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn from_precheck_failed(name: &str, message: &str) -> Event {
    Event {
        type_: EventType::Warning,
        reason: "PrecheckFailed".to_string(),
        note: Some(format!("`{name}` cannot be reconciled: {message}")),
        action: "Checking prerequisites".to_string(),
        secondary: None,
    }
}

/// Where the reconcile pass reports what it did to an instance
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, node: &LedgerNode, ev: Event) -> Result<()>;
}

/// Publish kubernetes events attached to the instance
pub struct KubeEventSink {
    client: Client,
}

impl KubeEventSink {
    #[must_use]
    pub fn new(client: Client) -> KubeEventSink {
        KubeEventSink { client }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, node: &LedgerNode, ev: Event) -> Result<()> {
        let recorder = Recorder::new(self.client.clone(), get_reporter(), node.object_ref(&()));
        match recorder.publish(ev).await {
            Ok(_) => Ok(()),
            Err(e) => match e {
                kube::Error::Api(src) => {
                    if !src.message.as_str().contains("being terminated") {
                        tracing::warn!("Ignoring {:?} while sending an event", src);
                    }
                    Ok(())
                }
                _ => Err(Error::KubeError(e)),
            },
        }
    }
}
