use crate::{
    Error, InstanceKey, LedgerNode, ResourceKind, Result,
    context::{get_labels, get_owner},
    instance::{EnrollmentSpec, NodeStatusType, from_dynamic, patch_status},
    store::ObjectStore,
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use kube::{ResourceExt, api::DynamicObject};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const CERT_KEY: &str = "cert.pem";
pub const BACKUP_KEY: &str = "backup.json";
pub const MAX_BACKUPS: usize = 10;
pub const RENEWAL_REASON: &str = "CertificateRenewal";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CertType {
    Ecert,
    Tls,
}

impl CertType {
    pub const ALL: [CertType; 2] = [CertType::Ecert, CertType::Tls];

    pub fn as_str(&self) -> &'static str {
        match self {
            CertType::Ecert => "ecert",
            CertType::Tls => "tls",
        }
    }

    pub fn signcert_secret(&self, instance: &str) -> String {
        format!("{}-{instance}-signcert", self.as_str())
    }

    pub fn backup_secret(&self, instance: &str) -> String {
        format!("{}-{instance}-crypto-backup", self.as_str())
    }
}

impl std::fmt::Display for CertType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from best to worst
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CertState {
    Valid,
    Warning,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateCheck {
    pub state: CertState,
    pub status: NodeStatusType,
    pub message: String,
}

/// What the enrollment collaborator needs to renew one certificate
#[derive(Clone, Debug)]
pub struct RenewalRequest {
    pub instance: LedgerNode,
    pub cert_type: CertType,
    pub enrollment: Option<EnrollmentSpec>,
    pub storage_path: String,
}

#[async_trait]
pub trait Enroller: Send + Sync {
    async fn renew(&self, request: RenewalRequest) -> Result<()>;
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// `notAfter` of the first certificate of a PEM bundle
pub fn parse_not_after(pem: &[u8]) -> Result<DateTime<Utc>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem)
        .map_err(|e| Error::Certificate(format!("invalid PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::Certificate(format!("invalid X.509 certificate: {e}")))?;
    let ts = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(ts, 0).ok_or_else(|| Error::Certificate(format!("notAfter {ts} out of range")))
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct BackupEntry {
    timestamp: DateTime<Utc>,
    data: BTreeMap<String, String>,
}

/// Where a renewal timer stands. Fired timers stay in the map so the
/// same certificate is never renewed twice on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerState {
    Scheduled,
    Renewing,
    Renewed,
    Failed,
}

struct RenewalTimer {
    id: u64,
    fire_at: DateTime<Utc>,
    /// `notAfter` of the certificate the timer was armed for
    not_after: Option<DateTime<Utc>>,
    /// Armed by a re-enroll request rather than by expiry
    manual: bool,
    state: TimerState,
    handle: JoinHandle<()>,
}

impl RenewalTimer {
    fn live(&self) -> bool {
        matches!(self.state, TimerState::Scheduled | TimerState::Renewing)
    }
}

type TimerMap = Arc<Mutex<HashMap<(InstanceKey, CertType), RenewalTimer>>>;

/// Watch certificate expiry and renew certificates before they expire.
///
/// Timers are tokio tasks owned by the coordinator. A fired timer only
/// talks to the object store and the enroller.
pub struct CertificateCoordinator {
    store: Arc<dyn ObjectStore>,
    enroller: Arc<dyn Enroller>,
    window: Duration,
    clock: Clock,
    timers: TimerMap,
    next_id: AtomicU64,
}

impl CertificateCoordinator {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, enroller: Arc<dyn Enroller>, window: Duration) -> Self {
        Self::with_clock(store, enroller, window, Arc::new(Utc::now))
    }

    #[must_use]
    pub fn with_clock(
        store: Arc<dyn ObjectStore>,
        enroller: Arc<dyn Enroller>,
        window: Duration,
        clock: Clock,
    ) -> Self {
        CertificateCoordinator {
            store,
            enroller,
            window,
            clock,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, HashMap<(InstanceKey, CertType), RenewalTimer>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn signcert(&self, node: &LedgerNode, cert_type: CertType) -> Result<Option<Vec<u8>>> {
        let ns = node.namespace().unwrap_or_default();
        let name = cert_type.signcert_secret(&node.name_any());
        let Some(secret) = self.store.get_opt(ResourceKind::Secret, &ns, &name).await? else {
            return Ok(None);
        };
        match secret.data.get("data").and_then(|d| d.get(CERT_KEY)) {
            Some(Value::String(b64)) => Ok(Some(STANDARD.decode(b64)?)),
            _ => Err(Error::Certificate(format!("secret {ns}/{name} has no {CERT_KEY}"))),
        }
    }

    /// `notAfter` of the live sign certificate, `None` until it is enrolled
    pub async fn expiry(&self, node: &LedgerNode, cert_type: CertType) -> Result<Option<DateTime<Utc>>> {
        match self.signcert(node, cert_type).await? {
            Some(pem) => Ok(Some(parse_not_after(&pem)?)),
            None => Ok(None),
        }
    }

    /// Digest of the live sign certificate, changes when it is renewed
    pub async fn cert_digest(&self, node: &LedgerNode, cert_type: CertType) -> Result<Option<String>> {
        Ok(self.signcert(node, cert_type).await?.map(sha256::digest))
    }

    pub fn state_of(&self, not_after: DateTime<Utc>) -> CertState {
        self.state_within(not_after, self.window)
    }

    fn state_within(&self, not_after: DateTime<Utc>, window: Duration) -> CertState {
        let now = (self.clock)();
        if not_after <= now {
            CertState::Expired
        } else if not_after <= now + window {
            CertState::Warning
        } else {
            CertState::Valid
        }
    }

    /// Worst state of both sign certificates against `window`, with a
    /// message naming the affected ones
    pub async fn check_certificates_for_expire(
        &self,
        node: &LedgerNode,
        window: Duration,
    ) -> Result<CertificateCheck> {
        let mut worst = CertState::Valid;
        let mut messages = Vec::new();
        for cert_type in CertType::ALL {
            let Some(not_after) = self.expiry(node, cert_type).await? else {
                debug!("No {cert_type} certificate yet for {}", node.key());
                continue;
            };
            let state = self.state_within(not_after, window);
            match state {
                CertState::Valid => {}
                CertState::Warning => messages.push(format!(
                    "{cert_type} certificate expires on {}",
                    not_after.format("%Y-%m-%d %H:%M:%S UTC")
                )),
                CertState::Expired => messages.push(format!(
                    "{cert_type} certificate expired on {}",
                    not_after.format("%Y-%m-%d %H:%M:%S UTC")
                )),
            }
            worst = worst.max(state);
        }
        Ok(CertificateCheck {
            state: worst,
            status: match worst {
                CertState::Valid => NodeStatusType::Deployed,
                _ => NodeStatusType::Warning,
            },
            message: if messages.is_empty() {
                "Certificates are valid".to_string()
            } else {
                messages.join(", ")
            },
        })
    }

    /// Pending fire time of the timer of that key
    pub fn timer_fire_at(&self, key: &InstanceKey, cert_type: CertType) -> Option<DateTime<Utc>> {
        self.timers()
            .get(&(key.clone(), cert_type))
            .filter(|t| t.live())
            .map(|t| t.fire_at)
    }

    pub fn timer_state(&self, key: &InstanceKey, cert_type: CertType) -> Option<TimerState> {
        self.timers().get(&(key.clone(), cert_type)).map(|t| t.state)
    }

    /// Timers not fired yet or still renewing
    pub fn timer_count(&self) -> usize {
        self.timers().values().filter(|t| t.live()).count()
    }

    /// Drop every timer of a deleted instance
    pub fn cancel_timers(&self, key: &InstanceKey) {
        self.timers().retain(|(k, _), timer| {
            if k == key {
                timer.handle.abort();
                false
            } else {
                true
            }
        });
    }

    /// Drop the expiry timers of an instance that are still waiting.
    /// Renewals under way and re-enroll requests are left alone.
    pub fn cancel_scheduled(&self, key: &InstanceKey) {
        self.timers().retain(|(k, _), timer| {
            if k == key && timer.state == TimerState::Scheduled && !timer.manual {
                timer.handle.abort();
                false
            } else {
                true
            }
        });
    }

    /// Arm the renewal timer of that certificate unless one was already
    /// armed for the same `notAfter`, fired or not. A failed renewal is
    /// thus only tried again once the certificate changes.
    /// Returns the fire time when a timer was armed.
    pub async fn ensure_certificate_timer(
        &self,
        node: &LedgerNode,
        cert_type: CertType,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(not_after) = self.expiry(node, cert_type).await? else {
            return Ok(None);
        };
        if let Some(timer) = self.timers().get(&(node.key(), cert_type)) {
            if timer.not_after == Some(not_after) || timer.state == TimerState::Renewing {
                return Ok(None);
            }
        }
        let fire_at = not_after - self.window;
        self.arm(node.key(), cert_type, fire_at, Some(not_after), false);
        Ok(Some(fire_at))
    }

    /// Arm the renewal timer of that certificate at `notAfter - window`.
    /// Returns the fire time, `None` when there is no certificate yet.
    pub async fn set_certificate_timer(
        &self,
        node: &LedgerNode,
        cert_type: CertType,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(not_after) = self.expiry(node, cert_type).await? else {
            return Ok(None);
        };
        let fire_at = not_after - self.window;
        self.arm(node.key(), cert_type, fire_at, Some(not_after), false);
        Ok(Some(fire_at))
    }

    /// Renew that certificate right away
    pub async fn renew_now(&self, node: &LedgerNode, cert_type: CertType) -> Result<()> {
        let not_after = self.expiry(node, cert_type).await?;
        self.arm(node.key(), cert_type, (self.clock)(), not_after, true);
        Ok(())
    }

    fn arm(
        &self,
        key: InstanceKey,
        cert_type: CertType,
        fire_at: DateTime<Utc>,
        not_after: Option<DateTime<Utc>>,
        manual: bool,
    ) {
        let delay = (fire_at - (self.clock)()).to_std().unwrap_or(std::time::Duration::ZERO);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let store = self.store.clone();
        let enroller = self.enroller.clone();
        let timers = self.timers.clone();
        let clock = self.clock.clone();
        let task_key = key.clone();
        info!("Renewal of {cert_type} certificate of {key} scheduled at {fire_at}");
        // held until the entry is in place so a task firing at once finds it
        let mut guard = self.timers();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            set_state(&timers, &task_key, cert_type, id, TimerState::Renewing);
            let state = match renew(store.as_ref(), enroller.as_ref(), &task_key, cert_type, &clock).await {
                Ok(()) => TimerState::Renewed,
                Err(e) => {
                    error!("Renewal of {cert_type} certificate of {task_key} failed: {e}");
                    TimerState::Failed
                }
            };
            set_state(&timers, &task_key, cert_type, id, state);
        });
        let timer = RenewalTimer {
            id,
            fire_at,
            not_after,
            manual,
            state: TimerState::Scheduled,
            handle,
        };
        if let Some(old) = guard.insert((key, cert_type), timer) {
            old.handle.abort();
        }
    }
}

impl Drop for CertificateCoordinator {
    fn drop(&mut self) {
        for (_, timer) in self.timers().drain() {
            timer.handle.abort();
        }
    }
}

fn set_state(timers: &TimerMap, key: &InstanceKey, cert_type: CertType, id: u64, state: TimerState) {
    let mut timers = timers.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(timer) = timers.get_mut(&(key.clone(), cert_type)) {
        if timer.id == id {
            timer.state = state;
        }
    }
}

async fn renew(
    store: &dyn ObjectStore,
    enroller: &dyn Enroller,
    key: &InstanceKey,
    cert_type: CertType,
    clock: &Clock,
) -> Result<()> {
    patch_status(
        store,
        key,
        json!({
            "type": NodeStatusType::Warning,
            "reason": RENEWAL_REASON,
            "message": format!("Renewing {cert_type} certificate"),
        }),
    )
    .await?;
    let node = from_dynamic(store.get(ResourceKind::LedgerNode, &key.namespace, &key.name).await?)?;
    backup_certificates(store, &node, cert_type, clock()).await?;
    info!("Renewing {cert_type} certificate of {key}");
    enroller
        .renew(RenewalRequest {
            enrollment: node.spec.enrollment.clone(),
            storage_path: format!("/var/ledger/crypto/{}", cert_type.as_str()),
            instance: node,
            cert_type,
        })
        .await
}

/// Append the current certificate material to the backup secret,
/// keeping the newest entries only
pub async fn backup_certificates(
    store: &dyn ObjectStore,
    node: &LedgerNode,
    cert_type: CertType,
    now: DateTime<Utc>,
) -> Result<()> {
    let ns = node.namespace().unwrap_or_default();
    let name = node.name_any();
    let Some(current) = store
        .get_opt(ResourceKind::Secret, &ns, &cert_type.signcert_secret(&name))
        .await?
    else {
        warn!("No {cert_type} certificate to back up for {ns}/{name}");
        return Ok(());
    };
    let data: BTreeMap<String, String> = match current.data.get("data") {
        Some(d) => serde_json::from_value(d.clone())?,
        None => BTreeMap::new(),
    };
    let backup_name = cert_type.backup_secret(&name);
    let existing = store.get_opt(ResourceKind::Secret, &ns, &backup_name).await?;
    let mut entries: Vec<BackupEntry> = match existing
        .as_ref()
        .and_then(|s| s.data.pointer(&format!("/data/{BACKUP_KEY}")))
        .and_then(|v| v.as_str())
    {
        Some(b64) => serde_json::from_slice(&STANDARD.decode(b64)?)?,
        None => Vec::new(),
    };
    entries.push(BackupEntry { timestamp: now, data });
    if entries.len() > MAX_BACKUPS {
        let excess = entries.len() - MAX_BACKUPS;
        entries.drain(..excess);
    }
    let encoded = STANDARD.encode(serde_json::to_vec(&entries)?);
    match existing {
        Some(_) => {
            store
                .patch(
                    ResourceKind::Secret,
                    &ns,
                    &backup_name,
                    &json!({ "data": { BACKUP_KEY: encoded } }),
                )
                .await?;
        }
        None => {
            let mut secret = ResourceKind::Secret.template();
            secret.metadata.name = Some(backup_name.clone());
            secret.metadata.namespace = Some(ns.clone());
            secret.metadata.labels = Some(get_labels(node));
            secret.metadata.owner_references = Some(vec![get_owner(node)?]);
            secret.data = json!({ "type": "Opaque", "data": { BACKUP_KEY: encoded } });
            store.create(ResourceKind::Secret, &ns, &secret).await?;
        }
    }
    debug!("Backed up {cert_type} certificate of {ns}/{name} ({} entries)", entries.len());
    Ok(())
}

/// Build a sign certificate secret the way the enroller stores it
pub fn signcert_secret(node: &LedgerNode, cert_type: CertType, pem: &[u8]) -> DynamicObject {
    let mut secret = ResourceKind::Secret.template();
    secret.metadata.name = Some(cert_type.signcert_secret(&node.name_any()));
    secret.metadata.namespace = node.namespace();
    secret.metadata.labels = Some(get_labels(node));
    secret.data = json!({ "type": "Opaque", "data": { CERT_KEY: STANDARD.encode(pem) } });
    secret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        instance::LedgerNodeSpec,
        k8smock::{MemoryStore, Operation},
        store::to_dynamic,
    };
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    const PEM: &[u8] = include_bytes!("testdata/signcert.pem");

    fn not_after() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2031, 6, 1, 0, 0, 0).unwrap()
    }

    struct RecordingEnroller {
        tx: mpsc::UnboundedSender<RenewalRequest>,
        fail: bool,
    }

    #[async_trait]
    impl Enroller for RecordingEnroller {
        async fn renew(&self, request: RenewalRequest) -> Result<()> {
            let _ = self.tx.send(request);
            if self.fail {
                Err(Error::Enrollment("ca unreachable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn node() -> LedgerNode {
        let mut n = LedgerNode::new("peer0", LedgerNodeSpec {
            version: "2.5.4".to_string(),
            ..Default::default()
        });
        n.metadata.namespace = Some("org1".to_string());
        n.metadata.uid = Some("uid-1".to_string());
        n
    }

    fn setup(
        now: DateTime<Utc>,
        fail: bool,
        with_certs: &[CertType],
    ) -> (MemoryStore, CertificateCoordinator, mpsc::UnboundedReceiver<RenewalRequest>) {
        let store = MemoryStore::new();
        let n = node();
        store.insert(ResourceKind::LedgerNode, to_dynamic(&n).unwrap());
        for ct in with_certs {
            store.insert(ResourceKind::Secret, signcert_secret(&n, *ct, PEM));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = CertificateCoordinator::with_clock(
            Arc::new(store.clone()),
            Arc::new(RecordingEnroller { tx, fail }),
            Duration::days(30),
            Arc::new(move || now),
        );
        (store, coordinator, rx)
    }

    async fn settled(c: &CertificateCoordinator, cert_type: CertType) -> Option<TimerState> {
        for _ in 0..100 {
            let state = c.timer_state(&node().key(), cert_type);
            if matches!(state, Some(TimerState::Renewed | TimerState::Failed)) {
                return state;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        c.timer_state(&node().key(), cert_type)
    }

    #[test]
    fn test_parse_fixture() {
        assert_eq!(parse_not_after(PEM).unwrap(), not_after());
        assert!(parse_not_after(b"not a certificate").is_err());
    }

    #[tokio::test]
    async fn test_valid_certificates() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();
        let (_, c, _) = setup(now, false, &CertType::ALL);
        let check = c.check_certificates_for_expire(&node(), Duration::days(30)).await.unwrap();
        assert_eq!(check.state, CertState::Valid);
        assert_eq!(check.status, NodeStatusType::Deployed);
    }

    #[tokio::test]
    async fn test_expiring_in_window_is_warning() {
        let (_, c, _) = setup(not_after() - Duration::days(29), false, &CertType::ALL);
        let check = c.check_certificates_for_expire(&node(), Duration::days(30)).await.unwrap();
        assert_eq!(check.state, CertState::Warning);
        assert_eq!(check.status, NodeStatusType::Warning);
        assert!(check.message.contains("ecert certificate expires on 2031-06-01"));
        assert!(check.message.contains("tls certificate expires on 2031-06-01"));
    }

    #[tokio::test]
    async fn test_window_is_taken_from_the_caller() {
        let (_, c, _) = setup(not_after() - Duration::days(60), false, &[CertType::Ecert]);
        let check = c.check_certificates_for_expire(&node(), Duration::days(30)).await.unwrap();
        assert_eq!(check.state, CertState::Valid);
        let check = c.check_certificates_for_expire(&node(), Duration::days(90)).await.unwrap();
        assert_eq!(check.state, CertState::Warning);
    }

    #[tokio::test]
    async fn test_expired_is_worst() {
        let (_, c, _) = setup(not_after() + Duration::days(1), false, &[CertType::Tls]);
        let check = c.check_certificates_for_expire(&node(), Duration::days(30)).await.unwrap();
        assert_eq!(check.state, CertState::Expired);
        assert_eq!(check.status, NodeStatusType::Warning);
        assert!(check.message.contains("tls certificate expired"));
        assert!(!check.message.contains("ecert"));
    }

    #[tokio::test]
    async fn test_missing_certificates_are_skipped() {
        let (_, c, _) = setup(not_after(), false, &[]);
        let check = c.check_certificates_for_expire(&node(), Duration::days(30)).await.unwrap();
        assert_eq!(check.state, CertState::Valid);
        assert_eq!(c.set_certificate_timer(&node(), CertType::Ecert).await.unwrap(), None);
        assert_eq!(c.timer_count(), 0);
    }

    #[tokio::test]
    async fn test_timer_is_replaced_not_duplicated() {
        let (_, c, mut rx) = setup(not_after() - Duration::days(40), false, &CertType::ALL);
        let n = node();
        let fire_at = c.set_certificate_timer(&n, CertType::Tls).await.unwrap();
        assert_eq!(fire_at, Some(not_after() - Duration::days(30)));
        assert_eq!(c.timer_fire_at(&n.key(), CertType::Tls), fire_at);
        c.set_certificate_timer(&n, CertType::Tls).await.unwrap();
        c.set_certificate_timer(&n, CertType::Ecert).await.unwrap();
        assert_eq!(c.timer_count(), 2);
        c.cancel_timers(&n.key());
        assert_eq!(c.timer_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timer_fire_renews_and_backs_up() {
        let (store, c, mut rx) = setup(not_after() - Duration::days(29), false, &CertType::ALL);
        let n = node();
        c.set_certificate_timer(&n, CertType::Ecert).await.unwrap();
        let request = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.cert_type, CertType::Ecert);
        assert_eq!(request.instance.name_any(), "peer0");
        assert_eq!(request.storage_path, "/var/ledger/crypto/ecert");
        assert_eq!(settled(&c, CertType::Ecert).await, Some(TimerState::Renewed));
        assert!(rx.try_recv().is_err(), "renewed exactly once");
        assert_eq!(store.count(|op| matches!(op, Operation::PatchStatus(..))), 1);
        assert_eq!(c.timer_count(), 0);

        let live = store.peek(ResourceKind::LedgerNode, "org1", "peer0").unwrap();
        assert_eq!(live.data["status"]["type"], "Warning");
        assert_eq!(live.data["status"]["reason"], RENEWAL_REASON);

        let backup = store
            .peek(ResourceKind::Secret, "org1", "ecert-peer0-crypto-backup")
            .unwrap();
        let raw = STANDARD
            .decode(backup.data["data"][BACKUP_KEY].as_str().unwrap())
            .unwrap();
        let entries: Vec<BackupEntry> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].data.contains_key(CERT_KEY));
    }

    #[tokio::test]
    async fn test_failed_renewal_is_not_retried() {
        let (store, c, mut rx) = setup(not_after() - Duration::days(29), true, &[CertType::Tls]);
        let n = node();
        c.renew_now(&n, CertType::Tls).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled(&c, CertType::Tls).await, Some(TimerState::Failed));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(c.timer_count(), 0);
        // same certificate, the failed renewal is not armed again
        assert_eq!(c.ensure_certificate_timer(&n, CertType::Tls).await.unwrap(), None);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        let live = store.peek(ResourceKind::LedgerNode, "org1", "peer0").unwrap();
        assert_eq!(live.data["status"]["type"], "Warning");
        assert_eq!(store.count(|op| matches!(op, Operation::PatchStatus(..))), 1);
    }

    #[tokio::test]
    async fn test_fired_timer_is_not_armed_again_for_the_same_certificate() {
        let (store, c, mut rx) = setup(not_after() - Duration::days(29), false, &[CertType::Tls]);
        let n = node();
        assert!(c.ensure_certificate_timer(&n, CertType::Tls).await.unwrap().is_some());
        rx.recv().await.unwrap();
        assert_eq!(settled(&c, CertType::Tls).await, Some(TimerState::Renewed));
        for _ in 0..3 {
            assert_eq!(c.ensure_certificate_timer(&n, CertType::Tls).await.unwrap(), None);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(store.count(|op| matches!(op, Operation::PatchStatus(..))), 1);

        // an explicit re-enroll still goes through
        c.renew_now(&n, CertType::Tls).await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(settled(&c, CertType::Tls).await, Some(TimerState::Renewed));
        assert_eq!(c.ensure_certificate_timer(&n, CertType::Tls).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pending_expiry_timer_is_kept() {
        let (_, c, mut rx) = setup(not_after() - Duration::days(40), false, &[CertType::Tls]);
        let n = node();
        let fire_at = c.ensure_certificate_timer(&n, CertType::Tls).await.unwrap();
        assert_eq!(fire_at, Some(not_after() - Duration::days(30)));
        assert_eq!(c.ensure_certificate_timer(&n, CertType::Tls).await.unwrap(), None);
        assert_eq!(c.timer_fire_at(&n.key(), CertType::Tls), fire_at);
        c.cancel_scheduled(&n.key());
        assert_eq!(c.timer_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_backup_keeps_newest_entries() {
        let store = MemoryStore::new();
        let n = node();
        store.insert(ResourceKind::Secret, signcert_secret(&n, CertType::Ecert, PEM));
        let start = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();
        for day in 0..12 {
            backup_certificates(&store, &n, CertType::Ecert, start + Duration::days(day))
                .await
                .unwrap();
        }
        let backup = store
            .peek(ResourceKind::Secret, "org1", "ecert-peer0-crypto-backup")
            .unwrap();
        let raw = STANDARD
            .decode(backup.data["data"][BACKUP_KEY].as_str().unwrap())
            .unwrap();
        let entries: Vec<BackupEntry> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(entries.len(), MAX_BACKUPS);
        assert_eq!(entries[0].timestamp, start + Duration::days(2));
        assert_eq!(entries[9].timestamp, start + Duration::days(11));
    }

    #[tokio::test]
    async fn test_cert_digest_follows_content() {
        let (store, c, _) = setup(not_after(), false, &[CertType::Ecert]);
        let n = node();
        let before = c.cert_digest(&n, CertType::Ecert).await.unwrap();
        assert!(before.is_some());
        store.mutate(ResourceKind::Secret, "org1", "ecert-peer0-signcert", |s| {
            s.data["data"][CERT_KEY] = json!(STANDARD.encode(b"renewed"));
        });
        assert_ne!(c.cert_digest(&n, CertType::Ecert).await.unwrap(), before);
        assert_eq!(c.cert_digest(&n, CertType::Tls).await.unwrap(), None);
    }
}
