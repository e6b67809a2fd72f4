use crate::{
    Error, Result, Semver,
    drift::{DriftDetector, IgnorePolicy, IgnoreRule, default_ignore_rules},
    instance::ComponentKind,
    resource::RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const CONFIG_ENV: &str = "OPERATOR_CONFIG";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartConfig {
    /// Drop restart requests instead of rolling the workloads
    pub disabled: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourcesConfig {
    pub update_retries: u32,
    pub restore_retries: u32,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        let retries = RetryPolicy::default();
        ResourcesConfig {
            update_retries: retries.update_retries,
            restore_retries: retries.restore_retries,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DriftConfig {
    pub max_depth: usize,
    pub max_diffs: usize,
    /// Replaces the built-in ignore list when set
    pub ignore: Option<Vec<IgnoreRule>>,
    /// Appended to the ignore list
    pub extra_ignore: Vec<IgnoreRule>,
}

impl Default for DriftConfig {
    fn default() -> Self {
        DriftConfig {
            max_depth: 32,
            max_diffs: 100,
            ignore: None,
            extra_ignore: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificatesConfig {
    pub warning_window_days: i64,
    /// Default for instances that do not set `autoRenew`
    pub auto_renew: bool,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        CertificatesConfig {
            warning_window_days: 30,
            auto_renew: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct BoundariesConfig {
    pub peer: Vec<String>,
    pub orderer: Vec<String>,
    pub ca: Vec<String>,
}

impl Default for BoundariesConfig {
    fn default() -> Self {
        BoundariesConfig {
            peer: vec!["2.0.0".to_string()],
            orderer: vec!["2.0.0".to_string()],
            ca: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationConfig {
    pub boundaries: BoundariesConfig,
    pub image: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            boundaries: BoundariesConfig::default(),
            image: "docker.io/ledgerops/node-migrator:1.0.0".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct EnrollerConfig {
    pub image: String,
}

impl Default for EnrollerConfig {
    fn default() -> Self {
        EnrollerConfig {
            image: "docker.io/ledgerops/enroller:1.0.0".to_string(),
        }
    }
}

/// Operator wide settings
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    pub restart: RestartConfig,
    pub resources: ResourcesConfig,
    pub drift: DriftConfig,
    pub certificates: CertificatesConfig,
    pub migration: MigrationConfig,
    pub enroller: EnrollerConfig,
    pub requeue_seconds: u64,
    pub hsm_dial_timeout_seconds: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            restart: RestartConfig::default(),
            resources: ResourcesConfig::default(),
            drift: DriftConfig::default(),
            certificates: CertificatesConfig::default(),
            migration: MigrationConfig::default(),
            enroller: EnrollerConfig::default(),
            requeue_seconds: 300,
            hsm_dial_timeout_seconds: 10,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name}={value} is not valid")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::Config(format!("{name}={value} is not a boolean"))),
    }
}

impl OperatorConfig {
    /// Load from the process environment
    pub fn load() -> Result<OperatorConfig> {
        Self::load_with(|name| std::env::var(name).ok())
    }

    /// Load the file named by `OPERATOR_CONFIG` (if any), then apply the
    /// environment overrides
    pub fn load_with<F: Fn(&str) -> Option<String>>(env: F) -> Result<OperatorConfig> {
        let mut config = match env(CONFIG_ENV) {
            Some(path) if !path.is_empty() => {
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| Error::Config(format!("cannot read {path}: {e}")))?;
                serde_yaml::from_str(&content)?
            }
            _ => OperatorConfig::default(),
        };
        if let Some(v) = env("DISABLE_RESTARTS") {
            config.restart.disabled = parse_bool("DISABLE_RESTARTS", &v)?;
        }
        if let Some(v) = env("REQUEUE_SECONDS") {
            config.requeue_seconds = parse_env("REQUEUE_SECONDS", &v)?;
        }
        if let Some(v) = env("CERT_WARNING_DAYS") {
            config.certificates.warning_window_days = parse_env("CERT_WARNING_DAYS", &v)?;
        }
        if let Some(v) = env("HSM_DIAL_TIMEOUT_SECONDS") {
            config.hsm_dial_timeout_seconds = parse_env("HSM_DIAL_TIMEOUT_SECONDS", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resources.update_retries == 0 || self.resources.restore_retries == 0 {
            return Err(Error::Config("retry counts must be at least 1".to_string()));
        }
        if self.drift.max_depth == 0 || self.drift.max_diffs == 0 {
            return Err(Error::Config("drift bounds must be at least 1".to_string()));
        }
        if self.certificates.warning_window_days < 0 {
            return Err(Error::Config("warningWindowDays cannot be negative".to_string()));
        }
        if self.requeue_seconds == 0 || self.hsm_dial_timeout_seconds == 0 {
            return Err(Error::Config("durations must be at least one second".to_string()));
        }
        self.migration_boundaries()?;
        IgnorePolicy::new(&self.ignore_rules())?;
        Ok(())
    }

    pub fn ignore_rules(&self) -> Vec<IgnoreRule> {
        let mut rules = self.drift.ignore.clone().unwrap_or_else(default_ignore_rules);
        rules.extend(self.drift.extra_ignore.iter().cloned());
        rules
    }

    pub fn drift_detector(&self) -> Result<DriftDetector> {
        Ok(DriftDetector::new(
            IgnorePolicy::new(&self.ignore_rules())?,
            self.drift.max_depth,
            self.drift.max_diffs,
        ))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            update_retries: self.resources.update_retries,
            restore_retries: self.resources.restore_retries,
        }
    }

    pub fn warning_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.certificates.warning_window_days)
    }

    pub fn requeue(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.requeue_seconds)
    }

    pub fn hsm_dial_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.hsm_dial_timeout_seconds)
    }

    pub fn migration_boundaries(&self) -> Result<HashMap<ComponentKind, Vec<Semver>>> {
        let parse = |list: &[String]| -> Result<Vec<Semver>> {
            list.iter()
                .map(|v| Semver::parse(v).map_err(|e| Error::Config(format!("migration boundary {v}: {e}"))))
                .collect()
        };
        let b = &self.migration.boundaries;
        Ok(HashMap::from([
            (ComponentKind::Peer, parse(&b.peer)?),
            (ComponentKind::Orderer, parse(&b.orderer)?),
            (ComponentKind::Ca, parse(&b.ca)?),
        ]))
    }
}
