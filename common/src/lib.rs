use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("K8s error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("Conflict while writing {kind} {namespace}/{name}: {message}")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
        message: String,
    },

    #[error("Drift detected on {kind} of {instance}: {}", paths.join(", "))]
    DriftDetected {
        instance: String,
        kind: String,
        paths: Vec<String>,
    },

    #[error("Desired state builder failed for {kind}: {message}")]
    Builder { kind: String, message: String },

    #[error("No desired state builder registered for {0}")]
    MissingBuilder(String),

    #[error("Instance {0} has no uid, cannot own children")]
    MissingOwner(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Enrollment failed: {0}")]
    Enrollment(String),

    #[error("Endpoint {0} is unreachable: {1}")]
    Unreachable(String, String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Semver error {0}")]
    Semver(#[from] semver::Error),

    #[error("Base64 decode error {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    #[error("Error: {0}")]
    Other(String),
}
impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::NotFound { .. } => "notfound".to_string(),
            Error::Conflict { .. } => "conflict".to_string(),
            Error::DriftDetected { .. } => "driftdetected".to_string(),
            _ => format!("{self:?}").to_lowercase(),
        }
    }

    /// NotFound is how the store says "not yet reconciled"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod certificate;
pub mod config;
pub mod context;
pub mod drift;
pub mod instance;
pub mod k8smock;
pub mod kinds;
pub mod migration;
pub mod netcheck;
pub mod resource;
pub mod restart;
mod semverhandler;
pub mod store;
pub use context::get_client_name;
pub use instance::{InstanceKey, LedgerNode};
pub use kinds::ResourceKind;
pub use semverhandler::{Semver, is_digest};
