//! Error type shared by the upgrade orchestrator, the remediation dispatcher and the controller.

use thiserror::Error;

/// Errors surfaced by the operator core
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API call failed
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// A resource is missing a field the operator relies on
    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    /// Operator configuration is invalid
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Upgrade policy could not be evaluated
    #[error("Invalid upgrade policy: {0}")]
    InvalidPolicy(String),

    /// Remediation mapping document or ConfigMap problem
    #[error("Remediation mapping error: {0}")]
    MappingError(String),

    /// JSON encode/decode failure
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML decode failure
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Drain could not evict or delete the selected pods
    #[error("Drain of node {node} failed: {reason}")]
    DrainError { node: String, reason: String },

    /// Finalizer bookkeeping failed
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Several per-node operations failed in one pass
    #[error("{} error(s): {}", .0.len(), .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Aggregate(Vec<Error>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// HTTP status code of the underlying API error, if any
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    /// Optimistic-concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Eviction refused by a disruption budget (HTTP 429)
    pub fn is_too_many_requests(&self) -> bool {
        self.api_code() == Some(429)
    }

    /// Join per-node errors; `None` when nothing failed.
    pub fn join(errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.into_iter().next(),
            _ => Some(Error::Aggregate(errors)),
        }
    }

    /// Build an API error with the given status code.
    pub fn api(code: u16, reason: &str, message: impl Into<String>) -> Self {
        Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: message.into(),
            reason: reason.to_string(),
            code,
        }))
    }
}
