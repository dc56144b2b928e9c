//! Central error types for the machine health operator
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use thiserror::Error;

/// Central error type for the machine health operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Kubeconfig of a workload cluster could not be loaded
    #[error("Kubeconfig error: {0}")]
    KubeconfigError(#[from] kube::config::KubeconfigError),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// MachineHealthCheck spec validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Resource not found in the cluster
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Access to a workload cluster could not be established
    #[error("Remote cluster {cluster}: {message}")]
    RemoteClusterError { cluster: String, message: String },

    /// Node watch on a workload cluster could not be started
    #[error("Node watch for cluster {cluster} failed: {message}")]
    WatchError { cluster: String, message: String },

    /// Several errors raised by one reconciliation pass
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

fn join_errors(errors: &[Error]) -> String {
    match errors {
        [single] => single.to_string(),
        _ => format!(
            "[{}]",
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

impl Error {
    /// Check if this error type should trigger a retry
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_)
            | Error::NotFound { .. }
            | Error::RemoteClusterError { .. }
            | Error::WatchError { .. } => true,
            Error::Aggregate(errors) => errors.iter().any(Error::is_retriable),
            _ => false,
        }
    }

    /// Convert to a human-readable message for events
    pub fn status_message(&self) -> String {
        match self {
            Error::KubeError(e) => format!("Kubernetes error: {}", e),
            Error::ValidationError(msg) => format!("Validation failed: {}", msg),
            Error::NotFound { kind, name, .. } => format!("{} {} not found", kind, name),
            Error::RemoteClusterError { cluster, message } => {
                format!("Cannot access cluster {}: {}", cluster, message)
            }
            _ => self.to_string(),
        }
    }

    /// Merge the outcome of a reconciliation body with the outcome of the
    /// final patch. The body error is never replaced by the patch error.
    pub fn merge<T>(body: Result<T>, patch: Result<()>) -> Result<T> {
        match (body, patch) {
            (body, Ok(())) => body,
            (Ok(_), Err(patch_err)) => Err(patch_err),
            (Err(body_err), Err(patch_err)) => Err(Error::Aggregate(vec![body_err, patch_err])),
        }
    }
}
