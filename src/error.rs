//! Error types for the Talos bootstrap operator

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Credential blob or operator configuration could not be parsed
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// None of the candidate endpoints could be reached for this attempt
    #[error("Connection error ({endpoints}): {message}")]
    ConnectionError { endpoints: String, message: String },

    /// The machine API rejected the bootstrap trigger
    #[error("Remote call to {endpoint} failed: {message}")]
    RemoteCallError { endpoint: String, message: String },

    /// The retry deadline elapsed without a successful attempt
    #[error("Timed out after {timeout:?} ({attempts} attempt(s)), last error: {last_error}")]
    TimeoutError {
        timeout: Duration,
        attempts: u32,
        #[source]
        last_error: Box<Error>,
    },

    /// An immutable field was changed in place
    #[error("Immutable field(s) changed, resource must be replaced: {}", .0.join(", "))]
    ImmutableFieldError(Vec<String>),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the failure is transient and worth another attempt
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionError { .. }
                | Error::RemoteCallError { .. }
                | Error::KubeError(_)
                | Error::FinalizerError(_)
        )
    }

    /// Short, stable label used for metrics and event reasons
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigError(_) => "config",
            Error::ConnectionError { .. } => "connection",
            Error::RemoteCallError { .. } => "remote_call",
            Error::TimeoutError { .. } => "timeout",
            Error::ImmutableFieldError(_) => "immutable_field",
            Error::ValidationError(_) => "validation",
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::FinalizerError(_) => "finalizer",
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        use kube::runtime::finalizer::Error as FinalizerError;

        match e {
            FinalizerError::ApplyFailed(inner) | FinalizerError::CleanupFailed(inner) => inner,
            FinalizerError::AddFinalizer(e) | FinalizerError::RemoveFinalizer(e) => {
                Error::KubeError(e)
            }
            other => Error::FinalizerError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(Error::ConnectionError {
            endpoints: "10.0.0.5".into(),
            message: "refused".into()
        }
        .is_retriable());
        assert!(Error::RemoteCallError {
            endpoint: "10.0.0.5".into(),
            message: "unavailable".into()
        }
        .is_retriable());
        assert!(!Error::ConfigError("bad yaml".into()).is_retriable());
        assert!(!Error::ValidationError("node is empty".into()).is_retriable());
    }

    #[test]
    fn test_timeout_wraps_last_error() {
        let err = Error::TimeoutError {
            timeout: Duration::from_secs(60),
            attempts: 3,
            last_error: Box::new(Error::RemoteCallError {
                endpoint: "https://10.0.0.5:50000".into(),
                message: "etcd not ready".into(),
            }),
        };

        assert!(!err.is_retriable());
        assert_eq!(err.kind(), "timeout");
        let rendered = err.to_string();
        assert!(rendered.contains("3 attempt(s)"));
        assert!(rendered.contains("etcd not ready"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_immutable_field_message() {
        let err = Error::ImmutableFieldError(vec!["node".into(), "talos_config".into()]);
        assert_eq!(
            err.to_string(),
            "Immutable field(s) changed, resource must be replaced: node, talos_config"
        );
    }
}
