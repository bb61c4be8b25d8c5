//! Error types for the Cassandra operator

use kube::runtime::finalizer;
use thiserror::Error;

/// Errors surfaced by the reconciliation engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Management API request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Management API returned {status} for {endpoint}")]
    MgmtApiError { endpoint: String, status: u16 },

    #[error("Pod {0} has no IP address yet")]
    NoPodIp(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The observed cluster contradicts an assumption the engine relies on,
    /// e.g. a rack whose workload vanished between load and mutation.
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<finalizer::Error<Error>>),
}

impl From<finalizer::Error<Error>> for Error {
    fn from(e: finalizer::Error<Error>) -> Self {
        Error::FinalizerError(Box::new(e))
    }
}

impl Error {
    /// Whether the error is likely transient and worth a fast retry
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => e.code == 409 || e.code == 429 || e.code >= 500,
            Error::KubeError(_)
            | Error::HttpError(_)
            | Error::MgmtApiError { .. }
            | Error::NoPodIp(_) => true,
            Error::FinalizerError(inner) => match inner.as_ref() {
                finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => {
                    e.is_retriable()
                }
                _ => true,
            },
            Error::SerializationError(_)
            | Error::ConfigError(_)
            | Error::InvariantViolation(_) => false,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::HttpError(_) | Error::MgmtApiError { .. } | Error::NoPodIp(_) => "mgmt_api",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::InvariantViolation(_) => "invariant",
            Error::FinalizerError(_) => "finalizer",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
