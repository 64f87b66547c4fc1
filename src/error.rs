//! Error types for the control-plane simulator

use thiserror::Error;

/// Main error type for simulator operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    /// The REST mapping for a kind is missing (CRD not installed)
    #[error("Kind not registered: {0}")]
    KindNotRegistered(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Credential issuance error: {0}")]
    CredentialError(String),

    /// The kubeconfig for a runtime does not exist yet or is unusable
    #[error("Cluster credentials not ready for runtime {0}")]
    CredentialsNotReady(String),

    #[error("Tenant loop error: {0}")]
    TenantLoopError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the work queue should retry quickly
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_)
                | Error::NotFound(_)
                | Error::AlreadyExists(_)
                | Error::KindNotRegistered(_)
                | Error::CredentialError(_)
                | Error::CredentialsNotReady(_)
                | Error::TenantLoopError(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists(_) => true,
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }

    pub fn is_kind_not_registered(&self) -> bool {
        matches!(self, Error::KindNotRegistered(_))
    }
}
