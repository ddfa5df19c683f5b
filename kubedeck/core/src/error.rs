use crate::{credential::Provider, secret::DecryptionError};
use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the access and proxy core.
///
/// Every variant maps to a stable [`Error::code`] so that streaming clients
/// and HTTP callers can distinguish failures without parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cluster {cluster} is unreachable: {reason}")]
    ClusterUnreachable { cluster: String, reason: String },

    #[error("no credential is configured for cluster {cluster}")]
    CredentialMissing { cluster: String },

    /// The external helper failed. `output` never contains the secret.
    #[error("{provider} credential helper failed: {output}")]
    ProviderAuth { provider: Provider, output: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("a cluster named {0:?} already exists")]
    DuplicateCluster(String),

    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    #[error("failed to seal secret: {0}")]
    Seal(#[source] openssl::error::ErrorStack),

    #[error("helper pod was not ready after {0:?}")]
    PodSpawnTimeout(Duration),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("invalid cluster descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// === impl Error ===

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ClusterUnreachable { .. } => "cluster_unreachable",
            Self::CredentialMissing { .. } => "credential_missing",
            Self::ProviderAuth { .. } => "provider_auth",
            Self::PermissionDenied(_) => "permission_denied",
            Self::DuplicateCluster(_) => "duplicate_cluster",
            Self::UnknownCluster(_) => "unknown_cluster",
            Self::Decryption(_) => "decryption",
            Self::Seal(_) => "seal",
            Self::PodSpawnTimeout(_) => "pod_spawn_timeout",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::InvalidBundle(_) => "invalid_bundle",
            Self::InvalidDescriptor(_) => "invalid_descriptor",
            Self::Store(_) => "store",
            Self::Io(_) => "io",
        }
    }

    /// Whether a caller may reasonably retry the operation. Nothing is
    /// retried internally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ClusterUnreachable { .. } | Self::UpstreamUnavailable(_)
        )
    }

    pub fn unreachable(cluster: impl ToString, reason: impl ToString) -> Self {
        Self::ClusterUnreachable {
            cluster: cluster.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn upstream(error: impl std::fmt::Display) -> Self {
        Self::UpstreamUnavailable(error.to_string())
    }
}
