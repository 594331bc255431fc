//! Build orchestration errors

use kiln_resources::SizingError;
use kiln_sci::SciError;
use thiserror::Error;

/// Errors surfaced by the build orchestrator
#[derive(Debug, Error)]
pub enum BuildError {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// SCI call failed
    #[error("SCI error: {0}")]
    Sci(#[from] SciError),

    /// Builder sizing failed
    #[error("sizing error: {0}")]
    Sizing(#[from] SizingError),

    /// Build spec cannot be turned into a builder job
    #[error("invalid build for {object}: {message}")]
    InvalidBuild {
        /// `kind/namespace/name` of the object
        object: String,
        /// What is wrong
        message: String,
    },

    /// Object metadata the orchestrator relies on is missing
    #[error("{object} has no {field}")]
    MissingMetadata {
        /// `kind/namespace/name` of the object
        object: String,
        /// Missing field (namespace, uid)
        field: &'static str,
    },

    /// Error from shared Kiln code
    #[error("{0}")]
    Common(#[from] kiln_common::Error),
}

impl BuildError {
    /// Whether requeueing can resolve the error without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(e) => !matches!(e, kube::Error::Api(ae) if ae.code == 422),
            Self::Sci(e) => e.is_transient(),
            Self::Common(e) => e.is_retryable(),
            Self::Sizing(_) | Self::InvalidBuild { .. } | Self::MissingMetadata { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_sci_errors_are_retryable() {
        assert!(BuildError::from(SciError::unavailable("gcp", "HTTP 503")).is_retryable());
        assert!(!BuildError::from(SciError::backend("gcp", "HTTP 403")).is_retryable());
        assert!(!BuildError::InvalidBuild {
            object: "model/default/llama".into(),
            message: "empty url".into(),
        }
        .is_retryable());
    }
}
