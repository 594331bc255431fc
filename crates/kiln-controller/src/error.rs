//! Reconcile error type

use thiserror::Error;

use kiln_build::BuildError;
use kiln_resources::SizingError;
use kiln_sci::SciError;

/// Errors returned from a reconcile pass
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Build orchestration failed
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Storage and cloud identity service failed
    #[error("sci error: {0}")]
    Sci(#[from] SciError),

    /// Resource sizing rejected the request
    #[error("sizing error: {0}")]
    Sizing(#[from] SizingError),

    /// Shared Kiln error
    #[error(transparent)]
    Common(#[from] kiln_common::Error),

    /// The reconcile pass did not finish within its deadline
    #[error("reconcile of {object} exceeded {seconds}s deadline")]
    Timeout {
        /// `kind/namespace/name`
        object: String,
        /// Deadline in seconds
        seconds: u64,
    },

    /// The object cannot be reconciled as written
    #[error("invalid {object}: {message}")]
    Validation {
        /// `kind/namespace/name`
        object: String,
        /// What is wrong
        message: String,
    },
}

impl ReconcileError {
    /// Create a validation error for an object
    pub fn validation(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: message.into(),
        }
    }

    /// Whether requeueing can make progress without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(e)) => e.code != 422,
            Self::Kube(_) => true,
            Self::Build(e) => e.is_retryable(),
            Self::Sci(e) => !matches!(e, SciError::InvalidArgument(_)),
            Self::Sizing(_) => false,
            Self::Common(e) => e.is_retryable(),
            Self::Timeout { .. } => true,
            Self::Validation { .. } => false,
        }
    }
}
