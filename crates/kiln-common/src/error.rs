//! Error types shared by the Kiln controllers
//!
//! Errors are structured with fields to aid debugging in production. The
//! split between retryable and permanent errors drives the controllers'
//! error policies: configuration errors wait for a spec change, everything
//! else is requeued with backoff.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Kiln operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a resource spec
    #[error("validation error for {object}: {message}")]
    Validation {
        /// `kind/namespace/name` of the object with invalid configuration
        object: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.build.git.url")
        field: Option<String>,
    },

    /// Operator configuration error (flags, env, catalog files)
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's misconfigured
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "gc")
        context: String,
    },
}

impl Error {
    /// Create a validation error without object context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific object
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific object and field path
    pub fn validation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a known resource kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether retrying the failed operation can succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { source } => !matches!(source, kube::Error::Api(ae) if ae.code == 422),
            Self::Validation { .. } | Self::Config { .. } | Self::Serialization { .. } => false,
            Self::Internal { .. } => true,
        }
    }

    /// The object this error refers to, if known
    pub fn object(&self) -> Option<&str> {
        match self {
            Self::Validation { object, .. } if object != UNKNOWN_CONTEXT => Some(object),
            _ => None,
        }
    }
}

/// True when a kube error is a 404 from the API server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True when a kube error is a 409 AlreadyExists / Conflict from the API server
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}
