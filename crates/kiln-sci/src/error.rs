//! SCI errors

use thiserror::Error;
use tonic::{Code, Status};

/// Errors from SCI backends and the SCI client
#[derive(Debug, Error)]
pub enum SciError {
    /// The object does not exist (yet)
    #[error("object {bucket}/{object} not found")]
    NotFound {
        /// Bucket name
        bucket: String,
        /// Object name
        object: String,
    },

    /// The request is malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend is missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A cloud API call failed in a way that may succeed on retry
    #[error("{backend} unavailable: {message}")]
    Unavailable {
        /// Backend name
        backend: &'static str,
        /// What failed
        message: String,
    },

    /// A cloud API call failed permanently
    #[error("{backend} error: {message}")]
    Backend {
        /// Backend name
        backend: &'static str,
        /// What failed
        message: String,
    },

    /// The gRPC channel could not be established
    #[error("transport error: {0}")]
    Transport(String),

    /// The gRPC call returned a non-OK status
    #[error("rpc failed: {0}")]
    Status(Status),
}

impl SciError {
    /// A permanent backend error
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    /// A transient backend error
    pub fn unavailable(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            backend,
            message: message.into(),
        }
    }

    /// Classify an HTTP failure from a cloud REST API
    pub fn from_http(backend: &'static str, status: u16, body: &str) -> Self {
        let message = format!("HTTP {status}: {}", body.chars().take(512).collect::<String>());
        if status == 429 || status >= 500 {
            Self::unavailable(backend, message)
        } else {
            Self::backend(backend, message)
        }
    }

    /// Classify a reqwest failure
    pub fn from_reqwest(backend: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::unavailable(backend, err.to_string())
        } else {
            Self::backend(backend, err.to_string())
        }
    }

    /// Whether the client should retry the call
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Unavailable { .. } => true,
            Self::Status(status) => {
                matches!(status.code(), Code::Unavailable | Code::DeadlineExceeded)
            }
            _ => false,
        }
    }
}

impl From<SciError> for Status {
    fn from(err: SciError) -> Self {
        match err {
            SciError::NotFound { .. } => Status::not_found(err.to_string()),
            SciError::InvalidArgument(msg) => Status::invalid_argument(msg),
            SciError::Config(msg) => Status::failed_precondition(msg),
            SciError::Unavailable { .. } | SciError::Transport(_) => {
                Status::unavailable(err.to_string())
            }
            SciError::Backend { .. } => Status::internal(err.to_string()),
            SciError::Status(status) => status,
        }
    }
}

impl From<Status> for SciError {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

impl From<tonic::transport::Error> for SciError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SciError::from(Status::unavailable("down")).is_transient());
        assert!(SciError::from(Status::deadline_exceeded("slow")).is_transient());
        assert!(!SciError::from(Status::internal("boom")).is_transient());
        assert!(SciError::from_http("gcp", 503, "").is_transient());
        assert!(SciError::from_http("gcp", 429, "").is_transient());
        assert!(!SciError::from_http("gcp", 403, "denied").is_transient());
    }

    #[test]
    fn errors_map_to_grpc_codes() {
        let not_found = SciError::NotFound {
            bucket: "b".into(),
            object: "o".into(),
        };
        assert_eq!(Status::from(not_found).code(), Code::NotFound);
        assert_eq!(
            Status::from(SciError::unavailable("aws", "throttled")).code(),
            Code::Unavailable
        );
        assert_eq!(
            Status::from(SciError::backend("azure", "denied")).code(),
            Code::Internal
        );
    }
}
