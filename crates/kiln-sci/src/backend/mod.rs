//! Cloud backends
//!
//! Each backend implements the three SCI operations against one cloud.
//! [`BackendImpl`] is the closed set the server dispatches over.

mod aws;
mod azure;
mod gcp;
mod local;

pub use aws::{merge_trust_policy, AwsBackend, AwsConfig};
pub use azure::{AzureBackend, AzureConfig};
pub use gcp::{GcpBackend, GcpConfig};
pub use local::{upload_router, LocalBackend, LocalConfig};

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::SciError;

/// Operations every cloud backend provides
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// URL accepting a single `PUT` of `bucket/object` with the given MD5
    async fn create_signed_url(
        &self,
        bucket: &str,
        object: &str,
        expiration: Duration,
        md5_hex: &str,
    ) -> Result<String, SciError>;

    /// Hex MD5 of the stored object, `None` when it does not exist
    async fn get_object_md5(&self, bucket: &str, object: &str) -> Result<Option<String>, SciError>;

    /// Allow `namespace/service_account` to act as `principal`. Must be
    /// idempotent and must never remove existing bindings.
    async fn bind_identity(
        &self,
        principal: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<(), SciError>;
}

/// The configured backend
pub enum BackendImpl {
    /// Google Cloud
    Gcp(GcpBackend),
    /// Amazon Web Services
    Aws(AwsBackend),
    /// Microsoft Azure
    Azure(AzureBackend),
    /// Local filesystem emulation
    Local(LocalBackend),
}

impl BackendImpl {
    /// Backend name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gcp(_) => "gcp",
            Self::Aws(_) => "aws",
            Self::Azure(_) => "azure",
            Self::Local(_) => "local",
        }
    }
}

#[async_trait]
impl Backend for BackendImpl {
    async fn create_signed_url(
        &self,
        bucket: &str,
        object: &str,
        expiration: Duration,
        md5_hex: &str,
    ) -> Result<String, SciError> {
        match self {
            Self::Gcp(b) => b.create_signed_url(bucket, object, expiration, md5_hex).await,
            Self::Aws(b) => b.create_signed_url(bucket, object, expiration, md5_hex).await,
            Self::Azure(b) => b.create_signed_url(bucket, object, expiration, md5_hex).await,
            Self::Local(b) => b.create_signed_url(bucket, object, expiration, md5_hex).await,
        }
    }

    async fn get_object_md5(&self, bucket: &str, object: &str) -> Result<Option<String>, SciError> {
        match self {
            Self::Gcp(b) => b.get_object_md5(bucket, object).await,
            Self::Aws(b) => b.get_object_md5(bucket, object).await,
            Self::Azure(b) => b.get_object_md5(bucket, object).await,
            Self::Local(b) => b.get_object_md5(bucket, object).await,
        }
    }

    async fn bind_identity(
        &self,
        principal: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<(), SciError> {
        match self {
            Self::Gcp(b) => b.bind_identity(principal, namespace, service_account).await,
            Self::Aws(b) => b.bind_identity(principal, namespace, service_account).await,
            Self::Azure(b) => b.bind_identity(principal, namespace, service_account).await,
            Self::Local(b) => b.bind_identity(principal, namespace, service_account).await,
        }
    }
}

/// RFC 3986 unreserved characters stay as-is, everything else is escaped
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode a single URL component (query value, object name as one segment)
pub(crate) fn encode_component(s: &str) -> String {
    utf8_percent_encode(s, COMPONENT).to_string()
}

/// Percent-encode an object path, keeping `/` separators
pub(crate) fn encode_path(s: &str) -> String {
    s.split('/')
        .map(encode_component)
        .collect::<Vec<_>>()
        .join("/")
}

/// Reject object names that would escape their bucket
pub(crate) fn validate_object(bucket: &str, object: &str) -> Result<(), SciError> {
    if bucket.is_empty() || bucket.contains('/') {
        return Err(SciError::InvalidArgument(format!("invalid bucket name '{bucket}'")));
    }
    if object.is_empty()
        || object.starts_with('/')
        || object.split('/').any(|s| s == ".." || s == "." || s.is_empty())
    {
        return Err(SciError::InvalidArgument(format!("invalid object name '{object}'")));
    }
    Ok(())
}
