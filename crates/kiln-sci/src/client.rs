//! Client side of the SCI protocol
//!
//! The controller talks to the SCI through [`SciClient`] so reconcilers can
//! be tested against a mock. [`GrpcSciClient`] retries transient failures
//! with backoff before surfacing them.

use std::time::Duration;

use async_trait::async_trait;
use kiln_common::retry::{retry_with_backoff, RetryConfig};
use tonic::transport::{Channel, Endpoint};
use tonic::Code;

use crate::proto::controller_client::ControllerClient;
use crate::proto::{BindIdentityRequest, CreateSignedUrlRequest, GetObjectMd5Request};
use crate::SciError;

/// Connect timeout for the SCI channel
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Storage and identity operations used by the controllers
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait SciClient: Send + Sync {
    /// Signed URL accepting one `PUT` of `bucket/object` with the given MD5
    async fn create_signed_url(
        &self,
        bucket: &str,
        object: &str,
        expiration: Duration,
        md5_hex: &str,
    ) -> Result<String, SciError>;

    /// Hex MD5 of a stored object, `None` when it does not exist
    async fn get_object_md5(&self, bucket: &str, object: &str) -> Result<Option<String>, SciError>;

    /// Allow a Kubernetes service account to act as `principal`
    async fn bind_identity(
        &self,
        principal: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<(), SciError>;
}

/// gRPC implementation of [`SciClient`]
#[derive(Clone)]
pub struct GrpcSciClient {
    inner: ControllerClient<Channel>,
    retry: RetryConfig,
}

impl GrpcSciClient {
    /// Create a client for `endpoint` (e.g. `http://kiln-sci:10080`).
    ///
    /// The channel connects lazily so the controller can start before the
    /// SCI is reachable.
    pub fn connect_lazy(endpoint: &str) -> Result<Self, SciError> {
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| SciError::Config(format!("invalid SCI endpoint '{endpoint}': {e}")))?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .connect_lazy();
        Ok(Self {
            inner: ControllerClient::new(channel),
            retry: RetryConfig::default(),
        })
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl SciClient for GrpcSciClient {
    async fn create_signed_url(
        &self,
        bucket: &str,
        object: &str,
        expiration: Duration,
        md5_hex: &str,
    ) -> Result<String, SciError> {
        let request = CreateSignedUrlRequest {
            bucket_name: bucket.to_string(),
            object_name: object.to_string(),
            expiration_seconds: expiration.as_secs() as i64,
            md5_checksum: md5_hex.to_string(),
        };
        retry_with_backoff(&self.retry, "create_signed_url", SciError::is_transient, || {
            let mut client = self.inner.clone();
            let request = request.clone();
            async move {
                let resp = client.create_signed_url(request).await?;
                Ok(resp.into_inner().url)
            }
        })
        .await
    }

    async fn get_object_md5(&self, bucket: &str, object: &str) -> Result<Option<String>, SciError> {
        let request = GetObjectMd5Request {
            bucket_name: bucket.to_string(),
            object_name: object.to_string(),
        };
        retry_with_backoff(&self.retry, "get_object_md5", SciError::is_transient, || {
            let mut client = self.inner.clone();
            let request = request.clone();
            async move {
                match client.get_object_md5(request).await {
                    Ok(resp) => Ok(Some(resp.into_inner().md5_checksum)),
                    Err(status) if status.code() == Code::NotFound => Ok(None),
                    Err(status) => Err(SciError::from(status)),
                }
            }
        })
        .await
    }

    async fn bind_identity(
        &self,
        principal: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<(), SciError> {
        let request = BindIdentityRequest {
            principal: principal.to_string(),
            kubernetes_namespace: namespace.to_string(),
            kubernetes_service_account: service_account.to_string(),
        };
        retry_with_backoff(&self.retry, "bind_identity", SciError::is_transient, || {
            let mut client = self.inner.clone();
            let request = request.clone();
            async move {
                client.bind_identity(request).await?;
                Ok(())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::backend::MockBackend;
    use crate::server::serve;

    fn free_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        }
    }

    async fn start(backend: MockBackend) -> (GrpcSciClient, tokio::sync::oneshot::Sender<()>) {
        let addr = free_addr();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(serve(addr, Arc::new(backend), async {
            let _ = rx.await;
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let client = GrpcSciClient::connect_lazy(&format!("http://{addr}"))
            .unwrap()
            .with_retry(fast_retry());
        (client, tx)
    }

    #[tokio::test]
    async fn story_upload_handshake_over_grpc() {
        let mut backend = MockBackend::new();
        backend
            .expect_create_signed_url()
            .returning(|b, o, _, _| Ok(format!("https://storage.example/{b}/{o}?sig=x")));
        backend
            .expect_get_object_md5()
            .withf(|_, object| object == "present")
            .returning(|_, _| Ok(Some("5d41402abc4b2a76b9719d911017c592".to_string())));
        backend
            .expect_get_object_md5()
            .returning(|_, _| Ok(None));
        let (client, _stop) = start(backend).await;

        let url = client
            .create_signed_url("kiln", "a/uploads/latest.tar.gz", Duration::from_secs(300), "5d41402abc4b2a76b9719d911017c592")
            .await
            .unwrap();
        assert_eq!(url, "https://storage.example/kiln/a/uploads/latest.tar.gz?sig=x");

        assert_eq!(
            client.get_object_md5("kiln", "present").await.unwrap().as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
        assert_eq!(client.get_object_md5("kiln", "absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut backend = MockBackend::new();
        backend.expect_bind_identity().returning(move |_, _, _| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SciError::unavailable("gcp", "HTTP 503"))
            } else {
                Ok(())
            }
        });
        let (client, _stop) = start(backend).await;

        client
            .bind_identity("sa@p.iam.gserviceaccount.com", "team", "modeller")
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut backend = MockBackend::new();
        backend.expect_bind_identity().returning(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
            Err(SciError::backend("gcp", "HTTP 403: forbidden"))
        });
        let (client, _stop) = start(backend).await;

        let err = client
            .bind_identity("sa@p.iam.gserviceaccount.com", "team", "modeller")
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_endpoint_is_a_config_error() {
        assert!(matches!(
            GrpcSciClient::connect_lazy("not a uri"),
            Err(SciError::Config(_))
        ));
    }
}
