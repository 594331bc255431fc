//! gRPC server exposing a backend

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::proto::controller_server::{Controller, ControllerServer};
use crate::proto::{
    BindIdentityRequest, BindIdentityResponse, CreateSignedUrlRequest, CreateSignedUrlResponse,
    GetObjectMd5Request, GetObjectMd5Response,
};
use crate::SciError;

/// gRPC service over a backend
pub struct SciService<B> {
    backend: Arc<B>,
}

impl<B> SciService<B> {
    /// Wrap a backend
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

fn require(field: &str, value: &str) -> Result<(), Status> {
    if value.trim().is_empty() {
        return Err(Status::invalid_argument(format!("{field} is required")));
    }
    Ok(())
}

fn log_failure(operation: &str, err: &SciError) {
    if err.is_transient() {
        warn!(operation, error = %err, "Backend temporarily unavailable");
    } else {
        warn!(operation, error = %err, "Backend call failed");
    }
}

#[tonic::async_trait]
impl<B: Backend + 'static> Controller for SciService<B> {
    async fn create_signed_url(
        &self,
        request: Request<CreateSignedUrlRequest>,
    ) -> Result<Response<CreateSignedUrlResponse>, Status> {
        let req = request.into_inner();
        require("bucket_name", &req.bucket_name)?;
        require("object_name", &req.object_name)?;
        require("md5_checksum", &req.md5_checksum)?;
        if req.expiration_seconds <= 0 {
            return Err(Status::invalid_argument("expiration_seconds must be positive"));
        }

        let url = self
            .backend
            .create_signed_url(
                &req.bucket_name,
                &req.object_name,
                Duration::from_secs(req.expiration_seconds as u64),
                &req.md5_checksum,
            )
            .await
            .inspect_err(|e| log_failure("create_signed_url", e))?;
        info!(
            bucket = %req.bucket_name,
            object = %req.object_name,
            expiration_seconds = req.expiration_seconds,
            "Issued signed url"
        );
        Ok(Response::new(CreateSignedUrlResponse { url }))
    }

    async fn get_object_md5(
        &self,
        request: Request<GetObjectMd5Request>,
    ) -> Result<Response<GetObjectMd5Response>, Status> {
        let req = request.into_inner();
        require("bucket_name", &req.bucket_name)?;
        require("object_name", &req.object_name)?;

        match self
            .backend
            .get_object_md5(&req.bucket_name, &req.object_name)
            .await
            .inspect_err(|e| log_failure("get_object_md5", e))?
        {
            Some(md5_checksum) => Ok(Response::new(GetObjectMd5Response { md5_checksum })),
            None => {
                debug!(bucket = %req.bucket_name, object = %req.object_name, "Object not found");
                Err(SciError::NotFound {
                    bucket: req.bucket_name,
                    object: req.object_name,
                }
                .into())
            }
        }
    }

    async fn bind_identity(
        &self,
        request: Request<BindIdentityRequest>,
    ) -> Result<Response<BindIdentityResponse>, Status> {
        let req = request.into_inner();
        require("principal", &req.principal)?;
        require("kubernetes_namespace", &req.kubernetes_namespace)?;
        require("kubernetes_service_account", &req.kubernetes_service_account)?;

        self.backend
            .bind_identity(
                &req.principal,
                &req.kubernetes_namespace,
                &req.kubernetes_service_account,
            )
            .await
            .inspect_err(|e| log_failure("bind_identity", e))?;
        Ok(Response::new(BindIdentityResponse {}))
    }
}

/// Serve the SCI and gRPC health services until `shutdown` resolves
pub async fn serve<B, F>(addr: SocketAddr, backend: Arc<B>, shutdown: F) -> Result<(), SciError>
where
    B: Backend + 'static,
    F: Future<Output = ()> + Send,
{
    let (mut reporter, health) = tonic_health::server::health_reporter();
    reporter
        .set_serving::<ControllerServer<SciService<B>>>()
        .await;

    info!(%addr, "Starting SCI gRPC server");
    Server::builder()
        .add_service(health)
        .add_service(ControllerServer::new(SciService::new(backend)))
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(SciError::from)
}
