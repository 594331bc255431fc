//! Local filesystem backend
//!
//! Buckets are directories under a root. Signed URLs point at an HTTP upload
//! endpoint served by this process; the URL carries an HMAC over the method,
//! path, expected MD5 and expiry. Each stored object gets an `<object>.md5`
//! sidecar so checksum lookups do not rehash the data.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_lc_rs::hmac;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::put;
use axum::Router;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{encode_component, encode_path, validate_object, Backend};
use crate::md5::{base64_to_hex, Md5Stream};
use crate::SciError;

const BACKEND: &str = "local";

/// Local backend settings
#[derive(Clone, Debug)]
pub struct LocalConfig {
    /// Directory holding one sub-directory per bucket
    pub root: PathBuf,
    /// Base URL clients reach the upload endpoint at
    pub public_url: String,
    /// HMAC key for signed URLs
    pub signing_key: Vec<u8>,
}

/// Filesystem emulation of a cloud bucket store
pub struct LocalBackend {
    root: PathBuf,
    public_url: String,
    key: hmac::Key,
}

impl LocalBackend {
    /// Create a backend over a root directory
    pub fn new(config: LocalConfig) -> Self {
        Self {
            root: config.root,
            public_url: config.public_url.trim_end_matches('/').to_string(),
            key: hmac::Key::new(hmac::HMAC_SHA256, &config.signing_key),
        }
    }

    fn object_path(&self, bucket: &str, object: &str) -> PathBuf {
        self.root.join(bucket).join(object)
    }

    fn signing_message(bucket: &str, object: &str, md5_hex: &str, expires: i64) -> String {
        format!("PUT\n/{bucket}/{object}\n{md5_hex}\n{expires}")
    }

    fn verify(&self, bucket: &str, object: &str, query: &UploadQuery) -> Result<(), &'static str> {
        if query.expires < chrono::Utc::now().timestamp() {
            return Err("signed url expired");
        }
        let signature = hex::decode(&query.signature).map_err(|_| "malformed signature")?;
        let message = Self::signing_message(bucket, object, &query.md5, query.expires);
        hmac::verify(&self.key, message.as_bytes(), &signature).map_err(|_| "signature mismatch")
    }
}

fn sidecar(path: &FsPath) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".md5");
    PathBuf::from(name)
}

/// Unique scratch path next to `path`
fn part_path(path: &FsPath) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".part-{:08x}", rand::random::<u32>()));
    PathBuf::from(name)
}

async fn hash_file(path: &FsPath) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut digest = Md5Stream::default();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finish_hex())
}

fn io_error(err: std::io::Error) -> SciError {
    SciError::backend(BACKEND, err.to_string())
}

#[async_trait]
impl Backend for LocalBackend {
    async fn create_signed_url(
        &self,
        bucket: &str,
        object: &str,
        expiration: Duration,
        md5_hex: &str,
    ) -> Result<String, SciError> {
        validate_object(bucket, object)?;
        let md5_hex = md5_hex.to_ascii_lowercase();
        let expires = chrono::Utc::now().timestamp() + expiration.as_secs() as i64;
        let message = Self::signing_message(bucket, object, &md5_hex, expires);
        let signature = hex::encode(hmac::sign(&self.key, message.as_bytes()));
        Ok(format!(
            "{}/{}/{}?expires={}&md5={}&signature={}",
            self.public_url,
            encode_component(bucket),
            encode_path(object),
            expires,
            md5_hex,
            signature
        ))
    }

    async fn get_object_md5(&self, bucket: &str, object: &str) -> Result<Option<String>, SciError> {
        validate_object(bucket, object)?;
        let path = self.object_path(bucket, object);
        match tokio::fs::read_to_string(sidecar(&path)).await {
            Ok(md5) => return Ok(Some(md5.trim().to_ascii_lowercase())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(e)),
        }
        match hash_file(&path).await {
            Ok(md5) => Ok(Some(md5)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn bind_identity(
        &self,
        principal: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<(), SciError> {
        debug!(principal, namespace, service_account, "Local backend has no identities to bind");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    expires: i64,
    md5: String,
    signature: String,
}

/// HTTP router accepting uploads to URLs issued by the backend
pub fn upload_router(backend: Arc<LocalBackend>) -> Router {
    Router::new()
        .route("/*path", put(put_object))
        .with_state(backend)
}

async fn put_object(
    State(backend): State<Arc<LocalBackend>>,
    Path(path): Path<String>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, (StatusCode, String)> {
    let (bucket, object) = path
        .split_once('/')
        .ok_or((StatusCode::BAD_REQUEST, "path must be /<bucket>/<object>".to_string()))?;
    validate_object(bucket, object).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    if let Err(reason) = backend.verify(bucket, object, &query) {
        warn!(bucket, object, reason, "Rejected upload");
        return Err((StatusCode::FORBIDDEN, reason.to_string()));
    }

    let declared = headers
        .get("content-md5")
        .and_then(|v| v.to_str().ok())
        .ok_or((StatusCode::BAD_REQUEST, "Content-MD5 header required".to_string()))
        .and_then(|v| {
            base64_to_hex(v).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
        })?;
    if declared != query.md5 {
        return Err((
            StatusCode::BAD_REQUEST,
            "Content-MD5 does not match the signed checksum".to_string(),
        ));
    }

    let internal = |e: std::io::Error| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    let dest = backend.object_path(bucket, object);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(internal)?;
    }
    let partial = part_path(&dest);

    let actual = match receive(&partial, body).await {
        Ok(md5) => md5,
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
    };
    if actual != query.md5 {
        let _ = tokio::fs::remove_file(&partial).await;
        warn!(bucket, object, expected = %query.md5, actual, "Upload checksum mismatch");
        return Err((StatusCode::BAD_REQUEST, "BadDigest".to_string()));
    }

    if let Err(e) = commit(&partial, &dest, &actual).await {
        let _ = tokio::fs::remove_file(&partial).await;
        warn!(bucket, object, error = %e, "Failed to store upload");
        return Err(internal(e));
    }
    info!(bucket, object, md5 = %actual, "Stored upload");
    Ok(StatusCode::OK)
}

/// Stream an upload body into `path`, returning its MD5 in hex
async fn receive(path: &FsPath, body: Body) -> Result<String, (StatusCode, String)> {
    let internal = |e: std::io::Error| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    let mut file = tokio::fs::File::create(path).await.map_err(internal)?;
    let mut digest = Md5Stream::default();
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        digest.update(&chunk);
        file.write_all(&chunk).await.map_err(internal)?;
    }
    file.flush().await.map_err(internal)?;
    Ok(digest.finish_hex())
}

/// Move a verified upload into place.
///
/// The old sidecar goes before the object moves and the new one lands last.
/// Without a sidecar, checksum lookups hash the object itself.
async fn commit(partial: &FsPath, dest: &FsPath, md5: &str) -> std::io::Result<()> {
    let sidecar_path = sidecar(dest);
    let staged = part_path(&sidecar_path);
    tokio::fs::write(&staged, md5).await?;

    let result = async {
        match tokio::fs::remove_file(&sidecar_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::fs::rename(partial, dest).await?;
        tokio::fs::rename(&staged, &sidecar_path).await
    }
    .await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&staged).await;
    }
    result
}
