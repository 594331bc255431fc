//! Google Cloud backend
//!
//! Signed URLs are V4 URLs whose string-to-sign is signed by the IAM
//! Credentials `signBlob` API, so no private key ever reaches the pod.
//! `content-md5` is a signed header: GCS rejects an upload whose body or
//! header does not match.

use std::time::Duration;

use async_trait::async_trait;
use aws_lc_rs::digest;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use kiln_common::retry::{retry_with_backoff, RetryConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{encode_component, encode_path, validate_object, Backend};
use crate::md5::{base64_to_hex, hex_to_base64};
use crate::token::MetadataToken;
use crate::SciError;

const BACKEND: &str = "gcp";
const WORKLOAD_IDENTITY_ROLE: &str = "roles/iam.workloadIdentityUser";
const STORAGE_HOST: &str = "storage.googleapis.com";
/// V4 signed URLs are valid for at most seven days
const MAX_EXPIRATION_SECS: u64 = 604_800;

/// GCP backend settings
#[derive(Clone, Debug)]
pub struct GcpConfig {
    /// Project whose workload identity pool service accounts live in
    pub project: String,
    /// Google service account that signs URLs
    pub signer_email: String,
    /// Metadata server root
    pub metadata_url: String,
    /// GCS JSON API root
    pub storage_api_url: String,
    /// IAM API root
    pub iam_url: String,
    /// IAM Credentials API root
    pub iam_credentials_url: String,
}

impl GcpConfig {
    /// Production endpoints for a project and signer
    pub fn new(project: impl Into<String>, signer_email: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            signer_email: signer_email.into(),
            metadata_url: "http://metadata.google.internal/computeMetadata/v1".to_string(),
            storage_api_url: "https://storage.googleapis.com/storage/v1".to_string(),
            iam_url: "https://iam.googleapis.com/v1".to_string(),
            iam_credentials_url: "https://iamcredentials.googleapis.com/v1".to_string(),
        }
    }
}

/// GCS + IAM backend
pub struct GcpBackend {
    config: GcpConfig,
    http: reqwest::Client,
    token: MetadataToken,
}

#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
struct Binding {
    role: String,
    #[serde(default)]
    members: Vec<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// IAM policy, keeping fields this backend does not touch
#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
struct Policy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    bindings: Vec<Binding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl Policy {
    /// Add `member` to `role`, returning false when already present
    fn add_member(&mut self, role: &str, member: &str) -> bool {
        match self.bindings.iter_mut().find(|b| b.role == role) {
            Some(binding) if binding.members.iter().any(|m| m == member) => false,
            Some(binding) => {
                binding.members.push(member.to_string());
                true
            }
            None => {
                self.bindings.push(Binding {
                    role: role.to_string(),
                    members: vec![member.to_string()],
                    extra: Map::new(),
                });
                true
            }
        }
    }
}

/// Pieces of a V4 signature that depend only on the request
struct V4Request<'a> {
    bucket: &'a str,
    object: &'a str,
    content_md5: &'a str,
    signer: &'a str,
    now: DateTime<Utc>,
    expires_secs: u64,
}

impl V4Request<'_> {
    fn datestamp(&self) -> String {
        self.now.format("%Y%m%d").to_string()
    }

    fn timestamp(&self) -> String {
        self.now.format("%Y%m%dT%H%M%SZ").to_string()
    }

    fn scope(&self) -> String {
        format!("{}/auto/storage/goog4_request", self.datestamp())
    }

    fn path(&self) -> String {
        format!("/{}/{}", self.bucket, encode_path(self.object))
    }

    /// Query string without the signature, sorted by key
    fn canonical_query(&self) -> String {
        let credential = format!("{}/{}", self.signer, self.scope());
        let params = [
            ("X-Goog-Algorithm", "GOOG4-RSA-SHA256".to_string()),
            ("X-Goog-Credential", credential),
            ("X-Goog-Date", self.timestamp()),
            ("X-Goog-Expires", self.expires_secs.to_string()),
            ("X-Goog-SignedHeaders", "content-md5;host".to_string()),
        ];
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, encode_component(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn canonical_request(&self) -> String {
        format!(
            "PUT\n{}\n{}\ncontent-md5:{}\nhost:{}\n\ncontent-md5;host\nUNSIGNED-PAYLOAD",
            self.path(),
            self.canonical_query(),
            self.content_md5,
            STORAGE_HOST
        )
    }

    fn string_to_sign(&self) -> String {
        let hashed = digest::digest(&digest::SHA256, self.canonical_request().as_bytes());
        format!(
            "GOOG4-RSA-SHA256\n{}\n{}\n{}",
            self.timestamp(),
            self.scope(),
            hex::encode(hashed.as_ref())
        )
    }

    fn url(&self, signature_hex: &str) -> String {
        format!(
            "https://{}{}?{}&X-Goog-Signature={}",
            STORAGE_HOST,
            self.path(),
            self.canonical_query(),
            signature_hex
        )
    }
}

impl GcpBackend {
    /// Create a backend using the node's metadata server for tokens
    pub fn new(config: GcpConfig, http: reqwest::Client) -> Self {
        let token = MetadataToken::new(
            BACKEND,
            format!(
                "{}/instance/service-accounts/default/token",
                config.metadata_url
            ),
            ("Metadata-Flavor", "Google"),
        );
        Self {
            config,
            http,
            token,
        }
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, SciError> {
        let token = self.token.get(&self.http).await?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| SciError::from_reqwest(BACKEND, e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SciError::from_http(BACKEND, status.as_u16(), &text));
        }
        resp.json()
            .await
            .map_err(|e| SciError::from_reqwest(BACKEND, e))
    }

    async fn sign_blob(&self, payload: &str) -> Result<Vec<u8>, SciError> {
        let url = format!(
            "{}/projects/-/serviceAccounts/{}:signBlob",
            self.config.iam_credentials_url, self.config.signer_email
        );
        let resp = self
            .post_json(&url, &json!({ "payload": STANDARD.encode(payload) }))
            .await?;
        let signed = resp
            .get("signedBlob")
            .and_then(Value::as_str)
            .ok_or_else(|| SciError::backend(BACKEND, "signBlob response missing signedBlob"))?;
        STANDARD
            .decode(signed)
            .map_err(|e| SciError::backend(BACKEND, format!("signedBlob is not base64: {e}")))
    }

    /// One read-modify-write of the service account policy
    async fn add_policy_member(&self, principal: &str, member: &str) -> Result<(), SciError> {
        let base = format!(
            "{}/projects/-/serviceAccounts/{}",
            self.config.iam_url, principal
        );
        let current = self.post_json(&format!("{base}:getIamPolicy"), &json!({})).await?;
        let mut policy: Policy = serde_json::from_value(current)
            .map_err(|e| SciError::backend(BACKEND, format!("invalid IAM policy: {e}")))?;

        if !policy.add_member(WORKLOAD_IDENTITY_ROLE, member) {
            debug!(principal, member, "Workload identity binding already present");
            return Ok(());
        }

        // the etag from the read makes a concurrent writer fail with 409
        let body = json!({ "policy": policy });
        self.post_json(&format!("{base}:setIamPolicy"), &body).await?;
        info!(principal, member, "Bound workload identity");
        Ok(())
    }
}

fn is_conflict(err: &SciError) -> bool {
    match err {
        SciError::Backend { message, .. } => message.starts_with("HTTP 409"),
        other => other.is_transient(),
    }
}

#[async_trait]
impl Backend for GcpBackend {
    async fn create_signed_url(
        &self,
        bucket: &str,
        object: &str,
        expiration: Duration,
        md5_hex: &str,
    ) -> Result<String, SciError> {
        validate_object(bucket, object)?;
        let content_md5 = hex_to_base64(md5_hex)?;
        let request = V4Request {
            bucket,
            object,
            content_md5: &content_md5,
            signer: &self.config.signer_email,
            now: Utc::now(),
            expires_secs: expiration.as_secs().clamp(1, MAX_EXPIRATION_SECS),
        };
        let signature = self.sign_blob(&request.string_to_sign()).await?;
        Ok(request.url(&hex::encode(signature)))
    }

    async fn get_object_md5(&self, bucket: &str, object: &str) -> Result<Option<String>, SciError> {
        validate_object(bucket, object)?;
        let token = self.token.get(&self.http).await?;
        let url = format!(
            "{}/b/{}/o/{}?fields=md5Hash",
            self.config.storage_api_url,
            encode_component(bucket),
            encode_component(object)
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SciError::from_reqwest(BACKEND, e))?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SciError::from_http(BACKEND, status.as_u16(), &text));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| SciError::from_reqwest(BACKEND, e))?;
        match body.get("md5Hash").and_then(Value::as_str) {
            Some(b64) => base64_to_hex(b64).map(Some),
            // composite objects have no MD5
            None => Ok(Some(String::new())),
        }
    }

    async fn bind_identity(
        &self,
        principal: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<(), SciError> {
        let member = format!(
            "serviceAccount:{}.svc.id.goog[{}/{}]",
            self.config.project, namespace, service_account
        );
        retry_with_backoff(
            &RetryConfig::with_max_attempts(5),
            "gcp_set_iam_policy",
            is_conflict,
            || self.add_policy_member(principal, &member),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request(now: DateTime<Utc>) -> V4Request<'static> {
        V4Request {
            bucket: "kiln",
            object: "abc/uploads/latest.tar.gz",
            content_md5: "XUFAKrxLKna5cZ2REBfFkg==",
            signer: "sci@proj.iam.gserviceaccount.com",
            now,
            expires_secs: 300,
        }
    }

    #[test]
    fn canonical_request_signs_md5_and_host() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let req = request(now);
        let canonical = req.canonical_request();
        let lines: Vec<&str> = canonical.lines().collect();
        assert_eq!(lines[0], "PUT");
        assert_eq!(lines[1], "/kiln/abc/uploads/latest.tar.gz");
        assert!(lines[2].starts_with("X-Goog-Algorithm=GOOG4-RSA-SHA256&X-Goog-Credential=sci%40proj.iam.gserviceaccount.com%2F20240301%2Fauto%2Fstorage%2Fgoog4_request"));
        assert!(lines[2].contains("X-Goog-Date=20240301T120000Z"));
        assert!(lines[2].contains("X-Goog-Expires=300"));
        assert_eq!(lines[3], "content-md5:XUFAKrxLKna5cZ2REBfFkg==");
        assert_eq!(lines[4], "host:storage.googleapis.com");
        assert_eq!(lines[6], "content-md5;host");
        assert_eq!(lines[7], "UNSIGNED-PAYLOAD");
    }

    #[test]
    fn string_to_sign_hashes_canonical_request() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let req = request(now);
        let sts = req.string_to_sign();
        let lines: Vec<&str> = sts.lines().collect();
        assert_eq!(lines[0], "GOOG4-RSA-SHA256");
        assert_eq!(lines[1], "20240301T120000Z");
        assert_eq!(lines[2], "20240301/auto/storage/goog4_request");
        assert_eq!(lines[3].len(), 64);
        assert!(req
            .url("abcd")
            .starts_with("https://storage.googleapis.com/kiln/abc/uploads/latest.tar.gz?X-Goog-Algorithm="));
        assert!(req.url("abcd").ends_with("&X-Goog-Signature=abcd"));
    }

    #[test]
    fn story_binding_is_additive_and_idempotent() {
        let mut policy: Policy = serde_json::from_value(json!({
            "version": 1,
            "etag": "BwX=",
            "bindings": [
                {"role": "roles/iam.serviceAccountUser", "members": ["user:alice@example.com"]},
                {"role": WORKLOAD_IDENTITY_ROLE, "members": ["serviceAccount:p.svc.id.goog[other/sa]"]}
            ]
        }))
        .unwrap();

        let member = "serviceAccount:p.svc.id.goog[team/modeller]";
        assert!(policy.add_member(WORKLOAD_IDENTITY_ROLE, member));
        assert!(!policy.add_member(WORKLOAD_IDENTITY_ROLE, member));

        let out = serde_json::to_value(&policy).unwrap();
        assert_eq!(out["etag"], "BwX=");
        assert_eq!(out["version"], 1);
        let wi = &out["bindings"][1]["members"];
        assert_eq!(wi.as_array().unwrap().len(), 2);
        assert_eq!(out["bindings"][0]["members"][0], "user:alice@example.com");
    }

    #[test]
    fn empty_policy_gets_a_new_binding() {
        let mut policy = Policy::default();
        assert!(policy.add_member(WORKLOAD_IDENTITY_ROLE, "serviceAccount:x"));
        assert_eq!(policy.bindings.len(), 1);
    }

    #[test]
    fn conflicts_are_retried() {
        assert!(is_conflict(&SciError::from_http(BACKEND, 409, "etag mismatch")));
        assert!(is_conflict(&SciError::from_http(BACKEND, 503, "")));
        assert!(!is_conflict(&SciError::from_http(BACKEND, 403, "denied")));
    }
}
