//! Azure backend
//!
//! Upload URLs are service SAS URLs for a single blob (`sp=cw`). A SAS cannot
//! carry a checksum, so the MD5 is enforced by the client's required
//! `Content-MD5` header, which Blob Storage verifies on `Put Blob`. Clients
//! must also send `x-ms-blob-type: BlockBlob`.
//!
//! Identity binding creates a federated identity credential on the
//! user-assigned managed identity, one per service account.

use std::time::Duration;

use async_trait::async_trait;
use aws_lc_rs::hmac;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::info;

use super::{encode_component, encode_path, validate_object, Backend};
use crate::md5::base64_to_hex;
use crate::token::MetadataToken;
use crate::SciError;

const BACKEND: &str = "azure";
const SAS_VERSION: &str = "2022-11-02";
const MSI_API_VERSION: &str = "2023-01-31";
const TOKEN_EXCHANGE_AUDIENCE: &str = "api://AzureADTokenExchange";
/// Lifetime of the read SAS used for checksum lookups
const READ_SAS_TTL: Duration = Duration::from_secs(300);

/// Azure backend settings
#[derive(Clone, Debug)]
pub struct AzureConfig {
    /// Storage account holding the artifact containers
    pub storage_account: String,
    /// Base64 storage account key used to sign SAS tokens
    pub storage_key: String,
    /// Subscription of the managed identity
    pub subscription_id: String,
    /// Resource group of the managed identity
    pub resource_group: String,
    /// User-assigned managed identity name
    pub identity_name: String,
    /// Cluster OIDC issuer URL
    pub oidc_issuer: String,
    /// Blob endpoint, `https://<account>.blob.core.windows.net` unless overridden
    pub blob_endpoint: Option<String>,
    /// Azure Resource Manager root
    pub arm_url: String,
    /// IMDS token endpoint for the ARM audience
    pub token_url: String,
}

impl AzureConfig {
    fn blob_endpoint(&self) -> String {
        self.blob_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", self.storage_account))
    }
}

/// Blob Storage + managed identity backend
pub struct AzureBackend {
    config: AzureConfig,
    key: hmac::Key,
    http: reqwest::Client,
    token: MetadataToken,
}

impl AzureBackend {
    /// Create a backend. Fails when the storage key is not base64.
    pub fn new(config: AzureConfig, http: reqwest::Client) -> Result<Self, SciError> {
        let key_bytes = STANDARD
            .decode(config.storage_key.trim())
            .map_err(|e| SciError::Config(format!("azure storage key is not base64: {e}")))?;
        let token = MetadataToken::new(BACKEND, config.token_url.clone(), ("Metadata", "true"));
        Ok(Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, &key_bytes),
            config,
            http,
            token,
        })
    }

    /// Service SAS query string for one blob
    fn blob_sas(&self, container: &str, blob: &str, permissions: &str, expiry: DateTime<Utc>) -> String {
        let expiry = expiry.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let canonical = format!(
            "/blob/{}/{}/{}",
            self.config.storage_account, container, blob
        );
        let string_to_sign = [
            permissions,
            "",
            expiry.as_str(),
            canonical.as_str(),
            "",
            "",
            "https",
            SAS_VERSION,
            "b",
            "",
            "",
            "",
            "",
            "",
            "",
            "",
        ]
        .join("\n");
        let signature = STANDARD.encode(hmac::sign(&self.key, string_to_sign.as_bytes()));
        format!(
            "sv={}&se={}&sr=b&sp={}&spr=https&sig={}",
            SAS_VERSION,
            encode_component(&expiry),
            permissions,
            encode_component(&signature)
        )
    }

    fn blob_url(&self, container: &str, blob: &str, sas: &str) -> String {
        format!(
            "{}/{}/{}?{}",
            self.config.blob_endpoint(),
            container,
            encode_path(blob),
            sas
        )
    }

    fn credential_url(&self, credential: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ManagedIdentity/userAssignedIdentities/{}/federatedIdentityCredentials/{}?api-version={}",
            self.config.arm_url.trim_end_matches('/'),
            self.config.subscription_id,
            self.config.resource_group,
            self.config.identity_name,
            credential,
            MSI_API_VERSION
        )
    }
}

/// Federated credential name for a service account: `<ns>-<sa>`, restricted
/// to the characters Azure accepts
fn credential_name(namespace: &str, service_account: &str) -> String {
    let raw = format!("{namespace}-{service_account}");
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    name.truncate(120);
    name
}

fn credential_body(issuer: &str, namespace: &str, service_account: &str) -> Value {
    json!({
        "properties": {
            "issuer": issuer,
            "subject": format!("system:serviceaccount:{namespace}:{service_account}"),
            "audiences": [TOKEN_EXCHANGE_AUDIENCE],
        }
    })
}

#[async_trait]
impl Backend for AzureBackend {
    async fn create_signed_url(
        &self,
        bucket: &str,
        object: &str,
        expiration: Duration,
        _md5_hex: &str,
    ) -> Result<String, SciError> {
        validate_object(bucket, object)?;
        let expiry = Utc::now()
            + chrono::Duration::from_std(expiration)
                .map_err(|e| SciError::InvalidArgument(e.to_string()))?;
        let sas = self.blob_sas(bucket, object, "cw", expiry);
        Ok(self.blob_url(bucket, object, &sas))
    }

    async fn get_object_md5(&self, bucket: &str, object: &str) -> Result<Option<String>, SciError> {
        validate_object(bucket, object)?;
        let expiry = Utc::now() + chrono::Duration::seconds(READ_SAS_TTL.as_secs() as i64);
        let url = self.blob_url(bucket, object, &self.blob_sas(bucket, object, "r", expiry));
        let resp = self
            .http
            .head(&url)
            .header("x-ms-version", SAS_VERSION)
            .send()
            .await
            .map_err(|e| SciError::from_reqwest(BACKEND, e))?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SciError::from_http(BACKEND, status.as_u16(), ""));
        }
        match resp
            .headers()
            .get("content-md5")
            .and_then(|v| v.to_str().ok())
        {
            Some(b64) => base64_to_hex(b64).map(Some),
            None => Ok(Some(String::new())),
        }
    }

    async fn bind_identity(
        &self,
        principal: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<(), SciError> {
        let name = credential_name(namespace, service_account);
        let token = self.token.get(&self.http).await?;
        let resp = self
            .http
            .put(self.credential_url(&name))
            .bearer_auth(token)
            .json(&credential_body(
                &self.config.oidc_issuer,
                namespace,
                service_account,
            ))
            .send()
            .await
            .map_err(|e| SciError::from_reqwest(BACKEND, e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SciError::from_http(BACKEND, status.as_u16(), &text));
        }
        info!(
            principal,
            identity = %self.config.identity_name,
            credential = %name,
            "Bound workload identity"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn backend() -> AzureBackend {
        AzureBackend::new(
            AzureConfig {
                storage_account: "kilnstore".to_string(),
                storage_key: STANDARD.encode(b"secret-key"),
                subscription_id: "sub".to_string(),
                resource_group: "rg".to_string(),
                identity_name: "kiln-workloads".to_string(),
                oidc_issuer: "https://oidc.example/".to_string(),
                blob_endpoint: None,
                arm_url: "https://management.azure.com".to_string(),
                token_url: "http://169.254.169.254/metadata/identity/oauth2/token".to_string(),
            },
            reqwest::Client::new(),
        )
        .unwrap()
    }

    #[test]
    fn story_upload_sas_is_scoped_to_one_blob() {
        let b = backend();
        let expiry = Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap();
        let sas = b.blob_sas("kiln", "abc/uploads/latest.tar.gz", "cw", expiry);
        assert!(sas.starts_with("sv=2022-11-02&se=2024-03-01T12%3A05%3A00Z&sr=b&sp=cw&spr=https&sig="));

        // deterministic for identical inputs
        assert_eq!(sas, b.blob_sas("kiln", "abc/uploads/latest.tar.gz", "cw", expiry));
        assert_ne!(sas, b.blob_sas("kiln", "other", "cw", expiry));

        let url = b.blob_url("kiln", "abc/uploads/latest.tar.gz", &sas);
        assert!(url.starts_with(
            "https://kilnstore.blob.core.windows.net/kiln/abc/uploads/latest.tar.gz?sv="
        ));
    }

    #[test]
    fn bad_storage_key_is_a_config_error() {
        let mut config = backend().config;
        config.storage_key = "***".to_string();
        assert!(matches!(
            AzureBackend::new(config, reqwest::Client::new()),
            Err(SciError::Config(_))
        ));
    }

    #[test]
    fn federated_credential_per_service_account() {
        assert_eq!(credential_name("team-a", "modeller"), "team-a-modeller");
        assert_eq!(credential_name("ns", "sa.with.dots"), "ns-sa-with-dots");

        let body = credential_body("https://oidc.example/", "team-a", "modeller");
        assert_eq!(body["properties"]["subject"], "system:serviceaccount:team-a:modeller");
        assert_eq!(body["properties"]["audiences"][0], TOKEN_EXCHANGE_AUDIENCE);

        let url = backend().credential_url("team-a-modeller");
        assert!(url.contains("/userAssignedIdentities/kiln-workloads/federatedIdentityCredentials/team-a-modeller?api-version=2023-01-31"));
    }
}
