//! Backend selection
//!
//! `CLOUD` wins when set. Otherwise the instance metadata services are
//! probed with a short timeout; a host that answers none of them is treated
//! as a local cluster.

use std::time::Duration;

use tracing::{debug, info};

use crate::{CloudError, CloudKind};

/// Environment variable selecting the backend
pub const CLOUD_ENV: &str = "CLOUD";

/// Metadata endpoints probed when `CLOUD` is unset
#[derive(Clone, Debug)]
pub struct MetadataProbe {
    /// GCP metadata server root (expects `Metadata-Flavor: Google`)
    pub gcp_url: String,
    /// AWS IMDSv2 token endpoint
    pub aws_token_url: String,
    /// Azure IMDS instance endpoint
    pub azure_url: String,
    /// Per-probe timeout
    pub timeout: Duration,
}

impl Default for MetadataProbe {
    fn default() -> Self {
        Self {
            gcp_url: "http://metadata.google.internal/computeMetadata/v1/".to_string(),
            aws_token_url: "http://169.254.169.254/latest/api/token".to_string(),
            azure_url: "http://169.254.169.254/metadata/instance?api-version=2021-02-01"
                .to_string(),
            timeout: Duration::from_millis(500),
        }
    }
}

/// Read the backend from `CLOUD`, if set
pub fn cloud_from_env() -> Result<Option<CloudKind>, CloudError> {
    match std::env::var(CLOUD_ENV) {
        Ok(value) if !value.trim().is_empty() => value.parse().map(Some),
        _ => Ok(None),
    }
}

/// Select the backend: `CLOUD` first, then the metadata probe
pub async fn detect_cloud() -> Result<CloudKind, CloudError> {
    if let Some(kind) = cloud_from_env()? {
        info!(cloud = %kind, "Cloud selected from environment");
        return Ok(kind);
    }
    let kind = probe_metadata(&MetadataProbe::default()).await;
    info!(cloud = %kind, "Cloud selected by metadata probe");
    Ok(kind)
}

/// Probe the metadata services, falling back to [`CloudKind::Local`]
pub async fn probe_metadata(probe: &MetadataProbe) -> CloudKind {
    let client = match reqwest::Client::builder().timeout(probe.timeout).build() {
        Ok(client) => client,
        Err(e) => {
            debug!(error = %e, "Failed to build metadata client");
            return CloudKind::Local;
        }
    };

    let gcp = client
        .get(&probe.gcp_url)
        .header("Metadata-Flavor", "Google")
        .send();
    if let Ok(resp) = gcp.await {
        let flavor = resp
            .headers()
            .get("Metadata-Flavor")
            .and_then(|v| v.to_str().ok());
        if resp.status().is_success() && flavor == Some("Google") {
            return CloudKind::Gcp;
        }
    }

    let aws = client
        .put(&probe.aws_token_url)
        .header("X-aws-ec2-metadata-token-ttl-seconds", "60")
        .send();
    if let Ok(resp) = aws.await {
        if resp.status().is_success() {
            return CloudKind::Aws;
        }
    }

    let azure = client
        .get(&probe.azure_url)
        .header("Metadata", "true")
        .send();
    if let Ok(resp) = azure.await {
        if resp.status().is_success() {
            return CloudKind::Azure;
        }
    }

    debug!("No metadata service answered");
    CloudKind::Local
}
