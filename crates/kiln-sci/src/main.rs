//! Kiln SCI - storage and cloud identity service

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser};
use rand::RngCore;
use tracing::info;

use kiln_cloud::{detect_cloud, CloudKind};
use kiln_common::telemetry::{init_logging, LogFormat};
use kiln_common::DEFAULT_SCI_PORT;
use kiln_sci::backend::{
    upload_router, AwsBackend, AwsConfig, AzureBackend, AzureConfig, Backend, GcpBackend,
    GcpConfig, LocalBackend, LocalConfig,
};
use kiln_sci::server::serve;

/// Kiln SCI - signed upload URLs, object checksums and workload identity binding
#[derive(Parser, Debug)]
#[command(name = "kiln-sci", version, about, long_about = None)]
struct Cli {
    /// gRPC listen address
    #[arg(long, env = "SCI_LISTEN", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_SCI_PORT)))]
    listen: SocketAddr,

    /// Cloud backend (gcp, aws, azure, local); probed from instance metadata when unset
    #[arg(long, env = "CLOUD")]
    cloud: Option<CloudKind>,

    /// Log format (json or text)
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    #[command(flatten)]
    gcp: GcpArgs,

    #[command(flatten)]
    aws: AwsArgs,

    #[command(flatten)]
    azure: AzureArgs,

    #[command(flatten)]
    local: LocalArgs,
}

#[derive(Args, Debug)]
struct GcpArgs {
    /// Project hosting the workload identity pool
    #[arg(long = "gcp-project", env = "GCP_PROJECT_ID")]
    project: Option<String>,

    /// Service account that signs upload URLs
    #[arg(long = "gcp-signer-email", env = "GCP_SIGNER_EMAIL")]
    signer_email: Option<String>,
}

#[derive(Args, Debug)]
struct AwsArgs {
    /// IAM OIDC provider ARN of the cluster
    #[arg(long = "aws-oidc-provider-arn", env = "AWS_OIDC_PROVIDER_ARN")]
    oidc_provider_arn: Option<String>,
}

#[derive(Args, Debug)]
struct AzureArgs {
    /// Storage account holding the artifact containers
    #[arg(long = "azure-storage-account", env = "AZURE_STORAGE_ACCOUNT")]
    storage_account: Option<String>,

    /// Storage account key used to sign SAS tokens
    #[arg(long = "azure-storage-key", env = "AZURE_STORAGE_KEY", hide_env_values = true)]
    storage_key: Option<String>,

    /// Subscription of the workload managed identity
    #[arg(long = "azure-subscription-id", env = "AZURE_SUBSCRIPTION_ID")]
    subscription_id: Option<String>,

    /// Resource group of the workload managed identity
    #[arg(long = "azure-resource-group", env = "AZURE_RESOURCE_GROUP")]
    resource_group: Option<String>,

    /// Name of the workload managed identity
    #[arg(long = "azure-identity-name", env = "AZURE_IDENTITY_NAME")]
    identity_name: Option<String>,

    /// Cluster OIDC issuer URL
    #[arg(long = "azure-oidc-issuer", env = "AZURE_OIDC_ISSUER")]
    oidc_issuer: Option<String>,
}

#[derive(Args, Debug)]
struct LocalArgs {
    /// Directory holding one sub-directory per bucket
    #[arg(long = "local-root", env = "LOCAL_BUCKET_ROOT", default_value = "/var/lib/kiln/buckets")]
    root: PathBuf,

    /// Listen address of the upload endpoint
    #[arg(long = "local-upload-listen", env = "LOCAL_UPLOAD_LISTEN", default_value = "0.0.0.0:10081")]
    upload_listen: SocketAddr,

    /// URL clients use to reach the upload endpoint
    #[arg(long = "local-public-url", env = "LOCAL_PUBLIC_URL", default_value = "http://localhost:10081")]
    public_url: String,

    /// HMAC key for signed URLs; random per process when unset
    #[arg(long = "local-signing-key", env = "LOCAL_SIGNING_KEY", hide_env_values = true)]
    signing_key: Option<String>,
}

fn required(value: Option<String>, flag: &str, cloud: CloudKind) -> anyhow::Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("--{flag} is required for the {cloud} backend"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}

async fn run<B: Backend + 'static>(listen: SocketAddr, backend: Arc<B>) -> anyhow::Result<()> {
    serve(listen, backend, shutdown_signal())
        .await
        .context("SCI server failed")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    let cloud = match cli.cloud {
        Some(cloud) => cloud,
        None => detect_cloud().await?,
    };
    info!(%cloud, listen = %cli.listen, "Starting Kiln SCI");

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    match cloud {
        CloudKind::Gcp => {
            let config = GcpConfig::new(
                required(cli.gcp.project, "gcp-project", cloud)?,
                required(cli.gcp.signer_email, "gcp-signer-email", cloud)?,
            );
            run(cli.listen, Arc::new(GcpBackend::new(config, http))).await
        }
        CloudKind::Aws => {
            let config = AwsConfig {
                oidc_provider_arn: cli.aws.oidc_provider_arn,
            };
            run(cli.listen, Arc::new(AwsBackend::from_env(config).await)).await
        }
        CloudKind::Azure => {
            let config = AzureConfig {
                storage_account: required(cli.azure.storage_account, "azure-storage-account", cloud)?,
                storage_key: required(cli.azure.storage_key, "azure-storage-key", cloud)?,
                subscription_id: required(cli.azure.subscription_id, "azure-subscription-id", cloud)?,
                resource_group: required(cli.azure.resource_group, "azure-resource-group", cloud)?,
                identity_name: required(cli.azure.identity_name, "azure-identity-name", cloud)?,
                oidc_issuer: required(cli.azure.oidc_issuer, "azure-oidc-issuer", cloud)?,
                blob_endpoint: None,
                arm_url: "https://management.azure.com".to_string(),
                token_url: "http://169.254.169.254/metadata/identity/oauth2/token?api-version=2018-02-01&resource=https://management.azure.com/".to_string(),
            };
            run(cli.listen, Arc::new(AzureBackend::new(config, http)?)).await
        }
        CloudKind::Local => {
            let signing_key = match cli.local.signing_key {
                Some(key) => key.into_bytes(),
                None => {
                    let mut key = vec![0u8; 32];
                    rand::thread_rng().fill_bytes(&mut key);
                    key
                }
            };
            let backend = Arc::new(LocalBackend::new(LocalConfig {
                root: cli.local.root,
                public_url: cli.local.public_url,
                signing_key,
            }));

            let listener = tokio::net::TcpListener::bind(cli.local.upload_listen)
                .await
                .with_context(|| format!("failed to bind {}", cli.local.upload_listen))?;
            info!(addr = %cli.local.upload_listen, "Starting local upload endpoint");
            let router = upload_router(backend.clone());
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router).await {
                    tracing::error!(error = %e, "Local upload endpoint failed");
                }
            });

            run(cli.listen, backend).await
        }
    }
}
