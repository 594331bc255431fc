//! Kiln controller - ML artifact control plane for Kubernetes

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tracing::info;

use kiln_build::BuilderImages;
use kiln_cloud::{detect_cloud, BucketUrl, Cloud, CloudConfig, CloudKind};
use kiln_common::crd::{crds_yaml, Dataset, Model, Notebook, Server};
use kiln_common::telemetry::{init_logging, LogFormat};
use kiln_common::{DEFAULT_SCI_PORT, FIELD_MANAGER};
use kiln_controller::gc::{run_gc, GcClientImpl};
use kiln_controller::runner::{build_controllers, DEFAULT_CONCURRENCY};
use kiln_controller::{Context, ControllerConfig};
use kiln_resources::{AcceleratorCatalog, Sizer};
use kiln_sci::GrpcSciClient;

/// Kiln - datasets, models, servers and notebooks as Kubernetes objects
#[derive(Parser, Debug)]
#[command(name = "kiln-controller", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    args: ControllerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print CRD manifests and exit
    Crd,
    /// Run the reconcilers (default mode)
    Controller,
}

#[derive(clap::Args, Debug)]
struct ControllerArgs {
    /// Cloud backend (gcp, aws, azure, local); probed from instance metadata when unset
    #[arg(long, env = "CLOUD", global = true)]
    cloud: Option<CloudKind>,

    /// Cluster name, prefixed onto built image names
    #[arg(long, env = "CLUSTER_NAME", default_value = "kiln", global = true)]
    cluster_name: String,

    /// Root bucket for artifacts (gs://, s3://, az:// or file://)
    #[arg(long, env = "ARTIFACT_BUCKET", global = true)]
    artifact_bucket: Option<BucketUrl>,

    /// Registry built images are pushed to
    #[arg(long, env = "REGISTRY_URL", global = true)]
    registry: Option<String>,

    /// Cloud identity workloads run as
    #[arg(long, env = "PRINCIPAL", global = true)]
    principal: Option<String>,

    /// Azure storage account holding the artifact container
    #[arg(long, env = "AZURE_STORAGE_ACCOUNT", global = true)]
    azure_storage_account: Option<String>,

    /// Host directory backing buckets on local clusters
    #[arg(long, env = "LOCAL_BUCKET_ROOT", default_value = "/var/lib/kiln/buckets", global = true)]
    local_root: String,

    /// Address of the SCI service
    #[arg(long, env = "SCI_ADDRESS", default_value_t = format!("http://kiln-sci:{DEFAULT_SCI_PORT}"), global = true)]
    sci_address: String,

    /// Container builder image
    #[arg(long, env = "BUILDER_IMAGE", global = true)]
    builder_image: Option<String>,

    /// Image providing git for builder clone steps
    #[arg(long, env = "GIT_IMAGE", global = true)]
    git_image: Option<String>,

    /// Concurrent reconciles per kind
    #[arg(long, env = "CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY, global = true)]
    concurrency: u16,

    /// Deadline for one reconcile pass, in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 60, global = true)]
    reconcile_timeout_secs: u64,

    /// Interval between garbage-collector sweeps, in seconds
    #[arg(long, env = "GC_INTERVAL_SECS", default_value_t = 300, global = true)]
    gc_interval_secs: u64,

    /// YAML accelerator catalog replacing the built-in one for the cloud
    #[arg(long, env = "ACCELERATOR_CATALOG", global = true)]
    accelerator_catalog: Option<PathBuf>,

    /// Log format (json or text)
    #[arg(long, env = "LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd || matches!(cli.command, Some(Commands::Crd)) {
        let yaml = crds_yaml().map_err(|e| anyhow::anyhow!("Failed to serialize CRDs: {e}"))?;
        println!("{yaml}");
        return Ok(());
    }

    init_logging(cli.args.log_format)?;
    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.args).await,
        Some(Commands::Crd) => Ok(()),
    }
}

/// Install or update the Kiln CRDs with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [Dataset::crd(), Model::crd(), Server::crd(), Notebook::crd()] {
        let name = crd.name_any();
        info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .with_context(|| format!("Failed to install CRD {name}"))?;
    }
    Ok(())
}

fn load_catalog(path: Option<&PathBuf>, cloud: CloudKind) -> anyhow::Result<AcceleratorCatalog> {
    match path {
        None => Ok(AcceleratorCatalog::for_cloud(cloud)),
        Some(path) => {
            let yaml = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read accelerator catalog {}", path.display()))?;
            AcceleratorCatalog::from_yaml(&yaml)
                .with_context(|| format!("Invalid accelerator catalog {}", path.display()))
        }
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let kind = match args.cloud {
        Some(kind) => kind,
        None => detect_cloud().await?,
    };
    info!(cloud = %kind, cluster = %args.cluster_name, "Starting Kiln controller");

    let artifact_bucket = args
        .artifact_bucket
        .ok_or_else(|| anyhow::anyhow!("--artifact-bucket is required"))?;
    let registry_url = args
        .registry
        .ok_or_else(|| anyhow::anyhow!("--registry is required"))?;
    let cloud = Cloud::new(CloudConfig {
        kind,
        cluster_name: args.cluster_name,
        artifact_bucket,
        registry_url,
        principal: args.principal,
        azure_storage_account: args.azure_storage_account,
        local_root: args.local_root,
    })?;
    let catalog = load_catalog(args.accelerator_catalog.as_ref(), kind)?;

    let mut images = BuilderImages::default();
    if let Some(builder) = args.builder_image {
        images.builder = builder;
    }
    if let Some(git) = args.git_image {
        images.git = git;
    }

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    ensure_crds_installed(&client).await?;

    let sci = GrpcSciClient::connect_lazy(&args.sci_address)?;
    info!(sci = %args.sci_address, "SCI client configured");

    let ctx = Arc::new(Context::new(
        client.clone(),
        Arc::new(cloud),
        Arc::new(Sizer::new(catalog)),
        Arc::new(sci),
        images,
        ControllerConfig {
            reconcile_timeout: Duration::from_secs(args.reconcile_timeout_secs),
            ..Default::default()
        },
    ));

    let index = ctx.index.clone();
    let controllers = build_controllers(client.clone(), ctx, args.concurrency);
    let gc = run_gc(
        GcClientImpl::new(client),
        index,
        Duration::from_secs(args.gc_interval_secs),
    );

    info!(concurrency = args.concurrency, "Controllers started");
    tokio::select! {
        _ = futures::future::join_all(controllers) => {
            info!("Controllers shut down");
        }
        _ = gc => {}
    }
    Ok(())
}
