//! Shared reconciler context

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use kiln_build::{BuildOrchestrator, BuilderImages, JobClient, KubeJobClient};
use kiln_cloud::Cloud;
use kiln_common::{EventPublisher, KubeEventPublisher};
use kiln_resources::Sizer;
use kiln_sci::SciClient;

use crate::index::DependencyIndex;
use crate::kube_client::{ControllerKubeClient, ControllerKubeClientImpl};

/// Name events are reported under
pub const CONTROLLER_NAME: &str = "kiln-controller";

/// Default deadline for one reconcile pass
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default requeue interval while waiting for an upload
pub const DEFAULT_UPLOAD_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Tunables shared by every reconciler
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Deadline for one reconcile pass
    pub reconcile_timeout: Duration,
    /// Requeue interval while an upload is pending
    pub upload_poll_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            upload_poll_interval: DEFAULT_UPLOAD_POLL_INTERVAL,
        }
    }
}

/// Everything a reconciler needs
pub struct Context {
    /// Kubernetes access for Kiln objects and their dependents
    pub kube: Arc<dyn ControllerKubeClient>,
    /// Job access
    pub jobs: Arc<dyn JobClient>,
    /// Storage and cloud identity service
    pub sci: Arc<dyn SciClient>,
    /// Event publisher for kubectl-visible events
    pub events: Arc<dyn EventPublisher>,
    /// Active cloud
    pub cloud: Arc<Cloud>,
    /// Resource sizing engine
    pub sizer: Arc<Sizer>,
    /// Container image builds
    pub builds: BuildOrchestrator,
    /// Cross-kind dependency edges
    pub index: Arc<DependencyIndex>,
    /// Tunables
    pub config: ControllerConfig,
}

impl Context {
    /// Create a context over a live cluster
    pub fn new(
        client: Client,
        cloud: Arc<Cloud>,
        sizer: Arc<Sizer>,
        sci: Arc<dyn SciClient>,
        images: BuilderImages,
        config: ControllerConfig,
    ) -> Self {
        let events: Arc<dyn EventPublisher> =
            Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        let jobs: Arc<dyn JobClient> = Arc::new(KubeJobClient::new(client.clone()));
        Self::from_parts(
            Arc::new(ControllerKubeClientImpl::new(client)),
            jobs,
            sci,
            events,
            cloud,
            sizer,
            images,
            config,
        )
    }

    /// Assemble a context from its collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        kube: Arc<dyn ControllerKubeClient>,
        jobs: Arc<dyn JobClient>,
        sci: Arc<dyn SciClient>,
        events: Arc<dyn EventPublisher>,
        cloud: Arc<Cloud>,
        sizer: Arc<Sizer>,
        images: BuilderImages,
        config: ControllerConfig,
    ) -> Self {
        let builds = BuildOrchestrator::new(
            cloud.clone(),
            sizer.clone(),
            sci.clone(),
            jobs.clone(),
            events.clone(),
            images,
        );
        Self {
            kube,
            jobs,
            sci,
            events,
            cloud,
            sizer,
            builds,
            index: Arc::new(DependencyIndex::new()),
            config,
        }
    }

    /// Context over mocks, on a GCP cloud with a principal configured
    #[cfg(test)]
    pub(crate) fn for_testing(
        kube: Arc<dyn ControllerKubeClient>,
        jobs: Arc<dyn JobClient>,
        sci: Arc<dyn SciClient>,
    ) -> Self {
        use kiln_cloud::{CloudConfig, CloudKind};
        use kiln_common::NoopEventPublisher;
        use kiln_resources::AcceleratorCatalog;

        let cloud = Cloud::new(CloudConfig {
            kind: CloudKind::Gcp,
            cluster_name: "dev".to_string(),
            artifact_bucket: "gs://kiln-artifacts"
                .parse()
                .expect("valid bucket url"),
            registry_url: "registry.example/kiln".to_string(),
            principal: Some("kiln-workloads@acme.iam.gserviceaccount.com".to_string()),
            azure_storage_account: None,
            local_root: String::new(),
        })
        .expect("valid cloud config");
        Self::from_parts(
            kube,
            jobs,
            sci,
            Arc::new(NoopEventPublisher),
            Arc::new(cloud),
            Arc::new(Sizer::new(AcceleratorCatalog::for_cloud(CloudKind::Gcp))),
            BuilderImages::default(),
            ControllerConfig::default(),
        )
    }
}
