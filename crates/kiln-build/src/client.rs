//! Job access for the orchestrator and the job-running reconcilers

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::debug;

use kiln_common::error::{is_conflict, is_not_found};

/// Trait abstracting `batch/v1` Job operations
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Get a Job, `None` when it does not exist
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, kube::Error>;

    /// Create a Job. An existing Job of the same name counts as success.
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), kube::Error>;

    /// Delete a Job and its pods in the background. An absent Job counts as
    /// success.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;
}

/// [`JobClient`] over the Kubernetes API
#[derive(Clone)]
pub struct KubeJobClient {
    client: Client,
}

impl KubeJobClient {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobClient for KubeJobClient {
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, kube::Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), kube::Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), job).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => {
                debug!(namespace, job = ?job.metadata.name, "Job already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Whether a Job has at least one succeeded pod
pub fn job_succeeded(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .is_some_and(|n| n >= 1)
}

/// Whether a Job carries `Failed=True`
pub fn job_failed(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Failed" && c.status == "True")
        })
}
