//! Kubernetes access for the reconcilers
//!
//! Everything the reconcilers read or write (other than builder and workload
//! Jobs, which go through [`kiln_build::JobClient`]) passes through
//! [`ControllerKubeClient`] so that reconcile logic can be tested against
//! mocks.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service, ServiceAccount};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use kiln_common::crd::{
    Dataset, DatasetStatus, Model, ModelStatus, Notebook, NotebookStatus, Server, ServerStatus,
};
use kiln_common::error::{is_conflict, is_not_found};
use kiln_common::FIELD_MANAGER;

/// Trait abstracting Kubernetes client operations for the Kiln reconcilers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControllerKubeClient: Send + Sync {
    /// Get a Dataset, `None` when it does not exist
    async fn get_dataset(&self, namespace: &str, name: &str)
        -> Result<Option<Dataset>, kube::Error>;

    /// Get a Model, `None` when it does not exist
    async fn get_model(&self, namespace: &str, name: &str) -> Result<Option<Model>, kube::Error>;

    /// List every Server in a namespace
    async fn list_servers(&self, namespace: &str) -> Result<Vec<Server>, kube::Error>;

    /// Merge-patch the status of a Dataset
    async fn patch_dataset_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DatasetStatus,
    ) -> Result<(), kube::Error>;

    /// Merge-patch the status of a Model
    async fn patch_model_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ModelStatus,
    ) -> Result<(), kube::Error>;

    /// Merge-patch only `status.servers` of a Model
    async fn patch_model_servers(
        &self,
        namespace: &str,
        name: &str,
        servers: &[String],
    ) -> Result<(), kube::Error>;

    /// Merge-patch the status of a Server
    async fn patch_server_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ServerStatus,
    ) -> Result<(), kube::Error>;

    /// Merge-patch the status of a Notebook
    async fn patch_notebook_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NotebookStatus,
    ) -> Result<(), kube::Error>;

    /// Get a ServiceAccount, `None` when it does not exist
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, kube::Error>;

    /// Server-side apply a ServiceAccount
    async fn apply_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<(), kube::Error>;

    /// Get a Deployment, `None` when it does not exist
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, kube::Error>;

    /// Get a Service, `None` when it does not exist
    async fn get_service(&self, namespace: &str, name: &str)
        -> Result<Option<Service>, kube::Error>;

    /// Server-side apply a Deployment, returning the live object
    async fn apply_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, kube::Error>;

    /// Server-side apply a Service
    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<(), kube::Error>;

    /// Get a Pod, `None` when it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error>;

    /// Create a Pod. An existing Pod of the same name counts as success.
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), kube::Error>;

    /// Delete a Pod. An absent Pod counts as success.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;
}

/// [`ControllerKubeClient`] over the Kubernetes API
#[derive(Clone)]
pub struct ControllerKubeClientImpl {
    client: Client,
}

impl ControllerKubeClientImpl {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch_status<K, S>(
        &self,
        namespace: &str,
        name: &str,
        status: &S,
    ) -> Result<(), kube::Error>
    where
        S: serde::Serialize + Sync,
        K: kube::Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + serde::de::DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

#[async_trait]
impl ControllerKubeClient for ControllerKubeClientImpl {
    async fn get_dataset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Dataset>, kube::Error> {
        let api: Api<Dataset> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }

    async fn get_model(&self, namespace: &str, name: &str) -> Result<Option<Model>, kube::Error> {
        let api: Api<Model> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }

    async fn list_servers(&self, namespace: &str) -> Result<Vec<Server>, kube::Error> {
        let api: Api<Server> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_dataset_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DatasetStatus,
    ) -> Result<(), kube::Error> {
        self.patch_status::<Dataset, _>(namespace, name, status).await
    }

    async fn patch_model_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ModelStatus,
    ) -> Result<(), kube::Error> {
        self.patch_status::<Model, _>(namespace, name, status).await
    }

    async fn patch_model_servers(
        &self,
        namespace: &str,
        name: &str,
        servers: &[String],
    ) -> Result<(), kube::Error> {
        let api: Api<Model> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": { "servers": servers } });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_server_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ServerStatus,
    ) -> Result<(), kube::Error> {
        self.patch_status::<Server, _>(namespace, name, status).await
    }

    async fn patch_notebook_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NotebookStatus,
    ) -> Result<(), kube::Error> {
        self.patch_status::<Notebook, _>(namespace, name, status).await
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, kube::Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }

    async fn apply_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<(), kube::Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.patch(&account.name_any(), &apply_params(), &Patch::Apply(account))
            .await?;
        Ok(())
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, kube::Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, kube::Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }

    async fn apply_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, kube::Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            &deployment.name_any(),
            &apply_params(),
            &Patch::Apply(deployment),
        )
        .await
    }

    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<(), kube::Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.patch(&service.name_any(), &apply_params(), &Patch::Apply(service))
            .await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), pod).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => {
                debug!(namespace, pod = ?pod.metadata.name, "Pod already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
