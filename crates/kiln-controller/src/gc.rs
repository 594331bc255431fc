//! Garbage-collector sweep
//!
//! Owner references let Kubernetes cascade most deletions. The sweep catches
//! what slips through: every Job, Deployment, Service and Pod labelled with
//! `kiln.dev/owner-kind` whose owning Kiln object no longer exists (or was
//! recreated under a new uid) is deleted. Objects controlled by something
//! other than a Kiln object, such as the pods of a Job or ReplicaSet, are
//! left to their controller.
//!
//! The sweep also drops dependency-index entries of deleted Kiln objects.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, PropagationPolicy};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use kiln_common::crd::{Dataset, Model, Notebook, Server};
use kiln_common::error::is_not_found;
use kiln_common::{
    ObjectKind, API_VERSION, OWNED_SELECTOR, OWNER_KIND_LABEL, OWNER_NAME_LABEL, OWNER_UID_LABEL,
};

use crate::index::DependencyIndex;

/// Kubernetes kinds Kiln creates on behalf of its objects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DependentKind {
    /// Loader, modeller and builder Jobs
    Job,
    /// Server Deployments
    Deployment,
    /// Server Services
    Service,
    /// Notebook Pods
    Pod,
}

impl DependentKind {
    /// Every dependent kind the sweep visits
    pub const ALL: [DependentKind; 4] = [Self::Job, Self::Deployment, Self::Service, Self::Pod];
}

impl fmt::Display for DependentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Job => "Job",
            Self::Deployment => "Deployment",
            Self::Service => "Service",
            Self::Pod => "Pod",
        })
    }
}

/// The Kiln object a dependent belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    /// Kind of the owner
    pub kind: ObjectKind,
    /// Name of the owner, possibly truncated when read from the owner-name label
    pub name: String,
    /// Uid of the owner the dependent was created for
    pub uid: String,
    /// Whether `name` came from an owner reference and so is the full name
    pub exact_name: bool,
}

impl Owner {
    fn from_reference(reference: &OwnerReference) -> Option<Self> {
        if reference.api_version != API_VERSION {
            return None;
        }
        Some(Self {
            kind: reference.kind.parse().ok()?,
            name: reference.name.clone(),
            uid: reference.uid.clone(),
            exact_name: true,
        })
    }

    fn from_labels(meta: &ObjectMeta) -> Option<Self> {
        let labels = meta.labels.as_ref()?;
        Some(Self {
            kind: labels.get(OWNER_KIND_LABEL)?.parse().ok()?,
            name: labels.get(OWNER_NAME_LABEL)?.clone(),
            uid: labels.get(OWNER_UID_LABEL)?.clone(),
            exact_name: false,
        })
    }
}

/// A labelled dependent found by the sweep
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dependent {
    /// Kubernetes kind
    pub kind: DependentKind,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
    /// Owning Kiln object, `None` when another controller owns the dependent
    /// or the labels and references are unusable
    pub owner: Option<Owner>,
}

impl Dependent {
    /// Build from object metadata.
    ///
    /// A controller owner reference decides the owner: a Kiln one names it,
    /// any other leaves the dependent to that controller. Without one, a Kiln
    /// owner reference is used, then the owner labels, which must carry the
    /// owner uid.
    pub fn from_meta(kind: DependentKind, meta: &ObjectMeta) -> Option<Self> {
        let namespace = meta.namespace.clone()?;
        let name = meta.name.clone()?;

        let references = meta.owner_references.as_deref().unwrap_or_default();
        let owner = match references.iter().find(|r| r.controller == Some(true)) {
            Some(controller) => Owner::from_reference(controller),
            None => references
                .iter()
                .find_map(Owner::from_reference)
                .or_else(|| Owner::from_labels(meta)),
        };

        Some(Self {
            kind,
            namespace,
            name,
            owner,
        })
    }
}

/// Kubernetes access for the sweep
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GcClient: Send + Sync {
    /// Every dependent of `kind` carrying the owner-kind label, cluster-wide
    async fn list_dependents(&self, kind: DependentKind) -> Result<Vec<Dependent>, kube::Error>;

    /// Uid of a Kiln object, `None` when it does not exist
    async fn owner_uid(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, kube::Error>;

    /// Uids of every Kiln object of `kind` in `namespace`
    async fn owner_uids(&self, kind: ObjectKind, namespace: &str)
        -> Result<Vec<String>, kube::Error>;

    /// Delete a dependent. An absent object counts as success.
    async fn delete_dependent(&self, dependent: &Dependent) -> Result<(), kube::Error>;
}

/// [`GcClient`] over the Kubernetes API
#[derive(Clone)]
pub struct GcClientImpl {
    client: Client,
}

impl GcClientImpl {
    /// Create a new GcClientImpl wrapping the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn list<K>(&self, kind: DependentKind) -> Result<Vec<Dependent>, kube::Error>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let list = api
            .list_metadata(&ListParams::default().labels(OWNED_SELECTOR))
            .await?;
        Ok(list
            .items
            .iter()
            .filter_map(|item| Dependent::from_meta(kind, &item.metadata))
            .collect())
    }

    async fn uid<K>(&self, namespace: &str, name: &str) -> Result<Option<String>, kube::Error>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .get_metadata_opt(name)
            .await?
            .and_then(|o| o.metadata.uid))
    }

    async fn uids<K>(&self, namespace: &str) -> Result<Vec<String>, kube::Error>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .list_metadata(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter_map(|o| o.metadata.uid)
            .collect())
    }

    async fn delete<K>(&self, namespace: &str, name: &str) -> Result<(), kube::Error>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(namespace, name, "Dependent already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl GcClient for GcClientImpl {
    async fn list_dependents(&self, kind: DependentKind) -> Result<Vec<Dependent>, kube::Error> {
        match kind {
            DependentKind::Job => self.list::<Job>(kind).await,
            DependentKind::Deployment => self.list::<Deployment>(kind).await,
            DependentKind::Service => self.list::<Service>(kind).await,
            DependentKind::Pod => self.list::<Pod>(kind).await,
        }
    }

    async fn owner_uid(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, kube::Error> {
        match kind {
            ObjectKind::Dataset => self.uid::<Dataset>(namespace, name).await,
            ObjectKind::Model => self.uid::<Model>(namespace, name).await,
            ObjectKind::Server => self.uid::<Server>(namespace, name).await,
            ObjectKind::Notebook => self.uid::<Notebook>(namespace, name).await,
        }
    }

    async fn owner_uids(
        &self,
        kind: ObjectKind,
        namespace: &str,
    ) -> Result<Vec<String>, kube::Error> {
        match kind {
            ObjectKind::Dataset => self.uids::<Dataset>(namespace).await,
            ObjectKind::Model => self.uids::<Model>(namespace).await,
            ObjectKind::Server => self.uids::<Server>(namespace).await,
            ObjectKind::Notebook => self.uids::<Notebook>(namespace).await,
        }
    }

    async fn delete_dependent(&self, dependent: &Dependent) -> Result<(), kube::Error> {
        let (namespace, name) = (dependent.namespace.as_str(), dependent.name.as_str());
        match dependent.kind {
            DependentKind::Job => self.delete::<Job>(namespace, name).await,
            DependentKind::Deployment => self.delete::<Deployment>(namespace, name).await,
            DependentKind::Service => self.delete::<Service>(namespace, name).await,
            DependentKind::Pod => self.delete::<Pod>(namespace, name).await,
        }
    }
}

/// Outcome of one sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Dependents examined
    pub scanned: usize,
    /// Orphans deleted
    pub deleted: usize,
    /// Dependency-index entries dropped for deleted objects
    pub forgotten: usize,
}

/// Whether the owner the dependent was created for still exists
async fn owner_alive(
    client: &dyn GcClient,
    owner: &Owner,
    namespace: &str,
) -> Result<bool, kube::Error> {
    if owner.exact_name {
        let live = client.owner_uid(owner.kind, namespace, &owner.name).await?;
        Ok(live.as_deref() == Some(owner.uid.as_str()))
    } else {
        let live = client.owner_uids(owner.kind, namespace).await?;
        Ok(live.contains(&owner.uid))
    }
}

/// Delete every labelled dependent whose owner is gone, then drop index
/// entries of Kiln objects that no longer exist.
///
/// Dependents whose owner cannot be determined are left alone. A failure on
/// one dependent is logged and the sweep moves on.
pub async fn sweep(
    client: &dyn GcClient,
    index: &DependencyIndex,
) -> Result<SweepReport, kube::Error> {
    let mut report = SweepReport::default();

    for kind in DependentKind::ALL {
        for dependent in client.list_dependents(kind).await? {
            report.scanned += 1;
            let Some(owner) = &dependent.owner else {
                debug!(%kind, namespace = %dependent.namespace, name = %dependent.name, "Dependent has no Kiln owner, skipping");
                continue;
            };

            match owner_alive(client, owner, &dependent.namespace).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, %kind, name = %dependent.name, "Failed to look up owner");
                    continue;
                }
            }

            info!(
                %kind,
                namespace = %dependent.namespace,
                name = %dependent.name,
                owner_kind = %owner.kind,
                owner = %owner.name,
                "Deleting orphaned dependent"
            );
            match client.delete_dependent(&dependent).await {
                Ok(()) => report.deleted += 1,
                Err(e) => warn!(error = %e, %kind, name = %dependent.name, "Failed to delete orphan"),
            }
        }
    }

    report.forgotten = prune_index(client, index).await;
    Ok(report)
}

/// Forget indexed dependents that no longer exist, returning how many
async fn prune_index(client: &dyn GcClient, index: &DependencyIndex) -> usize {
    let mut forgotten = 0;
    for key in index.indexed() {
        match client.owner_uid(key.kind, &key.namespace, &key.name).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(object = %key, "Forgetting dependencies of deleted object");
                index.forget(&key);
                forgotten += 1;
            }
            Err(e) => warn!(error = %e, object = %key, "Failed to look up indexed object"),
        }
    }
    forgotten
}

/// Run [`sweep`] every `interval` until the task is dropped
pub async fn run_gc(client: impl GcClient, index: Arc<DependencyIndex>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match sweep(&client, &index).await {
            Ok(report) if report.deleted > 0 || report.forgotten > 0 => info!(
                scanned = report.scanned,
                deleted = report.deleted,
                forgotten = report.forgotten,
                "GC sweep finished"
            ),
            Ok(report) => debug!(scanned = report.scanned, "GC sweep found no orphans"),
            Err(e) => warn!(error = %e, "GC sweep failed"),
        }
    }
}
