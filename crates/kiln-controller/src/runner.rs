//! Controller runner - builds one controller future per Kiln kind
//!
//! Each controller owns the Jobs, Deployments, Services and Pods its
//! reconciler creates, and watches the Kiln kinds it depends on through the
//! [`DependencyIndex`](crate::index::DependencyIndex) so that a dependency
//! becoming ready re-triggers the objects waiting on it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};

use kiln_common::crd::{Dataset, Model, Notebook, Server};
use kiln_common::{ArtifactObject, ObjectKind, OWNER_KIND_LABEL};

use crate::context::Context;
use crate::controller::{dataset, error_policy, model, notebook, server, with_deadline};
use crate::index::{DependencyIndex, ObjectKey};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Default number of concurrent reconciles per kind
pub const DEFAULT_CONCURRENCY: u16 = 4;

fn watcher() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Watcher over dependents labelled as owned by `kind`
fn owned_by(kind: ObjectKind) -> WatcherConfig {
    watcher().labels(&format!("{OWNER_KIND_LABEL}={kind}"))
}

/// Map a changed dependency to the objects of kind `K` waiting on it
fn dependents_of<W, K>(
    index: Arc<DependencyIndex>,
) -> impl Fn(W) -> Vec<ObjectRef<K>> + Send + Sync + 'static
where
    W: ArtifactObject,
    K: ArtifactObject,
{
    move |changed: W| {
        let Some(namespace) = changed.namespace() else {
            return vec![];
        };
        let key = ObjectKey::new(W::KIND, namespace.as_str(), changed.name_any());
        let affected = index.dependents(&key, K::KIND);
        if !affected.is_empty() {
            tracing::debug!(
                dependency = %key,
                kind = %K::KIND,
                affected_count = affected.len(),
                "Triggering re-reconciliation of dependents"
            );
        }
        affected
            .into_iter()
            .map(|name| ObjectRef::<K>::new(&name).within(&namespace))
            .collect()
    }
}

/// Build the four controller futures.
///
/// Each runs at most `concurrency` reconciles at a time, with kube-runtime
/// serialising reconciles of the same object.
pub fn build_controllers(
    client: Client,
    ctx: Arc<Context>,
    concurrency: u16,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let config = || controller::Config::default().concurrency(concurrency);
    let index = ctx.index.clone();

    let jobs: Api<Job> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let datasets: Api<Dataset> = Api::all(client.clone());
    let models: Api<Model> = Api::all(client.clone());
    let servers: Api<Server> = Api::all(client.clone());
    let notebooks: Api<Notebook> = Api::all(client);

    let dataset_ctrl = Controller::new(datasets.clone(), watcher())
        .with_config(config())
        .owns(jobs.clone(), owned_by(ObjectKind::Dataset))
        .shutdown_on_signal()
        .run(
            |obj, ctx| with_deadline(obj, ctx, dataset::reconcile),
            error_policy::<Dataset>,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("Dataset"));

    let model_ctrl = Controller::new(models.clone(), watcher())
        .with_config(config())
        .owns(jobs.clone(), owned_by(ObjectKind::Model))
        .watches(
            models.clone(),
            watcher(),
            dependents_of::<Model, Model>(index.clone()),
        )
        .watches(
            datasets.clone(),
            watcher(),
            dependents_of::<Dataset, Model>(index.clone()),
        )
        .watches(servers.clone(), watcher(), |server: Server| {
            let namespace = server.namespace()?;
            Some(ObjectRef::<Model>::new(&server.spec.model.name).within(&namespace))
        })
        .shutdown_on_signal()
        .run(
            |obj, ctx| with_deadline(obj, ctx, model::reconcile),
            error_policy::<Model>,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("Model"));

    let server_ctrl = Controller::new(servers, watcher())
        .with_config(config())
        .owns(jobs.clone(), owned_by(ObjectKind::Server))
        .owns(deployments, owned_by(ObjectKind::Server))
        .owns(services, owned_by(ObjectKind::Server))
        .watches(
            models.clone(),
            watcher(),
            dependents_of::<Model, Server>(index.clone()),
        )
        .shutdown_on_signal()
        .run(
            |obj, ctx| with_deadline(obj, ctx, server::reconcile),
            error_policy::<Server>,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("Server"));

    let notebook_ctrl = Controller::new(notebooks, watcher())
        .with_config(config())
        .owns(jobs, owned_by(ObjectKind::Notebook))
        .owns(pods, owned_by(ObjectKind::Notebook))
        .watches(
            models,
            watcher(),
            dependents_of::<Model, Notebook>(index.clone()),
        )
        .watches(
            datasets,
            watcher(),
            dependents_of::<Dataset, Notebook>(index),
        )
        .shutdown_on_signal()
        .run(
            |obj, ctx| with_deadline(obj, ctx, notebook::reconcile),
            error_policy::<Notebook>,
            ctx,
        )
        .for_each(log_reconcile_result("Notebook"));

    vec![
        Box::pin(dataset_ctrl),
        Box::pin(model_ctrl),
        Box::pin(server_ctrl),
        Box::pin(notebook_ctrl),
    ]
}

/// Create a closure for logging reconciliation results
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
