//! Notebook reconciler
//!
//! A Notebook is a single pod `{name}-notebook` on port 8888 with its Model
//! mounted read-only at `/content/saved-model` and its Dataset at
//! `/content/data`. Suspending deletes the pod and keeps the object.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use kiln_common::crd::{condition_reasons, condition_types, Notebook, NotebookStatus};
use kiln_common::events::{actions, reasons};
use kiln_common::{ArtifactObject, ObjectKind, NOTEBOOK_PORT};
use kiln_resources::{Role, SizingRequest};

use crate::context::Context;
use crate::index::ObjectKey;
use crate::ReconcileError;

use super::jobs::{dependent_name, generation_annotations, recorded_generation};
use super::service_account::{ensure_service_account, NOTEBOOK_SERVICE_ACCOUNT};
use super::workload::{WorkloadPod, DATA_PATH, SAVED_MODEL_PATH};
use super::{
    artifacts_url, gate, object_key, object_namespace, owner_reference, report_invalid,
    resolve_image, set_condition, ImageResolution,
};

/// Name of the pod of a Notebook
pub fn notebook_pod_name(name: &str) -> String {
    dependent_name(name, "notebook")
}

/// Reconcile a Notebook
#[instrument(skip(notebook, ctx), fields(notebook = %notebook.name_any()))]
pub async fn reconcile(
    notebook: Arc<Notebook>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = notebook.name_any();
    let namespace = object_namespace(notebook.as_ref())?;

    let original = notebook.status.clone().unwrap_or_default();
    let mut status = original.clone();
    let result = if notebook.spec.suspend {
        suspend(&notebook, &ctx, &namespace, &mut status).await
    } else {
        drive(&notebook, &ctx, &namespace, &mut status).await
    };

    if status != original {
        debug!(ready = status.common.ready, "Writing notebook status");
        ctx.kube
            .patch_notebook_status(&namespace, &name, &status)
            .await?;
    }
    result
}

async fn suspend(
    notebook: &Notebook,
    ctx: &Context,
    namespace: &str,
    status: &mut NotebookStatus,
) -> Result<Action, ReconcileError> {
    let pod_name = notebook_pod_name(&notebook.name_any());
    // nothing to wake a suspended notebook for
    ctx.index.forget(&object_key(notebook, namespace));

    if ctx.kube.get_pod(namespace, &pod_name).await?.is_some() {
        info!(pod = %pod_name, "Suspending notebook");
        ctx.kube.delete_pod(namespace, &pod_name).await?;
        ctx.events
            .publish(
                &notebook.object_ref(&()),
                EventType::Normal,
                reasons::SUSPENDED,
                actions::SUSPEND,
                Some(format!("Deleted pod {pod_name}")),
            )
            .await;
    }

    status.common.ready = false;
    set_condition(
        &mut status.common,
        condition_types::SERVING,
        false,
        condition_reasons::SUSPENDED,
        "Notebook is suspended",
        notebook.meta().generation,
    );
    Ok(Action::await_change())
}

async fn drive(
    notebook: &Notebook,
    ctx: &Context,
    namespace: &str,
    status: &mut NotebookStatus,
) -> Result<Action, ReconcileError> {
    let name = notebook.name_any();
    let workload = &notebook.spec.workload;

    let model_ref = notebook.spec.model.as_ref().map(|m| m.name.clone());
    let dataset_ref = notebook.spec.dataset.as_ref().map(|d| d.name.clone());
    ctx.index.record(
        &object_key(notebook, namespace),
        model_ref
            .iter()
            .map(|m| ObjectKey::new(ObjectKind::Model, namespace, m.as_str()))
            .chain(
                dataset_ref
                    .iter()
                    .map(|d| ObjectKey::new(ObjectKind::Dataset, namespace, d.as_str())),
            ),
    );

    if let Err(e) = workload.validate(&notebook.object_key()) {
        return Ok(report_invalid(
            ctx,
            notebook,
            &mut status.common,
            condition_types::SERVING,
            e.to_string(),
        )
        .await);
    }

    let image = match resolve_image(ctx, notebook, namespace, &mut status.common).await? {
        ImageResolution::Ready(image) => image,
        ImageResolution::Pending(action) => return Ok(action),
    };

    ensure_service_account(
        ctx,
        namespace,
        NOTEBOOK_SERVICE_ACCOUNT,
        &notebook.object_ref(&()),
    )
    .await?;

    let model = match &model_ref {
        None => None,
        Some(model_name) => match ctx.kube.get_model(namespace, model_name).await? {
            None => {
                return Ok(gate(
                    notebook,
                    &mut status.common,
                    condition_types::SERVING,
                    condition_reasons::MODEL_NOT_FOUND,
                    format!("Model {model_name} not found"),
                ))
            }
            Some(model) if !model.is_ready() => {
                return Ok(gate(
                    notebook,
                    &mut status.common,
                    condition_types::SERVING,
                    condition_reasons::MODEL_NOT_READY,
                    format!("Model {model_name} is not ready"),
                ))
            }
            Some(model) => Some(model),
        },
    };

    let dataset = match &dataset_ref {
        None => None,
        Some(dataset_name) => match ctx.kube.get_dataset(namespace, dataset_name).await? {
            None => {
                return Ok(gate(
                    notebook,
                    &mut status.common,
                    condition_types::SERVING,
                    condition_reasons::DATASET_NOT_FOUND,
                    format!("Dataset {dataset_name} not found"),
                ))
            }
            Some(dataset) if !dataset.is_ready() => {
                return Ok(gate(
                    notebook,
                    &mut status.common,
                    condition_types::SERVING,
                    condition_reasons::DATASET_NOT_READY,
                    format!("Dataset {dataset_name} is not ready"),
                ))
            }
            Some(dataset) => Some(dataset),
        },
    };

    let plan = match ctx.sizer.plan(
        SizingRequest::new(Role::Notebook)
            .with_size(model.as_ref().and_then(|m| m.spec.size))
            .with_overrides(workload.resources.as_ref()),
    ) {
        Ok(plan) => plan,
        Err(e) => {
            return Ok(report_invalid(
                ctx,
                notebook,
                &mut status.common,
                condition_types::SERVING,
                e.to_string(),
            )
            .await)
        }
    };

    let mut pod = WorkloadPod::new(
        &ctx.cloud,
        ObjectKind::Notebook,
        &name,
        &image,
        workload,
        NOTEBOOK_SERVICE_ACCOUNT,
    )
    .owner_uid(notebook.uid().as_deref())
    .port("jupyter", NOTEBOOK_PORT)
    .resources(&plan);
    if let Some(model) = &model {
        let url = artifacts_url(
            &ctx.cloud,
            ObjectKind::Model,
            namespace,
            &model.name_any(),
            model.status.as_ref().and_then(|s| s.artifacts.as_ref()),
        );
        pod = pod.mount("saved-model", url, SAVED_MODEL_PATH, true);
    }
    if let Some(dataset) = &dataset {
        let url = artifacts_url(
            &ctx.cloud,
            ObjectKind::Dataset,
            namespace,
            &dataset.name_any(),
            dataset.status.as_ref().and_then(|s| s.artifacts.as_ref()),
        );
        pod = pod.mount("data", url, DATA_PATH, true);
    }

    let pod_name = notebook_pod_name(&name);
    let (mut metadata, spec) = pod.restart_policy("Always").into_parts();
    metadata.name = Some(pod_name.clone());
    metadata.namespace = Some(namespace.to_string());
    metadata
        .annotations
        .get_or_insert_with(Default::default)
        .extend(generation_annotations(notebook));
    metadata.owner_references = Some(vec![owner_reference(notebook)?]);
    let desired = Pod {
        metadata,
        spec: Some(spec),
        ..Default::default()
    };

    let generation = notebook.meta().generation;
    let ready = match ctx.kube.get_pod(namespace, &pod_name).await? {
        None => {
            info!(pod = %pod_name, "Creating notebook pod");
            ctx.kube.create_pod(namespace, &desired).await?;
            set_condition(
                &mut status.common,
                condition_types::SERVING,
                false,
                condition_reasons::POD_NOT_READY,
                format!("Pod {pod_name} created"),
                generation,
            );
            false
        }
        Some(live) if recorded_generation(&live.metadata) != recorded_generation(&desired.metadata) => {
            info!(pod = %pod_name, "Replacing notebook pod from an earlier generation");
            ctx.kube.delete_pod(namespace, &pod_name).await?;
            set_condition(
                &mut status.common,
                condition_types::SERVING,
                false,
                condition_reasons::POD_NOT_READY,
                format!("Replacing pod {pod_name}"),
                generation,
            );
            false
        }
        Some(live) if pod_ready(&live) => {
            set_condition(
                &mut status.common,
                condition_types::SERVING,
                true,
                condition_reasons::POD_READY,
                format!("Pod {pod_name} is ready"),
                generation,
            );
            true
        }
        Some(_) => {
            set_condition(
                &mut status.common,
                condition_types::SERVING,
                false,
                condition_reasons::POD_NOT_READY,
                format!("Waiting for pod {pod_name}"),
                generation,
            );
            false
        }
    };
    status.common.ready = ready;
    Ok(Action::await_change())
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use kiln_build::MockJobClient;
    use kiln_common::crd::{
        Dataset, DatasetSpec, DatasetStatus, NotebookSpec, ObjectStatus, WorkloadSpec,
    };

    use crate::controller::test_support::{context, kube, meta, reference, NAMESPACE};

    fn notebook() -> Notebook {
        Notebook {
            metadata: meta("scratch"),
            spec: NotebookSpec {
                model: None,
                dataset: reference("squad"),
                suspend: false,
                workload: WorkloadSpec {
                    image: Some("jupyter/scipy:2024".to_string()),
                    ..Default::default()
                },
            },
            status: None,
        }
    }

    fn dataset(ready: bool) -> Dataset {
        Dataset {
            metadata: meta("squad"),
            spec: DatasetSpec::default(),
            status: Some(DatasetStatus {
                common: ObjectStatus {
                    ready,
                    ..Default::default()
                },
                artifacts: None,
            }),
        }
    }

    fn live_pod(generation: &str, ready: bool) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.annotations =
            Some([("kiln.dev/generation".to_string(), generation.to_string())].into());
        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    fn serving_reason(status: &NotebookStatus) -> String {
        status
            .common
            .condition(condition_types::SERVING)
            .map(|c| c.reason.clone())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn story_notebook_waits_for_unready_dataset() {
        let mut kube = kube();
        kube.expect_get_dataset()
            .returning(|_, _| Ok(Some(dataset(false))));
        kube.expect_create_pod().never();
        kube.expect_patch_notebook_status()
            .withf(|_, _, status| serving_reason(status) == condition_reasons::DATASET_NOT_READY)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = context(kube, MockJobClient::new());
        reconcile(Arc::new(notebook()), ctx.clone()).await.unwrap();

        let squad = ObjectKey::new(ObjectKind::Dataset, NAMESPACE, "squad");
        assert_eq!(
            ctx.index.dependents(&squad, ObjectKind::Notebook),
            vec!["scratch"]
        );
    }

    #[tokio::test]
    async fn story_ready_dataset_starts_the_notebook_pod() {
        let mut kube = kube();
        kube.expect_get_dataset()
            .returning(|_, _| Ok(Some(dataset(true))));
        kube.expect_get_pod().returning(|_, _| Ok(None));
        kube.expect_create_pod()
            .withf(|namespace, pod| {
                let spec = pod.spec.as_ref().unwrap();
                let container = &spec.containers[0];
                namespace == NAMESPACE
                    && pod.metadata.name.as_deref() == Some("scratch-notebook")
                    && spec.service_account_name.as_deref() == Some("notebook")
                    && container.ports.as_ref().unwrap()[0].container_port == 8888
                    && container
                        .volume_mounts
                        .as_ref()
                        .unwrap()
                        .iter()
                        .any(|m| m.mount_path == "/content/data" && m.read_only == Some(true))
                    && recorded_generation(&pod.metadata) == Some("1")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_patch_notebook_status()
            .withf(|_, _, status| {
                !status.common.ready && serving_reason(status) == condition_reasons::POD_NOT_READY
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        reconcile(Arc::new(notebook()), context(kube, MockJobClient::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ready_pod_makes_the_notebook_ready() {
        let mut kube = kube();
        kube.expect_get_dataset()
            .returning(|_, _| Ok(Some(dataset(true))));
        kube.expect_get_pod()
            .returning(|_, _| Ok(Some(live_pod("1", true))));
        kube.expect_create_pod().never();
        kube.expect_delete_pod().never();
        kube.expect_patch_notebook_status()
            .withf(|_, _, status| {
                status.common.ready && serving_reason(status) == condition_reasons::POD_READY
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        reconcile(Arc::new(notebook()), context(kube, MockJobClient::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_spec_change_replaces_the_pod() {
        let mut nb = notebook();
        nb.metadata.generation = Some(2);

        let mut kube = kube();
        kube.expect_get_dataset()
            .returning(|_, _| Ok(Some(dataset(true))));
        kube.expect_get_pod()
            .returning(|_, _| Ok(Some(live_pod("1", true))));
        kube.expect_delete_pod()
            .withf(|_, name| name == "scratch-notebook")
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_create_pod().never();
        kube.expect_patch_notebook_status()
            .returning(|_, _, _| Ok(()));

        reconcile(Arc::new(nb), context(kube, MockJobClient::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_suspend_deletes_the_pod_once() {
        let written = Arc::new(std::sync::Mutex::new(None::<NotebookStatus>));
        let sink = written.clone();
        let deleted = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let gone = deleted.clone();
        let probe = deleted.clone();

        let mut nb = notebook();
        nb.spec.suspend = true;

        let mut kube = kube();
        kube.expect_get_dataset().never();
        kube.expect_get_pod().returning(move |_, _| {
            if probe.load(std::sync::atomic::Ordering::SeqCst) {
                Ok(None)
            } else {
                Ok(Some(live_pod("1", true)))
            }
        });
        kube.expect_delete_pod().times(1).returning(move |_, _| {
            gone.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        kube.expect_patch_notebook_status()
            .times(1)
            .returning(move |_, _, status| {
                *sink.lock().unwrap() = Some(status.clone());
                Ok(())
            });
        let ctx = context(kube, MockJobClient::new());

        reconcile(Arc::new(nb.clone()), ctx.clone()).await.unwrap();
        let status = written.lock().unwrap().clone().unwrap();
        assert!(!status.common.ready);
        assert_eq!(serving_reason(&status), condition_reasons::SUSPENDED);
        assert!(deleted.load(std::sync::atomic::Ordering::SeqCst));

        nb.status = Some(status);
        reconcile(Arc::new(nb), ctx).await.unwrap();
    }
}
