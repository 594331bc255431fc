//! Model reconciler
//!
//! Runs the modeller Job `{name}-modeller`. A Model fine-tuning a base Model
//! waits for the base Model and the training Dataset to be ready, then mounts
//! the base model read-only at `/content/saved-model` and the dataset at
//! `/content/data`. Output lands in `/content/artifacts`.
//!
//! `status.servers` is recomputed on every pass from the Servers that
//! currently reference the Model, so deleted Servers drop out.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use kiln_cloud::BucketUrl;
use kiln_common::crd::{
    condition_reasons, condition_types, ArtifactsStatus, Model, ModelStatus,
};
use kiln_common::{ArtifactObject, ObjectKind};
use kiln_resources::{Role, SizingRequest};

use crate::context::Context;
use crate::index::ObjectKey;
use crate::ReconcileError;

use super::jobs::{dependent_name, run_job, workload_job, JobProgress};
use super::service_account::{ensure_service_account, MODELLER_SERVICE_ACCOUNT};
use super::workload::{WorkloadPod, ARTIFACTS_PATH, DATA_PATH, SAVED_MODEL_PATH};
use super::{
    artifacts_url, gate, object_key, object_namespace, report_invalid, resolve_image,
    ImageResolution,
};

/// Name of the modeller Job of a Model
pub fn modeller_job_name(name: &str) -> String {
    dependent_name(name, "modeller")
}

/// Reconcile a Model
#[instrument(skip(model, ctx), fields(model = %model.name_any()))]
pub async fn reconcile(model: Arc<Model>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let name = model.name_any();
    let namespace = object_namespace(model.as_ref())?;

    let original = model.status.clone().unwrap_or_default();
    let mut status = original.clone();
    let result = drive(&model, &ctx, &namespace, &mut status).await;

    if status != original {
        debug!(ready = status.common.ready, servers = ?status.servers, "Writing model status");
        ctx.kube.patch_model_status(&namespace, &name, &status).await?;
    }
    result
}

async fn drive(
    model: &Model,
    ctx: &Context,
    namespace: &str,
    status: &mut ModelStatus,
) -> Result<Action, ReconcileError> {
    let name = model.name_any();
    let generation = model.meta().generation;

    let live_servers = ctx
        .kube
        .list_servers(namespace)
        .await?
        .into_iter()
        .filter(|server| server.spec.model.name == name)
        .map(|server| server.name_any());
    if status.reconcile_servers(live_servers) {
        debug!(servers = ?status.servers, "Server set changed");
    }

    let mut dependencies = Vec::new();
    if let Some(base) = &model.spec.base_model {
        dependencies.push(ObjectKey::new(ObjectKind::Model, namespace, &base.name));
    }
    if let Some(dataset) = &model.spec.training_dataset {
        dependencies.push(ObjectKey::new(ObjectKind::Dataset, namespace, &dataset.name));
    }
    ctx.index.record(&object_key(model, namespace), dependencies);

    if model.is_ready() {
        return Ok(Action::await_change());
    }

    let workload = &model.spec.workload;
    if let Err(e) = workload.validate(&model.object_key()) {
        return Ok(report_invalid(
            ctx,
            model,
            &mut status.common,
            condition_types::COMPLETE,
            e.to_string(),
        )
        .await);
    }

    let image = match resolve_image(ctx, model, namespace, &mut status.common).await? {
        ImageResolution::Ready(image) => image,
        ImageResolution::Pending(action) => return Ok(action),
    };

    ensure_service_account(ctx, namespace, MODELLER_SERVICE_ACCOUNT, &model.object_ref(&()))
        .await?;

    let mut base_artifacts: Option<BucketUrl> = None;
    if let Some(base) = &model.spec.base_model {
        match ctx.kube.get_model(namespace, &base.name).await? {
            None => {
                return Ok(gate(
                    model,
                    &mut status.common,
                    condition_types::COMPLETE,
                    condition_reasons::BASE_MODEL_NOT_FOUND,
                    format!("Base model {} not found", base.name),
                ))
            }
            Some(base_model) if !base_model.is_ready() => {
                return Ok(gate(
                    model,
                    &mut status.common,
                    condition_types::COMPLETE,
                    condition_reasons::BASE_MODEL_NOT_READY,
                    format!("Base model {} is not ready", base.name),
                ))
            }
            Some(base_model) => {
                base_artifacts = Some(artifacts_url(
                    &ctx.cloud,
                    ObjectKind::Model,
                    namespace,
                    &base.name,
                    base_model.status.as_ref().and_then(|s| s.artifacts.as_ref()),
                ));
            }
        }
    }

    let mut dataset_artifacts: Option<BucketUrl> = None;
    if let Some(dataset_ref) = &model.spec.training_dataset {
        match ctx.kube.get_dataset(namespace, &dataset_ref.name).await? {
            None => {
                return Ok(gate(
                    model,
                    &mut status.common,
                    condition_types::COMPLETE,
                    condition_reasons::DATASET_NOT_FOUND,
                    format!("Dataset {} not found", dataset_ref.name),
                ))
            }
            Some(dataset) if !dataset.is_ready() => {
                return Ok(gate(
                    model,
                    &mut status.common,
                    condition_types::COMPLETE,
                    condition_reasons::DATASET_NOT_READY,
                    format!("Dataset {} is not ready", dataset_ref.name),
                ))
            }
            Some(dataset) => {
                dataset_artifacts = Some(artifacts_url(
                    &ctx.cloud,
                    ObjectKind::Dataset,
                    namespace,
                    &dataset_ref.name,
                    dataset.status.as_ref().and_then(|s| s.artifacts.as_ref()),
                ));
            }
        }
    }

    let plan = match ctx.sizer.plan(
        SizingRequest::new(Role::Trainer)
            .with_size(model.spec.size)
            .with_overrides(workload.resources.as_ref()),
    ) {
        Ok(plan) => plan,
        Err(e) => {
            return Ok(report_invalid(
                ctx,
                model,
                &mut status.common,
                condition_types::COMPLETE,
                e.to_string(),
            )
            .await)
        }
    };

    let artifacts = ctx.cloud.artifact_url(ObjectKind::Model, namespace, &name);
    let mut pod = WorkloadPod::new(
        &ctx.cloud,
        ObjectKind::Model,
        &name,
        &image,
        workload,
        MODELLER_SERVICE_ACCOUNT,
    )
    .owner_uid(model.uid().as_deref())
    .mount("artifacts", artifacts.clone(), ARTIFACTS_PATH, false)
    .resources(&plan);
    if let Some(url) = base_artifacts {
        pod = pod.mount("saved-model", url, SAVED_MODEL_PATH, true);
    }
    if let Some(url) = dataset_artifacts {
        pod = pod.mount("data", url, DATA_PATH, true);
    }
    let job = workload_job(model, namespace, modeller_job_name(&name), pod)?;

    match run_job(ctx, model, namespace, &mut status.common, job).await? {
        JobProgress::Succeeded => {
            status.common.ready = true;
            let recorded = status.artifacts.get_or_insert_with(ArtifactsStatus::default);
            if recorded.url.is_none() {
                recorded.url = Some(artifacts.to_string());
            }
            info!(artifacts = ?recorded.url, generation, "Model ready");
        }
        JobProgress::Running | JobProgress::Failed => status.common.ready = false,
    }
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;

    use k8s_openapi::api::batch::v1::Job;
    use kiln_build::MockJobClient;
    use kiln_common::crd::{
        Dataset, DatasetSpec, DatasetStatus, ModelSize, ModelSpec, ObjectStatus, Server,
        ServerSpec, WorkloadSpec,
    };

    use crate::controller::test_support::{
        completed, context, kube, meta, reference, NAMESPACE,
    };

    fn model(name: &str) -> Model {
        Model {
            metadata: meta(name),
            spec: ModelSpec {
                workload: WorkloadSpec {
                    image: Some("trainer:1".to_string()),
                    ..Default::default()
                },
                size: Some(ModelSize {
                    parameter_count: 125_000_000,
                    parameter_bits: 32,
                }),
                ..Default::default()
            },
            status: None,
        }
    }

    fn fine_tune() -> Model {
        let mut m = model("llama-ft");
        m.spec.base_model = reference("llama");
        m.spec.training_dataset = reference("squad");
        m
    }

    fn ready_model(name: &str) -> Model {
        let mut m = model(name);
        m.status = Some(ModelStatus {
            common: ObjectStatus {
                ready: true,
                ..Default::default()
            },
            artifacts: Some(ArtifactsStatus {
                url: Some("gs://kiln-artifacts/base".to_string()),
            }),
            servers: Vec::new(),
        });
        m
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
                artifacts: ready.then(|| ArtifactsStatus {
                    url: Some("gs://kiln-artifacts/squad".to_string()),
                }),
            }),
        }
    }

    fn server(name: &str, model: &str) -> Server {
        Server {
            metadata: meta(name),
            spec: ServerSpec {
                model: kiln_common::crd::ObjectRef::new(model),
                workload: WorkloadSpec::default(),
            },
            status: None,
        }
    }

    fn complete_reason(status: &ModelStatus) -> String {
        status
            .common
            .condition(condition_types::COMPLETE)
            .map(|c| c.reason.clone())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn story_missing_base_model_gates_the_job() {
        let mut kube = kube();
        kube.expect_list_servers().returning(|_| Ok(vec![]));
        kube.expect_get_model().returning(|_, _| Ok(None));
        kube.expect_patch_model_status()
            .withf(|_, _, status| {
                !status.common.ready
                    && complete_reason(status) == condition_reasons::BASE_MODEL_NOT_FOUND
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut jobs = MockJobClient::new();
        jobs.expect_create_job().never();
        jobs.expect_get_job().never();

        let ctx = context(kube, jobs);
        reconcile(Arc::new(fine_tune()), ctx.clone()).await.unwrap();

        let base = ObjectKey::new(ObjectKind::Model, NAMESPACE, "llama");
        let squad = ObjectKey::new(ObjectKind::Dataset, NAMESPACE, "squad");
        assert_eq!(ctx.index.dependents(&base, ObjectKind::Model), vec!["llama-ft"]);
        assert_eq!(ctx.index.dependents(&squad, ObjectKind::Model), vec!["llama-ft"]);
    }

    #[tokio::test]
    async fn story_unready_dataset_gates_after_ready_base() {
        let mut kube = kube();
        kube.expect_list_servers().returning(|_| Ok(vec![]));
        kube.expect_get_model()
            .returning(|_, _| Ok(Some(ready_model("llama"))));
        kube.expect_get_dataset()
            .returning(|_, _| Ok(Some(dataset(false))));
        kube.expect_patch_model_status()
            .withf(|_, _, status| complete_reason(status) == condition_reasons::DATASET_NOT_READY)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut jobs = MockJobClient::new();
        jobs.expect_create_job().never();

        reconcile(Arc::new(fine_tune()), context(kube, jobs))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_ready_prerequisites_start_the_modeller() {
        let mut kube = kube();
        kube.expect_list_servers().returning(|_| Ok(vec![]));
        kube.expect_get_model()
            .returning(|_, _| Ok(Some(ready_model("llama"))));
        kube.expect_get_dataset()
            .returning(|_, _| Ok(Some(dataset(true))));
        kube.expect_patch_model_status()
            .withf(|_, _, status| complete_reason(status) == condition_reasons::JOB_NOT_COMPLETE)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut jobs = MockJobClient::new();
        jobs.expect_get_job().returning(|_, _| Ok(None));
        jobs.expect_create_job()
            .withf(|_, job: &Job| {
                let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
                let container = &pod.containers[0];
                let mounts = container.volume_mounts.as_ref().unwrap();
                let mounted = |path: &str, ro: bool| {
                    mounts
                        .iter()
                        .any(|m| m.mount_path == path && m.read_only == Some(ro))
                };
                let requests = container
                    .resources
                    .as_ref()
                    .and_then(|r| r.requests.as_ref())
                    .unwrap();
                job.metadata.name.as_deref() == Some("llama-ft-modeller")
                    && pod.service_account_name.as_deref() == Some("modeller")
                    && mounted("/content/saved-model", true)
                    && mounted("/content/data", true)
                    && mounted("/content/artifacts", false)
                    && requests["cpu"].0 == "3"
                    && requests["memory"].0 == "3Gi"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile(Arc::new(fine_tune()), context(kube, jobs))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_completed_modeller_publishes_artifacts() {
        let m = model("llama");
        let mut job = Job::default();
        job.metadata.name = Some(modeller_job_name("llama"));
        job.metadata.annotations =
            Some([("kiln.dev/generation".to_string(), "1".to_string())].into());
        let job = completed(job);

        let mut kube = kube();
        kube.expect_list_servers().returning(|_| Ok(vec![]));
        kube.expect_patch_model_status()
            .withf(|_, _, status| {
                status.common.ready
                    && complete_reason(status) == condition_reasons::JOB_COMPLETE
                    && status
                        .artifacts
                        .as_ref()
                        .and_then(|a| a.url.as_deref())
                        .is_some()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut jobs = MockJobClient::new();
        jobs.expect_get_job()
            .returning(move |_, _| Ok(Some(job.clone())));

        reconcile(Arc::new(m), context(kube, jobs)).await.unwrap();
    }

    #[tokio::test]
    async fn story_deleted_servers_are_pruned_from_a_ready_model() {
        let mut m = ready_model("llama");
        if let Some(status) = m.status.as_mut() {
            status.servers = vec!["api".to_string(), "gone".to_string()];
        }

        let mut kube = kube();
        kube.expect_list_servers().returning(|_| {
            Ok(vec![
                server("api", "llama"),
                server("batch", "llama"),
                server("other", "mistral"),
            ])
        });
        kube.expect_patch_model_status()
            .withf(|_, _, status| status.servers == vec!["api", "batch"])
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut jobs = MockJobClient::new();
        jobs.expect_get_job().never();

        reconcile(Arc::new(m), context(kube, jobs)).await.unwrap();
    }

    #[tokio::test]
    async fn converged_model_makes_no_writes() {
        let mut m = ready_model("llama");
        if let Some(status) = m.status.as_mut() {
            status.servers = vec!["api".to_string()];
        }

        let mut kube = kube();
        kube.expect_list_servers()
            .returning(|_| Ok(vec![server("api", "llama")]));
        kube.expect_patch_model_status().never();
        let mut jobs = MockJobClient::new();
        jobs.expect_get_job().never();

        reconcile(Arc::new(m), context(kube, jobs)).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_model_is_an_invalid_spec() {
        let mut m = model("huge");
        m.spec.size = Some(ModelSize {
            parameter_count: 400_000_000_000,
            parameter_bits: 16,
        });
        m.spec.workload.resources = Some(kiln_common::crd::ResourcesSpec {
            gpu: Some(kiln_common::crd::GpuSpec {
                type_: "nvidia-l4".to_string(),
                count: None,
            }),
            ..Default::default()
        });

        let mut kube = kube();
        kube.expect_list_servers().returning(|_| Ok(vec![]));
        kube.expect_patch_model_status()
            .withf(|_, _, status| complete_reason(status) == condition_reasons::INVALID_SPEC)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut jobs = MockJobClient::new();
        jobs.expect_create_job().never();

        let action = reconcile(Arc::new(m), context(kube, jobs)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
