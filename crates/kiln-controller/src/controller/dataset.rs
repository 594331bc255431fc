//! Dataset reconciler
//!
//! Runs the loader Job `{name}-data-loader` with the artifact bucket mounted
//! read-write. Once the Job completes the Dataset is ready and its artifact
//! URL is fixed for good.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use kiln_common::crd::{condition_types, ArtifactsStatus, Dataset, DatasetStatus};
use kiln_common::{ArtifactObject, ObjectKind};
use kiln_resources::{Role, SizingRequest};

use crate::context::Context;
use crate::ReconcileError;

use super::jobs::{dependent_name, run_job, workload_job, JobProgress};
use super::service_account::{ensure_service_account, DATA_LOADER_SERVICE_ACCOUNT};
use super::workload::{WorkloadPod, ARTIFACTS_PATH};
use super::{object_namespace, report_invalid, resolve_image, ImageResolution};

/// Name of the loader Job of a Dataset
pub fn loader_job_name(name: &str) -> String {
    dependent_name(name, "data-loader")
}

/// Reconcile a Dataset
#[instrument(skip(dataset, ctx), fields(dataset = %dataset.name_any()))]
pub async fn reconcile(dataset: Arc<Dataset>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let name = dataset.name_any();
    let namespace = object_namespace(dataset.as_ref())?;

    if dataset.is_ready() {
        debug!("Dataset is ready, nothing to do");
        return Ok(Action::await_change());
    }

    let original = dataset.status.clone().unwrap_or_default();
    let mut status = original.clone();
    let result = drive(&dataset, &ctx, &namespace, &mut status).await;

    if status != original {
        debug!(ready = status.common.ready, "Writing dataset status");
        ctx.kube
            .patch_dataset_status(&namespace, &name, &status)
            .await?;
    }
    result
}

async fn drive(
    dataset: &Dataset,
    ctx: &Context,
    namespace: &str,
    status: &mut DatasetStatus,
) -> Result<Action, ReconcileError> {
    let name = dataset.name_any();
    let workload = &dataset.spec.workload;

    if let Err(e) = workload.validate(&dataset.object_key()) {
        return Ok(report_invalid(
            ctx,
            dataset,
            &mut status.common,
            condition_types::COMPLETE,
            e.to_string(),
        )
        .await);
    }

    let image = match resolve_image(ctx, dataset, namespace, &mut status.common).await? {
        ImageResolution::Ready(image) => image,
        ImageResolution::Pending(action) => return Ok(action),
    };

    ensure_service_account(
        ctx,
        namespace,
        DATA_LOADER_SERVICE_ACCOUNT,
        &dataset.object_ref(&()),
    )
    .await?;

    let plan = match ctx.sizer.plan(
        SizingRequest::new(Role::Trainer).with_overrides(workload.resources.as_ref()),
    ) {
        Ok(plan) => plan,
        Err(e) => {
            return Ok(report_invalid(
                ctx,
                dataset,
                &mut status.common,
                condition_types::COMPLETE,
                e.to_string(),
            )
            .await)
        }
    };

    let artifacts = ctx.cloud.artifact_url(ObjectKind::Dataset, namespace, &name);
    let pod = WorkloadPod::new(
        &ctx.cloud,
        ObjectKind::Dataset,
        &name,
        &image,
        workload,
        DATA_LOADER_SERVICE_ACCOUNT,
    )
    .owner_uid(dataset.uid().as_deref())
    .mount("artifacts", artifacts.clone(), ARTIFACTS_PATH, false)
    .env("DATASET_FILENAME", &dataset.spec.filename)
    .resources(&plan);
    let job = workload_job(dataset, namespace, loader_job_name(&name), pod)?;

    if run_job(ctx, dataset, namespace, &mut status.common, job).await? == JobProgress::Succeeded {
        status.common.ready = true;
        let recorded = status.artifacts.get_or_insert_with(ArtifactsStatus::default);
        if recorded.url.is_none() {
            recorded.url = Some(artifacts.to_string());
        }
        info!(artifacts = ?recorded.url, "Dataset ready");
    } else {
        status.common.ready = false;
    }
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::batch::v1::Job;
    use kiln_build::MockJobClient;
    use kiln_common::crd::{
        condition_reasons, DatasetSpec, ObjectStatus, WorkloadSpec,
    };

    use crate::controller::test_support::{completed, context, failed, kube, meta, NAMESPACE};

    fn dataset() -> Dataset {
        Dataset {
            metadata: meta("squad"),
            spec: DatasetSpec {
                filename: "squad.jsonl".to_string(),
                workload: WorkloadSpec {
                    image: Some("loader:1".to_string()),
                    params: BTreeMap::from([("split".to_string(), serde_json::json!("train"))]),
                    ..Default::default()
                },
            },
            status: None,
        }
    }

    fn loader_job(dataset: &Dataset) -> Job {
        let mut job = Job::default();
        job.metadata.name = Some(loader_job_name(&dataset.name_any()));
        job.metadata.annotations =
            Some([("kiln.dev/generation".to_string(), "1".to_string())].into());
        job
    }

    #[tokio::test]
    async fn story_first_pass_creates_the_loader_job() {
        let mut jobs = MockJobClient::new();
        jobs.expect_get_job().returning(|_, _| Ok(None));
        jobs.expect_create_job()
            .withf(|namespace, job| {
                let spec = job.spec.as_ref().unwrap();
                let pod = spec.template.spec.as_ref().unwrap();
                let container = &pod.containers[0];
                namespace == NAMESPACE
                    && job.metadata.name.as_deref() == Some("squad-data-loader")
                    && job.metadata.owner_references.as_ref().unwrap()[0].kind == "Dataset"
                    && pod.service_account_name.as_deref() == Some("data-loader")
                    && container.image.as_deref() == Some("loader:1")
                    && container
                        .volume_mounts
                        .as_ref()
                        .unwrap()
                        .iter()
                        .any(|m| m.mount_path == "/content/artifacts" && m.read_only == Some(false))
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut kube = kube();
        kube.expect_patch_dataset_status()
            .withf(|_, name, status| {
                let cond = status.common.condition(condition_types::COMPLETE).unwrap();
                name == "squad"
                    && !status.common.ready
                    && cond.reason == condition_reasons::JOB_NOT_COMPLETE
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile(Arc::new(dataset()), context(kube, jobs))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn story_completed_job_makes_the_dataset_ready() {
        let ds = dataset();
        let job = completed(loader_job(&ds));
        let mut jobs = MockJobClient::new();
        jobs.expect_get_job()
            .returning(move |_, _| Ok(Some(job.clone())));
        jobs.expect_create_job().never();

        let mut kube = kube();
        kube.expect_patch_dataset_status()
            .withf(|_, _, status| {
                status.common.ready
                    && status.common.is_true(condition_types::COMPLETE)
                    && status
                        .artifacts
                        .as_ref()
                        .and_then(|a| a.url.as_deref())
                        .is_some_and(|url| url.starts_with("gs://kiln-artifacts/"))
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        reconcile(Arc::new(ds), context(kube, jobs)).await.unwrap();
    }

    #[tokio::test]
    async fn ready_dataset_is_left_alone() {
        let mut ds = dataset();
        ds.status = Some(DatasetStatus {
            common: ObjectStatus {
                ready: true,
                ..Default::default()
            },
            artifacts: Some(ArtifactsStatus {
                url: Some("gs://kiln-artifacts/fixed".to_string()),
            }),
        });

        let mut jobs = MockJobClient::new();
        jobs.expect_get_job().never();
        let mut kube = kube();
        kube.expect_patch_dataset_status().never();

        reconcile(Arc::new(ds), context(kube, jobs)).await.unwrap();
    }

    #[tokio::test]
    async fn story_failed_job_is_terminal_and_written_once() {
        let ds = dataset();
        let job = failed(loader_job(&ds));
        let mut jobs = MockJobClient::new();
        let live = job.clone();
        jobs.expect_get_job()
            .returning(move |_, _| Ok(Some(live.clone())));
        jobs.expect_create_job().never();
        jobs.expect_delete_job().never();

        let written = Arc::new(std::sync::Mutex::new(None::<DatasetStatus>));
        let mut kube = kube();
        let sink = written.clone();
        kube.expect_patch_dataset_status()
            .times(1)
            .returning(move |_, _, status| {
                *sink.lock().unwrap() = Some(status.clone());
                Ok(())
            });
        let ctx = context(kube, jobs);

        reconcile(Arc::new(ds.clone()), ctx.clone()).await.unwrap();
        let status = written.lock().unwrap().clone().unwrap();
        assert_eq!(
            status.common.condition(condition_types::COMPLETE).unwrap().reason,
            condition_reasons::JOB_FAILED
        );

        // converged: a second pass over the written status makes no writes
        let mut again = ds;
        again.status = Some(status);
        reconcile(Arc::new(again), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn image_and_build_together_are_rejected() {
        let mut ds = dataset();
        ds.spec.workload.build = Some(kiln_common::crd::BuildSpec::Upload(
            kiln_common::crd::UploadSource {
                md5_checksum: "5d41402abc4b2a76b9719d911017c592".to_string(),
                request_id: "r1".to_string(),
            },
        ));

        let mut jobs = MockJobClient::new();
        jobs.expect_get_job().never();
        let mut kube = kube();
        kube.expect_patch_dataset_status()
            .withf(|_, _, status| {
                status.common.condition(condition_types::COMPLETE).unwrap().reason
                    == condition_reasons::INVALID_SPEC
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile(Arc::new(ds), context(kube, jobs)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
