//! Loader and modeller Jobs

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use kiln_build::client::{job_failed, job_succeeded};
use kiln_common::crd::{condition_reasons, condition_types, ObjectStatus};
use kiln_common::events::{actions, reasons};
use kiln_common::naming::truncate_label;
use kiln_common::{owner_labels_with_uid, ArtifactObject};

use crate::context::Context;
use crate::ReconcileError;

use super::workload::WorkloadPod;
use super::{owner_reference, set_condition};

/// Annotation recording the object generation a dependent was built from
pub const GENERATION_ANNOTATION: &str = "kiln.dev/generation";

/// Retries of a workload Job before it is marked failed
pub const WORKLOAD_BACKOFF_LIMIT: i32 = 2;

/// Deterministic dependent name: `{name}-{suffix}`, truncated to 63 chars
pub fn dependent_name(name: &str, suffix: &str) -> String {
    truncate_label(&format!("{name}-{suffix}"))
}

/// Generation recorded on a dependent, if any
pub(crate) fn recorded_generation(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(GENERATION_ANNOTATION))
        .map(String::as_str)
}

/// Annotations stamping the current generation of `obj`
pub(crate) fn generation_annotations<K: ArtifactObject>(obj: &K) -> BTreeMap<String, String> {
    BTreeMap::from([(
        GENERATION_ANNOTATION.to_string(),
        obj.meta().generation.unwrap_or_default().to_string(),
    )])
}

/// A run-to-completion Job for `obj`
pub(crate) fn workload_job<K: ArtifactObject>(
    obj: &K,
    namespace: &str,
    name: String,
    pod: WorkloadPod<'_>,
) -> Result<Job, ReconcileError> {
    let template = pod.restart_policy("Never").into_template();
    Ok(Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(owner_labels_with_uid(
                K::KIND,
                &obj.name_any(),
                obj.meta().uid.as_deref(),
            )),
            annotations: Some(generation_annotations(obj)),
            owner_references: Some(vec![owner_reference(obj)?]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(WORKLOAD_BACKOFF_LIMIT),
            template,
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Where a workload Job stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum JobProgress {
    Running,
    Succeeded,
    Failed,
}

/// Create `desired` if absent and reflect the live Job into `Complete`.
///
/// A Job left over from an earlier generation that has not succeeded is
/// deleted; its deletion re-triggers the owner, which then creates the
/// replacement.
pub(crate) async fn run_job<K: ArtifactObject>(
    ctx: &Context,
    obj: &K,
    namespace: &str,
    status: &mut ObjectStatus,
    desired: Job,
) -> Result<JobProgress, ReconcileError> {
    let generation = obj.meta().generation;
    let job_name = desired.name_any();

    let Some(live) = ctx.jobs.get_job(namespace, &job_name).await? else {
        info!(object = %obj.object_key(), job = %job_name, "Creating job");
        ctx.jobs.create_job(namespace, &desired).await?;
        ctx.events
            .publish(
                &obj.object_ref(&()),
                EventType::Normal,
                reasons::JOB_CREATED,
                actions::RUN,
                Some(format!("Created job {job_name}")),
            )
            .await;
        set_condition(
            status,
            condition_types::COMPLETE,
            false,
            condition_reasons::JOB_NOT_COMPLETE,
            format!("Job {job_name} created"),
            generation,
        );
        return Ok(JobProgress::Running);
    };

    if job_succeeded(&live) {
        set_condition(
            status,
            condition_types::COMPLETE,
            true,
            condition_reasons::JOB_COMPLETE,
            format!("Job {job_name} completed"),
            generation,
        );
        return Ok(JobProgress::Succeeded);
    }

    if recorded_generation(&live.metadata) != recorded_generation(&desired.metadata) {
        info!(object = %obj.object_key(), job = %job_name, "Replacing job from an earlier generation");
        ctx.jobs.delete_job(namespace, &job_name).await?;
        set_condition(
            status,
            condition_types::COMPLETE,
            false,
            condition_reasons::JOB_NOT_COMPLETE,
            format!("Replacing job {job_name}"),
            generation,
        );
        return Ok(JobProgress::Running);
    }

    if job_failed(&live) {
        let changed = set_condition(
            status,
            condition_types::COMPLETE,
            false,
            condition_reasons::JOB_FAILED,
            format!("Job {job_name} failed"),
            generation,
        );
        if changed {
            warn!(object = %obj.object_key(), job = %job_name, "Job failed");
            ctx.events
                .publish(
                    &obj.object_ref(&()),
                    EventType::Warning,
                    reasons::JOB_FAILED,
                    actions::RUN,
                    Some(format!("Job {job_name} failed")),
                )
                .await;
        }
        return Ok(JobProgress::Failed);
    }

    set_condition(
        status,
        condition_types::COMPLETE,
        false,
        condition_reasons::JOB_NOT_COMPLETE,
        format!("Waiting for job {job_name}"),
        generation,
    );
    Ok(JobProgress::Running)
}
