//! Reconcilers for the four Kiln kinds
//!
//! Every reconciler follows the same pass: validate the spec, resolve the
//! container image through the build orchestrator, ensure the workload service
//! account, gate on referenced objects, size the workload, upsert dependents
//! and reflect their readiness into conditions. The status is written once at
//! the end of the pass, and only when it changed.

pub mod dataset;
mod jobs;
pub mod model;
pub mod notebook;
pub mod server;
pub mod service_account;
pub mod workload;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, warn};

use kiln_build::job::BUILDER_SERVICE_ACCOUNT;
use kiln_build::BuildOutcome;
use kiln_cloud::{BucketUrl, Cloud};
use kiln_common::crd::{
    condition_reasons, ArtifactsStatus, Condition, ConditionStatus, ObjectStatus,
};
use kiln_common::events::{actions, reasons};
use kiln_common::{ArtifactObject, ObjectKind};

use crate::context::Context;
use crate::index::ObjectKey;
use crate::ReconcileError;

use self::service_account::ensure_service_account;

/// Requeue delay for retryable errors
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Error policy shared by every kind.
///
/// Retryable errors requeue after 30 seconds. Anything else waits for the
/// object to change.
pub fn error_policy<K: ArtifactObject>(
    obj: Arc<K>,
    error: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        object = %obj.object_key(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(RETRY_DELAY)
    } else {
        Action::await_change()
    }
}

/// Run `reconcile` under the configured per-call deadline
pub async fn with_deadline<K, F, Fut>(
    obj: Arc<K>,
    ctx: Arc<Context>,
    reconcile: F,
) -> Result<Action, ReconcileError>
where
    K: ArtifactObject,
    F: FnOnce(Arc<K>, Arc<Context>) -> Fut,
    Fut: Future<Output = Result<Action, ReconcileError>>,
{
    let deadline = ctx.config.reconcile_timeout;
    let object = obj.object_key();
    match tokio::time::timeout(deadline, reconcile(obj, ctx)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(%object, seconds = deadline.as_secs(), "Reconcile deadline exceeded");
            Err(ReconcileError::Timeout {
                object,
                seconds: deadline.as_secs(),
            })
        }
    }
}

/// Namespace of a Kiln object
pub(crate) fn object_namespace<K: ArtifactObject>(obj: &K) -> Result<String, ReconcileError> {
    obj.namespace()
        .ok_or_else(|| ReconcileError::validation(obj.object_key(), "object must be namespaced"))
}

/// Controller owner reference pointing at `obj`
pub(crate) fn owner_reference<K: ArtifactObject>(
    obj: &K,
) -> Result<OwnerReference, ReconcileError> {
    obj.controller_owner_ref(&())
        .ok_or_else(|| ReconcileError::validation(obj.object_key(), "object has no uid"))
}

/// Index key of `obj`
pub(crate) fn object_key<K: ArtifactObject>(obj: &K, namespace: &str) -> ObjectKey {
    ObjectKey::new(K::KIND, namespace, obj.name_any())
}

/// Set a condition, returning whether it changed
pub(crate) fn set_condition(
    status: &mut ObjectStatus,
    type_: &str,
    ok: bool,
    reason: &str,
    message: impl Into<String>,
    generation: Option<i64>,
) -> bool {
    status.set_condition(
        Condition::new(type_, ConditionStatus::from(ok), reason, message).observed(generation),
    )
}

/// Record a spec the reconciler cannot act on. Not retried.
pub(crate) async fn report_invalid<K: ArtifactObject>(
    ctx: &Context,
    obj: &K,
    status: &mut ObjectStatus,
    condition_type: &str,
    message: String,
) -> Action {
    status.ready = false;
    let changed = set_condition(
        status,
        condition_type,
        false,
        condition_reasons::INVALID_SPEC,
        message.clone(),
        obj.meta().generation,
    );
    if changed {
        warn!(object = %obj.object_key(), %message, "Invalid spec");
        ctx.events
            .publish(
                &obj.object_ref(&()),
                EventType::Warning,
                reasons::INVALID_SPEC,
                actions::VALIDATE,
                Some(message),
            )
            .await;
    }
    Action::await_change()
}

/// Hold the object at a prerequisite that is missing or not ready yet
pub(crate) fn gate<K: ArtifactObject>(
    obj: &K,
    status: &mut ObjectStatus,
    condition_type: &str,
    reason: &str,
    message: String,
) -> Action {
    debug!(object = %obj.object_key(), reason, %message, "Waiting on prerequisite");
    status.ready = false;
    set_condition(
        status,
        condition_type,
        false,
        reason,
        message,
        obj.meta().generation,
    );
    Action::await_change()
}

/// Where the image stands after one orchestration pass
pub(crate) enum ImageResolution {
    /// The workload can run this image
    Ready(String),
    /// Nothing more to do this pass
    Pending(Action),
}

/// Resolve the container image of `obj`, running the build orchestrator
pub(crate) async fn resolve_image<K: ArtifactObject>(
    ctx: &Context,
    obj: &K,
    namespace: &str,
    status: &mut ObjectStatus,
) -> Result<ImageResolution, ReconcileError> {
    if obj.workload().build.is_some() {
        ensure_service_account(ctx, namespace, BUILDER_SERVICE_ACCOUNT, &obj.object_ref(&()))
            .await?;
    }

    let outcome = ctx.builds.reconcile(obj, status).await?;
    Ok(match outcome {
        BuildOutcome::NoBuildNeeded { image } | BuildOutcome::Built { image } => {
            ImageResolution::Ready(image)
        }
        BuildOutcome::AwaitingUpload => {
            status.ready = false;
            ImageResolution::Pending(Action::requeue(ctx.config.upload_poll_interval))
        }
        BuildOutcome::BuildRunning
        | BuildOutcome::Failed { .. }
        | BuildOutcome::InvalidSpec { .. } => {
            status.ready = false;
            ImageResolution::Pending(Action::await_change())
        }
    })
}

/// Artifact location of an object: the recorded URL when there is one,
/// otherwise the deterministic location for its identity
pub(crate) fn artifacts_url(
    cloud: &Cloud,
    kind: ObjectKind,
    namespace: &str,
    name: &str,
    recorded: Option<&ArtifactsStatus>,
) -> BucketUrl {
    recorded
        .and_then(|a| a.url.as_deref())
        .and_then(|url| url.parse().ok())
        .unwrap_or_else(|| cloud.artifact_url(kind, namespace, name))
}
