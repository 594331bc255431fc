//! Kubernetes Event recording for Kiln controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that reconcilers can emit Events visible via `kubectl describe`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource.
    ///
    /// * `reason` - Machine-readable reason (e.g. "BuildStarted")
    /// * `action` - What action was taken (e.g. "Build")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as the given controller name
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// A container build job was created
    pub const BUILD_STARTED: &str = "BuildStarted";
    /// A container build finished and the image was published
    pub const BUILD_SUCCEEDED: &str = "BuildSucceeded";
    /// A container build job exhausted its retries
    pub const BUILD_FAILED: &str = "BuildFailed";
    /// A stale build job was replaced because the target image changed
    pub const BUILD_SUPERSEDED: &str = "BuildSuperseded";
    /// A signed upload URL was issued
    pub const UPLOAD_URL_ISSUED: &str = "UploadURLIssued";
    /// A workload job (loader/modeller) was created
    pub const JOB_CREATED: &str = "JobCreated";
    /// A workload job failed
    pub const JOB_FAILED: &str = "JobFailed";
    /// The object's spec is invalid
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// A cloud identity was bound to a service account
    pub const IDENTITY_BOUND: &str = "IdentityBound";
    /// A notebook pod was deleted because of suspension
    pub const SUSPENDED: &str = "Suspended";
}

/// Well-known event action strings.
pub mod actions {
    /// Building a container image
    pub const BUILD: &str = "Build";
    /// Handling an upload handshake
    pub const UPLOAD: &str = "Upload";
    /// Running a batch job
    pub const RUN: &str = "Run";
    /// Binding cloud identity
    pub const BIND: &str = "Bind";
    /// Validating the object
    pub const VALIDATE: &str = "Validate";
    /// Suspending a workload
    pub const SUSPEND: &str = "Suspend";
}
