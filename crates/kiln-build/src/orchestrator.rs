//! Build orchestration state machine
//!
//! Per object: `NoBuildNeeded`, or `AwaitingUpload` (upload builds only)
//! then `BuildRunning` then `Built`, with `Failed` and `InvalidSpec` as
//! terminal states until the spec changes.
//!
//! The orchestrator only mutates the status it is handed. The calling
//! reconciler owns the single status write at the end of its pass.

use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use kiln_cloud::Cloud;
use kiln_common::crd::{
    condition_reasons, condition_types, BuildSpec, Condition, ConditionStatus, ObjectStatus,
};
use kiln_common::events::{actions, reasons};
use kiln_common::{ArtifactObject, EventPublisher};
use kiln_resources::Sizer;
use kiln_sci::SciClient;

use crate::client::{job_failed, job_succeeded, JobClient};
use crate::job::{build_job, builder_job_name, job_target_image, BuildJobParams, BuilderImages};
use crate::upload::{reconcile_upload, UploadState};
use crate::BuildError;

/// Result of one orchestration pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The object names a prebuilt image
    NoBuildNeeded {
        /// The declared image
        image: String,
    },
    /// Waiting for the client to upload the build context
    AwaitingUpload,
    /// A builder Job is running (or was just created or replaced)
    BuildRunning,
    /// The image for the current build spec has been pushed
    Built {
        /// The built image
        image: String,
    },
    /// The builder Job for the current build spec failed
    Failed {
        /// Failure description
        message: String,
    },
    /// The build spec cannot be built
    InvalidSpec {
        /// What is wrong
        message: String,
    },
}

impl BuildOutcome {
    /// Image the workload can run, once there is one
    pub fn image(&self) -> Option<&str> {
        match self {
            Self::NoBuildNeeded { image } | Self::Built { image } => Some(image),
            _ => None,
        }
    }
}

/// Drives images from build specs
pub struct BuildOrchestrator {
    cloud: Arc<Cloud>,
    sizer: Arc<Sizer>,
    sci: Arc<dyn SciClient>,
    jobs: Arc<dyn JobClient>,
    events: Arc<dyn EventPublisher>,
    images: BuilderImages,
}

impl BuildOrchestrator {
    /// Create an orchestrator
    pub fn new(
        cloud: Arc<Cloud>,
        sizer: Arc<Sizer>,
        sci: Arc<dyn SciClient>,
        jobs: Arc<dyn JobClient>,
        events: Arc<dyn EventPublisher>,
        images: BuilderImages,
    ) -> Self {
        Self {
            cloud,
            sizer,
            sci,
            jobs,
            events,
            images,
        }
    }

    /// Image the current build spec of `obj` is pushed to
    pub fn target_image<K: ArtifactObject>(&self, obj: &K, build: &BuildSpec) -> String {
        self.cloud.built_image_url(
            K::KIND,
            obj.namespace().as_deref().unwrap_or_default(),
            &obj.name_any(),
            &build.content_hash(),
        )
    }

    async fn publish<K: ArtifactObject>(
        &self,
        obj: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.events
            .publish(&obj.object_ref(&()), type_, reason, action, Some(note))
            .await;
    }

    /// Advance the build of `obj` by one step, recording progress in `status`
    #[instrument(skip_all, fields(object = %obj.object_key()))]
    pub async fn reconcile<K: ArtifactObject>(
        &self,
        obj: &K,
        status: &mut ObjectStatus,
    ) -> Result<BuildOutcome, BuildError> {
        let workload = obj.workload();
        if let Some(image) = &workload.image {
            return Ok(BuildOutcome::NoBuildNeeded {
                image: image.clone(),
            });
        }

        let key = obj.object_key();
        let generation = obj.meta().generation;
        let Some(build) = &workload.build else {
            let message = "one of image or build must be set".to_string();
            mark_built(status, false, condition_reasons::INVALID_SPEC, &message, generation);
            return Ok(BuildOutcome::InvalidSpec { message });
        };
        if let Err(e) = build.validate(&key) {
            let message = e.to_string();
            mark_built(status, false, condition_reasons::INVALID_SPEC, &message, generation);
            return Ok(BuildOutcome::InvalidSpec { message });
        }

        let target = self.target_image(obj, build);
        if status.container_image.as_deref() == Some(target.as_str())
            && status.is_true(condition_types::BUILT)
        {
            return Ok(BuildOutcome::Built { image: target });
        }

        let namespace = obj
            .namespace()
            .ok_or_else(|| BuildError::MissingMetadata {
                object: key.clone(),
                field: "namespace",
            })?;
        let name = obj.name_any();
        let artifact = self.cloud.artifact_url(K::KIND, &namespace, &name);

        if let Some(upload) = build.upload() {
            match reconcile_upload(self.sci.as_ref(), &artifact, upload, status, generation)
                .await?
            {
                UploadState::Found => {}
                UploadState::Awaiting { issued_url } => {
                    if issued_url {
                        self.publish(
                            obj,
                            EventType::Normal,
                            reasons::UPLOAD_URL_ISSUED,
                            actions::UPLOAD,
                            format!("Issued upload URL for request {}", upload.request_id),
                        )
                        .await;
                    }
                    return Ok(BuildOutcome::AwaitingUpload);
                }
            }
        }

        let job_name = builder_job_name(K::KIND, &name);
        if let Some(job) = self.jobs.get_job(&namespace, &job_name).await? {
            return self
                .track_job(obj, &job, &target, status, generation)
                .await;
        }

        let owner = obj
            .controller_owner_ref(&())
            .ok_or_else(|| BuildError::MissingMetadata {
                object: key.clone(),
                field: "uid",
            })?;
        let params = BuildJobParams {
            kind: K::KIND,
            name: &name,
            namespace: &namespace,
            owner,
            build,
            target_image: &target,
            artifact: &artifact,
            size: obj.model_size(),
        };
        let job = match build_job(&params, &self.cloud, &self.sizer, &self.images) {
            Ok(job) => job,
            Err(BuildError::InvalidBuild { message, .. }) => {
                mark_built(status, false, condition_reasons::INVALID_SPEC, &message, generation);
                return Ok(BuildOutcome::InvalidSpec { message });
            }
            Err(e) => return Err(e),
        };

        self.jobs.create_job(&namespace, &job).await?;
        info!(job = %job_name, image = %target, "Created builder job");
        self.publish(
            obj,
            EventType::Normal,
            reasons::BUILD_STARTED,
            actions::BUILD,
            format!("Building {target} in job {job_name}"),
        )
        .await;
        mark_built(
            status,
            false,
            condition_reasons::JOB_NOT_COMPLETE,
            &format!("Builder job {job_name} is running"),
            generation,
        );
        Ok(BuildOutcome::BuildRunning)
    }

    async fn track_job<K: ArtifactObject>(
        &self,
        obj: &K,
        job: &Job,
        target: &str,
        status: &mut ObjectStatus,
        generation: Option<i64>,
    ) -> Result<BuildOutcome, BuildError> {
        let job_name = job.name_any();
        let namespace = job.namespace().unwrap_or_default();

        if job_target_image(job) != Some(target) {
            info!(
                job = %job_name,
                previous = ?job_target_image(job),
                image = %target,
                "Build spec changed, replacing builder job"
            );
            self.jobs.delete_job(&namespace, &job_name).await?;
            self.publish(
                obj,
                EventType::Normal,
                reasons::BUILD_SUPERSEDED,
                actions::BUILD,
                format!("Deleted builder job {job_name} for an outdated build"),
            )
            .await;
            mark_built(
                status,
                false,
                condition_reasons::JOB_NOT_COMPLETE,
                &format!("Replacing outdated builder job {job_name}"),
                generation,
            );
            return Ok(BuildOutcome::BuildRunning);
        }

        if job_succeeded(job) {
            let newly_built = status.container_image.as_deref() != Some(target);
            status.container_image = Some(target.to_string());
            mark_built(
                status,
                true,
                condition_reasons::JOB_COMPLETE,
                &format!("Built {target}"),
                generation,
            );
            if newly_built {
                info!(job = %job_name, image = %target, "Build complete");
                self.publish(
                    obj,
                    EventType::Normal,
                    reasons::BUILD_SUCCEEDED,
                    actions::BUILD,
                    format!("Built {target}"),
                )
                .await;
            }
            return Ok(BuildOutcome::Built {
                image: target.to_string(),
            });
        }

        if job_failed(job) {
            let message = format!("Builder job {job_name} failed");
            let changed = mark_built(
                status,
                false,
                condition_reasons::JOB_FAILED,
                &message,
                generation,
            );
            if changed {
                warn!(job = %job_name, image = %target, "Build failed");
                self.publish(
                    obj,
                    EventType::Warning,
                    reasons::BUILD_FAILED,
                    actions::BUILD,
                    message.clone(),
                )
                .await;
            }
            return Ok(BuildOutcome::Failed { message });
        }

        debug!(job = %job_name, "Builder job still running");
        mark_built(
            status,
            false,
            condition_reasons::JOB_NOT_COMPLETE,
            &format!("Builder job {job_name} is running"),
            generation,
        );
        Ok(BuildOutcome::BuildRunning)
    }
}

fn mark_built(
    status: &mut ObjectStatus,
    built: bool,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) -> bool {
    status.set_condition(
        Condition::new(
            condition_types::BUILT,
            ConditionStatus::from(built),
            reason,
            message,
        )
        .observed(generation),
    )
}
