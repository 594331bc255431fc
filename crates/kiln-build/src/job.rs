//! Builder Job construction
//!
//! One `batch/v1` Job per object builds and pushes its image. The Job name is
//! a pure function of the object, and the target image is recorded in an
//! annotation so an outdated Job can be told apart from the current one.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use kiln_cloud::{BucketUrl, Cloud};
use kiln_common::crd::{BuildSpec, GitSource, ModelSize};
use kiln_common::naming::truncate_label;
use kiln_common::{owner_labels_with_uid, ObjectKind};
use kiln_resources::{Role, Sizer, SizingRequest};

use crate::BuildError;

/// Annotation holding the image a builder Job pushes
pub const TARGET_IMAGE_ANNOTATION: &str = "kiln.dev/target-image";

/// Service account builder pods run as
pub const BUILDER_SERVICE_ACCOUNT: &str = "container-builder";

/// Retries of a failed builder pod before the Job is marked failed
pub const BUILD_BACKOFF_LIMIT: i32 = 2;

const WORKSPACE_VOLUME: &str = "workspace";
const WORKSPACE_PATH: &str = "/workspace";

/// Images used by builder Jobs
#[derive(Clone, Debug)]
pub struct BuilderImages {
    /// Container builder (kaniko executor)
    pub builder: String,
    /// Image providing `git` for the clone init container
    pub git: String,
}

impl Default for BuilderImages {
    fn default() -> Self {
        Self {
            builder: "gcr.io/kaniko-project/executor:v1.23.2".to_string(),
            git: "alpine/git:2.45.2".to_string(),
        }
    }
}

/// Everything needed to describe one builder Job
#[derive(Clone, Debug)]
pub struct BuildJobParams<'a> {
    /// Kind of the object being built
    pub kind: ObjectKind,
    /// Object name
    pub name: &'a str,
    /// Object namespace
    pub namespace: &'a str,
    /// Owner reference back to the object
    pub owner: OwnerReference,
    /// What to build
    pub build: &'a BuildSpec,
    /// Image to push
    pub target_image: &'a str,
    /// Artifact location of the object (uploads live underneath it)
    pub artifact: &'a BucketUrl,
    /// Model size, if declared, for ephemeral storage sizing
    pub size: Option<ModelSize>,
}

/// `{name}-{kind}-container-builder`, truncated to a valid label
pub fn builder_job_name(kind: ObjectKind, name: &str) -> String {
    truncate_label(&format!("{name}-{kind}-container-builder"))
}

/// Image a Job was created to push, from its annotation
pub fn job_target_image(job: &Job) -> Option<&str> {
    job.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(TARGET_IMAGE_ANNOTATION))
        .map(String::as_str)
}

fn clone_container(git: &GitSource, image: &str) -> Container {
    let mut args = vec!["clone".to_string(), "--depth".to_string(), "1".to_string()];
    if let Some(git_ref) = git.git_ref() {
        args.push("--branch".to_string());
        args.push(git_ref.to_string());
    }
    args.push(git.url.clone());
    args.push(WORKSPACE_PATH.to_string());

    Container {
        name: "clone".to_string(),
        image: Some(image.to_string()),
        args: Some(args),
        volume_mounts: Some(vec![VolumeMount {
            name: WORKSPACE_VOLUME.to_string(),
            mount_path: WORKSPACE_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn git_context(git: &GitSource) -> String {
    match git.context_path() {
        "" => format!("dir://{WORKSPACE_PATH}"),
        path => format!("dir://{WORKSPACE_PATH}/{path}"),
    }
}

/// Describe the builder Job for an object.
///
/// Fails with [`BuildError::InvalidBuild`] when the build spec cannot be
/// turned into a Job (empty url, branch and tag together, a path escaping
/// the repository).
pub fn build_job(
    params: &BuildJobParams<'_>,
    cloud: &Cloud,
    sizer: &Sizer,
    images: &BuilderImages,
) -> Result<Job, BuildError> {
    let object = format!("{}/{}/{}", params.kind, params.namespace, params.name);
    params
        .build
        .validate(&object)
        .map_err(|e| BuildError::InvalidBuild {
            object: object.clone(),
            message: e.to_string(),
        })?;

    let mut pod_spec = PodSpec {
        restart_policy: Some("Never".to_string()),
        service_account_name: Some(BUILDER_SERVICE_ACCOUNT.to_string()),
        ..Default::default()
    };
    let mut pod_annotations = BTreeMap::new();
    let mut builder = Container {
        name: "builder".to_string(),
        image: Some(images.builder.clone()),
        ..Default::default()
    };

    let context = match params.build {
        BuildSpec::Git(git) => {
            pod_spec.volumes = Some(vec![Volume {
                name: WORKSPACE_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]);
            pod_spec.init_containers = Some(vec![clone_container(git, &images.git)]);
            builder.volume_mounts = Some(vec![VolumeMount {
                name: WORKSPACE_VOLUME.to_string(),
                mount_path: WORKSPACE_PATH.to_string(),
                ..Default::default()
            }]);
            git_context(git)
        }
        BuildSpec::Upload(_) => {
            let upload = cloud.upload_context(params.artifact);
            if let Some(mount) = &upload.mount {
                cloud.mount_bucket(&mut pod_spec, &mut pod_annotations, &mut builder, mount);
            }
            upload.context
        }
    };

    builder.args = Some(vec![
        format!("--context={context}"),
        "--dockerfile=Dockerfile".to_string(),
        format!("--destination={}", params.target_image),
    ]);

    let plan = sizer.plan(SizingRequest::new(Role::Builder).with_size(params.size))?;
    plan.apply_to(&mut builder, &mut pod_spec);
    pod_spec.containers = vec![builder];

    let labels = owner_labels_with_uid(params.kind, params.name, Some(&params.owner.uid));
    let mut pod_labels = labels.clone();
    pod_labels.extend(cloud.pod_labels());

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(builder_job_name(params.kind, params.name)),
            namespace: Some(params.namespace.to_string()),
            labels: Some(labels),
            annotations: Some(BTreeMap::from([(
                TARGET_IMAGE_ANNOTATION.to_string(),
                params.target_image.to_string(),
            )])),
            owner_references: Some(vec![params.owner.clone()]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(BUILD_BACKOFF_LIMIT),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: (!pod_annotations.is_empty()).then_some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_cloud::{CloudConfig, CloudKind};
    use kiln_common::crd::UploadSource;
    use kiln_common::{OWNER_KIND_LABEL, OWNER_NAME_LABEL};
    use kiln_resources::AcceleratorCatalog;

    fn cloud(kind: CloudKind, bucket: &str) -> Cloud {
        Cloud::new(CloudConfig {
            kind,
            cluster_name: "dev".to_string(),
            artifact_bucket: bucket.parse().unwrap(),
            registry_url: "registry.example/kiln".to_string(),
            principal: None,
            azure_storage_account: None,
            local_root: "/var/lib/kiln/buckets".to_string(),
        })
        .unwrap()
    }

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "kiln.dev/v1".to_string(),
            kind: "Model".to_string(),
            name: "llama".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(true),
            ..Default::default()
        }
    }

    fn job_for(build: &BuildSpec, cloud: &Cloud) -> Result<Job, BuildError> {
        let artifact = cloud.artifact_url(ObjectKind::Model, "research", "llama");
        let sizer = Sizer::new(AcceleratorCatalog::for_cloud(cloud.kind()));
        build_job(
            &BuildJobParams {
                kind: ObjectKind::Model,
                name: "llama",
                namespace: "research",
                owner: owner(),
                build,
                target_image: "registry.example/kiln/dev-model-research-llama:abc",
                artifact: &artifact,
                size: None,
            },
            cloud,
            &sizer,
            &BuilderImages::default(),
        )
    }

    fn builder_args(job: &Job) -> Vec<String> {
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        pod.containers[0].args.clone().unwrap()
    }

    #[test]
    fn story_git_build_clones_into_workspace() {
        let build = BuildSpec::Git(GitSource {
            url: "https://github.com/acme/trainer.git".to_string(),
            tag: Some("v1.2".to_string()),
            path: Some("./images/train".to_string()),
            ..Default::default()
        });
        let job = job_for(&build, &cloud(CloudKind::Gcp, "gs://kiln-artifacts")).unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("llama-model-container-builder"));
        assert_eq!(
            job_target_image(&job),
            Some("registry.example/kiln/dev-model-research-llama:abc")
        );
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[OWNER_KIND_LABEL], "model");
        assert_eq!(labels[OWNER_NAME_LABEL], "llama");
        assert_eq!(job.metadata.owner_references.as_ref().unwrap()[0].uid, "uid-1");

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(2));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("container-builder"));
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

        let clone = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(
            clone.args.as_ref().unwrap(),
            &[
                "clone",
                "--depth",
                "1",
                "--branch",
                "v1.2",
                "https://github.com/acme/trainer.git",
                "/workspace"
            ]
        );
        assert_eq!(
            builder_args(&job),
            vec![
                "--context=dir:///workspace/images/train",
                "--dockerfile=Dockerfile",
                "--destination=registry.example/kiln/dev-model-research-llama:abc",
            ]
        );

        let requests = pod.containers[0]
            .resources
            .as_ref()
            .unwrap()
            .requests
            .as_ref()
            .unwrap();
        assert_eq!(requests["cpu"].0, "2");
        assert_eq!(requests["memory"].0, "12Gi");
    }

    #[test]
    fn story_upload_build_reads_the_uploaded_tarball() {
        let build = BuildSpec::Upload(UploadSource {
            md5_checksum: "5d41402abc4b2a76b9719d911017c592".to_string(),
            request_id: "r1".to_string(),
        });
        let gcp = cloud(CloudKind::Gcp, "gs://kiln-artifacts/prod");
        let job = job_for(&build, &gcp).unwrap();
        let artifact = gcp.artifact_url(ObjectKind::Model, "research", "llama");
        assert_eq!(
            builder_args(&job)[0],
            format!(
                "--context=gs://kiln-artifacts/{}/uploads/latest.tar.gz",
                artifact.prefix
            )
        );
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert!(pod.init_containers.is_none());

        let local = cloud(CloudKind::Local, "file:///kiln");
        let job = job_for(&build, &local).unwrap();
        assert_eq!(
            builder_args(&job)[0],
            "--context=tar:///upload/uploads/latest.tar.gz"
        );
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == "/upload" && m.read_only == Some(true)));
    }

    #[test]
    fn invalid_git_specs_are_rejected() {
        let gcp = cloud(CloudKind::Gcp, "gs://kiln-artifacts");
        for git in [
            GitSource::default(),
            GitSource {
                url: "https://github.com/acme/x.git".to_string(),
                branch: Some("main".to_string()),
                tag: Some("v1".to_string()),
                path: None,
            },
            GitSource {
                url: "https://github.com/acme/x.git".to_string(),
                path: Some("../escape".to_string()),
                ..Default::default()
            },
        ] {
            let err = job_for(&BuildSpec::Git(git), &gcp).unwrap_err();
            assert!(matches!(err, BuildError::InvalidBuild { .. }));
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn long_names_are_truncated_deterministically() {
        let name = "a".repeat(80);
        let first = builder_job_name(ObjectKind::Dataset, &name);
        assert!(first.len() <= 63);
        assert_eq!(first, builder_job_name(ObjectKind::Dataset, &name));
        assert_ne!(first, builder_job_name(ObjectKind::Model, &name));
    }
}
