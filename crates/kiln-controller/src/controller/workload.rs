//! Pod templates shared by loader Jobs, modeller Jobs, server Deployments and
//! notebook Pods

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, DownwardAPIVolumeFile, DownwardAPIVolumeSource, EnvVar,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use kiln_cloud::{BucketMount, BucketUrl, Cloud};
use kiln_common::crd::WorkloadSpec;
use kiln_common::{owner_labels, ObjectKind, OWNER_UID_LABEL};
use kiln_resources::ResourcePlan;

/// Pod annotation carrying the workload params as JSON
pub const PARAMS_ANNOTATION: &str = "kiln.dev/params";

/// Where the params document appears inside the container
pub const PARAMS_PATH: &str = "/content/params.json";

/// Where an object's own artifacts are mounted
pub const ARTIFACTS_PATH: &str = "/content/artifacts";

/// Where a referenced Model's artifacts are mounted
pub const SAVED_MODEL_PATH: &str = "/content/saved-model";

/// Where a referenced Dataset's artifacts are mounted
pub const DATA_PATH: &str = "/content/data";

const PARAMS_VOLUME: &str = "params";

/// Pod template under construction
pub struct WorkloadPod<'a> {
    cloud: &'a Cloud,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    spec: PodSpec,
    container: Container,
}

impl<'a> WorkloadPod<'a> {
    /// Start a pod running `image` with the workload's command, env and params
    pub fn new(
        cloud: &'a Cloud,
        kind: ObjectKind,
        owner: &str,
        image: &str,
        workload: &WorkloadSpec,
        service_account: &str,
    ) -> Self {
        let mut labels = owner_labels(kind, owner);
        labels.extend(cloud.pod_labels());

        let env = workload
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(workload.param_env())
            .chain([("PARAMS_PATH".to_string(), PARAMS_PATH.to_string())])
            .map(|(name, value)| EnvVar {
                name,
                value: Some(value),
                ..Default::default()
            })
            .collect();

        let container = Container {
            name: kind.as_str().to_string(),
            image: Some(image.to_string()),
            command: workload.command.clone(),
            env: Some(env),
            volume_mounts: Some(vec![VolumeMount {
                name: PARAMS_VOLUME.to_string(),
                mount_path: PARAMS_PATH.to_string(),
                sub_path: Some("params.json".to_string()),
                read_only: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let spec = PodSpec {
            service_account_name: Some(service_account.to_string()),
            volumes: Some(vec![Volume {
                name: PARAMS_VOLUME.to_string(),
                downward_api: Some(DownwardAPIVolumeSource {
                    items: Some(vec![DownwardAPIVolumeFile {
                        path: "params.json".to_string(),
                        field_ref: Some(ObjectFieldSelector {
                            field_path: format!("metadata.annotations['{PARAMS_ANNOTATION}']"),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        };

        Self {
            cloud,
            labels,
            annotations: BTreeMap::from([(
                PARAMS_ANNOTATION.to_string(),
                workload.params_json(),
            )]),
            spec,
            container,
        }
    }

    /// Mount a bucket prefix
    pub fn mount(mut self, volume: &str, url: BucketUrl, path: &str, read_only: bool) -> Self {
        let mount = BucketMount {
            volume_name: volume.to_string(),
            url,
            mount_path: path.to_string(),
            read_only,
        };
        self.cloud.mount_bucket(
            &mut self.spec,
            &mut self.annotations,
            &mut self.container,
            &mount,
        );
        self
    }

    /// Expose a container port
    pub fn port(mut self, name: &str, port: u16) -> Self {
        self.container
            .ports
            .get_or_insert_with(Vec::new)
            .push(ContainerPort {
                name: Some(name.to_string()),
                container_port: i32::from(port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        self
    }

    /// Add an environment variable
    pub fn env(mut self, name: &str, value: &str) -> Self {
        self.container.env.get_or_insert_with(Vec::new).push(EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        });
        self
    }

    /// Apply a resource plan
    pub fn resources(mut self, plan: &ResourcePlan) -> Self {
        plan.apply_to(&mut self.container, &mut self.spec);
        self
    }

    /// Set the pod restart policy
    pub fn restart_policy(mut self, policy: &str) -> Self {
        self.spec.restart_policy = Some(policy.to_string());
        self
    }

    /// Label the pod with the uid of the object that owns it
    pub fn owner_uid(mut self, uid: Option<&str>) -> Self {
        if let Some(uid) = uid {
            self.labels
                .insert(OWNER_UID_LABEL.to_string(), uid.to_string());
        }
        self
    }

    /// Labels the pod carries, for selectors
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Pod metadata and spec
    pub fn into_parts(mut self) -> (ObjectMeta, PodSpec) {
        self.spec.containers = vec![self.container];
        let meta = ObjectMeta {
            labels: Some(self.labels),
            annotations: Some(self.annotations),
            ..Default::default()
        };
        (meta, self.spec)
    }

    /// Pod template for Jobs and Deployments
    pub fn into_template(self) -> PodTemplateSpec {
        let (metadata, spec) = self.into_parts();
        PodTemplateSpec {
            metadata: Some(metadata),
            spec: Some(spec),
        }
    }
}
