//! The active cloud and everything derived from it

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    CSIVolumeSource, Container, HostPathVolumeSource, PodSpec, Volume, VolumeMount,
};
use kiln_common::naming::{deterministic_hash, sanitize};
use kiln_common::ObjectKind;

use crate::{BucketScheme, BucketUrl, CloudError, CloudKind};

/// Object name of the uploaded build context, relative to the artifact prefix
pub const UPLOAD_OBJECT: &str = "uploads/latest.tar.gz";

/// Operator-level cloud settings
#[derive(Clone, Debug)]
pub struct CloudConfig {
    /// Active backend
    pub kind: CloudKind,
    /// Cluster name, prefixed onto built image names
    pub cluster_name: String,
    /// Root of all artifact storage
    pub artifact_bucket: BucketUrl,
    /// Registry built images are pushed to
    pub registry_url: String,
    /// Cloud identity workloads run as (GCP service account email, AWS role
    /// ARN, Azure managed identity client id)
    pub principal: Option<String>,
    /// Azure storage account holding the artifact container
    pub azure_storage_account: Option<String>,
    /// Host directory backing buckets on local clusters
    pub local_root: String,
}

/// A bucket to mount into a pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketMount {
    /// Pod volume name
    pub volume_name: String,
    /// Bucket and prefix to mount
    pub url: BucketUrl,
    /// Path inside the container
    pub mount_path: String,
    /// Mount read-only
    pub read_only: bool,
}

/// How the container builder reaches an uploaded build context
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadContext {
    /// Builder `--context` value
    pub context: String,
    /// Volume the builder needs mounted to read the context, if any
    pub mount: Option<BucketMount>,
}

/// Resolved cloud configuration
#[derive(Clone, Debug)]
pub struct Cloud {
    config: CloudConfig,
}

impl Cloud {
    /// Validate the configuration against the active backend
    pub fn new(config: CloudConfig) -> Result<Self, CloudError> {
        if config.artifact_bucket.scheme.cloud() != config.kind {
            return Err(CloudError::SchemeMismatch {
                url: config.artifact_bucket.to_string(),
                cloud: config.kind.to_string(),
            });
        }
        if config.kind == CloudKind::Azure && config.azure_storage_account.is_none() {
            return Err(CloudError::MissingSetting {
                setting: "azure storage account",
                cloud: config.kind.to_string(),
            });
        }
        if config.registry_url.trim().is_empty() {
            return Err(CloudError::MissingSetting {
                setting: "registry url",
                cloud: config.kind.to_string(),
            });
        }
        Ok(Self { config })
    }

    /// Active backend
    pub fn kind(&self) -> CloudKind {
        self.config.kind
    }

    /// Cluster name
    pub fn cluster_name(&self) -> &str {
        &self.config.cluster_name
    }

    /// Cloud identity workloads run as
    pub fn principal(&self) -> Option<&str> {
        self.config.principal.as_deref()
    }

    /// Artifact location of an object: `<bucket-url>/<sha256(kind/ns/name)[..16]>`
    pub fn artifact_url(&self, kind: ObjectKind, namespace: &str, name: &str) -> BucketUrl {
        let key = format!("{kind}/{namespace}/{name}");
        self.config
            .artifact_bucket
            .join(&deterministic_hash(&key, 16))
    }

    /// Image reference a build of this object is pushed to
    pub fn built_image_url(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        build_hash: &str,
    ) -> String {
        format!(
            "{}/{}-{}-{}-{}:{}",
            self.config.registry_url.trim_end_matches('/'),
            sanitize(&self.config.cluster_name),
            kind,
            sanitize(namespace),
            sanitize(name),
            build_hash
        )
    }

    /// Builder context for an upload stored under `artifact`
    pub fn upload_context(&self, artifact: &BucketUrl) -> UploadContext {
        let object = artifact.object(UPLOAD_OBJECT);
        match artifact.scheme {
            BucketScheme::Gs | BucketScheme::S3 => UploadContext {
                context: format!("{}://{}/{}", artifact.scheme.as_str(), artifact.bucket, object),
                mount: None,
            },
            BucketScheme::Az => UploadContext {
                context: format!(
                    "https://{}.blob.core.windows.net/{}/{}",
                    self.config.azure_storage_account.as_deref().unwrap_or_default(),
                    artifact.bucket,
                    object
                ),
                mount: None,
            },
            BucketScheme::File => UploadContext {
                context: format!("tar:///upload/{UPLOAD_OBJECT}"),
                mount: Some(BucketMount {
                    volume_name: "upload".to_string(),
                    url: artifact.clone(),
                    mount_path: "/upload".to_string(),
                    read_only: true,
                }),
            },
        }
    }

    /// Mount a bucket prefix into a container.
    ///
    /// Adds the pod volume (replacing one of the same name), the container
    /// mount and any pod annotations the storage driver requires.
    pub fn mount_bucket(
        &self,
        pod_spec: &mut PodSpec,
        pod_annotations: &mut BTreeMap<String, String>,
        container: &mut Container,
        mount: &BucketMount,
    ) {
        let url = &mount.url;
        let mut sub_path = None;

        let volume = match url.scheme {
            BucketScheme::Gs => {
                pod_annotations.insert("gke-gcsfuse/volumes".to_string(), "true".to_string());
                let mut options = vec!["implicit-dirs".to_string()];
                if !url.prefix.is_empty() {
                    options.push(format!("only-dir={}", url.prefix));
                }
                csi_volume(
                    &mount.volume_name,
                    "gcsfuse.csi.storage.gke.io",
                    mount.read_only,
                    [
                        ("bucketName", url.bucket.clone()),
                        ("mountOptions", options.join(",")),
                    ],
                )
            }
            BucketScheme::S3 => {
                let mut options = vec!["allow-delete".to_string()];
                if !url.prefix.is_empty() {
                    options.push(format!("prefix={}/", url.prefix));
                }
                csi_volume(
                    &mount.volume_name,
                    "s3.csi.aws.com",
                    mount.read_only,
                    [
                        ("bucketName", url.bucket.clone()),
                        ("mountOptions", options.join(",")),
                    ],
                )
            }
            BucketScheme::Az => {
                if !url.prefix.is_empty() {
                    sub_path = Some(url.prefix.clone());
                }
                let mut volume = csi_volume(
                    &mount.volume_name,
                    "blob.csi.azure.com",
                    mount.read_only,
                    [
                        ("containerName", url.bucket.clone()),
                        (
                            "storageAccount",
                            self.config
                                .azure_storage_account
                                .clone()
                                .unwrap_or_default(),
                        ),
                        ("protocol", "fuse2".to_string()),
                    ],
                );
                if let (Some(client_id), Some(csi)) = (self.principal(), volume.csi.as_mut()) {
                    csi.volume_attributes
                        .get_or_insert_with(BTreeMap::new)
                        .insert("clientID".to_string(), client_id.to_string());
                }
                volume
            }
            BucketScheme::File => {
                let mut path = format!(
                    "{}/{}",
                    self.config.local_root.trim_end_matches('/'),
                    url.bucket
                );
                if !url.prefix.is_empty() {
                    path = format!("{path}/{}", url.prefix);
                }
                Volume {
                    name: mount.volume_name.clone(),
                    host_path: Some(HostPathVolumeSource {
                        path,
                        type_: Some("DirectoryOrCreate".to_string()),
                    }),
                    ..Default::default()
                }
            }
        };

        let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
        volumes.retain(|v| v.name != mount.volume_name);
        volumes.push(volume);

        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        mounts.retain(|m| m.mount_path != mount.mount_path);
        mounts.push(VolumeMount {
            name: mount.volume_name.clone(),
            mount_path: mount.mount_path.clone(),
            read_only: Some(mount.read_only),
            sub_path,
            ..Default::default()
        });
    }

    /// Annotations binding a Kubernetes service account to the cloud principal
    pub fn service_account_annotations(&self) -> BTreeMap<String, String> {
        let key = match self.config.kind {
            CloudKind::Gcp => "iam.gke.io/gcp-service-account",
            CloudKind::Aws => "eks.amazonaws.com/role-arn",
            CloudKind::Azure => "azure.workload.identity/client-id",
            CloudKind::Local => return BTreeMap::new(),
        };
        self.principal()
            .map(|p| BTreeMap::from([(key.to_string(), p.to_string())]))
            .unwrap_or_default()
    }

    /// Labels a pod needs for its service account identity to be injected
    pub fn pod_labels(&self) -> BTreeMap<String, String> {
        match self.config.kind {
            CloudKind::Azure => BTreeMap::from([(
                "azure.workload.identity/use".to_string(),
                "true".to_string(),
            )]),
            _ => BTreeMap::new(),
        }
    }
}

fn csi_volume<const N: usize>(
    name: &str,
    driver: &str,
    read_only: bool,
    attributes: [(&str, String); N],
) -> Volume {
    Volume {
        name: name.to_string(),
        csi: Some(CSIVolumeSource {
            driver: driver.to_string(),
            read_only: Some(read_only),
            volume_attributes: Some(
                attributes
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud(kind: CloudKind, bucket: &str) -> Cloud {
        Cloud::new(CloudConfig {
            kind,
            cluster_name: "Prod".to_string(),
            artifact_bucket: bucket.parse().unwrap(),
            registry_url: "registry.example.com/kiln/".to_string(),
            principal: Some("builder@proj.iam.gserviceaccount.com".to_string()),
            azure_storage_account: Some("kilnstore".to_string()),
            local_root: "/var/lib/kiln/buckets".to_string(),
        })
        .unwrap()
    }

    fn mount(url: BucketUrl, read_only: bool) -> BucketMount {
        BucketMount {
            volume_name: "artifacts".to_string(),
            url,
            mount_path: "/content/artifacts".to_string(),
            read_only,
        }
    }

    #[test]
    fn story_artifact_urls_are_stable_per_object() {
        let gcp = cloud(CloudKind::Gcp, "gs://kiln/root");
        let a = gcp.artifact_url(ObjectKind::Model, "default", "llama");
        let b = gcp.artifact_url(ObjectKind::Model, "default", "llama");
        let c = gcp.artifact_url(ObjectKind::Dataset, "default", "llama");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.prefix.starts_with("root/"));
        assert_eq!(a.prefix.len(), "root/".len() + 16);
    }

    #[test]
    fn built_image_names_carry_cluster_kind_and_hash() {
        let gcp = cloud(CloudKind::Gcp, "gs://kiln");
        assert_eq!(
            gcp.built_image_url(ObjectKind::Server, "team-a", "api", "0123abcd"),
            "registry.example.com/kiln/prod-server-team-a-api:0123abcd"
        );
    }

    #[test]
    fn bucket_scheme_must_match_cloud() {
        let err = Cloud::new(CloudConfig {
            kind: CloudKind::Aws,
            cluster_name: "c".to_string(),
            artifact_bucket: "gs://kiln".parse().unwrap(),
            registry_url: "r".to_string(),
            principal: None,
            azure_storage_account: None,
            local_root: "/tmp".to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, CloudError::SchemeMismatch { .. }));
    }

    #[test]
    fn gcs_mount_adds_fuse_annotation_and_only_dir() {
        let gcp = cloud(CloudKind::Gcp, "gs://kiln");
        let mut pod = PodSpec::default();
        let mut annotations = BTreeMap::new();
        let mut container = Container::default();
        let url = gcp.artifact_url(ObjectKind::Dataset, "default", "squad");
        gcp.mount_bucket(&mut pod, &mut annotations, &mut container, &mount(url.clone(), false));
        // mounting twice must not duplicate the volume
        gcp.mount_bucket(&mut pod, &mut annotations, &mut container, &mount(url.clone(), false));

        assert_eq!(annotations.get("gke-gcsfuse/volumes").map(String::as_str), Some("true"));
        let volumes = pod.volumes.unwrap();
        assert_eq!(volumes.len(), 1);
        let attrs = volumes[0].csi.as_ref().unwrap().volume_attributes.clone().unwrap();
        assert_eq!(attrs["bucketName"], "kiln");
        assert!(attrs["mountOptions"].contains(&format!("only-dir={}", url.prefix)));
        assert_eq!(container.volume_mounts.unwrap().len(), 1);
    }

    #[test]
    fn local_mount_uses_host_path() {
        let local = cloud(CloudKind::Local, "file:///artifacts");
        let mut pod = PodSpec::default();
        let mut annotations = BTreeMap::new();
        let mut container = Container::default();
        let url: BucketUrl = "file:///artifacts/abc".parse().unwrap();
        local.mount_bucket(&mut pod, &mut annotations, &mut container, &mount(url, true));

        let volume = &pod.volumes.unwrap()[0];
        assert_eq!(
            volume.host_path.as_ref().unwrap().path,
            "/var/lib/kiln/buckets/artifacts/abc"
        );
        assert!(annotations.is_empty());
        assert_eq!(container.volume_mounts.unwrap()[0].read_only, Some(true));
    }

    #[test]
    fn azure_mount_uses_sub_path() {
        let azure = cloud(CloudKind::Azure, "az://kiln");
        let mut pod = PodSpec::default();
        let mut container = Container::default();
        let url: BucketUrl = "az://kiln/abc".parse().unwrap();
        azure.mount_bucket(&mut pod, &mut BTreeMap::new(), &mut container, &mount(url, false));
        let mounts = container.volume_mounts.unwrap();
        assert_eq!(mounts[0].sub_path.as_deref(), Some("abc"));
        assert_eq!(azure.pod_labels()["azure.workload.identity/use"], "true");
    }

    #[test]
    fn upload_contexts_per_cloud() {
        let gcp = cloud(CloudKind::Gcp, "gs://kiln");
        let artifact: BucketUrl = "gs://kiln/abc".parse().unwrap();
        assert_eq!(
            gcp.upload_context(&artifact).context,
            "gs://kiln/abc/uploads/latest.tar.gz"
        );

        let azure = cloud(CloudKind::Azure, "az://kiln");
        let artifact: BucketUrl = "az://kiln/abc".parse().unwrap();
        assert_eq!(
            azure.upload_context(&artifact).context,
            "https://kilnstore.blob.core.windows.net/kiln/abc/uploads/latest.tar.gz"
        );

        let local = cloud(CloudKind::Local, "file:///kiln");
        let artifact: BucketUrl = "file:///kiln/abc".parse().unwrap();
        let ctx = local.upload_context(&artifact);
        assert_eq!(ctx.context, "tar:///upload/uploads/latest.tar.gz");
        assert_eq!(ctx.mount.unwrap().mount_path, "/upload");
    }

    #[test]
    fn service_account_annotations_per_cloud() {
        let gcp = cloud(CloudKind::Gcp, "gs://kiln");
        assert!(gcp
            .service_account_annotations()
            .contains_key("iam.gke.io/gcp-service-account"));
        let aws = cloud(CloudKind::Aws, "s3://kiln");
        assert!(aws
            .service_account_annotations()
            .contains_key("eks.amazonaws.com/role-arn"));
        let local = cloud(CloudKind::Local, "file:///kiln");
        assert!(local.service_account_annotations().is_empty());
    }
}
