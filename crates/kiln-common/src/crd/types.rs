//! Supporting types shared by all Kiln CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::naming::deterministic_hash;
use crate::Error;

/// Condition types written by the reconcilers
pub mod condition_types {
    /// Upload handshake state
    pub const UPLOADED: &str = "Uploaded";
    /// Container image build state
    pub const BUILT: &str = "Built";
    /// Batch job (loader / modeller) state
    pub const COMPLETE: &str = "Complete";
    /// Long-running workload (server / notebook) state
    pub const SERVING: &str = "Serving";
}

/// Machine-readable condition reasons
pub mod condition_reasons {
    /// Referenced Model does not exist
    pub const MODEL_NOT_FOUND: &str = "ModelNotFound";
    /// Referenced Model exists but is not ready
    pub const MODEL_NOT_READY: &str = "ModelNotReady";
    /// Referenced base Model does not exist
    pub const BASE_MODEL_NOT_FOUND: &str = "BaseModelNotFound";
    /// Referenced base Model exists but is not ready
    pub const BASE_MODEL_NOT_READY: &str = "BaseModelNotReady";
    /// Referenced Dataset does not exist
    pub const DATASET_NOT_FOUND: &str = "DatasetNotFound";
    /// Referenced Dataset exists but is not ready
    pub const DATASET_NOT_READY: &str = "DatasetNotReady";
    /// Job is still running
    pub const JOB_NOT_COMPLETE: &str = "JobNotComplete";
    /// Job succeeded
    pub const JOB_COMPLETE: &str = "JobComplete";
    /// Job exhausted its retries
    pub const JOB_FAILED: &str = "JobFailed";
    /// Deployment has at least one ready replica
    pub const DEPLOYMENT_READY: &str = "DeploymentReady";
    /// Deployment has no ready replicas yet
    pub const DEPLOYMENT_NOT_READY: &str = "DeploymentNotReady";
    /// Notebook pod is running and ready
    pub const POD_READY: &str = "PodReady";
    /// Notebook pod is not ready yet
    pub const POD_NOT_READY: &str = "PodNotReady";
    /// Workload is suspended by the user
    pub const SUSPENDED: &str = "Suspended";
    /// Waiting for the client to upload the build context
    pub const AWAITING_UPLOAD: &str = "AwaitingUpload";
    /// Uploaded build context matches the declared checksum
    pub const UPLOAD_FOUND: &str = "UploadFound";
    /// The spec cannot be acted on until it is edited
    pub const INVALID_SPEC: &str = "InvalidSpec";
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Uploaded, Built, Complete, Serving)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Generation of the object this condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the condition status transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: Utc::now(),
        }
    }

    /// Attach the object generation the condition was observed at
    pub fn observed(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Insert or update a condition by type.
///
/// Returns true when anything changed. The transition time is only bumped
/// when the status flips, so rewriting an identical condition is a no-op and
/// reconciles of a converged object produce no status writes.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if existing.same_state(&condition) => false,
        Some(existing) => {
            let transition = if existing.status == condition.status {
                existing.last_transition_time
            } else {
                condition.last_transition_time
            };
            *existing = Condition {
                last_transition_time: transition,
                ..condition
            };
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// True when the condition of the given type exists and is True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Reference to another Kiln object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Name of the referenced object
    pub name: String,
}

impl ObjectRef {
    /// Reference an object by name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Git repository used as a build context
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct GitSource {
    /// Clone URL
    pub url: String,

    /// Branch to build (mutually exclusive with `tag`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Tag to build (mutually exclusive with `branch`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Directory inside the repository holding the Dockerfile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl GitSource {
    /// Validate the source, reporting the offending field path
    pub fn validate(&self, object: &str) -> Result<(), Error> {
        if self.url.trim().is_empty() {
            return Err(Error::validation_for_field(
                object,
                "spec.build.git.url",
                "git url must not be empty",
            ));
        }
        if self.branch.is_some() && self.tag.is_some() {
            return Err(Error::validation_for_field(
                object,
                "spec.build.git",
                "branch and tag are mutually exclusive",
            ));
        }
        if let Some(path) = &self.path {
            if path.starts_with('/') || path.split('/').any(|segment| segment == "..") {
                return Err(Error::validation_for_field(
                    object,
                    "spec.build.git.path",
                    format!("path '{path}' must be relative and stay inside the repository"),
                ));
            }
        }
        Ok(())
    }

    /// The ref to clone: tag if set, otherwise branch
    pub fn git_ref(&self) -> Option<&str> {
        self.tag.as_deref().or(self.branch.as_deref())
    }

    /// Normalized sub-directory, empty for the repository root
    pub fn context_path(&self) -> &str {
        self.path
            .as_deref()
            .map(|p| p.trim_start_matches("./").trim_matches('/'))
            .unwrap_or("")
    }
}

/// Build context uploaded out-of-band by a client
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct UploadSource {
    /// Hex-encoded MD5 of the tarball the client intends to upload
    #[serde(rename = "md5Checksum")]
    pub md5_checksum: String,

    /// Client-chosen id; changing it asks for a fresh signed URL
    #[serde(rename = "requestID")]
    pub request_id: String,
}

/// How a container image is built
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BuildSpec {
    /// Build from a git repository
    Git(GitSource),
    /// Build from an uploaded tarball
    Upload(UploadSource),
}

impl BuildSpec {
    /// Short content hash of the build inputs.
    ///
    /// The upload request id is deliberately excluded: asking for a new
    /// signed URL for the same tarball must not trigger a rebuild.
    pub fn content_hash(&self) -> String {
        let canonical = match self {
            Self::Git(git) => format!(
                "git\n{}\n{}\n{}\n{}",
                git.url,
                git.branch.as_deref().unwrap_or_default(),
                git.tag.as_deref().unwrap_or_default(),
                git.context_path()
            ),
            Self::Upload(upload) => format!("upload\n{}", upload.md5_checksum.to_lowercase()),
        };
        deterministic_hash(&canonical, 16)
    }

    /// Validate the build spec
    pub fn validate(&self, object: &str) -> Result<(), Error> {
        match self {
            Self::Git(git) => git.validate(object),
            Self::Upload(upload) => {
                let md5 = upload.md5_checksum.as_str();
                if md5.len() != 32 || !md5.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(Error::validation_for_field(
                        object,
                        "spec.build.upload.md5Checksum",
                        "md5Checksum must be 32 hex characters",
                    ));
                }
                if upload.request_id.is_empty() {
                    return Err(Error::validation_for_field(
                        object,
                        "spec.build.upload.requestID",
                        "requestID must not be empty",
                    ));
                }
                Ok(())
            }
        }
    }

    /// The upload source, if this is an upload build
    pub fn upload(&self) -> Option<&UploadSource> {
        match self {
            Self::Upload(upload) => Some(upload),
            Self::Git(_) => None,
        }
    }
}

/// Accelerator request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct GpuSpec {
    /// Accelerator type as named in the accelerator catalog (e.g. "nvidia-l4")
    #[serde(rename = "type")]
    pub type_: String,

    /// Explicit accelerator count; computed from the model size when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

/// Optional resource overrides. Memory and disk are whole GiB.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ResourcesSpec {
    /// CPU cores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,

    /// Memory in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,

    /// Ephemeral storage in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<u32>,

    /// Accelerator request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuSpec>,
}

/// Model size used for resource sizing
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelSize {
    /// Number of parameters
    pub parameter_count: u64,
    /// Bits per parameter
    pub parameter_bits: u32,
}

impl ModelSize {
    /// Size of the weights in bytes
    pub fn bytes(&self) -> u64 {
        self.parameter_count.saturating_mul(u64::from(self.parameter_bits)) / 8
    }
}

/// Container fields shared by every kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Prebuilt container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Build instructions, mutually exclusive with `image`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,

    /// Container command override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    /// Extra environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Free-form parameters handed to the workload
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub params: BTreeMap<String, serde_json::Value>,

    /// Resource overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesSpec>,
}

impl WorkloadSpec {
    /// Check that exactly one of `image` / `build` is set and the build is well formed
    pub fn validate(&self, object: &str) -> Result<(), Error> {
        match (&self.image, &self.build) {
            (Some(_), Some(_)) => Err(Error::validation_for_field(
                object,
                "spec",
                "image and build are mutually exclusive",
            )),
            (None, None) => Err(Error::validation_for_field(
                object,
                "spec",
                "one of image or build must be set",
            )),
            (Some(image), None) if image.trim().is_empty() => Err(Error::validation_for_field(
                object,
                "spec.image",
                "image must not be empty",
            )),
            (Some(_), None) => Ok(()),
            (None, Some(build)) => build.validate(object),
        }
    }

    /// Params as `PARAM_<UPPER_KEY>` environment variables, in key order
    pub fn param_env(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(key, value)| {
                let name = format!(
                    "PARAM_{}",
                    key.to_uppercase()
                        .chars()
                        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                        .collect::<String>()
                );
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name, value)
            })
            .collect()
    }

    /// Params serialized as the JSON document mounted at `/content/params.json`
    pub fn params_json(&self) -> String {
        serde_json::to_string(&self.params).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Upload handshake state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct UploadStatus {
    /// URL the client must PUT the tarball to
    #[serde(rename = "signedURL", default, skip_serializing_if = "Option::is_none")]
    pub signed_url: Option<String>,

    /// Request id the signed URL was issued for
    #[serde(rename = "requestID", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// When the signed URL expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,

    /// Hex MD5 of the object found in storage
    #[serde(
        rename = "storedMD5Checksum",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stored_md5_checksum: Option<String>,
}

/// Resolved artifact storage location
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ArtifactsStatus {
    /// Bucket URL holding the object's artifacts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Status fields shared by every kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStatus {
    /// Whether the object has converged
    #[serde(default)]
    pub ready: bool,

    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Image published by the build orchestrator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,

    /// Upload handshake state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_upload: Option<UploadStatus>,
}

impl ObjectStatus {
    /// Insert or update a condition, returning whether anything changed
    pub fn set_condition(&mut self, condition: Condition) -> bool {
        set_condition(&mut self.conditions, condition)
    }

    /// Find a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        find_condition(&self.conditions, type_)
    }

    /// True when the condition of the given type is True
    pub fn is_true(&self, type_: &str) -> bool {
        is_condition_true(&self.conditions, type_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git(url: &str) -> GitSource {
        GitSource {
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn story_rewriting_same_condition_is_a_noop() {
        let mut conditions = Vec::new();
        assert!(set_condition(
            &mut conditions,
            Condition::new("Built", ConditionStatus::False, "JobNotComplete", "")
        ));
        let first = conditions[0].last_transition_time;
        assert!(!set_condition(
            &mut conditions,
            Condition::new("Built", ConditionStatus::False, "JobNotComplete", "")
        ));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first);
    }

    #[test]
    fn story_reason_change_keeps_transition_time() {
        let mut conditions = vec![Condition::new(
            "Serving",
            ConditionStatus::False,
            "ModelNotFound",
            "",
        )];
        let first = conditions[0].last_transition_time;
        assert!(set_condition(
            &mut conditions,
            Condition::new("Serving", ConditionStatus::False, "ModelNotReady", "")
        ));
        assert_eq!(conditions[0].reason, "ModelNotReady");
        assert_eq!(conditions[0].last_transition_time, first);
    }

    #[test]
    fn status_flip_updates_transition_time() {
        let mut old = Condition::new("Complete", ConditionStatus::False, "JobNotComplete", "");
        old.last_transition_time = Utc::now() - chrono::Duration::hours(1);
        let before = old.last_transition_time;
        let mut conditions = vec![old];
        set_condition(
            &mut conditions,
            Condition::new("Complete", ConditionStatus::True, "JobComplete", ""),
        );
        assert!(conditions[0].last_transition_time > before);
        assert!(is_condition_true(&conditions, "Complete"));
    }

    #[test]
    fn git_validation_rejects_bad_sources() {
        assert!(git("https://github.com/acme/llm").validate("m").is_ok());
        assert!(git("").validate("m").is_err());

        let mut both = git("https://x");
        both.branch = Some("main".into());
        both.tag = Some("v1".into());
        assert!(both.validate("m").is_err());

        let mut escape = git("https://x");
        escape.path = Some("../etc".into());
        assert!(escape.validate("m").is_err());
        escape.path = Some("/abs".into());
        assert!(escape.validate("m").is_err());
        escape.path = Some("./models/llama/".into());
        assert!(escape.validate("m").is_ok());
        assert_eq!(escape.context_path(), "models/llama");
    }

    #[test]
    fn build_hash_ignores_request_id() {
        let a = BuildSpec::Upload(UploadSource {
            md5_checksum: "0123456789abcdef0123456789abcdef".into(),
            request_id: "one".into(),
        });
        let b = BuildSpec::Upload(UploadSource {
            md5_checksum: "0123456789abcdef0123456789abcdef".into(),
            request_id: "two".into(),
        });
        let c = BuildSpec::Upload(UploadSource {
            md5_checksum: "ffffffffffffffffffffffffffffffff".into(),
            request_id: "one".into(),
        });
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn build_hash_tracks_git_ref() {
        let mut src = git("https://x");
        let main = BuildSpec::Git(src.clone());
        src.branch = Some("dev".into());
        assert_ne!(main.content_hash(), BuildSpec::Git(src).content_hash());
    }

    #[test]
    fn workload_requires_exactly_one_image_source() {
        let mut spec = WorkloadSpec::default();
        assert!(spec.validate("d").is_err());
        spec.image = Some("python:3.12".into());
        assert!(spec.validate("d").is_ok());
        spec.build = Some(BuildSpec::Git(git("https://x")));
        assert!(spec.validate("d").is_err());
    }

    #[test]
    fn upload_checksum_must_be_hex() {
        let bad = BuildSpec::Upload(UploadSource {
            md5_checksum: "not-a-checksum".into(),
            request_id: "r".into(),
        });
        assert!(bad.validate("d").is_err());
    }

    #[test]
    fn params_become_env_vars() {
        let mut spec = WorkloadSpec::default();
        spec.params.insert("epochs".into(), serde_json::json!(3));
        spec.params.insert("base-url".into(), serde_json::json!("http://x"));
        let env = spec.param_env();
        assert_eq!(
            env,
            vec![
                ("PARAM_BASE_URL".to_string(), "http://x".to_string()),
                ("PARAM_EPOCHS".to_string(), "3".to_string()),
            ]
        );
        assert_eq!(spec.params_json(), r#"{"base-url":"http://x","epochs":3}"#);
    }

    #[test]
    fn build_spec_wire_shape() {
        let spec: BuildSpec = serde_json::from_value(serde_json::json!({
            "upload": {"md5Checksum": "abc", "requestID": "r1"}
        }))
        .unwrap();
        assert_eq!(spec.upload().map(|u| u.request_id.as_str()), Some("r1"));

        let status = UploadStatus {
            signed_url: Some("https://signed".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["signedURL"], "https://signed");
    }

    #[test]
    fn model_size_bytes() {
        let size = ModelSize {
            parameter_count: 125_000_000,
            parameter_bits: 32,
        };
        assert_eq!(size.bytes(), 500_000_000);
    }
}
