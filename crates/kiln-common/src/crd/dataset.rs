//! Dataset CRD
//!
//! A Dataset runs a loader job that writes into the object's artifact bucket.
//! Once ready, `status.artifacts.url` never changes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ArtifactsStatus, ObjectStatus, WorkloadSpec};

/// Desired state of a Dataset
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kiln.dev",
    version = "v1",
    kind = "Dataset",
    plural = "datasets",
    shortname = "ds",
    namespaced,
    status = "DatasetStatus",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSpec {
    /// File name the loader writes inside the artifact bucket
    #[serde(default)]
    pub filename: String,

    /// Loader container
    #[serde(flatten)]
    pub workload: WorkloadSpec,
}

/// Observed state of a Dataset
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatasetStatus {
    /// Shared status fields
    #[serde(flatten)]
    pub common: ObjectStatus,

    /// Where the loaded data lives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactsStatus>,
}
