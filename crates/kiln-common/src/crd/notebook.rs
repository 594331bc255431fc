//! Notebook CRD
//!
//! A Notebook runs a single Jupyter pod with an optional Model and Dataset
//! mounted. Setting `suspend` deletes the pod without deleting the object.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ObjectRef, ObjectStatus, WorkloadSpec};

/// Desired state of a Notebook
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kiln.dev",
    version = "v1",
    kind = "Notebook",
    plural = "notebooks",
    shortname = "nb",
    namespaced,
    status = "NotebookStatus",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Suspended","type":"boolean","jsonPath":".spec.suspend"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NotebookSpec {
    /// Model mounted at `/content/saved-model`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ObjectRef>,

    /// Dataset mounted at `/content/data`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<ObjectRef>,

    /// Delete the notebook pod while keeping the object
    #[serde(default)]
    pub suspend: bool,

    /// Notebook container
    #[serde(flatten)]
    pub workload: WorkloadSpec,
}

/// Observed state of a Notebook
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotebookStatus {
    /// Shared status fields
    #[serde(flatten)]
    pub common: ObjectStatus,
}
