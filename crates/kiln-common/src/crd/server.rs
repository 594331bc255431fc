//! Server CRD

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ObjectRef, ObjectStatus, WorkloadSpec};

/// Desired state of a Server
///
/// A Server runs a Deployment and Service for a ready Model.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kiln.dev",
    version = "v1",
    kind = "Server",
    plural = "servers",
    shortname = "srv",
    namespaced,
    status = "ServerStatus",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Model","type":"string","jsonPath":".spec.model.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Model to serve
    pub model: ObjectRef,

    /// Server container
    #[serde(flatten)]
    pub workload: WorkloadSpec,
}

/// Observed state of a Server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    /// Shared status fields
    #[serde(flatten)]
    pub common: ObjectStatus,
}
