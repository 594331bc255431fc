//! Model CRD
//!
//! A Model runs a modeller job. It may fine-tune a base Model on a Dataset,
//! in which case both must be ready before the job is created. Servers that
//! reference the Model are tracked in `status.servers`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ArtifactsStatus, ModelSize, ObjectRef, ObjectStatus, WorkloadSpec};

/// Desired state of a Model
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kiln.dev",
    version = "v1",
    kind = "Model",
    plural = "models",
    shortname = "mdl",
    namespaced,
    status = "ModelStatus",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Base","type":"string","jsonPath":".spec.baseModel.name"}"#,
    printcolumn = r#"{"name":"Dataset","type":"string","jsonPath":".spec.trainingDataset.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    /// Model to start from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<ObjectRef>,

    /// Dataset to train on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_dataset: Option<ObjectRef>,

    /// Model size, drives resource sizing for training and serving
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<ModelSize>,

    /// Modeller container
    #[serde(flatten)]
    pub workload: WorkloadSpec,
}

/// Observed state of a Model
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    /// Shared status fields
    #[serde(flatten)]
    pub common: ObjectStatus,

    /// Where the saved model lives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactsStatus>,

    /// Names of Servers currently serving this Model, sorted. Always
    /// serialized so a merge patch can clear it.
    #[serde(default)]
    pub servers: Vec<String>,
}

impl ModelStatus {
    /// Add a server name, keeping the list sorted and unique
    pub fn register_server(&mut self, name: &str) -> bool {
        match self.servers.binary_search_by(|s| s.as_str().cmp(name)) {
            Ok(_) => false,
            Err(pos) => {
                self.servers.insert(pos, name.to_string());
                true
            }
        }
    }

    /// Replace the server list with the given set, returning whether it changed
    pub fn reconcile_servers<I>(&mut self, live: I) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        let mut next: Vec<String> = live.into_iter().collect();
        next.sort();
        next.dedup();
        if next == self.servers {
            return false;
        }
        self.servers = next;
        true
    }
}
