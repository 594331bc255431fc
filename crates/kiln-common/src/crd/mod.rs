//! Custom Resource Definitions for Kiln
//!
//! Four namespaced kinds under `kiln.dev/v1`. Specs share [`WorkloadSpec`]
//! and statuses share [`ObjectStatus`], both flattened into the kind's own
//! fields.

mod dataset;
mod model;
mod notebook;
mod server;
mod types;

pub use dataset::{Dataset, DatasetSpec, DatasetStatus};
pub use model::{Model, ModelSpec, ModelStatus};
pub use notebook::{Notebook, NotebookSpec, NotebookStatus};
pub use server::{Server, ServerSpec, ServerStatus};
pub use types::{
    condition_reasons, condition_types, find_condition, is_condition_true, set_condition,
    ArtifactsStatus, BuildSpec, Condition, ConditionStatus, GitSource, GpuSpec, ModelSize,
    ObjectRef, ObjectStatus, ResourcesSpec, UploadSource, UploadStatus, WorkloadSpec,
};

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};

/// Schema for free-form maps the API server must not prune
pub(crate) fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// All CRDs as a multi-document YAML stream, for `kiln-controller crd`
pub fn crds_yaml() -> Result<String, serde_yaml::Error> {
    use kube::CustomResourceExt;

    let docs = [
        serde_yaml::to_string(&Dataset::crd())?,
        serde_yaml::to_string(&Model::crd())?,
        serde_yaml::to_string(&Server::crd())?,
        serde_yaml::to_string(&Notebook::crd())?,
    ];
    Ok(docs.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crd_stream_contains_all_kinds() {
        let yaml = crds_yaml().unwrap();
        for kind in ["Dataset", "Model", "Server", "Notebook"] {
            assert!(yaml.contains(&format!("kind: {kind}")), "{kind} missing");
        }
        assert!(yaml.contains("group: kiln.dev"));
        assert!(yaml.contains("x-kubernetes-preserve-unknown-fields"));
    }
}
