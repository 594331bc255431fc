//! The four Kiln kinds as a closed set
//!
//! [`ArtifactObject`] exposes what the build orchestrator and the sizing code
//! need from any kind. [`AnyObject`] is the sum type used where a manifest of
//! unknown kind has to be handled.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;

use crate::crd::{
    Dataset, Model, ModelSize, Notebook, NotebookSpec, ObjectRef, ObjectStatus, Server,
    WorkloadSpec,
};
use crate::naming::truncate_label;
use crate::{
    Error, MANAGED_BY_LABEL, MANAGED_BY_VALUE, OWNER_KIND_LABEL, OWNER_NAME_LABEL, OWNER_UID_LABEL,
};

/// Kind discriminator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// [`Dataset`]
    Dataset,
    /// [`Model`]
    Model,
    /// [`Server`]
    Server,
    /// [`Notebook`]
    Notebook,
}

impl ObjectKind {
    /// Every kind, in dependency order
    pub const ALL: [ObjectKind; 4] = [Self::Dataset, Self::Model, Self::Server, Self::Notebook];

    /// Lowercase name used in labels, image names and artifact paths
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dataset => "dataset",
            Self::Model => "model",
            Self::Server => "server",
            Self::Notebook => "notebook",
        }
    }

    /// CamelCase Kubernetes kind
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Dataset => "Dataset",
            Self::Model => "Model",
            Self::Server => "Server",
            Self::Notebook => "Notebook",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dataset" | "datasets" => Ok(Self::Dataset),
            "model" | "models" => Ok(Self::Model),
            "server" | "servers" => Ok(Self::Server),
            "notebook" | "notebooks" => Ok(Self::Notebook),
            _ => Err(Error::validation(format!(
                "unknown kind: {s}, expected one of: dataset, model, server, notebook"
            ))),
        }
    }
}

/// Labels every dependent of `kind/name` carries.
///
/// The owner name is truncated to a valid label value, so it cannot be used
/// to look the owner up. These labels double as the Server selector.
pub fn owner_labels(kind: ObjectKind, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNER_KIND_LABEL.to_string(), kind.as_str().to_string()),
        (OWNER_NAME_LABEL.to_string(), truncate_label(name)),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ])
}

/// [`owner_labels`] plus the owner's uid when known.
///
/// The garbage collector matches dependents without an owner reference to
/// their owner by this uid.
pub fn owner_labels_with_uid(
    kind: ObjectKind,
    name: &str,
    uid: Option<&str>,
) -> BTreeMap<String, String> {
    let mut labels = owner_labels(kind, name);
    if let Some(uid) = uid {
        labels.insert(OWNER_UID_LABEL.to_string(), uid.to_string());
    }
    labels
}

/// Read access shared by every Kiln kind
pub trait ArtifactObject:
    Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + DeserializeOwned
    + serde::Serialize
    + Send
    + Sync
    + 'static
{
    /// The kind of this object
    const KIND: ObjectKind;

    /// Container fields of the spec
    fn workload(&self) -> &WorkloadSpec;

    /// Shared status fields, if a status has been written
    fn object_status(&self) -> Option<&ObjectStatus>;

    /// Declared model size, used to size builds and workloads
    fn model_size(&self) -> Option<ModelSize> {
        None
    }

    /// `kind/namespace/name`, used in logs and error context
    fn object_key(&self) -> String {
        format!(
            "{}/{}/{}",
            Self::KIND,
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// Whether the object has converged
    fn is_ready(&self) -> bool {
        self.object_status().is_some_and(|s| s.ready)
    }
}

impl ArtifactObject for Dataset {
    const KIND: ObjectKind = ObjectKind::Dataset;

    fn workload(&self) -> &WorkloadSpec {
        &self.spec.workload
    }

    fn object_status(&self) -> Option<&ObjectStatus> {
        self.status.as_ref().map(|s| &s.common)
    }
}

impl ArtifactObject for Model {
    const KIND: ObjectKind = ObjectKind::Model;

    fn workload(&self) -> &WorkloadSpec {
        &self.spec.workload
    }

    fn model_size(&self) -> Option<ModelSize> {
        self.spec.size
    }

    fn object_status(&self) -> Option<&ObjectStatus> {
        self.status.as_ref().map(|s| &s.common)
    }
}

impl ArtifactObject for Server {
    const KIND: ObjectKind = ObjectKind::Server;

    fn workload(&self) -> &WorkloadSpec {
        &self.spec.workload
    }

    fn object_status(&self) -> Option<&ObjectStatus> {
        self.status.as_ref().map(|s| &s.common)
    }
}

impl ArtifactObject for Notebook {
    const KIND: ObjectKind = ObjectKind::Notebook;

    fn workload(&self) -> &WorkloadSpec {
        &self.spec.workload
    }

    fn object_status(&self) -> Option<&ObjectStatus> {
        self.status.as_ref().map(|s| &s.common)
    }
}

/// Any one of the four Kiln kinds
#[derive(Clone, Debug)]
pub enum AnyObject {
    /// A Dataset
    Dataset(Dataset),
    /// A Model
    Model(Model),
    /// A Server
    Server(Server),
    /// A Notebook
    Notebook(Notebook),
}

impl AnyObject {
    /// Parse a YAML or JSON manifest, dispatching on its `kind`
    pub fn from_manifest(manifest: &str) -> Result<Self, Error> {
        let value: serde_yaml::Value = serde_yaml::from_str(manifest)
            .map_err(|e| Error::serialization(format!("invalid manifest: {e}")))?;
        let kind_name = value
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| Error::serialization("manifest has no kind"))?
            .to_string();
        let kind = kind_name.parse::<ObjectKind>()?;

        fn decode<T: DeserializeOwned>(
            value: serde_yaml::Value,
            kind: ObjectKind,
        ) -> Result<T, Error> {
            serde_yaml::from_value(value)
                .map_err(|e| Error::serialization_for_kind(kind.kind_name(), e.to_string()))
        }

        Ok(match kind {
            ObjectKind::Dataset => Self::Dataset(decode(value, kind)?),
            ObjectKind::Model => Self::Model(decode(value, kind)?),
            ObjectKind::Server => Self::Server(decode(value, kind)?),
            ObjectKind::Notebook => Self::Notebook(decode(value, kind)?),
        })
    }

    /// The kind of the wrapped object
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Dataset(_) => ObjectKind::Dataset,
            Self::Model(_) => ObjectKind::Model,
            Self::Server(_) => ObjectKind::Server,
            Self::Notebook(_) => ObjectKind::Notebook,
        }
    }

    fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Dataset(o) => o.meta(),
            Self::Model(o) => o.meta(),
            Self::Server(o) => o.meta(),
            Self::Notebook(o) => o.meta(),
        }
    }

    /// Object name
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Object namespace
    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    /// Container fields of the wrapped object
    pub fn workload(&self) -> &WorkloadSpec {
        match self {
            Self::Dataset(o) => o.workload(),
            Self::Model(o) => o.workload(),
            Self::Server(o) => o.workload(),
            Self::Notebook(o) => o.workload(),
        }
    }

    /// A Notebook that opens this object's image and mounts its artifacts.
    ///
    /// Models are mounted as the notebook's model, Datasets as its dataset,
    /// Servers mount the Model they serve. A Notebook maps to itself.
    pub fn notebook_for(&self) -> Notebook {
        let (model, dataset) = match self {
            Self::Notebook(nb) => return nb.clone(),
            Self::Dataset(_) => (None, Some(ObjectRef::new(self.name()))),
            Self::Model(_) => (Some(ObjectRef::new(self.name())), None),
            Self::Server(server) => (Some(server.spec.model.clone()), None),
        };

        let source = self.workload();
        let workload = WorkloadSpec {
            image: source.image.clone(),
            build: source.build.clone(),
            env: source.env.clone(),
            params: source.params.clone(),
            resources: source.resources.clone(),
            command: None,
        };

        let mut notebook = Notebook::new(
            self.name(),
            NotebookSpec {
                model,
                dataset,
                suspend: false,
                workload,
            },
        );
        notebook.metadata.namespace = self.namespace().map(str::to_string);
        notebook
    }
}
