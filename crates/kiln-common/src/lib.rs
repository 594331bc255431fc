//! Common types for Kiln: CRDs, conditions, errors, and utilities
//!
//! Every other Kiln crate builds on the types defined here:
//!
//! - [`crd`] - Custom Resource Definitions (Dataset, Model, Server, Notebook)
//! - [`kinds`] - Closed union over the four kinds and the shared object trait
//! - [`error`] - Structured error type with retryability classification
//! - [`events`] - Kubernetes Event publishing
//! - [`retry`] - Exponential backoff for transient failures
//! - [`naming`] - Deterministic hashing and DNS-1123 name helpers
//! - [`telemetry`] - Logging initialization

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kinds;
pub mod naming;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use kinds::{owner_labels, owner_labels_with_uid, AnyObject, ArtifactObject, ObjectKind};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group shared by all Kiln CRDs
pub const API_GROUP: &str = "kiln.dev";

/// API version shared by all Kiln CRDs
pub const API_VERSION: &str = "kiln.dev/v1";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "kiln-controller";

/// Label recording the kind of the object that owns a dependent
pub const OWNER_KIND_LABEL: &str = "kiln.dev/owner-kind";

/// Label recording the name of the object that owns a dependent
pub const OWNER_NAME_LABEL: &str = "kiln.dev/owner-name";

/// Label recording the uid of the object that owns a dependent
pub const OWNER_UID_LABEL: &str = "kiln.dev/owner-uid";

/// Label selector matching every dependent created by Kiln
pub const OWNED_SELECTOR: &str = "kiln.dev/owner-kind";

/// Standard managed-by label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on everything Kiln creates
pub const MANAGED_BY_VALUE: &str = "kiln";

/// Default port for the SCI gRPC server
pub const DEFAULT_SCI_PORT: u16 = 10080;

/// Port model servers listen on
pub const SERVER_PORT: u16 = 8080;

/// Port notebooks listen on
pub const NOTEBOOK_PORT: u16 = 8888;
