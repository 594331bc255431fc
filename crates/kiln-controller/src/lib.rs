//! Kiln controller: reconcilers for Datasets, Models, Servers and Notebooks

#![deny(missing_docs)]

/// Shared reconciler context
pub mod context;
/// Per-kind reconcilers
pub mod controller;
/// Reconcile error type
pub mod error;
/// Garbage-collector sweep for orphaned dependents
pub mod gc;
/// Cross-kind dependency index
pub mod index;
/// Kubernetes access for the reconcilers
pub mod kube_client;
/// Controller construction
pub mod runner;

pub use context::{Context, ControllerConfig};
pub use error::ReconcileError;
