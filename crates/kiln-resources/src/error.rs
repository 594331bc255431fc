//! Sizing errors

use thiserror::Error;

/// Errors from the sizing engine. None of them are retryable: they all need
/// a spec or configuration change.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizingError {
    /// The accelerator type is not in the catalog
    #[error("unknown accelerator '{name}', available: {available}")]
    UnknownAccelerator {
        /// Requested type
        name: String,
        /// Comma-separated catalog entries
        available: String,
    },

    /// The runtime role is not one of trainer, server, notebook, builder
    #[error("unknown role '{0}', expected one of: trainer, server, notebook, builder")]
    UnknownRole(String),

    /// The model needs more accelerators than a single node offers
    #[error("model needs {required} x {accelerator} but a node has at most {max}")]
    ExceedsNode {
        /// Accelerator type
        accelerator: String,
        /// Accelerators required
        required: u32,
        /// Largest per-node count
        max: u32,
    },

    /// A catalog override file could not be parsed
    #[error("invalid accelerator catalog: {0}")]
    InvalidCatalog(String),
}
