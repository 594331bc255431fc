//! Resource sizing for Kiln workloads
//!
//! Turns a model size, an optional accelerator type and a runtime role into
//! CPU, memory, ephemeral storage and accelerator requests. Accelerator
//! properties come from an [`AcceleratorCatalog`] injected at construction;
//! nothing here reads global state.

#![deny(missing_docs)]

mod catalog;
mod error;
mod sizing;

pub use catalog::{spot_capacity, AcceleratorCatalog, AcceleratorSpec, GPU_RESOURCE};
pub use error::SizingError;
pub use sizing::{ResourcePlan, Role, Sizer, SizingRequest, GIB};
