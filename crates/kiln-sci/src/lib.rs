//! Storage and Cloud Identity (SCI) service
//!
//! The controller never talks to a cloud API directly. It asks the SCI
//! service, over gRPC, for three things: a signed URL a client can upload a
//! build context to, the MD5 of a stored object, and a binding between a
//! Kubernetes service account and a cloud principal.
//!
//! - [`proto`] - generated gRPC types
//! - [`backend`] - GCP, AWS, Azure and local implementations
//! - [`server`] - gRPC server over a backend
//! - [`client`] - client trait used by the controller, with retries
//! - [`md5`] - hex / base64 checksum conversion

#![deny(missing_docs)]

pub mod backend;
pub mod client;
mod error;
pub mod md5;
pub mod server;
mod token;

pub use backend::{Backend, BackendImpl};
pub use client::{GrpcSciClient, SciClient};
pub use error::SciError;

#[cfg(any(test, feature = "mock"))]
pub use client::MockSciClient;

/// Generated protobuf and gRPC types
#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("kiln.sci.v1");
}
