//! Container image build orchestration for Kiln
//!
//! Turns a `spec.build` (git repository or uploaded tarball) into a pushed
//! container image:
//!
//! - [`upload`] - signed-URL handshake for out-of-band uploads
//! - [`job`] - builder Job construction
//! - [`orchestrator`] - per-object state machine tracking builder Jobs
//! - [`client`] - the `batch/v1` Job access trait

#![deny(missing_docs)]

pub mod client;
mod error;
pub mod job;
pub mod orchestrator;
pub mod upload;

pub use client::{JobClient, KubeJobClient};
#[cfg(any(test, feature = "mock"))]
pub use client::MockJobClient;
pub use error::BuildError;
pub use job::{BuilderImages, TARGET_IMAGE_ANNOTATION};
pub use orchestrator::{BuildOrchestrator, BuildOutcome};
pub use upload::{UploadState, UPLOAD_URL_EXPIRATION};
