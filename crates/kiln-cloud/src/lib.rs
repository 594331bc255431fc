//! Cloud configuration for Kiln
//!
//! Everything that differs between GCP, AWS, Azure and a local cluster lives
//! here: which backend is active, how artifact buckets are addressed, where
//! built images are pushed, how a bucket is mounted into a pod and how a
//! Kubernetes service account is tied to a cloud identity.

#![deny(missing_docs)]

mod bucket;
mod cloud;
mod detect;
mod error;

pub use bucket::{BucketScheme, BucketUrl};
pub use cloud::{BucketMount, Cloud, CloudConfig, UploadContext, UPLOAD_OBJECT};
pub use detect::{cloud_from_env, detect_cloud, probe_metadata, MetadataProbe, CLOUD_ENV};
pub use error::CloudError;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Supported cloud backends
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CloudKind {
    /// Google Cloud
    Gcp,
    /// Amazon Web Services
    Aws,
    /// Microsoft Azure
    Azure,
    /// Filesystem emulation for development clusters
    #[default]
    Local,
}

impl CloudKind {
    /// Every backend
    pub const ALL: [CloudKind; 4] = [Self::Gcp, Self::Aws, Self::Azure, Self::Local];

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gcp => "gcp",
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for CloudKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudKind {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gcp" | "gke" | "google" => Ok(Self::Gcp),
            "aws" | "eks" => Ok(Self::Aws),
            "azure" | "aks" => Ok(Self::Azure),
            "local" | "kind" => Ok(Self::Local),
            other => Err(CloudError::UnknownCloud(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_kind_parsing() {
        for kind in CloudKind::ALL {
            assert_eq!(kind.to_string().parse::<CloudKind>().unwrap(), kind);
        }
        assert_eq!("GKE".parse::<CloudKind>().unwrap(), CloudKind::Gcp);
        assert!(matches!(
            "openstack".parse::<CloudKind>(),
            Err(CloudError::UnknownCloud(c)) if c == "openstack"
        ));
    }
}
