//! Cloud configuration errors

use thiserror::Error;

/// Errors from cloud configuration
#[derive(Debug, Error)]
pub enum CloudError {
    /// The cloud name is not one of gcp, aws, azure, local
    #[error("unknown cloud '{0}', expected one of: gcp, aws, azure, local")]
    UnknownCloud(String),

    /// A bucket URL could not be parsed
    #[error("invalid bucket url '{url}': {reason}")]
    InvalidBucketUrl {
        /// The offending URL
        url: String,
        /// What is wrong with it
        reason: String,
    },

    /// A bucket URL uses a scheme that does not belong to the active cloud
    #[error("bucket url '{url}' cannot be used on {cloud}")]
    SchemeMismatch {
        /// The offending URL
        url: String,
        /// Active cloud
        cloud: String,
    },

    /// A setting required by the active cloud is missing
    #[error("{setting} is required on {cloud}")]
    MissingSetting {
        /// Name of the missing setting
        setting: &'static str,
        /// Active cloud
        cloud: String,
    },
}

impl From<CloudError> for kiln_common::Error {
    fn from(err: CloudError) -> Self {
        kiln_common::Error::config(err.to_string())
    }
}
