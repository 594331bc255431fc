//! Bucket URLs
//!
//! `gs://bucket/prefix`, `s3://bucket/prefix`, `az://container/prefix` and
//! `file:///bucket/prefix` all split into a bucket and an object prefix.

use std::fmt;
use std::str::FromStr;

use crate::{CloudError, CloudKind};

/// Storage scheme of a bucket URL
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BucketScheme {
    /// Google Cloud Storage
    Gs,
    /// Amazon S3
    S3,
    /// Azure Blob Storage container
    Az,
    /// Local filesystem
    File,
}

impl BucketScheme {
    /// URL scheme without the `://`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gs => "gs",
            Self::S3 => "s3",
            Self::Az => "az",
            Self::File => "file",
        }
    }

    /// The cloud this scheme belongs to
    pub fn cloud(&self) -> CloudKind {
        match self {
            Self::Gs => CloudKind::Gcp,
            Self::S3 => CloudKind::Aws,
            Self::Az => CloudKind::Azure,
            Self::File => CloudKind::Local,
        }
    }
}

/// A bucket plus an object prefix inside it
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BucketUrl {
    /// Storage scheme
    pub scheme: BucketScheme,
    /// Bucket (or container) name
    pub bucket: String,
    /// Object prefix without leading or trailing slashes, may be empty
    pub prefix: String,
}

impl BucketUrl {
    /// Append path segments to the prefix
    pub fn join(&self, path: &str) -> BucketUrl {
        let path = path.trim_matches('/');
        let prefix = match (self.prefix.is_empty(), path.is_empty()) {
            (_, true) => self.prefix.clone(),
            (true, false) => path.to_string(),
            (false, false) => format!("{}/{}", self.prefix, path),
        };
        BucketUrl {
            scheme: self.scheme,
            bucket: self.bucket.clone(),
            prefix,
        }
    }

    /// Full object name of `name` under this prefix
    pub fn object(&self, name: &str) -> String {
        self.join(name).prefix
    }
}

impl FromStr for BucketUrl {
    type Err = CloudError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CloudError::InvalidBucketUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        let scheme = match scheme {
            "gs" => BucketScheme::Gs,
            "s3" => BucketScheme::S3,
            "az" => BucketScheme::Az,
            "file" => BucketScheme::File,
            _ => return Err(invalid("scheme must be one of gs, s3, az, file")),
        };

        let rest = rest.trim_start_matches('/');
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(invalid("missing bucket name"));
        }
        if prefix.split('/').any(|segment| segment == "..") {
            return Err(invalid("prefix must not contain '..'"));
        }

        Ok(BucketUrl {
            scheme,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }
}

impl fmt::Display for BucketUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.scheme == BucketScheme::File {
            ":///"
        } else {
            "://"
        };
        write!(f, "{}{}{}", self.scheme.as_str(), sep, self.bucket)?;
        if !self.prefix.is_empty() {
            write!(f, "/{}", self.prefix)?;
        }
        Ok(())
    }
}
