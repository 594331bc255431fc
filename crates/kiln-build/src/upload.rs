//! Upload handshake
//!
//! A client announces an upload by setting `spec.build.upload` with the
//! tarball's MD5 and a request id. The controller answers with a signed URL
//! in `status.buildUpload` and watches storage until an object with the
//! declared checksum appears. The request id is the compare-and-set token:
//! a new URL is only issued when it changes.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use kiln_cloud::{BucketUrl, UPLOAD_OBJECT};
use kiln_common::crd::{
    condition_reasons, condition_types, Condition, ConditionStatus, ObjectStatus, UploadSource,
    UploadStatus,
};
use kiln_sci::SciClient;

use crate::BuildError;

/// Lifetime of an issued upload URL
pub const UPLOAD_URL_EXPIRATION: Duration = Duration::from_secs(300);

/// Where the handshake stands after one pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadState {
    /// An object with the declared checksum is in storage
    Found,
    /// Waiting for the client to upload
    Awaiting {
        /// Whether a new signed URL was issued in this pass
        issued_url: bool,
    },
}

fn checksums_match(stored: &str, declared: &str) -> bool {
    !stored.is_empty() && stored.eq_ignore_ascii_case(declared)
}

fn mark_found(status: &mut ObjectStatus, upload: &UploadSource, generation: Option<i64>) {
    let handshake = status.build_upload.get_or_insert_with(UploadStatus::default);
    handshake.stored_md5_checksum = Some(upload.md5_checksum.to_lowercase());
    handshake.request_id = Some(upload.request_id.clone());
    status.set_condition(
        Condition::new(
            condition_types::UPLOADED,
            ConditionStatus::True,
            condition_reasons::UPLOAD_FOUND,
            format!("Found upload with MD5 {}", upload.md5_checksum),
        )
        .observed(generation),
    );
}

fn mark_awaiting(status: &mut ObjectStatus, upload: &UploadSource, generation: Option<i64>) {
    status.set_condition(
        Condition::new(
            condition_types::UPLOADED,
            ConditionStatus::False,
            condition_reasons::AWAITING_UPLOAD,
            format!("Waiting for upload with MD5 {}", upload.md5_checksum),
        )
        .observed(generation),
    );
}

/// Advance the handshake for `upload`, recording progress in `status`.
///
/// A missing object is "still pending", never an error. SCI failures are
/// returned so the caller can requeue.
pub async fn reconcile_upload(
    sci: &dyn SciClient,
    artifact: &BucketUrl,
    upload: &UploadSource,
    status: &mut ObjectStatus,
    generation: Option<i64>,
) -> Result<UploadState, BuildError> {
    let current = status.build_upload.clone().unwrap_or_default();

    if current
        .stored_md5_checksum
        .as_deref()
        .is_some_and(|stored| checksums_match(stored, &upload.md5_checksum))
    {
        mark_found(status, upload, generation);
        return Ok(UploadState::Found);
    }

    let object = artifact.object(UPLOAD_OBJECT);
    let stored = sci.get_object_md5(&artifact.bucket, &object).await?;
    if stored
        .as_deref()
        .is_some_and(|stored| checksums_match(stored, &upload.md5_checksum))
    {
        info!(
            bucket = %artifact.bucket,
            object = %object,
            md5 = %upload.md5_checksum,
            "Upload found"
        );
        mark_found(status, upload, generation);
        return Ok(UploadState::Found);
    }

    if current.request_id.as_deref() == Some(upload.request_id.as_str()) {
        debug!(
            bucket = %artifact.bucket,
            object = %object,
            stored = ?stored,
            "Upload not present yet"
        );
        mark_awaiting(status, upload, generation);
        return Ok(UploadState::Awaiting { issued_url: false });
    }

    let url = sci
        .create_signed_url(
            &artifact.bucket,
            &object,
            UPLOAD_URL_EXPIRATION,
            &upload.md5_checksum,
        )
        .await?;
    let expiration = Utc::now()
        + chrono::Duration::seconds(UPLOAD_URL_EXPIRATION.as_secs() as i64);
    status.build_upload = Some(UploadStatus {
        signed_url: Some(url),
        request_id: Some(upload.request_id.clone()),
        expiration: Some(expiration),
        stored_md5_checksum: current.stored_md5_checksum,
    });
    mark_awaiting(status, upload, generation);
    info!(
        bucket = %artifact.bucket,
        object = %object,
        request_id = %upload.request_id,
        "Issued upload URL"
    );
    Ok(UploadState::Awaiting { issued_url: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_sci::{MockSciClient, SciError};

    const MD5: &str = "5d41402abc4b2a76b9719d911017c592";

    fn artifact() -> BucketUrl {
        "gs://kiln-artifacts/abc123".parse().unwrap()
    }

    fn upload(request_id: &str) -> UploadSource {
        UploadSource {
            md5_checksum: MD5.to_string(),
            request_id: request_id.to_string(),
        }
    }

    #[tokio::test]
    async fn story_first_request_issues_a_signed_url() {
        let mut sci = MockSciClient::new();
        sci.expect_get_object_md5()
            .withf(|bucket, object| {
                bucket == "kiln-artifacts" && object == "abc123/uploads/latest.tar.gz"
            })
            .returning(|_, _| Ok(None));
        sci.expect_create_signed_url()
            .withf(|_, _, expiration, md5| {
                *expiration == Duration::from_secs(300) && md5 == MD5
            })
            .times(1)
            .returning(|_, _, _, _| Ok("https://signed/1".to_string()));

        let mut status = ObjectStatus::default();
        let state = reconcile_upload(&sci, &artifact(), &upload("r1"), &mut status, Some(1))
            .await
            .unwrap();

        assert_eq!(state, UploadState::Awaiting { issued_url: true });
        let handshake = status.build_upload.as_ref().unwrap();
        assert_eq!(handshake.signed_url.as_deref(), Some("https://signed/1"));
        assert_eq!(handshake.request_id.as_deref(), Some("r1"));
        assert!(handshake.expiration.is_some());
        let cond = status.condition(condition_types::UPLOADED).unwrap();
        assert_eq!(cond.reason, condition_reasons::AWAITING_UPLOAD);
        assert_eq!(cond.status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn story_same_request_id_never_reissues() {
        let mut sci = MockSciClient::new();
        sci.expect_get_object_md5()
            .returning(|_, _| Ok(Some("ffffffffffffffffffffffffffffffff".to_string())));
        sci.expect_create_signed_url().never();

        let mut status = ObjectStatus {
            build_upload: Some(UploadStatus {
                signed_url: Some("https://signed/1".to_string()),
                request_id: Some("r1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let state = reconcile_upload(&sci, &artifact(), &upload("r1"), &mut status, Some(1))
            .await
            .unwrap();
        assert_eq!(state, UploadState::Awaiting { issued_url: false });
        assert_eq!(
            status.build_upload.as_ref().unwrap().signed_url.as_deref(),
            Some("https://signed/1")
        );
    }

    #[tokio::test]
    async fn story_matching_checksum_completes_the_handshake() {
        let mut sci = MockSciClient::new();
        sci.expect_get_object_md5()
            .times(1)
            .returning(|_, _| Ok(Some(MD5.to_uppercase())));
        sci.expect_create_signed_url().never();

        let mut status = ObjectStatus {
            build_upload: Some(UploadStatus {
                request_id: Some("r1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let state = reconcile_upload(&sci, &artifact(), &upload("r1"), &mut status, Some(2))
            .await
            .unwrap();
        assert_eq!(state, UploadState::Found);
        assert_eq!(
            status
                .build_upload
                .as_ref()
                .unwrap()
                .stored_md5_checksum
                .as_deref(),
            Some(MD5)
        );
        assert!(status.is_true(condition_types::UPLOADED));

        // terminal for this checksum: no further SCI calls
        let idle = MockSciClient::new();
        let before = status.clone();
        let state = reconcile_upload(&idle, &artifact(), &upload("r2"), &mut status, Some(2))
            .await
            .unwrap();
        assert_eq!(state, UploadState::Found);
        assert_eq!(
            status.build_upload.as_ref().unwrap().request_id.as_deref(),
            Some("r2")
        );
        assert_eq!(status.conditions, before.conditions);
    }

    #[tokio::test]
    async fn new_request_id_for_present_object_skips_the_url() {
        let mut sci = MockSciClient::new();
        sci.expect_get_object_md5()
            .returning(|_, _| Ok(Some(MD5.to_string())));
        sci.expect_create_signed_url().never();

        let mut status = ObjectStatus::default();
        let state = reconcile_upload(&sci, &artifact(), &upload("r9"), &mut status, None)
            .await
            .unwrap();
        assert_eq!(state, UploadState::Found);
        assert_eq!(
            status.condition(condition_types::UPLOADED).unwrap().reason,
            condition_reasons::UPLOAD_FOUND
        );
    }

    #[tokio::test]
    async fn sci_outage_is_returned_for_requeue() {
        let mut sci = MockSciClient::new();
        sci.expect_get_object_md5()
            .returning(|_, _| Err(SciError::unavailable("gcp", "HTTP 503")));

        let mut status = ObjectStatus::default();
        let err = reconcile_upload(&sci, &artifact(), &upload("r1"), &mut status, None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(status, ObjectStatus::default());
    }
}
