//! AWS backend
//!
//! Presigned S3 `PutObject` URLs with `Content-MD5` bound into the
//! signature, checksums from `HeadObject`, and IRSA identity binding by
//! merging the service account subject into the role's trust policy.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::presigning::PresigningConfig;
use percent_encoding::percent_decode_str;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{validate_object, Backend};
use crate::md5::hex_to_base64;
use crate::SciError;

const BACKEND: &str = "aws";
const WEB_IDENTITY_ACTION: &str = "sts:AssumeRoleWithWebIdentity";

/// AWS backend settings
#[derive(Clone, Debug, Default)]
pub struct AwsConfig {
    /// IAM OIDC provider of the cluster, used when a role has no web
    /// identity statement yet
    pub oidc_provider_arn: Option<String>,
}

/// S3 + IAM backend
pub struct AwsBackend {
    s3: aws_sdk_s3::Client,
    iam: aws_sdk_iam::Client,
    config: AwsConfig,
}

impl AwsBackend {
    /// Create a backend from the default credential chain
    pub async fn from_env(config: AwsConfig) -> Self {
        let sdk = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Self {
            s3: aws_sdk_s3::Client::new(&sdk),
            iam: aws_sdk_iam::Client::new(&sdk),
            config,
        }
    }
}

fn sdk_error<E, R>(err: SdkError<E, R>) -> SciError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let transient = matches!(
        err,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)
    );
    let message = DisplayErrorContext(&err).to_string();
    if transient {
        SciError::unavailable(BACKEND, message)
    } else {
        SciError::backend(BACKEND, message)
    }
}

fn as_array(value: &mut Value) -> Option<&mut Vec<Value>> {
    if !value.is_array() {
        let single = value.take();
        *value = Value::Array(if single.is_null() { vec![] } else { vec![single] });
    }
    value.as_array_mut()
}

fn has_action(statement: &Value, action: &str) -> bool {
    match statement.get("Action") {
        Some(Value::String(a)) => a == action,
        Some(Value::Array(actions)) => actions.iter().any(|a| a.as_str() == Some(action)),
        _ => false,
    }
}

/// Add `subject` to the `<issuer>:sub` condition of the role's web identity
/// statement.
///
/// Existing subjects are kept. When the policy has no web identity
/// statement one is created for `provider_arn`. Returns whether the policy
/// changed.
pub fn merge_trust_policy(
    policy: &mut Value,
    subject: &str,
    provider_arn: Option<&str>,
) -> Result<bool, SciError> {
    if !policy.is_object() {
        *policy = json!({ "Version": "2012-10-17" });
    }
    let statements = policy
        .as_object_mut()
        .and_then(|p| as_array(p.entry("Statement").or_insert(Value::Null)))
        .ok_or_else(|| SciError::backend(BACKEND, "trust policy has no statements"))?;

    for statement in statements.iter_mut() {
        if !has_action(statement, WEB_IDENTITY_ACTION) {
            continue;
        }
        let Some(conditions) = statement
            .get_mut("Condition")
            .and_then(|c| c.get_mut("StringEquals"))
            .and_then(Value::as_object_mut)
        else {
            continue;
        };
        let Some((_, subjects)) = conditions.iter_mut().find(|(k, _)| k.ends_with(":sub")) else {
            continue;
        };
        let subjects = as_array(subjects)
            .ok_or_else(|| SciError::backend(BACKEND, "sub condition is not a list"))?;
        if subjects.iter().any(|s| s.as_str() == Some(subject)) {
            return Ok(false);
        }
        subjects.push(Value::String(subject.to_string()));
        return Ok(true);
    }

    let provider_arn = provider_arn.ok_or_else(|| {
        SciError::Config(
            "role has no web identity statement and no OIDC provider ARN is configured"
                .to_string(),
        )
    })?;
    let issuer = provider_arn
        .split_once("oidc-provider/")
        .map(|(_, issuer)| issuer)
        .ok_or_else(|| SciError::Config(format!("'{provider_arn}' is not an OIDC provider ARN")))?;
    statements.push(json!({
        "Effect": "Allow",
        "Principal": { "Federated": provider_arn },
        "Action": WEB_IDENTITY_ACTION,
        "Condition": {
            "StringEquals": {
                format!("{issuer}:sub"): [subject],
                format!("{issuer}:aud"): "sts.amazonaws.com",
            }
        }
    }));
    Ok(true)
}

#[async_trait]
impl Backend for AwsBackend {
    async fn create_signed_url(
        &self,
        bucket: &str,
        object: &str,
        expiration: Duration,
        md5_hex: &str,
    ) -> Result<String, SciError> {
        validate_object(bucket, object)?;
        let presigning = PresigningConfig::expires_in(expiration)
            .map_err(|e| SciError::InvalidArgument(e.to_string()))?;
        let request = self
            .s3
            .put_object()
            .bucket(bucket)
            .key(object)
            .content_md5(hex_to_base64(md5_hex)?)
            .content_type("application/octet-stream")
            .presigned(presigning)
            .await
            .map_err(sdk_error)?;
        Ok(request.uri().to_string())
    }

    async fn get_object_md5(&self, bucket: &str, object: &str) -> Result<Option<String>, SciError> {
        validate_object(bucket, object)?;
        match self.s3.head_object().bucket(bucket).key(object).send().await {
            Ok(head) => Ok(Some(
                head.e_tag()
                    .map(|etag| etag.trim_matches('"').to_ascii_lowercase())
                    .unwrap_or_default(),
            )),
            Err(SdkError::ServiceError(e)) if matches!(e.err(), HeadObjectError::NotFound(_)) => {
                Ok(None)
            }
            Err(e) => Err(sdk_error(e)),
        }
    }

    async fn bind_identity(
        &self,
        principal: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<(), SciError> {
        let role_name = principal.rsplit('/').next().unwrap_or(principal);
        let subject = format!("system:serviceaccount:{namespace}:{service_account}");

        let role = self
            .iam
            .get_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(sdk_error)?;
        let document = role
            .role()
            .and_then(|r| r.assume_role_policy_document())
            .unwrap_or_default();
        let decoded = percent_decode_str(document)
            .decode_utf8()
            .map_err(|e| SciError::backend(BACKEND, format!("trust policy is not utf-8: {e}")))?;
        let mut policy: Value = if decoded.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&decoded)
                .map_err(|e| SciError::backend(BACKEND, format!("invalid trust policy: {e}")))?
        };

        if !merge_trust_policy(&mut policy, &subject, self.config.oidc_provider_arn.as_deref())? {
            debug!(role = role_name, subject, "Trust policy already allows subject");
            return Ok(());
        }

        self.iam
            .update_assume_role_policy()
            .role_name(role_name)
            .policy_document(policy.to_string())
            .send()
            .await
            .map_err(sdk_error)?;
        info!(role = role_name, subject, "Bound workload identity");
        Ok(())
    }
}
