//! Access tokens from instance metadata
//!
//! GCP and Azure both hand out OAuth tokens for the node or workload identity
//! through a metadata endpoint. Tokens are cached until shortly before they
//! expire.

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::SciError;

/// Refresh this long before the advertised expiry
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

pub(crate) struct MetadataToken {
    backend: &'static str,
    url: String,
    header: (&'static str, &'static str),
    cached: Mutex<Option<(String, Instant)>>,
}

impl MetadataToken {
    pub(crate) fn new(backend: &'static str, url: String, header: (&'static str, &'static str)) -> Self {
        Self {
            backend,
            url,
            header,
            cached: Mutex::new(None),
        }
    }

    /// A valid bearer token, fetched if the cached one is missing or stale
    pub(crate) async fn get(&self, http: &reqwest::Client) -> Result<String, SciError> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expires)) = cached.as_ref() {
            if Instant::now() + EXPIRY_SKEW < *expires {
                return Ok(token.clone());
            }
        }

        let resp = http
            .get(&self.url)
            .header(self.header.0, self.header.1)
            .send()
            .await
            .map_err(|e| SciError::from_reqwest(self.backend, e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SciError::from_http(self.backend, status.as_u16(), &body));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| SciError::from_reqwest(self.backend, e))?;
        let (token, ttl) = parse_token(&body).ok_or_else(|| {
            SciError::backend(self.backend, "metadata token response missing access_token")
        })?;

        debug!(backend = self.backend, ttl_secs = ttl, "Fetched access token");
        *cached = Some((token.clone(), Instant::now() + Duration::from_secs(ttl)));
        Ok(token)
    }
}

/// Extract `access_token` and `expires_in`. Azure reports `expires_in` as a
/// string, GCP as a number.
fn parse_token(body: &Value) -> Option<(String, u64)> {
    let token = body.get("access_token")?.as_str()?.to_string();
    let ttl = match body.get("expires_in") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    };
    Some((token, ttl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_expiry_encodings() {
        let gcp = serde_json::json!({"access_token": "ya29", "expires_in": 3599, "token_type": "Bearer"});
        assert_eq!(parse_token(&gcp), Some(("ya29".to_string(), 3599)));

        let azure = serde_json::json!({"access_token": "eyJ", "expires_in": "86399"});
        assert_eq!(parse_token(&azure), Some(("eyJ".to_string(), 86399)));

        assert_eq!(parse_token(&serde_json::json!({})), None);
    }
}
