use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use url::Url;

use crate::error::UploadError;
use crate::models::{AuthorizationGrant, AuthorizationRequest};

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// One round-trip to the authorizing service. No retry.
    async fn request_authorization(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizationGrant, UploadError>;
}

pub struct HttpAuthorizationClient {
    client: Client,
    endpoint: Url,
    api_token: Option<String>,
}

impl HttpAuthorizationClient {
    pub fn new(client: Client, endpoint: Url, api_token: Option<String>) -> Self {
        Self {
            client,
            endpoint,
            api_token,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationResponse {
    upload_url: Option<String>,
    object_key: Option<String>,
    expires_at: Option<ExpiresAt>,
    #[serde(default)]
    required_headers: BTreeMap<String, String>,
}

/// Services send either an RFC 3339 timestamp or epoch seconds.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresAt {
    Timestamp(DateTime<Utc>),
    EpochSeconds(i64),
}

impl ExpiresAt {
    fn into_datetime(self) -> Option<DateTime<Utc>> {
        match self {
            ExpiresAt::Timestamp(at) => Some(at),
            ExpiresAt::EpochSeconds(secs) => Utc.timestamp_opt(secs, 0).single(),
        }
    }
}

impl AuthorizationResponse {
    fn into_grant(self) -> Result<AuthorizationGrant, UploadError> {
        let upload_url = self
            .upload_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| UploadError::Authorization("response is missing uploadUrl".to_string()))?;
        let object_key = self
            .object_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| UploadError::Authorization("response is missing objectKey".to_string()))?;

        Ok(AuthorizationGrant {
            upload_url,
            object_key,
            expires_at: self.expires_at.and_then(ExpiresAt::into_datetime),
            required_headers: self.required_headers,
        })
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizationClient {
    async fn request_authorization(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizationGrant, UploadError> {
        let mut builder = self.client.post(self.endpoint.clone()).json(request);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| UploadError::Authorization(format!("service unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Authorization(format!(
                "service returned {}: {}",
                status, body
            )));
        }

        let payload: AuthorizationResponse = response
            .json()
            .await
            .map_err(|e| UploadError::Authorization(format!("invalid response body: {}", e)))?;

        let grant = payload.into_grant()?;
        tracing::debug!(
            object_key = %grant.object_key,
            signed_headers = grant.required_headers.len(),
            "upload authorized"
        );
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<AuthorizationGrant, UploadError> {
        serde_json::from_str::<AuthorizationResponse>(json)
            .unwrap()
            .into_grant()
    }

    #[test]
    fn test_grant_from_full_response() {
        let grant = parse(
            r#"{
                "uploadUrl": "https://store/x?sig=1",
                "objectKey": "x",
                "expiresAt": "2030-01-01T00:05:00Z",
                "requiredHeaders": {"x-amz-acl": "public-read"}
            }"#,
        )
        .unwrap();

        assert_eq!(grant.upload_url, "https://store/x?sig=1");
        assert_eq!(grant.object_key, "x");
        assert_eq!(
            grant.expires_at.unwrap().to_rfc3339(),
            "2030-01-01T00:05:00+00:00"
        );
        assert_eq!(grant.required_headers["x-amz-acl"], "public-read");
    }

    #[test]
    fn test_grant_accepts_epoch_expiry_and_no_headers() {
        let grant = parse(r#"{"uploadUrl": "u", "objectKey": "k", "expiresAt": 1893456000}"#).unwrap();
        assert_eq!(grant.expires_at.unwrap().timestamp(), 1893456000);
        assert!(grant.required_headers.is_empty());
    }

    #[test]
    fn test_missing_fields_rejected() {
        assert!(matches!(
            parse(r#"{"objectKey": "k"}"#),
            Err(UploadError::Authorization(msg)) if msg.contains("uploadUrl")
        ));
        assert!(matches!(
            parse(r#"{"uploadUrl": "u", "objectKey": ""}"#),
            Err(UploadError::Authorization(msg)) if msg.contains("objectKey")
        ));
    }
}
