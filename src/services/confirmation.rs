use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::UploadError;
use crate::models::ConfirmedFile;
use crate::services::transfer::normalize_etag;

#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Admits a transferred object into the application. Until this
    /// succeeds the upload is not considered done.
    async fn confirm(
        &self,
        object_key: &str,
        integrity_token: Option<&str>,
    ) -> Result<ConfirmedFile, UploadError>;
}

pub struct HttpConfirmationClient {
    client: Client,
    endpoint: Url,
    api_token: Option<String>,
}

impl HttpConfirmationClient {
    pub fn new(client: Client, endpoint: Url, api_token: Option<String>) -> Self {
        Self {
            client,
            endpoint,
            api_token,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmationRequest<'a> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    integrity_token: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmationResponse {
    #[serde(default)]
    success: bool,
    file_info: Option<FileInfo>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct FileInfo {
    key: String,
    size: u64,
    etag: Option<String>,
}

impl ConfirmationResponse {
    fn into_confirmed(self, submitted_token: Option<&str>) -> Result<ConfirmedFile, UploadError> {
        if !self.success {
            return Err(UploadError::Confirmation(
                self.error
                    .unwrap_or_else(|| "service rejected the upload".to_string()),
            ));
        }

        let info = self.file_info.ok_or_else(|| {
            UploadError::Confirmation("response is missing fileInfo".to_string())
        })?;

        Ok(ConfirmedFile {
            final_key: info.key,
            size: info.size,
            integrity_token: info
                .etag
                .as_deref()
                .and_then(normalize_etag)
                .or_else(|| submitted_token.map(str::to_string)),
        })
    }
}

#[async_trait]
impl Confirmer for HttpConfirmationClient {
    async fn confirm(
        &self,
        object_key: &str,
        integrity_token: Option<&str>,
    ) -> Result<ConfirmedFile, UploadError> {
        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .json(&ConfirmationRequest {
                key: object_key,
                integrity_token,
            });
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| UploadError::Confirmation(format!("service unreachable: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| UploadError::Confirmation(format!("failed to read response: {}", e)))?;

        let parsed = serde_json::from_str::<ConfirmationResponse>(&body);
        if !status.is_success() {
            // Prefer the service's own explanation when it sent one
            let reason = parsed
                .ok()
                .and_then(|r| r.error)
                .unwrap_or(body);
            return Err(UploadError::Confirmation(format!(
                "service returned {}: {}",
                status, reason
            )));
        }

        let payload = parsed
            .map_err(|e| UploadError::Confirmation(format!("invalid response body: {}", e)))?;
        payload.into_confirmed(integrity_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ConfirmationResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_confirmed_file_from_response() {
        let confirmed = parse(
            r#"{"key":"x","success":true,"fileInfo":{"key":"x","size":2048,"etag":"\"abc123\""}}"#,
        )
        .into_confirmed(Some("abc123"))
        .unwrap();

        assert_eq!(
            confirmed,
            ConfirmedFile {
                final_key: "x".to_string(),
                size: 2048,
                integrity_token: Some("abc123".to_string()),
            }
        );
    }

    #[test]
    fn test_falls_back_to_submitted_token() {
        let confirmed = parse(r#"{"success":true,"fileInfo":{"key":"x","size":1}}"#)
            .into_confirmed(Some("local"))
            .unwrap();
        assert_eq!(confirmed.integrity_token.as_deref(), Some("local"));
    }

    #[test]
    fn test_rejection_carries_service_error() {
        let err = parse(r#"{"key":"x","success":false,"error":"object not found"}"#)
            .into_confirmed(None)
            .unwrap_err();
        assert!(matches!(err, UploadError::Confirmation(msg) if msg == "object not found"));

        let err = parse(r#"{"success":true}"#).into_confirmed(None).unwrap_err();
        assert!(matches!(err, UploadError::Confirmation(msg) if msg.contains("fileInfo")));
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_value(ConfirmationRequest {
            key: "x",
            integrity_token: Some("abc123"),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"key": "x", "integrityToken": "abc123"}));
    }
}
