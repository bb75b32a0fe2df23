use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use uuid::Uuid;

use crate::error::UploadError;
use crate::utils::validation::{detect_content_type, sanitize_filename};

/// Default number of per-file pipelines a batch runs at once
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Stable identifier of a registry entry. Never derived from the filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Uploading,
    Success,
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Uploading => "uploading",
            FileStatus::Success => "success",
            FileStatus::Error => "error",
        }
    }

    /// Whether the registry state machine admits `self -> next`.
    pub fn can_transition_to(self, next: FileStatus) -> bool {
        matches!(
            (self, next),
            (FileStatus::Pending, FileStatus::Uploading)
                | (FileStatus::Uploading, FileStatus::Success)
                | (FileStatus::Uploading, FileStatus::Error)
                | (FileStatus::Error, FileStatus::Uploading)
        )
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one registered file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedFile {
    pub id: FileId,
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub status: FileStatus,
    pub progress: u8,
    pub remote_key: Option<String>,
    pub integrity_token: Option<String>,
    pub error_message: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) sequence: u64,
}

/// A status change together with the fields that belong to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Uploading,
    Success {
        remote_key: String,
        integrity_token: Option<String>,
    },
    Error {
        message: String,
    },
}

impl StatusUpdate {
    pub fn status(&self) -> FileStatus {
        match self {
            StatusUpdate::Uploading => FileStatus::Uploading,
            StatusUpdate::Success { .. } => FileStatus::Success,
            StatusUpdate::Error { .. } => FileStatus::Error,
        }
    }
}

/// Change notifications published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Registered { id: FileId },
    Progress { id: FileId, percent: u8 },
    StatusChanged { id: FileId, status: FileStatus },
    Removed { id: FileId },
    Cleared,
}

/// A file handed to the uploader by the caller.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl UploadFile {
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Reads a local file, sanitizing its name and sniffing the content type
    /// from its leading bytes.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let raw_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let name = sanitize_filename(raw_name)?;
        let data = tokio::fs::read(path).await?;
        let content_type = detect_content_type(&data);

        Ok(Self::new(name, content_type, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Per-batch settings.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub destination_prefix: Option<String>,
    pub is_public: bool,
    pub metadata: HashMap<String, String>,
    pub max_concurrent: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            destination_prefix: None,
            is_public: false,
            metadata: HashMap::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    pub file_name: String,
    pub content_type: String,
    #[serde(rename = "prefix", skip_serializing_if = "Option::is_none")]
    pub destination_prefix: Option<String>,
    pub is_public: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl AuthorizationRequest {
    pub fn for_file(file: &UploadFile, options: &UploadOptions) -> Self {
        Self {
            file_name: file.name.clone(),
            content_type: file.content_type.clone(),
            destination_prefix: options.destination_prefix.clone(),
            is_public: options.is_public,
            metadata: options.metadata.clone(),
        }
    }
}

/// Single-use permission to PUT one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationGrant {
    pub upload_url: String,
    pub object_key: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Headers covered by the URL signature that must accompany the PUT.
    pub required_headers: BTreeMap<String, String>,
}

impl AuthorizationGrant {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub integrity_token: Option<String>,
}

/// Canonical file metadata returned by the confirmation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedFile {
    pub final_key: String,
    pub size: u64,
    pub integrity_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub file_id: FileId,
    pub key: Option<String>,
    pub size: u64,
    pub integrity_token: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl BatchResult {
    pub fn succeeded(file_id: FileId, confirmed: ConfirmedFile) -> Self {
        Self {
            file_id,
            key: Some(confirmed.final_key),
            size: confirmed.size,
            integrity_token: confirmed.integrity_token,
            success: true,
            error_message: None,
        }
    }

    pub fn failed(file_id: FileId, size: u64, message: impl Into<String>) -> Self {
        Self {
            file_id,
            key: None,
            size,
            integrity_token: None,
            success: false,
            error_message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_transitions() {
        assert!(FileStatus::Pending.can_transition_to(FileStatus::Uploading));
        assert!(FileStatus::Uploading.can_transition_to(FileStatus::Success));
        assert!(FileStatus::Uploading.can_transition_to(FileStatus::Error));
        assert!(FileStatus::Error.can_transition_to(FileStatus::Uploading));

        assert!(!FileStatus::Pending.can_transition_to(FileStatus::Success));
        assert!(!FileStatus::Success.can_transition_to(FileStatus::Uploading));
        assert!(!FileStatus::Error.can_transition_to(FileStatus::Success));
    }

    #[test]
    fn test_authorization_request_wire_format() {
        let file = UploadFile::new("photo.png", "image/png", vec![0u8; 4]);
        let options = UploadOptions {
            destination_prefix: Some("sketches/".to_string()),
            ..Default::default()
        };

        let json = serde_json::to_value(AuthorizationRequest::for_file(&file, &options)).unwrap();
        assert_eq!(json["fileName"], "photo.png");
        assert_eq!(json["contentType"], "image/png");
        assert_eq!(json["prefix"], "sketches/");
        assert_eq!(json["isPublic"], false);
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn test_authorization_request_carries_visibility_and_metadata() {
        let file = UploadFile::new("photo.png", "image/png", vec![0u8; 4]);
        let options = UploadOptions {
            is_public: true,
            metadata: HashMap::from([("owner".to_string(), "someone".to_string())]),
            ..Default::default()
        };

        let json = serde_json::to_value(AuthorizationRequest::for_file(&file, &options)).unwrap();
        assert_eq!(json["isPublic"], true);
        assert_eq!(json["metadata"]["owner"], "someone");
        assert!(json.get("prefix").is_none());
    }

    #[test]
    fn test_grant_expiry() {
        let mut grant = AuthorizationGrant {
            upload_url: "https://store/x?sig=1".to_string(),
            object_key: "x".to_string(),
            expires_at: None,
            required_headers: BTreeMap::new(),
        };
        assert!(!grant.is_expired());

        grant.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(grant.is_expired());

        grant.expires_at = Some(Utc::now() + Duration::minutes(5));
        assert!(!grant.is_expired());
    }

    #[test]
    fn test_batch_result_serialization() {
        let id = FileId::new();
        let result = BatchResult::succeeded(
            id,
            ConfirmedFile {
                final_key: "x".to_string(),
                size: 2048,
                integrity_token: Some("abc123".to_string()),
            },
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["key"], "x");
        assert_eq!(json["integrityToken"], "abc123");
        assert_eq!(json["success"], true);
        assert!(json.get("errorMessage").is_none());
    }

    #[tokio::test]
    async fn test_from_path_sniffs_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        let mut png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        png.extend_from_slice(&[0u8; 24]);
        std::fs::write(&path, &png).unwrap();

        let file = UploadFile::from_path(&path).await.unwrap();
        assert_eq!(file.name, "photo.png");
        assert_eq!(file.content_type, "image/png");
        assert_eq!(file.size(), 32);

        let missing = UploadFile::from_path(dir.path().join("gone.png")).await;
        assert!(matches!(missing, Err(UploadError::Io(_))));
    }
}
