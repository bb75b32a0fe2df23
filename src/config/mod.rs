use std::env;
use url::Url;

use crate::error::UploadError;
use crate::models::DEFAULT_MAX_CONCURRENT;
use crate::utils::validation::DEFAULT_ALLOWED_CONTENT_TYPES;

/// Configuration for talking to the upload service
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Base URL of the authorizing service (default: "http://localhost:3000")
    pub api_base_url: String,

    /// Path of the authorization endpoint (default: "/upload-authorization")
    pub authorization_path: String,

    /// Path of the confirmation endpoint (default: "/upload-confirmation")
    pub confirmation_path: String,

    /// Bearer token sent to the service, never to storage
    pub api_token: Option<String>,

    /// Concurrent per-file pipelines per batch (default: 3)
    pub max_concurrent: usize,

    /// Destination prefix used when the caller gives none (default: "uploads/")
    pub default_prefix: Option<String>,

    /// Request publicly readable objects (default: false)
    pub is_public: bool,

    /// Fail transfers whose storage response carries no ETag (default: true)
    pub require_integrity_token: bool,

    /// Body chunk size in bytes, drives progress granularity (default: 64 KB)
    pub chunk_size: usize,

    /// Maximum file size in bytes (default: 50 MB)
    pub max_file_size: u64,

    /// Accepted content types, empty accepts everything
    pub allowed_content_types: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            authorization_path: "/upload-authorization".to_string(),
            confirmation_path: "/upload-confirmation".to_string(),
            api_token: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_prefix: Some("uploads/".to_string()),
            is_public: false,
            require_integrity_token: true,
            chunk_size: 64 * 1024, // 64 KB
            max_file_size: 50 * 1024 * 1024, // 50 MB
            allowed_content_types: DEFAULT_ALLOWED_CONTENT_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl UploadConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            api_base_url: env::var("UPLOAD_API_URL").unwrap_or(default.api_base_url),

            authorization_path: env::var("UPLOAD_AUTHORIZATION_PATH")
                .unwrap_or(default.authorization_path),

            confirmation_path: env::var("UPLOAD_CONFIRMATION_PATH")
                .unwrap_or(default.confirmation_path),

            api_token: env::var("UPLOAD_API_TOKEN").ok().filter(|t| !t.is_empty()),

            max_concurrent: env::var("UPLOAD_MAX_CONCURRENT")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(default.max_concurrent),

            default_prefix: match env::var("UPLOAD_DEFAULT_PREFIX") {
                Ok(v) if v.trim().is_empty() => None,
                Ok(v) => Some(v),
                Err(_) => default.default_prefix,
            },

            is_public: env::var("UPLOAD_PUBLIC")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default.is_public),

            require_integrity_token: env::var("UPLOAD_REQUIRE_ETAG")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(default.require_integrity_token),

            chunk_size: env::var("UPLOAD_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(default.chunk_size),

            max_file_size: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_size),

            allowed_content_types: env::var("ALLOWED_CONTENT_TYPES")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(default.allowed_content_types),
        }
    }

    /// Create config for a local development service (relaxed checks)
    pub fn development() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            require_integrity_token: false,
            max_file_size: 1024 * 1024 * 1024,
            allowed_content_types: Vec::new(),
            ..Self::default()
        }
    }

    pub fn authorization_url(&self) -> Result<Url, UploadError> {
        self.endpoint(&self.authorization_path)
    }

    pub fn confirmation_url(&self) -> Result<Url, UploadError> {
        self.endpoint(&self.confirmation_path)
    }

    fn endpoint(&self, path: &str) -> Result<Url, UploadError> {
        let base = Url::parse(&self.api_base_url).map_err(|e| {
            UploadError::Config(format!("invalid UPLOAD_API_URL '{}': {}", self.api_base_url, e))
        })?;
        base.join(path)
            .map_err(|e| UploadError::Config(format!("invalid endpoint path '{}': {}", path, e)))
    }
}
