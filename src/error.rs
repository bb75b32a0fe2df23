use thiserror::Error;

use crate::models::{FileId, FileStatus};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Transfer failed{}", transfer_detail(.status, .body))]
    TransferFailed {
        status: Option<u16>,
        body: Option<String>,
    },

    #[error("Upload cancelled")]
    TransferCancelled,

    #[error("Storage response did not include an integrity token")]
    IntegrityTokenMissing,

    #[error("Confirmation failed: {0}")]
    Confirmation(String),

    #[error("Unknown file: {0}")]
    UnknownFile(FileId),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: FileStatus, to: FileStatus },

    #[error("File {id} cannot be retried while {status}")]
    NotRetryable { id: FileId, status: FileStatus },

    #[error("{code}: {message}")]
    Validation { code: &'static str, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn transfer_detail(status: &Option<u16>, body: &Option<String>) -> String {
    match (status, body.as_deref().filter(|b| !b.is_empty())) {
        (Some(code), Some(body)) => format!(" (HTTP {}): {}", code, body),
        (Some(code), None) => format!(" (HTTP {})", code),
        (None, Some(body)) => format!(": {}", body),
        (None, None) => String::new(),
    }
}

impl UploadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::TransferCancelled)
    }
}
