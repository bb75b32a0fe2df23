//! Direct-to-storage upload orchestration.
//!
//! Files are registered in a shared [`UploadRegistry`], authorized one by one
//! against the upload service, PUT straight to object storage through a
//! presigned URL and finally confirmed with the service. The
//! [`BatchCoordinator`] drives that pipeline for many files at once under a
//! concurrency cap.

pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

pub use config::UploadConfig;
pub use error::UploadError;
pub use models::{
    AuthorizationGrant, BatchResult, FileId, FileStatus, TrackedFile, UploadEvent, UploadFile,
    UploadOptions,
};
pub use services::batch::BatchCoordinator;
pub use services::registry::UploadRegistry;
