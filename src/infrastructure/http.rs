use reqwest::Client;
use std::sync::Arc;
use tracing::info;

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::services::authorization::HttpAuthorizationClient;
use crate::services::batch::BatchCoordinator;
use crate::services::confirmation::HttpConfirmationClient;
use crate::services::registry::UploadRegistry;
use crate::services::transfer::HttpTransferEngine;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Client for the authorizing service.
pub fn setup_api_client() -> Result<Client, UploadError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| UploadError::Config(format!("failed to build API client: {}", e)))
}

/// Client for presigned storage PUTs. Sets no user agent or default headers,
/// leaving reqwest's built-in `Accept: */*` as the only header beyond
/// Host, Content-Type and Content-Length.
pub fn setup_storage_client() -> Result<Client, UploadError> {
    Client::builder()
        .build()
        .map_err(|e| UploadError::Config(format!("failed to build storage client: {}", e)))
}

/// Wires the HTTP-backed pipeline stages around a fresh registry.
pub fn setup_coordinator(config: &UploadConfig) -> Result<BatchCoordinator, UploadError> {
    let authorization_url = config.authorization_url()?;
    let confirmation_url = config.confirmation_url()?;
    let api_client = setup_api_client()?;

    info!(
        "☁️  Upload service: {} (authorize: {}, confirm: {})",
        config.api_base_url, authorization_url, confirmation_url
    );

    let authorizer = HttpAuthorizationClient::new(
        api_client.clone(),
        authorization_url,
        config.api_token.clone(),
    );
    let confirmer =
        HttpConfirmationClient::new(api_client, confirmation_url, config.api_token.clone());
    let engine = HttpTransferEngine::new(
        setup_storage_client()?,
        config.chunk_size,
        config.require_integrity_token,
    );

    Ok(BatchCoordinator::new(
        Arc::new(UploadRegistry::new()),
        Arc::new(authorizer),
        Arc::new(engine),
        Arc::new(confirmer),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_coordinator_rejects_bad_base_url() {
        let config = UploadConfig {
            api_base_url: "::nope::".to_string(),
            ..UploadConfig::default()
        };
        assert!(matches!(
            setup_coordinator(&config),
            Err(UploadError::Config(_))
        ));
    }

    #[test]
    fn test_setup_coordinator_starts_empty() {
        let coordinator = setup_coordinator(&UploadConfig::development()).unwrap();
        assert!(coordinator.registry().is_empty());
        assert_eq!(coordinator.aggregate_progress(), 0);
    }
}
