use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::{Body, Client};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::error::UploadError;
use crate::models::{AuthorizationGrant, TransferOutcome, UploadFile};

/// Moves file bytes to the storage endpoint named by a grant.
///
/// Implementations report integer percentages on `progress` as bytes are
/// sent and must only report 100 once the storage backend has accepted the
/// object. Raising `cancel` aborts the transfer with
/// [`UploadError::TransferCancelled`].
#[async_trait]
pub trait TransferEngine: Send + Sync {
    async fn transfer(
        &self,
        file: &UploadFile,
        grant: &AuthorizationGrant,
        progress: UnboundedSender<u8>,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome, UploadError>;
}

/// Single-PUT transfer over reqwest.
///
/// The client must carry no default headers: signature-based storage
/// backends reject any header the URL signature does not cover. reqwest's
/// built-in `Accept: */*` is the one exception and is never signed.
pub struct HttpTransferEngine {
    client: Client,
    chunk_size: usize,
    require_integrity_token: bool,
}

impl HttpTransferEngine {
    pub fn new(client: Client, chunk_size: usize, require_integrity_token: bool) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
            require_integrity_token,
        }
    }

    fn progress_body(&self, data: Bytes, progress: UnboundedSender<u8>) -> Body {
        Body::wrap_stream(progress_stream(data, self.chunk_size, progress))
    }
}

/// Splits `data` into chunks, reporting the share already handed to the
/// consumer each time the next chunk is requested. Capped at 99 since 100 is
/// reserved for the storage response.
fn progress_stream(
    data: Bytes,
    chunk_size: usize,
    progress: UnboundedSender<u8>,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    let total = data.len();

    async_stream::stream! {
        let mut offset = 0;
        while offset < total {
            let end = (offset + chunk_size).min(total);
            yield Ok::<Bytes, std::io::Error>(data.slice(offset..end));
            offset = end;
            let _ = progress.send(percent_of(offset, total).min(99));
        }
    }
}

#[async_trait]
impl TransferEngine for HttpTransferEngine {
    async fn transfer(
        &self,
        file: &UploadFile,
        grant: &AuthorizationGrant,
        progress: UnboundedSender<u8>,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::TransferCancelled);
        }

        // Content-Length is transport framing; object stores refuse chunked PUTs.
        let mut request = self
            .client
            .put(&grant.upload_url)
            .header(CONTENT_TYPE, file.content_type.as_str())
            .header(CONTENT_LENGTH, file.size());
        for (name, value) in &grant.required_headers {
            if name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()) {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        let request = request.body(self.progress_body(file.data.clone(), progress.clone()));

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::TransferCancelled),
            result = request.send() => result.map_err(|e| UploadError::TransferFailed {
                status: None,
                body: Some(e.to_string()),
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.ok();
            return Err(UploadError::TransferFailed {
                status: Some(status.as_u16()),
                body,
            });
        }

        let integrity_token = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .and_then(normalize_etag);

        if integrity_token.is_none() && self.require_integrity_token {
            return Err(UploadError::IntegrityTokenMissing);
        }

        let _ = progress.send(100);
        Ok(TransferOutcome { integrity_token })
    }
}

/// `floor(sent / total * 100)`; an empty body counts as complete.
pub fn percent_of(sent: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent.min(total) as u128 * 100) / total as u128) as u8
}

/// Strips a weak-validator prefix and surrounding quotes from an ETag.
pub fn normalize_etag(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("W/").unwrap_or(trimmed);
    let token = trimmed.trim_matches('"');
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
