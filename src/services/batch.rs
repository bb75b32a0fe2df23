use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::UploadError;
use crate::models::{
    AuthorizationRequest, BatchResult, ConfirmedFile, FileId, FileStatus, StatusUpdate,
    UploadFile, UploadOptions,
};
use crate::services::authorization::Authorizer;
use crate::services::confirmation::Confirmer;
use crate::services::registry::UploadRegistry;
use crate::services::transfer::TransferEngine;

/// What a pipeline needs to (re)run one file.
#[derive(Clone)]
struct QueuedUpload {
    file: UploadFile,
    options: Arc<UploadOptions>,
}

/// Runs authorize -> transfer -> confirm for many files with a bounded
/// sliding window, recording every outcome in the shared registry.
pub struct BatchCoordinator {
    registry: Arc<UploadRegistry>,
    authorizer: Arc<dyn Authorizer>,
    engine: Arc<dyn TransferEngine>,
    confirmer: Arc<dyn Confirmer>,
    uploads: DashMap<FileId, QueuedUpload>,
    in_flight: DashMap<FileId, CancellationToken>,
    root: Mutex<CancellationToken>,
}

impl BatchCoordinator {
    pub fn new(
        registry: Arc<UploadRegistry>,
        authorizer: Arc<dyn Authorizer>,
        engine: Arc<dyn TransferEngine>,
        confirmer: Arc<dyn Confirmer>,
    ) -> Self {
        Self {
            registry,
            authorizer,
            engine,
            confirmer,
            uploads: DashMap::new(),
            in_flight: DashMap::new(),
            root: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn registry(&self) -> &Arc<UploadRegistry> {
        &self.registry
    }

    pub fn aggregate_progress(&self) -> u8 {
        self.registry.aggregate_progress()
    }

    /// Uploads `files`, returning one result per input in input order.
    ///
    /// Individual failures never abort the batch; they land in the registry
    /// as `error` and in the returned results as `success: false`.
    pub async fn upload_batch(
        &self,
        files: Vec<UploadFile>,
        options: UploadOptions,
    ) -> Vec<BatchResult> {
        let max_concurrent = options.max_concurrent.max(1);
        let options = Arc::new(options);
        let ids = self.registry.register(&files);
        let batch_token = self.root_token().child_token();

        let mut seen = HashSet::new();
        let mut queue = Vec::new();
        for (id, file) in ids.iter().zip(&files) {
            if !seen.insert(*id) {
                continue;
            }
            let upload = QueuedUpload {
                file: file.clone(),
                options: options.clone(),
            };
            if let Some(token) = self.claim(*id, &batch_token, &upload) {
                queue.push((*id, upload, token));
            }
        }

        tracing::info!(
            files = files.len(),
            queued = queue.len(),
            max_concurrent,
            "starting upload batch"
        );

        let results: HashMap<FileId, BatchResult> = stream::iter(queue)
            .map(|(id, upload, token)| async move {
                let result = self.run_pipeline(id, &upload, token).await;
                (id, result)
            })
            .buffer_unordered(max_concurrent)
            .collect()
            .await;

        let succeeded = results.values().filter(|r| r.success).count();
        tracing::info!(
            succeeded,
            failed = results.len() - succeeded,
            "upload batch finished"
        );

        ids.iter()
            .zip(&files)
            .map(|(id, file)| {
                results
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| self.settled_result(*id, file))
            })
            .collect()
    }

    /// Re-runs the full pipeline for one file in `error` status.
    pub async fn retry_single(&self, id: FileId) -> Result<BatchResult, UploadError> {
        let tracked = self.registry.get(id).ok_or(UploadError::UnknownFile(id))?;
        if tracked.status != FileStatus::Error {
            return Err(UploadError::NotRetryable {
                id,
                status: tracked.status,
            });
        }

        let upload = self
            .uploads
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(UploadError::UnknownFile(id))?;

        let token = match self.in_flight.entry(id) {
            Entry::Occupied(_) => {
                return Err(UploadError::NotRetryable {
                    id,
                    status: FileStatus::Uploading,
                });
            }
            Entry::Vacant(slot) => {
                let token = self.root_token().child_token();
                slot.insert(token.clone());
                token
            }
        };

        tracing::info!(file_id = %id, file = %upload.file.name, "retrying upload");
        Ok(self.run_pipeline(id, &upload, token).await)
    }

    /// Cancels one file's queued or in-flight pipeline.
    pub fn cancel(&self, id: FileId) -> bool {
        match self.in_flight.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every queued and in-flight pipeline. Later batches are unaffected.
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.in_flight.len();
        let mut root = self.root.lock().unwrap_or_else(|e| e.into_inner());
        root.cancel();
        *root = CancellationToken::new();
        tracing::info!(cancelled, "cancelled all uploads");
        cancelled
    }

    /// Cancels and forgets a file.
    pub fn discard(&self, id: FileId) -> bool {
        self.cancel(id);
        self.uploads.remove(&id);
        self.registry.remove(id).is_some()
    }

    pub fn clear(&self) {
        self.cancel_all();
        self.uploads.clear();
        self.registry.clear();
    }

    fn root_token(&self) -> CancellationToken {
        self.root
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Reserves a file for this batch if it still needs uploading and no
    /// other pipeline owns it.
    fn claim(
        &self,
        id: FileId,
        batch_token: &CancellationToken,
        upload: &QueuedUpload,
    ) -> Option<CancellationToken> {
        match self.in_flight.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let status = self.registry.get(id)?.status;
                if !matches!(status, FileStatus::Pending | FileStatus::Error) {
                    return None;
                }
                let token = batch_token.child_token();
                slot.insert(token.clone());
                self.uploads.insert(id, upload.clone());
                Some(token)
            }
        }
    }

    /// Result for an input that this batch did not run itself.
    fn settled_result(&self, id: FileId, file: &UploadFile) -> BatchResult {
        match self.registry.get(id) {
            Some(tracked) if tracked.status == FileStatus::Success => BatchResult {
                file_id: id,
                key: tracked.remote_key,
                size: tracked.size,
                integrity_token: tracked.integrity_token,
                success: true,
                error_message: None,
            },
            Some(tracked) if tracked.status == FileStatus::Uploading => {
                BatchResult::failed(id, file.size(), "upload already in progress")
            }
            Some(tracked) => BatchResult::failed(
                id,
                file.size(),
                tracked
                    .error_message
                    .unwrap_or_else(|| format!("upload not started ({})", tracked.status)),
            ),
            None => BatchResult::failed(id, file.size(), "file was removed before upload"),
        }
    }

    async fn run_pipeline(
        &self,
        id: FileId,
        upload: &QueuedUpload,
        cancel: CancellationToken,
    ) -> BatchResult {
        let span = tracing::info_span!("upload", file_id = %id, file = %upload.file.name);

        async {
            let outcome = self.execute(id, upload, &cancel).await;
            self.in_flight.remove(&id);

            match outcome {
                Ok(confirmed) => {
                    tracing::info!(key = %confirmed.final_key, size = confirmed.size, "upload confirmed");
                    let update = StatusUpdate::Success {
                        remote_key: confirmed.final_key.clone(),
                        integrity_token: confirmed.integrity_token.clone(),
                    };
                    if let Err(e) = self.registry.set_status(id, update) {
                        tracing::warn!("Could not record success: {}", e);
                    }
                    self.uploads.remove(&id);
                    BatchResult::succeeded(id, confirmed)
                }
                Err(err) => {
                    if err.is_cancelled() {
                        tracing::info!("upload cancelled");
                    } else {
                        tracing::warn!(error = %err, "upload failed");
                    }
                    let message = err.to_string();
                    let update = StatusUpdate::Error {
                        message: message.clone(),
                    };
                    if let Err(e) = self.registry.set_status(id, update) {
                        tracing::warn!("Could not record failure: {}", e);
                    }
                    BatchResult::failed(id, upload.file.size(), message)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        id: FileId,
        upload: &QueuedUpload,
        cancel: &CancellationToken,
    ) -> Result<ConfirmedFile, UploadError> {
        let file = &upload.file;
        self.registry.set_status(id, StatusUpdate::Uploading)?;
        if cancel.is_cancelled() {
            return Err(UploadError::TransferCancelled);
        }

        // 1. Authorize
        let request = AuthorizationRequest::for_file(file, &upload.options);
        let grant = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::TransferCancelled),
            grant = self.authorizer.request_authorization(&request) => grant?,
        };
        if grant.is_expired() {
            tracing::warn!(object_key = %grant.object_key, "authorization already expired");
        }

        // 2. Transfer, forwarding progress into the registry as it arrives
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut transfer = self.engine.transfer(file, &grant, progress_tx, cancel.clone());
        let transferred = loop {
            tokio::select! {
                Some(percent) = progress_rx.recv() => self.registry.set_progress(id, percent),
                result = &mut transfer => break result,
            }
        };
        while let Ok(percent) = progress_rx.try_recv() {
            self.registry.set_progress(id, percent);
        }
        let transferred = transferred?;
        tracing::debug!(object_key = %grant.object_key, "transfer complete");

        // 3. Confirm
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::TransferCancelled),
            confirmed = self.confirmer.confirm(
                &grant.object_key,
                transferred.integrity_token.as_deref(),
            ) => confirmed,
        }
    }
}
