use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::error::UploadError;
use crate::models::{FileId, FileStatus, StatusUpdate, TrackedFile, UploadEvent, UploadFile};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Session-scoped store of every file handed to the uploader.
///
/// Entries are keyed by [`FileId`] and deduplicated on `(name, size)`. All
/// mutation goes through the methods below; each one publishes an
/// [`UploadEvent`] to subscribers after the change is committed.
pub struct UploadRegistry {
    files: DashMap<FileId, TrackedFile>,
    identities: DashMap<(String, u64), FileId>,
    sequence: AtomicU64,
    events: broadcast::Sender<UploadEvent>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            files: DashMap::new(),
            identities: DashMap::new(),
            sequence: AtomicU64::new(0),
            events,
        }
    }

    /// Registers files, returning one id per input in input order.
    /// A file whose name and size match a live entry maps to that entry.
    pub fn register(&self, files: &[UploadFile]) -> Vec<FileId> {
        files
            .iter()
            .map(|file| match self.identities.entry((file.name.clone(), file.size())) {
                Entry::Occupied(existing) => *existing.get(),
                Entry::Vacant(slot) => {
                    let id = FileId::new();
                    self.files.insert(
                        id,
                        TrackedFile {
                            id,
                            name: file.name.clone(),
                            size: file.size(),
                            content_type: file.content_type.clone(),
                            status: FileStatus::Pending,
                            progress: 0,
                            remote_key: None,
                            integrity_token: None,
                            error_message: None,
                            registered_at: Utc::now(),
                            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                        },
                    );
                    slot.insert(id);
                    tracing::debug!(file_id = %id, file = %file.name, "registered file");
                    self.publish(UploadEvent::Registered { id });
                    id
                }
            })
            .collect()
    }

    /// Updates progress, clamped to 100. Unknown ids are ignored, as are
    /// regressions while uploading and any change after success.
    pub fn set_progress(&self, id: FileId, percent: u8) {
        let percent = percent.min(100);
        let Some(mut entry) = self.files.get_mut(&id) else {
            return;
        };

        let accepted = match entry.status {
            FileStatus::Success => false,
            FileStatus::Uploading => percent > entry.progress,
            FileStatus::Pending | FileStatus::Error => percent != entry.progress,
        };
        if !accepted {
            return;
        }

        entry.progress = percent;
        drop(entry);
        self.publish(UploadEvent::Progress { id, percent });
    }

    /// Applies a status transition and only the fields that belong to it.
    pub fn set_status(&self, id: FileId, update: StatusUpdate) -> Result<(), UploadError> {
        let mut entry = self
            .files
            .get_mut(&id)
            .ok_or(UploadError::UnknownFile(id))?;

        let next = update.status();
        if !entry.status.can_transition_to(next) {
            return Err(UploadError::InvalidTransition {
                from: entry.status,
                to: next,
            });
        }

        let previous_progress = entry.progress;
        match update {
            StatusUpdate::Uploading => {
                // Retry starts over
                entry.progress = 0;
                entry.error_message = None;
            }
            StatusUpdate::Success {
                remote_key,
                integrity_token,
            } => {
                entry.progress = 100;
                entry.remote_key = Some(remote_key);
                entry.integrity_token = integrity_token;
            }
            StatusUpdate::Error { message } => {
                entry.error_message = Some(message);
            }
        }
        entry.status = next;
        let progress = entry.progress;
        drop(entry);

        if progress != previous_progress {
            self.publish(UploadEvent::Progress {
                id,
                percent: progress,
            });
        }
        self.publish(UploadEvent::StatusChanged { id, status: next });
        Ok(())
    }

    /// Deletes an entry. Does not cancel an in-flight transfer.
    pub fn remove(&self, id: FileId) -> Option<TrackedFile> {
        let (_, removed) = self.files.remove(&id)?;
        self.identities
            .remove_if(&(removed.name.clone(), removed.size), |_, owner| *owner == id);
        self.publish(UploadEvent::Removed { id });
        Some(removed)
    }

    pub fn clear(&self) {
        self.files.clear();
        self.identities.clear();
        self.publish(UploadEvent::Cleared);
    }

    pub fn get(&self, id: FileId) -> Option<TrackedFile> {
        self.files.get(&id).map(|entry| entry.value().clone())
    }

    /// All entries in registration order.
    pub fn list(&self) -> Vec<TrackedFile> {
        let mut files: Vec<TrackedFile> = self
            .files
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        files.sort_by_key(|f| f.sequence);
        files
    }

    pub fn count_with_status(&self, status: FileStatus) -> usize {
        self.files
            .iter()
            .filter(|entry| entry.status == status)
            .count()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Mean progress across every tracked file; successful files count as 100.
    pub fn aggregate_progress(&self) -> u8 {
        let (total, count) = self.files.iter().fold((0u64, 0u64), |(sum, n), entry| {
            let progress = match entry.status {
                FileStatus::Success => 100,
                _ => entry.progress as u64,
            };
            (sum + progress, n + 1)
        });

        if count == 0 {
            return 0;
        }
        (total / count) as u8
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: UploadEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for UploadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
