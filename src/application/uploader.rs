//! Storage upload coordination.
//!
//! Uploads every produced rendition plus the thumbnail, retrying only
//! classified-transient failures, and aggregates partial failures instead
//! of aborting the batch: the job as a whole fails only when zero
//! renditions make it to storage. Local temp files are deleted the moment
//! their upload succeeds.

use crate::domain::artifact::{ResolutionArtifact, UploadError, UploadedRendition};
use crate::domain::pid::ProcessId;
use crate::domain::protocol::{DetailedProgress, FAILED_RENDITION};
use crate::ports::notifier::ProgressSink;
use crate::ports::storage::{ObjectStore, StorageError, StoredObject};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct UploadRetryConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for UploadRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Everything that happened to one batch: successes, the thumbnail (when
/// it made it), and every per-artifact failure.
#[derive(Debug, Default)]
pub struct UploadBatch {
    pub resolutions: Vec<UploadedRendition>,
    pub thumbnail: Option<StoredObject>,
    pub errors: Vec<UploadError>,
}

/// Maps per-rendition upload milestones into the job's overall progress
/// range and forwards them to the sink together with the structured
/// per-resolution map.
pub struct UploadProgressReporter<'a, P: ProgressSink + ?Sized> {
    pub sink: &'a P,
    pub pid: &'a ProcessId,
    pub user_id: &'a str,
    pub phase_start: u8,
    pub phase_end: u8,
}

impl<'a, P: ProgressSink + ?Sized> UploadProgressReporter<'a, P> {
    async fn report(&self, done: usize, total: usize, detail: &DetailedProgress) {
        let span = self.phase_end.saturating_sub(self.phase_start) as usize;
        let progress = self.phase_start + (span * done / total.max(1)) as u8;
        self.sink
            .progress(self.pid, self.user_id, progress, "uploading", Some(detail.clone()))
            .await;
    }
}

pub struct StorageUploadCoordinator<O> {
    store: O,
    retry: UploadRetryConfig,
}

impl<O: ObjectStore> StorageUploadCoordinator<O> {
    pub fn new(store: O) -> Self {
        Self {
            store,
            retry: UploadRetryConfig::default(),
        }
    }

    pub fn with_retry(store: O, retry: UploadRetryConfig) -> Self {
        Self { store, retry }
    }

    /// Upload all renditions and the optional thumbnail. Never fails as a
    /// whole; callers inspect the batch to decide whether the job survived.
    pub async fn upload_all<P: ProgressSink + ?Sized>(
        &self,
        renditions: &[ResolutionArtifact],
        thumbnail: Option<&Path>,
        reporter: Option<&UploadProgressReporter<'_, P>>,
    ) -> UploadBatch {
        let mut batch = UploadBatch::default();
        let total = renditions.len();

        // queued state: every rendition at 0
        let mut detail: DetailedProgress = renditions
            .iter()
            .map(|r| (r.resolution.clone(), 0))
            .collect();
        if let Some(reporter) = reporter {
            reporter.report(0, total, &detail).await;
        }

        for (done, rendition) in renditions.iter().enumerate() {
            let key = object_key("videos", &rendition.path);

            match self.upload_with_retry(&rendition.path, &key).await {
                Ok(stored) => {
                    info!(
                        resolution = %rendition.resolution,
                        key = %stored.file_name,
                        "rendition uploaded"
                    );
                    detail.insert(rendition.resolution.clone(), 100);
                    batch.resolutions.push(UploadedRendition {
                        resolution: rendition.resolution.clone(),
                        url: stored.url.clone(),
                        size: stored.size,
                        width: rendition.width,
                        height: rendition.height,
                        file_id: stored.file_id,
                    });
                    remove_local(&rendition.path).await;
                }
                Err(e) => {
                    warn!(
                        resolution = %rendition.resolution,
                        error = %e,
                        "rendition upload failed"
                    );
                    detail.insert(rendition.resolution.clone(), FAILED_RENDITION);
                    batch.errors.push(UploadError {
                        label: rendition.resolution.clone(),
                        filename: rendition.path.clone(),
                        error: e.to_string(),
                    });
                }
            }

            if let Some(reporter) = reporter {
                reporter.report(done + 1, total, &detail).await;
            }
        }

        if let Some(thumb_path) = thumbnail {
            let key = object_key("thumbnails", thumb_path);
            match self.upload_with_retry(thumb_path, &key).await {
                Ok(stored) => {
                    batch.thumbnail = Some(stored);
                    remove_local(thumb_path).await;
                }
                Err(e) => {
                    warn!(error = %e, "thumbnail upload failed");
                    batch.errors.push(UploadError {
                        label: "thumbnail".to_string(),
                        filename: thumb_path.to_path_buf(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if !batch.errors.is_empty() && !batch.resolutions.is_empty() {
            warn!(
                failed = batch.errors.len(),
                succeeded = batch.resolutions.len(),
                "batch finished with partial upload failures"
            );
        }

        batch
    }

    async fn upload_with_retry(
        &self,
        path: &Path,
        key: &str,
    ) -> Result<StoredObject, StorageError> {
        let mut backoff = self.retry.base_backoff;
        let mut attempt = 1;

        loop {
            match self.store.upload_file(path, key).await {
                Ok(stored) => return Ok(stored),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(
                        key,
                        attempt,
                        max = self.retry.max_attempts,
                        error = %e,
                        "transient upload failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn object_key(prefix: &str, path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    format!("{prefix}/{name}")
}

async fn remove_local(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "failed to delete local temp file");
    } else {
        info!(path = %path.display(), "local temp file deleted");
    }
}

/// Delete a file if it still exists, logging rather than failing.
pub async fn remove_file_if_exists(path: &Path) {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        remove_local(path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::notifier::recording::{Emitted, RecordingSink};
    use crate::ports::storage::MockObjectStore;
    use std::fs;
    use tempfile::tempdir;

    fn artifact(dir: &Path, resolution: &str, height: u32) -> ResolutionArtifact {
        let path = dir.join(format!("{resolution}-video.mp4"));
        fs::write(&path, b"fake video bytes").unwrap();
        ResolutionArtifact {
            resolution: resolution.to_string(),
            path,
            width: height * 16 / 9,
            height,
            size: 16,
        }
    }

    fn stored(name: &str) -> StoredObject {
        StoredObject {
            file_id: format!("id-{name}"),
            file_name: name.to_string(),
            url: Some(format!("https://bucket.example/{name}")),
            size: 16,
        }
    }

    fn fast_retry() -> UploadRetryConfig {
        UploadRetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn successful_batch_deletes_local_files() {
        let dir = tempdir().unwrap();
        let renditions = vec![artifact(dir.path(), "1080p", 1080), artifact(dir.path(), "720p", 720)];

        let mut store = MockObjectStore::new();
        store
            .expect_upload_file()
            .times(2)
            .returning(|_, key| Ok(stored(key)));

        let coordinator = StorageUploadCoordinator::new(store);
        let batch = coordinator
            .upload_all::<RecordingSink>(&renditions, None, None)
            .await;

        assert_eq!(batch.resolutions.len(), 2);
        assert!(batch.errors.is_empty());
        assert!(!renditions[0].path.exists());
        assert!(!renditions[1].path.exists());
    }

    #[tokio::test]
    async fn partial_failure_keeps_going_and_marks_sentinel() {
        let dir = tempdir().unwrap();
        let renditions = vec![artifact(dir.path(), "1080p", 1080), artifact(dir.path(), "720p", 720)];

        let mut store = MockObjectStore::new();
        store.expect_upload_file().returning(|_, key: &str| {
            if key.contains("720p") {
                Err(StorageError::Rejected("bad key".into()))
            } else {
                Ok(stored(key))
            }
        });

        let coordinator = StorageUploadCoordinator::with_retry(store, fast_retry());
        let sink = RecordingSink::new();
        let pid = ProcessId::from("p1".to_string());
        let reporter = UploadProgressReporter {
            sink: &sink,
            pid: &pid,
            user_id: "u1",
            phase_start: 60,
            phase_end: 80,
        };

        let batch = coordinator
            .upload_all(&renditions, None, Some(&reporter))
            .await;

        assert_eq!(batch.resolutions.len(), 1);
        assert_eq!(batch.resolutions[0].resolution, "1080p");
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].label, "720p");
        // the coordinator itself never deletes a failed rendition's file;
        // the pipeline sweeps it after the batch
        assert!(renditions[1].path.exists());

        let last_detail = sink
            .emitted()
            .into_iter()
            .rev()
            .find_map(|e| match e {
                Emitted::Progress { detail, .. } => detail,
                _ => None,
            })
            .unwrap();
        assert_eq!(last_detail["1080p"], 100);
        assert_eq!(last_detail["720p"], FAILED_RENDITION);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_with_backoff() {
        let dir = tempdir().unwrap();
        let renditions = vec![artifact(dir.path(), "480p", 480)];

        let mut attempts = 0;
        let mut store = MockObjectStore::new();
        store.expect_upload_file().times(3).returning(move |_, key| {
            attempts += 1;
            if attempts < 3 {
                Err(StorageError::Connection("reset".into()))
            } else {
                Ok(stored(key))
            }
        });

        let coordinator = StorageUploadCoordinator::with_retry(store, fast_retry());
        let batch = coordinator
            .upload_all::<RecordingSink>(&renditions, None, None)
            .await;

        assert_eq!(batch.resolutions.len(), 1);
        assert!(batch.errors.is_empty());
    }

    #[tokio::test]
    async fn non_transient_errors_fail_immediately() {
        let dir = tempdir().unwrap();
        let renditions = vec![artifact(dir.path(), "480p", 480)];

        let mut store = MockObjectStore::new();
        store
            .expect_upload_file()
            .times(1)
            .returning(|_, _| Err(StorageError::Auth("expired".into())));

        let coordinator = StorageUploadCoordinator::with_retry(store, fast_retry());
        let batch = coordinator
            .upload_all::<RecordingSink>(&renditions, None, None)
            .await;

        assert!(batch.resolutions.is_empty());
        assert_eq!(batch.errors.len(), 1);
    }

    #[tokio::test]
    async fn thumbnail_failure_is_collected_not_fatal() {
        let dir = tempdir().unwrap();
        let renditions = vec![artifact(dir.path(), "480p", 480)];
        let thumb = dir.path().join("thumb.jpg");
        fs::write(&thumb, b"jpeg").unwrap();

        let mut store = MockObjectStore::new();
        store.expect_upload_file().returning(|_, key: &str| {
            if key.starts_with("thumbnails/") {
                Err(StorageError::Rejected("nope".into()))
            } else {
                Ok(stored(key))
            }
        });

        let coordinator = StorageUploadCoordinator::with_retry(store, fast_retry());
        let batch = coordinator
            .upload_all::<RecordingSink>(&renditions, Some(&thumb), None)
            .await;

        assert_eq!(batch.resolutions.len(), 1);
        assert!(batch.thumbnail.is_none());
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].label, "thumbnail");
    }
}
