//! The transcode pipeline.
//!
//! One job runs `Received -> Probing -> (Transcoding720p)? -> Thumbnailing
//! -> Uploading -> Saving -> Completed`, with `Failed` reachable from any
//! stage. Probe failure, zero successful uploads and a failed save are
//! fatal; 720p derivation and thumbnail extraction are best-effort. Every
//! checkpoint is emitted through the progress sink and progress never
//! decreases within a job.

use crate::application::uploader::{
    remove_file_if_exists, StorageUploadCoordinator, UploadProgressReporter,
};
use crate::domain::artifact::{ResolutionArtifact, VideoRecord, VideoSummary};
use crate::domain::pid::ProcessId;
use crate::ports::media::MediaProcessor;
use crate::ports::notifier::ProgressSink;
use crate::ports::repository::VideoRepository;
use crate::ports::storage::ObjectStore;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

/// One submitted job, as recovered from the forwarded request.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub pid: ProcessId,
    pub user_id: String,
    pub username: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub source_path: PathBuf,
    pub original_name: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStage {
    Received,
    Probing,
    Transcoding720p,
    Thumbnailing,
    Uploading,
    Saving,
}

impl JobStage {
    fn status(self) -> &'static str {
        match self {
            JobStage::Received => "starting",
            JobStage::Probing => "processing_video",
            JobStage::Transcoding720p => "creating_720p",
            JobStage::Thumbnailing => "processing_thumbnail",
            JobStage::Uploading => "uploading",
            JobStage::Saving => "saving",
        }
    }

    fn checkpoint(self) -> u8 {
        match self {
            JobStage::Received => 10,
            JobStage::Probing => 20,
            JobStage::Transcoding720p => 40,
            JobStage::Thumbnailing => 50,
            JobStage::Uploading => 60,
            JobStage::Saving => 80,
        }
    }
}

const UPLOAD_PHASE_START: u8 = 60;
const UPLOAD_PHASE_END: u8 = 80;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to probe source video: {0}")]
    Probe(String),

    #[error("all rendition uploads failed: {0}")]
    AllUploadsFailed(String),

    #[error("failed to save video record: {0}")]
    Save(String),
}

#[derive(Debug, Clone)]
pub struct TranscodeSettings {
    /// Approximate output size budget for the derived 720p rendition.
    pub target_size_mb: u32,
    pub audio_bitrate_kbps: u32,
    /// Derived video bitrates below this are clamped rather than emitting
    /// an unwatchable rendition.
    pub min_video_bitrate_kbps: u32,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            target_size_mb: 256,
            audio_bitrate_kbps: 128,
            min_video_bitrate_kbps: 500,
        }
    }
}

pub struct TranscodePipeline<M, O, R, P> {
    media: M,
    uploader: StorageUploadCoordinator<O>,
    repository: R,
    sink: P,
    settings: TranscodeSettings,
}

impl<M, O, R, P> TranscodePipeline<M, O, R, P>
where
    M: MediaProcessor,
    O: ObjectStore,
    R: VideoRepository,
    P: ProgressSink,
{
    pub fn new(media: M, uploader: StorageUploadCoordinator<O>, repository: R, sink: P) -> Self {
        Self {
            media,
            uploader,
            repository,
            sink,
            settings: TranscodeSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: TranscodeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Run one job to a terminal state. The terminal `complete`/`error`
    /// event is always emitted here, and no temp file of the job survives
    /// a failure.
    pub async fn run(&self, job: UploadJob) -> Result<VideoSummary, PipelineError> {
        match self.execute(&job).await {
            Ok(summary) => {
                let result = serde_json::json!({ "success": true, "video": &summary });
                self.sink
                    .complete(&job.pid, &job.user_id, Some(result))
                    .await;
                info!(pid = %job.pid, title = %summary.title, "job completed");
                Ok(summary)
            }
            Err(e) => {
                warn!(pid = %job.pid, error = %e, "job failed");
                self.sink
                    .error(&job.pid, &job.user_id, &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    async fn execute(&self, job: &UploadJob) -> Result<VideoSummary, PipelineError> {
        self.checkpoint(job, JobStage::Received).await;

        // Probe. Without dimensions and duration nothing downstream works,
        // so failure here is fatal and the source is removed.
        self.checkpoint(job, JobStage::Probing).await;
        let (info, duration) = match self.probe_source(job).await {
            Ok(probed) => probed,
            Err(e) => {
                remove_file_if_exists(&job.source_path).await;
                return Err(PipelineError::Probe(e));
            }
        };
        debug!(pid = %job.pid, width = info.width, height = info.height, duration, "source probed");

        let mut renditions = vec![ResolutionArtifact {
            resolution: format!("{}p", info.height),
            path: job.source_path.clone(),
            width: info.width,
            height: info.height,
            size: job.size,
        }];

        if info.height > 720 {
            self.checkpoint(job, JobStage::Transcoding720p).await;
            if let Some(artifact) = self.try_create_720p(job, info.width, info.height, duration).await
            {
                renditions.push(artifact);
            }
        } else {
            debug!(pid = %job.pid, "source is 720p or lower, skipping 720p derivation");
        }

        self.checkpoint(job, JobStage::Thumbnailing).await;
        let thumbnail = self.try_extract_thumbnail(job).await;

        self.checkpoint(job, JobStage::Uploading).await;
        let reporter = UploadProgressReporter {
            sink: &self.sink,
            pid: &job.pid,
            user_id: &job.user_id,
            phase_start: UPLOAD_PHASE_START,
            phase_end: UPLOAD_PHASE_END,
        };
        let batch = self
            .uploader
            .upload_all(&renditions, thumbnail.as_deref(), Some(&reporter))
            .await;

        // whatever didn't make it to storage has no further use on disk;
        // uploaded artifacts were already deleted by the coordinator
        self.cleanup_job_files(&renditions, thumbnail.as_deref()).await;

        if batch.resolutions.is_empty() {
            let first_error = batch
                .errors
                .first()
                .map(|e| e.error.clone())
                .unwrap_or_else(|| "no renditions produced".to_string());
            return Err(PipelineError::AllUploadsFailed(first_error));
        }

        self.checkpoint(job, JobStage::Saving).await;
        let record = VideoRecord {
            title: job
                .title
                .clone()
                .unwrap_or_else(|| job.original_name.clone()),
            description: job.description.clone().unwrap_or_default(),
            resolutions: batch.resolutions,
            mime_type: job.mime_type.clone(),
            thumbnail: batch.thumbnail.and_then(|t| t.url),
            duration: duration.max(0.0).floor() as u64,
            categories: job.categories.clone(),
            tags: job.tags.clone(),
            uploader: job.user_id.clone(),
            uploader_name: job.username.clone(),
        };

        match self.repository.save(&record).await {
            Ok(summary) => Ok(summary),
            Err(e) => Err(PipelineError::Save(e.to_string())),
        }
    }

    /// Emit a terminal error for a job that failed before the pipeline
    /// could even start (e.g. the source never arrived).
    pub async fn report_failure(&self, pid: &ProcessId, user_id: &str, message: &str) {
        warn!(pid = %pid, error = message, "job failed before processing");
        self.sink.error(pid, user_id, message).await;
    }

    async fn probe_source(
        &self,
        job: &UploadJob,
    ) -> Result<(crate::ports::media::SourceInfo, f64), String> {
        let info = self
            .media
            .probe(&job.source_path)
            .await
            .map_err(|e| e.to_string())?;
        let duration = self
            .media
            .duration_secs(&job.source_path)
            .await
            .map_err(|e| e.to_string())?;
        Ok((info, duration))
    }

    /// Best-effort: a job must not fail solely because the secondary
    /// rendition couldn't be built. Partial output from a failed attempt
    /// is deleted.
    async fn try_create_720p(
        &self,
        job: &UploadJob,
        src_width: u32,
        src_height: u32,
        duration: f64,
    ) -> Option<ResolutionArtifact> {
        let file_name = job
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source.mp4".to_string());
        let output = job
            .source_path
            .with_file_name(format!("720p-{file_name}"));

        let bitrate = self.derive_720p_bitrate(duration);
        match self
            .media
            .create_720p(&job.source_path, &output, bitrate)
            .await
        {
            Ok(size) if size > 0 => {
                info!(pid = %job.pid, size_mb = size / (1024 * 1024), "720p rendition created");
                Some(ResolutionArtifact {
                    resolution: "720p".to_string(),
                    path: output,
                    width: ((src_width as u64 * 720) / src_height as u64) as u32,
                    height: 720,
                    size,
                })
            }
            Ok(_) => {
                warn!(pid = %job.pid, "720p rendition came out empty, continuing without it");
                remove_file_if_exists(&output).await;
                None
            }
            Err(e) => {
                warn!(pid = %job.pid, error = %e, "720p creation failed, continuing with original only");
                remove_file_if_exists(&output).await;
                None
            }
        }
    }

    /// Derive a video bitrate (kbps) that lands the 720p rendition near the
    /// configured size budget for the given duration.
    fn derive_720p_bitrate(&self, duration_secs: f64) -> Option<u32> {
        if duration_secs <= 0.0 {
            return None;
        }
        let derived = (self.settings.target_size_mb as f64 * 8192.0) / duration_secs
            - self.settings.audio_bitrate_kbps as f64;
        if derived <= 0.0 {
            return Some(self.settings.min_video_bitrate_kbps);
        }
        Some((derived as u32).max(self.settings.min_video_bitrate_kbps))
    }

    async fn try_extract_thumbnail(&self, job: &UploadJob) -> Option<PathBuf> {
        let output = job.source_path.with_extension("jpg");
        match self
            .media
            .extract_thumbnail(&job.source_path, &output)
            .await
        {
            Ok(()) => Some(output),
            Err(e) => {
                warn!(pid = %job.pid, error = %e, "thumbnail extraction failed, continuing without one");
                None
            }
        }
    }

    async fn cleanup_job_files(
        &self,
        renditions: &[ResolutionArtifact],
        thumbnail: Option<&std::path::Path>,
    ) {
        for rendition in renditions {
            remove_file_if_exists(&rendition.path).await;
        }
        if let Some(thumb) = thumbnail {
            remove_file_if_exists(thumb).await;
        }
    }

    async fn checkpoint(&self, job: &UploadJob, stage: JobStage) {
        debug!(pid = %job.pid, stage = stage.status(), "stage transition");
        self.sink
            .progress(&job.pid, &job.user_id, stage.checkpoint(), stage.status(), None)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::artifact::ResolutionSummary;
    use crate::ports::media::{MockMediaProcessor, SourceInfo};
    use crate::ports::notifier::recording::{Emitted, RecordingSink};
    use crate::ports::repository::MockVideoRepository;
    use crate::ports::storage::{MockObjectStore, StorageError, StoredObject};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn job(dir: &TempDir) -> UploadJob {
        let source = dir.path().join("1715000000-42.mp4");
        fs::write(&source, vec![0u8; 64]).unwrap();
        UploadJob {
            pid: ProcessId::from("pid-1".to_string()),
            user_id: "user-1".to_string(),
            username: "tester".to_string(),
            title: Some("clip".to_string()),
            description: None,
            categories: vec![],
            tags: vec![],
            source_path: source,
            original_name: "clip.mp4".to_string(),
            mime_type: "video/mp4".to_string(),
            size: 64,
        }
    }

    fn probe_ok(media: &mut MockMediaProcessor, width: u32, height: u32, duration: f64) {
        media
            .expect_probe()
            .returning(move |_| Ok(SourceInfo { width, height, codec: Some("h264".into()) }));
        media
            .expect_duration_secs()
            .returning(move |_| Ok(duration));
    }

    fn thumbnail_ok(media: &mut MockMediaProcessor) {
        media.expect_extract_thumbnail().returning(|_, output| {
            fs::write(output, b"jpeg").unwrap();
            Ok(())
        });
    }

    fn store_all_ok(store: &mut MockObjectStore) {
        store.expect_upload_file().returning(|_, key: &str| {
            Ok(StoredObject {
                file_id: format!("id-{key}"),
                file_name: key.to_string(),
                url: Some(format!("https://bucket.example/{key}")),
                size: 64,
            })
        });
    }

    fn repo_ok(repo: &mut MockVideoRepository) {
        repo.expect_save().returning(|record| {
            Ok(VideoSummary {
                id: "video-1".to_string(),
                title: record.title.clone(),
                description: record.description.clone(),
                thumbnail: record.thumbnail.clone(),
                duration: record.duration,
                resolutions: record
                    .resolutions
                    .iter()
                    .map(|r| ResolutionSummary {
                        resolution: r.resolution.clone(),
                        size: r.size,
                    })
                    .collect(),
                mime_type: record.mime_type.clone(),
            })
        });
    }

    fn pipeline(
        media: MockMediaProcessor,
        store: MockObjectStore,
        repo: MockVideoRepository,
        sink: Arc<RecordingSink>,
    ) -> TranscodePipeline<MockMediaProcessor, MockObjectStore, MockVideoRepository, Arc<RecordingSink>>
    {
        TranscodePipeline::new(media, StorageUploadCoordinator::new(store), repo, sink)
    }

    fn assert_monotonic(values: &[u8]) {
        for pair in values.windows(2) {
            assert!(
                pair[1] >= pair[0],
                "progress decreased: {} -> {} in {values:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[tokio::test]
    async fn hd_source_produces_two_renditions() {
        let dir = TempDir::new().unwrap();
        let job = job(&dir);

        let mut media = MockMediaProcessor::new();
        probe_ok(&mut media, 1920, 1080, 120.0);
        media.expect_create_720p().times(1).returning(|_, output, bitrate| {
            assert!(bitrate.is_some());
            fs::write(output, vec![0u8; 32]).unwrap();
            Ok(32)
        });
        thumbnail_ok(&mut media);

        let mut store = MockObjectStore::new();
        store_all_ok(&mut store);

        let mut repo = MockVideoRepository::new();
        repo.expect_save()
            .withf(|record| {
                record.resolutions.len() == 2
                    && record.resolutions.iter().any(|r| r.resolution == "1080p")
                    && record.resolutions.iter().any(|r| r.resolution == "720p")
                    && record.thumbnail.is_some()
                    && record.uploader == "user-1"
                    && record.uploader_name == "tester"
            })
            .returning(|record| {
                Ok(VideoSummary {
                    id: "video-1".to_string(),
                    title: record.title.clone(),
                    description: String::new(),
                    thumbnail: record.thumbnail.clone(),
                    duration: record.duration,
                    resolutions: vec![],
                    mime_type: record.mime_type.clone(),
                })
            });

        let sink = Arc::new(RecordingSink::new());
        let result = pipeline(media, store, repo, sink.clone()).run(job).await;

        assert!(result.is_ok());
        assert_monotonic(&sink.progress_values());
        assert!(matches!(
            sink.emitted().last().unwrap(),
            Emitted::Complete { .. }
        ));
    }

    #[tokio::test]
    async fn sd_source_skips_720p_derivation() {
        let dir = TempDir::new().unwrap();
        let job = job(&dir);

        let mut media = MockMediaProcessor::new();
        probe_ok(&mut media, 854, 480, 60.0);
        media.expect_create_720p().times(0);
        thumbnail_ok(&mut media);

        let mut store = MockObjectStore::new();
        store_all_ok(&mut store);
        let mut repo = MockVideoRepository::new();
        repo.expect_save()
            .withf(|record| record.resolutions.len() == 1 && record.resolutions[0].resolution == "480p")
            .returning(|_| {
                Ok(VideoSummary {
                    id: "v".into(),
                    title: "clip".into(),
                    description: String::new(),
                    thumbnail: None,
                    duration: 60,
                    resolutions: vec![],
                    mime_type: "video/mp4".into(),
                })
            });

        let sink = Arc::new(RecordingSink::new());
        let result = pipeline(media, store, repo, sink.clone()).run(job).await;
        assert!(result.is_ok());
        assert_monotonic(&sink.progress_values());
    }

    #[tokio::test]
    async fn probe_failure_is_fatal_and_cleans_source() {
        let dir = TempDir::new().unwrap();
        let job = job(&dir);
        let source = job.source_path.clone();

        let mut media = MockMediaProcessor::new();
        media
            .expect_probe()
            .returning(|_| Err("moov atom not found".into()));
        media.expect_duration_secs().times(0);

        let mut store = MockObjectStore::new();
        store.expect_upload_file().times(0);
        let mut repo = MockVideoRepository::new();
        repo.expect_save().times(0);

        let sink = Arc::new(RecordingSink::new());
        let result = pipeline(media, store, repo, sink.clone()).run(job).await;

        assert!(matches!(result, Err(PipelineError::Probe(_))));
        assert!(!source.exists(), "source temp file must be deleted");
        assert!(matches!(
            sink.emitted().last().unwrap(),
            Emitted::Error { .. }
        ));
    }

    #[tokio::test]
    async fn failed_720p_is_best_effort() {
        let dir = TempDir::new().unwrap();
        let job = job(&dir);

        let mut media = MockMediaProcessor::new();
        probe_ok(&mut media, 1920, 1080, 120.0);
        media.expect_create_720p().times(1).returning(|_, output, _| {
            // a failed encode can leave a partial file behind
            fs::write(output, b"partial").unwrap();
            Err("encoder exited with status 1".into())
        });
        thumbnail_ok(&mut media);

        let mut store = MockObjectStore::new();
        store_all_ok(&mut store);
        let mut repo = MockVideoRepository::new();
        repo.expect_save()
            .withf(|record| record.resolutions.len() == 1)
            .returning(|_| {
                Ok(VideoSummary {
                    id: "v".into(),
                    title: "clip".into(),
                    description: String::new(),
                    thumbnail: None,
                    duration: 120,
                    resolutions: vec![],
                    mime_type: "video/mp4".into(),
                })
            });

        let sink = Arc::new(RecordingSink::new());
        let partial = job.source_path.with_file_name("720p-1715000000-42.mp4");
        let result = pipeline(media, store, repo, sink.clone()).run(job).await;

        assert!(result.is_ok());
        assert!(!partial.exists(), "partial 720p output must be deleted");
    }

    #[tokio::test]
    async fn one_upload_failure_still_completes() {
        let dir = TempDir::new().unwrap();
        let job = job(&dir);

        let mut media = MockMediaProcessor::new();
        probe_ok(&mut media, 1920, 1080, 120.0);
        media.expect_create_720p().returning(|_, output, _| {
            fs::write(output, vec![0u8; 32]).unwrap();
            Ok(32)
        });
        thumbnail_ok(&mut media);

        let mut store = MockObjectStore::new();
        store.expect_upload_file().returning(|_, key: &str| {
            if key.contains("720p") {
                Err(StorageError::Rejected("checksum mismatch".into()))
            } else {
                Ok(StoredObject {
                    file_id: "id".into(),
                    file_name: key.to_string(),
                    url: Some(format!("https://bucket.example/{key}")),
                    size: 64,
                })
            }
        });

        let mut repo = MockVideoRepository::new();
        repo.expect_save()
            .withf(|record| {
                record.resolutions.len() == 1 && record.resolutions[0].resolution == "1080p"
            })
            .returning(|_| {
                Ok(VideoSummary {
                    id: "v".into(),
                    title: "clip".into(),
                    description: String::new(),
                    thumbnail: None,
                    duration: 120,
                    resolutions: vec![],
                    mime_type: "video/mp4".into(),
                })
            });

        let sink = Arc::new(RecordingSink::new());
        let failed_rendition = job.source_path.with_file_name("720p-1715000000-42.mp4");
        let result = pipeline(media, store, repo, sink.clone()).run(job).await;

        assert!(result.is_ok(), "job must complete when one rendition survives");
        assert!(
            !failed_rendition.exists(),
            "failed rendition's temp file must be swept after the batch"
        );
        assert!(matches!(
            sink.emitted().last().unwrap(),
            Emitted::Complete { .. }
        ));
    }

    #[tokio::test]
    async fn failure_before_processing_reaches_the_sink() {
        let sink = Arc::new(RecordingSink::new());
        let p = pipeline(
            MockMediaProcessor::new(),
            MockObjectStore::new(),
            MockVideoRepository::new(),
            sink.clone(),
        );

        p.report_failure(
            &ProcessId::from("p1".to_string()),
            "u1",
            "Download failed",
        )
        .await;

        match sink.emitted().last().unwrap() {
            Emitted::Error { message } => assert_eq!(message, "Download failed"),
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn all_uploads_failing_fails_job_without_record() {
        let dir = TempDir::new().unwrap();
        let job = job(&dir);
        let source = job.source_path.clone();

        let mut media = MockMediaProcessor::new();
        probe_ok(&mut media, 1920, 1080, 120.0);
        media.expect_create_720p().returning(|_, output, _| {
            fs::write(output, vec![0u8; 32]).unwrap();
            Ok(32)
        });
        thumbnail_ok(&mut media);

        let mut store = MockObjectStore::new();
        store
            .expect_upload_file()
            .returning(|_, _| Err(StorageError::Auth("key revoked".into())));

        let mut repo = MockVideoRepository::new();
        repo.expect_save().times(0);

        let sink = Arc::new(RecordingSink::new());
        let result = pipeline(media, store, repo, sink.clone()).run(job).await;

        assert!(matches!(result, Err(PipelineError::AllUploadsFailed(_))));
        assert!(!source.exists(), "all temp files must be deleted on failure");
        assert!(matches!(
            sink.emitted().last().unwrap(),
            Emitted::Error { .. }
        ));
    }

    #[test]
    fn bitrate_derivation_follows_size_budget() {
        let settings = TranscodeSettings::default();
        let p: TranscodePipeline<MockMediaProcessor, MockObjectStore, MockVideoRepository, Arc<RecordingSink>> =
            TranscodePipeline::new(
                MockMediaProcessor::new(),
                StorageUploadCoordinator::new(MockObjectStore::new()),
                MockVideoRepository::new(),
                Arc::new(RecordingSink::new()),
            )
            .with_settings(settings);

        // 256 MB over 1000s => ~2097 - 128 kbps
        assert_eq!(p.derive_720p_bitrate(1000.0), Some(1969));
        // absurdly long source clamps to the floor instead of going negative
        assert_eq!(p.derive_720p_bitrate(10_000_000.0), Some(500));
        // unknown duration: no size-based cap
        assert_eq!(p.derive_720p_bitrate(0.0), None);
    }

    #[tokio::test]
    async fn checkpoints_are_monotonic_through_full_run() {
        let dir = TempDir::new().unwrap();
        let job = job(&dir);

        let mut media = MockMediaProcessor::new();
        probe_ok(&mut media, 1920, 1080, 90.0);
        media.expect_create_720p().returning(|_, output, _| {
            fs::write(output, vec![0u8; 32]).unwrap();
            Ok(32)
        });
        thumbnail_ok(&mut media);

        let mut store = MockObjectStore::new();
        store_all_ok(&mut store);
        let mut repo = MockVideoRepository::new();
        repo_ok(&mut repo);

        let sink = Arc::new(RecordingSink::new());
        pipeline(media, store, repo, sink.clone())
            .run(job)
            .await
            .unwrap();

        let values = sink.progress_values();
        assert!(values.first() == Some(&10));
        assert!(values.contains(&20));
        assert!(values.contains(&40));
        assert!(values.contains(&50));
        assert!(values.contains(&80));
        assert_monotonic(&values);
    }
}
