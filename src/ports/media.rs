//! Media inspection/transcoding port. The actual ffmpeg invocations live
//! behind this trait; the pipeline only sees their inputs and outputs.

use async_trait::async_trait;
use std::error::Error;
use std::path::Path;

/// Width/height (and codec, when known) of the primary video stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub codec: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    /// Probe the source's resolution.
    async fn probe(&self, input: &Path) -> Result<SourceInfo, Box<dyn Error + Send + Sync>>;

    /// Duration of the source in seconds.
    async fn duration_secs(&self, input: &Path) -> Result<f64, Box<dyn Error + Send + Sync>>;

    /// Produce a 720p rendition at `output`, optionally capped at the given
    /// video bitrate (kbps). Returns the output file size in bytes.
    async fn create_720p(
        &self,
        input: &Path,
        output: &Path,
        video_bitrate_kbps: Option<u32>,
    ) -> Result<u64, Box<dyn Error + Send + Sync>>;

    /// Extract a single-frame thumbnail (1s offset) to `output`.
    async fn extract_thumbnail(
        &self,
        input: &Path,
        output: &Path,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}
