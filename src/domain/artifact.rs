//! Artifacts produced and consumed by the transcode/upload pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One encoded version of a source video at a specific resolution, sitting
/// in the local temp area. Consumed (and its file deleted) by the upload
/// coordinator.
#[derive(Debug, Clone)]
pub struct ResolutionArtifact {
    /// e.g. "1080p", "720p"
    pub resolution: String,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub size: u64,
}

/// A rendition that made it into object storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedRendition {
    pub resolution: String,
    pub url: Option<String>,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "fileId")]
    pub file_id: String,
}

/// Per-artifact upload failure, collected rather than raised so one bad
/// rendition never takes the batch down.
#[derive(Debug, Clone)]
pub struct UploadError {
    /// Resolution label, or "thumbnail".
    pub label: String,
    pub filename: PathBuf,
    pub error: String,
}

/// The record persisted once at least one rendition has uploaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub title: String,
    pub description: String,
    pub resolutions: Vec<UploadedRendition>,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub thumbnail: Option<String>,
    /// Seconds, floored.
    pub duration: u64,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    /// User id of the submitter.
    pub uploader: String,
    /// Display name as forwarded with the job, for the catalogue entry.
    #[serde(rename = "uploaderName")]
    pub uploader_name: String,
}

/// Slim per-resolution entry for client-facing summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionSummary {
    pub resolution: String,
    pub size: u64,
}

/// Public-facing summary of a saved video, carried in the terminal
/// `complete` event and in the HTTP response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSummary {
    pub id: String,
    pub title: String,
    pub description: String,
    pub thumbnail: Option<String>,
    pub duration: u64,
    pub resolutions: Vec<ResolutionSummary>,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}
