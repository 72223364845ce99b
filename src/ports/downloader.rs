//! Remote media acquisition port. The actual downloader tool invocation
//! lives behind this trait; the handlers only see the fetched file.

use async_trait::async_trait;
use std::error::Error;
use std::path::{Path, PathBuf};

/// A remote video fetched into the local temp area. From here on it is
/// processed exactly like a direct upload.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub path: PathBuf,
    pub file_name: String,
    /// Title reported by the remote site, when the tool can extract one.
    pub title: Option<String>,
    pub mime_type: String,
    pub size: u64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaDownloader: Send + Sync {
    /// Fetch the video at `url` into `dest_dir`.
    async fn fetch(
        &self,
        url: &str,
        dest_dir: &Path,
    ) -> Result<FetchedMedia, Box<dyn Error + Send + Sync>>;
}
