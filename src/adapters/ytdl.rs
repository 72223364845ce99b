//! Remote video acquisition backed by the `yt-dlp` binary.

use crate::ports::downloader::{FetchedMedia, MediaDownloader};
use async_trait::async_trait;
use std::error::Error;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

type BoxError = Box<dyn Error + Send + Sync>;

pub struct YtdlDownloader {
    bin: String,
}

impl Default for YtdlDownloader {
    fn default() -> Self {
        Self {
            bin: "yt-dlp".to_string(),
        }
    }
}

impl YtdlDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<String, BoxError> {
        debug!(bin = %self.bin, ?args, "spawning downloader");
        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr.lines().last().unwrap_or("no output").to_string();
            return Err(format!("{} exited with {}: {tail}", self.bin, output.status).into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl MediaDownloader for YtdlDownloader {
    async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<FetchedMedia, BoxError> {
        // title is best-effort; the job falls back to the file name
        let title = self
            .run(&["--no-playlist", "--get-title", url])
            .await
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let file_name = download_file_name();
        let output = dest_dir.join(&file_name);
        let output_str = output.to_string_lossy().into_owned();

        self.run(&[
            "--no-playlist",
            "-f",
            "bv*[ext=mp4]+ba[ext=m4a]/b[ext=mp4]/b",
            "--merge-output-format",
            "mp4",
            "-o",
            &output_str,
            url,
        ])
        .await?;

        let size = tokio::fs::metadata(&output).await?.len();
        info!(url, file = %file_name, size, "remote video fetched");

        Ok(FetchedMedia {
            path: output,
            file_name,
            title,
            mime_type: "video/mp4".to_string(),
            size,
        })
    }
}

/// Locally-unique name for the fetched file; the container is forced to
/// mp4 above, so the extension is fixed.
fn download_file_name() -> String {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let nonce: u32 = rand::random();
    format!("{timestamp}-{nonce}.mp4")
}
