//! Video metadata persistence over the API server's internal endpoint.
//!
//! The media service never talks to the catalogue database directly; it
//! hands the finished record back to the API service, which owns the
//! schema and returns the public summary.

use crate::domain::artifact::{VideoRecord, VideoSummary};
use crate::ports::repository::VideoRepository;
use async_trait::async_trait;
use serde::Deserialize;
use std::error::Error;
use std::time::Duration;
use tracing::debug;

pub struct HttpVideoRepository {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct SaveResponse {
    video: VideoSummary,
}

impl HttpVideoRepository {
    pub fn new(api_server_url: &str) -> Self {
        let base = api_server_url.trim_end_matches('/');
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{base}/internal/videos"),
        }
    }
}

#[async_trait]
impl VideoRepository for HttpVideoRepository {
    async fn save(
        &self,
        record: &VideoRecord,
    ) -> Result<VideoSummary, Box<dyn Error + Send + Sync>> {
        debug!(title = %record.title, "persisting video record");
        let response = self
            .http
            .post(&self.endpoint)
            .json(record)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("save returned {status}: {body}").into());
        }

        let saved: SaveResponse = response.json().await?;
        Ok(saved.video)
    }
}
