use crate::domain::artifact::{VideoRecord, VideoSummary};
use async_trait::async_trait;
use std::error::Error;

/// Persistence seam for finished videos. The metadata catalogue itself
/// (schemas, queries, CRUD) belongs to the API service; the pipeline only
/// needs "save this record once, give me the public summary back".
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VideoRepository: Send + Sync {
    async fn save(&self, record: &VideoRecord) -> Result<VideoSummary, Box<dyn Error + Send + Sync>>;
}
