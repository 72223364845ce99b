//! HTTP surface of the media (processing) service.
//!
//! Two forwarded submission shapes land here: a multipart body whose
//! video part is streamed to the local temp area, and a download-by-URL
//! request fetched through the downloader port. Both feed the same
//! transcode pipeline; the response carries the final outcome while
//! progress along the way travels over the relay, not this connection.

use crate::application::pipeline::{TranscodePipeline, UploadJob};
use crate::domain::pid::ProcessId;
use crate::ports::downloader::MediaDownloader;
use crate::ports::media::MediaProcessor;
use crate::ports::notifier::ProgressSink;
use crate::ports::repository::VideoRepository;
use crate::ports::storage::ObjectStore;
use axum::extract::multipart::Field;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const ALLOWED_MIME_TYPES: &[&str] = &[
    "video/mp4",
    "video/webm",
    "video/ogg",
    "video/quicktime",
    "video/x-matroska",
];

pub struct MediaState<M, O, R, P, D> {
    pub pipeline: TranscodePipeline<M, O, R, P>,
    pub downloader: D,
    pub upload_dir: PathBuf,
}

pub fn router<M, O, R, P, D>(state: Arc<MediaState<M, O, R, P, D>>) -> Router
where
    M: MediaProcessor + 'static,
    O: ObjectStore + 'static,
    R: VideoRepository + 'static,
    P: ProgressSink + 'static,
    D: MediaDownloader + 'static,
{
    Router::new()
        .route("/upload", post(process_upload))
        .route("/download", post(process_download))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Identity of the job, recovered from the headers set by the API service
/// when it forwarded the body.
struct JobTag {
    pid: ProcessId,
    user_id: String,
    username: String,
}

impl JobTag {
    fn from_headers(headers: &HeaderMap) -> Result<Self, Response> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let pid = header("x-process-id").ok_or_else(|| {
            error_response(StatusCode::BAD_REQUEST, "Missing x-process-id header")
        })?;
        let user_id = header("x-user-id").ok_or_else(|| {
            error_response(StatusCode::UNAUTHORIZED, "Missing user identity")
        })?;

        Ok(Self {
            pid: ProcessId::from(pid),
            user_id,
            username: header("x-user-username").unwrap_or_default(),
        })
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

async fn process_upload<M, O, R, P, D>(
    State(state): State<Arc<MediaState<M, O, R, P, D>>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response
where
    M: MediaProcessor + 'static,
    O: ObjectStore + 'static,
    R: VideoRepository + 'static,
    P: ProgressSink + 'static,
    D: MediaDownloader + 'static,
{
    let tag = match JobTag::from_headers(&headers) {
        Ok(tag) => tag,
        Err(response) => return response,
    };

    let mut saved: Option<(PathBuf, String, String, u64)> = None;
    let mut title = None;
    let mut description = None;
    let mut categories = Vec::new();
    let mut tags = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(pid = %tag.pid, error = %e, "multipart read failed");
                return error_response(StatusCode::BAD_REQUEST, "Malformed upload body");
            }
        };

        match field.name().unwrap_or_default() {
            "video" => {
                let mime = field.content_type().unwrap_or_default().to_string();
                if !ALLOWED_MIME_TYPES.contains(&mime.as_str()) {
                    return error_response(
                        StatusCode::UNSUPPORTED_MEDIA_TYPE,
                        "Unsupported video format",
                    );
                }
                let original_name = field.file_name().unwrap_or("upload").to_string();
                let local_name = temp_file_name(&original_name);
                let path = state.upload_dir.join(&local_name);

                match stream_to_file(field, &path).await {
                    Ok(size) => {
                        info!(pid = %tag.pid, file = %local_name, size, "source received");
                        saved = Some((path, original_name, mime, size));
                    }
                    Err(e) => {
                        warn!(pid = %tag.pid, error = %e, "failed to persist upload");
                        return error_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Could not store the upload",
                        );
                    }
                }
            }
            "title" => title = field.text().await.ok().filter(|t| !t.is_empty()),
            "description" => description = field.text().await.ok().filter(|d| !d.is_empty()),
            "category" => {
                if let Ok(value) = field.text().await {
                    categories.push(value);
                }
            }
            "tags" => {
                if let Ok(value) = field.text().await {
                    tags.extend(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|t| !t.is_empty())
                            .map(str::to_string),
                    );
                }
            }
            other => {
                warn!(pid = %tag.pid, field = other, "unknown multipart field ignored");
            }
        }
    }

    let Some((source_path, original_name, mime_type, size)) = saved else {
        return error_response(StatusCode::BAD_REQUEST, "No video file in upload");
    };

    let job = UploadJob {
        pid: tag.pid,
        user_id: tag.user_id,
        username: tag.username,
        title,
        description,
        categories,
        tags,
        source_path,
        original_name,
        mime_type,
        size,
    };

    match state.pipeline.run(job).await {
        Ok(summary) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "video": summary })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Deserialize)]
struct DownloadRequest {
    url: String,
    title: Option<String>,
}

async fn process_download<M, O, R, P, D>(
    State(state): State<Arc<MediaState<M, O, R, P, D>>>,
    headers: HeaderMap,
    Json(body): Json<DownloadRequest>,
) -> Response
where
    M: MediaProcessor + 'static,
    O: ObjectStore + 'static,
    R: VideoRepository + 'static,
    P: ProgressSink + 'static,
    D: MediaDownloader + 'static,
{
    let tag = match JobTag::from_headers(&headers) {
        Ok(tag) => tag,
        Err(response) => return response,
    };

    if body.url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Missing source URL");
    }

    info!(pid = %tag.pid, url = %body.url, "fetching remote source");
    let fetched = match state.downloader.fetch(&body.url, &state.upload_dir).await {
        Ok(fetched) => fetched,
        Err(e) => {
            warn!(pid = %tag.pid, error = %e, "source fetch failed");
            state
                .pipeline
                .report_failure(&tag.pid, &tag.user_id, "Could not download the source video")
                .await;
            return error_response(StatusCode::BAD_GATEWAY, "Could not download the source video");
        }
    };

    let job = UploadJob {
        pid: tag.pid,
        user_id: tag.user_id,
        username: tag.username,
        title: body.title.filter(|t| !t.is_empty()).or(fetched.title),
        description: None,
        categories: Vec::new(),
        tags: Vec::new(),
        source_path: fetched.path,
        original_name: fetched.file_name,
        mime_type: fetched.mime_type,
        size: fetched.size,
    };

    match state.pipeline.run(job).await {
        Ok(summary) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "video": summary })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// Locally-unique name for the incoming source file. The extension is the
/// only client-influenced part and is sanitized down to alphanumerics.
fn temp_file_name(original_name: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    let timestamp = chrono::Utc::now().timestamp_millis();
    let nonce: u32 = rand::random();
    format!("{timestamp}-{nonce}{ext}")
}

async fn stream_to_file(mut field: Field<'_>, path: &Path) -> Result<u64, String> {
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| e.to_string())?;
    let mut writer = tokio::io::BufWriter::new(file);
    let mut size: u64 = 0;

    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                size += chunk.len() as u64;
                writer.write_all(&chunk).await.map_err(|e| e.to_string())?;
            }
            Ok(None) => break,
            Err(e) => {
                // half-written file is useless; drop it before bailing
                drop(writer);
                let _ = tokio::fs::remove_file(path).await;
                return Err(e.to_string());
            }
        }
    }

    writer.flush().await.map_err(|e| e.to_string())?;
    Ok(size)
}
