//! HTTP surface of the API service.
//!
//! Uploads are accepted here, given a process id and acknowledged
//! immediately; the body itself is forwarded to the media service in a
//! detached task so the client never waits on processing. The two
//! WebSocket endpoints (browser clients, media relay ingress) terminate
//! in the relay server.

use crate::adapters::auth::{verify_token, Claims};
use crate::adapters::relay::ProgressRelayServer;
use crate::domain::pid::ProcessIdGenerator;
use crate::domain::protocol::DetailedProgress;
use crate::domain::session::{STATUS_COMPLETED, STATUS_FAILED};
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

pub struct ApiState {
    pub relay: Arc<ProgressRelayServer>,
    pub pid_generator: ProcessIdGenerator,
    pub jwt_secret: String,
    pub media_server_url: String,
    pub http: reqwest::Client,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/upload", post(submit_upload))
        .route("/download", post(submit_download))
        .route("/progress/:pid", post(post_progress))
        .route("/ws", get(browser_ws))
        .route("/ws/media-server", get(media_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<Claims, Response> {
    let unauthorized = || {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "error": "Unauthorized" })),
        )
            .into_response()
    };

    let token = bearer_token(headers).ok_or_else(unauthorized)?;
    verify_token(&state.jwt_secret, token).map_err(|e| {
        warn!(error = %e, "upload rejected: bad token");
        unauthorized()
    })
}

/// Accept an upload, mint its process id and hand the body off to the
/// media service. Responds 202 before processing starts; progress flows
/// over the WebSocket from here on.
async fn submit_upload(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let claims = match authenticate(&state, &headers) {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    let pid = match state.pid_generator.generate() {
        Ok(pid) => pid,
        Err(e) => {
            error!(error = %e, "process id generation failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "Could not start upload" })),
            )
                .into_response();
        }
    };

    state.relay.create_session(&claims.user_id, pid.clone()).await;
    info!(pid = %pid, user_id = %claims.user_id, "upload accepted");

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let target = format!(
        "{}/upload",
        state.media_server_url.trim_end_matches('/')
    );

    // detached forward: the 202 below must not wait for processing
    let request = state
        .http
        .post(&target)
        .header("content-type", content_type)
        .header("x-process-id", pid.as_str())
        .header("x-user-id", claims.user_id.as_str())
        .header("x-user-username", claims.username.as_deref().unwrap_or(""))
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));
    spawn_forward(state, pid.clone(), request);

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "pid": pid,
            "message": "Upload received, processing started",
        })),
    )
        .into_response()
}

#[derive(Deserialize)]
struct DownloadSubmission {
    url: String,
    title: Option<String>,
}

/// Accept a download-by-URL submission. Same contract as `/upload`: mint
/// the pid, reply 202, forward to the media service in the background.
async fn submit_download(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(submission): Json<DownloadSubmission>,
) -> Response {
    let claims = match authenticate(&state, &headers) {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    if !is_supported_source_url(&submission.url) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Unsupported source URL" })),
        )
            .into_response();
    }

    let pid = match state.pid_generator.generate() {
        Ok(pid) => pid,
        Err(e) => {
            error!(error = %e, "process id generation failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "Could not start download" })),
            )
                .into_response();
        }
    };

    state.relay.create_session(&claims.user_id, pid.clone()).await;
    info!(pid = %pid, user_id = %claims.user_id, url = %submission.url, "download accepted");

    let target = format!(
        "{}/download",
        state.media_server_url.trim_end_matches('/')
    );
    let request = state
        .http
        .post(&target)
        .header("x-process-id", pid.as_str())
        .header("x-user-id", claims.user_id.as_str())
        .header("x-user-username", claims.username.as_deref().unwrap_or(""))
        .json(&json!({ "url": submission.url, "title": submission.title }));
    spawn_forward(state, pid.clone(), request);

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "pid": pid,
            "message": "Download received, processing started",
        })),
    )
        .into_response()
}

/// Only plain web URLs are handed to the downloader tool.
fn is_supported_source_url(raw: &str) -> bool {
    match reqwest::Url::parse(raw) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

/// Fire the forwarded request in a detached task. A terminal state
/// normally arrives over the relay; failing the session here covers the
/// media service dying before it can report anything.
fn spawn_forward(state: Arc<ApiState>, pid: crate::domain::pid::ProcessId, request: reqwest::RequestBuilder) {
    tokio::spawn(async move {
        match request.send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(pid = %pid, status = %response.status(), "media server refused forwarded job");
                state
                    .relay
                    .fail(&pid, "Processing server rejected the request")
                    .await;
            }
            Err(e) => {
                error!(pid = %pid, error = %e, "job forward failed");
                state.relay.fail(&pid, "Processing server unreachable").await;
            }
        }
    });
}

#[derive(Deserialize)]
struct ProgressUpdateBody {
    progress: Option<u8>,
    status: Option<String>,
    result: Option<Value>,
    error: Option<String>,
    #[serde(rename = "detailedProgress")]
    detailed_progress: Option<DetailedProgress>,
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

/// HTTP fallback for progress reporting, kept for callers that cannot
/// hold a relay connection. Same dispatch as the relay ingress.
async fn post_progress(
    State(state): State<Arc<ApiState>>,
    Path(pid): Path<String>,
    Json(body): Json<ProgressUpdateBody>,
) -> Response {
    let pid = crate::domain::pid::ProcessId::from(pid);
    let status = body.status.as_deref().unwrap_or("processing");

    match status {
        STATUS_COMPLETED => state.relay.complete(&pid, body.result).await,
        STATUS_FAILED => {
            let message = body.error.as_deref().unwrap_or("Processing failed");
            state.relay.fail(&pid, message).await;
        }
        _ => {
            state
                .relay
                .update_progress(
                    &pid,
                    body.progress.unwrap_or(0).min(100),
                    status,
                    body.detailed_progress,
                    body.user_id.as_deref(),
                )
                .await;
        }
    }

    Json(json!({ "success": true })).into_response()
}

async fn browser_ws(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> Response {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| relay.serve_browser(socket))
}

/// Relay ingress for the media service. Reachable only on the private
/// network, which is why it carries no token handshake.
async fn media_ws(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> Response {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| relay.serve_media(socket))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        headers.insert(header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn source_url_validation() {
        assert!(is_supported_source_url("https://www.youtube.com/watch?v=abc123"));
        assert!(is_supported_source_url("http://example.com/video"));
        assert!(!is_supported_source_url("ftp://example.com/video.mp4"));
        assert!(!is_supported_source_url("file:///etc/passwd"));
        assert!(!is_supported_source_url("not a url"));
        assert!(!is_supported_source_url(""));
    }

    #[test]
    fn download_submission_title_is_optional() {
        let body: DownloadSubmission =
            serde_json::from_str(r#"{"url": "https://example.com/v"}"#).unwrap();
        assert!(body.title.is_none());

        let body: DownloadSubmission = serde_json::from_str(
            r#"{"url": "https://example.com/v", "title": "clip"}"#,
        )
        .unwrap();
        assert_eq!(body.title.as_deref(), Some("clip"));
    }

    #[test]
    fn progress_body_accepts_partial_payloads() {
        let body: ProgressUpdateBody = serde_json::from_str(r#"{"progress": 40}"#).unwrap();
        assert_eq!(body.progress, Some(40));
        assert!(body.status.is_none());

        let body: ProgressUpdateBody = serde_json::from_str(
            r#"{"status": "completed", "result": {"ok": true}}"#,
        )
        .unwrap();
        assert_eq!(body.status.as_deref(), Some("completed"));
        assert!(body.result.is_some());

        let body: ProgressUpdateBody = serde_json::from_str(
            r#"{"progress": 60, "status": "uploading", "detailedProgress": {"720p": -1}, "userId": "u1"}"#,
        )
        .unwrap();
        assert_eq!(body.detailed_progress.unwrap()["720p"], -1);
        assert_eq!(body.user_id.as_deref(), Some("u1"));
    }
}
