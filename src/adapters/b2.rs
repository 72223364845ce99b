//! Backblaze B2 object storage adapter.
//!
//! Authorization tokens are valid for 24h upstream; we cache one for 22h
//! and re-authorize past that. Before talking to the API at all we verify
//! the endpoint resolves, so an unplugged resolver surfaces as a transient
//! `StorageError::Dns` instead of an opaque request error.

use crate::config::MediaConfig;
use crate::ports::storage::{ObjectStore, StorageError, StoredObject};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

const AUTH_ENDPOINT: &str = "https://api.backblazeb2.com/b2api/v2/b2_authorize_account";
const AUTH_HOST: &str = "api.backblazeb2.com";
const AUTH_TTL: Duration = Duration::from_secs(22 * 60 * 60);
const AUTH_ATTEMPTS: u32 = 3;
const DNS_ATTEMPTS: u32 = 3;
/// Renditions can be large; the per-upload deadline is deliberately long.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

struct CachedAuth {
    token: String,
    api_url: String,
    obtained_at: Instant,
}

impl CachedAuth {
    fn is_fresh(&self) -> bool {
        self.obtained_at.elapsed() < AUTH_TTL
    }
}

pub struct B2Storage {
    http: reqwest::Client,
    key_id: String,
    application_key: String,
    bucket_id: String,
    bucket_name: Option<String>,
    auth: Mutex<Option<CachedAuth>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeResponse {
    authorization_token: String,
    api_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrlResponse {
    upload_url: String,
    authorization_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    file_id: String,
    file_name: String,
    content_length: u64,
}

impl B2Storage {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            key_id: config.b2_key_id.clone(),
            application_key: config.b2_application_key.clone(),
            bucket_id: config.b2_bucket_id.clone(),
            bucket_name: config.b2_bucket_name.clone(),
            auth: Mutex::new(None),
        }
    }

    /// Fail fast (and transiently) when a B2 hostname doesn't resolve.
    async fn verify_host_resolves(&self, host: &str) -> Result<(), StorageError> {
        for attempt in 1..=DNS_ATTEMPTS {
            let resolved = match tokio::net::lookup_host((host, 443)).await {
                Ok(mut addrs) => addrs.next().is_some(),
                Err(_) => false,
            };
            if resolved {
                return Ok(());
            }
            if attempt < DNS_ATTEMPTS {
                warn!(host, attempt, "DNS lookup failed, retrying");
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
        }
        Err(StorageError::Dns {
            host: host.to_string(),
        })
    }

    async fn authorize(&self) -> Result<(String, String), StorageError> {
        let mut cached = self.auth.lock().await;
        if let Some(auth) = cached.as_ref() {
            if auth.is_fresh() {
                return Ok((auth.token.clone(), auth.api_url.clone()));
            }
            debug!("cached B2 authorization expired");
        }

        self.verify_host_resolves(AUTH_HOST).await?;

        let mut backoff = Duration::from_millis(500);
        let mut last_error = None;
        for attempt in 1..=AUTH_ATTEMPTS {
            let result = self
                .http
                .get(AUTH_ENDPOINT)
                .basic_auth(&self.key_id, Some(&self.application_key))
                .timeout(Duration::from_secs(30))
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    let body: AuthorizeResponse = response
                        .json()
                        .await
                        .map_err(|e| StorageError::Unexpected(e.to_string()))?;
                    info!("authorized with B2");
                    *cached = Some(CachedAuth {
                        token: body.authorization_token.clone(),
                        api_url: body.api_url.clone(),
                        obtained_at: Instant::now(),
                    });
                    return Ok((body.authorization_token, body.api_url));
                }
                Ok(response) if response.status().as_u16() == 401 => {
                    return Err(StorageError::Auth("invalid B2 credentials".to_string()));
                }
                Ok(response) => {
                    last_error = Some(StorageError::Unexpected(format!(
                        "authorize returned {}",
                        response.status()
                    )));
                }
                Err(e) => last_error = Some(classify_request_error(e)),
            }

            if attempt < AUTH_ATTEMPTS {
                warn!(attempt, "B2 authorization failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
            }
        }

        Err(last_error
            .unwrap_or_else(|| StorageError::Unexpected("authorization failed".to_string())))
    }

    async fn get_upload_url(&self) -> Result<UploadUrlResponse, StorageError> {
        let (token, api_url) = self.authorize().await?;

        let response = self
            .http
            .post(format!("{api_url}/b2api/v2/b2_get_upload_url"))
            .header("Authorization", token)
            .json(&serde_json::json!({ "bucketId": self.bucket_id }))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if status.as_u16() == 401 {
            // token revoked server-side; drop the cache so the caller's
            // retry re-authorizes
            self.auth.lock().await.take();
            return Err(StorageError::Auth("upload URL request unauthorized".to_string()));
        }
        if !status.is_success() {
            return Err(classify_status(status, "get_upload_url"));
        }

        response
            .json()
            .await
            .map_err(|e| StorageError::Unexpected(e.to_string()))
    }

    fn public_url(&self, file_name: &str) -> Option<String> {
        self.bucket_name
            .as_ref()
            .map(|bucket| format!("https://{bucket}.s3.eu-central-003.backblazeb2.com/{file_name}"))
    }
}

#[async_trait]
impl ObjectStore for B2Storage {
    async fn upload_file(
        &self,
        local_path: &Path,
        key: &str,
    ) -> Result<StoredObject, StorageError> {
        let metadata = tokio::fs::metadata(local_path).await?;
        let size = metadata.len();
        let target = self.get_upload_url().await?;

        // upload URLs point at per-pod hostnames that come and go; verify
        // the one we were just handed before pushing bytes at it
        let host = upload_host(&target.upload_url)?;
        self.verify_host_resolves(&host).await?;

        debug!(key, size, "uploading to B2");
        let file = tokio::fs::File::open(local_path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .http
            .post(&target.upload_url)
            .header("Authorization", target.authorization_token)
            .header("X-Bz-File-Name", key)
            .header("Content-Type", "b2/x-auto")
            .header("Content-Length", size)
            .header("X-Bz-Content-Sha1", "do_not_verify")
            .body(body)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, "upload_file"));
        }

        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| StorageError::Unexpected(e.to_string()))?;
        info!(key = %uploaded.file_name, size = uploaded.content_length, "B2 upload finished");

        Ok(StoredObject {
            url: self.public_url(&uploaded.file_name),
            file_id: uploaded.file_id,
            file_name: uploaded.file_name,
            size: uploaded.content_length,
        })
    }
}

fn upload_host(upload_url: &str) -> Result<String, StorageError> {
    reqwest::Url::parse(upload_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .ok_or_else(|| StorageError::Unexpected(format!("unusable upload URL: {upload_url}")))
}

fn classify_request_error(e: reqwest::Error) -> StorageError {
    if e.is_timeout() {
        StorageError::Timeout
    } else if e.is_connect() {
        StorageError::Connection(e.to_string())
    } else {
        StorageError::Unexpected(e.to_string())
    }
}

fn classify_status(status: reqwest::StatusCode, operation: &str) -> StorageError {
    match status.as_u16() {
        401 | 403 => StorageError::Auth(format!("{operation} returned {status}")),
        400 => StorageError::Rejected(format!("{operation} returned {status}")),
        // B2 asks clients to fetch a fresh upload URL and retry on these
        408 | 429 | 500 | 503 => StorageError::Connection(format!("{operation} returned {status}")),
        _ => StorageError::Unexpected(format!("{operation} returned {status}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_auth_freshness() {
        let fresh = CachedAuth {
            token: "t".into(),
            api_url: "https://api002.backblazeb2.com".into(),
            obtained_at: Instant::now(),
        };
        assert!(fresh.is_fresh());

        // checked_sub: monotonic clocks can start near zero
        if let Some(past) = Instant::now().checked_sub(AUTH_TTL + Duration::from_secs(1)) {
            let stale = CachedAuth {
                obtained_at: past,
                ..fresh
            };
            assert!(!stale.is_fresh());
        }
    }

    #[test]
    fn status_classification_feeds_retry_policy() {
        assert!(classify_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "upload").is_transient());
        assert!(classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "upload").is_transient());
        assert!(!classify_status(reqwest::StatusCode::UNAUTHORIZED, "upload").is_transient());
        assert!(!classify_status(reqwest::StatusCode::BAD_REQUEST, "upload").is_transient());
    }

    #[test]
    fn upload_host_is_taken_from_the_issued_url() {
        assert_eq!(
            upload_host("https://pod-000-1234-56.backblaze.com/b2api/v2/b2_upload_file/abc")
                .unwrap(),
            "pod-000-1234-56.backblaze.com"
        );
        assert!(matches!(
            upload_host("not a url"),
            Err(StorageError::Unexpected(_))
        ));
    }

    #[test]
    fn public_url_requires_bucket_name() {
        let named = B2Storage {
            http: reqwest::Client::new(),
            key_id: String::new(),
            application_key: String::new(),
            bucket_id: String::new(),
            bucket_name: Some("clips".into()),
            auth: Mutex::new(None),
        };
        assert_eq!(
            named.public_url("videos/a.mp4").as_deref(),
            Some("https://clips.s3.eu-central-003.backblazeb2.com/videos/a.mp4")
        );

        let anonymous = B2Storage {
            bucket_name: None,
            ..named
        };
        assert!(anonymous.public_url("videos/a.mp4").is_none());
    }
}
