//! Configuration for the two deployable services.

use std::env;

/// Configuration for the API-facing service.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    /// Secret used to verify client bearer tokens
    pub jwt_secret: String,
    /// Base URL of the media (processing) server
    pub media_server_url: String,
}

impl ApiConfig {
    /// Load configuration from environment variables.
    /// Panics if JWT_SECRET is not set.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            addr: env::var("ADDR").unwrap_or_else(|_| String::from("127.0.0.1")),
            port: env::var("PORT").unwrap_or_else(|_| String::from("5000")),
            jwt_secret: env::var("JWT_SECRET").expect("JWT_SECRET env var required"),
            media_server_url: env::var("MEDIA_SERVER_URL")
                .unwrap_or_else(|_| String::from("http://127.0.0.1:5001")),
        }
    }
}

/// Configuration for the media (processing) service.
#[derive(Clone, Debug)]
pub struct MediaConfig {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    /// Base URL of the API server (also used to derive the relay ws URL)
    pub api_server_url: String,
    /// Directory for uploaded sources, renditions and thumbnails
    pub upload_dir: String,
    /// Backblaze B2 application key id
    pub b2_key_id: String,
    /// Backblaze B2 application key
    pub b2_application_key: String,
    /// Target bucket id
    pub b2_bucket_id: String,
    /// Bucket name, used to derive public file URLs when set
    pub b2_bucket_name: Option<String>,
}

impl MediaConfig {
    /// Load configuration from environment variables.
    /// Panics if the B2 credentials are not set.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            addr: env::var("ADDR").unwrap_or_else(|_| String::from("127.0.0.1")),
            port: env::var("PORT").unwrap_or_else(|_| String::from("5001")),
            api_server_url: env::var("API_SERVER_URL")
                .unwrap_or_else(|_| String::from("http://127.0.0.1:5000")),
            upload_dir: env::var("UPLOAD_DIR").unwrap_or_else(|_| String::from("./uploads")),
            b2_key_id: env::var("B2_APPLICATION_KEY_ID")
                .expect("B2_APPLICATION_KEY_ID env var required"),
            b2_application_key: env::var("B2_APPLICATION_KEY")
                .expect("B2_APPLICATION_KEY env var required"),
            b2_bucket_id: env::var("B2_BUCKET_ID").expect("B2_BUCKET_ID env var required"),
            b2_bucket_name: env::var("B2_BUCKET_NAME").ok(),
        }
    }

    /// WebSocket URL of the API server's relay ingress.
    pub fn relay_ws_url(&self) -> String {
        let base = self
            .api_server_url
            .replacen("http", "ws", 1)
            .trim_end_matches('/')
            .to_string();
        format!("{base}/ws/media-server")
    }
}
