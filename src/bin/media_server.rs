//! Media Server Binary - transcoding and storage uploads
//!
//! The processing half of the platform. It wires up:
//! - The ffmpeg media processor
//! - Backblaze B2 object storage
//! - The HTTP video repository (persists records via the API server)
//! - The yt-dlp downloader for URL submissions
//! - The outbound progress relay client

use reelay::adapters::b2::B2Storage;
use reelay::adapters::ffmpeg::FfmpegProcessor;
use reelay::adapters::http::media::{router, MediaState};
use reelay::adapters::http_repo::HttpVideoRepository;
use reelay::adapters::relay::ProgressRelayClient;
use reelay::adapters::ytdl::YtdlDownloader;
use reelay::application::pipeline::TranscodePipeline;
use reelay::application::uploader::StorageUploadCoordinator;
use reelay::config::MediaConfig;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config = MediaConfig::from_env();

    tracing_subscriber::fmt::init();

    // 1. Local temp area for sources, renditions and thumbnails
    let upload_dir = PathBuf::from(&config.upload_dir);
    tokio::fs::create_dir_all(&upload_dir)
        .await
        .expect("Failed to create upload directory");

    // 2. Adapters
    let media = FfmpegProcessor::new();
    let storage = B2Storage::new(&config);
    let repository = HttpVideoRepository::new(&config.api_server_url);
    let relay = ProgressRelayClient::connect(config.relay_ws_url());

    // 3. Application service
    let pipeline = TranscodePipeline::new(
        media,
        StorageUploadCoordinator::new(storage),
        repository,
        relay,
    );

    // 4. HTTP layer
    let state = Arc::new(MediaState {
        pipeline,
        downloader: YtdlDownloader::new(),
        upload_dir,
    });
    let app = router(state);

    // 5. Start server
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.addr, config.port))
        .await
        .expect("Failed to bind TCP listener");
    println!("Media server listening at {}:{}", config.addr, config.port);
    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}
