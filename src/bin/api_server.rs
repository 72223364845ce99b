//! API Server Binary - upload intake and progress relay
//!
//! This is the user-facing half of the platform. It wires up:
//! - The progress relay server (browser WebSockets + media relay ingress)
//! - The process id generator
//! - The upload intake endpoint that forwards bodies to the media server

use reelay::adapters::http::api::{router, ApiState};
use reelay::adapters::relay::ProgressRelayServer;
use reelay::config::ApiConfig;
use reelay::domain::pid::ProcessIdGenerator;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config = ApiConfig::from_env();

    tracing_subscriber::fmt::init();

    // 1. Relay server: single authority over sessions and fan-out
    let relay = Arc::new(ProgressRelayServer::new(config.jwt_secret.clone()));

    // 2. Shared request state
    let state = Arc::new(ApiState {
        relay,
        pid_generator: ProcessIdGenerator::new(),
        jwt_secret: config.jwt_secret.clone(),
        media_server_url: config.media_server_url.clone(),
        http: reqwest::Client::new(),
    });

    // 3. HTTP layer
    let app = router(state);

    // 4. Start server
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.addr, config.port))
        .await
        .expect("Failed to bind TCP listener");
    println!("API server listening at {}:{}", config.addr, config.port);
    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}
