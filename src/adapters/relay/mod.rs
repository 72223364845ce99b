//! The progress relay: outbound client (media service) and inbound
//! server (API service).

pub mod client;
pub mod server;

pub use client::ProgressRelayClient;
pub use server::ProgressRelayServer;
