//! Adapters - concrete implementations of the ports plus the transport
//! surfaces of the two services.

pub mod auth;
pub mod b2;
pub mod ffmpeg;
pub mod http;
pub mod http_repo;
pub mod relay;
pub mod ytdl;
