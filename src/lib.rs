//! Reelay - Video Upload Processing and Progress Relay
//!
//! Hexagonal architecture:
//! - domain/: Pure logic (process ids, relay protocol, session store, artifacts)
//! - ports/: Trait definitions (media, storage, repository, notifier)
//! - adapters/: Concrete implementations (ffmpeg, B2, relay, HTTP)
//! - application/: Services (transcode pipeline, upload coordinator)
//! - config: Environment configuration
//!
//! Two binaries share this library: `api-server` (upload intake, progress
//! relay and browser WebSockets) and `media-server` (transcoding and
//! storage uploads).

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

// Re-exports for convenience
pub use config::{ApiConfig, MediaConfig};
pub use domain::pid::{ProcessId, ProcessIdGenerator};
