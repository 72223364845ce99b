//! Ports - Trait definitions at the collaborator seams.

pub mod downloader;
pub mod media;
pub mod notifier;
pub mod repository;
pub mod storage;
