//! Application layer - services orchestrating the ports.

pub mod pipeline;
pub mod uploader;
