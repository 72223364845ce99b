//! HTTP routers for the two services.

pub mod api;
pub mod media;
