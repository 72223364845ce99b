//! Domain layer - Pure business logic.

pub mod artifact;
pub mod pid;
pub mod protocol;
pub mod session;
