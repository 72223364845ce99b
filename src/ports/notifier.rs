//! Progress notification port.
//!
//! Everything here is fire-and-forget by contract: a notification failure
//! must never fail a job, so the methods are infallible from the caller's
//! point of view and implementations swallow (and log) transport errors.

use crate::domain::pid::ProcessId;
use crate::domain::protocol::DetailedProgress;
use async_trait::async_trait;
use serde_json::Value;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn progress(
        &self,
        pid: &ProcessId,
        user_id: &str,
        progress: u8,
        status: &str,
        detail: Option<DetailedProgress>,
    );

    async fn complete(&self, pid: &ProcessId, user_id: &str, result: Option<Value>);

    async fn error(&self, pid: &ProcessId, user_id: &str, message: &str);
}

#[async_trait]
impl<T: ProgressSink + ?Sized> ProgressSink for std::sync::Arc<T> {
    async fn progress(
        &self,
        pid: &ProcessId,
        user_id: &str,
        progress: u8,
        status: &str,
        detail: Option<DetailedProgress>,
    ) {
        (**self).progress(pid, user_id, progress, status, detail).await
    }

    async fn complete(&self, pid: &ProcessId, user_id: &str, result: Option<Value>) {
        (**self).complete(pid, user_id, result).await
    }

    async fn error(&self, pid: &ProcessId, user_id: &str, message: &str) {
        (**self).error(pid, user_id, message).await
    }
}
