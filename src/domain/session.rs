//! Progress session state machine.
//!
//! The store is the single authority over job progress on the API side:
//! active sessions keyed by process id plus a bounded ring buffer of
//! recently finished ones. Every mutation returns the event to broadcast
//! so the caller (the relay server) owns all fan-out; nothing else in the
//! process touches session state.

use crate::domain::pid::ProcessId;
use crate::domain::protocol::{BroadcastEvent, DetailedProgress};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

pub const STATUS_STARTED: &str = "started";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

const DEFAULT_COMPLETED_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub progress: u8,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detailed_progress: Option<DetailedProgress>,
}

/// One in-flight job. At most one active session exists per process id.
#[derive(Debug, Clone)]
pub struct ProgressSession {
    pub user_id: String,
    pub progress: u8,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
    pub history: Vec<HistoryEntry>,
    pub detailed_progress: Option<DetailedProgress>,
}

/// Terminal snapshot of a session, read-only after creation.
#[derive(Debug, Clone)]
pub struct CompletedSessionRecord {
    pub user_id: String,
    pub progress: u8,
    pub status: &'static str,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionSnapshot {
    pub pid: ProcessId,
    pub user_id: String,
    pub progress: u8,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detailed_progress: Option<DetailedProgress>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedSessionSnapshot {
    pub pid: ProcessId,
    pub user_id: String,
    pub status: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Active sessions plus a bounded FIFO history of finished ones.
pub struct ProgressSessionStore {
    active: HashMap<ProcessId, ProgressSession>,
    completed: VecDeque<(ProcessId, CompletedSessionRecord)>,
    completed_capacity: usize,
}

impl ProgressSessionStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_COMPLETED_CAPACITY)
    }

    pub fn with_capacity(completed_capacity: usize) -> Self {
        Self {
            active: HashMap::new(),
            completed: VecDeque::new(),
            completed_capacity,
        }
    }

    /// Create a session for a freshly submitted job. Calling twice for the
    /// same pid resets the existing session rather than duplicating it.
    pub fn create_session(&mut self, user_id: &str, pid: ProcessId) -> BroadcastEvent {
        let now = Utc::now();
        self.active.insert(
            pid.clone(),
            ProgressSession {
                user_id: user_id.to_string(),
                progress: 0,
                status: STATUS_STARTED.to_string(),
                created_at: now,
                last_update: None,
                history: Vec::new(),
                detailed_progress: None,
            },
        );

        BroadcastEvent {
            pid,
            user_id: user_id.to_string(),
            progress: 0,
            status: STATUS_STARTED.to_string(),
            detailed_progress: None,
            result: None,
            error: None,
            timestamp: now,
        }
    }

    /// Apply a progress update. A missing session is auto-created when the
    /// update carries a user id (self-healing against relay message loss or
    /// reordering); otherwise the update is dropped silently - late
    /// messages for an already-finished job are expected, not an error.
    pub fn update_progress(
        &mut self,
        pid: &ProcessId,
        progress: u8,
        status: &str,
        detailed_progress: Option<DetailedProgress>,
        user_id: Option<&str>,
    ) -> Option<BroadcastEvent> {
        if !self.active.contains_key(pid) {
            match user_id {
                Some(user_id) => {
                    info!(pid = %pid, user_id, "auto-creating missing progress session");
                    self.create_session(user_id, pid.clone());
                }
                None => {
                    debug!(pid = %pid, "progress update skipped - no session");
                    return None;
                }
            }
        }

        let session = self.active.get_mut(pid)?;
        let now = Utc::now();
        session.progress = progress;
        session.status = status.to_string();
        session.last_update = Some(now);
        if detailed_progress.is_some() {
            session.detailed_progress = detailed_progress.clone();
        }
        session.history.push(HistoryEntry {
            progress,
            status: status.to_string(),
            timestamp: now,
            detailed_progress: detailed_progress.clone(),
        });

        Some(BroadcastEvent {
            pid: pid.clone(),
            user_id: session.user_id.clone(),
            progress,
            status: status.to_string(),
            detailed_progress,
            result: None,
            error: None,
            timestamp: now,
        })
    }

    /// Move a session to the completed buffer with status "completed".
    /// No-op when the session is already gone, so duplicate completion
    /// signals are harmless.
    pub fn complete_progress(
        &mut self,
        pid: &ProcessId,
        result: Option<Value>,
    ) -> Option<BroadcastEvent> {
        let session = self.active.remove(pid)?;
        let completed_at = Utc::now();

        let event = BroadcastEvent {
            pid: pid.clone(),
            user_id: session.user_id.clone(),
            progress: 100,
            status: STATUS_COMPLETED.to_string(),
            detailed_progress: None,
            result: result.clone(),
            error: None,
            timestamp: completed_at,
        };

        self.push_completed(
            pid.clone(),
            CompletedSessionRecord {
                user_id: session.user_id,
                progress: 100,
                status: STATUS_COMPLETED,
                result,
                error: None,
                created_at: session.created_at,
                completed_at,
                history: session.history,
            },
        );

        Some(event)
    }

    /// Same as [`complete_progress`](Self::complete_progress) but with
    /// status "failed"; the last known progress is preserved.
    pub fn fail_progress(&mut self, pid: &ProcessId, error: &str) -> Option<BroadcastEvent> {
        let session = self.active.remove(pid)?;
        let failed_at = Utc::now();

        let event = BroadcastEvent {
            pid: pid.clone(),
            user_id: session.user_id.clone(),
            progress: session.progress,
            status: STATUS_FAILED.to_string(),
            detailed_progress: None,
            result: None,
            error: Some(error.to_string()),
            timestamp: failed_at,
        };

        self.push_completed(
            pid.clone(),
            CompletedSessionRecord {
                user_id: session.user_id,
                progress: session.progress,
                status: STATUS_FAILED,
                result: None,
                error: Some(error.to_string()),
                created_at: session.created_at,
                completed_at: failed_at,
                history: session.history,
            },
        );

        Some(event)
    }

    fn push_completed(&mut self, pid: ProcessId, record: CompletedSessionRecord) {
        self.completed.push_back((pid, record));
        while self.completed.len() > self.completed_capacity {
            self.completed.pop_front();
        }
    }

    pub fn active_sessions(&self) -> Vec<ActiveSessionSnapshot> {
        self.active
            .iter()
            .map(|(pid, session)| ActiveSessionSnapshot {
                pid: pid.clone(),
                user_id: session.user_id.clone(),
                progress: session.progress,
                status: session.status.clone(),
                created_at: session.created_at,
                last_update: session.last_update,
                detailed_progress: session.detailed_progress.clone(),
            })
            .collect()
    }

    pub fn recent_completed(&self) -> Vec<CompletedSessionSnapshot> {
        self.completed
            .iter()
            .map(|(pid, record)| CompletedSessionSnapshot {
                pid: pid.clone(),
                user_id: record.user_id.clone(),
                status: record.status.to_string(),
                progress: record.progress,
                result: record.result.clone(),
                error: record.error.clone(),
                completed_at: record.completed_at,
                created_at: record.created_at,
            })
            .collect()
    }

    pub fn active_sessions_for_user(&self, user_id: &str) -> Vec<ActiveSessionSnapshot> {
        self.active_sessions()
            .into_iter()
            .filter(|s| s.user_id == user_id)
            .collect()
    }

    pub fn recent_completed_for_user(&self, user_id: &str) -> Vec<CompletedSessionSnapshot> {
        self.recent_completed()
            .into_iter()
            .filter(|s| s.user_id == user_id)
            .collect()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }
}

impl Default for ProgressSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(raw: &str) -> ProcessId {
        ProcessId::from(raw.to_string())
    }

    #[test]
    fn create_then_update_tracks_history() {
        let mut store = ProgressSessionStore::new();
        store.create_session("u1", pid("p1"));

        let event = store
            .update_progress(&pid("p1"), 20, "probing", None, None)
            .unwrap();
        assert_eq!(event.progress, 20);
        assert_eq!(event.user_id, "u1");

        store
            .update_progress(&pid("p1"), 40, "creating_720p", None, None)
            .unwrap();

        let snapshots = store.active_sessions();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].progress, 40);
        assert_eq!(snapshots[0].status, "creating_720p");
    }

    #[test]
    fn creating_twice_updates_never_duplicates() {
        let mut store = ProgressSessionStore::new();
        store.create_session("u1", pid("p1"));
        store
            .update_progress(&pid("p1"), 50, "uploading", None, None)
            .unwrap();
        store.create_session("u1", pid("p1"));

        assert_eq!(store.active_len(), 1);
        assert_eq!(store.active_sessions()[0].progress, 0);
    }

    #[test]
    fn update_auto_creates_when_user_supplied() {
        let mut store = ProgressSessionStore::new();
        let event = store
            .update_progress(&pid("ghost"), 30, "processing", None, Some("u2"))
            .unwrap();
        assert_eq!(event.user_id, "u2");
        assert_eq!(store.active_len(), 1);
    }

    #[test]
    fn update_without_session_or_user_is_dropped() {
        let mut store = ProgressSessionStore::new();
        assert!(store
            .update_progress(&pid("ghost"), 30, "processing", None, None)
            .is_none());
        assert_eq!(store.active_len(), 0);
    }

    #[test]
    fn complete_moves_session_and_is_idempotent() {
        let mut store = ProgressSessionStore::new();
        store.create_session("u1", pid("p1"));

        let event = store
            .complete_progress(&pid("p1"), Some(serde_json::json!({"ok": true})))
            .unwrap();
        assert_eq!(event.progress, 100);
        assert_eq!(event.status, STATUS_COMPLETED);
        assert_eq!(store.active_len(), 0);
        assert_eq!(store.completed_len(), 1);

        // second completion signal is a no-op
        assert!(store.complete_progress(&pid("p1"), None).is_none());
        assert_eq!(store.completed_len(), 1);
    }

    #[test]
    fn fail_preserves_last_progress_and_is_idempotent() {
        let mut store = ProgressSessionStore::new();
        store.create_session("u1", pid("p1"));
        store
            .update_progress(&pid("p1"), 60, "uploading", None, None)
            .unwrap();

        let event = store.fail_progress(&pid("p1"), "disk on fire").unwrap();
        assert_eq!(event.progress, 60);
        assert_eq!(event.status, STATUS_FAILED);
        assert_eq!(event.error.as_deref(), Some("disk on fire"));

        assert!(store.fail_progress(&pid("p1"), "again").is_none());
        assert_eq!(store.completed_len(), 1);
    }

    #[test]
    fn completed_buffer_evicts_oldest_first() {
        let capacity = 5;
        let mut store = ProgressSessionStore::with_capacity(capacity);

        for i in 0..capacity + 1 {
            let id = pid(&format!("p{i}"));
            store.create_session("u1", id.clone());
            store.complete_progress(&id, None);
        }

        assert_eq!(store.completed_len(), capacity);
        let pids: Vec<String> = store
            .recent_completed()
            .iter()
            .map(|s| s.pid.as_str().to_string())
            .collect();
        assert!(!pids.contains(&"p0".to_string()), "oldest entry not evicted");
        assert!(pids.contains(&"p5".to_string()));
    }

    #[test]
    fn per_user_accessors_filter() {
        let mut store = ProgressSessionStore::new();
        store.create_session("u1", pid("p1"));
        store.create_session("u2", pid("p2"));
        store.create_session("u2", pid("p3"));
        store.complete_progress(&pid("p3"), None);

        assert_eq!(store.active_sessions_for_user("u2").len(), 1);
        assert_eq!(store.recent_completed_for_user("u2").len(), 1);
        assert_eq!(store.recent_completed_for_user("u1").len(), 0);
    }
}
