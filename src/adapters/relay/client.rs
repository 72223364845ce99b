//! Outbound progress relay connection (processing service side).
//!
//! A single background task owns the WebSocket to the API server. Events
//! are handed to it through an unbounded channel; while the link is down
//! they accumulate in a local queue and are flushed in order on
//! reconnect, so no progress event is lost to a relay outage. The task is
//! the only owner of the connection, which also guarantees at most one
//! reconnect attempt is ever pending.

use crate::domain::pid::ProcessId;
use crate::domain::protocol::{DetailedProgress, RelayEvent};
use crate::ports::notifier::ProgressSink;
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ProgressRelayClient {
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl ProgressRelayClient {
    /// Spawn the relay task. Returns immediately; the connection is
    /// established (and re-established) in the background.
    pub fn connect(url: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(relay_loop(url, rx));
        Self { tx }
    }

    fn enqueue(&self, event: RelayEvent) {
        // only fails when the relay task is gone, i.e. during shutdown
        if self.tx.send(event).is_err() {
            warn!("relay task stopped, progress event dropped");
        }
    }
}

#[async_trait]
impl ProgressSink for ProgressRelayClient {
    async fn progress(
        &self,
        pid: &ProcessId,
        user_id: &str,
        progress: u8,
        status: &str,
        detail: Option<DetailedProgress>,
    ) {
        self.enqueue(RelayEvent::Progress {
            pid: pid.clone(),
            user_id: user_id.to_string(),
            progress: progress.min(100),
            status: status.to_string(),
            detailed_progress: detail,
            timestamp: Utc::now(),
        });
    }

    async fn complete(&self, pid: &ProcessId, user_id: &str, result: Option<Value>) {
        self.enqueue(RelayEvent::Complete {
            pid: pid.clone(),
            user_id: user_id.to_string(),
            progress: 100,
            status: "completed".to_string(),
            result,
            timestamp: Utc::now(),
        });
    }

    async fn error(&self, pid: &ProcessId, user_id: &str, message: &str) {
        self.enqueue(RelayEvent::Error {
            pid: pid.clone(),
            user_id: user_id.to_string(),
            status: "failed".to_string(),
            error: message.to_string(),
            timestamp: Utc::now(),
        });
    }
}

async fn relay_loop(url: String, mut rx: mpsc::UnboundedReceiver<RelayEvent>) {
    let mut pending: VecDeque<RelayEvent> = VecDeque::new();

    loop {
        let ws = match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!(url = %url, queued = pending.len(), "relay connected");
                ws
            }
            Err(e) => {
                debug!(url = %url, error = %e, "relay connect failed, retrying");
                // keep accepting events while we wait out the backoff
                let deadline = tokio::time::sleep(RECONNECT_DELAY);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = &mut deadline => break,
                        event = rx.recv() => match event {
                            Some(event) => pending.push_back(event),
                            None => {
                                info!("relay channel closed while disconnected, stopping");
                                return;
                            }
                        },
                    }
                }
                continue;
            }
        };

        let (mut write, mut read) = ws.split();

        // flush everything buffered during the outage, oldest first
        let mut flush_failed = false;
        while let Some(event) = pending.pop_front() {
            if let Err(e) = send_event(&mut write, &event).await {
                warn!(error = %e, "relay send failed during flush");
                pending.push_front(event);
                flush_failed = true;
                break;
            }
        }
        if flush_failed {
            continue;
        }

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // first tick fires immediately

        let disconnected = loop {
            tokio::select! {
                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        warn!(error = %e, "relay ping failed");
                        break true;
                    }
                }
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = send_event(&mut write, &event).await {
                            warn!(error = %e, "relay send failed");
                            pending.push_back(event);
                            break true;
                        }
                    }
                    None => {
                        let _ = write.close().await;
                        info!("relay channel closed, stopping");
                        break false;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("relay connection closed by server");
                        break true;
                    }
                    Some(Ok(_)) => {} // nothing flows api -> media today
                    Some(Err(e)) => {
                        warn!(error = %e, "relay read error");
                        break true;
                    }
                },
            }
        };

        if !disconnected {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn send_event<S>(ws: &mut S, event: &RelayEvent) -> Result<(), S::Error>
where
    S: SinkExt<Message> + Unpin,
{
    let payload = serde_json::to_string(event).unwrap_or_else(|_| String::from("{}"));
    ws.send(Message::Text(payload)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn progress_is_clamped_to_100() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ProgressRelayClient { tx };
        let pid = ProcessId::from("p1".to_string());

        client.progress(&pid, "u1", 140, "uploading", None).await;

        match rx.recv().await.unwrap() {
            RelayEvent::Progress { progress, .. } => assert_eq!(progress, 100),
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_events_carry_fixed_statuses() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ProgressRelayClient { tx };
        let pid = ProcessId::from("p1".to_string());

        client
            .complete(&pid, "u1", Some(serde_json::json!({"ok": true})))
            .await;
        client.error(&pid, "u1", "probe failed").await;

        match rx.recv().await.unwrap() {
            RelayEvent::Complete { progress, status, .. } => {
                assert_eq!(progress, 100);
                assert_eq!(status, "completed");
            }
            other => panic!("wrong event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            RelayEvent::Error { status, error, .. } => {
                assert_eq!(status, "failed");
                assert_eq!(error, "probe failed");
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_type_tags() {
        let event = RelayEvent::Progress {
            pid: ProcessId::from("p1".to_string()),
            user_id: "u1".to_string(),
            progress: 40,
            status: "creating_720p".to_string(),
            detailed_progress: None,
            timestamp: Utc::now(),
        };
        let json: Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["userId"], "u1");
    }
}
