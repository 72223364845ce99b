//! Inbound side of the progress relay (API service).
//!
//! Two WebSocket surfaces terminate here: the media server's relay
//! ingress, whose events mutate the session store, and browser client
//! connections, which authenticate in-band and then receive every
//! broadcast. The store is the only shared mutable state and every
//! mutation flows through it, so fan-out ordering matches store ordering.

use crate::adapters::auth::verify_token;
use crate::domain::pid::ProcessId;
use crate::domain::protocol::{
    decode_client_frame, decode_relay_event, AuthPayload, BroadcastEvent, ClientCommand,
    ClientDecodeError, DetailedProgress, RelayDecodeError, RelayEvent, ServerFrame,
};
use crate::domain::session::ProgressSessionStore;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// A missed sweep (no frame of any kind for a full interval) terminates
/// the browser connection.
const HEARTBEAT_SWEEP: Duration = Duration::from_secs(20);

struct ClientHandle {
    user_id: String,
    tx: mpsc::UnboundedSender<Message>,
}

/// Liveness tracking for one heartbeated connection. Any inbound frame
/// marks it alive; a sweep that finds no activity since the previous one
/// means the connection must be terminated.
struct Liveness {
    alive: AtomicBool,
}

impl Liveness {
    fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
        }
    }

    fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Returns false when the connection missed the whole previous interval.
    fn sweep(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }
}

pub struct ProgressRelayServer {
    sessions: Mutex<ProgressSessionStore>,
    clients: Mutex<HashMap<u64, ClientHandle>>,
    next_conn_id: AtomicU64,
    jwt_secret: String,
}

/// What one decoded browser frame produced.
struct CommandOutcome {
    frames: Vec<ServerFrame>,
    close: bool,
    authenticated_user: Option<String>,
}

impl ProgressRelayServer {
    pub fn new(jwt_secret: String) -> Self {
        Self {
            sessions: Mutex::new(ProgressSessionStore::new()),
            clients: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            jwt_secret,
        }
    }

    // -- session mutations, each broadcasting its resulting event --------

    pub async fn create_session(&self, user_id: &str, pid: ProcessId) {
        let event = self.sessions.lock().await.create_session(user_id, pid);
        self.broadcast(&event).await;
    }

    pub async fn update_progress(
        &self,
        pid: &ProcessId,
        progress: u8,
        status: &str,
        detailed: Option<DetailedProgress>,
        user_id: Option<&str>,
    ) {
        let event = self
            .sessions
            .lock()
            .await
            .update_progress(pid, progress, status, detailed, user_id);
        if let Some(event) = event {
            self.broadcast(&event).await;
        }
    }

    pub async fn complete(&self, pid: &ProcessId, result: Option<Value>) {
        let event = self.sessions.lock().await.complete_progress(pid, result);
        if let Some(event) = event {
            self.broadcast(&event).await;
        }
    }

    pub async fn fail(&self, pid: &ProcessId, error: &str) {
        let event = self.sessions.lock().await.fail_progress(pid, error);
        if let Some(event) = event {
            self.broadcast(&event).await;
        }
    }

    async fn broadcast(&self, event: &BroadcastEvent) {
        let payload = Message::Text(ServerFrame::progress_event(event).to_json());
        let mut clients = self.clients.lock().await;
        // senders to gone connections are pruned as we go
        clients.retain(|_, client| client.tx.send(payload.clone()).is_ok());
        debug!(
            pid = %event.pid,
            status = %event.status,
            recipients = clients.len(),
            "progress event broadcast"
        );
    }

    // -- media server ingress ---------------------------------------------

    /// Drive one relay connection from the media server until it closes or
    /// goes silent. The same sweep discipline as browser connections
    /// applies, so a half-open relay socket cannot pin this task forever.
    pub async fn serve_media(self: Arc<Self>, socket: WebSocket) {
        info!("media server relay connected");
        let (mut write, mut read) = socket.split();
        let liveness = Liveness::new();
        let mut sweep = tokio::time::interval(HEARTBEAT_SWEEP);
        sweep.tick().await; // discard the immediate first tick

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    if !liveness.sweep() {
                        warn!("media relay missed heartbeat sweep, closing");
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    let _ = write.send(Message::Ping(Vec::new())).await;
                }
                frame = read.next() => {
                    let raw = match frame {
                        Some(Ok(Message::Text(raw))) => {
                            liveness.mark_alive();
                            raw
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        // pings are answered by the server framework; pongs
                        // and anything else just prove the peer is there
                        Some(Ok(_)) => {
                            liveness.mark_alive();
                            continue;
                        }
                    };

                    match decode_relay_event(&raw) {
                        Ok(event) => self.apply_relay_event(event).await,
                        Err(RelayDecodeError::UnknownType(kind)) => {
                            warn!(kind, "unknown relay event type ignored");
                        }
                        Err(RelayDecodeError::Malformed(error)) => {
                            warn!(error, "malformed relay payload ignored");
                        }
                    }
                }
            }
        }
        info!("media server relay disconnected");
    }

    async fn apply_relay_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::Progress {
                pid,
                user_id,
                progress,
                status,
                detailed_progress,
                ..
            } => {
                self.update_progress(&pid, progress, &status, detailed_progress, Some(&user_id))
                    .await;
            }
            RelayEvent::Complete { pid, result, .. } => self.complete(&pid, result).await,
            RelayEvent::Error { pid, error, .. } => self.fail(&pid, &error).await,
        }
    }

    // -- browser clients --------------------------------------------------

    /// Drive one browser connection: writer task, heartbeat sweep, in-band
    /// authentication, then broadcast membership until the socket drops.
    pub async fn serve_browser(self: Arc<Self>, socket: WebSocket) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let liveness = Liveness::new();
        let mut sweep = tokio::time::interval(HEARTBEAT_SWEEP);
        sweep.tick().await; // discard the immediate first tick
        let mut user: Option<String> = None;

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    if !liveness.sweep() {
                        debug!(conn_id, "browser connection missed heartbeat sweep, closing");
                        let _ = tx.send(Message::Close(None));
                        break;
                    }
                    let _ = tx.send(Message::Ping(Vec::new()));
                }
                frame = stream.next() => {
                    let raw = match frame {
                        Some(Ok(Message::Text(raw))) => {
                            liveness.mark_alive();
                            raw
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {
                            liveness.mark_alive();
                            continue;
                        }
                    };

                    let command = match decode_client_frame(&raw) {
                        Ok(command) => command,
                        Err(ClientDecodeError::UnknownOp(op)) => {
                            debug!(conn_id, op, "unknown client opcode ignored");
                            continue;
                        }
                        Err(ClientDecodeError::Malformed(error)) => {
                            debug!(conn_id, error, "malformed client frame ignored");
                            continue;
                        }
                    };

                    let outcome = self.handle_client_command(user.as_deref(), command).await;
                    for frame in outcome.frames {
                        let _ = tx.send(Message::Text(frame.to_json()));
                    }
                    if let Some(user_id) = outcome.authenticated_user {
                        info!(conn_id, user_id = %user_id, "browser client authenticated");
                        self.clients.lock().await.insert(
                            conn_id,
                            ClientHandle { user_id: user_id.clone(), tx: tx.clone() },
                        );
                        user = Some(user_id);
                    }
                    if outcome.close {
                        let _ = tx.send(Message::Close(None));
                        break;
                    }
                }
            }
        }

        self.clients.lock().await.remove(&conn_id);
        drop(tx);
        let _ = writer.await;
        debug!(conn_id, "browser connection closed");
    }

    /// The per-frame state machine, kept free of socket plumbing. Failed
    /// authentication closes the connection; a non-auth frame from an
    /// unauthenticated client is answered but the connection stays open so
    /// the client can still authenticate.
    async fn handle_client_command(
        &self,
        user: Option<&str>,
        command: ClientCommand,
    ) -> CommandOutcome {
        if user.is_none() && !matches!(command, ClientCommand::Authenticate(_)) {
            return CommandOutcome {
                frames: vec![ServerFrame::auth_failure("Not authenticated")],
                close: false,
                authenticated_user: None,
            };
        }

        match command {
            ClientCommand::HeartbeatCheck => CommandOutcome {
                frames: vec![ServerFrame::heartbeat_ack()],
                close: false,
                authenticated_user: None,
            },
            ClientCommand::RequestSnapshot => {
                let (active, completed) = self.snapshots().await;
                CommandOutcome {
                    frames: vec![ServerFrame::snapshot(active, completed)],
                    close: false,
                    authenticated_user: None,
                }
            }
            ClientCommand::Authenticate(payload) => self.authenticate(payload).await,
        }
    }

    async fn authenticate(&self, payload: AuthPayload) -> CommandOutcome {
        let rejected = |message: &str| CommandOutcome {
            frames: vec![ServerFrame::auth_failure(message)],
            close: true,
            authenticated_user: None,
        };

        let token = match payload {
            AuthPayload::Missing => return rejected("Token required"),
            AuthPayload::Invalid => return rejected("Invalid token format"),
            AuthPayload::Token(token) => token,
        };

        match verify_token(&self.jwt_secret, &token) {
            Ok(claims) => {
                let (active, completed) = self.snapshots().await;
                CommandOutcome {
                    frames: vec![ServerFrame::auth_success(active, completed)],
                    close: false,
                    authenticated_user: Some(claims.user_id),
                }
            }
            Err(e) => {
                debug!(error = %e, "browser token rejected");
                rejected("Authentication failed")
            }
        }
    }

    async fn snapshots(&self) -> (Value, Value) {
        let sessions = self.sessions.lock().await;
        let active = serde_json::to_value(sessions.active_sessions()).unwrap_or(Value::Null);
        let completed = serde_json::to_value(sessions.recent_completed()).unwrap_or(Value::Null);
        (active, completed)
    }

    /// Connected, authenticated browser clients.
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    #[cfg(test)]
    async fn client_user_ids(&self) -> Vec<String> {
        self.clients
            .lock()
            .await
            .values()
            .map(|c| c.user_id.clone())
            .collect()
    }
}
