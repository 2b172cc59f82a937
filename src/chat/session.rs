//! Per-connection session state machine: authentication, heartbeats, and
//! the bounded, strictly-ordered write queue.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::protocol::{self, encode_frame, encode_json_frame, FrameHeader, FrameParser, FrameType};
use crate::chat::server::ChatServer;
use crate::errors::SessionError;
use crate::rpc::TokenStubPool;

pub const MAX_WRITE_QUEUE: usize = 100;
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(8);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    AwaitingAuth,
    Authenticated,
    Closing,
    Closed,
}

#[derive(Deserialize)]
struct AuthRequestBody {
    token: String,
    #[serde(rename = "client_device_id")]
    device_id: String,
}

#[derive(Serialize)]
struct AuthResponseBody {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_uuid: Option<Uuid>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

#[derive(Deserialize, Serialize)]
struct ChatMessageBody {
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

/// One TCP connection's worth of protocol state. Owns the read/write
/// socket halves; the read loop and writer both run on the same worker
/// context, so parsing, timer handling, and write completions for this
/// session never race each other.
pub struct Session {
    pub id: Uuid,
    peer_addr: SocketAddr,
    write_half: Mutex<OwnedWriteHalf>,
    send_queue: Mutex<VecDeque<Bytes>>,
    sending: AtomicBool,
    state: RwLock<SessionState>,
    authenticated: AtomicBool,
    closed: AtomicBool,
    user_uuid: RwLock<Option<Uuid>>,
    timer_reset: Notify,
    timer_generation: AtomicU32,
    close_notify: Notify,
    server: Weak<ChatServer>,
    token_stubs: Arc<TokenStubPool>,
    self_weak: Weak<Session>,
}

impl Session {
    pub fn new(
        id: Uuid,
        peer_addr: SocketAddr,
        write_half: OwnedWriteHalf,
        server: Weak<ChatServer>,
        token_stubs: Arc<TokenStubPool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            id,
            peer_addr,
            write_half: Mutex::new(write_half),
            send_queue: Mutex::new(VecDeque::new()),
            sending: AtomicBool::new(false),
            state: RwLock::new(SessionState::New),
            authenticated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            user_uuid: RwLock::new(None),
            timer_reset: Notify::new(),
            timer_generation: AtomicU32::new(0),
            close_notify: Notify::new(),
            server,
            token_stubs,
            self_weak: self_weak.clone(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub async fn user_uuid(&self) -> Option<Uuid> {
        *self.user_uuid.read().await
    }

    /// Drives the session to completion: read loop, timer, close. Consumes
    /// the read half directly since only this task ever reads from it.
    pub async fn run(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        *self.state.write().await = SessionState::AwaitingAuth;
        self.rearm_timer();

        let timer_task = {
            let this = self.clone();
            tokio::task::spawn_local(async move { this.timer_loop().await })
        };

        let mut parser = FrameParser::new();
        let mut read_buf = [0u8; 4096];

        loop {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            parser.reserve_for_next_read();
            // Raced against `close_notify` so a `stop()` issued from another
            // task (duplicate-login preemption, a server-wide shutdown) can
            // unblock a read that would otherwise sit idle until the peer
            // sends something or closes its end.
            let read_result = tokio::select! {
                result = read_half.read(&mut read_buf) => result,
                _ = self.close_notify.notified() => break,
            };
            let n = match read_result {
                Ok(0) => {
                    debug!(session = %self.id, "peer closed connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(session = %self.id, err = %e, "read error");
                    break;
                }
            };

            let frames = match parser.feed(&read_buf[..n]) {
                Ok(frames) => frames,
                Err(e) => {
                    debug!(session = %self.id, err = %e, "frame header validation failed");
                    self.send_error("Invalid message header").await;
                    break;
                }
            };

            for (header, body) in frames {
                if let Err(e) = self.dispatch(&header, body).await {
                    warn!(session = %self.id, err = %e, "session ended by dispatch");
                    self.stop().await;
                    return;
                }
            }
        }

        timer_task.abort();
        self.stop().await;
    }

    async fn dispatch(&self, header: &FrameHeader, body: Bytes) -> Result<(), SessionError> {
        let state = *self.state.read().await;
        let frame_type = header.frame_type();

        match (state, frame_type) {
            (SessionState::AwaitingAuth, Some(FrameType::AuthRequest)) => {
                self.handle_auth_request(&body).await;
                Ok(())
            }
            (SessionState::AwaitingAuth, _) => {
                self.send_error("Not authenticated").await;
                self.stop().await;
                Ok(())
            }
            (SessionState::Authenticated, Some(FrameType::Heartbeat)) => {
                self.rearm_timer();
                self.send_now(encode_frame(FrameType::Heartbeat, b"{}")).await;
                Ok(())
            }
            (SessionState::Authenticated, Some(FrameType::ChatMessage)) => {
                self.handle_chat_message(&body).await;
                Ok(())
            }
            (SessionState::Authenticated, _) => {
                self.send_error("Unknown message type").await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn handle_auth_request(&self, body: &Bytes) {
        let parsed: Result<AuthRequestBody, _> = serde_json::from_slice(body);
        let Ok(req) = parsed else {
            self.reject_auth("missing or malformed auth fields").await;
            return;
        };

        match self.token_stubs.validate_token(&req.token, &req.device_id).await {
            Ok(Some(user_uuid)) => {
                *self.user_uuid.write().await = Some(user_uuid);
                self.authenticated.store(true, Ordering::Release);
                *self.state.write().await = SessionState::Authenticated;
                self.rearm_timer();

                if let Some(server) = self.server.upgrade() {
                    server.add(user_uuid, Arc::downgrade(&self.self_handle())).await;
                }

                let resp = AuthResponseBody {
                    success: true,
                    message: "authenticated".to_string(),
                    user_uuid: Some(user_uuid),
                };
                if let Ok(frame) = encode_json_frame(FrameType::AuthResponse, &resp) {
                    self.send_now(frame).await;
                }
                info!(session = %self.id, user = %user_uuid, "session authenticated");
            }
            Ok(None) => self.reject_auth("invalid token").await,
            Err(e) => {
                warn!(session = %self.id, err = %e, "token validation rpc failed");
                self.reject_auth("authentication service unavailable").await;
            }
        }
    }

    async fn reject_auth(&self, reason: &str) {
        let resp = AuthResponseBody {
            success: false,
            message: reason.to_string(),
            user_uuid: None,
        };
        if let Ok(frame) = encode_json_frame(FrameType::AuthResponse, &resp) {
            self.send_now(frame).await;
        }
        *self.state.write().await = SessionState::Closing;
        self.stop().await;
    }

    async fn handle_chat_message(&self, body: &Bytes) {
        let Ok(msg) = serde_json::from_slice::<ChatMessageBody>(body) else {
            self.send_error("malformed chat message").await;
            return;
        };
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let frame = match encode_json_frame(FrameType::ChatMessage, &msg) {
            Ok(f) => f,
            Err(_) => return,
        };
        server.broadcast(frame, Some(self.id)).await;
    }

    async fn send_error(&self, message: &str) {
        if let Ok(frame) = encode_json_frame(FrameType::ErrorMessage, &ErrorBody { error: message }) {
            self.send_now(frame).await;
        }
    }

    /// A strong handle to this session, for registering with the
    /// ChatServer (which stores only `Weak<Session>`) and for spawning
    /// tasks that must outlive the current call.
    fn self_handle(&self) -> Arc<Self> {
        self.self_weak
            .upgrade()
            .expect("session outlives its own weak handle")
    }

    fn rearm_timer(&self) {
        self.timer_generation.fetch_add(1, Ordering::AcqRel);
        self.timer_reset.notify_one();
    }

    async fn timer_loop(self: Arc<Self>) {
        loop {
            let generation = self.timer_generation.load(Ordering::Acquire);
            let timeout = if self.authenticated.load(Ordering::Acquire) {
                HEARTBEAT_TIMEOUT
            } else {
                AUTH_TIMEOUT
            };

            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if self.timer_generation.load(Ordering::Acquire) == generation {
                        if self.authenticated.load(Ordering::Acquire) {
                            warn!(session = %self.id, "heartbeat timeout");
                        } else {
                            warn!(session = %self.id, "auth timeout");
                        }
                        self.stop().await;
                        return;
                    }
                }
                _ = self.timer_reset.notified() => {
                    continue;
                }
            }
        }
    }

    /// Enqueue a fully-framed buffer for delivery to this session, e.g. a
    /// broadcast or targeted chat message routed by the `ChatServer` from
    /// another session's task. Fire-and-forget: the caller must not block
    /// on this session's writer, so the enqueue and drive happen on a
    /// spawned local task instead of inline.
    pub fn enqueue_send(&self, frame: Bytes) {
        let this = self.self_handle();
        tokio::task::spawn_local(async move { this.send_now(frame).await });
    }

    /// Enqueue a fully-framed buffer and, if nothing else is already
    /// writing, drive the writer to completion before returning. Used for
    /// frames generated on the session's own task — auth responses,
    /// heartbeat replies, protocol errors — where the caller acts on the
    /// outcome immediately afterward (often by closing the session) and
    /// must not race a fire-and-forget writer task that hasn't run yet.
    /// Drops the frame (never reorders what does get sent) if the queue is
    /// already full.
    async fn send_now(&self, frame: Bytes) {
        let should_start = {
            let mut queue = self.send_queue.lock().await;
            if queue.len() >= MAX_WRITE_QUEUE {
                warn!(session = %self.id, "write queue full — dropping frame");
                return;
            }
            queue.push_back(frame);
            !self.sending.swap(true, Ordering::AcqRel)
        };
        if should_start {
            self.self_handle().drive_writer().await;
        }
    }

    async fn drive_writer(self: Arc<Self>) {
        loop {
            let next = {
                let queue = self.send_queue.lock().await;
                queue.front().cloned()
            };
            let Some(frame) = next else {
                self.sending.store(false, Ordering::Release);
                return;
            };

            let write_result = {
                let mut w = self.write_half.lock().await;
                w.write_all(&frame).await
            };

            if let Err(e) = write_result {
                warn!(session = %self.id, err = %e, "write error — closing session");
                self.sending.store(false, Ordering::Release);
                self.stop().await;
                return;
            }

            let mut queue = self.send_queue.lock().await;
            queue.pop_front();
        }
    }

    /// Idempotent close: flips `closed`, cancels timers via generation
    /// bump, shuts the socket down, and removes this session from the
    /// server's registry.
    pub async fn stop(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.write().await = SessionState::Closed;
        self.timer_generation.fetch_add(1, Ordering::AcqRel);
        self.timer_reset.notify_one();
        self.close_notify.notify_waiters();

        {
            let mut w = self.write_half.lock().await;
            match w.shutdown().await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {}
                Err(e) => debug!(session = %self.id, err = %e, "shutdown error"),
            }
        }

        if let (Some(server), Some(user_uuid)) = (self.server.upgrade(), self.user_uuid().await) {
            server.remove(user_uuid, &self.self_weak).await;
            server.report_session_closed(user_uuid).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::protocol::{FrameType, MAGIC};

    #[test]
    fn session_state_transitions_are_well_defined() {
        assert_ne!(SessionState::New, SessionState::Closed);
        assert_eq!(MAX_WRITE_QUEUE, 100);
    }

    #[test]
    fn heartbeat_frame_is_well_formed() {
        let frame = encode_frame(FrameType::Heartbeat, b"{}");
        assert!(frame.len() >= protocol::HEADER_LEN);
        assert_eq!(u32::from_le_bytes(frame[0..4].try_into().unwrap()), MAGIC);
    }
}
