//! TCP acceptor and session registry for one chat server process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::session::Session;
use crate::rpc::TokenStubPool;
use crate::worker_pool::{Priority, WorkerPool};

pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Accepts connections and owns the live session registry. Reads (`get`,
/// `broadcast`) take the registry lock shared; writes (`add`, `remove`,
/// reap) take it exclusive. The lock is never held across a session's own
/// I/O or `stop()` call.
pub struct ChatServer {
    pub id: String,
    pub zone: String,
    bind_addr: String,
    running: AtomicBool,
    shutdown_notify: Notify,
    sessions: RwLock<HashMap<Uuid, Weak<Session>>>,
    max_connections: usize,
    cleanup_interval: Duration,
    worker_pool: Arc<WorkerPool>,
    token_stubs: Arc<TokenStubPool>,
}

impl ChatServer {
    pub fn new(
        id: String,
        zone: String,
        bind_addr: String,
        max_connections: usize,
        worker_pool: Arc<WorkerPool>,
        token_stubs: Arc<TokenStubPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            zone,
            bind_addr,
            running: AtomicBool::new(true),
            shutdown_notify: Notify::new(),
            sessions: RwLock::new(HashMap::new()),
            max_connections: max_connections.max(1),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            worker_pool,
            token_stubs,
        })
    }

    /// Binds the listener and runs the accept loop until `stop()` is
    /// called. Each accepted connection is handed to a worker context via
    /// the pool's round-robin `post`, so the session's read loop, timer,
    /// and writer all run on that one context for its whole lifetime.
    pub async fn start(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, id = %self.id, "chat server listening");

        let reaper = {
            let this = self.clone();
            tokio::spawn(async move { this.reap_loop().await })
        };

        while self.running.load(Ordering::Acquire) {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown_notify.notified() => break,
            };
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            let (socket, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(err = %e, "accept error");
                    continue;
                }
            };

            if self.connection_count().await >= self.max_connections {
                warn!(peer = %peer_addr, "connection limit reached — rejecting");
                drop(socket);
                continue;
            }

            let _ = socket.set_nodelay(true);
            let this = self.clone();
            let accepted = self.worker_pool.post(
                async move {
                    this.handle_connection(socket, peer_addr).await;
                },
                Priority::Normal,
            );
            if !accepted {
                warn!(peer = %peer_addr, "worker pool rejected connection — dropping");
            }
        }

        reaper.abort();
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, socket: tokio::net::TcpStream, peer_addr: std::net::SocketAddr) {
        let (read_half, write_half) = socket.into_split();
        let session_id = Uuid::new_v4();
        let session = Session::new(
            session_id,
            peer_addr,
            write_half,
            Arc::downgrade(&self),
            self.token_stubs.clone(),
        );
        debug!(session = %session_id, peer = %peer_addr, "session accepted");
        session.run(read_half).await;
    }

    /// Flips `running`, unblocks the accept loop, snapshots every live
    /// (upgradable) session under the registry lock, releases the lock, then
    /// stops each one. Idempotent — a second call observes `running` already
    /// false and returns without touching the (by-then empty) registry.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown_notify.notify_waiters();

        let live: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().await;
            sessions.values().filter_map(Weak::upgrade).collect()
        };
        for session in live {
            session.stop().await;
        }
    }

    /// Enforces the single-session-per-user invariant: if a live session is
    /// already registered for `user_uuid`, it is closed before the new one
    /// is indexed. The registry lock is dropped before `stop()` is called,
    /// so the old session's own close path (which calls `remove`) never
    /// deadlocks against this write lock.
    pub async fn add(&self, user_uuid: Uuid, session: Weak<Session>) {
        let previous = {
            let mut sessions = self.sessions.write().await;
            let previous = sessions.get(&user_uuid).and_then(Weak::upgrade);
            sessions.insert(user_uuid, session);
            previous
        };
        if let Some(old) = previous {
            debug!(user = %user_uuid, "preempting existing session for user");
            old.stop().await;
        }
    }

    /// Removes the registry entry for `user_uuid`, but only if it still
    /// points at `expected` — a session preempted by `add` (see above) must
    /// not be allowed to remove the new session that replaced it once its
    /// own (now-stale) close path runs.
    pub async fn remove(&self, user_uuid: Uuid, expected: &Weak<Session>) {
        let mut sessions = self.sessions.write().await;
        if let Some(current) = sessions.get(&user_uuid) {
            if current.ptr_eq(expected) {
                sessions.remove(&user_uuid);
            }
        }
    }

    pub async fn get(&self, user_uuid: Uuid) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(&user_uuid).and_then(Weak::upgrade)
    }

    pub async fn connection_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Best-effort synchronous load snapshot for the heartbeat reporter;
    /// falls back to 0 if the registry is momentarily write-locked.
    pub fn current_load_percent(&self) -> u32 {
        let Ok(sessions) = self.sessions.try_read() else {
            return 0;
        };
        ((sessions.len() as u64 * 100) / (self.max_connections as u64).max(1)).min(100) as u32
    }

    /// Send `frame` to every authenticated session except `exclude` (the
    /// sender, when routing its own broadcast).
    pub async fn broadcast(&self, frame: Bytes, exclude: Option<Uuid>) {
        let sessions = self.sessions.read().await;
        for (user_uuid, weak) in sessions.iter() {
            if Some(*user_uuid) == exclude {
                continue;
            }
            if let Some(session) = weak.upgrade() {
                session.enqueue_send(frame.clone());
            }
        }
    }

    pub async fn send_to(&self, user_uuid: Uuid, frame: Bytes) {
        let target = {
            let sessions = self.sessions.read().await;
            sessions.get(&user_uuid).and_then(Weak::upgrade)
        };
        if let Some(session) = target {
            session.enqueue_send(frame);
        }
    }

    /// Notifies the Status service that this user's session has closed, so
    /// the chat-server registry's load count can be decremented. Best
    /// effort — a periodic heartbeat from the same process refreshes the
    /// registry independently if this notification is lost.
    pub async fn report_session_closed(&self, user_uuid: Uuid) {
        if let Err(e) = self.token_stubs.report_session_closed(&self.id, user_uuid).await {
            warn!(err = %e, user = %user_uuid, "failed to report session close to status service");
        }
    }

    /// Periodically refreshes this server's descriptor in the Status
    /// registry — a safety net in case a `report_session_closed` call is
    /// ever lost.
    pub async fn heartbeat_loop(self: Arc<Self>, host: String, port: u16, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::Acquire) {
                return;
            }
            let load = self.connection_count().await as u32;
            if let Err(e) = self
                .token_stubs
                .report_heartbeat(&self.id, &host, port, &self.zone, load, self.max_connections as u32)
                .await
            {
                warn!(err = %e, "chat server heartbeat to status service failed");
            }
        }
    }

    async fn reap_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.cleanup_interval);
        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::Acquire) {
                return;
            }
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|_, weak| weak.strong_count() > 0);
            let reaped = before - sessions.len();
            if reaped > 0 {
                debug!(reaped, remaining = sessions.len(), "reaped stale session entries");
            }
        }
    }
}

impl Drop for ChatServer {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!(id = %self.id, "chat server dropped while running");
        }
    }
}
