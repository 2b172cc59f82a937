//! Fixed-size worker pool with a priority-ranked task dispatcher.
//!
//! `W` execution contexts, each driven by its own OS thread running an
//! independent single-threaded Tokio runtime (the direct analogue of the
//! original design's one-`io_context`-per-thread model). Three bounded
//! priority channels feed a dispatcher task per channel; each dispatcher
//! round-robins incoming tasks across the `W` contexts. `post` never blocks
//! beyond the channel's bounded capacity; ordering within one priority is
//! FIFO up to dispatch, never guaranteed across priorities or up to
//! completion.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

/// Priority level a task is admitted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Normal,
    Low,
}

const PRIORITIES: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A handle to one of the pool's `W` execution contexts. Binding further
/// work to the same context guarantees it runs on the same OS thread as
/// prior work bound to that context (used by the chat acceptor to pin a
/// session's I/O to one thread for its whole lifetime).
#[derive(Clone)]
pub struct ContextHandle {
    index: usize,
    inbox: mpsc::UnboundedSender<BoxedTask>,
}

impl ContextHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Run a future on this context's thread. Returns `false` if the
    /// context has already been torn down.
    pub fn spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inbox.send(Box::pin(fut)).is_ok()
    }
}

struct WorkerThread {
    join: Option<std::thread::JoinHandle<()>>,
}

/// Fixed-size pool of execution contexts plus a priority task dispatcher.
pub struct WorkerPool {
    contexts: Vec<ContextHandle>,
    threads: std::sync::Mutex<Vec<WorkerThread>>,
    channels: Vec<mpsc::Sender<BoxedTask>>,
    next_index: AtomicUsize,
    pending: Arc<AtomicUsize>,
    completion: Arc<Notify>,
    running: Arc<std::sync::atomic::AtomicBool>,
    channel_capacity: usize,
    shutdown: Arc<Notify>,
}

impl WorkerPool {
    /// Build and start a pool with `worker_count` contexts (min 1) and
    /// `channel_capacity` slots per priority channel.
    pub fn new(worker_count: usize, channel_capacity: usize) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        let pending = Arc::new(AtomicUsize::new(0));
        let completion = Arc::new(Notify::new());
        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());

        let mut contexts = Vec::with_capacity(worker_count);
        let mut threads = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let (tx, mut rx) = mpsc::unbounded_channel::<BoxedTask>();
            let pending_clone = pending.clone();
            let completion_clone = completion.clone();
            let worker_shutdown = shutdown.clone();
            let worker_running = running.clone();
            let join = std::thread::Builder::new()
                .name(format!("worker-ctx-{index}"))
                .spawn(move || {
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed to build worker context runtime");
                    let local = tokio::task::LocalSet::new();
                    local.block_on(&rt, async move {
                        // Each incoming task is spawned onto this context's LocalSet
                        // rather than awaited inline, so many tasks run concurrently
                        // on the same thread (matching one-io_context-per-thread
                        // semantics) instead of serializing behind the recv loop.
                        // `shutdown` is notified by `stop()` directly — other
                        // clones of `inbox` held by dispatchers/callers would
                        // otherwise keep the channel open forever.
                        loop {
                            if worker_running.load(Ordering::Acquire) {
                                // fallthrough: check before every select so a
                                // `notify_waiters()` that raced ahead of this
                                // task registering as a listener is never lost.
                            } else {
                                break;
                            }
                            let task = tokio::select! {
                                task = rx.recv() => task,
                                _ = worker_shutdown.notified() => None,
                            };
                            let Some(task) = task else { break };
                            let pending = pending_clone.clone();
                            let completion = completion_clone.clone();
                            tokio::task::spawn_local(async move {
                                // A nested spawn catches a panicking task as a
                                // JoinError instead of unwinding this supervisor.
                                if let Err(e) = tokio::task::spawn_local(task).await {
                                    error!(worker = index, err = %e, "worker task panicked");
                                }
                                if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                                    completion.notify_waiters();
                                }
                            });
                        }
                    });
                })
                .expect("failed to spawn worker thread");

            contexts.push(ContextHandle { index, inbox: tx });
            threads.push(WorkerThread { join: Some(join) });
        }

        let mut channels = Vec::with_capacity(PRIORITIES.len());
        for priority in PRIORITIES {
            let (tx, rx) = mpsc::channel::<BoxedTask>(channel_capacity);
            channels.push(tx);
            spawn_dispatcher(priority, rx, contexts.clone(), shutdown.clone());
        }

        Arc::new(Self {
            contexts,
            threads: std::sync::Mutex::new(threads),
            channels,
            next_index: AtomicUsize::new(0),
            pending,
            completion,
            running,
            channel_capacity,
            shutdown,
        })
    }

    /// Enqueue `task` at `priority`. Returns `false` if the pool is stopped
    /// or the channel is closed/full-and-closed.
    pub fn post<F>(&self, task: F, priority: Priority) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let idx = match priority {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.channels[idx].try_send(Box::pin(task)) {
            Ok(()) => true,
            Err(_) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                false
            }
        }
    }

    /// Round-robin over the `W` contexts (relaxed atomic counter).
    pub fn next_context(&self) -> ContextHandle {
        let i = self.next_index.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        self.contexts[i].clone()
    }

    pub fn context_at(&self, index: usize) -> Option<ContextHandle> {
        self.contexts.get(index % self.contexts.len().max(1)).cloned()
    }

    /// Pending tasks as a percentage of total channel capacity, clamped to [0, 100].
    pub fn current_load(&self) -> u32 {
        let pending = self.pending.load(Ordering::Acquire) as u64;
        let capacity = (self.contexts.len() as u64) * (self.channel_capacity as u64);
        if capacity == 0 {
            return 0;
        }
        ((pending * 100) / capacity).min(100) as u32
    }

    /// Block until the pending-task count reaches zero or `timeout_ms`
    /// elapses (0 = infinite).
    pub async fn wait_for_completion(&self, timeout_ms: u64) -> bool {
        if self.pending.load(Ordering::Acquire) == 0 {
            return true;
        }
        let wait = async {
            loop {
                let notified = self.completion.notified();
                if self.pending.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
                if self.pending.load(Ordering::Acquire) == 0 {
                    return;
                }
            }
        };
        if timeout_ms == 0 {
            wait.await;
            true
        } else {
            tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), wait)
                .await
                .is_ok()
        }
    }

    /// Close all channels, stop every context, and join all worker threads.
    /// Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("worker pool stopping");
        // Notifying `shutdown` races every worker/dispatcher select loop
        // against its `recv()` and wins even though other clones of the
        // channel senders stay alive elsewhere (e.g. a dispatcher holding a
        // `ContextHandle`) — a pending receive completing this way is a
        // normal shutdown signal, not a channel-closed error.
        self.shutdown.notify_waiters();
        let mut threads = self.threads.lock().expect("worker pool thread list poisoned");
        for t in threads.iter_mut() {
            if let Some(handle) = t.join.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_dispatcher(
    _priority: Priority,
    mut rx: mpsc::Receiver<BoxedTask>,
    contexts: Vec<ContextHandle>,
    shutdown: Arc<Notify>,
) {
    tokio::spawn(async move {
        let mut next = 0usize;
        loop {
            let received = tokio::select! {
                received = rx.recv() => received,
                _ = shutdown.notified() => None,
            };
            match received {
                Some(task) => {
                    let ctx = &contexts[next % contexts.len()];
                    next = next.wrapping_add(1);
                    if !ctx.spawn_boxed(task) {
                        warn!("worker context inbox closed — dropping task");
                    }
                }
                None => {
                    // Channel closed (all `post` senders dropped) or `stop()`
                    // notified shutdown directly. Both are a normal shutdown
                    // path, not an error.
                    break;
                }
            }
        }
    });
}

impl ContextHandle {
    fn spawn_boxed(&self, task: BoxedTask) -> bool {
        self.inbox.send(task).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn post_and_wait_for_completion() {
        let pool = WorkerPool::new(2, 16);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let c = counter.clone();
            assert!(pool.post(
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                },
                Priority::Normal
            ));
        }
        assert!(pool.wait_for_completion(5_000).await);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        pool.stop();
    }

    #[tokio::test]
    async fn round_robin_context_selection() {
        let pool = WorkerPool::new(3, 16);
        let a = pool.next_context().index();
        let b = pool.next_context().index();
        let c = pool.next_context().index();
        let d = pool.next_context().index();
        assert_eq!(vec![a, b, c, d], vec![0, 1, 2, 0]);
        pool.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let pool = WorkerPool::new(1, 4);
        pool.stop();
        pool.stop();
        assert!(!pool.post(async {}, Priority::Low));
    }

    #[tokio::test]
    async fn current_load_reflects_pending_tasks() {
        let pool = WorkerPool::new(1, 4);
        assert_eq!(pool.current_load(), 0);
        pool.stop();
    }
}
