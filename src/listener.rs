//! Listener collection (C9).
//!
//! Mirrors `server.c`'s `listener` linked list (`grpc_server_add_listener`,
//! `listener->start`, `listener->destroy`) and the `listeners_destroyed`
//! counter `maybe_finish_shutdown` waits on alongside open channels.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Something that accepts inbound connections and hands each to the server
/// as a new channel (`grpc_server_setup_transport`). Implementations are
/// typically a TCP/Unix accept loop; this crate only orchestrates their
/// start/shutdown lifecycle, never the accept loop's own I/O.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Begin accepting connections. Called once, after
    /// `Server::start`'s completion-queue-registration check passes.
    async fn start(self: Arc<Self>);

    /// Stop accepting new connections and release any bound resources.
    /// Must be idempotent — shutdown can race a listener that is already
    /// winding down on its own.
    async fn shutdown(self: Arc<Self>);
}

/// The server's registered listener set, plus the "how many have finished
/// shutting down" count `maybe_finish_shutdown` waits on.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Mutex<Vec<(ListenerId, Arc<dyn Listener>)>>,
    destroyed: AtomicUsize,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// `grpc_server_add_listener`. Returns the id assigned to this listener.
    pub fn add(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.lock().push((id, listener));
        id
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Start every registered listener (`grpc_server_start`).
    pub async fn start_all(&self) {
        let listeners: Vec<_> = self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener.start().await;
        }
    }

    /// Shut down every registered listener, incrementing `destroyed` as
    /// each completes. The server polls [`Self::all_destroyed`] (alongside
    /// "no open channels") to decide when shutdown is complete.
    pub async fn shutdown_all(&self) {
        let listeners: Vec<_> = self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener.shutdown().await;
            self.destroyed.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn destroyed_count(&self) -> usize {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn all_destroyed(&self) -> bool {
        self.destroyed_count() >= self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct RecordingListener {
        started: AtomicBool,
        stopped: AtomicBool,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Listener for RecordingListener {
        async fn start(self: Arc<Self>) {
            self.started.store(true, Ordering::Release);
        }

        async fn shutdown(self: Arc<Self>) {
            self.stopped.store(true, Ordering::Release);
        }
    }

    #[tokio::test]
    async fn start_all_starts_every_listener() {
        let set = ListenerSet::new();
        let a = RecordingListener::new();
        let b = RecordingListener::new();
        set.add(a.clone());
        set.add(b.clone());

        set.start_all().await;

        assert!(a.started.load(Ordering::Acquire));
        assert!(b.started.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn shutdown_all_increments_destroyed_count() {
        let set = ListenerSet::new();
        set.add(RecordingListener::new());
        set.add(RecordingListener::new());
        assert!(!set.all_destroyed());

        set.shutdown_all().await;

        assert_eq!(set.destroyed_count(), 2);
        assert!(set.all_destroyed());
    }
}
