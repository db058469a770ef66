//! Collaborator traits for the wire transport, the call object, and the
//! completion-queue primitive.
//!
//! All three are explicitly out of scope for this crate (`spec.md` §1) — it
//! only consumes them through these interfaces, the same way `fusillade`
//! consumes an external HTTP endpoint only through its `HttpClient` trait
//! (`batcher/src/http.rs`). `test_support` below plays the role of that
//! module's `MockHttpClient`: an in-process double good enough to drive this
//! crate's integration tests without a real transport.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;

/// One interned-at-the-wire metadata header.
#[derive(Debug, Clone)]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
}

/// The initial metadata frame of a stream, plus any deadline the framing
/// layer computed for it (deadline parsing from a wire header such as
/// `grpc-timeout` is itself out of scope — the transport hands over an
/// already-resolved deadline, if any, exactly as the original's
/// `grpc_metadata_batch.deadline` field arrives pre-computed at the filter).
#[derive(Debug, Clone, Default)]
pub struct InitialMetadata {
    pub entries: Vec<MetadataEntry>,
    pub deadline: Option<Instant>,
}

impl InitialMetadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }
}

/// Lifecycle state of a stream, as observed by the core after metadata
/// arrives. Mirrors `GRPC_STREAM_{OPEN,SEND_CLOSED,RECV_CLOSED,CLOSED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    SendClosed,
    RecvClosed,
    Closed,
}

/// The boundary to one accepted RPC stream (the "call object" of `spec.md`
/// §1 — metadata parsing and byte-buffer plumbing beyond this surface are
/// not this crate's concern).
#[async_trait]
pub trait IncomingStream: Send + Sync {
    /// Resolves once the stream's initial metadata frame has arrived.
    /// Implementations must cache the result — this may be awaited more than
    /// once (by the interception task and later by `begin_call`).
    async fn initial_metadata(&self) -> InitialMetadata;

    /// Resolves once the stream state has progressed to `RecvClosed` or
    /// `Closed`, or immediately if it already has. Used to race against
    /// `initial_metadata` so a stream closed before metadata arrives can be
    /// zombied rather than left `NotStarted` forever.
    async fn closed(&self) -> StreamState;

    /// Current observed state (non-blocking).
    fn state(&self) -> StreamState;

    /// Optional message body, requested only for `Registered` tickets that
    /// opted into `optional_payload`.
    async fn message(&self) -> Option<Bytes>;

    /// Bind the completion queue this call's own operations should post to
    /// (`rc->cq_bound_to_call` in the original).
    fn bind_completion_queue(&self, cq: Arc<dyn CompletionQueue>);
}

/// Transport-level operations the core needs against one channel:
/// send-goaway, disconnect, and pollset/completion-queue binding.
/// Connectivity-state subscription is exposed as a `tokio::sync::watch`
/// receiver rather than a one-shot closure upcall (`channel::ChannelRecord`
/// holds the sender side).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a GOAWAY with the given status and message; `force_disconnect`
    /// additionally tears down the connection immediately.
    async fn send_goaway(&self, status_ok: bool, message: &str, force_disconnect: bool);

    /// Forcibly disconnect without a GOAWAY (used by `cancel_all_calls`).
    async fn disconnect(&self);

    /// Bind a completion queue's pollset to this transport.
    fn bind_pollset(&self, cq: Arc<dyn CompletionQueue>);
}

/// An opaque application tag, handed back unmodified on completion.
pub type Tag = Box<dyn std::any::Any + Send>;

/// The completion-queue primitive (`spec.md` §1): the core only calls
/// `begin_op` / `end_op` / `is_server_cq` / `mark_server_cq` against it.
pub trait CompletionQueue: Send + Sync {
    /// Called before any operation that will eventually post a completion to
    /// this queue, so the queue can track outstanding work.
    fn begin_op(&self);

    /// Post one completion event: `tag` handed back to the application,
    /// `success` reflecting whether the op completed successfully.
    fn end_op(&self, tag: Tag, success: bool);

    /// Whether this queue has been marked as a server completion queue via
    /// `mark_server_cq`.
    fn is_server_cq(&self) -> bool;

    /// Mark this queue as eligible for `request_call`/`request_registered_call`.
    fn mark_server_cq(&self);
}

pub mod test_support {
    //! In-process test doubles, grounded on `batcher/src/http.rs`'s
    //! `MockHttpClient`: explicit setter methods driving an otherwise
    //! passive double, plus a call log for assertions.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::sync::{watch, Notify};

    /// A completion event delivered to [`RecordingCompletionQueue`].
    pub struct CompletionEvent {
        pub tag: Tag,
        pub success: bool,
    }

    /// A [`CompletionQueue`] that records every posted completion in order
    /// and lets a test `await` the next one.
    pub struct RecordingCompletionQueue {
        server_cq: std::sync::atomic::AtomicBool,
        events: Mutex<VecDeque<CompletionEvent>>,
        notify: Notify,
    }

    impl RecordingCompletionQueue {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                server_cq: std::sync::atomic::AtomicBool::new(false),
                events: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            })
        }

        /// Wait for and return the next posted completion.
        pub async fn recv(&self) -> CompletionEvent {
            loop {
                if let Some(event) = self.events.lock().pop_front() {
                    return event;
                }
                self.notify.notified().await;
            }
        }

        /// Non-blocking peek at whether any completion is queued.
        pub fn try_recv(&self) -> Option<CompletionEvent> {
            self.events.lock().pop_front()
        }
    }

    impl CompletionQueue for RecordingCompletionQueue {
        fn begin_op(&self) {}

        fn end_op(&self, tag: Tag, success: bool) {
            self.events.lock().push_back(CompletionEvent { tag, success });
            self.notify.notify_waiters();
        }

        fn is_server_cq(&self) -> bool {
            self.server_cq.load(std::sync::atomic::Ordering::Acquire)
        }

        fn mark_server_cq(&self) {
            self.server_cq.store(true, std::sync::atomic::Ordering::Release);
        }
    }

    /// A controllable [`IncomingStream`] double: tests call [`Self::push_metadata`]
    /// / [`Self::close`] to simulate wire events.
    pub struct TestStream {
        metadata: tokio::sync::OnceCell<InitialMetadata>,
        metadata_notify: Notify,
        message: Mutex<Option<Bytes>>,
        state_tx: watch::Sender<StreamState>,
        state_rx: watch::Receiver<StreamState>,
        bound_cq: Mutex<Option<Arc<dyn CompletionQueue>>>,
    }

    impl TestStream {
        pub fn new() -> Arc<Self> {
            let (state_tx, state_rx) = watch::channel(StreamState::Open);
            Arc::new(Self {
                metadata: tokio::sync::OnceCell::new(),
                metadata_notify: Notify::new(),
                message: Mutex::new(None),
                state_tx,
                state_rx,
                bound_cq: Mutex::new(None),
            })
        }

        /// Simulate the wire delivering initial metadata.
        pub fn push_metadata(&self, entries: Vec<(&str, &str)>) {
            let metadata = InitialMetadata {
                entries: entries
                    .into_iter()
                    .map(|(k, v)| MetadataEntry {
                        key: k.to_string(),
                        value: v.to_string(),
                    })
                    .collect(),
                deadline: None,
            };
            let _ = self.metadata.set(metadata);
            self.metadata_notify.notify_waiters();
        }

        pub fn push_message(&self, bytes: Bytes) {
            *self.message.lock() = Some(bytes);
        }

        /// Simulate the stream closing (`state` becomes `Closed`).
        pub fn close(&self) {
            let _ = self.state_tx.send(StreamState::Closed);
        }

        pub fn bound_completion_queue(&self) -> Option<Arc<dyn CompletionQueue>> {
            self.bound_cq.lock().clone()
        }
    }

    #[async_trait]
    impl IncomingStream for TestStream {
        async fn initial_metadata(&self) -> InitialMetadata {
            loop {
                if let Some(metadata) = self.metadata.get() {
                    return metadata.clone();
                }
                self.metadata_notify.notified().await;
            }
        }

        async fn closed(&self) -> StreamState {
            let mut rx = self.state_rx.clone();
            loop {
                let state = *rx.borrow();
                if matches!(state, StreamState::RecvClosed | StreamState::Closed) {
                    return state;
                }
                if rx.changed().await.is_err() {
                    return *rx.borrow();
                }
            }
        }

        fn state(&self) -> StreamState {
            *self.state_rx.borrow()
        }

        async fn message(&self) -> Option<Bytes> {
            self.message.lock().clone()
        }

        fn bind_completion_queue(&self, cq: Arc<dyn CompletionQueue>) {
            *self.bound_cq.lock() = Some(cq);
        }
    }

    /// A [`Transport`] double recording every goaway/disconnect it receives.
    pub struct RecordingTransport {
        events: Mutex<Vec<String>>,
    }

    impl RecordingTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        pub fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_goaway(&self, status_ok: bool, message: &str, force_disconnect: bool) {
            self.events.lock().push(format!(
                "goaway(ok={status_ok}, msg={message:?}, force_disconnect={force_disconnect})"
            ));
        }

        async fn disconnect(&self) {
            self.events.lock().push("disconnect".to_string());
        }

        fn bind_pollset(&self, _cq: Arc<dyn CompletionQueue>) {
            self.events.lock().push("bind_pollset".to_string());
        }
    }
}
