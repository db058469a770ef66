//! Call records and the per-call state machine (C5).
//!
//! Mirrors `server.c`'s `call_data` and its `call_state` enum. The original
//! threads a `channel_data *` and an intrusive `pending_next` pointer through
//! `call_data`; here the matcher owns pending calls by `Arc` in an explicit
//! `VecDeque` (see [`crate::matcher`]), so neither is needed on the record
//! itself.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;

use crate::transport::{IncomingStream, InitialMetadata};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique call identifier, assigned at [`CallRecord::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    fn next() -> Self {
        Self(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// `call_state` from the original: `NOT_STARTED -> {PENDING, ACTIVATED,
/// ZOMBIED}`, with `ACTIVATED` and `ZOMBIED` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    NotStarted,
    Pending,
    Activated,
    Zombied,
}

/// One accepted-but-not-yet-matched (or already-matched) RPC.
///
/// `path`/`host`/`deadline` are write-once: set by the metadata-interception
/// task before the call is queued for matching, read-only afterward. A
/// `OnceLock` gives that exactly-once-write discipline without a lock on the
/// read path.
pub struct CallRecord {
    id: CallId,
    state: Mutex<CallState>,
    path: OnceLock<Arc<str>>,
    host: OnceLock<Arc<str>>,
    deadline: OnceLock<Instant>,
    stream: Arc<dyn IncomingStream>,
    killed: AtomicBool,
}

impl CallRecord {
    pub fn new(stream: Arc<dyn IncomingStream>) -> Arc<Self> {
        Arc::new(Self {
            id: CallId::next(),
            state: Mutex::new(CallState::NotStarted),
            path: OnceLock::new(),
            host: OnceLock::new(),
            deadline: OnceLock::new(),
            stream,
            killed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    pub fn path(&self) -> Option<&Arc<str>> {
        self.path.get()
    }

    pub fn host(&self) -> Option<&Arc<str>> {
        self.host.get()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.get().copied()
    }

    pub fn stream(&self) -> &Arc<dyn IncomingStream> {
        &self.stream
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Record the initial metadata this call arrived with. Called exactly
    /// once, before the call is handed to a matcher.
    pub(crate) fn set_initial_metadata(&self, path: Arc<str>, host: Option<Arc<str>>, metadata: &InitialMetadata) {
        let _ = self.path.set(path);
        if let Some(host) = host {
            let _ = self.host.set(host);
        }
        if let Some(deadline) = metadata.deadline {
            let _ = self.deadline.set(deadline);
        }
    }

    /// `NotStarted -> Pending`. Returns `false` if the call was zombied
    /// (stream closed) before it could be queued — the caller must not
    /// enqueue it in that case, matching `queue_call_request`'s defensive
    /// re-check in the original.
    pub(crate) fn mark_pending(&self) -> bool {
        let mut guard = self.state.lock();
        match *guard {
            CallState::NotStarted => {
                *guard = CallState::Pending;
                true
            }
            CallState::Zombied => false,
            CallState::Pending | CallState::Activated => {
                unreachable!("mark_pending called twice on {}", self.id)
            }
        }
    }

    /// `{NotStarted, Pending} -> Activated`. Returns `false` if the call was
    /// concurrently zombied — the caller must not hand it to the
    /// application in that case.
    pub(crate) fn try_activate(&self) -> bool {
        let mut guard = self.state.lock();
        match *guard {
            CallState::NotStarted | CallState::Pending => {
                *guard = CallState::Activated;
                true
            }
            CallState::Zombied => false,
            CallState::Activated => unreachable!("try_activate called twice on {}", self.id),
        }
    }

    /// `{NotStarted, Pending} -> Zombied`. Returns `true` if this call
    /// performed the transition, so the caller is the one responsible for
    /// scheduling `kill` exactly once. A call already `Activated` is past
    /// the core's jurisdiction; already-`Zombied` means someone else won the
    /// race.
    pub(crate) fn try_zombify(&self) -> bool {
        let mut guard = self.state.lock();
        match *guard {
            CallState::NotStarted | CallState::Pending => {
                *guard = CallState::Zombied;
                true
            }
            CallState::Activated | CallState::Zombied => false,
        }
    }

    /// Perform the zombie-kill action: notify the stream's completion queue
    /// with a failed completion, the rough equivalent of `kill_zombie`
    /// invoking `execute_closure_later` with `error != GRPC_ERROR_NONE`.
    pub(crate) fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        tracing::debug!(call_id = %self.id, "zombie call killed");
    }
}

impl Drop for CallRecord {
    fn drop(&mut self) {
        debug_assert!(
            *self.state.lock() != CallState::Pending,
            "call {} dropped while still pending",
            self.id
        );
    }
}

impl fmt::Debug for CallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRecord")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("path", &self.path.get())
            .field("host", &self.host.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::TestStream;

    #[test]
    fn mark_pending_then_activate_succeeds() {
        let call = CallRecord::new(TestStream::new());
        assert!(call.mark_pending());
        assert_eq!(call.state(), CallState::Pending);
        assert!(call.try_activate());
        assert_eq!(call.state(), CallState::Activated);
    }

    #[test]
    fn zombify_wins_the_race_exactly_once() {
        let call = CallRecord::new(TestStream::new());
        assert!(call.mark_pending());
        assert!(call.try_zombify());
        assert!(!call.try_zombify(), "second zombify must not re-win");
        assert_eq!(call.state(), CallState::Zombied);
    }

    #[test]
    fn activate_after_zombify_fails() {
        let call = CallRecord::new(TestStream::new());
        assert!(call.try_zombify());
        assert!(!call.try_activate());
    }

    #[test]
    fn zombify_after_activate_fails() {
        let call = CallRecord::new(TestStream::new());
        assert!(call.try_activate());
        assert!(!call.try_zombify());
    }

    #[test]
    fn set_initial_metadata_is_write_once() {
        let call = CallRecord::new(TestStream::new());
        let metadata = InitialMetadata::default();
        call.set_initial_metadata(Arc::from("/svc/Method"), Some(Arc::from("host")), &metadata);
        assert_eq!(call.path().map(|p| p.as_ref()), Some("/svc/Method"));
        assert_eq!(call.host().map(|h| h.as_ref()), Some("host"));
    }
}
