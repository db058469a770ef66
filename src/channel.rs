//! Channel records (C4).
//!
//! Mirrors `server.c`'s `channel_data` plus the intrusive channel ring
//! (`grpc_server.root_channel_data`, `channel_broadcaster`'s
//! `channel_data.channels` splice). The original's `next`/`prev` pointers
//! protected by `server->mu_global` are replaced by the server owning a
//! `DashMap<ChannelId, Arc<ChannelRecord>>`; this record holds only a `Weak`
//! back-reference, never an `Arc`, so a channel can never keep the server
//! alive and the map is the single source of truth for "is this channel
//! still registered" (`ChannelRecord::orphaned`).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::transport::Transport;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel#{}", self.0)
    }
}

/// `GRPC_CHANNEL_{IDLE,CONNECTING,READY,TRANSIENT_FAILURE,SHUTDOWN}`,
/// narrowed to what the core itself observes (a channel it owns a record
/// for is never `IDLE`/`CONNECTING` from the server's point of view).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Ready,
    TransientFailure,
    Shutdown,
}

/// One accepted transport connection, tracked from `setup_transport` until
/// `orphan_channel` removes it from the server's channel map.
pub struct ChannelRecord {
    id: ChannelId,
    transport: Arc<dyn Transport>,
    state_tx: watch::Sender<ConnectivityState>,
    orphaned: AtomicBool,
}

impl ChannelRecord {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectivityState::Ready);
        Arc::new(Self {
            id: ChannelId::next(),
            transport,
            state_tx,
            orphaned: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// `channel_connectivity_changed`: record a new connectivity state,
    /// waking anyone watching. The server reacts to a transition into
    /// `Shutdown` by orphaning the channel (`orphan_channel`).
    pub(crate) fn set_connectivity_state(&self, state: ConnectivityState) {
        let _ = self.state_tx.send(state);
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::Acquire)
    }

    /// Mark this record as removed from the server's channel map. Idempotent;
    /// returns `true` the first time it's called (mirrors `orphan_channel`'s
    /// single `channel_broadcaster`/list-unlink action).
    pub(crate) fn mark_orphaned(&self) -> bool {
        self.orphaned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for ChannelRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRecord")
            .field("id", &self.id)
            .field("connectivity_state", &self.connectivity_state())
            .field("orphaned", &self.is_orphaned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::RecordingTransport;

    #[test]
    fn mark_orphaned_is_idempotent() {
        let channel = ChannelRecord::new(RecordingTransport::new());
        assert!(channel.mark_orphaned());
        assert!(!channel.mark_orphaned());
        assert!(channel.is_orphaned());
    }

    #[test]
    fn connectivity_state_updates_are_observable() {
        let channel = ChannelRecord::new(RecordingTransport::new());
        let mut rx = channel.subscribe();
        channel.set_connectivity_state(ConnectivityState::TransientFailure);
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::TransientFailure);
    }
}
