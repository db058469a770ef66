//! Channel broadcaster (C3).
//!
//! Mirrors `server.c`'s `channel_broadcaster_init` / `channel_broadcaster_shutdown`:
//! snapshot every live channel while holding the bookkeeping lock, then act
//! on the snapshot (sending GOAWAY, or disconnecting) without holding it, so
//! a slow transport write never stalls `mu_global`. With channels kept in a
//! `DashMap`, the "snapshot" step is just cloning the `Arc`s out of an
//! iterator rather than copying into a freshly allocated array, but the
//! two-phase shape — collect, then act unlocked — is kept because the
//! action phase is `async` and must not be taken while any synchronous lock
//! is held.

use std::sync::Arc;

use dashmap::DashMap;

use crate::channel::{ChannelId, ChannelRecord};

/// A point-in-time snapshot of every channel registered with a server,
/// taken for the purpose of broadcasting a shutdown action to all of them.
pub struct ChannelBroadcaster {
    channels: Vec<Arc<ChannelRecord>>,
}

impl ChannelBroadcaster {
    /// Snapshot every channel currently in `registry`.
    pub fn snapshot(registry: &DashMap<ChannelId, Arc<ChannelRecord>>) -> Self {
        Self {
            channels: registry.iter().map(|entry| entry.value().clone()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Send GOAWAY to every snapshotted channel. `force_disconnect` also
    /// tears down the connection immediately rather than waiting for the
    /// peer to close gracefully (`grpc_server_shutdown_and_notify`'s
    /// `shutdown_and_notify` path vs. `grpc_server_cancel_all_calls`'s
    /// harder path).
    pub async fn broadcast_goaway(&self, message: &str, force_disconnect: bool) {
        for channel in &self.channels {
            channel
                .transport()
                .send_goaway(true, message, force_disconnect)
                .await;
        }
    }

    /// Forcibly disconnect every snapshotted channel (`grpc_server_cancel_all_calls`).
    pub async fn disconnect_all(&self) {
        for channel in &self.channels {
            channel.transport().disconnect().await;
        }
    }
}
