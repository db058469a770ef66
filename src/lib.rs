//! A lock-free call/ticket matching core for an RPC server.
//!
//! This crate implements the matching engine at the heart of an RPC
//! server: pairing inbound calls against application-issued request
//! tickets, routing by registered method, and orchestrating graceful
//! shutdown across every open channel and listener. It deliberately stops
//! short of being a full RPC stack — wire framing, codecs, and transport
//! I/O are all external collaborators reached through the traits in
//! [`transport`].
//!
//! Start with [`server::Server`]; [`config::ServerConfig`] controls its
//! tunables.

pub mod broadcaster;
pub mod call;
pub mod channel;
pub mod config;
pub mod error;
pub mod interner;
pub mod listener;
pub mod lock_free;
pub mod matcher;
pub mod registry;
pub mod server;
pub mod ticket;
pub mod transport;

pub use call::{CallId, CallRecord, CallState};
pub use channel::{ChannelId, ChannelRecord, ConnectivityState};
pub use config::ServerConfig;
pub use error::{Result, SwitchboardError};
pub use listener::{Listener, ListenerId};
pub use registry::RegisteredMethod;
pub use server::Server;
pub use ticket::{CallDetails, RequestedCall, TicketIndex};
pub use transport::{CompletionQueue, IncomingStream, InitialMetadata, Tag, Transport};
