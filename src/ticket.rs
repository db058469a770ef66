//! Request tickets and the server-wide ticket pool (C7).
//!
//! Mirrors `server.c`'s `requested_call` union and `request_freelist`
//! (`grpc_server.requested_calls`, sized by `max_requested_calls`). The
//! original's pointer-range check — distinguishing a heap-allocated
//! overflow ticket from one living inside the fixed backing array — has no
//! counterpart here: every ticket lives in the `DashMap` and the freelist
//! alone enforces the capacity bound (see `SPEC_FULL.md` §4.7).

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;

use crate::call::CallRecord;
use crate::lock_free::IndexStack;
use crate::registry::RegisteredMethod;
use crate::transport::{CompletionQueue, InitialMetadata, Tag};

pub type TicketIndex = u32;

/// The out-parameters `begin_call` writes before posting a ticket's
/// completion (`server.c`'s `*rc->call`, `details->host`, `details->method`,
/// `details->deadline`, the `recv_initial_metadata` array and, for a
/// `Registered` ticket with `optional_payload` set, the `recv_message`
/// result). Rust has no caller-supplied out-pointers, so `request_call` /
/// `request_registered_call` hand back an `Arc<CallDetails>` the
/// application reads once its completion queue yields the matching tag;
/// every field is write-once, enforced by `OnceLock` the same way
/// [`crate::call::CallRecord`]'s own metadata fields are.
#[derive(Default)]
pub struct CallDetails {
    call: OnceLock<Arc<CallRecord>>,
    host: OnceLock<Arc<str>>,
    method: OnceLock<Arc<str>>,
    deadline: OnceLock<Instant>,
    metadata: OnceLock<InitialMetadata>,
    payload: OnceLock<Option<Bytes>>,
}

impl CallDetails {
    pub fn call(&self) -> Option<&Arc<CallRecord>> {
        self.call.get()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.get().map(AsRef::as_ref)
    }

    pub fn method(&self) -> Option<&str> {
        self.method.get().map(AsRef::as_ref)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.get().copied()
    }

    pub fn metadata(&self) -> Option<&InitialMetadata> {
        self.metadata.get()
    }

    /// The `Registered`-ticket optional payload, if its method opted into
    /// `optional_payload` and the stream carried a message. `None` for
    /// every `Batch` ticket and for a `Registered` ticket that didn't ask
    /// for one.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.get().and_then(|payload| payload.as_ref())
    }

    pub(crate) fn set_call(&self, call: Arc<CallRecord>) {
        let _ = self.call.set(call);
    }

    pub(crate) fn set_host(&self, host: Arc<str>) {
        let _ = self.host.set(host);
    }

    pub(crate) fn set_method(&self, method: Arc<str>) {
        let _ = self.method.set(method);
    }

    pub(crate) fn set_deadline(&self, deadline: Instant) {
        let _ = self.deadline.set(deadline);
    }

    pub(crate) fn set_metadata(&self, metadata: InitialMetadata) {
        let _ = self.metadata.set(metadata);
    }

    pub(crate) fn set_payload(&self, payload: Option<Bytes>) {
        let _ = self.payload.set(payload);
    }
}

/// One outstanding `request_call` / `request_registered_call`, recorded
/// until a [`crate::matcher::RequestMatcher`] pairs it with an incoming
/// call.
pub enum RequestedCall {
    /// `grpc_server_request_call`: any unmatched call routes here.
    Batch {
        cq: Arc<dyn CompletionQueue>,
        tag: Tag,
        details: Arc<CallDetails>,
    },

    /// `grpc_server_request_registered_call`: only calls whose path/host
    /// match `method` are ever paired with this ticket.
    Registered {
        cq: Arc<dyn CompletionQueue>,
        tag: Tag,
        method: Arc<RegisteredMethod>,
        details: Arc<CallDetails>,
    },
}

impl std::fmt::Debug for RequestedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestedCall::Batch { .. } => f.write_str("RequestedCall::Batch"),
            RequestedCall::Registered { method, .. } => {
                write!(f, "RequestedCall::Registered({})", method.method)
            }
        }
    }
}

impl RequestedCall {
    pub fn completion_queue(&self) -> &Arc<dyn CompletionQueue> {
        match self {
            RequestedCall::Batch { cq, .. } => cq,
            RequestedCall::Registered { cq, .. } => cq,
        }
    }

    pub fn details(&self) -> &Arc<CallDetails> {
        match self {
            RequestedCall::Batch { details, .. } => details,
            RequestedCall::Registered { details, .. } => details,
        }
    }

    /// Consume the ticket, handing back its application tag — the last
    /// step before posting a completion (`done_request_event`'s tag
    /// hand-back in the original).
    pub fn into_tag(self) -> Tag {
        match self {
            RequestedCall::Batch { tag, .. } => tag,
            RequestedCall::Registered { tag, .. } => tag,
        }
    }
}

/// The server-wide pool backing every outstanding ticket, shared by the
/// unregistered matcher and every registered method's matcher alike —
/// `server->requested_calls` / `server->request_freelist` in the original.
pub struct TicketPool {
    freelist: IndexStack,
    slots: DashMap<TicketIndex, RequestedCall>,
}

impl TicketPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            freelist: IndexStack::full(capacity),
            slots: DashMap::new(),
        }
    }

    /// Check out a free index and store `call` at it. `Err` (handing the
    /// ticket straight back, rather than silently dropping its tag) means
    /// the pool is at capacity — the caller must fail the request
    /// immediately instead (`grpc_server_request_call`'s `GRPC_CALL_OK` vs.
    /// the "too many outstanding requests" completion, delivered as a
    /// failed completion rather than a synchronous error per
    /// `SPEC_FULL.md` §7).
    pub fn checkout(&self, call: RequestedCall) -> Result<TicketIndex, RequestedCall> {
        match self.freelist.pop() {
            Some(index) => {
                self.slots.insert(index, call);
                Ok(index)
            }
            None => Err(call),
        }
    }

    /// Remove and return the ticket stored at `index`, returning the index
    /// to the freelist.
    ///
    /// # Panics
    /// Panics if `index` was not currently checked out — callers only ever
    /// pass back indices a matcher itself handed them.
    pub fn take(&self, index: TicketIndex) -> RequestedCall {
        let (_, call) = self
            .slots
            .remove(&index)
            .expect("ticket index not checked out");
        self.freelist.push(index);
        call
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::RecordingCompletionQueue;

    fn batch_ticket() -> RequestedCall {
        RequestedCall::Batch {
            cq: RecordingCompletionQueue::new(),
            tag: Box::new(()),
            details: Arc::new(CallDetails::default()),
        }
    }

    #[test]
    fn checkout_and_take_round_trip() {
        let pool = TicketPool::new(2);
        let index = pool.checkout(batch_ticket()).expect("capacity available");
        let ticket = pool.take(index);
        assert!(matches!(ticket, RequestedCall::Batch { .. }));
    }

    #[test]
    fn checkout_fails_once_capacity_exhausted() {
        let pool = TicketPool::new(1);
        let first = pool.checkout(batch_ticket());
        assert!(first.is_ok());
        let second = pool.checkout(batch_ticket());
        assert!(
            matches!(second, Err(RequestedCall::Batch { .. })),
            "the rejected ticket must be handed back, not dropped, so its tag isn't lost"
        );
    }

    #[test]
    fn index_is_reusable_after_take() {
        let pool = TicketPool::new(1);
        let index = pool.checkout(batch_ticket()).unwrap();
        pool.take(index);
        let again = pool.checkout(batch_ticket());
        assert_eq!(again.ok(), Some(index));
    }
}
