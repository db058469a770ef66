//! Request/call pairing (C2).
//!
//! Mirrors `server.c`'s `request_matcher`: one instance per registered
//! method plus one "unregistered" catch-all (see [`crate::registry`]).
//! `requests_per_cq` (an array of lock-free mpscq, one per completion
//! queue) and `pending_head`/`pending_tail` (an intrusive list protected by
//! `server->mu_call`) collapse here into a single [`parking_lot::Mutex`]
//! guarding both sides of the pairing — the per-matcher mutex decision
//! recorded in `DESIGN.md`. `tickets` stays a [`crate::lock_free::IndexStack`]
//! so its capacity bound and panic-on-overflow semantics are reused as-is,
//! even though every access to it here happens to be made under the lock.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::call::CallRecord;
use crate::lock_free::IndexStack;

/// Outcome of [`RequestMatcher::offer_call`].
#[derive(Debug)]
pub enum MatchOutcome {
    /// A ticket was already waiting; pair the call with it immediately.
    /// The caller must still call [`CallRecord::try_activate`] before
    /// publishing, since the call can race a concurrent zombification
    /// between this return and activation.
    Matched(u32),
    /// The call was zombied (its stream closed) in the same instant it
    /// would otherwise have been queued; the caller must kill it and must
    /// not enqueue it.
    Zombied,
    /// No ticket was available; the call is now queued pending one.
    Queued,
}

/// Pairs incoming calls against outstanding request tickets for one method
/// (or the unregistered catch-all).
pub struct RequestMatcher {
    tickets: IndexStack,
    pending: Mutex<VecDeque<Arc<CallRecord>>>,
}

impl RequestMatcher {
    /// `capacity` bounds the number of outstanding ticket indices this
    /// matcher can hold at once — the same `max_requested_calls` bound
    /// every matcher shares (see [`crate::config::ServerConfig`]).
    pub fn new(capacity: usize) -> Self {
        Self {
            tickets: IndexStack::new(capacity),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// A request ticket at `index` became available (`request_call` /
    /// `request_registered_call`). If a call is already waiting, pop and
    /// return it for immediate pairing; otherwise queue the ticket index
    /// and return `None`.
    pub fn offer_ticket(&self, index: u32) -> Option<Arc<CallRecord>> {
        let mut pending = self.pending.lock();
        if let Some(call) = pending.pop_front() {
            return Some(call);
        }
        self.tickets.push(index);
        None
    }

    /// A call arrived (`start_new_rpc`'s probe match). If a ticket is
    /// already waiting, return its index for immediate pairing. Otherwise,
    /// mirror `queue_call_request`'s defensive re-check — transition the
    /// call to `Pending` and queue it, unless it has already been zombied
    /// (its stream closed) in the gap between "no ticket available" and
    /// acquiring the call's own state lock, in which case it must not be
    /// queued at all (see the
    /// `zombie_race_during_pairing_does_not_double_kill` regression test).
    pub fn offer_call(&self, call: Arc<CallRecord>) -> MatchOutcome {
        let mut pending = self.pending.lock();
        if let Some(index) = self.tickets.pop() {
            return MatchOutcome::Matched(index);
        }
        if !call.mark_pending() {
            return MatchOutcome::Zombied;
        }
        pending.push_back(call);
        MatchOutcome::Queued
    }

    /// Drain every outstanding ticket index, invoking `on_ticket` for each
    /// (used by shutdown to fail every still-outstanding request with a
    /// not-found completion; mirrors `kill_zombie_requests`'s request-side
    /// counterpart, `request_matcher_kill_requests`).
    pub fn drain_tickets(&self, mut on_ticket: impl FnMut(u32)) {
        let _guard = self.pending.lock();
        while let Some(index) = self.tickets.pop() {
            on_ticket(index);
        }
    }

    /// Drain every pending call, zombifying and killing each. Mirrors
    /// `request_matcher_zombify_all_pending_calls`.
    pub fn zombify_pending(&self) {
        let mut pending = self.pending.lock();
        while let Some(call) = pending.pop_front() {
            if call.try_zombify() {
                call.kill();
            }
        }
    }

    /// True if neither side has anything outstanding. Test/debug aid only —
    /// racy under concurrent callers.
    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.tickets.is_empty() && self.pending.lock().is_empty()
    }
}
