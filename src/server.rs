//! The server object and shutdown orchestrator (C8).
//!
//! Mirrors `server.c`'s `grpc_server` plus its top-level verbs
//! (`grpc_server_create`, `_register_completion_queue`, `_register_method`,
//! `_start`, `_setup_transport`, `_request_call`,
//! `_request_registered_call`, `_shutdown_and_notify`, `_cancel_all_calls`,
//! `_destroy`, `_add_listener`). `grpc_server`'s manual `internal_refcount`
//! is replaced entirely by `Arc<ServerInner>` — `Server` is a thin cloneable
//! handle around it, the way `fusillade`'s daemon handle wraps its shared
//! state (`fusillade/src/daemon/mod.rs`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::broadcaster::ChannelBroadcaster;
use crate::call::CallRecord;
use crate::channel::{ChannelId, ChannelRecord, ConnectivityState};
use crate::config::ServerConfig;
use crate::error::{Result, SwitchboardError};
use crate::interner::Interner;
use crate::listener::{Listener, ListenerId, ListenerSet};
use crate::matcher::{MatchOutcome, RequestMatcher};
use crate::registry::{ProbeTable, RegisteredMethod};
use crate::ticket::{CallDetails, RequestedCall, TicketIndex, TicketPool};
use crate::transport::{CompletionQueue, IncomingStream, Tag, Transport};

/// Pending build-time registrations, collected before [`Server::start`]
/// freezes them into a [`ProbeTable`]. Split out of [`ServerInner`] so it
/// can sit behind its own short-lived lock instead of serializing against
/// the hot call path.
struct Registrations {
    methods: Vec<Arc<RegisteredMethod>>,
    table: Option<ProbeTable>,
}

struct ServerInner {
    config: ServerConfig,
    interner: Interner,
    completion_queues: Mutex<Vec<Arc<dyn CompletionQueue>>>,
    registrations: Mutex<Registrations>,
    unregistered_matcher: RequestMatcher,
    tickets: TicketPool,
    channels: DashMap<ChannelId, Arc<ChannelRecord>>,
    listeners: ListenerSet,
    started: AtomicBool,
    shutdown_called: AtomicBool,
    shutdown_complete: AtomicBool,
    shutdown_notify: Notify,
    /// `(cq, tag)` pairs from every `shutdown_and_notify` call, each posted
    /// a completion once shutdown actually finishes draining. The original
    /// supports multiple overlapping shutdown callers; this is the Rust
    /// equivalent of its `shutdown_tags` array.
    shutdown_waiters: Mutex<Vec<(Arc<dyn CompletionQueue>, Tag)>>,
    /// Last time `maybe_finish_shutdown` logged a "still waiting" line,
    /// throttled to `config.shutdown_log_interval` (`server.c`'s
    /// `last_shutdown_message_time`).
    last_shutdown_log: Mutex<Option<Instant>>,
}

/// A cloneable handle to one RPC server core.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// `grpc_server_create`.
    pub fn new(config: ServerConfig) -> Self {
        let tickets = TicketPool::new(config.max_requested_calls);
        let unregistered_matcher = RequestMatcher::new(config.max_requested_calls);
        Self {
            inner: Arc::new(ServerInner {
                config,
                interner: Interner::new(),
                completion_queues: Mutex::new(Vec::new()),
                registrations: Mutex::new(Registrations {
                    methods: Vec::new(),
                    table: None,
                }),
                unregistered_matcher,
                tickets,
                channels: DashMap::new(),
                listeners: ListenerSet::new(),
                started: AtomicBool::new(false),
                shutdown_called: AtomicBool::new(false),
                shutdown_complete: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
                shutdown_waiters: Mutex::new(Vec::new()),
                last_shutdown_log: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// `grpc_server_register_completion_queue`, restricted to server-marked
    /// queues (`reserved == NULL` / non-pluck path in the original).
    pub fn register_completion_queue(&self, cq: Arc<dyn CompletionQueue>) -> Result<()> {
        if self.inner.started.load(Ordering::Acquire) {
            return Err(SwitchboardError::AlreadyStarted);
        }
        cq.mark_server_cq();
        self.inner.completion_queues.lock().push(cq);
        Ok(())
    }

    /// `grpc_server_register_method`. `host = None` registers a wildcard
    /// matching any host. Returns an opaque registration handle, to be
    /// passed back to [`Self::request_registered_call`] — the Rust
    /// equivalent of the original's `void *method_registration` return
    /// value.
    #[tracing::instrument(skip(self))]
    pub fn register_method(
        &self,
        method: &str,
        host: Option<&str>,
        optional_payload: bool,
    ) -> Result<Arc<RegisteredMethod>> {
        if method.is_empty() {
            return Err(SwitchboardError::EmptyMethod);
        }
        if self.inner.started.load(Ordering::Acquire) {
            return Err(SwitchboardError::AlreadyStarted);
        }

        let mut registrations = self.inner.registrations.lock();
        let interned_method = self.inner.interner.intern(method);
        let interned_host = host.map(|h| self.inner.interner.intern(h));

        let duplicate = registrations.methods.iter().any(|m| {
            Arc::ptr_eq(&m.method, &interned_method)
                && m.host.as_ref().map(Arc::as_ptr) == interned_host.as_ref().map(Arc::as_ptr)
        });
        if duplicate {
            return Err(SwitchboardError::DuplicateRegistration {
                method: method.to_string(),
                host: host.map(str::to_string),
            });
        }

        let registered = Arc::new(RegisteredMethod {
            method: interned_method,
            host: interned_host,
            optional_payload,
            matcher: RequestMatcher::new(self.inner.config.max_requested_calls),
        });
        registrations.methods.push(registered.clone());
        Ok(registered)
    }

    /// `grpc_server_add_listener`.
    pub fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    /// `grpc_server_start`: freeze the registered-method set into a probe
    /// table and start every listener.
    pub async fn start(&self) {
        self.inner.started.store(true, Ordering::Release);
        let mut registrations = self.inner.registrations.lock();
        let methods = registrations.methods.clone();
        registrations.table = Some(ProbeTable::build(methods));
        drop(registrations);
        self.inner.listeners.start_all().await;
        tracing::info!("server started");
    }

    /// `grpc_server_setup_transport`: register a newly accepted connection
    /// as a channel. Returns `None` if the server has already begun
    /// shutting down — the caller should disconnect the transport
    /// immediately rather than register it. Binds every completion queue
    /// registered so far to the new transport's pollset — `grpc_server_start`'s
    /// "bind pollsets from registered CQs" has nothing to bind against until
    /// a transport exists, so that binding happens here instead, once per
    /// channel, against the now-frozen registered-CQ set (`register_completion_queue`
    /// refuses new queues once `start` has run).
    #[tracing::instrument(skip(self, transport))]
    pub fn setup_transport(&self, transport: Arc<dyn Transport>) -> Option<Arc<ChannelRecord>> {
        if self.inner.shutdown_called.load(Ordering::Acquire) {
            return None;
        }
        for cq in self.inner.completion_queues.lock().iter() {
            transport.bind_pollset(cq.clone());
        }
        let channel = ChannelRecord::new(transport);
        self.inner.channels.insert(channel.id(), channel.clone());
        tracing::debug!(channel_id = %channel.id(), "channel registered");
        Some(channel)
    }

    /// `channel_connectivity_changed`: react to a channel's transport
    /// reporting `Shutdown` by orphaning it, which may unblock a pending
    /// `shutdown_and_notify`.
    pub fn notify_connectivity_change(&self, channel: &Arc<ChannelRecord>, state: ConnectivityState) {
        channel.set_connectivity_state(state);
        if state == ConnectivityState::Shutdown {
            self.orphan_channel(channel);
        }
    }

    /// `orphan_channel`.
    fn orphan_channel(&self, channel: &Arc<ChannelRecord>) {
        if channel.mark_orphaned() {
            self.inner.channels.remove(&channel.id());
            self.maybe_finish_shutdown();
        }
    }

    pub fn open_channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// Supplemented beyond the distilled verb table (`grpc_server_has_open_connections`):
    /// used by operators to decide whether it's safe to stop routing new
    /// connections to this process.
    pub fn has_open_connections(&self) -> bool {
        !self.inner.channels.is_empty()
    }

    /// `accept_stream`: a channel's transport delivered a new inbound
    /// stream. Spawns the metadata-interception task (the original's
    /// deferred `recv_initial_filter` closure) that waits for initial
    /// metadata, then dispatches via [`Self::start_new_rpc`]. If the
    /// stream closes before any metadata arrives, the call is zombied and
    /// killed directly without ever reaching a matcher.
    #[tracing::instrument(skip(self, channel, stream), fields(channel_id = %channel.id()))]
    pub fn accept_stream(&self, channel: &Arc<ChannelRecord>, stream: Arc<dyn IncomingStream>) {
        let server = self.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            let call = CallRecord::new(stream.clone());

            tokio::select! {
                metadata = stream.initial_metadata() => {
                    let Some(path) = metadata.get(":path").map(|p| server.inner.interner.intern(p)) else {
                        if call.try_zombify() {
                            call.kill();
                        }
                        return;
                    };
                    let host = metadata.get(":authority").map(|h| server.inner.interner.intern(h));
                    call.set_initial_metadata(path, host, &metadata);
                    tracing::debug!(call_id = %call.id(), channel_id = %channel.id(), "call accepted");
                    server.start_new_rpc(call);
                }
                _ = stream.closed() => {
                    if call.try_zombify() {
                        call.kill();
                    }
                }
            }
        });
    }

    /// `start_new_rpc`: probe the registered-method table, then pair
    /// against the matching [`RequestMatcher`] (falling back to the
    /// unregistered catch-all when nothing matches).
    fn start_new_rpc(&self, call: Arc<CallRecord>) {
        let path = call.path().expect("set just before this call").clone();
        let host = call.host().cloned();

        let registered = {
            let registrations = self.inner.registrations.lock();
            registrations
                .table
                .as_ref()
                .and_then(|table| table.lookup(&path, host.as_ref()))
                .cloned()
        };

        let matcher: &RequestMatcher = match &registered {
            Some(method) => &method.matcher,
            None => &self.inner.unregistered_matcher,
        };

        match matcher.offer_call(call.clone()) {
            MatchOutcome::Matched(index) => self.publish(matcher, index, call),
            MatchOutcome::Zombied => call.kill(),
            MatchOutcome::Queued => {}
        }
    }

    /// A matched `(ticket index, call)` pair: activate the call and hand
    /// the ticket off to [`Self::deliver`] for its `begin_call` work. If the
    /// call was zombied in the window between matching and activation, the
    /// ticket's contents are handed back to the matcher to pair with the
    /// next arrival instead of being consumed
    /// (`zombie_race_during_pairing_does_not_double_kill`).
    fn publish(&self, matcher: &RequestMatcher, index: TicketIndex, call: Arc<CallRecord>) {
        if !call.try_activate() {
            call.kill();
            if let Some(next_call) = matcher.offer_ticket(index) {
                self.publish(matcher, index, next_call);
            }
            return;
        }

        let ticket = self.inner.tickets.take(index);
        let server = self.clone();
        tokio::spawn(async move {
            server.deliver(ticket, call).await;
        });
    }

    /// `begin_call`: populate the ticket's out-parameters
    /// ([`CallDetails`]) — the call handle, `host`/`method`/`deadline`,
    /// and the full initial-metadata array — then, for a `Registered`
    /// ticket whose method opted into `optional_payload`, also perform the
    /// `RECV_MESSAGE` fetch before posting the completion
    /// (`server.c:1378-1396`). Runs off the server's locks entirely (spawned
    /// by [`Self::publish`]), since awaiting the stream here is exactly the
    /// kind of deferred work `spec.md` §9's `closure_list` exists to run
    /// outside `mu_call`/`mu_global`.
    async fn deliver(&self, ticket: RequestedCall, call: Arc<CallRecord>) {
        let cq = ticket.completion_queue().clone();
        call.stream().bind_completion_queue(cq.clone());

        let details = ticket.details().clone();
        details.set_call(call.clone());
        if let Some(deadline) = call.deadline() {
            details.set_deadline(deadline);
        }
        if let RequestedCall::Batch { .. } = &ticket {
            if let Some(method) = call.path() {
                details.set_method(method.clone());
            }
            if let Some(host) = call.host() {
                details.set_host(host.clone());
            }
        }
        details.set_metadata(call.stream().initial_metadata().await);
        if let RequestedCall::Registered { method, .. } = &ticket {
            if method.optional_payload {
                details.set_payload(call.stream().message().await);
            }
        }

        cq.begin_op();
        cq.end_op(ticket.into_tag(), true);
        tracing::debug!(call_id = %call.id(), "call published");
    }

    /// `grpc_server_request_call`: register an unregistered-catch-all
    /// ticket. Fails synchronously if `cq` was never registered as a
    /// server completion queue.
    #[tracing::instrument(skip(self, cq, tag))]
    pub fn request_call(&self, cq: Arc<dyn CompletionQueue>, tag: Tag) -> Result<Arc<CallDetails>> {
        let details = Arc::new(CallDetails::default());
        let ticket = RequestedCall::Batch {
            cq,
            tag,
            details: details.clone(),
        };
        self.request(&self.inner.unregistered_matcher, ticket)?;
        Ok(details)
    }

    /// `grpc_server_request_registered_call`: register a ticket that can
    /// only be matched against calls routed to `method`. Same `cq`
    /// validation as [`Self::request_call`].
    #[tracing::instrument(skip(self, method, cq, tag), fields(method = %method.method))]
    pub fn request_registered_call(
        &self,
        method: &Arc<RegisteredMethod>,
        cq: Arc<dyn CompletionQueue>,
        tag: Tag,
    ) -> Result<Arc<CallDetails>> {
        let details = Arc::new(CallDetails::default());
        let ticket = RequestedCall::Registered {
            cq,
            tag,
            method: method.clone(),
            details: details.clone(),
        };
        self.request(&method.matcher, ticket)?;
        Ok(details)
    }

    /// `queue_call_request`'s CQ-validation prologue plus the freelist
    /// checkout/pairing common to both request verbs.
    fn request(&self, matcher: &RequestMatcher, ticket: RequestedCall) -> Result<()> {
        let cq = ticket.completion_queue().clone();
        if !cq.is_server_cq() {
            return Err(SwitchboardError::NotServerCompletionQueue);
        }

        let index = match self.inner.tickets.checkout(ticket) {
            Ok(index) => index,
            Err(ticket) => {
                cq.begin_op();
                cq.end_op(ticket.into_tag(), false);
                tracing::warn!("request_call failed: too many outstanding requests");
                return Ok(());
            }
        };
        if let Some(call) = matcher.offer_ticket(index) {
            self.publish(matcher, index, call);
        }
        Ok(())
    }

    /// `grpc_server_shutdown_and_notify`: begin graceful shutdown, posting
    /// `(cq, tag)` once every channel has closed and every listener has
    /// stopped. Safe to call more than once; every caller's tag is posted.
    #[tracing::instrument(skip(self, cq, tag))]
    pub async fn shutdown_and_notify(&self, cq: Arc<dyn CompletionQueue>, tag: Tag) {
        let first_caller = !self.inner.shutdown_called.swap(true, Ordering::AcqRel);
        self.inner.shutdown_waiters.lock().push((cq, tag));

        if first_caller {
            self.kill_outstanding_requests(&self.inner.unregistered_matcher);
            self.inner.unregistered_matcher.zombify_pending();

            let registrations = self.inner.registrations.lock();
            let methods = registrations.methods.clone();
            drop(registrations);
            for method in &methods {
                self.kill_outstanding_requests(&method.matcher);
                method.matcher.zombify_pending();
            }

            let broadcaster = ChannelBroadcaster::snapshot(&self.inner.channels);
            broadcaster.broadcast_goaway("server shutting down", false).await;

            self.inner.listeners.shutdown_all().await;
        }

        self.maybe_finish_shutdown();
        self.inner.shutdown_notify.notified().await;
    }

    /// Fail every outstanding ticket on `matcher` with a not-found
    /// completion (`request_matcher_kill_requests`'s counterpart for
    /// tickets, as opposed to pending calls).
    fn kill_outstanding_requests(&self, matcher: &RequestMatcher) {
        matcher.drain_tickets(|index| {
            let ticket = self.inner.tickets.take(index);
            let cq = ticket.completion_queue().clone();
            cq.begin_op();
            cq.end_op(ticket.into_tag(), false);
        });
    }

    /// `maybe_finish_shutdown`: once every channel has been orphaned and
    /// every listener destroyed, post every waiter's completion.
    fn maybe_finish_shutdown(&self) {
        if !self.inner.shutdown_called.load(Ordering::Acquire) {
            return;
        }
        if self.inner.shutdown_complete.load(Ordering::Acquire) {
            return;
        }
        if !self.inner.channels.is_empty() || !self.inner.listeners.all_destroyed() {
            self.log_shutdown_progress();
            return;
        }
        self.inner.shutdown_complete.store(true, Ordering::Release);
        let waiters = std::mem::take(&mut *self.inner.shutdown_waiters.lock());
        for (cq, tag) in waiters {
            cq.begin_op();
            cq.end_op(tag, true);
        }
        self.inner.shutdown_notify.notify_waiters();
        tracing::info!("server shutdown complete");
    }

    /// Log a "still waiting to shut down" line, throttled to at most once
    /// per `config.shutdown_log_interval` (`maybe_finish_shutdown`'s
    /// progress log in the original).
    fn log_shutdown_progress(&self) {
        let mut last = self.inner.last_shutdown_log.lock();
        let now = Instant::now();
        if last.is_some_and(|t| now.duration_since(t) < self.inner.config.shutdown_log_interval) {
            return;
        }
        *last = Some(now);
        tracing::info!(
            open_channels = self.inner.channels.len(),
            listeners_pending = self.inner.listeners.len() - self.inner.listeners.destroyed_count(),
            "waiting for shutdown to drain"
        );
    }

    /// `grpc_server_cancel_all_calls`: forcibly disconnect every channel
    /// without waiting for a graceful GOAWAY round-trip. Typically used
    /// after `shutdown_and_notify` if a deadline for graceful shutdown
    /// passed.
    pub async fn cancel_all_calls(&self) {
        let broadcaster = ChannelBroadcaster::snapshot(&self.inner.channels);
        broadcaster.disconnect_all().await;
    }

    /// `grpc_server_destroy`: release the server's own resources. Returns
    /// [`SwitchboardError::ShutdownIncomplete`] if shutdown was never
    /// started or hasn't finished draining.
    pub fn destroy(&self) -> Result<()> {
        if !self.inner.shutdown_complete.load(Ordering::Acquire) {
            return Err(SwitchboardError::ShutdownIncomplete);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::{RecordingCompletionQueue, RecordingTransport, TestStream};

    fn config() -> ServerConfig {
        ServerConfig {
            max_requested_calls: 8,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn ticket_then_call_delivers_a_successful_completion() {
        let server = Server::new(config());
        let cq = RecordingCompletionQueue::new();
        server.register_completion_queue(cq.clone()).unwrap();
        server.start().await;

        let details = server.request_call(cq.clone(), Box::new(42i32)).unwrap();

        let channel = server.setup_transport(RecordingTransport::new()).unwrap();
        let stream = TestStream::new();
        server.accept_stream(&channel, stream.clone());
        stream.push_metadata(vec![(":path", "/svc/Method"), (":authority", "api.example.com")]);

        let event = cq.recv().await;
        assert!(event.success);
        assert_eq!(*event.tag.downcast::<i32>().unwrap(), 42);
        assert_eq!(details.method(), Some("/svc/Method"));
        assert_eq!(details.host(), Some("api.example.com"));
        assert!(details.call().is_some());
    }

    #[tokio::test]
    async fn call_then_ticket_delivers_a_successful_completion() {
        let server = Server::new(config());
        let cq = RecordingCompletionQueue::new();
        server.register_completion_queue(cq.clone()).unwrap();
        server.start().await;

        let channel = server.setup_transport(RecordingTransport::new()).unwrap();
        let stream = TestStream::new();
        server.accept_stream(&channel, stream.clone());
        stream.push_metadata(vec![(":path", "/svc/Method")]);
        tokio::task::yield_now().await;

        server.request_call(cq.clone(), Box::new(7i32)).unwrap();

        let event = cq.recv().await;
        assert!(event.success);
        assert_eq!(*event.tag.downcast::<i32>().unwrap(), 7);
    }

    #[tokio::test]
    async fn registered_routing_prefers_exact_host_over_wildcard() {
        let server = Server::new(config());
        let wildcard = server.register_method("/svc/Method", None, false).unwrap();
        let exact = server
            .register_method("/svc/Method", Some("api.example.com"), false)
            .unwrap();
        server.start().await;

        let wildcard_cq = RecordingCompletionQueue::new();
        wildcard_cq.mark_server_cq();
        let exact_cq = RecordingCompletionQueue::new();
        exact_cq.mark_server_cq();
        server
            .request_registered_call(&wildcard, wildcard_cq.clone(), Box::new(1i32))
            .unwrap();
        server
            .request_registered_call(&exact, exact_cq.clone(), Box::new(2i32))
            .unwrap();

        let channel = server.setup_transport(RecordingTransport::new()).unwrap();
        let stream = TestStream::new();
        server.accept_stream(&channel, stream.clone());
        stream.push_metadata(vec![(":path", "/svc/Method"), (":authority", "api.example.com")]);

        let event = exact_cq.recv().await;
        assert!(event.success);
        assert_eq!(*event.tag.downcast::<i32>().unwrap(), 2);
        assert!(
            wildcard_cq.try_recv().is_none(),
            "the wildcard ticket must stay outstanding when an exact-host match exists"
        );
    }

    #[tokio::test]
    async fn falls_back_to_wildcard_when_no_exact_host_is_registered() {
        let server = Server::new(config());
        let wildcard = server.register_method("/svc/Method", None, false).unwrap();
        server.start().await;

        let wildcard_cq = RecordingCompletionQueue::new();
        wildcard_cq.mark_server_cq();
        server
            .request_registered_call(&wildcard, wildcard_cq.clone(), Box::new(5i32))
            .unwrap();

        let channel = server.setup_transport(RecordingTransport::new()).unwrap();
        let stream = TestStream::new();
        server.accept_stream(&channel, stream.clone());
        stream.push_metadata(vec![(":path", "/svc/Method"), (":authority", "unregistered-host")]);

        let event = wildcard_cq.recv().await;
        assert!(event.success);
        assert_eq!(*event.tag.downcast::<i32>().unwrap(), 5);
    }

    /// Parameterized over a handful of pool sizes (mirroring
    /// `batcher/src/storage/tests.rs`'s `#[rstest]` fixture style): whatever
    /// the capacity, exactly the first `capacity` tickets stay outstanding
    /// and every ticket past it fails immediately with an empty completion.
    #[rstest::rstest]
    #[case(1)]
    #[case(2)]
    #[case(4)]
    #[tokio::test]
    async fn capacity_backpressure_fails_requests_past_the_pool_size(#[case] capacity: usize) {
        let server = Server::new(ServerConfig {
            max_requested_calls: capacity,
            ..ServerConfig::default()
        });
        server.start().await;

        let mut outstanding = Vec::new();
        for i in 0..capacity {
            let cq = RecordingCompletionQueue::new();
            cq.mark_server_cq();
            server.request_call(cq.clone(), Box::new(i as i32)).unwrap();
            outstanding.push(cq);
        }
        for cq in &outstanding {
            assert!(cq.try_recv().is_none(), "ticket within capacity should stay outstanding");
        }

        let overflow = RecordingCompletionQueue::new();
        overflow.mark_server_cq();
        server.request_call(overflow.clone(), Box::new(-1i32)).unwrap();
        let event = overflow.recv().await;
        assert!(!event.success, "pool was at capacity; overflow request must fail fast");
        assert_eq!(*event.tag.downcast::<i32>().unwrap(), -1);
    }

    #[tokio::test]
    async fn shutdown_drains_pending_calls_as_zombies() {
        let server = Server::new(config());
        server.start().await;

        // A call arrives on a channel that was never registered with the
        // server (no `setup_transport`), so it queues in the unregistered
        // matcher without anything holding up `maybe_finish_shutdown`'s
        // "no open channels" check.
        let channel = ChannelRecord::new(RecordingTransport::new());
        let stream = TestStream::new();
        server.accept_stream(&channel, stream.clone());
        stream.push_metadata(vec![(":path", "/svc/Method")]);
        tokio::task::yield_now().await;

        let shutdown_cq = RecordingCompletionQueue::new();
        server.shutdown_and_notify(shutdown_cq.clone(), Box::new(())).await;

        let event = shutdown_cq.recv().await;
        assert!(event.success);
        assert!(server.destroy().is_ok());
    }

    #[tokio::test]
    async fn stream_closed_before_metadata_is_zombied_without_a_matcher() {
        let server = Server::new(config());
        server.start().await;

        let channel = server.setup_transport(RecordingTransport::new()).unwrap();
        let stream = TestStream::new();
        server.accept_stream(&channel, stream.clone());
        stream.close();
        tokio::task::yield_now().await;

        // No ticket was ever requested and the stream closed before
        // metadata arrived; the call should have been killed directly
        // without ever touching the unregistered matcher, so a later
        // request_call must not spuriously pair with it.
        let cq = RecordingCompletionQueue::new();
        cq.mark_server_cq();
        server.request_call(cq.clone(), Box::new(1i32)).unwrap();
        assert!(cq.try_recv().is_none());
    }

    #[tokio::test]
    async fn request_call_on_an_unmarked_completion_queue_fails_synchronously() {
        let server = Server::new(config());
        server.start().await;

        let cq = RecordingCompletionQueue::new();
        let err = server.request_call(cq, Box::new(())).unwrap_err();
        assert!(matches!(err, SwitchboardError::NotServerCompletionQueue));
    }

    #[tokio::test]
    async fn registered_call_with_optional_payload_populates_the_message() {
        let server = Server::new(config());
        let method = server.register_method("/svc/Method", None, true).unwrap();
        server.start().await;

        let cq = RecordingCompletionQueue::new();
        cq.mark_server_cq();
        let details = server.request_registered_call(&method, cq.clone(), Box::new(9i32)).unwrap();

        let channel = server.setup_transport(RecordingTransport::new()).unwrap();
        let stream = TestStream::new();
        stream.push_message(bytes::Bytes::from_static(b"payload"));
        server.accept_stream(&channel, stream.clone());
        stream.push_metadata(vec![(":path", "/svc/Method")]);

        let event = cq.recv().await;
        assert!(event.success);
        assert_eq!(details.payload().map(|b| b.as_ref()), Some(&b"payload"[..]));
    }

    #[tokio::test]
    async fn setup_transport_binds_every_registered_completion_queue() {
        let server = Server::new(config());
        let cq = RecordingCompletionQueue::new();
        server.register_completion_queue(cq.clone()).unwrap();
        server.start().await;

        let transport = RecordingTransport::new();
        server.setup_transport(transport.clone()).unwrap();
        assert!(transport.events().iter().any(|e| e == "bind_pollset"));
    }
}
