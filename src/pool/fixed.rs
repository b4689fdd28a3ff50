use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::codec::{
    ConnectionEvent, CreateConnectionData, RequestEncoder as _, ResponseDecoder,
    StreamResetReason,
};
use crate::dispatcher::Dispatcher;
use crate::error::PoolFailure;
use crate::upstream::{
    ClusterConnectivityState, Host, RandomGenerator, ResourcePriority, SocketOptions,
    TransportSocketOptions,
};

use super::{
    ClientFactory, ClientId, ConnectionEventSink, ConnectionEvents, PoolClient, PoolRef,
    StreamRequest, UpstreamPool,
};

type Encoder<F> = <<F as ClientFactory>::Client as PoolClient>::Encoder;
type DrainedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Shared environment a pool is allocated in.
#[derive(Debug, Clone)]
pub struct PoolContext {
    /// Dispatcher which owns the pool and its connections.
    pub dispatcher: Dispatcher,

    /// Randomness source handed to codecs.
    pub random: Arc<dyn RandomGenerator>,

    /// The upstream host.
    pub host: Arc<Host>,

    /// Priority class of the pool.
    pub priority: ResourcePriority,

    /// Socket options for new connections.
    pub socket_options: SocketOptions,

    /// Transport options for new connections.
    pub transport_options: TransportSocketOptions,

    /// Connectivity counters shared across pools of the cluster.
    pub state: Arc<ClusterConnectivityState>,
}

/// A pool with a fixed protocol and a fixed cap on open connections.
///
/// Streams are attached to ready connections in FIFO order. When no connection is ready,
/// the stream waits and, capacity permitting, a new connection is opened for it.
///
/// The pool never locks a connection while holding its own lock, so connections are
/// free to call back into the pool from their own callbacks.
pub struct FixedPool<F: ClientFactory> {
    shared: Arc<PoolShared<F>>,
}

impl<F: ClientFactory> fmt::Debug for FixedPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("FixedPool")
            .field("host", &self.shared.context.host)
            .field("clients", &inner.clients.len())
            .field("ready", &inner.ready.len())
            .field("pending", &inner.pending.len())
            .finish()
    }
}

struct PoolShared<F: ClientFactory> {
    context: PoolContext,
    protocols: Vec<http::Version>,
    max_connections: usize,
    factory: F,
    this: Weak<PoolShared<F>>,
    inner: Mutex<PoolInner<F::Client>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Connecting,
    Ready,
    Busy,
    /// Busy, close as soon as the current stream ends.
    Draining,
    /// Close requested, waiting for the close event.
    Closing,
}

struct Entry<A> {
    client: A,
    state: ClientState,
}

struct Pending<E> {
    decoder: Box<dyn ResponseDecoder>,
    tx: oneshot::Sender<Result<E, PoolFailure>>,
}

struct PoolInner<A: PoolClient> {
    clients: HashMap<ClientId, Entry<A>>,
    ready: VecDeque<ClientId>,
    pending: VecDeque<Pending<A::Encoder>>,
    drained_callbacks: Vec<DrainedCallback>,
    draining: bool,
}

impl<A: PoolClient> PoolInner<A> {
    fn new() -> Self {
        Self {
            clients: HashMap::new(),
            ready: VecDeque::new(),
            pending: VecDeque::new(),
            drained_callbacks: Vec::new(),
            draining: false,
        }
    }

    fn count(&self, state: ClientState) -> usize {
        self.clients.values().filter(|e| e.state == state).count()
    }

    fn pop_ready(&mut self) -> Option<(ClientId, A)> {
        while let Some(id) = self.ready.pop_front() {
            if let Some(entry) = self.clients.get_mut(&id) {
                if entry.state == ClientState::Ready {
                    entry.state = ClientState::Busy;
                    return Some((id, entry.client.clone()));
                }
            }
        }
        None
    }

    fn pop_pending(&mut self, state: &ClusterConnectivityState) -> Option<Pending<A::Encoder>> {
        while let Some(pending) = self.pending.pop_front() {
            state.decr_pending_streams(1);
            if pending.tx.is_closed() {
                trace!("skipping cancelled stream");
                continue;
            }
            return Some(pending);
        }
        None
    }

    /// Mark every ready client as closing, returning them for the caller to close.
    fn take_idle(&mut self) -> Vec<A> {
        let mut idle = Vec::new();
        for id in self.ready.drain(..) {
            if let Some(entry) = self.clients.get_mut(&id) {
                if entry.state == ClientState::Ready {
                    entry.state = ClientState::Closing;
                    idle.push(entry.client.clone());
                }
            }
        }
        idle
    }
}

impl<F: ClientFactory> FixedPool<F> {
    /// Create a pool for `protocols`, building connections with `factory`.
    pub fn new(context: PoolContext, factory: F, protocols: Vec<http::Version>) -> Self {
        let max_connections = context.host.cluster().max_connections();
        let shared = Arc::new_cyclic(|this| PoolShared {
            context,
            protocols,
            max_connections,
            factory,
            this: this.clone(),
            inner: Mutex::new(PoolInner::new()),
        });
        Self { shared }
    }

    /// The upstream host.
    pub fn host(&self) -> &Arc<Host> {
        &self.shared.context.host
    }

    /// Priority class of this pool.
    pub fn priority(&self) -> ResourcePriority {
        self.shared.context.priority
    }

    /// Protocols spoken by connections in this pool.
    pub fn protocols(&self) -> &[http::Version] {
        &self.shared.protocols
    }

    /// The dispatcher this pool runs on.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.context.dispatcher
    }

    /// Maximum number of open connections.
    pub fn max_connections(&self) -> usize {
        self.shared.max_connections
    }

    /// Open connections, in any state.
    pub fn num_connections(&self) -> usize {
        self.shared.inner.lock().clients.len()
    }

    /// Connections idle and ready for a stream.
    pub fn num_ready(&self) -> usize {
        self.shared.inner.lock().count(ClientState::Ready)
    }

    /// Streams waiting for a connection.
    pub fn num_pending(&self) -> usize {
        self.shared.inner.lock().pending.len()
    }

    /// Whether any stream is attached to a connection or waiting for one.
    pub fn has_active_connections(&self) -> bool {
        let inner = self.shared.inner.lock();
        !inner.pending.is_empty()
            || inner
                .clients
                .values()
                .any(|e| matches!(e.state, ClientState::Busy | ClientState::Draining))
    }

    /// Request a stream. The stream is attached right away if a connection is ready.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(host = %self.shared.context.host), level = "debug"))]
    pub fn new_stream(&self, decoder: Box<dyn ResponseDecoder>) -> StreamRequest<Encoder<F>> {
        self.shared.new_stream(decoder)
    }

    /// Close idle connections now and busy ones once their stream ends.
    ///
    /// New streams still open new connections.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, level = "debug"))]
    pub fn drain_connections(&self) {
        self.shared.drain_connections();
    }

    /// Stop accepting streams, and call `callback` once every connection is gone.
    pub fn add_drained_callback<C>(&self, callback: C)
    where
        C: FnOnce() + Send + 'static,
    {
        {
            let mut inner = self.shared.inner.lock();
            inner.draining = true;
            inner.drained_callbacks.push(Box::new(callback));
        }
        self.shared.check_for_drained();
    }

    /// Feed a connection event for `client`, as a codec would through [`ConnectionEvents`].
    pub fn on_connection_event(&self, client: ClientId, event: ConnectionEvent) {
        self.shared.on_connection_event(client, event);
    }

    /// A weak handle to this pool, as handed to its connections.
    pub fn pool_ref(&self) -> PoolRef {
        self.shared.pool_ref()
    }
}

impl<F: ClientFactory> PoolShared<F> {
    fn pool_ref(&self) -> PoolRef {
        let this = self.this.clone();
        let weak: Weak<dyn UpstreamPool> = this;
        PoolRef::from_weak(weak)
    }

    fn events(&self, client: ClientId) -> ConnectionEvents {
        let this = self.this.clone();
        let weak: Weak<dyn ConnectionEventSink> = this;
        ConnectionEvents::new(weak, client)
    }

    fn stats(&self) -> &crate::upstream::ClusterStats {
        self.context.host.cluster().stats()
    }

    fn new_stream(&self, decoder: Box<dyn ResponseDecoder>) -> StreamRequest<Encoder<F>> {
        let (tx, rx) = oneshot::channel();

        {
            let mut inner = self.inner.lock();
            if inner.draining {
                debug!("pool is draining, rejecting stream");
                let _ = tx.send(Err(PoolFailure::Drained));
                return StreamRequest::new(rx);
            }

            if inner.count(ClientState::Ready) == 0 {
                trace!("no ready connection, stream will wait");
                self.stats().upstream_rq_pending_total.inc();
            }

            inner.pending.push_back(Pending { decoder, tx });
            self.context.state.incr_pending_streams(1);
        }

        self.attach_pending();
        self.try_create_new_connections();
        StreamRequest::new(rx)
    }

    /// Pair waiting streams with ready connections until one of them runs out.
    fn attach_pending(&self) {
        loop {
            let (id, client, pending) = {
                let mut inner = self.inner.lock();
                if inner.pending.is_empty() || inner.ready.is_empty() {
                    return;
                }

                let Some(pending) = inner.pop_pending(&self.context.state) else {
                    return;
                };

                let Some((id, client)) = inner.pop_ready() else {
                    inner.pending.push_front(pending);
                    self.context.state.incr_pending_streams(1);
                    return;
                };

                (id, client, pending)
            };

            trace!(client = %id, "attaching stream");
            self.stats().upstream_rq_total.inc();
            self.stats().upstream_rq_active.inc();
            self.context.state.incr_active_streams(1);

            let encoder = client.new_stream_encoder(pending.decoder);
            if let Err(Ok(mut encoder)) = pending.tx.send(Ok(encoder)) {
                debug!(client = %id, "stream cancelled while attaching, resetting");
                encoder.reset_stream(StreamResetReason::LocalReset);
            }
        }
    }

    fn try_create_new_connections(&self) {
        let to_create = {
            let inner = self.inner.lock();
            if inner.draining {
                return;
            }
            let connecting = inner.count(ClientState::Connecting);
            let wanted = inner.pending.len().saturating_sub(connecting);
            let room = self.max_connections.saturating_sub(inner.clients.len());
            wanted.min(room)
        };

        for _ in 0..to_create {
            let id = ClientId::next();
            let data = CreateConnectionData {
                host: self.context.host.clone(),
                dispatcher: self.context.dispatcher.clone(),
                socket_options: self.context.socket_options.clone(),
                transport_options: self.context.transport_options.clone(),
                connect_timeout: self.context.host.cluster().connect_timeout(),
                random: self.context.random.clone(),
                events: self.events(id),
            };

            debug!(client = %id, host = %self.context.host, "creating connection");
            let client = self.factory.create_client(id, self.pool_ref(), data);
            debug_assert_eq!(client.concurrent_stream_limit(), 1);
            self.stats().upstream_cx_total.inc();

            self.inner.lock().clients.insert(
                id,
                Entry {
                    client,
                    state: ClientState::Connecting,
                },
            );
        }
    }

    fn drain_connections(&self) {
        let idle = {
            let mut inner = self.inner.lock();
            for entry in inner.clients.values_mut() {
                if entry.state == ClientState::Busy {
                    entry.state = ClientState::Draining;
                }
            }
            inner.take_idle()
        };

        for client in idle {
            debug!(client = %client.id(), "closing idle connection for drain");
            client.close();
        }
    }

    fn fail_pending(&self, failure: PoolFailure) {
        let pending: Vec<_> = {
            let mut inner = self.inner.lock();
            let n = inner.pending.len();
            self.context.state.decr_pending_streams(n as i64);
            inner.pending.drain(..).collect()
        };

        for stream in pending {
            self.stats().upstream_rq_pending_failure_eject.inc();
            let _ = stream.tx.send(Err(failure.clone()));
        }
    }
}

impl<F: ClientFactory> UpstreamPool for PoolShared<F> {
    fn dispatcher(&self) -> &Dispatcher {
        &self.context.dispatcher
    }

    fn host(&self) -> &Arc<Host> {
        &self.context.host
    }

    fn check_for_drained(&self) {
        let (idle, callbacks) = {
            let mut inner = self.inner.lock();
            if !inner.draining {
                return;
            }

            let idle = inner.take_idle();
            let callbacks = if inner.pending.is_empty() && inner.clients.is_empty() {
                std::mem::take(&mut inner.drained_callbacks)
            } else {
                Vec::new()
            };
            (idle, callbacks)
        };

        for client in idle {
            debug!(client = %client.id(), "closing idle connection, pool is draining");
            client.close();
        }

        if !callbacks.is_empty() {
            debug!("pool drained");
        }
        for callback in callbacks {
            callback();
        }
    }

    fn on_stream_closed(&self, id: ClientId, delay_attach: bool) {
        let client = {
            let inner = self.inner.lock();
            match inner.clients.get(&id) {
                Some(entry) if matches!(entry.state, ClientState::Busy | ClientState::Draining) => {
                    entry.client.clone()
                }
                _ => {
                    trace!(client = %id, "stream closed on connection no longer in use");
                    return;
                }
            }
        };

        let exhausted = !client.has_remaining_streams();

        self.stats().upstream_rq_active.dec();
        self.context.state.decr_active_streams(1);

        let close = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.clients.get_mut(&id) else {
                return;
            };

            if entry.state == ClientState::Draining || exhausted {
                entry.state = ClientState::Closing;
                true
            } else {
                entry.state = ClientState::Ready;
                inner.ready.push_back(id);
                false
            }
        };

        if close {
            if exhausted {
                self.stats().upstream_cx_max_requests.inc();
            }
            debug!(client = %id, exhausted, "closing connection after stream");
            client.close();
        } else if !delay_attach {
            self.attach_pending();
        } else {
            trace!(client = %id, "connection ready, attach deferred");
        }
    }

    fn on_upstream_ready(&self) {
        self.attach_pending();
    }
}

impl<F: ClientFactory> ConnectionEventSink for PoolShared<F> {
    fn on_connection_event(&self, id: ClientId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                {
                    let mut inner = self.inner.lock();
                    let Some(entry) = inner.clients.get_mut(&id) else {
                        return;
                    };
                    if entry.state != ClientState::Connecting {
                        return;
                    }
                    entry.state = ClientState::Ready;
                    inner.ready.push_back(id);
                }
                debug!(client = %id, "connection established");
                self.attach_pending();
                self.check_for_drained();
            }
            ConnectionEvent::RemoteClose | ConnectionEvent::LocalClose => {
                let Some(entry) = ({
                    let mut inner = self.inner.lock();
                    inner.ready.retain(|ready| *ready != id);
                    inner.clients.remove(&id)
                }) else {
                    return;
                };

                debug!(client = %id, ?event, state = ?entry.state, "connection closed");

                if matches!(entry.state, ClientState::Busy | ClientState::Draining) {
                    self.stats().upstream_rq_active.dec();
                    self.context.state.decr_active_streams(1);
                }

                if entry.client.closing_with_incomplete_stream() {
                    self.stats().upstream_cx_destroy_with_active_rq.inc();
                }

                entry.client.dispose();

                if entry.state == ClientState::Connecting {
                    self.stats().upstream_cx_connect_fail.inc();
                    self.fail_pending(PoolFailure::ConnectionFailure);
                } else {
                    self.try_create_new_connections();
                }

                self.check_for_drained();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::mock::{test_context, MockClientEncoder, MockClientFactory, RecordingDecoder};

    use static_assertions::assert_impl_all;

    assert_impl_all!(FixedPool<MockClientFactory>: Send, Sync);

    fn pool(max_connections: usize) -> FixedPool<MockClientFactory> {
        let context = test_context(max_connections, 0);
        FixedPool::new(context, MockClientFactory::default(), vec![http::Version::HTTP_11])
    }

    #[test]
    fn new_stream_opens_connection() {
        let _ = tracing_subscriber::fmt::try_init();

        let pool = pool(4);
        let mut request = pool.new_stream(RecordingDecoder::boxed().0);

        assert!(request.try_ready().is_none());
        assert_eq!(pool.num_connections(), 1);
        assert_eq!(pool.num_pending(), 1);
        assert_eq!(pool.host().cluster().stats().upstream_cx_total.value(), 1);
        assert_eq!(
            pool.host().cluster().stats().upstream_rq_pending_total.value(),
            1
        );
    }

    #[test]
    fn connected_attaches_pending() {
        let _ = tracing_subscriber::fmt::try_init();

        let pool = pool(4);
        let mut request = pool.new_stream(RecordingDecoder::boxed().0);
        let client = pool.shared.inner.lock().clients.keys().copied().next().unwrap();

        pool.on_connection_event(client, ConnectionEvent::Connected);

        let encoder = request.try_ready().unwrap().unwrap();
        assert_eq!(encoder.client(), client);
        assert_eq!(pool.num_pending(), 0);
        assert!(pool.has_active_connections());
        assert_eq!(pool.host().cluster().stats().upstream_rq_active.value(), 1);
    }

    #[test]
    fn respects_connection_cap() {
        let pool = pool(1);
        let _a = pool.new_stream(RecordingDecoder::boxed().0);
        let _b = pool.new_stream(RecordingDecoder::boxed().0);
        assert_eq!(pool.num_connections(), 1);
        assert_eq!(pool.num_pending(), 2);
    }

    #[test]
    fn stream_closed_returns_client_to_ready() {
        let pool = pool(1);
        let mut first = pool.new_stream(RecordingDecoder::boxed().0);
        let id = pool.shared.inner.lock().clients.keys().copied().next().unwrap();
        pool.on_connection_event(id, ConnectionEvent::Connected);
        assert!(first.try_ready().unwrap().is_ok());

        let mut second = pool.new_stream(RecordingDecoder::boxed().0);
        assert!(second.try_ready().is_none());

        // Deferred: nothing attaches inside the call.
        pool.shared.on_stream_closed(id, true);
        assert!(second.try_ready().is_none());
        assert_eq!(pool.num_ready(), 1);

        pool.shared.on_upstream_ready();
        assert!(second.try_ready().unwrap().is_ok());
        assert_eq!(pool.num_ready(), 0);
    }

    #[test]
    fn stream_closed_without_delay_attaches() {
        let pool = pool(1);
        let mut first = pool.new_stream(RecordingDecoder::boxed().0);
        let id = pool.shared.inner.lock().clients.keys().copied().next().unwrap();
        pool.on_connection_event(id, ConnectionEvent::Connected);
        assert!(first.try_ready().unwrap().is_ok());

        let mut second = pool.new_stream(RecordingDecoder::boxed().0);
        pool.shared.on_stream_closed(id, false);
        assert!(second.try_ready().unwrap().is_ok());
    }

    #[test]
    fn cancelled_stream_skipped() {
        let pool = pool(1);
        let cancelled = pool.new_stream(RecordingDecoder::boxed().0);
        let mut kept = pool.new_stream(RecordingDecoder::boxed().0);
        drop(cancelled);

        let id = pool.shared.inner.lock().clients.keys().copied().next().unwrap();
        pool.on_connection_event(id, ConnectionEvent::Connected);

        assert!(kept.try_ready().unwrap().is_ok());
        assert_eq!(pool.num_pending(), 0);

        let state = &pool.shared.context.state;
        assert_eq!(state.pending_streams(), 0);
        assert_eq!(state.active_streams(), 1);
    }

    #[test]
    fn stream_cancelled_while_attaching_is_reset() {
        let _ = tracing_subscriber::fmt::try_init();

        let cancel: Arc<Mutex<Option<StreamRequest<MockClientEncoder>>>> = Arc::default();
        let hook = cancel.clone();
        let factory = MockClientFactory::default().on_attach(move || {
            hook.lock().take();
        });
        let pool = FixedPool::new(
            test_context(1, 0),
            factory.clone(),
            vec![http::Version::HTTP_11],
        );

        let request = pool.new_stream(RecordingDecoder::boxed().0);
        *cancel.lock() = Some(request);

        let id = pool.shared.inner.lock().clients.keys().copied().next().unwrap();
        pool.on_connection_event(id, ConnectionEvent::Connected);

        assert!(cancel.lock().is_none());
        let clients = factory.clients();
        assert_eq!(clients[0].resets(), vec![StreamResetReason::LocalReset]);

        let state = &pool.shared.context.state;
        assert_eq!(state.pending_streams(), 0);
        assert_eq!(state.active_streams(), 1);

        pool.on_connection_event(id, ConnectionEvent::LocalClose);
        assert_eq!(state.active_streams(), 0);
        assert_eq!(pool.host().cluster().stats().upstream_rq_active.value(), 0);
        assert_eq!(pool.num_connections(), 0);
    }

    #[test]
    fn exhausted_client_closed_after_stream() {
        let factory = MockClientFactory::default().with_max_streams(1);
        let pool = FixedPool::new(
            test_context(1, 0),
            factory.clone(),
            vec![http::Version::HTTP_11],
        );
        let mut request = pool.new_stream(RecordingDecoder::boxed().0);
        let id = pool.shared.inner.lock().clients.keys().copied().next().unwrap();
        pool.on_connection_event(id, ConnectionEvent::Connected);
        assert!(request.try_ready().unwrap().is_ok());

        pool.shared.on_stream_closed(id, true);

        let clients = factory.clients();
        assert_eq!(clients.len(), 1);
        assert!(clients[0].is_closed());
        assert_eq!(pool.num_ready(), 0);
        let stats = pool.host().cluster().stats();
        assert_eq!(stats.upstream_cx_max_requests.value(), 1);
        assert_eq!(stats.upstream_rq_active.value(), 0);
    }

    #[test]
    fn connect_failure_fails_pending() {
        let pool = pool(1);
        let mut request = pool.new_stream(RecordingDecoder::boxed().0);
        let id = pool.shared.inner.lock().clients.keys().copied().next().unwrap();

        pool.on_connection_event(id, ConnectionEvent::RemoteClose);

        assert!(matches!(
            request.try_ready(),
            Some(Err(PoolFailure::ConnectionFailure))
        ));
        assert_eq!(pool.num_connections(), 0);
        let stats = pool.host().cluster().stats();
        assert_eq!(stats.upstream_cx_connect_fail.value(), 1);
        assert_eq!(stats.upstream_rq_pending_failure_eject.value(), 1);

        let state = &pool.shared.context.state;
        assert_eq!(state.pending_streams(), 0);
        assert_eq!(state.active_streams(), 0);
    }

    #[test]
    fn drain_closes_idle_and_fires_callback() {
        let _ = tracing_subscriber::fmt::try_init();

        let pool = pool(2);
        let mut request = pool.new_stream(RecordingDecoder::boxed().0);
        let id = pool.shared.inner.lock().clients.keys().copied().next().unwrap();
        pool.on_connection_event(id, ConnectionEvent::Connected);
        let encoder = request.try_ready().unwrap().unwrap();

        let drained = Arc::new(AtomicBool::new(false));
        let flag = drained.clone();
        pool.add_drained_callback(move || flag.store(true, Ordering::SeqCst));

        // Busy connection keeps the pool alive.
        assert!(!drained.load(Ordering::SeqCst));
        let mut rejected = pool.new_stream(RecordingDecoder::boxed().0);
        assert!(matches!(rejected.try_ready(), Some(Err(PoolFailure::Drained))));

        pool.shared.on_stream_closed(id, true);
        pool.shared.check_for_drained();
        assert!(encoder.is_closed(), "idle connection closed while draining");

        pool.on_connection_event(id, ConnectionEvent::LocalClose);
        assert!(drained.load(Ordering::SeqCst));
        assert_eq!(pool.num_connections(), 0);
    }

    #[test]
    fn drain_connections_closes_busy_after_stream() {
        let pool = pool(1);
        let mut request = pool.new_stream(RecordingDecoder::boxed().0);
        let id = pool.shared.inner.lock().clients.keys().copied().next().unwrap();
        pool.on_connection_event(id, ConnectionEvent::Connected);
        let encoder = request.try_ready().unwrap().unwrap();

        pool.drain_connections();
        assert!(!encoder.is_closed());

        pool.shared.on_stream_closed(id, true);
        assert!(encoder.is_closed());
        assert_eq!(pool.num_ready(), 0);
    }

    #[test]
    fn close_while_busy_counts_incomplete() {
        let pool = pool(1);
        let mut request = pool.new_stream(RecordingDecoder::boxed().0);
        let id = pool.shared.inner.lock().clients.keys().copied().next().unwrap();
        pool.on_connection_event(id, ConnectionEvent::Connected);
        let encoder = request.try_ready().unwrap().unwrap();
        encoder.set_incomplete(true);

        pool.on_connection_event(id, ConnectionEvent::RemoteClose);

        let stats = pool.host().cluster().stats();
        assert_eq!(stats.upstream_cx_destroy_with_active_rq.value(), 1);
        assert_eq!(stats.upstream_rq_active.value(), 0);
        assert_eq!(encoder.disposed(), 1);
    }

    #[test]
    fn dropped_pool_closes_requests() {
        let pool = pool(1);
        let mut request = pool.new_stream(RecordingDecoder::boxed().0);
        drop(pool);
        assert!(matches!(request.try_ready(), Some(Err(PoolFailure::PoolClosed))));
    }
}
