//! Connection pooling for upstream hosts.
//!
//! The `pool` module separates the generic pool bookkeeping (which connections are
//! connecting, ready or busy, which streams are waiting, when the pool is drained) from
//! the protocol-specific connection types which plug into it. A connection type implements
//! [`PoolClient`], and a [`ClientFactory`] builds it; the [`FixedPool`] does the rest.
//!
//! Connections talk back to their pool through the [`UpstreamPool`] trait. The pool is only
//! ever referenced weakly from a connection ([`PoolRef`]), so connections never keep a
//! pool alive on their own.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::codec::{ConnectionEvent, CreateConnectionData, RequestEncoder, ResponseDecoder};
use crate::dispatcher::Dispatcher;
use crate::error::PoolFailure;
use crate::upstream::Host;

mod fixed;
mod weakopt;

pub use self::fixed::{FixedPool, PoolContext};
pub(crate) use self::weakopt::WeakOpt;

static IDENT: AtomicU64 = AtomicU64::new(1);

/// Identity of one upstream connection within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocate a fresh identifier.
    pub fn next() -> Self {
        Self(IDENT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cx-{}", self.0)
    }
}

/// The pool interface consumed by connections.
///
/// Every method may be called from within a codec callback. None of them may
/// synchronously call back into the connection which invoked them while that
/// connection is still unwinding; work which needs the connection again is posted
/// to the [`Dispatcher`].
pub trait UpstreamPool: Send + Sync + 'static {
    /// Dispatcher which owns this pool and its connections.
    fn dispatcher(&self) -> &Dispatcher;

    /// Upstream host this pool connects to.
    fn host(&self) -> &Arc<Host>;

    /// Re-evaluate whether idle connections should be torn down because the pool is draining.
    fn check_for_drained(&self);

    /// An exchange on `client` ended.
    ///
    /// With `delay_attach`, the pool must not attach new work to `client` in this call; it
    /// will learn about the capacity on a later turn.
    fn on_stream_closed(&self, client: ClientId, delay_attach: bool);

    /// Capacity became available; attach waiting streams.
    fn on_upstream_ready(&self);
}

/// Weak handle from a connection back to its pool.
#[derive(Clone)]
pub struct PoolRef {
    inner: WeakOpt<dyn UpstreamPool>,
}

impl fmt::Debug for PoolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PoolRef").field(&self.inner).finish()
    }
}

impl PoolRef {
    /// A reference to no pool at all. Notifications are dropped.
    pub fn none() -> Self {
        Self {
            inner: WeakOpt::none(),
        }
    }

    /// Reference `pool` without keeping it alive.
    pub fn downgrade<P: UpstreamPool>(pool: &Arc<P>) -> Self {
        let weak = Arc::downgrade(pool);
        let weak: Weak<dyn UpstreamPool> = weak;
        Self::from_weak(weak)
    }

    pub(crate) fn from_weak(weak: Weak<dyn UpstreamPool>) -> Self {
        Self {
            inner: WeakOpt::from_weak(weak),
        }
    }

    /// The pool, if it is still alive.
    pub fn upgrade(&self) -> Option<Arc<dyn UpstreamPool>> {
        self.inner.upgrade()
    }

    /// Post a "capacity available" signal for the next dispatcher turn.
    pub(crate) fn schedule_upstream_ready(&self) {
        let Some(pool) = self.upgrade() else {
            return;
        };

        let target = self.clone();
        pool.dispatcher().post(move || {
            if let Some(pool) = target.upgrade() {
                pool.on_upstream_ready();
            }
        });
    }
}

pub(crate) trait ConnectionEventSink: Send + Sync + 'static {
    fn on_connection_event(&self, client: ClientId, event: ConnectionEvent);
}

/// Handle through which a codec reports connect and close events for its connection.
///
/// Events must be raised from a dispatcher turn (or the task driving I/O), never from
/// within a call the pool or connection made into the codec.
#[derive(Clone)]
pub struct ConnectionEvents {
    sink: WeakOpt<dyn ConnectionEventSink>,
    client: ClientId,
}

impl fmt::Debug for ConnectionEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEvents")
            .field("client", &self.client)
            .field("sink", &self.sink)
            .finish()
    }
}

impl ConnectionEvents {
    pub(crate) fn new(sink: Weak<dyn ConnectionEventSink>, client: ClientId) -> Self {
        Self {
            sink: WeakOpt::from_weak(sink),
            client,
        }
    }

    /// Events which go nowhere, for connections outside of a pool.
    pub fn detached(client: ClientId) -> Self {
        Self {
            sink: WeakOpt::none(),
            client,
        }
    }

    /// The connection these events belong to.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Report `event` to the pool, if it is still alive.
    pub fn raise(&self, event: ConnectionEvent) {
        tracing::trace!(client = %self.client, ?event, "connection event");
        if let Some(sink) = self.sink.upgrade() {
            sink.on_connection_event(self.client, event);
        }
    }
}

/// A connection type which can be managed by a pool.
///
/// Implementations are cheap handles; the pool clones them freely. None of these
/// methods may call back into the pool synchronously, except [`PoolClient::dispose`].
pub trait PoolClient: Clone + Send + Sync + 'static {
    /// Encoder handed to the caller once a stream is attached.
    type Encoder: RequestEncoder;

    /// Identity of this connection.
    fn id(&self) -> ClientId;

    /// Start a new stream on this connection.
    fn new_stream_encoder(&self, decoder: Box<dyn ResponseDecoder>) -> Self::Encoder;

    /// Whether tearing down now would abandon a response mid-flight.
    fn closing_with_incomplete_stream(&self) -> bool;

    /// Streams this connection can carry at once.
    fn concurrent_stream_limit(&self) -> u32;

    /// Whether the connection may carry another stream over its lifetime.
    fn has_remaining_streams(&self) -> bool;

    /// Close the connection.
    fn close(&self);

    /// Release any stream still attached, notifying the pool exactly once for it.
    fn dispose(&self);
}

/// Builds connections for a pool.
pub trait ClientFactory: Send + Sync + 'static {
    /// The connection type built.
    type Client: PoolClient;

    /// Open a new connection identified by `id`.
    fn create_client(&self, id: ClientId, pool: PoolRef, data: CreateConnectionData)
        -> Self::Client;
}

/// A stream waiting to be attached to a connection.
///
/// Resolves to the request encoder once a connection is available. Dropping the
/// request before it resolves cancels it.
#[must_use = "dropping a stream request cancels it"]
pub struct StreamRequest<E> {
    rx: oneshot::Receiver<Result<E, PoolFailure>>,
}

impl<E> fmt::Debug for StreamRequest<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRequest").finish()
    }
}

impl<E> StreamRequest<E> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<E, PoolFailure>>) -> Self {
        Self { rx }
    }

    /// Check whether the stream has been attached (or failed) without waiting.
    pub fn try_ready(&mut self) -> Option<Result<E, PoolFailure>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(PoolFailure::PoolClosed)),
        }
    }
}

impl<E> Future for StreamRequest<E> {
    type Output = Result<E, PoolFailure>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolFailure::PoolClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(PoolRef: Send, Sync, Clone);
    assert_impl_all!(ConnectionEvents: Send, Sync, Clone);
    assert_impl_all!(StreamRequest<()>: Send, Future);
    static_assertions::assert_obj_safe!(UpstreamPool);

    #[test]
    fn client_ids_are_unique() {
        let a = ClientId::next();
        let b = ClientId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("cx-"));
    }

    #[test]
    fn detached_pool_ref() {
        let pool = PoolRef::none();
        assert!(pool.upgrade().is_none());
        // No pool, nothing to schedule on.
        pool.schedule_upstream_ready();
    }

    #[test]
    fn detached_events_are_dropped() {
        let id = ClientId::next();
        let events = ConnectionEvents::detached(id);
        assert_eq!(events.client(), id);
        events.raise(ConnectionEvent::RemoteClose);
    }

    #[test]
    fn stream_request_closed() {
        let (tx, rx) = oneshot::channel::<Result<(), PoolFailure>>();
        let mut request = StreamRequest::new(rx);
        assert!(request.try_ready().is_none());
        drop(tx);
        assert_eq!(request.try_ready(), Some(Err(PoolFailure::PoolClosed)));
    }

    #[tokio::test]
    async fn stream_request_resolves() {
        let (tx, rx) = oneshot::channel::<Result<u8, PoolFailure>>();
        let request = StreamRequest::new(rx);
        tx.send(Ok(7)).unwrap();
        assert_eq!(request.await, Ok(7));
    }
}
