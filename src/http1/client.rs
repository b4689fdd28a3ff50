//! An HTTP/1.x upstream connection.

use std::fmt;
use std::sync::{Arc, Weak};

use http::HeaderMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::codec::{CodecClient, ResponseDecoder, StreamResetReason};
use crate::error::CloseReason;
use crate::pool::{ClientId, PoolClient, PoolRef};
use crate::upstream::Host;

use super::exchange::{Completion, Exchange, ExchangeDecoder, ExchangeEncoder};

/// One upstream HTTP/1.x connection, carrying at most one exchange at a time.
///
/// `ActiveClient` is a cheap handle; clones refer to the same connection. The connection
/// owns its codec. The pool learns about finished exchanges through the [`PoolRef`] it was
/// created with, and about the connection closing through the codec's connection events.
pub struct ActiveClient<C: CodecClient> {
    inner: Arc<Mutex<ClientInner<C>>>,
    id: ClientId,
}

impl<C: CodecClient> Clone for ActiveClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            id: self.id,
        }
    }
}

impl<C: CodecClient> fmt::Debug for ActiveClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ActiveClient")
            .field("id", &self.id)
            .field("host", &inner.host)
            .field("exchange", &inner.exchange)
            .field("remaining", &inner.remaining)
            .field("close_reason", &inner.close_reason)
            .finish()
    }
}

struct ClientInner<C> {
    id: ClientId,
    codec: C,
    exchange: Option<Exchange>,
    next_seq: u64,
    /// Exchanges this connection may still start; `None` is unlimited.
    remaining: Option<u64>,
    close_reason: Option<CloseReason>,
    pool: PoolRef,
    host: Arc<Host>,
}

impl<C: CodecClient> ClientInner<C> {
    /// The live exchange, if it is the one numbered `seq`.
    fn exchange_mut(&mut self, seq: u64) -> Option<&mut Exchange> {
        self.exchange.as_mut().filter(|exchange| exchange.seq() == seq)
    }

    fn close(&mut self, reason: CloseReason) {
        if self.close_reason.is_some() {
            return;
        }

        debug!(client = %self.id, %reason, "closing connection");
        self.close_reason = Some(reason);
        self.codec.close();
    }
}

impl<C: CodecClient> ActiveClient<C> {
    /// Wrap `codec` as a pooled connection to `host`.
    pub fn new(id: ClientId, codec: C, pool: PoolRef, host: Arc<Host>) -> Self {
        let cluster = host.cluster();
        cluster.stats().upstream_cx_http1_total.inc();
        let remaining = match cluster.max_requests_per_connection() {
            0 => None,
            n => Some(n),
        };

        Self {
            inner: Arc::new(Mutex::new(ClientInner {
                id,
                codec,
                exchange: None,
                next_seq: 0,
                remaining,
                close_reason: None,
                pool,
                host,
            })),
            id,
        }
    }

    /// Identity of this connection.
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub(crate) fn downgrade(&self) -> WeakClient<C> {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
            id: self.id,
        }
    }

    /// Start an exchange, routing its response to `decoder`.
    ///
    /// # Panics
    ///
    /// Panics if an exchange is already live on this connection.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(client = %self.id), level = "trace"))]
    pub fn start_exchange(&self, decoder: Box<dyn ResponseDecoder>) -> ExchangeEncoder<C> {
        let mut inner = self.inner.lock();
        assert!(
            inner.exchange.is_none(),
            "{}: exchange started while another is live",
            self.id
        );

        inner.next_seq += 1;
        let seq = inner.next_seq;
        if let Some(remaining) = inner.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }

        let exchange = Exchange::new(seq, self.id, inner.pool.clone(), inner.host.clone());
        let decoder = ExchangeDecoder::new(decoder, self.downgrade(), seq);
        let encoder = inner.codec.new_stream(Box::new(decoder));
        inner.exchange = Some(exchange);

        trace!(seq, "exchange started");
        ExchangeEncoder::new(encoder, self.downgrade(), seq)
    }

    /// Whether closing now would cut off a response which has not fully arrived.
    pub fn closing_with_incomplete_stream(&self) -> bool {
        self.inner
            .lock()
            .exchange
            .as_ref()
            .is_some_and(|exchange| !exchange.decode_complete())
    }

    /// HTTP/1.x carries one exchange at a time.
    pub fn concurrent_stream_limit(&self) -> u32 {
        1
    }

    /// Whether the per-connection request limit leaves room for another exchange.
    pub fn has_remaining_exchanges(&self) -> bool {
        self.inner.lock().remaining != Some(0)
    }

    /// Whether an exchange is attached right now.
    pub fn has_live_exchange(&self) -> bool {
        self.inner.lock().exchange.is_some()
    }

    /// The HTTP version negotiated by the codec.
    pub fn protocol(&self) -> http::Version {
        self.inner.lock().codec.protocol()
    }

    /// Why the connection was closed, once it has been.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().close_reason.clone()
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().close_reason.is_some()
    }

    /// Close the connection. Closing twice has no further effect.
    pub fn close(&self) {
        self.inner.lock().close(CloseReason::Local);
    }

    /// Release the exchange still in the slot, if any.
    ///
    /// Called by the pool once the connection has closed.
    pub fn dispose(&self) {
        let exchange = self.inner.lock().exchange.take();
        if let Some(exchange) = exchange {
            exchange.dispose();
        }
    }

    pub(crate) fn on_encode_complete(&self, seq: u64) {
        let mut inner = self.inner.lock();
        match inner.exchange_mut(seq) {
            Some(exchange) => exchange.on_encode_complete(),
            None => trace!(client = %self.id, seq, "request completed for stale exchange"),
        }
    }

    pub(crate) fn on_decode_headers(&self, seq: u64, headers: &HeaderMap) {
        let mut inner = self.inner.lock();
        let version = inner.codec.protocol();
        if let Some(exchange) = inner.exchange_mut(seq) {
            exchange.on_decode_headers(version, headers);
        }
    }

    pub(crate) fn on_decode_complete(&self, seq: u64) {
        let (exchange, pool) = {
            let mut inner = self.inner.lock();
            if inner.close_reason.is_some() {
                trace!(client = %self.id, seq, "response completed on closed connection");
                return;
            }

            let remote_closed = inner.codec.remote_closed();
            let Some(exchange) = inner.exchange_mut(seq) else {
                trace!(client = %self.id, seq, "response completed for stale exchange");
                return;
            };

            match exchange.on_decode_complete(remote_closed) {
                Completion::ProtocolViolation => {
                    debug!(client = %self.id, seq, "response completed before request");
                    inner.close(CloseReason::ProtocolViolation);
                    return;
                }
                Completion::Close => {
                    debug!(client = %self.id, seq, remote_closed, "upstream closing connection");
                    inner.close(CloseReason::ConnectionDirectedClose);
                    return;
                }
                Completion::Reusable => {}
            }

            (inner.exchange.take(), inner.pool.clone())
        };

        trace!(client = %self.id, seq, "exchange complete, connection reusable");
        pool.schedule_upstream_ready();
        if let Some(exchange) = exchange {
            exchange.dispose();
        }
        if let Some(pool) = pool.upgrade() {
            pool.check_for_drained();
        }
    }

    pub(crate) fn on_reset_stream(&self, seq: u64, reason: StreamResetReason, details: &str) {
        let mut inner = self.inner.lock();
        if inner.exchange_mut(seq).is_none() {
            trace!(client = %self.id, seq, %reason, "reset for stale exchange");
            return;
        }

        debug!(client = %self.id, seq, %reason, details, "stream reset");
        inner.close(CloseReason::StreamReset(reason));
    }
}

impl<C: CodecClient> PoolClient for ActiveClient<C> {
    type Encoder = ExchangeEncoder<C>;

    fn id(&self) -> ClientId {
        self.id
    }

    fn new_stream_encoder(&self, decoder: Box<dyn ResponseDecoder>) -> Self::Encoder {
        self.start_exchange(decoder)
    }

    fn closing_with_incomplete_stream(&self) -> bool {
        ActiveClient::closing_with_incomplete_stream(self)
    }

    fn concurrent_stream_limit(&self) -> u32 {
        ActiveClient::concurrent_stream_limit(self)
    }

    fn has_remaining_streams(&self) -> bool {
        self.has_remaining_exchanges()
    }

    fn close(&self) {
        ActiveClient::close(self)
    }

    fn dispose(&self) {
        ActiveClient::dispose(self)
    }
}

/// Weak handle to a connection, held by its exchange wrappers.
pub(crate) struct WeakClient<C: CodecClient> {
    inner: Weak<Mutex<ClientInner<C>>>,
    id: ClientId,
}

impl<C: CodecClient> Clone for WeakClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            id: self.id,
        }
    }
}

impl<C: CodecClient> WeakClient<C> {
    pub(crate) fn id(&self) -> ClientId {
        self.id
    }

    pub(crate) fn upgrade(&self) -> Option<ActiveClient<C>> {
        self.inner.upgrade().map(|inner| ActiveClient { inner, id: self.id })
    }
}
