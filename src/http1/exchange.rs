//! A single HTTP/1.x request/response exchange.
//!
//! The [`Exchange`] lives in its connection's single exchange slot and tracks how far the
//! request and response have progressed. The codec never sees it directly: the codec
//! drives an [`ExchangeDecoder`], and the caller writes through an [`ExchangeEncoder`].
//! Both wrappers forward to the real decoder / encoder and report progress back to the
//! connection, tagged with the exchange's sequence number so that late callbacks for an
//! exchange which already ended are ignored.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Version};
use tracing::trace;

use crate::codec::{CodecClient, RequestEncoder, ResponseDecoder, StreamResetReason};
use crate::headers::should_close_connection;
use crate::pool::{ClientId, PoolRef};
use crate::upstream::Host;

use super::client::WeakClient;

/// What the connection should do once the response has fully arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// The response finished before the request did.
    ProtocolViolation,
    /// The exchange finished, but the connection may not be reused.
    Close,
    /// The exchange finished and the connection is idle again.
    Reusable,
}

pub(crate) struct Exchange {
    seq: u64,
    client: ClientId,
    encode_complete: bool,
    decode_complete: bool,
    close_connection: bool,
    pool: PoolRef,
    host: Arc<Host>,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("seq", &self.seq)
            .field("client", &self.client)
            .field("encode_complete", &self.encode_complete)
            .field("decode_complete", &self.decode_complete)
            .field("close_connection", &self.close_connection)
            .finish()
    }
}

impl Exchange {
    pub(crate) fn new(seq: u64, client: ClientId, pool: PoolRef, host: Arc<Host>) -> Self {
        Self {
            seq,
            client,
            encode_complete: false,
            decode_complete: false,
            close_connection: false,
            pool,
            host,
        }
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    #[cfg(test)]
    pub(crate) fn encode_complete(&self) -> bool {
        self.encode_complete
    }

    pub(crate) fn decode_complete(&self) -> bool {
        self.decode_complete
    }

    #[cfg(test)]
    pub(crate) fn close_connection(&self) -> bool {
        self.close_connection
    }

    pub(crate) fn on_encode_complete(&mut self) {
        trace!(client = %self.client, seq = self.seq, "request complete");
        self.encode_complete = true;
    }

    /// Fold the response head into the close decision.
    pub(crate) fn on_decode_headers(&mut self, version: Version, headers: &HeaderMap) {
        if self.close_connection {
            return;
        }

        if should_close_connection(version, headers) {
            trace!(client = %self.client, ?version, "upstream will not keep connection alive");
            self.host.cluster().stats().upstream_cx_close_notify.inc();
            self.close_connection = true;
        }
    }

    /// The response fully arrived.
    ///
    /// # Panics
    ///
    /// Panics if the response already completed once.
    pub(crate) fn on_decode_complete(&mut self, remote_closed: bool) -> Completion {
        assert!(
            !self.decode_complete,
            "{}: response completed twice for exchange {}",
            self.client, self.seq
        );

        // A response that outruns its request does not complete the exchange.
        self.decode_complete = self.encode_complete;

        if !self.encode_complete {
            Completion::ProtocolViolation
        } else if self.close_connection || remote_closed {
            Completion::Close
        } else {
            Completion::Reusable
        }
    }

    /// Release the exchange, telling the pool the stream ended.
    ///
    /// Consumes the exchange, so the pool hears about each exchange exactly once. New work
    /// must not be attached to the connection in the same call stack.
    pub(crate) fn dispose(self) {
        trace!(client = %self.client, seq = self.seq, "exchange disposed");
        if let Some(pool) = self.pool.upgrade() {
            pool.on_stream_closed(self.client, true);
        }
    }
}

/// Request encoder for an exchange.
///
/// Forwards to the codec's encoder, and marks the request complete on the connection once a
/// frame carries `end_stream`. Resetting the stream closes the connection.
pub struct ExchangeEncoder<C: CodecClient> {
    inner: C::Encoder,
    client: WeakClient<C>,
    seq: u64,
}

impl<C: CodecClient> fmt::Debug for ExchangeEncoder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeEncoder")
            .field("client", &self.client.id())
            .field("seq", &self.seq)
            .finish()
    }
}

impl<C: CodecClient> ExchangeEncoder<C> {
    pub(crate) fn new(inner: C::Encoder, client: WeakClient<C>, seq: u64) -> Self {
        Self { inner, client, seq }
    }

    /// The connection this request is written to.
    pub fn client_id(&self) -> ClientId {
        self.client.id()
    }

    fn encode_complete(&self) {
        if let Some(client) = self.client.upgrade() {
            client.on_encode_complete(self.seq);
        }
    }
}

impl<C: CodecClient> RequestEncoder for ExchangeEncoder<C> {
    fn encode_headers(&mut self, head: http::request::Parts, end_stream: bool) {
        self.inner.encode_headers(head, end_stream);
        if end_stream {
            self.encode_complete();
        }
    }

    fn encode_data(&mut self, data: Bytes, end_stream: bool) {
        self.inner.encode_data(data, end_stream);
        if end_stream {
            self.encode_complete();
        }
    }

    fn encode_trailers(&mut self, trailers: HeaderMap) {
        self.inner.encode_trailers(trailers);
        self.encode_complete();
    }

    fn reset_stream(&mut self, reason: StreamResetReason) {
        self.inner.reset_stream(reason);
        if let Some(client) = self.client.upgrade() {
            client.on_reset_stream(self.seq, reason, "reset by caller");
        }
    }
}

/// Response decoder handed to the codec for an exchange.
///
/// The close decision is made before the response head is forwarded, and completion is
/// reported after the final frame is forwarded.
pub(crate) struct ExchangeDecoder<C: CodecClient> {
    inner: Box<dyn ResponseDecoder>,
    client: WeakClient<C>,
    seq: u64,
}

impl<C: CodecClient> ExchangeDecoder<C> {
    pub(crate) fn new(inner: Box<dyn ResponseDecoder>, client: WeakClient<C>, seq: u64) -> Self {
        Self { inner, client, seq }
    }

    fn decode_complete(&self) {
        if let Some(client) = self.client.upgrade() {
            client.on_decode_complete(self.seq);
        }
    }
}

impl<C: CodecClient> ResponseDecoder for ExchangeDecoder<C> {
    fn decode_1xx_headers(&mut self, head: http::response::Parts) {
        self.inner.decode_1xx_headers(head);
    }

    fn decode_headers(&mut self, head: http::response::Parts, end_stream: bool) {
        if let Some(client) = self.client.upgrade() {
            client.on_decode_headers(self.seq, &head.headers);
        }

        self.inner.decode_headers(head, end_stream);
        if end_stream {
            self.decode_complete();
        }
    }

    fn decode_data(&mut self, data: Bytes, end_stream: bool) {
        self.inner.decode_data(data, end_stream);
        if end_stream {
            self.decode_complete();
        }
    }

    fn decode_trailers(&mut self, trailers: HeaderMap) {
        self.inner.decode_trailers(trailers);
        self.decode_complete();
    }

    fn on_reset_stream(&mut self, reason: StreamResetReason, details: &str) {
        self.inner.on_reset_stream(reason, details);
        if let Some(client) = self.client.upgrade() {
            client.on_reset_stream(self.seq, reason, details);
        }
    }
}

#[cfg(test)]
mod tests {
    use http::header::CONNECTION;
    use http::HeaderValue;

    use super::*;
    use crate::mock::{test_host, MockPool, PoolCall};

    fn exchange() -> (Exchange, Arc<Host>) {
        let host = test_host(0);
        let exchange = Exchange::new(1, ClientId::next(), PoolRef::none(), host.clone());
        (exchange, host)
    }

    fn connection(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn clean_completion_is_reusable() {
        let (mut exchange, _) = exchange();
        exchange.on_encode_complete();
        exchange.on_decode_headers(Version::HTTP_11, &HeaderMap::new());
        assert!(!exchange.close_connection());
        assert_eq!(exchange.on_decode_complete(false), Completion::Reusable);
        assert!(exchange.decode_complete());
    }

    #[test]
    fn response_before_request_is_violation() {
        let (mut exchange, _) = exchange();
        exchange.on_decode_headers(Version::HTTP_11, &HeaderMap::new());
        assert_eq!(
            exchange.on_decode_complete(false),
            Completion::ProtocolViolation
        );
        assert!(!exchange.decode_complete());
        assert!(!exchange.encode_complete());
    }

    #[test]
    fn connection_close_closes() {
        let (mut exchange, host) = exchange();
        exchange.on_encode_complete();
        exchange.on_decode_headers(Version::HTTP_11, &connection("close"));
        assert!(exchange.close_connection());
        assert_eq!(exchange.on_decode_complete(false), Completion::Close);
        assert_eq!(host.cluster().stats().upstream_cx_close_notify.value(), 1);
    }

    #[test]
    fn remote_close_closes() {
        let (mut exchange, host) = exchange();
        exchange.on_encode_complete();
        exchange.on_decode_headers(Version::HTTP_11, &HeaderMap::new());
        assert_eq!(exchange.on_decode_complete(true), Completion::Close);
        assert_eq!(host.cluster().stats().upstream_cx_close_notify.value(), 0);
    }

    #[test]
    fn http10_defaults() {
        let (mut exchange, _) = exchange();
        exchange.on_decode_headers(Version::HTTP_10, &HeaderMap::new());
        assert!(exchange.close_connection());

        let (mut exchange, _) = self::exchange();
        exchange.on_decode_headers(Version::HTTP_10, &connection("keep-alive"));
        assert!(!exchange.close_connection());
    }

    #[test]
    fn close_is_sticky_and_counted_once() {
        let (mut exchange, host) = exchange();
        exchange.on_decode_headers(Version::HTTP_11, &connection("close"));
        exchange.on_decode_headers(Version::HTTP_11, &connection("keep-alive"));
        assert!(exchange.close_connection());
        assert_eq!(host.cluster().stats().upstream_cx_close_notify.value(), 1);
    }

    #[test]
    #[should_panic(expected = "response completed twice")]
    fn double_completion_panics() {
        let (mut exchange, _) = exchange();
        exchange.on_encode_complete();
        let _ = exchange.on_decode_complete(false);
        let _ = exchange.on_decode_complete(false);
    }

    #[test]
    fn dispose_notifies_pool_once_with_delay() {
        let pool = MockPool::new(test_host(0));
        let client = ClientId::next();
        let exchange = Exchange::new(1, client, PoolRef::downgrade(&pool), pool.host().clone());

        exchange.dispose();

        assert_eq!(
            pool.calls(),
            vec![PoolCall::StreamClosed {
                client,
                delay_attach: true
            }]
        );
    }
}
