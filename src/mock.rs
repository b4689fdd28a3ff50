//! Mock codecs, connections and pools for testing.
//!
//! The mocks record what was done to them, and let tests drive the response side of a
//! stream by hand, one callback at a time.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use parking_lot::Mutex;

use crate::codec::{
    CodecClient, CodecFactory, CodecType, ConnectionEvent, CreateConnectionData, RequestEncoder,
    ResponseDecoder, StreamResetReason,
};
use crate::dispatcher::Dispatcher;
use crate::pool::{
    ClientFactory, ClientId, ConnectionEvents, PoolClient, PoolContext, PoolRef, UpstreamPool,
};
use crate::upstream::{
    ClusterConnectivityState, ClusterInfo, Host, RandomGenerator, ResourcePriority,
    SocketOptions, TransportSocketOptions,
};

/// A deterministic randomness source: counts up from zero.
#[derive(Debug, Default)]
pub struct SequentialRandom(AtomicU64);

impl RandomGenerator for SequentialRandom {
    fn random(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// A host on `127.0.0.1:8080` in cluster `test`.
pub fn test_host(max_requests_per_connection: u64) -> Arc<Host> {
    test_host_with(1024, max_requests_per_connection)
}

/// A host on `127.0.0.1:8080` with the given limits.
pub fn test_host_with(max_connections: usize, max_requests_per_connection: u64) -> Arc<Host> {
    let cluster = ClusterInfo::new("test")
        .with_max_connections(max_connections)
        .with_max_requests_per_connection(max_requests_per_connection);
    Arc::new(Host::new(
        SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
        "localhost",
        Arc::new(cluster),
    ))
}

/// A pool context with a fresh dispatcher and a host from [`test_host_with`].
pub fn test_context(max_connections: usize, max_requests_per_connection: u64) -> PoolContext {
    PoolContext {
        dispatcher: Dispatcher::new(),
        random: Arc::new(SequentialRandom::default()),
        host: test_host_with(max_connections, max_requests_per_connection),
        priority: ResourcePriority::Default,
        socket_options: SocketOptions::none(),
        transport_options: TransportSocketOptions::default(),
        state: Arc::new(ClusterConnectivityState::new()),
    }
}

/// A response event seen by a [`RecordingDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderEvent {
    /// An informational response head.
    Informational(StatusCode),
    /// The final response head.
    Headers {
        /// Response status.
        status: StatusCode,
        /// Whether the head ended the response.
        end_stream: bool,
    },
    /// A body chunk.
    Data {
        /// The chunk.
        data: Bytes,
        /// Whether the chunk ended the response.
        end_stream: bool,
    },
    /// Trailers, ending the response.
    Trailers,
    /// The stream was reset.
    Reset(StreamResetReason),
}

/// Shared log of the events a [`RecordingDecoder`] received.
#[derive(Debug, Clone, Default)]
pub struct DecoderLog(Arc<Mutex<Vec<DecoderEvent>>>);

impl DecoderLog {
    /// Events so far, oldest first.
    pub fn events(&self) -> Vec<DecoderEvent> {
        self.0.lock().clone()
    }

    /// Whether the response has ended, either complete or reset.
    pub fn is_finished(&self) -> bool {
        self.0.lock().iter().any(|event| match event {
            DecoderEvent::Headers { end_stream, .. } | DecoderEvent::Data { end_stream, .. } => {
                *end_stream
            }
            DecoderEvent::Trailers | DecoderEvent::Reset(_) => true,
            DecoderEvent::Informational(_) => false,
        })
    }

    fn push(&self, event: DecoderEvent) {
        self.0.lock().push(event);
    }
}

/// A response decoder which records everything it is given.
#[derive(Debug, Default)]
pub struct RecordingDecoder {
    log: DecoderLog,
}

impl RecordingDecoder {
    /// A boxed decoder, and the log it writes to.
    pub fn boxed() -> (Box<dyn ResponseDecoder>, DecoderLog) {
        let log = DecoderLog::default();
        (Box::new(RecordingDecoder { log: log.clone() }), log)
    }
}

impl ResponseDecoder for RecordingDecoder {
    fn decode_1xx_headers(&mut self, head: http::response::Parts) {
        self.log.push(DecoderEvent::Informational(head.status));
    }

    fn decode_headers(&mut self, head: http::response::Parts, end_stream: bool) {
        self.log.push(DecoderEvent::Headers {
            status: head.status,
            end_stream,
        });
    }

    fn decode_data(&mut self, data: Bytes, end_stream: bool) {
        self.log.push(DecoderEvent::Data { data, end_stream });
    }

    fn decode_trailers(&mut self, _trailers: HeaderMap) {
        self.log.push(DecoderEvent::Trailers);
    }

    fn on_reset_stream(&mut self, reason: StreamResetReason, _details: &str) {
        self.log.push(DecoderEvent::Reset(reason));
    }
}

/// A request event seen by a [`MockEncoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeEvent {
    /// The request head.
    Headers {
        /// Request method.
        method: Method,
        /// Whether the head ended the request.
        end_stream: bool,
    },
    /// A body chunk.
    Data {
        /// The chunk.
        data: Bytes,
        /// Whether the chunk ended the request.
        end_stream: bool,
    },
    /// Trailers, ending the request.
    Trailers,
    /// The stream was reset locally.
    Reset(StreamResetReason),
}

struct MockStreamState {
    decoder: Option<Box<dyn ResponseDecoder>>,
    encoded: Vec<EncodeEvent>,
}

struct CodecState {
    codec_type: Option<CodecType>,
    protocol: Version,
    remote_closed: bool,
    close_count: usize,
    connect_timeout: Option<Duration>,
    streams: Vec<MockStreamState>,
    events: Option<(ConnectionEvents, Dispatcher)>,
}

/// A codec with no transport underneath.
///
/// Responses are delivered by hand through the paired [`MockCodecHandle`]. When built by a
/// [`MockCodecFactory`], closing the codec raises a local close event on the next dispatcher
/// turn, as a real transport would.
pub struct MockCodec {
    state: Arc<Mutex<CodecState>>,
}

impl fmt::Debug for MockCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockCodec").finish_non_exhaustive()
    }
}

impl MockCodec {
    /// A codec speaking `protocol`, not attached to any pool.
    pub fn new(protocol: Version) -> (Self, MockCodecHandle) {
        Self::build(protocol, None, None, None)
    }

    fn build(
        protocol: Version,
        codec_type: Option<CodecType>,
        connect_timeout: Option<Duration>,
        events: Option<(ConnectionEvents, Dispatcher)>,
    ) -> (Self, MockCodecHandle) {
        let state = Arc::new(Mutex::new(CodecState {
            codec_type,
            protocol,
            remote_closed: false,
            close_count: 0,
            connect_timeout,
            streams: Vec::new(),
            events,
        }));

        (
            MockCodec {
                state: state.clone(),
            },
            MockCodecHandle { state },
        )
    }
}

impl CodecClient for MockCodec {
    type Encoder = MockEncoder;

    fn new_stream(&mut self, decoder: Box<dyn ResponseDecoder>) -> Self::Encoder {
        let mut state = self.state.lock();
        state.streams.push(MockStreamState {
            decoder: Some(decoder),
            encoded: Vec::new(),
        });
        MockEncoder {
            state: self.state.clone(),
            stream: state.streams.len() - 1,
        }
    }

    fn protocol(&self) -> Version {
        self.state.lock().protocol
    }

    fn remote_closed(&self) -> bool {
        self.state.lock().remote_closed
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.close_count += 1;
        if state.close_count > 1 {
            return;
        }

        if let Some((events, dispatcher)) = state.events.clone() {
            dispatcher.post(move || events.raise(ConnectionEvent::LocalClose));
        }
    }
}

/// Encoder for one stream on a [`MockCodec`].
pub struct MockEncoder {
    state: Arc<Mutex<CodecState>>,
    stream: usize,
}

impl fmt::Debug for MockEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockEncoder")
            .field("stream", &self.stream)
            .finish()
    }
}

impl MockEncoder {
    fn record(&self, event: EncodeEvent) {
        let mut state = self.state.lock();
        if let Some(stream) = state.streams.get_mut(self.stream) {
            stream.encoded.push(event);
        }
    }
}

impl RequestEncoder for MockEncoder {
    fn encode_headers(&mut self, head: http::request::Parts, end_stream: bool) {
        self.record(EncodeEvent::Headers {
            method: head.method,
            end_stream,
        });
    }

    fn encode_data(&mut self, data: Bytes, end_stream: bool) {
        self.record(EncodeEvent::Data { data, end_stream });
    }

    fn encode_trailers(&mut self, _trailers: HeaderMap) {
        self.record(EncodeEvent::Trailers);
    }

    fn reset_stream(&mut self, reason: StreamResetReason) {
        self.record(EncodeEvent::Reset(reason));
    }
}

/// Test-side handle to a [`MockCodec`].
#[derive(Clone)]
pub struct MockCodecHandle {
    state: Arc<Mutex<CodecState>>,
}

impl fmt::Debug for MockCodecHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockCodecHandle")
            .field("protocol", &state.protocol)
            .field("streams", &state.streams.len())
            .field("close_count", &state.close_count)
            .finish()
    }
}

impl MockCodecHandle {
    /// Call the decoder of `stream` without holding the codec lock.
    fn with_decoder<F>(&self, stream: usize, f: F)
    where
        F: FnOnce(&mut dyn ResponseDecoder),
    {
        let decoder = self
            .state
            .lock()
            .streams
            .get_mut(stream)
            .and_then(|stream| stream.decoder.take());

        let Some(mut decoder) = decoder else {
            tracing::warn!(stream, "no decoder for mock stream");
            return;
        };

        f(decoder.as_mut());

        if let Some(slot) = self.state.lock().streams.get_mut(stream) {
            slot.decoder = Some(decoder);
        }
    }

    /// Deliver a response head on `stream`.
    pub fn respond(&self, stream: usize, head: http::response::Parts, end_stream: bool) {
        self.with_decoder(stream, |decoder| decoder.decode_headers(head, end_stream));
    }

    /// Deliver an informational response head on `stream`.
    pub fn respond_1xx(&self, stream: usize, head: http::response::Parts) {
        self.with_decoder(stream, |decoder| decoder.decode_1xx_headers(head));
    }

    /// Deliver a body chunk on `stream`.
    pub fn respond_data(&self, stream: usize, data: Bytes, end_stream: bool) {
        self.with_decoder(stream, |decoder| decoder.decode_data(data, end_stream));
    }

    /// Deliver trailers on `stream`.
    pub fn respond_trailers(&self, stream: usize, trailers: HeaderMap) {
        self.with_decoder(stream, |decoder| decoder.decode_trailers(trailers));
    }

    /// Reset `stream`.
    pub fn reset(&self, stream: usize, reason: StreamResetReason) {
        self.with_decoder(stream, |decoder| {
            decoder.on_reset_stream(reason, "mock reset")
        });
    }

    /// Report the transport as connected.
    pub fn connect(&self) {
        self.raise(ConnectionEvent::Connected);
    }

    /// Report the peer hanging up.
    pub fn remote_close(&self) {
        self.state.lock().remote_closed = true;
        self.raise(ConnectionEvent::RemoteClose);
    }

    fn raise(&self, event: ConnectionEvent) {
        let events = self.state.lock().events.clone();
        if let Some((events, _)) = events {
            events.raise(event);
        }
    }

    /// Change the HTTP version the codec reports.
    pub fn set_protocol(&self, protocol: Version) {
        self.state.lock().protocol = protocol;
    }

    /// Change whether the codec reports the peer as gone.
    pub fn set_remote_closed(&self, remote_closed: bool) {
        self.state.lock().remote_closed = remote_closed;
    }

    /// The codec type the codec was created for.
    pub fn codec_type(&self) -> Option<CodecType> {
        self.state.lock().codec_type
    }

    /// Connect timeout the codec was created with, when built by a [`MockCodecFactory`].
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.state.lock().connect_timeout
    }

    /// Connection this codec belongs to, when built by a [`MockCodecFactory`].
    pub fn client(&self) -> Option<ClientId> {
        self.state
            .lock()
            .events
            .as_ref()
            .map(|(events, _)| events.client())
    }

    /// Number of times `close` was called.
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    /// Whether the codec was closed.
    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    /// Number of streams opened.
    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// Request events written on `stream`.
    pub fn encoded(&self, stream: usize) -> Vec<EncodeEvent> {
        self.state
            .lock()
            .streams
            .get(stream)
            .map(|stream| stream.encoded.clone())
            .unwrap_or_default()
    }
}

/// Builds [`MockCodec`]s, keeping a handle to each.
#[derive(Debug, Clone, Default)]
pub struct MockCodecFactory {
    protocol: Version,
    codecs: Arc<Mutex<Vec<MockCodecHandle>>>,
}

impl MockCodecFactory {
    /// A factory for codecs speaking `protocol`.
    pub fn new(protocol: Version) -> Self {
        Self {
            protocol,
            codecs: Default::default(),
        }
    }

    /// Handles to every codec built so far, oldest first.
    pub fn codecs(&self) -> Vec<MockCodecHandle> {
        self.codecs.lock().clone()
    }

    /// Handle to the codec built `index`-th.
    pub fn codec(&self, index: usize) -> Option<MockCodecHandle> {
        self.codecs.lock().get(index).cloned()
    }
}

impl CodecFactory for MockCodecFactory {
    type Codec = MockCodec;

    fn create_codec(&self, codec_type: CodecType, data: CreateConnectionData) -> Self::Codec {
        let (codec, handle) = MockCodec::build(
            self.protocol,
            Some(codec_type),
            Some(data.connect_timeout),
            Some((data.events, data.dispatcher)),
        );
        self.codecs.lock().push(handle);
        codec
    }
}

/// A call a connection made into a [`MockPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolCall {
    /// [`UpstreamPool::check_for_drained`].
    CheckForDrained,
    /// [`UpstreamPool::on_stream_closed`].
    StreamClosed {
        /// The connection.
        client: ClientId,
        /// Whether attaching was deferred.
        delay_attach: bool,
    },
    /// [`UpstreamPool::on_upstream_ready`].
    UpstreamReady,
}

/// A pool which only records the calls made into it.
#[derive(Debug)]
pub struct MockPool {
    dispatcher: Dispatcher,
    host: Arc<Host>,
    calls: Mutex<Vec<PoolCall>>,
}

impl MockPool {
    /// A recording pool for `host` with a fresh dispatcher.
    pub fn new(host: Arc<Host>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher: Dispatcher::new(),
            host,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Calls so far, oldest first.
    pub fn calls(&self) -> Vec<PoolCall> {
        self.calls.lock().clone()
    }

    /// The pool's dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The pool's host.
    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }
}

impl UpstreamPool for MockPool {
    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn host(&self) -> &Arc<Host> {
        &self.host
    }

    fn check_for_drained(&self) {
        self.calls.lock().push(PoolCall::CheckForDrained);
    }

    fn on_stream_closed(&self, client: ClientId, delay_attach: bool) {
        self.calls.lock().push(PoolCall::StreamClosed {
            client,
            delay_attach,
        });
    }

    fn on_upstream_ready(&self) {
        self.calls.lock().push(PoolCall::UpstreamReady);
    }
}

type AttachHook = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Default)]
struct MockClientState {
    closed: AtomicBool,
    incomplete: AtomicBool,
    disposed: AtomicUsize,
    streams: AtomicUsize,
    resets: Mutex<Vec<StreamResetReason>>,
}

/// A pooled connection with no codec, for exercising pool bookkeeping.
#[derive(Clone)]
pub struct MockClient {
    id: ClientId,
    max_streams: Option<usize>,
    on_attach: Option<AttachHook>,
    state: Arc<MockClientState>,
}

impl fmt::Debug for MockClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockClient")
            .field("id", &self.id)
            .field("max_streams", &self.max_streams)
            .field("state", &self.state)
            .finish()
    }
}

impl MockClient {
    /// Whether the pool closed this connection.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Reasons passed to `reset_stream` on this connection's encoders, oldest first.
    pub fn resets(&self) -> Vec<StreamResetReason> {
        self.state.resets.lock().clone()
    }
}

impl PoolClient for MockClient {
    type Encoder = MockClientEncoder;

    fn id(&self) -> ClientId {
        self.id
    }

    fn new_stream_encoder(&self, _decoder: Box<dyn ResponseDecoder>) -> Self::Encoder {
        if let Some(hook) = &self.on_attach {
            hook();
        }

        self.state.streams.fetch_add(1, Ordering::SeqCst);
        self.state.incomplete.store(false, Ordering::SeqCst);
        MockClientEncoder {
            id: self.id,
            state: self.state.clone(),
        }
    }

    fn closing_with_incomplete_stream(&self) -> bool {
        self.state.incomplete.load(Ordering::SeqCst)
    }

    fn concurrent_stream_limit(&self) -> u32 {
        1
    }

    fn has_remaining_streams(&self) -> bool {
        self.max_streams
            .map_or(true, |max| self.state.streams.load(Ordering::SeqCst) < max)
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    fn dispose(&self) {
        self.state.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Encoder handed out by a [`MockClient`], with a view of the connection's state.
#[derive(Debug)]
pub struct MockClientEncoder {
    id: ClientId,
    state: Arc<MockClientState>,
}

impl MockClientEncoder {
    /// The connection this stream is on.
    pub fn client(&self) -> ClientId {
        self.id
    }

    /// Whether the connection was closed.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Mark the connection's response as incomplete (or not).
    pub fn set_incomplete(&self, incomplete: bool) {
        self.state.incomplete.store(incomplete, Ordering::SeqCst);
    }

    /// Number of times the connection was disposed.
    pub fn disposed(&self) -> usize {
        self.state.disposed.load(Ordering::SeqCst)
    }
}

impl RequestEncoder for MockClientEncoder {
    fn encode_headers(&mut self, _head: http::request::Parts, _end_stream: bool) {}

    fn encode_data(&mut self, _data: Bytes, _end_stream: bool) {}

    fn encode_trailers(&mut self, _trailers: HeaderMap) {}

    fn reset_stream(&mut self, reason: StreamResetReason) {
        self.state.resets.lock().push(reason);
    }
}

/// Builds [`MockClient`]s, keeping a handle to each.
#[derive(Clone, Default)]
pub struct MockClientFactory {
    max_streams: Option<usize>,
    on_attach: Option<AttachHook>,
    clients: Arc<Mutex<Vec<MockClient>>>,
}

impl fmt::Debug for MockClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockClientFactory")
            .field("max_streams", &self.max_streams)
            .field("clients", &self.clients.lock().len())
            .finish()
    }
}

impl MockClientFactory {
    /// Limit each connection to `max` streams over its lifetime.
    pub fn with_max_streams(mut self, max: usize) -> Self {
        self.max_streams = Some(max);
        self
    }

    /// Run `hook` whenever a stream is attached, before the encoder is handed back.
    pub fn on_attach<H>(mut self, hook: H) -> Self
    where
        H: Fn() + Send + Sync + 'static,
    {
        self.on_attach = Some(Arc::new(hook));
        self
    }

    /// Every connection built so far, oldest first.
    pub fn clients(&self) -> Vec<MockClient> {
        self.clients.lock().clone()
    }
}

impl ClientFactory for MockClientFactory {
    type Client = MockClient;

    fn create_client(&self, id: ClientId, _pool: PoolRef, _data: CreateConnectionData) -> MockClient {
        let client = MockClient {
            id,
            max_streams: self.max_streams,
            on_attach: self.on_attach.clone(),
            state: Arc::default(),
        };
        self.clients.lock().push(client.clone());
        client
    }
}
