//! Interfaces to the byte-level HTTP codec.
//!
//! The codec itself (parsing and serializing HTTP/1 on a socket) lives outside this crate.
//! These traits describe what the connection management code needs from it: a way to open
//! a stream, to learn the negotiated protocol version, to find out whether the peer has
//! already hung up, and to close the connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;

use crate::dispatcher::Dispatcher;
use crate::pool::ConnectionEvents;
use crate::upstream::{Host, RandomGenerator, SocketOptions, TransportSocketOptions};

/// Reason reported by the codec when a stream is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StreamResetReason {
    /// The stream was reset locally.
    LocalReset,
    /// The peer reset the stream.
    RemoteReset,
    /// The connection failed before the stream could complete.
    ConnectionFailure,
    /// The connection was terminated while the stream was active.
    ConnectionTermination,
    /// Buffer or resource limits were exceeded.
    Overflow,
    /// The peer violated the protocol.
    ProtocolError,
}

impl fmt::Display for StreamResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StreamResetReason::LocalReset => "local reset",
            StreamResetReason::RemoteReset => "remote reset",
            StreamResetReason::ConnectionFailure => "connection failure",
            StreamResetReason::ConnectionTermination => "connection termination",
            StreamResetReason::Overflow => "overflow",
            StreamResetReason::ProtocolError => "protocol error",
        };
        f.write_str(reason)
    }
}

/// The codec flavor a pool asks its codec factory for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecType {
    /// HTTP/1.x, one exchange at a time.
    Http1,
}

impl CodecType {
    /// The protocol token a pool of this codec type advertises.
    pub fn protocol_token(&self) -> &'static str {
        match self {
            CodecType::Http1 => "HTTP/1.1",
        }
    }

    /// The HTTP versions a pool of this codec type can serve.
    pub fn versions(&self) -> Vec<http::Version> {
        match self {
            CodecType::Http1 => vec![http::Version::HTTP_11],
        }
    }
}

/// Connection-level events raised by the codec / transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The transport finished connecting; the connection can carry streams.
    Connected,
    /// The peer closed the connection.
    RemoteClose,
    /// The connection was closed from this side.
    LocalClose,
}

/// Receives response events for one stream.
///
/// The codec calls these as bytes arrive. Implementations must not block.
pub trait ResponseDecoder: Send + 'static {
    /// An informational (1xx) response head was received.
    fn decode_1xx_headers(&mut self, head: http::response::Parts) {
        let _ = head;
    }

    /// The final response head was received.
    fn decode_headers(&mut self, head: http::response::Parts, end_stream: bool);

    /// A chunk of the response body was received.
    fn decode_data(&mut self, data: Bytes, end_stream: bool);

    /// Response trailers were received; this always ends the stream.
    fn decode_trailers(&mut self, trailers: HeaderMap);

    /// The stream was reset before the response completed.
    fn on_reset_stream(&mut self, reason: StreamResetReason, details: &str) {
        let _ = (reason, details);
    }
}

/// Writes one request onto a stream.
pub trait RequestEncoder: Send + 'static {
    /// Write the request head.
    fn encode_headers(&mut self, head: http::request::Parts, end_stream: bool);

    /// Write a chunk of the request body.
    fn encode_data(&mut self, data: Bytes, end_stream: bool);

    /// Write request trailers; this always ends the stream.
    fn encode_trailers(&mut self, trailers: HeaderMap);

    /// Abandon the stream.
    fn reset_stream(&mut self, reason: StreamResetReason);
}

/// A codec bound to one upstream connection.
///
/// The encoder returned from [`CodecClient::new_stream`] is a handle owned by the
/// codec's bookkeeping; dropping it does not free the stream.
///
/// `close` must not call back into any stream's decoder synchronously. Close and
/// reset notifications caused by it are delivered on a later dispatcher turn.
pub trait CodecClient: Send + 'static {
    /// Encoder handle for a stream on this connection.
    type Encoder: RequestEncoder;

    /// Open a new stream whose response events go to `decoder`.
    fn new_stream(&mut self, decoder: Box<dyn ResponseDecoder>) -> Self::Encoder;

    /// The HTTP version spoken on this connection.
    fn protocol(&self) -> http::Version;

    /// Whether the peer has already closed its side of the transport.
    fn remote_closed(&self) -> bool;

    /// Close the connection.
    fn close(&mut self);
}

/// Everything a codec factory needs to open one upstream connection.
#[derive(Debug, Clone)]
pub struct CreateConnectionData {
    /// The upstream host to connect to.
    pub host: Arc<Host>,

    /// Dispatcher owning the connection.
    pub dispatcher: Dispatcher,

    /// Socket options to apply to the new socket.
    pub socket_options: SocketOptions,

    /// Options for the transport (TLS) layer.
    pub transport_options: TransportSocketOptions,

    /// How long the transport may take to connect.
    pub connect_timeout: Duration,

    /// Randomness source shared with the pool.
    pub random: Arc<dyn RandomGenerator>,

    /// Sink for connect / close events of this connection.
    pub events: ConnectionEvents,
}

/// Creates codecs for new upstream connections.
pub trait CodecFactory: Send + Sync + 'static {
    /// The codec this factory produces.
    type Codec: CodecClient;

    /// Open a connection and wrap it in a codec of the requested type.
    fn create_codec(&self, codec_type: CodecType, data: CreateConnectionData) -> Self::Codec;
}
