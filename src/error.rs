//! Error and close classification types.

use thiserror::Error;

use crate::codec::StreamResetReason;

/// Why an upstream connection was closed.
///
/// None of these are retried at this layer; the reason is recorded on the connection
/// so that the owning pool (or whoever tears the connection down) can classify it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CloseReason {
    /// The response completed before the request finished sending.
    #[error("response completed before request was fully sent")]
    ProtocolViolation,

    /// The peer (or the protocol defaults) marked the connection as not reusable.
    ///
    /// This is a normal lifecycle outcome, not a failure.
    #[error("upstream requested connection close")]
    ConnectionDirectedClose,

    /// The stream was reset. HTTP/1.x can't recover a byte-aligned connection after
    /// a reset, so the whole connection goes.
    #[error("stream reset: {0}")]
    StreamReset(StreamResetReason),

    /// The pool closed the connection (draining, exhausted request budget, shutdown).
    #[error("closed by pool")]
    Local,
}

/// Reason a pending stream could not be attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PoolFailure {
    /// The connection the stream was waiting on failed, and no capacity remains.
    #[error("upstream connection failure")]
    ConnectionFailure,

    /// The pool is draining and will not open connections for new streams.
    #[error("pool is draining")]
    Drained,

    /// The pool was dropped before the stream was attached.
    #[error("pool closed, no connection can be made")]
    PoolClosed,
}
