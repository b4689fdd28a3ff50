//! h1pool
//!
//! HTTP/1.x connection management for upstream connection pools.
//!
//! HTTP/1.x permits exactly one in-flight request/response exchange per
//! connection. This crate provides the pieces a proxy needs to respect that:
//!
//! 1. [`http1::ActiveClient`], a single upstream connection which owns at most one live
//!    exchange and decides, from the protocol version and response headers, whether the
//!    connection may be reused once the exchange ends.
//! 2. [`pool::FixedPool`], a small FIFO pool which hands exchanges to idle connections,
//!    opens new ones up to a fixed cap, and drains them on request.
//! 3. [`http1::allocate_pool`], which wires the two together for `HTTP/1.1`.
//!
//! Everything runs on a cooperative [`Dispatcher`]: callbacks from the codec never block,
//! and the "connection idle again" signal is always deferred to the next dispatcher turn
//! so that new work is never attached to a connection which is still unwinding.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::fmt;

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod headers;
pub mod http1;
#[cfg(any(test, feature = "mocks"))]
pub mod mock;
pub mod pool;
pub mod upstream;

pub use dispatcher::Dispatcher;
pub use error::{CloseReason, PoolFailure};
pub use http1::{allocate_pool, ActiveClient};
pub use pool::FixedPool;

#[allow(unused)]
pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
