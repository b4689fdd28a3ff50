//! Upstream host and cluster metadata shared by pools and connections.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment by one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge which can move in both directions.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    /// Increment by one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Decrement by one.
    pub fn dec(&self) {
        self.sub(1);
    }

    /// Add `n`.
    pub fn add(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Subtract `n`.
    pub fn sub(&self, n: i64) {
        self.0.fetch_sub(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-cluster counters touched by the pool and its connections.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct ClusterStats {
    /// Connections opened, any protocol.
    pub upstream_cx_total: Counter,
    /// HTTP/1 connections opened.
    pub upstream_cx_http1_total: Counter,
    /// Connections closed because the upstream asked for it (`Connection: close` and friends).
    pub upstream_cx_close_notify: Counter,
    /// Connections torn down while a response was still incomplete.
    pub upstream_cx_destroy_with_active_rq: Counter,
    /// Connections closed because they reached `max_requests_per_connection`.
    pub upstream_cx_max_requests: Counter,
    /// Connection attempts which failed before connecting.
    pub upstream_cx_connect_fail: Counter,
    /// Streams attached to a connection.
    pub upstream_rq_total: Counter,
    /// Streams which had to wait for a connection.
    pub upstream_rq_pending_total: Counter,
    /// Pending streams failed because no connection could serve them.
    pub upstream_rq_pending_failure_eject: Counter,
    /// Streams currently attached to a connection.
    pub upstream_rq_active: Gauge,
}

/// Static configuration and stats for a cluster of upstream hosts.
#[derive(Debug)]
pub struct ClusterInfo {
    name: String,
    max_requests_per_connection: u64,
    max_connections: usize,
    connect_timeout: Duration,
    stats: ClusterStats,
}

impl ClusterInfo {
    /// A cluster named `name` with default limits.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_requests_per_connection: 0,
            max_connections: 1024,
            connect_timeout: Duration::from_secs(5),
            stats: ClusterStats::default(),
        }
    }

    /// Cap the number of sequential requests served by one connection. Zero means unlimited.
    pub fn with_max_requests_per_connection(mut self, max: u64) -> Self {
        self.max_requests_per_connection = max;
        self
    }

    /// Cap the number of connections a pool for this cluster may hold open.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Set the connect timeout handed to codec factories with each new connection.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Cluster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sequential request budget per connection; zero means unlimited.
    pub fn max_requests_per_connection(&self) -> u64 {
        self.max_requests_per_connection
    }

    /// Maximum connections per pool.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Cluster stats.
    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }
}

/// One upstream host within a cluster.
#[derive(Debug, Clone)]
pub struct Host {
    address: SocketAddr,
    hostname: String,
    cluster: Arc<ClusterInfo>,
}

impl Host {
    /// Create a host entry.
    pub fn new(address: SocketAddr, hostname: impl Into<String>, cluster: Arc<ClusterInfo>) -> Self {
        Self {
            address,
            hostname: hostname.into(),
            cluster,
        }
    }

    /// Address to connect to.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Hostname, used for SNI and the `Host` header.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The cluster this host belongs to.
    pub fn cluster(&self) -> &ClusterInfo {
        &self.cluster
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster.name(), self.address)
    }
}

/// Resource priority class a pool is allocated for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResourcePriority {
    /// Ordinary traffic.
    #[default]
    Default,
    /// Traffic with its own, separately accounted resources.
    High,
}

/// Connectivity counters shared between all pools for a cluster.
#[derive(Debug, Default)]
pub struct ClusterConnectivityState {
    pending_streams: Gauge,
    active_streams: Gauge,
}

impl ClusterConnectivityState {
    /// Create a fresh state block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Streams waiting for a connection, across all pools sharing this state.
    pub fn pending_streams(&self) -> i64 {
        self.pending_streams.value()
    }

    /// Streams attached to connections, across all pools sharing this state.
    pub fn active_streams(&self) -> i64 {
        self.active_streams.value()
    }

    pub(crate) fn incr_pending_streams(&self, n: i64) {
        self.pending_streams.add(n);
    }

    pub(crate) fn decr_pending_streams(&self, n: i64) {
        self.pending_streams.sub(n);
    }

    pub(crate) fn incr_active_streams(&self, n: i64) {
        self.active_streams.add(n);
    }

    pub(crate) fn decr_active_streams(&self, n: i64) {
        self.active_streams.sub(n);
    }
}

/// Source of randomness shared by a pool and its codecs.
pub trait RandomGenerator: fmt::Debug + Send + Sync + 'static {
    /// A random 64-bit value.
    fn random(&self) -> u64;
}

/// A socket option to apply to new upstream sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SocketOption {
    /// `TCP_NODELAY`.
    NoDelay(bool),
    /// `SO_KEEPALIVE`.
    KeepAlive(bool),
    /// `SO_REUSEADDR`.
    ReuseAddress(bool),
    /// `SO_RCVBUF`.
    RecvBufferSize(usize),
    /// `SO_SNDBUF`.
    SendBufferSize(usize),
}

impl SocketOption {
    /// Apply this option to `socket`.
    pub fn apply(&self, socket: &socket2::SockRef<'_>) -> io::Result<()> {
        match *self {
            SocketOption::NoDelay(on) => socket.set_nodelay(on),
            SocketOption::KeepAlive(on) => socket.set_keepalive(on),
            SocketOption::ReuseAddress(on) => socket.set_reuse_address(on),
            SocketOption::RecvBufferSize(size) => socket.set_recv_buffer_size(size),
            SocketOption::SendBufferSize(size) => socket.set_send_buffer_size(size),
        }
    }
}

/// A shared, immutable set of socket options.
#[derive(Debug, Clone, Default)]
pub struct SocketOptions(Option<Arc<[SocketOption]>>);

impl SocketOptions {
    /// No options.
    pub fn none() -> Self {
        Self(None)
    }

    /// Iterate over the options.
    pub fn iter(&self) -> impl Iterator<Item = &SocketOption> {
        self.0.iter().flat_map(|options| options.iter())
    }

    /// Whether there are no options.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Apply every option to `socket`, stopping at the first failure.
    pub fn apply(&self, socket: &socket2::SockRef<'_>) -> io::Result<()> {
        for option in self.iter() {
            tracing::trace!(?option, "applying socket option");
            option.apply(socket)?;
        }
        Ok(())
    }
}

impl FromIterator<SocketOption> for SocketOptions {
    fn from_iter<I: IntoIterator<Item = SocketOption>>(iter: I) -> Self {
        let options: Arc<[SocketOption]> = iter.into_iter().collect();
        if options.is_empty() {
            Self(None)
        } else {
            Self(Some(options))
        }
    }
}

/// Options for the transport (TLS) layer of new upstream connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct TransportSocketOptions {
    /// Override for the TLS server name.
    pub server_name_override: Option<String>,

    /// Override for the ALPN protocols to offer.
    pub application_protocols: Vec<String>,
}

impl TransportSocketOptions {
    /// Use `server_name` for SNI instead of the host name.
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name_override = Some(server_name.into());
        self
    }

    /// Offer `protocols` via ALPN.
    pub fn with_application_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.application_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }
}
