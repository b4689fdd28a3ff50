//! HTTP/1.x upstream connections and pool allocation.
//!
//! An HTTP/1.x connection carries one exchange at a time. [`ActiveClient`] owns the
//! connection's codec and its single exchange slot; [`allocate_pool`] builds a
//! [`FixedPool`] of such connections for one upstream host.

use std::fmt;
use std::sync::Arc;

use crate::codec::{CodecFactory, CodecType, CreateConnectionData};
use crate::dispatcher::Dispatcher;
use crate::pool::{ClientFactory, ClientId, FixedPool, PoolContext, PoolRef};
use crate::upstream::{
    ClusterConnectivityState, Host, RandomGenerator, ResourcePriority, SocketOptions,
    TransportSocketOptions,
};

mod client;
mod exchange;

pub use self::client::ActiveClient;
pub use self::exchange::ExchangeEncoder;

/// A pool of HTTP/1.x connections whose codecs come from `F`.
pub type Http1Pool<F> = FixedPool<Http1ClientFactory<F>>;

/// Builds [`ActiveClient`]s over codecs from a [`CodecFactory`].
pub struct Http1ClientFactory<F> {
    codecs: F,
}

impl<F> fmt::Debug for Http1ClientFactory<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1ClientFactory").finish_non_exhaustive()
    }
}

impl<F: CodecFactory> Http1ClientFactory<F> {
    /// Wrap `codecs`.
    pub fn new(codecs: F) -> Self {
        Self { codecs }
    }
}

impl<F: CodecFactory> ClientFactory for Http1ClientFactory<F> {
    type Client = ActiveClient<F::Codec>;

    fn create_client(
        &self,
        id: ClientId,
        pool: PoolRef,
        data: CreateConnectionData,
    ) -> Self::Client {
        let host = data.host.clone();
        let codec = self.codecs.create_codec(CodecType::Http1, data);
        ActiveClient::new(id, codec, pool, host)
    }
}

/// Allocate an HTTP/1.1 connection pool for `host`.
///
/// Connections are opened through `codecs` as streams arrive, up to the cluster's
/// connection cap.
#[allow(clippy::too_many_arguments)]
pub fn allocate_pool<F: CodecFactory>(
    dispatcher: Dispatcher,
    random: Arc<dyn RandomGenerator>,
    host: Arc<Host>,
    priority: ResourcePriority,
    socket_options: SocketOptions,
    transport_options: TransportSocketOptions,
    state: Arc<ClusterConnectivityState>,
    codecs: F,
) -> Http1Pool<F> {
    tracing::debug!(%host, ?priority, "allocating http/1 pool");
    let context = PoolContext {
        dispatcher,
        random,
        host,
        priority,
        socket_options,
        transport_options,
        state,
    };
    FixedPool::new(
        context,
        Http1ClientFactory::new(codecs),
        CodecType::Http1.versions(),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::Version;

    use super::*;
    use crate::mock::{test_context, MockCodecFactory, RecordingDecoder};

    fn pool(max_connections: usize) -> (Http1Pool<MockCodecFactory>, MockCodecFactory) {
        let context = test_context(max_connections, 0);
        let codecs = MockCodecFactory::new(Version::HTTP_11);
        let pool = allocate_pool(
            context.dispatcher,
            context.random,
            context.host,
            ResourcePriority::High,
            context.socket_options,
            context.transport_options,
            context.state,
            codecs.clone(),
        );
        (pool, codecs)
    }

    #[test]
    fn allocates_http11_pool() {
        let (pool, codecs) = pool(1);
        assert_eq!(pool.protocols(), &[Version::HTTP_11]);
        assert_eq!(pool.priority(), ResourcePriority::High);
        assert_eq!(pool.num_connections(), 0);
        assert!(codecs.codecs().is_empty());
    }

    #[test]
    fn creates_http1_codecs() {
        let _ = tracing_subscriber::fmt::try_init();

        let (pool, codecs) = pool(1);
        let _request = pool.new_stream(RecordingDecoder::boxed().0);

        let codec = codecs.codec(0).unwrap();
        assert_eq!(codec.codec_type(), Some(CodecType::Http1));
        assert!(codec.client().is_some());
        assert_eq!(codec.connect_timeout(), Some(Duration::from_secs(5)));
        let stats = pool.host().cluster().stats();
        assert_eq!(stats.upstream_cx_http1_total.value(), 1);
        assert_eq!(stats.upstream_cx_total.value(), 1);
    }
}
