//! Per-stream dispatch: read the destination, relay, charge the user.

use crate::panel::UserId;
use crate::protocol::{SocksAddr, addr::SOCKS_FAMILIES};
use crate::server::identity::ServerIdentity;
use crate::server::relay::relay_tcp;
use crate::server::udp_proxy::relay_uot;
use crate::session::{Stream, StreamHandler};
use crate::util::Resolver;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{Instrument, debug, field, info_span};

/// Handles every stream of one authenticated connection
pub struct ProxyHandler {
    identity: Arc<ServerIdentity>,
    user_id: UserId,
    resolver: Arc<Resolver>,
}

impl ProxyHandler {
    pub fn new(identity: Arc<ServerIdentity>, user_id: UserId, resolver: Arc<Resolver>) -> Self {
        Self {
            identity,
            user_id,
            resolver,
        }
    }

    async fn proxy(&self, mut stream: Stream) {
        let destination = match SocksAddr::read_from(&mut stream, SOCKS_FAMILIES).await {
            Ok(destination) => destination,
            Err(e) => {
                debug!("[Proxy] Bad stream header: {}", e);
                stream.close();
                return;
            }
        };
        tracing::Span::current().record("destination", field::display(&destination));

        let stats = if destination.is_uot() {
            relay_uot(stream, &self.resolver).await
        } else {
            relay_tcp(stream, &destination, &self.resolver).await
        };
        self.identity
            .record_traffic(self.user_id, stats.upload, stats.download);
    }
}

impl StreamHandler for ProxyHandler {
    fn handle_stream(&self, stream: Stream) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let span = info_span!(
            "anytls.stream",
            stream_id = stream.id(),
            user_id = self.user_id,
            destination = field::Empty
        );
        Box::pin(self.proxy(stream).instrument(span))
    }
}
