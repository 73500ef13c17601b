//! AnyTLS listener

use crate::server::admitter::Admitter;
use crate::util::net::configure_tcp_stream;
use crate::util::{AnyTlsError, Result, spawn_supervised};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{Instrument, field, info, info_span};

/// Accepts TCP connections and admits each one on its own task
pub struct Server {
    admitter: Arc<Admitter>,
}

impl Server {
    pub fn new(admitter: Admitter) -> Self {
        Self {
            admitter: Arc::new(admitter),
        }
    }

    /// Bind `addr` and serve until accepting fails
    pub async fn listen(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AnyTlsError::Config(format!("failed to bind {}: {}", addr, e)))?;
        info!("[Server] Listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept loop on an already-bound listener. An accept error is fatal.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await.map_err(|e| {
                tracing::error!("[Server] Accept error: {}", e);
                AnyTlsError::Io(e)
            })?;
            configure_tcp_stream(&stream, "inbound");

            let span = info_span!(
                "anytls.connection",
                peer_addr = %peer_addr,
                state = field::Empty,
                user_id = field::Empty
            );
            let admitter = Arc::clone(&self.admitter);
            spawn_supervised(
                "connection",
                async move {
                    let state = admitter.admit(stream).await;
                    tracing::debug!("[Server] Connection from {} ended ({})", peer_addr, state);
                }
                .instrument(span),
            );
        }
    }
}
