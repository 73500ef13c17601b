//! What an unauthenticated connection gets.

use crate::server::relay::relay_bidirectional;
use crate::util::PrefixedStream;
use crate::util::net::dial_tcp;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Behaviour for connections that fail authentication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Fallback {
    /// Drop the connection without writing anything
    #[default]
    Close,
    /// Relay the connection, first burst included, to a decoy backend
    Relay(SocketAddr),
}

impl Fallback {
    pub async fn handle<S>(&self, first_burst: Bytes, conn: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match *self {
            Fallback::Close => {
                debug!("[Fallback] Closing connection");
                drop(conn);
            }
            Fallback::Relay(backend) => {
                let upstream = match dial_tcp(backend, "fallback").await {
                    Ok(upstream) => upstream,
                    Err(e) => {
                        debug!("[Fallback] {}", e);
                        return;
                    }
                };
                let stats =
                    relay_bidirectional(PrefixedStream::new(first_burst, conn), upstream).await;
                debug!(
                    "[Fallback] Relayed to {} (up={}, down={})",
                    backend, stats.upload, stats.download
                );
            }
        }
    }
}
