//! TCP socket helpers for outbound dials

use crate::util::{AnyTlsError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

const KEEPALIVE_TIME: Duration = Duration::from_secs(120);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Enable TCP_NODELAY and keepalive on a stream (best-effort).
pub fn configure_tcp_stream(stream: &TcpStream, context: &str) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!("[Net] Failed to enable TCP_NODELAY for {}: {}", context, err);
    }

    #[cfg(any(unix, windows))]
    {
        use socket2::{SockRef, TcpKeepalive};

        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_TIME)
            .with_interval(KEEPALIVE_INTERVAL);

        if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            debug!(
                "[Net] Failed to configure TCP keepalive for {}: {}",
                context, err
            );
        }
    }
}

/// Dial `addr` and tune the resulting socket.
pub async fn dial_tcp(addr: SocketAddr, context: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await.map_err(|err| {
        AnyTlsError::Io(std::io::Error::new(
            err.kind(),
            format!("dial {} ({}) failed: {}", context, addr, err),
        ))
    })?;
    configure_tcp_stream(&stream, context);
    Ok(stream)
}
