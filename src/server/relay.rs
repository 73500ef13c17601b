//! Outbound TCP hop and the bidirectional copy shared by every relay.

use crate::protocol::SocksAddr;
use crate::session::Stream;
use crate::util::net::dial_tcp;
use crate::util::{Resolver, spawn_supervised};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Large enough for any single UoT datagram
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Bytes moved by one relay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// client -> destination
    pub upload: u64,
    /// destination -> client
    pub download: u64,
}

/// Dial `destination` and relay `stream` to it.
///
/// A failed resolve or dial is reported to the client on the stream and
/// yields zero counts.
pub async fn relay_tcp(mut stream: Stream, destination: &SocksAddr, resolver: &Resolver) -> RelayStats {
    let target = destination.to_string();

    let addr = match resolver.resolve(&destination.host_str(), destination.port).await {
        Ok(addr) => addr,
        Err(e) => {
            debug!("[Relay] Resolve {} failed: {}", target, e);
            stream.report_handshake_failure(&e.to_string());
            return RelayStats::default();
        }
    };

    let outbound = match dial_tcp(addr, &target).await {
        Ok(outbound) => outbound,
        Err(e) => {
            debug!("[Relay] {}", e);
            stream.report_handshake_failure(&e.to_string());
            return RelayStats::default();
        }
    };

    stream.report_handshake_success();
    let stats = relay_bidirectional(stream, outbound).await;
    debug!(
        "[Relay] {} closed (up={}, down={})",
        target, stats.upload, stats.download
    );
    stats
}

/// Copy both directions between `client` and `remote` until each side has
/// reached EOF or failed.
///
/// Each direction shuts down its destination's write side when it ends, so
/// a half-close on one side is passed on to the other.
pub async fn relay_bidirectional<A, B>(client: A, remote: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let upload = spawn_supervised("relay upload", copy_then_shutdown(client_read, remote_write));
    let download = spawn_supervised("relay download", copy_then_shutdown(remote_read, client_write));
    let (upload, download) = tokio::join!(upload, download);

    RelayStats {
        upload: upload.ok().flatten().unwrap_or(0),
        download: download.ok().flatten().unwrap_or(0),
    }
}

/// Bytes successfully written before EOF or the first error
async fn copy_then_shutdown<R, W>(mut reader: R, mut writer: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("[Relay] Read ended: {}", e);
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            debug!("[Relay] Write ended: {}", e);
            break;
        }
        copied += n as u64;
    }

    let _ = writer.shutdown().await;
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Frame};
    use crate::session::stream::test_support::detached_stream;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_counts_and_half_close() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (remote, mut remote_peer) = tokio::io::duplex(1024);
        let relay = tokio::spawn(relay_bidirectional(client, remote));

        client_peer.write_all(&[1u8; 100]).await.unwrap();
        client_peer.shutdown().await.unwrap();

        // the remote sees the data, then EOF, and can still answer
        let mut got = Vec::new();
        remote_peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got.len(), 100);
        remote_peer.write_all(&[2u8; 40]).await.unwrap();
        remote_peer.shutdown().await.unwrap();

        let mut back = Vec::new();
        client_peer.read_to_end(&mut back).await.unwrap();
        assert_eq!(back.len(), 40);

        let stats = relay.await.unwrap();
        assert_eq!(stats, RelayStats { upload: 100, download: 40 });
    }

    #[tokio::test]
    async fn test_remote_silent_counts_zero_download() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let remote = tokio_test::io::Builder::new().read(b"").build();
        let relay = tokio::spawn(relay_bidirectional(client, remote));

        let mut back = Vec::new();
        client_peer.read_to_end(&mut back).await.unwrap();
        assert!(back.is_empty());
        drop(client_peer);

        let stats = relay.await.unwrap();
        assert_eq!(stats.download, 0);
        assert_eq!(stats.upload, 0);
    }

    #[tokio::test]
    async fn test_relay_tcp_to_echo_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            socket.read_to_end(&mut data).await.unwrap();
            socket.write_all(&data).await.unwrap();
        });

        let (stream, inbound, mut frames) = detached_stream(1, 2);
        let destination = SocksAddr::from_ip(addr.ip(), addr.port());
        let resolver = Resolver::system();
        let relay = tokio::spawn(async move { relay_tcp(stream, &destination, &resolver).await });

        assert_eq!(frames.recv().await.unwrap(), Frame::control(Command::SynAck, 1));
        inbound.send(Bytes::from_static(b"hello relay")).unwrap();
        drop(inbound);

        let echoed = frames.recv().await.unwrap();
        assert_eq!(echoed, Frame::push(1, Bytes::from_static(b"hello relay")));
        assert_eq!(frames.recv().await.unwrap().cmd, Command::Fin);

        let stats = relay.await.unwrap();
        assert_eq!(stats, RelayStats { upload: 11, download: 11 });
    }

    #[tokio::test]
    async fn test_relay_tcp_dial_failure_reports_synack_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (stream, _inbound, mut frames) = detached_stream(3, 2);
        let destination = SocksAddr::from_ip(addr.ip(), addr.port());
        let stats = relay_tcp(stream, &destination, &Resolver::system()).await;
        assert_eq!(stats, RelayStats::default());

        let synack = frames.recv().await.unwrap();
        assert_eq!(synack.cmd, Command::SynAck);
        assert!(!synack.data.is_empty());
        assert_eq!(frames.recv().await.unwrap().cmd, Command::Fin);
    }

    #[tokio::test]
    async fn test_relay_between_tcp_sockets_propagates_fin() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        let (remote, mut remote_peer) = tokio::io::duplex(1024);
        let relay = tokio::spawn(relay_bidirectional(server_side, remote));

        client.write_all(b"abc").await.unwrap();
        client.shutdown().await.unwrap();
        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), remote_peer.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"abc");
        drop(remote_peer);

        let stats = relay.await.unwrap();
        assert_eq!(stats.upload, 3);
    }
}
