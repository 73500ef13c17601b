//! UDP over TCP proxy
//!
//! Implements sing-box udp-over-tcp v2. The stream starts with a
//! [`UotRequest`]; every datagram after it is length-prefixed (and, in
//! packet mode, address-prefixed). Datagrams are forwarded to one fixed
//! destination through a connected UDP socket, so only replies from that
//! destination come back.
//!
//! Reference: <https://github.com/SagerNet/sing-box/blob/dev-next/docs/configuration/shared/udp-over-tcp.md>

use crate::protocol::{DatagramCodec, UotRequest};
use crate::server::relay::{RelayStats, relay_bidirectional};
use crate::session::Stream;
use crate::util::Resolver;
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll, Waker, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{Instrument, debug, field, info_span};

/// Handle a stream addressed to the UoT marker domain.
///
/// Returns zero counts: datagram payload is not charged to users.
pub async fn relay_uot(mut stream: Stream, resolver: &Resolver) -> RelayStats {
    let span = info_span!(
        "anytls.udp.proxy",
        stream_id = stream.id(),
        local_udp = field::Empty,
        target = field::Empty,
        bytes_in = field::Empty,
        bytes_out = field::Empty
    );

    async move {
        let request = match UotRequest::read_from(&mut stream).await {
            Ok(request) => request,
            Err(e) => {
                debug!("[UDP] Failed to read UoT request: {}", e);
                stream.close();
                return;
            }
        };
        let target = &request.destination;
        tracing::Span::current().record("target", field::display(target));

        let socket = match open_udp_socket(target.host_str(), target.port, resolver).await {
            Ok(socket) => socket,
            Err(e) => {
                debug!("[UDP] {}", e);
                stream.report_handshake_failure(&e);
                return;
            }
        };
        if let Ok(local) = socket.local_addr() {
            tracing::Span::current().record("local_udp", field::display(local));
        }

        stream.report_handshake_success();
        debug!(
            "[UDP] Relaying to {} (connect={})",
            target, request.is_connect
        );

        let stats = relay_bidirectional(
            UotStream::new(stream, request.codec()),
            UdpChannel::new(socket),
        )
        .await;
        let span = tracing::Span::current();
        span.record("bytes_out", stats.upload);
        span.record("bytes_in", stats.download);
        debug!(
            "[UDP] {} closed (sent={}, received={})",
            target, stats.upload, stats.download
        );
    }
    .instrument(span)
    .await;

    RelayStats::default()
}

async fn open_udp_socket(
    host: String,
    port: u16,
    resolver: &Resolver,
) -> std::result::Result<UdpSocket, String> {
    let target = resolver
        .resolve(&host, port)
        .await
        .map_err(|e| format!("Failed to resolve UDP target {}:{}: {}", host, port, e))?;

    let bind: SocketAddr = if target.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| format!("Failed to bind UDP socket: {}", e))?;
    socket
        .connect(target)
        .await
        .map_err(|e| format!("Failed to connect UDP socket to {}: {}", target, e))?;
    Ok(socket)
}

/// Byte-stream view of the datagrams carried on a UoT stream.
///
/// Each read returns payload from one datagram; each write is sent as one
/// datagram.
pub struct UotStream<S> {
    inner: S,
    codec: DatagramCodec,
    read_buf: BytesMut,
    // tail of a datagram larger than the caller's buffer
    pending: Bytes,
    write_buf: BytesMut,
}

impl<S> UotStream<S> {
    pub fn new(inner: S, codec: DatagramCodec) -> Self {
        Self {
            inner,
            codec,
            read_buf: BytesMut::with_capacity(8 * 1024),
            pending: Bytes::new(),
            write_buf: BytesMut::new(),
        }
    }
}

impl<S: AsyncWrite + Unpin> UotStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for UotStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match this.codec.decode(&mut this.read_buf) {
                Ok(Some(payload)) => {
                    // empty datagrams would read as EOF
                    this.pending = payload;
                    continue;
                }
                Ok(None) => {}
                Err(e) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, e))),
            }

            this.read_buf.reserve(8 * 1024);
            let n = ready!(tokio_util::io::poll_read_buf(
                Pin::new(&mut this.inner),
                cx,
                &mut this.read_buf
            ))?;
            if n == 0 {
                if !this.read_buf.is_empty() {
                    debug!("[UDP] Dropping {} bytes of truncated datagram", this.read_buf.len());
                }
                return Poll::Ready(Ok(()));
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for UotStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        this.codec
            .encode(buf, &mut this.write_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// A connected UDP socket as a byte stream: one write is one datagram.
///
/// Shutting down the write side also ends the read side, since UDP has no
/// EOF of its own.
pub struct UdpChannel {
    socket: UdpSocket,
    closed: bool,
    read_waker: Option<Waker>,
}

impl UdpChannel {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            closed: false,
            read_waker: None,
        }
    }
}

impl AsyncRead for UdpChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.closed {
                return Poll::Ready(Ok(()));
            }
            let before = buf.filled().len();
            match this.socket.poll_recv(cx, buf) {
                Poll::Ready(Ok(())) if buf.filled().len() == before => continue,
                Poll::Ready(result) => return Poll::Ready(result),
                Poll::Pending => {
                    this.read_waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            }
        }
    }
}

impl AsyncWrite for UdpChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.closed = true;
        if let Some(waker) = this.read_waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(()))
    }
}
