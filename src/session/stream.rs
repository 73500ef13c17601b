//! One logical stream inside a session.
//!
//! `Stream` implements `AsyncRead` and `AsyncWrite`; reads yield the
//! payload of `Push` frames, writes are chunked into `Push` frames.

use crate::protocol::{Command, Frame, MAX_FRAME_DATA};
use crate::session::session::SessionShared;
use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

pub struct Stream {
    id: u32,
    reader_rx: mpsc::UnboundedReceiver<Bytes>,
    reader_buffer: Bytes,
    shared: Arc<SessionShared>,
    handshake_reported: bool,
    fin_sent: bool,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        reader_rx: mpsc::UnboundedReceiver<Bytes>,
        shared: Arc<SessionShared>,
    ) -> Self {
        Self {
            id,
            reader_rx,
            reader_buffer: Bytes::new(),
            shared,
            handshake_reported: false,
            fin_sent: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Protocol version the client announced in its settings
    pub fn peer_version(&self) -> u8 {
        self.shared.peer_version()
    }

    /// Tell a v2 client that the outbound hop is up. Sent at most once.
    pub fn report_handshake_success(&mut self) {
        if self.take_handshake_report() {
            self.shared
                .send_frame(Frame::control(Command::SynAck, self.id));
        }
    }

    /// Tell a v2 client the outbound hop failed, then close the stream.
    pub fn report_handshake_failure(&mut self, message: &str) {
        if self.take_handshake_report() {
            self.shared.send_frame(Frame::with_data(
                Command::SynAck,
                self.id,
                Bytes::copy_from_slice(message.as_bytes()),
            ));
        }
        self.close();
    }

    fn take_handshake_report(&mut self) -> bool {
        if self.handshake_reported || self.peer_version() < 2 {
            return false;
        }
        self.handshake_reported = true;
        true
    }

    /// Send FIN and end the local read side. Idempotent.
    pub fn close(&mut self) {
        if self.fin_sent {
            return;
        }
        self.fin_sent = true;
        self.reader_rx.close();
        self.shared.stream_closed(self.id);
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.reader_buffer.is_empty() {
                let n = self.reader_buffer.len().min(buf.remaining());
                buf.put_slice(&self.reader_buffer[..n]);
                self.reader_buffer.advance(n);
                return Poll::Ready(Ok(()));
            }

            match self.reader_rx.poll_recv(cx) {
                // empty pushes carry nothing; keep waiting
                Poll::Ready(Some(data)) => self.reader_buffer = data,
                // FIN from the peer, local close, or session gone
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fin_sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed",
            )));
        }

        let n = buf.len().min(MAX_FRAME_DATA);
        let frame = Frame::push(self.id, Bytes::copy_from_slice(&buf[..n]));
        if !self.shared.send_frame(frame) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session closed",
            )));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}
