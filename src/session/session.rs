//! Server side of the AnyTLS multiplexed session

use crate::padding::PaddingFactory;
use crate::protocol::{Command, Frame, FrameCodec};
use crate::session::Stream;
use crate::util::{AnyTlsError, Result, StringMap, spawn_supervised};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Callback invoked once per stream the client opens
pub trait StreamHandler: Send + Sync + 'static {
    fn handle_stream(&self, stream: Stream) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// State reachable from both the session and its streams
pub(crate) struct SessionShared {
    frames_tx: mpsc::UnboundedSender<Frame>,
    streams: Mutex<HashMap<u32, mpsc::UnboundedSender<Bytes>>>,
    peer_version: AtomicU8,
    cancel: CancellationToken,
}

impl SessionShared {
    fn new(frames_tx: mpsc::UnboundedSender<Frame>, peer_version: u8) -> Self {
        Self {
            frames_tx,
            streams: Mutex::new(HashMap::new()),
            peer_version: AtomicU8::new(peer_version),
            cancel: CancellationToken::new(),
        }
    }

    /// Queue a frame for the writer. False once the session is closed.
    pub(crate) fn send_frame(&self, frame: Frame) -> bool {
        !self.cancel.is_cancelled() && self.frames_tx.send(frame).is_ok()
    }

    pub(crate) fn peer_version(&self) -> u8 {
        self.peer_version.load(Ordering::Relaxed)
    }

    /// Local side of `id` closed: drop its inbound queue and tell the peer.
    pub(crate) fn stream_closed(&self, id: u32) {
        self.streams.lock().remove(&id);
        self.send_frame(Frame::control(Command::Fin, id));
    }

    /// Refuse further frames and end every stream's read side
    pub(crate) fn close(&self) {
        self.cancel.cancel();
        self.streams.lock().clear();
    }
}

#[cfg(test)]
impl SessionShared {
    /// Shared state with no connection behind it; frames land in the receiver.
    pub(crate) fn detached(peer_version: u8) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(frames_tx, peer_version)), frames_rx)
    }
}

/// Multiplexes client streams over one connection.
///
/// Created per authenticated connection; [`Session::run`] drives it until
/// the connection ends or [`Session::close`] is called.
pub struct Session {
    shared: Arc<SessionShared>,
    io: Mutex<Option<(BoxedReader, BoxedWriter, mpsc::UnboundedReceiver<Frame>)>>,
    handler: Arc<dyn StreamHandler>,
    padding: Arc<PaddingFactory>,
}

impl Session {
    pub fn new_server<C>(
        conn: C,
        handler: Arc<dyn StreamHandler>,
        padding: Arc<PaddingFactory>,
    ) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(conn);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(SessionShared::new(frames_tx, 0)),
            io: Mutex::new(Some((Box::new(reader), Box::new(writer), frames_rx))),
            handler,
            padding,
        }
    }

    /// Stop the session: the writer shuts the connection down, every
    /// stream sees EOF and stream writes fail from here on.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Process frames until the peer disconnects, sends an alert, violates
    /// the protocol, or the session is closed.
    pub async fn run(&self) -> Result<()> {
        let Some((reader, writer, frames_rx)) = self.io.lock().take() else {
            return Err(AnyTlsError::SessionClosed);
        };

        let writer_task = tokio::spawn(write_loop(writer, frames_rx, self.shared.cancel.clone()));
        let result = self.recv_loop(reader).await;

        self.close();
        match writer_task.await {
            Ok(Err(e)) => tracing::debug!("[Session] Writer ended with error: {}", e),
            Err(e) => tracing::error!("[Session] Writer task failed: {}", e),
            Ok(Ok(())) => {}
        }
        result
    }

    async fn recv_loop(&self, reader: BoxedReader) -> Result<()> {
        let mut frames = FramedRead::new(reader, FrameCodec);
        let mut received_settings = false;

        loop {
            let frame = tokio::select! {
                _ = self.shared.cancel.cancelled() => return Ok(()),
                next = frames.next() => match next {
                    Some(frame) => frame?,
                    None => {
                        tracing::debug!("[Session] Connection closed by peer");
                        return Ok(());
                    }
                },
            };

            match frame.cmd {
                Command::Push => {
                    let streams = self.shared.streams.lock();
                    if let Some(tx) = streams.get(&frame.stream_id) {
                        let _ = tx.send(frame.data);
                    }
                }
                Command::Syn => {
                    if !received_settings {
                        self.shared.send_frame(Frame::with_data(
                            Command::Alert,
                            0,
                            Bytes::from_static(b"client did not send its settings"),
                        ));
                        return Err(AnyTlsError::Protocol(
                            "client did not send its settings".into(),
                        ));
                    }
                    self.open_stream(frame.stream_id);
                }
                Command::Fin => {
                    // dropping the sender delivers EOF to the stream reader
                    self.shared.streams.lock().remove(&frame.stream_id);
                }
                Command::Settings => {
                    received_settings = true;
                    self.apply_client_settings(&frame.data);
                }
                Command::Alert => {
                    let message = String::from_utf8_lossy(&frame.data).to_string();
                    tracing::warn!("[Session] Alert from client: {}", message);
                    return Err(AnyTlsError::Protocol(format!("Alert: {}", message)));
                }
                Command::HeartRequest => {
                    self.shared
                        .send_frame(Frame::control(Command::HeartResponse, frame.stream_id));
                }
                Command::Waste
                | Command::HeartResponse
                | Command::ServerSettings
                | Command::SynAck
                | Command::UpdatePaddingScheme => {
                    tracing::trace!(
                        "[Session] Ignoring {:?} (stream_id={})",
                        frame.cmd,
                        frame.stream_id
                    );
                }
            }
        }
    }

    fn open_stream(&self, stream_id: u32) {
        let reader_rx = {
            let mut streams = self.shared.streams.lock();
            if streams.contains_key(&stream_id) {
                return;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            streams.insert(stream_id, tx);
            rx
        };

        tracing::debug!("[Session] Stream {} opened", stream_id);
        let stream = Stream::new(stream_id, reader_rx, Arc::clone(&self.shared));
        let handler = Arc::clone(&self.handler);
        spawn_supervised("stream handler", async move {
            handler.handle_stream(stream).await;
        });
    }

    fn apply_client_settings(&self, data: &[u8]) {
        let settings = StringMap::from_bytes(data);

        if settings.get("padding-md5") != Some(self.padding.md5()) {
            tracing::debug!("[Session] Client padding scheme differs, sending update");
            self.shared.send_frame(Frame::with_data(
                Command::UpdatePaddingScheme,
                0,
                Bytes::copy_from_slice(self.padding.raw_scheme()),
            ));
        }

        if let Some(version) = settings.get_u32("v")
            && version >= 2
        {
            self.shared
                .peer_version
                .store(version.min(u8::MAX as u32) as u8, Ordering::Relaxed);
            let mut server_settings = StringMap::new();
            server_settings.insert("v", "2");
            self.shared.send_frame(Frame::with_data(
                Command::ServerSettings,
                0,
                Bytes::from(server_settings.to_bytes()),
            ));
        }
    }
}

/// Drain queued frames onto the connection, then shut it down.
async fn write_loop(
    writer: BoxedWriter,
    mut frames_rx: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut sink = FramedWrite::new(writer, FrameCodec);

    loop {
        let frame = tokio::select! {
            biased;
            frame = frames_rx.recv() => frame,
            _ = cancel.cancelled() => None,
        };
        let Some(frame) = frame else { break };

        sink.feed(frame).await?;
        while let Ok(frame) = frames_rx.try_recv() {
            sink.feed(frame).await?;
        }
        sink.flush().await?;
    }

    // frames queued before the close (alerts, FINs) still go out
    frames_rx.close();
    while let Ok(frame) = frames_rx.try_recv() {
        sink.feed(frame).await?;
    }
    sink.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_util::codec::Encoder;

    struct EchoHandler;

    impl StreamHandler for EchoHandler {
        fn handle_stream(
            &self,
            mut stream: Stream,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                let mut buf = vec![0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        }
    }

    fn start_session() -> (
        Arc<Session>,
        FramedRead<tokio::io::ReadHalf<DuplexStream>, FrameCodec>,
        tokio::io::WriteHalf<DuplexStream>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (server_io, client_io) = tokio::io::duplex(256 * 1024);
        let session = Arc::new(Session::new_server(
            server_io,
            Arc::new(EchoHandler),
            Arc::new(PaddingFactory::default()),
        ));
        let runner = Arc::clone(&session);
        let task = tokio::spawn(async move { runner.run().await });
        let (client_read, client_write) = tokio::io::split(client_io);
        (
            session,
            FramedRead::new(client_read, FrameCodec),
            client_write,
            task,
        )
    }

    async fn send(writer: &mut tokio::io::WriteHalf<DuplexStream>, frame: Frame) {
        let mut buf = bytes::BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        writer.write_all(&buf).await.unwrap();
    }

    fn settings(v: u32, md5: &str) -> Frame {
        Frame::with_data(
            Command::Settings,
            0,
            format!("v={}\nclient=test\npadding-md5={}", v, md5).into_bytes(),
        )
    }

    #[tokio::test]
    async fn test_v2_settings_reply_and_echo() {
        let (_session, mut frames, mut writer, _task) = start_session();
        let md5 = PaddingFactory::default().md5().to_string();

        send(&mut writer, settings(2, &md5)).await;
        let reply = frames.next().await.unwrap().unwrap();
        assert_eq!(reply.cmd, Command::ServerSettings);
        assert_eq!(&reply.data[..], b"v=2");

        send(&mut writer, Frame::control(Command::Syn, 1)).await;
        send(&mut writer, Frame::push(1, Bytes::from_static(b"ping"))).await;
        let echoed = frames.next().await.unwrap().unwrap();
        assert_eq!(echoed, Frame::push(1, Bytes::from_static(b"ping")));

        // client FIN -> handler sees EOF -> server FIN
        send(&mut writer, Frame::control(Command::Fin, 1)).await;
        let fin = frames.next().await.unwrap().unwrap();
        assert_eq!(fin, Frame::control(Command::Fin, 1));
    }

    #[tokio::test]
    async fn test_padding_md5_mismatch_sends_update() {
        let (_session, mut frames, mut writer, _task) = start_session();

        send(&mut writer, settings(1, "0123")).await;
        let update = frames.next().await.unwrap().unwrap();
        assert_eq!(update.cmd, Command::UpdatePaddingScheme);
        assert_eq!(
            &update.data[..],
            PaddingFactory::default().raw_scheme()
        );
    }

    #[tokio::test]
    async fn test_heart_request_answered() {
        let (_session, mut frames, mut writer, _task) = start_session();

        send(&mut writer, Frame::control(Command::HeartRequest, 9)).await;
        let response = frames.next().await.unwrap().unwrap();
        assert_eq!(response, Frame::control(Command::HeartResponse, 9));
    }

    #[tokio::test]
    async fn test_syn_before_settings_alerts_and_closes() {
        let (_session, mut frames, mut writer, task) = start_session();

        send(&mut writer, Frame::control(Command::Syn, 1)).await;
        let alert = frames.next().await.unwrap().unwrap();
        assert_eq!(alert.cmd, Command::Alert);
        assert_eq!(&alert.data[..], b"client did not send its settings");

        assert!(matches!(
            task.await.unwrap(),
            Err(AnyTlsError::Protocol(_))
        ));
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        struct BlobHandler;
        impl StreamHandler for BlobHandler {
            fn handle_stream(
                &self,
                mut stream: Stream,
            ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
                Box::pin(async move {
                    let blob = vec![7u8; 70_000];
                    let _ = stream.write_all(&blob).await;
                })
            }
        }

        let (server_io, client_io) = tokio::io::duplex(256 * 1024);
        let session = Session::new_server(
            server_io,
            Arc::new(BlobHandler),
            Arc::new(PaddingFactory::default()),
        );
        tokio::spawn(async move { session.run().await });
        let (client_read, mut client_write) = tokio::io::split(client_io);
        let mut frames = FramedRead::new(client_read, FrameCodec);

        let md5 = PaddingFactory::default().md5().to_string();
        send(&mut client_write, settings(1, &md5)).await;
        send(&mut client_write, Frame::control(Command::Syn, 3)).await;

        let first = frames.next().await.unwrap().unwrap();
        let second = frames.next().await.unwrap().unwrap();
        assert_eq!(first.data.len(), 65_535);
        assert_eq!(second.data.len(), 70_000 - 65_535);
        let fin = frames.next().await.unwrap().unwrap();
        assert_eq!(fin, Frame::control(Command::Fin, 3));
    }

    #[tokio::test]
    async fn test_close_shuts_down_connection() {
        let (session, mut frames, _writer, task) = start_session();
        session.close();
        assert!(task.await.unwrap().is_ok());
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_writes_after_close_are_refused() {
        struct ParkedHandler(mpsc::UnboundedSender<Stream>);
        impl StreamHandler for ParkedHandler {
            fn handle_stream(
                &self,
                stream: Stream,
            ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
                let _ = self.0.send(stream);
                Box::pin(async {})
            }
        }

        let (parked_tx, mut parked_rx) = mpsc::unbounded_channel();
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let session = Arc::new(Session::new_server(
            server_io,
            Arc::new(ParkedHandler(parked_tx)),
            Arc::new(PaddingFactory::default()),
        ));
        let runner = Arc::clone(&session);
        let task = tokio::spawn(async move { runner.run().await });
        let (client_read, mut client_write) = tokio::io::split(client_io);
        let mut frames = FramedRead::new(client_read, FrameCodec);

        let md5 = PaddingFactory::default().md5().to_string();
        send(&mut client_write, settings(1, &md5)).await;
        send(&mut client_write, Frame::control(Command::Syn, 1)).await;
        let mut stream = parked_rx.recv().await.unwrap();

        session.close();
        let err = stream.write(b"late").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
        drop(stream);

        task.await.unwrap().unwrap();
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let (session, _frames, _writer, task) = start_session();
        tokio::task::yield_now().await;
        session.close();
        task.await.unwrap().unwrap();
        assert!(matches!(
            session.run().await,
            Err(AnyTlsError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_unknown_push_ignored() {
        let (_session, mut frames, mut writer, _task) = start_session();
        send(&mut writer, Frame::push(42, Bytes::from_static(b"orphan"))).await;
        send(&mut writer, Frame::control(Command::HeartRequest, 1)).await;
        let response = frames.next().await.unwrap().unwrap();
        assert_eq!(response.cmd, Command::HeartResponse);
    }
}
