//! Common test utilities and helpers

#![allow(dead_code)]

use anytls_node::padding::PaddingFactory;
use anytls_node::panel::{DirectorySource, PanelUser, ReportingSink, TrafficRecord};
use anytls_node::protocol::addr::SOCKS_FAMILIES;
use anytls_node::protocol::{Command, Frame, FrameCodec, SocksAddr};
use anytls_node::server::{Admitter, Fallback, Server, ServerIdentity};
use anytls_node::util::{
    AnyTlsError, Resolver, create_insecure_client_config, create_server_config, fingerprint,
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::codec::{Encoder, FramedRead};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// A node serving on an ephemeral localhost port
pub struct TestNode {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn start_node(identity: ServerIdentity, fallback: Fallback) -> anyhow::Result<TestNode> {
    let admitter = Admitter::new(
        create_server_config()?,
        Arc::new(identity),
        Arc::new(PaddingFactory::default()),
        Arc::new(Resolver::system()),
    )
    .with_fallback(fallback);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = Server::new(admitter);
    let task = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            tracing::error!("[Test] Server error: {}", e);
        }
    });
    Ok(TestNode { addr, task })
}

pub async fn tls_connect(addr: SocketAddr) -> anyhow::Result<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(create_insecure_client_config()?);
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from("localhost")?;
    Ok(connector.connect(name, tcp).await?)
}

/// `[fingerprint][padding len][padding]` followed by `frames`
pub fn first_packet(secret: &str, padding_len: u16, frames: &[Frame]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&fingerprint(secret));
    buf.extend_from_slice(&padding_len.to_be_bytes());
    buf.extend_from_slice(&vec![0u8; padding_len as usize]);
    for frame in frames {
        FrameCodec.encode(frame.clone(), &mut buf).unwrap();
    }
    buf.to_vec()
}

pub fn settings_frame() -> Frame {
    let md5 = PaddingFactory::default().md5().to_string();
    Frame::with_data(
        Command::Settings,
        0,
        format!("v=2\nclient=anytls-test/0.1\npadding-md5={}", md5).into_bytes(),
    )
}

/// Hand-rolled AnyTLS client speaking raw frames
pub struct TestClient {
    frames: FramedRead<ReadHalf<TlsStream<TcpStream>>, FrameCodec>,
    writer: WriteHalf<TlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect, authenticate and announce v2 settings in one burst
    pub async fn connect(addr: SocketAddr, secret: &str) -> anyhow::Result<Self> {
        let mut tls = tls_connect(addr).await?;
        tls.write_all(&first_packet(secret, 24, &[settings_frame()]))
            .await?;
        let (reader, writer) = tokio::io::split(tls);
        let mut client = Self {
            frames: FramedRead::new(reader, FrameCodec),
            writer,
        };
        let reply = client.next_frame().await.ok_or_else(|| anyhow::anyhow!("no settings reply"))?;
        anyhow::ensure!(reply.cmd == Command::ServerSettings, "got {:?}", reply.cmd);
        Ok(client)
    }

    pub async fn send(&mut self, frame: Frame) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf)?;
        self.writer.write_all(&buf).await?;
        Ok(())
    }

    /// Open stream `id` to `destination`, sending `payload` with the header
    pub async fn open_stream(
        &mut self,
        id: u32,
        destination: &SocksAddr,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let mut data = BytesMut::new();
        destination.encode(&mut data, SOCKS_FAMILIES);
        data.extend_from_slice(payload);
        self.send(Frame::control(Command::Syn, id)).await?;
        self.send(Frame::push(id, data.freeze())).await
    }

    pub async fn push(&mut self, id: u32, payload: &[u8]) -> anyhow::Result<()> {
        self.send(Frame::push(id, Bytes::copy_from_slice(payload)))
            .await
    }

    pub async fn fin(&mut self, id: u32) -> anyhow::Result<()> {
        self.send(Frame::control(Command::Fin, id)).await
    }

    /// Next frame, `None` on EOF, error or timeout
    pub async fn next_frame(&mut self) -> Option<Frame> {
        match timeout(STEP_TIMEOUT, self.frames.next()).await {
            Ok(Some(Ok(frame))) => Some(frame),
            _ => None,
        }
    }

    /// Wait for the SynAck of stream `id`, skipping frames of other streams
    pub async fn expect_synack(&mut self, id: u32) -> anyhow::Result<Bytes> {
        while let Some(frame) = self.next_frame().await {
            if frame.cmd == Command::SynAck && frame.stream_id == id {
                return Ok(frame.data);
            }
        }
        anyhow::bail!("no SynAck for stream {}", id)
    }

    /// Collect pushed bytes on `id` until `want` bytes arrived or the server sent Fin
    pub async fn read_stream(&mut self, id: u32, want: usize) -> Vec<u8> {
        let mut data = Vec::new();
        while data.len() < want {
            let Some(frame) = self.next_frame().await else {
                break;
            };
            if frame.stream_id != id {
                continue;
            }
            match frame.cmd {
                Command::Push => data.extend_from_slice(&frame.data),
                Command::Fin => break,
                _ => {}
            }
        }
        data
    }

    /// Skip frames until the server's Fin on `id`
    pub async fn expect_fin(&mut self, id: u32) -> bool {
        while let Some(frame) = self.next_frame().await {
            if frame.cmd == Command::Fin && frame.stream_id == id {
                return true;
            }
        }
        false
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// TCP server echoing each connection until it half-closes
pub async fn tcp_echo_server() -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    Ok(addr)
}

pub async fn udp_echo_server() -> anyhow::Result<SocketAddr> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let addr = socket.local_addr()?;
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    Ok(addr)
}

pub fn local_dest(addr: SocketAddr) -> SocksAddr {
    SocksAddr::from_ip(addr.ip(), addr.port())
}

/// Directory source serving a replaceable user list
#[derive(Default)]
pub struct StaticSource {
    users: Mutex<Vec<PanelUser>>,
}

impl StaticSource {
    pub fn new(users: &[(u64, &str)]) -> Arc<Self> {
        let source = Arc::new(Self::default());
        source.set(users);
        source
    }

    pub fn set(&self, users: &[(u64, &str)]) {
        *self.users.lock() = users
            .iter()
            .map(|&(id, uuid)| PanelUser {
                id,
                uuid: uuid.to_string(),
                speed_limit: None,
            })
            .collect();
    }
}

impl DirectorySource for StaticSource {
    fn fetch_users(&self) -> BoxFuture<'_, anytls_node::Result<Vec<PanelUser>>> {
        let users = self.users.lock().clone();
        Box::pin(async move { Ok(users) })
    }
}

/// Reporting sink that keeps every submitted record
#[derive(Default)]
pub struct CollectingSink {
    pub records: Mutex<Vec<TrafficRecord>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl ReportingSink for CollectingSink {
    fn submit(&self, records: Vec<TrafficRecord>) -> BoxFuture<'_, anytls_node::Result<()>> {
        Box::pin(async move {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(AnyTlsError::ReportingSink("panel returned 500".into()));
            }
            self.records.lock().extend(records);
            Ok(())
        })
    }
}
