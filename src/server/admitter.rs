//! Admission of one inbound connection.
//!
//! ```text
//! Handshaking -> AuthPending -> Authenticated -> Relaying -> Closed
//!                     |               |
//!                     +---------------+-> FallbackClosed
//! ```
//!
//! After the TLS handshake the first read must carry
//! `[fingerprint (32)][padding length u16][padding]`; whatever follows in
//! that read is the start of the session's frame stream.

use crate::padding::PaddingFactory;
use crate::panel::UserId;
use crate::server::fallback::Fallback;
use crate::server::handler::ProxyHandler;
use crate::server::identity::ServerIdentity;
use crate::session::Session;
use crate::util::{FINGERPRINT_LEN, PrefixedStream, Resolver};
use bytes::{Bytes, BytesMut};
use rustls::ServerConfig;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::{Span, debug, field, trace, warn};

/// Upper bound on the first post-handshake read
pub const FIRST_READ_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    Handshaking,
    AuthPending,
    Authenticated,
    Relaying,
    Closed,
    FallbackClosed,
}

impl AdmissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionState::Handshaking => "handshaking",
            AdmissionState::AuthPending => "auth_pending",
            AdmissionState::Authenticated => "authenticated",
            AdmissionState::Relaying => "relaying",
            AdmissionState::Closed => "closed",
            AdmissionState::FallbackClosed => "fallback_closed",
        }
    }
}

impl fmt::Display for AdmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn enter(state: AdmissionState) -> AdmissionState {
    trace!("[Admit] -> {}", state);
    Span::current().record("state", field::display(state));
    state
}

/// Takes raw connections from TLS handshake to a running session
pub struct Admitter {
    acceptor: TlsAcceptor,
    identity: Arc<ServerIdentity>,
    padding: Arc<PaddingFactory>,
    resolver: Arc<Resolver>,
    fallback: Fallback,
}

impl Admitter {
    pub fn new(
        tls_config: Arc<ServerConfig>,
        identity: Arc<ServerIdentity>,
        padding: Arc<PaddingFactory>,
        resolver: Arc<Resolver>,
    ) -> Self {
        Self {
            acceptor: TlsAcceptor::from(tls_config),
            identity,
            padding,
            resolver,
            fallback: Fallback::Close,
        }
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn identity(&self) -> &Arc<ServerIdentity> {
        &self.identity
    }

    /// Run one connection to completion and return its terminal state
    pub async fn admit<S>(&self, conn: S) -> AdmissionState
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        enter(AdmissionState::Handshaking);
        let mut tls = match self.acceptor.accept(conn).await {
            Ok(tls) => tls,
            Err(e) => {
                debug!("[Admit] TLS handshake failed: {}", e);
                return enter(AdmissionState::Closed);
            }
        };

        enter(AdmissionState::AuthPending);
        let mut burst = BytesMut::with_capacity(FIRST_READ_LIMIT);
        match tls.read_buf(&mut burst).await {
            Ok(0) => {
                debug!("[Admit] Peer closed before authenticating");
                return enter(AdmissionState::FallbackClosed);
            }
            Ok(_) => {}
            Err(e) => {
                debug!("[Admit] First read failed: {}", e);
                return enter(AdmissionState::FallbackClosed);
            }
        }
        let burst = burst.freeze();

        let Some(user_id) = self.authenticate(&burst) else {
            self.fallback.handle(burst, tls).await;
            return enter(AdmissionState::FallbackClosed);
        };
        enter(AdmissionState::Authenticated);
        Span::current().record("user_id", user_id);

        let Some(frames_start) = skip_padding(&burst) else {
            debug!("[Admit] Truncated padding in first packet");
            self.fallback.handle(burst, tls).await;
            return enter(AdmissionState::FallbackClosed);
        };

        enter(AdmissionState::Relaying);
        let handler = Arc::new(ProxyHandler::new(
            Arc::clone(&self.identity),
            user_id,
            Arc::clone(&self.resolver),
        ));
        let session = Session::new_server(
            PrefixedStream::new(burst.slice(frames_start..), tls),
            handler,
            Arc::clone(&self.padding),
        );
        match session.run().await {
            Ok(()) => debug!("[Admit] Session ended"),
            Err(e) if e.is_disconnect() => debug!("[Admit] Session ended: {}", e),
            Err(e) => warn!("[Admit] Session error: {}", e),
        }
        enter(AdmissionState::Closed)
    }

    fn authenticate(&self, burst: &Bytes) -> Option<UserId> {
        if burst.len() < FINGERPRINT_LEN {
            debug!("[Admit] First packet too short ({} bytes)", burst.len());
            return None;
        }
        let user_id = self.identity.authenticate(&burst[..FINGERPRINT_LEN]);
        if user_id.is_none() {
            debug!("[Admit] Unknown fingerprint");
        }
        user_id
    }
}

/// Offset of the first frame byte, or `None` if the padding runs past the read
fn skip_padding(burst: &[u8]) -> Option<usize> {
    let len_at = FINGERPRINT_LEN;
    let header = burst.get(len_at..len_at + 2)?;
    let padding_len = u16::from_be_bytes([header[0], header[1]]) as usize;
    let end = len_at + 2 + padding_len;
    (burst.len() >= end).then_some(end)
}
