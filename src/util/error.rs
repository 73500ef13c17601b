use thiserror::Error;

/// Node errors
#[derive(Error, Debug)]
pub enum AnyTlsError {
    /// Accept/dial/read/write failure on a socket or stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    /// Fingerprint absent or mismatched
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Malformed first packet, stream header or frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// User list / node config could not be fetched from the panel
    #[error("Directory source error: {0}")]
    DirectorySource(String),

    /// Traffic push to the panel failed
    #[error("Reporting sink error: {0}")]
    ReportingSink(String),

    /// Unexpected fault caught at a task boundary
    #[error("Internal fault: {0}")]
    InternalFault(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Padding scheme error: {0}")]
    PaddingScheme(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AnyTlsError>;

impl AnyTlsError {
    /// Whether this error is an ordinary peer disconnect rather than a fault.
    ///
    /// Many clients drop the TCP connection without sending TLS close_notify,
    /// which rustls reports as an unexpected EOF.
    pub fn is_disconnect(&self) -> bool {
        match self {
            AnyTlsError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            AnyTlsError::SessionClosed => true,
            _ => false,
        }
    }
}
