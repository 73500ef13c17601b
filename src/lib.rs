//! AnyTLS proxy node
//!
//! Accepts AnyTLS clients over TLS, authenticates them against a static
//! password or a V2board panel's user list, relays their TCP and UDP-over-TCP
//! streams, and reports per-user traffic back to the panel.
//!
//! # Architecture
//!
//! - **protocol**: Frame codec, stream headers, UoT envelope
//! - **session**: Server-side session and stream multiplexing
//! - **padding**: Padding scheme announced to clients
//! - **panel**: Panel client, credential directory, traffic accounting
//! - **server**: Admission, per-stream proxying, listener
//! - **util**: Errors, fingerprints, TLS, DNS, sockets

/// Command-line configuration
pub mod config;
/// Padding scheme parsing
pub mod padding;
/// V2board panel integration
pub mod panel;
/// Protocol layer: frames, addresses, UoT
pub mod protocol;
/// Server implementation
pub mod server;
/// Session layer: session and stream management
pub mod session;
/// Utility modules (error, auth, TLS, etc.)
pub mod util;

pub use padding::PaddingFactory;
pub use server::{Admitter, Fallback, Server, ServerIdentity};
pub use util::error::{AnyTlsError, Result};
