//! Server side of the node: admission, per-stream proxying, listener

pub mod admitter;
pub mod fallback;
pub mod handler;
pub mod identity;
pub mod relay;
pub mod server;
pub mod udp_proxy;

pub use admitter::{AdmissionState, Admitter};
pub use fallback::Fallback;
pub use handler::ProxyHandler;
pub use identity::{STATIC_USER_ID, ServerIdentity};
pub use relay::RelayStats;
pub use server::Server;
