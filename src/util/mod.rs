/// Error types and Result alias
pub mod error;
/// Credential fingerprints
pub mod auth;
pub mod tls;
pub mod net;
pub mod dns;
pub mod prefixed;
pub mod task;
/// `key=value` settings maps
pub mod string_map;

pub use auth::*;
pub use dns::Resolver;
pub use error::*;
pub use prefixed::PrefixedStream;
pub use string_map::*;
pub use task::spawn_supervised;
pub use tls::*;
