#[allow(clippy::module_inception)]
pub mod session;
pub mod stream;

pub use session::{Session, StreamHandler};
pub use stream::Stream;
