/// Session frame definitions
pub mod frame;
/// Frame codec for encoding and decoding
pub mod codec;
/// Destination addresses
pub mod addr;
/// UDP-over-TCP envelope
pub mod uot;

pub use addr::{Host, SocksAddr};
pub use codec::*;
pub use frame::*;
pub use uot::{DatagramCodec, UotRequest};
