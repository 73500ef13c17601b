//! UDP-over-TCP v2 envelope (sing-box `sp.v2.udp-over-tcp.arpa`)
//!
//! Request, sent once at stream start:
//! ```text
//! | isConnect | Destination (UoT families) |
//! | u8        | variable                   |
//! ```
//!
//! Datagrams, connect mode:
//! ```text
//! | Length | Payload |
//! | u16be  | ...     |
//! ```
//!
//! Datagrams, packet mode (`isConnect = 0`) prefix each one with its address:
//! ```text
//! | Address (UoT families) | Length | Payload |
//! ```

use crate::protocol::addr::{SocksAddr, UOT_FAMILIES};
use crate::util::{AnyTlsError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

/// Largest datagram a length prefix can describe
pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

// family + length + 255-byte domain + port
const MAX_ADDR_LEN: usize = 1 + 1 + 255 + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UotRequest {
    pub is_connect: bool,
    pub destination: SocksAddr,
}

impl UotRequest {
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let is_connect = reader
            .read_u8()
            .await
            .map_err(|e| AnyTlsError::Protocol(format!("Failed to read UoT request: {}", e)))?;
        let destination = SocksAddr::read_from(reader, UOT_FAMILIES).await?;
        Ok(Self {
            is_connect: is_connect != 0,
            destination,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(u8::from(self.is_connect));
        self.destination.encode(dst, UOT_FAMILIES);
    }

    /// Codec for the datagrams that follow this request
    pub fn codec(&self) -> DatagramCodec {
        DatagramCodec::new(self.is_connect, self.destination.clone())
    }
}

/// Frames datagrams on a UoT stream.
///
/// In packet mode the per-datagram address is stripped when decoding and
/// the fixed destination is written when encoding.
#[derive(Debug, Clone)]
pub struct DatagramCodec {
    is_connect: bool,
    destination: SocksAddr,
}

impl DatagramCodec {
    pub fn new(is_connect: bool, destination: SocksAddr) -> Self {
        Self {
            is_connect,
            destination,
        }
    }
}

impl Decoder for DatagramCodec {
    type Item = Bytes;
    type Error = AnyTlsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let addr_len = if self.is_connect {
            0
        } else {
            let mut scratch = BytesMut::from(&src[..src.len().min(MAX_ADDR_LEN)]);
            let before = scratch.len();
            if SocksAddr::decode(&mut scratch, UOT_FAMILIES)?.is_none() {
                return Ok(None);
            }
            before - scratch.len()
        };

        if src.len() < addr_len + 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[addr_len], src[addr_len + 1]]) as usize;
        let total = addr_len + 2 + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(addr_len + 2);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<&[u8]> for DatagramCodec {
    type Error = AnyTlsError;

    fn encode(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        if payload.len() > MAX_DATAGRAM_SIZE {
            return Err(AnyTlsError::Protocol(format!(
                "UDP packet too large: {} bytes",
                payload.len()
            )));
        }
        if !self.is_connect {
            self.destination.encode(dst, UOT_FAMILIES);
        }
        dst.reserve(2 + payload.len());
        dst.put_u16(payload.len() as u16);
        dst.put_slice(payload);
        Ok(())
    }
}
