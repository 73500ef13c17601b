use crate::protocol::frame::{Command, Frame, HEADER_OVERHEAD_SIZE, MAX_FRAME_DATA};
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Length-prefixed codec for session frames
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_OVERHEAD_SIZE {
            return Ok(None);
        }

        // Peek the header; nothing is consumed until the payload is complete.
        let mut header = &src[..HEADER_OVERHEAD_SIZE];
        let cmd = Command::from(header.get_u8());
        let stream_id = header.get_u32();
        let data_len = header.get_u16() as usize;

        let total_needed = HEADER_OVERHEAD_SIZE + data_len;
        if src.len() < total_needed {
            src.reserve(total_needed - src.len());
            return Ok(None);
        }

        src.advance(HEADER_OVERHEAD_SIZE);
        let data = src.split_to(data_len).freeze();

        tracing::trace!(
            "[FrameCodec] decoded cmd={:?} stream_id={} len={}",
            cmd,
            stream_id,
            data_len
        );

        Ok(Some(Frame {
            cmd,
            stream_id,
            data,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data_len = item.data.len();
        if data_len > MAX_FRAME_DATA {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame payload too large: {} bytes", data_len),
            ));
        }

        dst.reserve(HEADER_OVERHEAD_SIZE + data_len);
        dst.put_u8(item.cmd.into());
        dst.put_u32(item.stream_id);
        dst.put_u16(data_len as u16);
        dst.extend_from_slice(&item.data);

        Ok(())
    }
}
