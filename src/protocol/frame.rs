use bytes::Bytes;

/// Frame header size: 1 (cmd) + 4 (stream_id) + 2 (data_len) = 7 bytes
pub const HEADER_OVERHEAD_SIZE: usize = 7;

/// Largest payload one frame can carry
pub const MAX_FRAME_DATA: usize = u16::MAX as usize;

/// Session command byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Waste = 0,
    Syn = 1,
    Push = 2,
    Fin = 3,
    Settings = 4,
    Alert = 5,
    UpdatePaddingScheme = 6,
    // protocol version 2
    SynAck = 7,
    HeartRequest = 8,
    HeartResponse = 9,
    ServerSettings = 10,
}

impl From<u8> for Command {
    /// Unknown command bytes decode as `Waste` and are dropped by the session.
    fn from(value: u8) -> Self {
        match value {
            1 => Command::Syn,
            2 => Command::Push,
            3 => Command::Fin,
            4 => Command::Settings,
            5 => Command::Alert,
            6 => Command::UpdatePaddingScheme,
            7 => Command::SynAck,
            8 => Command::HeartRequest,
            9 => Command::HeartResponse,
            10 => Command::ServerSettings,
            _ => Command::Waste,
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> Self {
        cmd as u8
    }
}

/// One multiplexed unit on the session connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: Command,
    pub stream_id: u32,
    pub data: Bytes,
}

impl Frame {
    /// Frame without payload
    pub fn control(cmd: Command, stream_id: u32) -> Self {
        Self {
            cmd,
            stream_id,
            data: Bytes::new(),
        }
    }

    pub fn with_data(cmd: Command, stream_id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            cmd,
            stream_id,
            data: data.into(),
        }
    }

    /// Push frame carrying stream payload
    pub fn push(stream_id: u32, data: Bytes) -> Self {
        Self::with_data(Command::Push, stream_id, data)
    }
}
