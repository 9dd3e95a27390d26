//! HTTP/2 frame layer: the 9-byte frame header, incremental decoding, and
//! serialization of the frame types the server emits.

use super::Http2Error;

/// Connection preface every cleartext HTTP/2 client sends first.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame types (RFC 7540 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
    Unknown = 0xFF,
}

impl FrameType {
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::Goaway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            _ => Self::Unknown,
        }
    }
}

/// Frame flags. Several share bit values across frame types.
pub mod flags {
    /// SETTINGS / PING acknowledgement.
    pub const ACK: u8 = 0x1;
    /// DATA / HEADERS: no more frames on this stream from the sender.
    pub const END_STREAM: u8 = 0x1;
    /// HEADERS / PUSH_PROMISE: header block is complete.
    pub const END_HEADERS: u8 = 0x4;
    /// DATA / HEADERS / PUSH_PROMISE: payload carries a pad-length prefix.
    pub const PADDED: u8 = 0x8;
    /// HEADERS: payload starts with priority information.
    pub const PRIORITY: u8 = 0x20;
}

/// SETTINGS parameter identifiers (RFC 7540 §6.5.2).
pub mod settings {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// The fixed 9-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// 24-bit payload length.
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    /// 31-bit stream identifier; the reserved bit is always masked off.
    pub stream_id: u32,
}

impl FrameHeader {
    pub const LEN: usize = 9;

    #[must_use]
    pub fn parse(bytes: &[u8; Self::LEN]) -> Self {
        let length =
            (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2]);
        let stream_id =
            u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & 0x7FFF_FFFF;
        Self {
            length,
            frame_type: bytes[3],
            flags: bytes[4],
            stream_id,
        }
    }

    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        FrameType::from_u8(self.frame_type)
    }

    #[must_use]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// A complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

/// Incremental frame decoder over a growing byte buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Append raw bytes from the transport.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete frame, if one is buffered.
    pub fn next_frame(&mut self, max_frame_size: u32) -> Result<Option<Frame>, Http2Error> {
        if self.buffer.len() < FrameHeader::LEN {
            return Ok(None);
        }

        let mut header_bytes = [0u8; FrameHeader::LEN];
        header_bytes.copy_from_slice(&self.buffer[..FrameHeader::LEN]);
        let header = FrameHeader::parse(&header_bytes);

        if header.length > max_frame_size {
            return Err(Http2Error::Protocol("frame exceeds max_frame_size"));
        }

        let total = FrameHeader::LEN + header.length as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let payload = self.buffer[FrameHeader::LEN..total].to_vec();
        self.buffer.drain(..total);
        Ok(Some(Frame { header, payload }))
    }
}

/// Serialize one frame.
pub fn encode_frame(
    frame_type: FrameType,
    flags: u8,
    stream_id: u32,
    payload: &[u8],
) -> Result<Vec<u8>, Http2Error> {
    if stream_id & 0x8000_0000 != 0 {
        return Err(Http2Error::Protocol("reserved bit set in stream id"));
    }
    let length = u32::try_from(payload.len())
        .map_err(|_| Http2Error::Protocol("payload exceeds 24-bit length"))?;
    if length > 0x00FF_FFFF {
        return Err(Http2Error::Protocol("payload exceeds 24-bit length"));
    }

    let mut out = Vec::with_capacity(FrameHeader::LEN + payload.len());
    out.push(((length >> 16) & 0xFF) as u8);
    out.push(((length >> 8) & 0xFF) as u8);
    out.push((length & 0xFF) as u8);
    out.push(frame_type as u8);
    out.push(flags);
    out.extend_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Parse a SETTINGS payload into (identifier, value) pairs.
pub fn parse_settings(payload: &[u8]) -> Result<Vec<(u16, u32)>, Http2Error> {
    if payload.len() % 6 != 0 {
        return Err(Http2Error::Protocol("SETTINGS payload not a multiple of 6"));
    }
    Ok(payload
        .chunks_exact(6)
        .map(|chunk| {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
            (id, value)
        })
        .collect())
}

/// Serialize SETTINGS entries.
#[must_use]
pub fn encode_settings(entries: &[(u16, u32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * 6);
    for (id, value) in entries {
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&value.to_be_bytes());
    }
    out
}
