//! Multiplexing frame format
//!
//! Every frame starts with a fixed 10 byte header:
//! `stream_id: u32 | type: u8 | flags: u8 | length: u32`, all big endian,
//! followed by `length` payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Stream identifier
pub type StreamId = u32;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    /// Payload: u32 credit increment
    WindowUpdate = 1,
    Open = 2,
    /// FIN half-closes, RST aborts
    Close = 3,
    /// Payload: opaque u64 echoed back with ACK
    Ping = 4,
    /// Payload: u32 reason code
    GoAway = 5,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::WindowUpdate),
            2 => Ok(FrameType::Open),
            3 => Ok(FrameType::Close),
            4 => Ok(FrameType::Ping),
            5 => Ok(FrameType::GoAway),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const ACK: u8 = 0b0000_0010;
    pub const RST: u8 = 0b0000_0100;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub length: u32,
}

impl FrameHeader {
    /// stream_id (4) + frame_type (1) + flags (1) + length (4)
    pub const SIZE: usize = 10;

    /// Parse a header from the first `SIZE` bytes of `buf` without consuming them
    pub fn peek(buf: &[u8]) -> Result<Option<Self>, FrameError> {
        if buf.len() < Self::SIZE {
            return Ok(None);
        }

        let stream_id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let frame_type = FrameType::try_from(buf[4])?;
        let flags = FrameFlags::from_u8(buf[5]);
        let length = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);

        if length > crate::MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length as usize));
        }

        Ok(Some(Self {
            stream_id,
            frame_type,
            flags,
            length,
        }))
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn open(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Open, Bytes::new())
    }

    pub fn fin(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new()).with_flags(FrameFlags::new().with_fin())
    }

    pub fn rst(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new()).with_flags(FrameFlags::new().with_rst())
    }

    pub fn window_update(stream_id: StreamId, increment: u32) -> Self {
        Self::new(
            stream_id,
            FrameType::WindowUpdate,
            Bytes::copy_from_slice(&increment.to_be_bytes()),
        )
    }

    pub fn ping(opaque: u64) -> Self {
        Self::new(
            crate::CONTROL_STREAM_ID,
            FrameType::Ping,
            Bytes::copy_from_slice(&opaque.to_be_bytes()),
        )
    }

    pub fn pong(opaque: u64) -> Self {
        Self::ping(opaque).with_flags(FrameFlags::new().with_ack())
    }

    pub fn go_away(code: u32) -> Self {
        Self::new(
            crate::CONTROL_STREAM_ID,
            FrameType::GoAway,
            Bytes::copy_from_slice(&code.to_be_bytes()),
        )
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            stream_id: self.stream_id,
            frame_type: self.frame_type,
            flags: self.flags,
            length: self.payload.len() as u32,
        }
    }

    /// Credit carried by a `WindowUpdate`
    pub fn window_increment(&self) -> Result<u32, FrameError> {
        self.payload_u32()
    }

    /// Opaque value carried by a `Ping`
    pub fn ping_value(&self) -> Result<u64, FrameError> {
        let bytes: [u8; 8] = self
            .payload
            .as_ref()
            .try_into()
            .map_err(|_| FrameError::MalformedPayload(self.frame_type))?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Reason code carried by a `GoAway`
    pub fn go_away_code(&self) -> Result<u32, FrameError> {
        self.payload_u32()
    }

    fn payload_u32(&self) -> Result<u32, FrameError> {
        let bytes: [u8; 4] = self
            .payload
            .as_ref()
            .try_into()
            .map_err(|_| FrameError::MalformedPayload(self.frame_type))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Append the encoded frame to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        dst.reserve(FrameHeader::SIZE + payload_len);
        dst.put_u32(self.stream_id);
        dst.put_u8(self.frame_type as u8);
        dst.put_u8(self.flags.as_u8());
        dst.put_u32(payload_len as u32);
        dst.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns Ok(None) if more data is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        let header = match FrameHeader::peek(&buf[..])? {
            Some(header) => header,
            None => return Ok(None),
        };

        let total = FrameHeader::SIZE + header.length as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(FrameHeader::SIZE);
        let payload = buf.split_to(header.length as usize).freeze();

        Ok(Some(Self {
            stream_id: header.stream_id,
            frame_type: header.frame_type,
            flags: header.flags,
            payload,
        }))
    }
}

/// Frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Malformed {0:?} payload")]
    MalformedPayload(FrameType),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// `tokio_util` codec for mux frames
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Frame::decode(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}
