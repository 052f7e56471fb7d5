//! Codec for encoding/decoding burrow messages

use crate::messages::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed bincode codec
///
/// Format: [length: u32 big endian][payload: bincode serialized message]
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    /// Maximum message size (1MB)
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    /// Encode a message to bytes
    pub fn encode_message(msg: &Message) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a message from the front of `buf`
    ///
    /// Returns Ok(None) if more data is needed.
    pub fn decode_message(buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let msg_bytes = buf.split_to(length);
        let msg: Message = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::decode_message(src)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = Self::encode_message(&item)?;
        dst.extend_from_slice(&encoded);
        Ok(())
    }
}

/// Read exactly one message without buffering past its end
///
/// Used on work streams, where the bytes following the handshake belong to the
/// proxied connection. Returns Ok(None) on a clean EOF before the length prefix.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > MessageCodec::MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Some(bincode::deserialize(&payload)?))
}

/// Write one message and flush
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = MessageCodec::encode_message(msg)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
