//! Codec for relay frames
//!
//! One WebSocket binary message carries one or more frames. Frames are never
//! split across messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const TAG_CONNECT_SUCCESS_SID: u16 = 0x0001;
pub const TAG_RECONNECT_SUCCESS_ACK: u16 = 0x0002;
pub const TAG_DATA: u16 = 0x0004;
pub const TAG_ACK: u16 = 0x0007;
pub const TAG_FIN: u16 = 0x0008;

/// Largest payload a single DATA frame may carry
pub const MAX_DATA_FRAME_SIZE: usize = 16 * 1024;

/// Largest session id accepted in CONNECT_SUCCESS_SID
const MAX_SID_LEN: usize = 1024;

/// Codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unknown frame tag: {0:#06x}")]
    UnknownTag(u16),

    #[error("Frame with tag {tag:#06x} too large: {len} bytes")]
    FrameTooLarge { tag: u16, len: usize },

    #[error("Session id is not valid UTF-8")]
    InvalidSid,

    #[error("Truncated frame: {0} trailing bytes")]
    Truncated(usize),
}

/// A relay protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// First frame of a new session, carries the relay-assigned session id
    ConnectSuccessSid(String),
    /// First frame after a reconnect, carries how many bytes the peer has received
    ReconnectSuccessAck(u64),
    /// Application payload
    Data(Bytes),
    /// Total number of payload bytes received so far
    Ack(u64),
    /// The sender will send no more data
    Fin,
}

impl Frame {
    pub fn tag(&self) -> u16 {
        match self {
            Frame::ConnectSuccessSid(_) => TAG_CONNECT_SUCCESS_SID,
            Frame::ReconnectSuccessAck(_) => TAG_RECONNECT_SUCCESS_ACK,
            Frame::Data(_) => TAG_DATA,
            Frame::Ack(_) => TAG_ACK,
            Frame::Fin => TAG_FIN,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Frame::ConnectSuccessSid(sid) => 2 + 4 + sid.len(),
            Frame::Data(data) => 2 + 4 + data.len(),
            Frame::ReconnectSuccessAck(_) | Frame::Ack(_) => 2 + 8,
            Frame::Fin => 2,
        }
    }
}

/// Relay frame codec
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a single frame into a buffer ready to be sent as one message
    pub fn encode(frame: &Frame) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        Self::encode_into(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Append a frame to `dst`
    pub fn encode_into(frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.reserve(frame.encoded_len());
        dst.put_u16(frame.tag());

        match frame {
            Frame::ConnectSuccessSid(sid) => {
                if sid.len() > MAX_SID_LEN {
                    return Err(CodecError::FrameTooLarge {
                        tag: TAG_CONNECT_SUCCESS_SID,
                        len: sid.len(),
                    });
                }
                dst.put_u32(sid.len() as u32);
                dst.put_slice(sid.as_bytes());
            }
            Frame::Data(data) => {
                if data.len() > MAX_DATA_FRAME_SIZE {
                    return Err(CodecError::FrameTooLarge {
                        tag: TAG_DATA,
                        len: data.len(),
                    });
                }
                dst.put_u32(data.len() as u32);
                dst.put_slice(data);
            }
            Frame::ReconnectSuccessAck(ack) | Frame::Ack(ack) => dst.put_u64(*ack),
            Frame::Fin => {}
        }

        Ok(())
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let tag = u16::from_be_bytes([buf[0], buf[1]]);
        match tag {
            TAG_CONNECT_SUCCESS_SID | TAG_DATA => {
                if buf.len() < 6 {
                    return Ok(None);
                }
                let len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
                let max = if tag == TAG_DATA {
                    MAX_DATA_FRAME_SIZE
                } else {
                    MAX_SID_LEN
                };
                if len > max {
                    return Err(CodecError::FrameTooLarge { tag, len });
                }
                if buf.len() < 6 + len {
                    return Ok(None);
                }

                buf.advance(6);
                let body = buf.split_to(len).freeze();

                if tag == TAG_DATA {
                    Ok(Some(Frame::Data(body)))
                } else {
                    let sid = String::from_utf8(body.to_vec()).map_err(|_| CodecError::InvalidSid)?;
                    Ok(Some(Frame::ConnectSuccessSid(sid)))
                }
            }
            TAG_RECONNECT_SUCCESS_ACK | TAG_ACK => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                buf.advance(2);
                let ack = buf.get_u64();
                if tag == TAG_ACK {
                    Ok(Some(Frame::Ack(ack)))
                } else {
                    Ok(Some(Frame::ReconnectSuccessAck(ack)))
                }
            }
            TAG_FIN => {
                buf.advance(2);
                Ok(Some(Frame::Fin))
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }

    /// Decode every frame of one WebSocket message
    ///
    /// Trailing bytes that do not form a complete frame are an error, since
    /// frames never span messages.
    pub fn decode_message(data: &[u8]) -> Result<Vec<Frame>, CodecError> {
        let mut buf = BytesMut::from(data);
        let mut frames = Vec::new();

        while let Some(frame) = Self::decode(&mut buf)? {
            frames.push(frame);
        }

        if !buf.is_empty() {
            return Err(CodecError::Truncated(buf.len()));
        }

        Ok(frames)
    }
}
