//! Wire framing for exchange streams.
//!
//! Wire format: `[len: uvarint][type: u8][body: bytes]` where `len` covers
//! type and body.
//!
//! - `WANT`, `CANCEL`, `HAVE`: body is the CID's binary form
//! - `BLOCK`: body is the CID's binary form followed by the block bytes

use std::io::{self, Cursor};

use bytes::Bytes;
use craftblock_core::{BufferPool, Cid, MAX_FRAME_SIZE};
use futures::prelude::*;
use thiserror::Error;

use crate::Message;

// Type discriminants
const TYPE_WANT: u8 = 0x01;
const TYPE_CANCEL: u8 = 0x02;
const TYPE_BLOCK: u8 = 0x03;
const TYPE_HAVE: u8 = 0x04;

/// Longest valid uvarint encoding of a u64.
const MAX_VARINT_LEN: usize = 10;

/// Why a frame body could not be decoded. The stream itself is still in sync.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame type: 0x{0:02x}")]
    UnknownType(u8),
    #[error("invalid CID: {0}")]
    InvalidCid(String),
    #[error("{0} trailing bytes after CID")]
    TrailingBytes(usize),
}

/// Why the next frame could not be read. The stream cannot resync after it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds limit of {limit}")]
    TooLarge { len: u64, limit: usize },
    #[error("length prefix overflows u64")]
    LengthOverflow,
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

pub fn encode_uvarint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Encode `msg` as a complete length-prefixed frame.
pub fn encode_frame(msg: &Message) -> Vec<u8> {
    let (msg_type, cid, data) = match msg {
        Message::Want(cid) => (TYPE_WANT, cid, None),
        Message::Cancel(cid) => (TYPE_CANCEL, cid, None),
        Message::Have(cid) => (TYPE_HAVE, cid, None),
        Message::Block { cid, data } => (TYPE_BLOCK, cid, Some(data)),
    };
    let data: &[u8] = data.map(|d| &d[..]).unwrap_or_default();
    let cid_bytes = cid.to_bytes();
    let body_len = 1 + cid_bytes.len() + data.len();
    let mut frame = Vec::with_capacity(MAX_VARINT_LEN + body_len);
    encode_uvarint(body_len as u64, &mut frame);
    frame.push(msg_type);
    frame.extend_from_slice(&cid_bytes);
    frame.extend_from_slice(data);
    frame
}

/// Decode a frame body (type byte onwards).
pub fn decode_body(body: &[u8]) -> Result<Message, DecodeError> {
    let (&msg_type, rest) = body.split_first().ok_or(DecodeError::Empty)?;
    if !matches!(msg_type, TYPE_WANT | TYPE_CANCEL | TYPE_BLOCK | TYPE_HAVE) {
        return Err(DecodeError::UnknownType(msg_type));
    }
    let mut cursor = Cursor::new(rest);
    let cid = Cid::read_bytes(&mut cursor).map_err(|e| DecodeError::InvalidCid(e.to_string()))?;
    let tail = &rest[cursor.position() as usize..];
    match msg_type {
        TYPE_BLOCK => Ok(Message::Block {
            cid,
            data: Bytes::copy_from_slice(tail),
        }),
        _ if !tail.is_empty() => Err(DecodeError::TrailingBytes(tail.len())),
        TYPE_WANT => Ok(Message::Want(cid)),
        TYPE_CANCEL => Ok(Message::Cancel(cid)),
        _ => Ok(Message::Have(cid)),
    }
}

/// Write one message as a frame and flush.
pub async fn write_message<T: AsyncWrite + Unpin>(io: &mut T, msg: &Message) -> io::Result<()> {
    io.write_all(&encode_frame(msg)).await?;
    io.flush().await
}

/// Read a uvarint, or `None` on a clean EOF before the first byte.
async fn read_uvarint<T: AsyncRead + Unpin>(io: &mut T) -> io::Result<Option<u64>> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        let n = io.read(&mut byte).await?;
        if n == 0 {
            if i == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated length prefix"));
        }
        value |= u64::from(byte[0] & 0x7f) << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(FrameError::LengthOverflow.into())
}

/// Read the next frame body into a pooled buffer.
///
/// Returns `Ok(None)` when the peer closed the stream between frames. The
/// caller hands the buffer back to `pool` once decoded.
pub async fn read_frame<T: AsyncRead + Unpin>(
    io: &mut T,
    pool: &BufferPool,
) -> io::Result<Option<Vec<u8>>> {
    let Some(len) = read_uvarint(io).await? else {
        return Ok(None);
    };
    if len > MAX_FRAME_SIZE as u64 {
        return Err(FrameError::TooLarge {
            len,
            limit: MAX_FRAME_SIZE,
        }
        .into());
    }
    let mut body = pool.get(len as usize);
    io.read_exact(&mut body).await?;
    Ok(Some(body))
}
