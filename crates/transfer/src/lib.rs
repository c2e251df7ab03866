//! CraftBlock Transfer
//!
//! Messages exchanged on `/craftblock/exchange/1.0.0` streams and their
//! wire framing.

pub mod errors;
pub mod wire;

use bytes::Bytes;
use craftblock_core::{Block, Cid};

pub use errors::TransferError;
pub use wire::{decode_body, encode_frame, read_frame, write_message, DecodeError, FrameError};

/// One framed exchange message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// The sender wants this block.
    Want(Cid),
    /// The sender no longer wants this block.
    Cancel(Cid),
    /// A block the receiver asked for. Unverified until checked against `cid`.
    Block { cid: Cid, data: Bytes },
    /// The sender holds this block.
    Have(Cid),
}

impl Message {
    pub fn cid(&self) -> &Cid {
        match self {
            Message::Want(cid) | Message::Cancel(cid) | Message::Have(cid) => cid,
            Message::Block { cid, .. } => cid,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Want(_) => "want",
            Message::Cancel(_) => "cancel",
            Message::Block { .. } => "block",
            Message::Have(_) => "have",
        }
    }
}

impl From<Block> for Message {
    fn from(block: Block) -> Self {
        let (cid, data) = block.into_parts();
        Message::Block { cid, data }
    }
}
