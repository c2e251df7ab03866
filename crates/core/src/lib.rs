//! CraftBlock Core
//!
//! Content identifiers, blocks and the process primitives shared by every
//! CraftBlock crate: cancellation contexts, task supervision, the recursive
//! pin set and the frame buffer pool.

pub mod block;
pub mod content_id;
pub mod context;
pub mod pin;
pub mod pool;
pub mod process;

use thiserror::Error;

pub use block::{verify_data, Block};
pub use cid::Cid;
pub use content_id::{codec, hash_code};
pub use context::{Context, ContextError};
pub use pin::RecursivePins;
pub use pool::BufferPool;
pub use process::Supervisor;

/// Block exchange stream protocol ID.
pub const EXCHANGE_PROTOCOL: &str = "/craftblock/exchange/1.0.0";

/// Kademlia protocol ID used by CraftBlock nodes.
pub const KAD_PROTOCOL: &str = "/craftblock/kad/1.0.0";

/// Identify protocol version string.
pub const IDENTIFY_PROTOCOL: &str = "/craftblock/id/1.0.0";

/// DHT key prefix for block providers.
pub const PROVIDERS_DHT_PREFIX: &str = "/craftblock/providers/";

/// Largest frame body accepted on an exchange stream (4 MiB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CraftBlockError {
    #[error("Block not found: {0}")]
    NotFound(Cid),
    #[error("Hash mismatch for {cid}: data hashes to {actual}")]
    HashMismatch { cid: Cid, actual: String },
    #[error("Insecure hash algorithm 0x{code:x} in {cid}")]
    InsecureHash { cid: Cid, code: u64 },
    #[error("Unsupported hash algorithm 0x{0:x}")]
    UnsupportedHash(u64),
    #[error("Context canceled")]
    Cancelled,
    #[error("Context deadline exceeded")]
    DeadlineExceeded,
    #[error("Reprovider is already running")]
    AlreadyRunning,
    #[error("Invalid CID: {0}")]
    InvalidCid(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CraftBlockError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for the errors a context produces when it completes.
    pub fn is_context(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

impl From<ContextError> for CraftBlockError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::Canceled => Self::Cancelled,
            ContextError::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

impl From<cid::Error> for CraftBlockError {
    fn from(e: cid::Error) -> Self {
        Self::InvalidCid(e.to_string())
    }
}

impl From<cid::multihash::Error> for CraftBlockError {
    fn from(e: cid::multihash::Error) -> Self {
        Self::InvalidCid(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CraftBlockError>;
