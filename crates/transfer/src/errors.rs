//! Transfer error categorization
//!
//! Typed categories for exchange stream failures, used to decide whether a
//! peer is retried, disconnected or just logged.

use std::fmt;
use std::io;

use crate::wire::{DecodeError, FrameError};

/// Categorized stream errors for retry and disconnect decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Network operation timed out (transient, retry).
    Timeout,
    /// Connection lost or reset (transient, retry with backoff).
    ConnectionLost,
    /// Peer refused the stream (permanent for this peer).
    PeerRefused,
    /// Frame body could not be decoded (strike against the peer).
    Malformed(String),
    /// Frame length prefix exceeds the limit (stream cannot resync).
    FrameTooLarge,
    /// Peer closed the stream at a frame boundary.
    Closed,
}

impl TransferError {
    /// Whether this error is transient and may resolve on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Timeout | TransferError::ConnectionLost)
    }

    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }

    /// Whether the stream must be dropped after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransferError::Malformed(_))
    }

    /// Short error type string for logs and events.
    pub fn error_type(&self) -> &'static str {
        match self {
            TransferError::Timeout => "timeout",
            TransferError::ConnectionLost => "connection_lost",
            TransferError::PeerRefused => "peer_refused",
            TransferError::Malformed(_) => "malformed",
            TransferError::FrameTooLarge => "frame_too_large",
            TransferError::Closed => "closed",
        }
    }

    /// Map an I/O error to the appropriate category.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => TransferError::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransferError::ConnectionLost,
            io::ErrorKind::ConnectionRefused => TransferError::PeerRefused,
            io::ErrorKind::InvalidData => match err.get_ref().and_then(|e| e.downcast_ref::<FrameError>()) {
                Some(FrameError::TooLarge { .. }) => TransferError::FrameTooLarge,
                Some(other) => TransferError::Malformed(other.to_string()),
                None => TransferError::Malformed(err.to_string()),
            },
            _ => TransferError::ConnectionLost,
        }
    }
}

impl From<DecodeError> for TransferError {
    fn from(err: DecodeError) -> Self {
        TransferError::Malformed(err.to_string())
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Timeout => write!(f, "operation timed out"),
            TransferError::ConnectionLost => write!(f, "connection lost"),
            TransferError::PeerRefused => write!(f, "peer refused stream"),
            TransferError::Malformed(msg) => write!(f, "malformed frame: {}", msg),
            TransferError::FrameTooLarge => write!(f, "frame too large"),
            TransferError::Closed => write!(f, "stream closed"),
        }
    }
}

impl std::error::Error for TransferError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(TransferError::Timeout.is_transient());
        assert!(TransferError::ConnectionLost.should_retry());
        assert!(!TransferError::PeerRefused.should_retry());
        assert!(!TransferError::Malformed("x".into()).is_transient());
    }

    #[test]
    fn test_only_malformed_frames_are_survivable() {
        assert!(!TransferError::Malformed("bad cid".into()).is_fatal());
        assert!(TransferError::FrameTooLarge.is_fatal());
        assert!(TransferError::Closed.is_fatal());
        assert!(TransferError::ConnectionLost.is_fatal());
    }

    #[test]
    fn test_io_mapping() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        assert_eq!(TransferError::from_io(&timeout), TransferError::Timeout);

        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(TransferError::from_io(&eof), TransferError::ConnectionLost);

        let big: io::Error = FrameError::TooLarge { len: 1 << 30, limit: 1 << 22 }.into();
        assert_eq!(TransferError::from_io(&big), TransferError::FrameTooLarge);

        let overflow: io::Error = FrameError::LengthOverflow.into();
        assert_eq!(
            TransferError::from_io(&overflow),
            TransferError::Malformed("length prefix overflows u64".into())
        );

        let other = io::Error::new(io::ErrorKind::InvalidData, "garbled");
        assert_eq!(TransferError::from_io(&other).error_type(), "malformed");
    }

    #[test]
    fn test_from_decode_error() {
        let err: TransferError = DecodeError::UnknownType(0x7f).into();
        assert_eq!(err.error_type(), "malformed");
    }
}
