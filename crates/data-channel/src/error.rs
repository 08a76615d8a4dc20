//! Error types for the data channel.

use std::path::PathBuf;

use filechat_protocol::{ProtocolError, StateError};

/// Errors produced by the TCP data channel.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(
        "transfer incomplete: received {received} of {expected} bytes ({} missing)",
        .expected - .received
    )]
    ShortTransfer { expected: u64, received: u64 },

    #[error("send of {filename} aborted after {sent} of {expected} bytes")]
    SendAborted {
        filename: String,
        sent: u64,
        expected: u64,
    },

    #[error("file error on {}: {source}", .path.display())]
    File {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("file too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("channel state violation: {0}")]
    State(#[from] StateError),

    #[error("connection timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,
}

impl DataChannelError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    /// Bytes missing from a short transfer.
    pub fn missing(&self) -> Option<u64> {
        match self {
            Self::ShortTransfer { expected, received } => Some(expected - received),
            _ => None,
        }
    }

    /// Returns `true` if the stream can no longer be trusted and the
    /// connection must be closed.
    ///
    /// Local file failures, rejected transfers and malformed headers
    /// leave the stream in sync.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(e) => matches!(e, ProtocolError::LineTooLong { .. }),
            Self::File { .. } | Self::FileTooLarge { .. } => false,
            Self::Connection(_)
            | Self::ShortTransfer { .. }
            | Self::SendAborted { .. }
            | Self::State(_)
            | Self::Timeout
            | Self::Cancelled => true,
        }
    }
}
