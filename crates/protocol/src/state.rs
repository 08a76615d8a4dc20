//! Ownership of the shared stream between the text and byte channels.
//!
//! ```text
//!            begin_line              accept_line(chat | malformed)
//!   Idle ─────────────────▶ AwaitingHeader ─────────────────────────▶ Idle
//!                                 │
//!                                 │ accept_line(FILE_TRANSFER:..)
//!                                 ▼
//!                       FileBody{header, received} ──record_body(..)──▶ Idle
//!                                                   (received == size)
//! ```
//!
//! Every other transition is a [`StateError`].

use crate::error::{ProtocolError, StateError};
use crate::wire::{Line, TransferHeader, parse_line};

/// Which channel currently owns the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChannelState {
    /// Between frames.
    #[default]
    Idle,
    /// A text-channel line is being read.
    AwaitingHeader,
    /// The byte channel owns the stream until `received == header.size`.
    FileBody {
        header: TransferHeader,
        received: u64,
    },
}

/// Outcome of [`ChannelState::record_body`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyProgress {
    /// More body bytes are owed.
    Pending { received: u64, remaining: u64 },
    /// The body is complete; the stream is back in text mode.
    Complete(TransferHeader),
}

impl ChannelState {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelState::Idle => "idle",
            ChannelState::AwaitingHeader => "awaiting a line",
            ChannelState::FileBody { .. } => "reading a file body",
        }
    }

    /// Returns `true` if the next bytes on the stream belong to a file body.
    pub fn in_body(&self) -> bool {
        matches!(self, ChannelState::FileBody { .. })
    }

    /// Bytes still owed by the current body, if any.
    pub fn body_remaining(&self) -> Option<u64> {
        match self {
            ChannelState::FileBody { header, received } => Some(header.size - received),
            _ => None,
        }
    }

    /// Starts reading a text-channel line.
    pub fn begin_line(&mut self) -> Result<(), StateError> {
        if *self != ChannelState::Idle {
            return Err(self.violation("read a line"));
        }
        *self = ChannelState::AwaitingHeader;
        Ok(())
    }

    /// Feeds the line read after [`begin_line`](Self::begin_line).
    ///
    /// The outer error is a state violation. The inner result is the
    /// decoded line; a malformed announcement returns the machine to
    /// `Idle` without entering the body.
    pub fn accept_line(
        &mut self,
        line: &str,
    ) -> Result<Result<Line, ProtocolError>, StateError> {
        if *self != ChannelState::AwaitingHeader {
            return Err(self.violation("accept a line"));
        }

        let parsed = parse_line(line);
        *self = match &parsed {
            Ok(Line::Transfer(header)) => ChannelState::FileBody {
                header: header.clone(),
                received: 0,
            },
            Ok(Line::Chat(_)) | Err(_) => ChannelState::Idle,
        };
        Ok(parsed)
    }

    /// Records `n` body bytes consumed from the stream.
    ///
    /// Recording zero bytes on an empty body completes it.
    pub fn record_body(&mut self, n: u64) -> Result<BodyProgress, StateError> {
        let (header, received) = match &mut *self {
            ChannelState::FileBody { header, received } => (header, received),
            other => return Err(other.violation("consume body bytes")),
        };

        let remaining = header.size - *received;
        if n > remaining {
            return Err(StateError {
                operation: "consume more bytes than announced",
                state: "reading a file body",
            });
        }

        *received += n;
        if *received < header.size {
            return Ok(BodyProgress::Pending {
                received: *received,
                remaining: header.size - *received,
            });
        }

        let header = header.clone();
        *self = ChannelState::Idle;
        Ok(BodyProgress::Complete(header))
    }

    /// Drops whatever was in progress and returns to `Idle`.
    ///
    /// Returns the interrupted header and the bytes received so far, if a
    /// body was being read.
    pub fn abort(&mut self) -> Option<(TransferHeader, u64)> {
        match std::mem::take(self) {
            ChannelState::FileBody { header, received } => Some((header, received)),
            _ => None,
        }
    }

    fn violation(&self, operation: &'static str) -> StateError {
        StateError {
            operation,
            state: self.name(),
        }
    }
}
