//! Error types for the wire codec.

/// A text-channel line that cannot be interpreted.
///
/// Apart from [`LineTooLong`](Self::LineTooLong), none of these are fatal
/// to the connection: the offending line is dropped and the stream stays
/// in text mode. An overlong line leaves the reader mid-line, so the
/// connection must be closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("transfer header is missing fields: {0:?}")]
    MissingFields(String),

    #[error("transfer header has too many fields: {0:?}")]
    TooManyFields(String),

    #[error("transfer header has an empty filename")]
    EmptyFilename,

    #[error("invalid transfer size: {0:?}")]
    InvalidSize(String),

    #[error("invalid filename {name:?}: {reason}")]
    InvalidFilename { name: String, reason: &'static str },

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("text contains a line break")]
    MultilineText,
}

/// An operation attempted in a channel state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {operation} while {state}")]
pub struct StateError {
    pub operation: &'static str,
    pub state: &'static str,
}
