//! Wire codec for the filechat protocol.
//!
//! A single TCP stream carries two logical channels:
//!
//! ```text
//! TEXT CHANNEL (UTF-8 lines, '\n' terminated):
//!   <free text>\n                              chat line
//!   FILE_TRANSFER:<filename>:<decimal-size>\n  transfer announcement
//!
//! BYTE CHANNEL:
//!   [size bytes: raw file data]                only right after an announcement
//! ```
//!
//! This crate performs no I/O. It parses and encodes text-channel lines,
//! validates filenames, and tracks which channel owns the stream through
//! [`ChannelState`].

pub mod chat;
pub mod constants;
pub mod error;
pub mod state;
pub mod validation;
pub mod wire;

pub use chat::{ChatLine, Identity, is_farewell};
pub use error::{ProtocolError, StateError};
pub use state::{BodyProgress, ChannelState};
pub use validation::validate_filename;
pub use wire::{Line, TransferHeader, check_single_line, parse_line};
