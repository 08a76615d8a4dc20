//! TCP connection handling and file transfer for filechat peers.
//!
//! One TCP stream carries chat lines and file bodies. This crate wraps
//! the stream in a [`PeerConnection`] whose read half serves both the text
//! channel (`read_line`) and the byte channel (`read_exactly`) from a
//! single buffer, and drives the transfer protocol on top of it through
//! [`Receiver`] (inbound) and the `send_*` methods of
//! [`ConnectionWriter`] (outbound).
//!
//! # Wire format
//!
//! See the `filechat_protocol` crate.

pub mod client;
pub mod connection;
pub mod error;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod sink;

pub use client::{ClientOptions, TcpPeer, connect};
pub use connection::{ConnectionReader, ConnectionWriter, PeerConnection};
pub use error::DataChannelError;
pub use receiver::{Inbound, ReceivePolicy, Receiver, TransferProgress};
pub use server::{ChatServer, ConnectionId, Outbound, ServerConfig, ServerEvent};
pub use sink::{DirectorySink, FileSink, MemorySink, StoredFile};

use std::time::Duration;

/// TCP read/write buffer size (64 KB).
pub const TCP_BUFFER_SIZE: usize = 64 * 1024;

/// Timeout for the TCP connection attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pending outbound commands per server connection.
pub const OUTBOUND_QUEUE: usize = 64;

/// Prefix prepended to received filenames.
pub const DEFAULT_RECEIVED_PREFIX: &str = "Received_";
