/// Prefix marking a transfer announcement on the text channel.
pub const FILE_TRANSFER_PREFIX: &str = "FILE_TRANSFER:";

/// Separator between the fields of a transfer announcement.
pub const FIELD_SEPARATOR: char = ':';

/// Separator between a nickname and the chat text.
pub const NICKNAME_SEPARATOR: &str = ": ";

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8888;

/// Default host (loopback).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Buffer size of the body copy loop.
///
/// Affects throughput only; the wire format has no notion of chunks.
pub const COPY_BUFFER_SIZE: usize = 4096;

/// Longest text-channel line accepted, terminator excluded (64 KiB).
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Chat text that ends a client session.
pub const FAREWELL: &str = "bye";
