//! Text-channel line codec.
//!
//! A line is either a chat line or a transfer announcement. Lines passed
//! to [`parse_line`] have already had their terminator removed.

use std::fmt;

use crate::chat::ChatLine;
use crate::constants::{FIELD_SEPARATOR, FILE_TRANSFER_PREFIX};
use crate::error::ProtocolError;
use crate::validation::validate_filename;

/// Announcement of a file body following on the byte channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    /// Bare filename as supplied by the sender.
    pub filename: String,
    /// Exact number of body bytes following the header line.
    pub size: u64,
}

impl TransferHeader {
    /// Builds a header for sending, checking the filename against
    /// [`validate_filename`].
    pub fn new(filename: impl Into<String>, size: u64) -> Result<Self, ProtocolError> {
        let filename = filename.into();
        validate_filename(&filename)?;
        Ok(Self { filename, size })
    }

    /// Encodes the header line, without terminator.
    pub fn encode(&self) -> String {
        format!("{FILE_TRANSFER_PREFIX}{}{FIELD_SEPARATOR}{}", self.filename, self.size)
    }
}

impl fmt::Display for TransferHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.filename, self.size)
    }
}

/// A decoded text-channel line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// Free text, delivered verbatim.
    Chat(ChatLine),
    /// A transfer announcement; the byte channel owns the stream next.
    Transfer(TransferHeader),
}

/// Decodes one text-channel line.
///
/// Only lines starting with [`FILE_TRANSFER_PREFIX`] are interpreted; a
/// malformed announcement is an error rather than a chat line so the
/// caller never mistakes it for text.
pub fn parse_line(line: &str) -> Result<Line, ProtocolError> {
    match line.strip_prefix(FILE_TRANSFER_PREFIX) {
        Some(rest) => parse_header_fields(line, rest).map(Line::Transfer),
        None => Ok(Line::Chat(ChatLine::new(line))),
    }
}

fn parse_header_fields(line: &str, rest: &str) -> Result<TransferHeader, ProtocolError> {
    let mut fields = rest.split(FIELD_SEPARATOR);
    let (Some(filename), Some(size)) = (fields.next(), fields.next()) else {
        return Err(ProtocolError::MissingFields(line.to_string()));
    };
    if fields.next().is_some() {
        return Err(ProtocolError::TooManyFields(line.to_string()));
    }
    if filename.is_empty() {
        return Err(ProtocolError::EmptyFilename);
    }

    Ok(TransferHeader {
        filename: filename.to_string(),
        size: parse_size(size)?,
    })
}

/// Decimal digits only: no sign, no whitespace, no radix prefix.
fn parse_size(field: &str) -> Result<u64, ProtocolError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidSize(field.to_string()));
    }
    field
        .parse::<u64>()
        .map_err(|_| ProtocolError::InvalidSize(field.to_string()))
}

/// Checks that `text` can travel as a single text-channel line.
pub fn check_single_line(text: &str) -> Result<(), ProtocolError> {
    if text.contains(['\n', '\r']) {
        return Err(ProtocolError::MultilineText);
    }
    Ok(())
}
