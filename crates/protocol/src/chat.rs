//! Chat lines and the local identity that signs them.

use std::fmt;

use crate::constants::{FAREWELL, NICKNAME_SEPARATOR};
use crate::error::ProtocolError;
use crate::wire::check_single_line;

/// A chat line as it travels on the text channel.
///
/// The `nickname: ` prefix is a convention, not structure: the line is
/// kept verbatim and the prefix is only split out on request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine(String);

impl ChatLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// The sender nickname, if the line follows the prefix convention.
    pub fn nickname(&self) -> Option<&str> {
        self.0
            .split_once(NICKNAME_SEPARATOR)
            .map(|(nick, _)| nick)
            .filter(|nick| !nick.is_empty())
    }

    /// The text after the nickname prefix (the whole line without one).
    pub fn body(&self) -> &str {
        match self.nickname() {
            Some(nick) => &self.0[nick.len() + NICKNAME_SEPARATOR.len()..],
            None => &self.0,
        }
    }
}

impl fmt::Display for ChatLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns `true` if `text` asks to end the session.
pub fn is_farewell(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case(FAREWELL)
}

/// The local participant. Passed explicitly to whoever formats outgoing
/// chat lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    nickname: String,
}

impl Identity {
    pub fn new(nickname: impl Into<String>) -> Result<Self, ProtocolError> {
        let nickname = nickname.into();
        check_single_line(&nickname)?;
        Ok(Self { nickname })
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Formats `text` as `<nickname>: <text>`.
    pub fn chat_line(&self, text: &str) -> Result<ChatLine, ProtocolError> {
        check_single_line(text)?;
        Ok(ChatLine(format!(
            "{}{NICKNAME_SEPARATOR}{text}",
            self.nickname
        )))
    }
}
