//! Line protocol: command recognition and the texts sent to clients.
//!
//! Every text produced here is a complete line, newline included, ready to be
//! queued on a session's outbox.

use bytes::Bytes;
use chrono::{DateTime, Local};

/// Prompt sent before every name attempt.
pub const NAME_PROMPT: &str = "What's your name?\n";

/// Leaves the chat.
pub const QUIT_COMMAND: &str = "/quit";

/// Stops the whole server.
pub const SHUTDOWN_COMMAND: &str = "/shutdown";

const TIMESTAMP_FORMAT: &str = "%Y-%b-%d %H:%M:%S%.6f";

/// A line received from a named client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// End this session.
    Quit,
    /// End every session and stop accepting.
    Shutdown,
    /// Broadcast to everyone else.
    Chat(&'a str),
}

impl<'a> Command<'a> {
    /// Classify a line. Commands must match exactly; anything else is chat.
    pub fn parse(line: &'a str) -> Self {
        match line {
            QUIT_COMMAND => Self::Quit,
            SHUTDOWN_COMMAND => Self::Shutdown,
            text => Self::Chat(text),
        }
    }
}

/// Decode one framed line, newline already removed.
///
/// Strips a trailing `\r`. Bytes that are not UTF-8 are replaced rather than
/// rejected, so a client with a different encoding can still chat.
pub fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Reply after a successful registration.
pub fn welcome(name: &str) -> Bytes {
    Bytes::from(format!("Welcome to the chat, {name}!\n"))
}

/// Reply when the requested name belongs to a live session.
pub fn name_taken(name: &str) -> Bytes {
    Bytes::from(format!("Name '{name}' is already taken, invent another one.\n"))
}

/// Reply when the client sent an empty name.
pub fn name_empty() -> Bytes {
    Bytes::from_static(b"Name must not be empty, invent another one.\n")
}

/// A chat line as delivered to the other participants.
pub fn chat_line(at: DateTime<Local>, name: &str, text: &str) -> Bytes {
    Bytes::from(format!("{} {name}: {text}\n", at.format(TIMESTAMP_FORMAT)))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn decode_strips_carriage_return_only_at_end() {
        assert_eq!(decode_line(b"hello\r"), "hello");
        assert_eq!(decode_line(b"a\rb"), "a\rb");
        assert_eq!(decode_line(b""), "");
    }

    #[test]
    fn decode_replaces_invalid_utf8() {
        assert_eq!(decode_line(b"caf\xe9"), "caf\u{fffd}");
        assert_eq!(decode_line("café".as_bytes()), "café");
    }

    #[test]
    fn commands_are_exact_matches() {
        assert_eq!(Command::parse("/quit"), Command::Quit);
        assert_eq!(Command::parse("/shutdown"), Command::Shutdown);
        assert_eq!(Command::parse("/quit now"), Command::Chat("/quit now"));
        assert_eq!(Command::parse(" /quit"), Command::Chat(" /quit"));
        assert_eq!(Command::parse(""), Command::Chat(""));
    }

    #[test]
    fn registration_replies() {
        assert_eq!(&welcome("bob")[..], b"Welcome to the chat, bob!\n");
        assert_eq!(&name_taken("alice")[..], b"Name 'alice' is already taken, invent another one.\n");
        assert!(name_empty().ends_with(b"\n"));
    }

    #[test]
    fn chat_line_carries_timestamp_sender_and_text() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).single().unwrap();
        let line = chat_line(at, "alice", "hello");
        assert_eq!(&line[..], b"2024-Mar-09 14:05:07.000000 alice: hello\n");
    }
}
