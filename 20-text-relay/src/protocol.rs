//! The line protocol spoken between clients and the hub.
//!
//! Every frame is one line of UTF-8 text. Lines starting with a known
//! command prefix are consumed by the hub; everything else is chat. Replies
//! from the hub itself are prefixed with `[Server]`.

use std::io;

use chrono::NaiveTime;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, TransportError};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

const SERVER_PREFIX: &str = "[Server] ";
const NICKNAME_SET: &str = "Username set to ";

/// Longest line accepted from a peer, delimiter excluded.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Nicknames must be strictly shorter than this after trimming.
pub const MAX_NICKNAME_LEN: usize = 20;

pub const NICKNAME_REQUIRED: &str = "Please set a username first using /nick <username>";

/// A classified inbound line. Borrowed from the raw line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound<'a> {
    Empty,
    Nick(&'a str),
    List,
    ListIps,
    Exit,
    PrivateMessage { target: &'a str, text: &'a str },
    Chat(&'a str),
}

impl<'a> Inbound<'a> {
    /// Classifies one line. Command prefixes are case-sensitive.
    pub fn parse(line: &'a str) -> Result<Self, ProtocolError> {
        let line = line.trim_end();
        if line.trim_start().is_empty() {
            return Ok(Inbound::Empty);
        }

        let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
        match head {
            "/nick" => validate_nickname(rest).map(Inbound::Nick),
            "/list" => Ok(Inbound::List),
            "/listips" => Ok(Inbound::ListIps),
            "/exit" => Ok(Inbound::Exit),
            "/pm" => parse_private_message(rest),
            _ => Ok(Inbound::Chat(line)),
        }
    }
}

/// Trims a requested nickname and checks its length.
pub fn validate_nickname(raw: &str) -> Result<&str, ProtocolError> {
    let name = raw.trim();
    if name.is_empty() || name.chars().count() >= MAX_NICKNAME_LEN {
        return Err(ProtocolError::InvalidNickname);
    }
    Ok(name)
}

fn parse_private_message(rest: &str) -> Result<Inbound<'_>, ProtocolError> {
    let (target, text) = rest
        .trim_start()
        .split_once(' ')
        .ok_or(ProtocolError::MalformedPrivateMessage)?;
    let text = text.trim();
    if target.is_empty() || text.is_empty() {
        return Err(ProtocolError::MalformedPrivateMessage);
    }
    Ok(Inbound::PrivateMessage { target, text })
}

pub fn nick_command(nickname: &str) -> String {
    format!("/nick {nickname}")
}

pub fn server_notice(text: &str) -> String {
    format!("{SERVER_PREFIX}{text}")
}

pub fn joined_notice(nickname: &str) -> String {
    server_notice(&format!("{nickname} has joined the chat"))
}

pub fn left_notice(nickname: &str) -> String {
    server_notice(&format!("{nickname} has left the chat"))
}

pub fn renamed_notice(old: &str, new: &str) -> String {
    server_notice(&format!("{old} changed nickname to {new}"))
}

pub fn nickname_set_notice(nickname: &str) -> String {
    server_notice(&format!("{NICKNAME_SET}{nickname}"))
}

/// The nickname a hub line confirms, if it is a [`nickname_set_notice`].
pub fn confirmed_nickname(line: &str) -> Option<&str> {
    line.strip_prefix(SERVER_PREFIX)?
        .strip_prefix(NICKNAME_SET)
        .filter(|nickname| !nickname.is_empty())
}

pub fn chat_line(at: NaiveTime, nickname: &str, text: &str) -> String {
    format!("[{}] {nickname}: {text}", at.format("%H:%M:%S"))
}

pub fn private_from_line(at: NaiveTime, sender: &str, text: &str) -> String {
    format!("[{}] [PM from {sender}]: {text}", at.format("%H:%M:%S"))
}

pub fn private_to_line(at: NaiveTime, target: &str, text: &str) -> String {
    format!("[{}] [PM to {target}]: {text}", at.format("%H:%M:%S"))
}

/// Reads one `\n`-terminated line, stripping the line ending.
///
/// Returns `Ok(None)` on a clean end of stream. Empty lines are returned as
/// empty strings; deciding what to do with them is up to the caller. A line
/// longer than [`MAX_LINE_BYTES`] is an error and never fully buffered.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    // Room for the longest allowed line plus a `\r\n` delimiter.
    let limit = (MAX_LINE_BYTES + 2) as u64;
    let mut raw = Vec::new();
    let bytes = (&mut *reader).take(limit).read_until(b'\n', &mut raw).await?;
    if bytes == 0 {
        return Ok(None);
    }

    let content = raw
        .iter()
        .rposition(|byte| !matches!(byte, b'\n' | b'\r'))
        .map_or(0, |last| last + 1);
    if content > MAX_LINE_BYTES {
        return Err(TransportError::FrameTooLong(MAX_LINE_BYTES));
    }
    raw.truncate(content);

    String::from_utf8(raw)
        .map(Some)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error).into())
}

/// Writes one line plus the delimiter and flushes so peers see it promptly.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noon() -> NaiveTime {
        NaiveTime::from_hms_opt(12, 5, 9).expect("valid time")
    }

    #[test]
    fn blank_lines_are_empty() {
        assert_eq!(Inbound::parse(""), Ok(Inbound::Empty));
        assert_eq!(Inbound::parse("   \r"), Ok(Inbound::Empty));
    }

    #[test]
    fn nick_is_trimmed_and_length_checked() {
        assert_eq!(Inbound::parse("/nick  alice  "), Ok(Inbound::Nick("alice")));
        assert_eq!(Inbound::parse("/nick"), Err(ProtocolError::InvalidNickname));
        assert_eq!(Inbound::parse("/nick    "), Err(ProtocolError::InvalidNickname));
        let nineteen = "a".repeat(19);
        assert_eq!(
            Inbound::parse(&format!("/nick {nineteen}")),
            Ok(Inbound::Nick(nineteen.as_str()))
        );
        let twenty = "a".repeat(20);
        assert_eq!(
            Inbound::parse(&format!("/nick {twenty}")),
            Err(ProtocolError::InvalidNickname)
        );
    }

    #[test]
    fn roster_and_exit_commands() {
        assert_eq!(Inbound::parse("/list"), Ok(Inbound::List));
        assert_eq!(Inbound::parse("/listips"), Ok(Inbound::ListIps));
        assert_eq!(Inbound::parse("/exit"), Ok(Inbound::Exit));
    }

    #[test]
    fn command_prefixes_are_case_sensitive() {
        assert_eq!(Inbound::parse("/LIST"), Ok(Inbound::Chat("/LIST")));
        assert_eq!(Inbound::parse("/nickname bob"), Ok(Inbound::Chat("/nickname bob")));
    }

    #[test]
    fn private_message_needs_target_and_text() {
        assert_eq!(
            Inbound::parse("/pm bob hello there"),
            Ok(Inbound::PrivateMessage {
                target: "bob",
                text: "hello there"
            })
        );
        assert_eq!(
            Inbound::parse("/pm bob"),
            Err(ProtocolError::MalformedPrivateMessage)
        );
        assert_eq!(
            Inbound::parse("/pm bob    "),
            Err(ProtocolError::MalformedPrivateMessage)
        );
        assert_eq!(Inbound::parse("/pm"), Err(ProtocolError::MalformedPrivateMessage));
    }

    #[test]
    fn formats_match_the_wire_shapes() {
        assert_eq!(chat_line(noon(), "alice", "hi"), "[12:05:09] alice: hi");
        assert_eq!(
            private_from_line(noon(), "alice", "psst"),
            "[12:05:09] [PM from alice]: psst"
        );
        assert_eq!(
            private_to_line(noon(), "bob", "psst"),
            "[12:05:09] [PM to bob]: psst"
        );
        assert_eq!(joined_notice("bob"), "[Server] bob has joined the chat");
        assert_eq!(
            renamed_notice("bob", "robert"),
            "[Server] bob changed nickname to robert"
        );
    }

    #[tokio::test]
    async fn line_framing_strips_delimiters() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);

        write_line(&mut writer, "hello").await.expect("write line");
        writer.write_all(b"crlf\r\n\n").await.expect("write raw");
        drop(writer);

        assert_eq!(read_line(&mut reader).await.expect("read"), Some("hello".into()));
        assert_eq!(read_line(&mut reader).await.expect("read"), Some("crlf".into()));
        assert_eq!(read_line(&mut reader).await.expect("read"), Some(String::new()));
        assert_eq!(read_line(&mut reader).await.expect("read"), None);
    }

    #[tokio::test]
    async fn overlong_lines_are_refused() {
        let (mut writer, reader) = tokio::io::duplex(4096);
        let mut reader = tokio::io::BufReader::new(reader);

        let writing = tokio::spawn(async move {
            let longest = "a".repeat(MAX_LINE_BYTES);
            write_line(&mut writer, &longest).await?;
            writer.write_all(&vec![b'b'; MAX_LINE_BYTES + 10]).await
        });

        let accepted = read_line(&mut reader).await.expect("read").expect("line");
        assert_eq!(accepted.len(), MAX_LINE_BYTES);
        assert!(matches!(
            read_line(&mut reader).await,
            Err(TransportError::FrameTooLong(MAX_LINE_BYTES))
        ));
        drop(reader);
        let _ = writing.await;
    }

    #[test]
    fn nickname_confirmations_are_recognised() {
        assert_eq!(confirmed_nickname(&nickname_set_notice("alice")), Some("alice"));
        assert_eq!(confirmed_nickname("[Server] Username 'bob' is already taken"), None);
        assert_eq!(confirmed_nickname("[12:00:00] eve: Username set to eve"), None);
        assert_eq!(confirmed_nickname("[Server] Username set to "), None);
    }
}
