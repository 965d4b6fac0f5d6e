//! Minimal STOMP 1.2 framing.
//!
//! A frame is a command line, `key:value` header lines, an empty line, the
//! body and a single NUL terminator. Header escaping follows STOMP 1.2 and is
//! skipped for `CONNECT`/`CONNECTED`, which the protocol leaves unescaped.

use std::borrow::Cow;

use serde::de::DeserializeOwned;
use thiserror::Error;

const NUL: u8 = 0x00;
const CONTENT_LENGTH: &str = "content-length";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame carries no command (heart-beat)")]
    Empty,
    #[error("frame ended before the header block was terminated")]
    MissingBodySeparator,
    #[error("frame is missing its NUL terminator")]
    MissingTerminator,
    #[error("frame header is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Subscribe,
    Connected,
    Message,
    Error,
    Other(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Connect => "CONNECT",
            Self::Subscribe => "SUBSCRIBE",
            Self::Connected => "CONNECTED",
            Self::Message => "MESSAGE",
            Self::Error => "ERROR",
            Self::Other(name) => name,
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "CONNECT" => Self::Connect,
            "SUBSCRIBE" => Self::Subscribe,
            "CONNECTED" => Self::Connected,
            "MESSAGE" => Self::Message,
            "ERROR" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }

    fn escapes_headers(&self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First occurrence wins when a header repeats.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn connect(token: &str, workspace_id: &str, accept_version: &str) -> Self {
        Self::new(Command::Connect)
            .with_header("Authorization", format!("Bearer {token}"))
            .with_header("Workspace-Id", workspace_id)
            .with_header("accept-version", accept_version)
            .with_header("heart-beat", "0,0")
    }

    pub fn subscribe(destination: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(Command::Subscribe)
            .with_header("destination", destination)
            .with_header("id", id)
    }
}

pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let escape = frame.command.escapes_headers();
    let mut out = Vec::with_capacity(64 + frame.body.len());
    out.extend_from_slice(frame.command.as_str().as_bytes());
    out.push(b'\n');

    for (key, value) in &frame.headers {
        push_header(&mut out, key, value, escape);
    }
    if !frame.body.is_empty() && frame.header(CONTENT_LENGTH).is_none() {
        push_header(
            &mut out,
            CONTENT_LENGTH,
            &frame.body.len().to_string(),
            escape,
        );
    }

    out.push(b'\n');
    out.extend_from_slice(&frame.body);
    out.push(NUL);
    out
}

fn push_header(out: &mut Vec<u8>, key: &str, value: &str, escape: bool) {
    if escape {
        out.extend_from_slice(escape_header(key).as_bytes());
        out.push(b':');
        out.extend_from_slice(escape_header(value).as_bytes());
    } else {
        out.extend_from_slice(key.as_bytes());
        out.push(b':');
        out.extend_from_slice(value.as_bytes());
    }
    out.push(b'\n');
}

pub fn decode_frame(raw: &[u8]) -> Result<Frame, FrameError> {
    let mut rest = raw;
    while let Some(tail) = rest
        .strip_prefix(b"\r\n")
        .or_else(|| rest.strip_prefix(b"\n"))
    {
        rest = tail;
    }
    if rest.is_empty() || rest == [NUL] {
        return Err(FrameError::Empty);
    }

    let (command_line, tail) = split_line(rest).ok_or(FrameError::MissingBodySeparator)?;
    rest = tail;
    let command =
        Command::parse(std::str::from_utf8(command_line).map_err(|_| FrameError::InvalidUtf8)?);
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, tail) = split_line(rest).ok_or(FrameError::MissingBodySeparator)?;
        rest = tail;
        if line.is_empty() {
            break;
        }
        let line = std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)?;
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if escaped {
            headers.push((unescape_header(key)?, unescape_header(value)?));
        } else {
            headers.push((key.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(key, _)| key == CONTENT_LENGTH)
        .map(|(_, value)| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(value.clone()))
        })
        .transpose()?;

    let body = match content_length {
        Some(len) => {
            if rest.len() <= len || rest[len] != NUL {
                return Err(FrameError::MissingTerminator);
            }
            &rest[..len]
        }
        None => {
            let end = rest
                .iter()
                .position(|byte| *byte == NUL)
                .ok_or(FrameError::MissingTerminator)?;
            &rest[..end]
        }
    };

    Ok(Frame {
        command,
        headers,
        body: body.to_vec(),
    })
}

fn split_line(input: &[u8]) -> Option<(&[u8], &[u8])> {
    let newline = input.iter().position(|byte| *byte == b'\n')?;
    let line = &input[..newline];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, &input[newline + 1..]))
}

fn escape_header(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['\\', '\r', '\n', ':']) {
        return Cow::Borrowed(raw);
    }
    let mut escaped = String::with_capacity(raw.len() + 8);
    for ch in raw.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\r' => escaped.push_str("\\r"),
            '\n' => escaped.push_str("\\n"),
            ':' => escaped.push_str("\\c"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

#[cfg(test)]
#[path = "tests/frame_tests.rs"]
mod tests;
