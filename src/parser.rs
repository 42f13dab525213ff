//! Incremental STOMP frame parser.
//!
//! The parser is a small state machine whose whole state lives in
//! [`DecoderState`]. [`decode_next`] consumes bytes from a buffer and either
//! produces one item or reports that more input is needed; every consumed
//! byte is recorded in the state, so a frame split across any number of
//! reads resumes exactly where it stopped.
//!
//! Framing rules:
//! - a `\n` (or `\r\n`) before any command byte is a heartbeat;
//! - the command line and header lines end at `\n` (a trailing `\r` is
//!   dropped);
//! - a blank line ends the headers;
//! - with a valid `content-length` the body is exactly that many bytes and
//!   must be followed by NUL, otherwise the body runs to the next NUL.

use bytes::{Buf, BytesMut};
use std::io;
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::StompItem;
use crate::frame::Frame;

/// Longest command line accepted before the stream is considered corrupt.
pub const DEFAULT_MAX_COMMAND_LEN: usize = 1024;

/// Largest body (or single header line) accepted, in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Errors raised while decoding the inbound byte stream.
///
/// After any of these the decoder state has been reset; the stream itself
/// should be treated as unreliable.
#[derive(Error, Debug)]
pub enum CodecError {
    /// I/O-level error surfaced by the framed transport
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The command line is not valid UTF-8
    #[error("invalid utf8 in command line")]
    InvalidCommand,
    /// No newline within the command length limit
    #[error("command line exceeds {0} bytes")]
    CommandTooLong(usize),
    /// Body or header line over the configured limit
    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),
    /// A content-length body was not followed by NUL
    #[error("missing NUL terminator after content-length body")]
    MissingTerminator,
}

/// Size limits applied while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_command_len: usize,
    pub max_frame_size: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_command_len: DEFAULT_MAX_COMMAND_LEN,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Stage {
    #[default]
    Command,
    Headers,
    Body(BodyLength),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyLength {
    /// legacy framing: everything up to the next NUL
    UntilNul,
    /// `content-length` framing
    Exact(usize),
}

/// Buffered progress of the frame currently being decoded.
#[derive(Debug, Clone, Default)]
pub struct DecoderState {
    stage: Stage,
    command: Vec<u8>,
    line: Vec<u8>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl DecoderState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of the command line of the frame in progress. Empty between
    /// frames.
    pub fn current_command(&self) -> &[u8] {
        &self.command
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.stage == Stage::Command && self.command.is_empty()
    }

    fn finish(&mut self) -> Result<StompItem, CodecError> {
        let done = std::mem::take(self);
        let command = String::from_utf8(done.command).map_err(|_| CodecError::InvalidCommand)?;
        Ok(StompItem::Frame(Frame {
            command,
            headers: done.headers,
            body: done.body,
        }))
    }

    fn fail<T>(&mut self, err: CodecError) -> Result<T, CodecError> {
        *self = DecoderState::default();
        Err(err)
    }
}

/// Decode at most one item from `src`, advancing it past every byte used.
///
/// Returns `Ok(None)` once `src` is exhausted without completing an item;
/// the partial frame is kept in `state` and `src` is left empty.
pub fn decode_next(
    state: &mut DecoderState,
    src: &mut BytesMut,
    limits: &DecodeLimits,
) -> Result<Option<StompItem>, CodecError> {
    loop {
        match state.stage {
            Stage::Command => {
                if src.is_empty() {
                    return Ok(None);
                }
                if state.command.is_empty() && src[0] == b'\n' {
                    src.advance(1);
                    return Ok(Some(StompItem::Heartbeat));
                }
                let Some(end) = find(src, b'\n') else {
                    state.command.extend_from_slice(src);
                    src.clear();
                    if state.command.len() > limits.max_command_len {
                        return state.fail(CodecError::CommandTooLong(limits.max_command_len));
                    }
                    return Ok(None);
                };
                state.command.extend_from_slice(&src[..end]);
                src.advance(end + 1);
                strip_cr(&mut state.command);
                if state.command.is_empty() {
                    // "\r\n" keep-alive
                    return Ok(Some(StompItem::Heartbeat));
                }
                if state.command.len() > limits.max_command_len {
                    return state.fail(CodecError::CommandTooLong(limits.max_command_len));
                }
                state.stage = Stage::Headers;
            }
            Stage::Headers => {
                let Some(end) = find(src, b'\n') else {
                    state.line.extend_from_slice(src);
                    src.clear();
                    if state.line.len() > limits.max_frame_size {
                        return state.fail(CodecError::FrameTooLarge(limits.max_frame_size));
                    }
                    return Ok(None);
                };
                state.line.extend_from_slice(&src[..end]);
                src.advance(end + 1);
                let mut line = std::mem::take(&mut state.line);
                strip_cr(&mut line);
                if line.is_empty() {
                    let length = match body_length(&state.headers, limits) {
                        Ok(length) => length,
                        Err(e) => return state.fail(e),
                    };
                    if let BodyLength::Exact(n) = length {
                        state.body.reserve(n.min(64 * 1024));
                    }
                    state.stage = Stage::Body(length);
                    continue;
                }
                // CONNECT/CONNECTED headers are never escaped
                let escaped = !matches!(state.command.as_slice(), b"CONNECT" | b"CONNECTED");
                match parse_header_line(&line, escaped) {
                    Some(header) => state.headers.push(header),
                    None => warn!(
                        line = %String::from_utf8_lossy(&line),
                        "skipping malformed header line"
                    ),
                }
            }
            Stage::Body(BodyLength::UntilNul) => match find(src, 0) {
                Some(end) => {
                    state.body.extend_from_slice(&src[..end]);
                    src.advance(end + 1);
                    return state.finish().map(Some);
                }
                None => {
                    state.body.extend_from_slice(src);
                    src.clear();
                    if state.body.len() > limits.max_frame_size {
                        return state.fail(CodecError::FrameTooLarge(limits.max_frame_size));
                    }
                    return Ok(None);
                }
            },
            Stage::Body(BodyLength::Exact(len)) => {
                let take = (len - state.body.len()).min(src.len());
                state.body.extend_from_slice(&src[..take]);
                src.advance(take);
                if state.body.len() < len || src.is_empty() {
                    return Ok(None);
                }
                if src[0] != 0 {
                    return state.fail(CodecError::MissingTerminator);
                }
                src.advance(1);
                return state.finish().map(Some);
            }
        }
    }
}

fn find(buf: &[u8], needle: u8) -> Option<usize> {
    buf.iter().position(|&b| b == needle)
}

fn strip_cr(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
}

/// Body framing for the headers collected so far. Only the first
/// `content-length` counts; a malformed one falls back to NUL framing.
fn body_length(
    headers: &[(String, String)],
    limits: &DecodeLimits,
) -> Result<BodyLength, CodecError> {
    let Some((_, raw)) = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
    else {
        return Ok(BodyLength::UntilNul);
    };
    match raw.trim().parse::<usize>() {
        Ok(n) if n > limits.max_frame_size => Err(CodecError::FrameTooLarge(limits.max_frame_size)),
        Ok(n) => Ok(BodyLength::Exact(n)),
        Err(_) => {
            debug!(value = %raw, "malformed content-length, reading body up to NUL");
            Ok(BodyLength::UntilNul)
        }
    }
}

fn parse_header_line(line: &[u8], escaped: bool) -> Option<(String, String)> {
    let colon = find(line, b':')?;
    let (key, value) = (&line[..colon], &line[colon + 1..]);
    if escaped {
        let key = String::from_utf8(unescape_header(key)).ok()?;
        let value = String::from_utf8(unescape_header(value)).ok()?;
        Some((key, value))
    } else {
        let key = std::str::from_utf8(key).ok()?;
        let value = std::str::from_utf8(value).ok()?;
        Some((key.to_string(), value.to_string()))
    }
}

/// Undo STOMP header escaping (`\n`, `\r`, `\c`, `\\`).
///
/// Unknown escape sequences are kept as they are rather than rejected;
/// brokers are not consistent about escaping.
pub fn unescape_header(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' && i + 1 < raw.len() {
            let replacement = match raw[i + 1] {
                b'n' => Some(b'\n'),
                b'r' => Some(b'\r'),
                b'c' => Some(b':'),
                b'\\' => Some(b'\\'),
                _ => None,
            };
            if let Some(b) = replacement {
                out.push(b);
                i += 2;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(state: &mut DecoderState, bytes: &[u8]) -> Vec<StompItem> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(item) = decode_next(state, &mut buf, &DecodeLimits::default()).unwrap() {
            out.push(item);
        }
        assert!(buf.is_empty());
        out
    }

    #[test]
    fn partial_command_is_retained() {
        let mut state = DecoderState::new();
        assert!(run(&mut state, b"MESS").is_empty());
        assert_eq!(state.current_command(), b"MESS");
        assert!(!state.is_idle());

        let items = run(&mut state, b"AGE\n\nhi\0");
        assert_eq!(items.len(), 1);
        assert!(state.is_idle());
        assert_eq!(state.current_command(), b"");
    }

    #[test]
    fn header_line_without_colon_is_skipped() {
        let mut state = DecoderState::new();
        let items = run(&mut state, b"MESSAGE\nbogus\nsubscription:1\n\nx\0");
        match &items[0] {
            StompItem::Frame(f) => {
                assert_eq!(f.headers, vec![("subscription".into(), "1".into())]);
                assert_eq!(f.body, b"x");
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn crlf_lines_are_accepted() {
        let mut state = DecoderState::new();
        let items = run(&mut state, b"\r\nSEND\r\ndestination:/q\r\n\r\nbody\0");
        assert_eq!(items[0], StompItem::Heartbeat);
        match &items[1] {
            StompItem::Frame(f) => {
                assert_eq!(f.command, "SEND");
                assert_eq!(f.get_header("destination"), Some("/q"));
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn escaped_values_are_decoded_except_on_connected() {
        let mut state = DecoderState::new();
        let items = run(
            &mut state,
            b"MESSAGE\nmessage-id:ID\\cabc\\c1\n\n\0CONNECTED\nserver:a\\cb\n\n\0",
        );
        match (&items[0], &items[1]) {
            (StompItem::Frame(m), StompItem::Frame(c)) => {
                assert_eq!(m.get_header("message-id"), Some("ID:abc:1"));
                assert_eq!(c.get_header("server"), Some("a\\cb"));
            }
            other => panic!("unexpected items {:?}", other),
        }
    }

    #[test]
    fn unescape_keeps_unknown_sequences() {
        assert_eq!(unescape_header(b"a\\tb"), b"a\\tb".to_vec());
        assert_eq!(unescape_header(b"trailing\\"), b"trailing\\".to_vec());
        assert_eq!(unescape_header(b"\\\\n"), b"\\n".to_vec());
    }

    #[test]
    fn command_limit_resets_state() {
        let mut state = DecoderState::new();
        let limits = DecodeLimits {
            max_command_len: 4,
            ..DecodeLimits::default()
        };
        let mut buf = BytesMut::from(&b"TOOLONG"[..]);
        let err = decode_next(&mut state, &mut buf, &limits).unwrap_err();
        assert!(matches!(err, CodecError::CommandTooLong(4)));
        assert!(state.is_idle());
    }
}
