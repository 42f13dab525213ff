use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::Frame;
use crate::parser::{CodecError, DecodeLimits, DecoderState, decode_next};

/// Escape a STOMP 1.1 header value for wire transmission.
///
/// - backslash (0x5c) → `\\`
/// - carriage return (0x0d) → `\r`
/// - line feed (0x0a) → `\n`
/// - colon (0x3a) → `\c`
fn escape_header_value(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}

/// Items produced or consumed by the codec.
///
/// A `StompItem` is either a decoded `Frame` or a `Heartbeat` marker
/// representing a single LF received on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    /// A decoded STOMP frame (command + headers + body)
    Frame(Frame),
    /// A single heartbeat pulse (LF)
    Heartbeat,
}

/// `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` for the
/// STOMP wire protocol.
///
/// Decoding is incremental: bytes are consumed from the source buffer as
/// soon as they are seen and the partial frame is kept in a
/// [`DecoderState`], so arbitrarily fragmented input decodes the same as
/// input delivered in one piece.
#[derive(Debug, Default)]
pub struct StompCodec {
    state: DecoderState,
    limits: DecodeLimits,
    // bytes handed to `feed` that have not been consumed yet
    pending: BytesMut,
}

impl StompCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// A codec rejecting frames larger than `limits` allows.
    pub fn with_limits(limits: DecodeLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Decoder progress for the frame currently being read.
    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    /// Push raw bytes and collect every frame they complete, in arrival
    /// order.
    ///
    /// Heartbeats produce nothing and an empty slice is a no-op. A trailing
    /// partial frame is kept until the next call. On error everything
    /// buffered so far is discarded.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Frame>, CodecError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        self.pending.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            match decode_next(&mut self.state, &mut self.pending, &self.limits) {
                Ok(Some(StompItem::Frame(frame))) => frames.push(frame),
                Ok(Some(StompItem::Heartbeat)) => {}
                Ok(None) => return Ok(frames),
                Err(e) => {
                    // the rest of a broken frame is not a new frame
                    self.pending.clear();
                    return Err(e);
                }
            }
        }
    }
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = CodecError;

    /// Decode bytes from `src` into a `StompItem`.
    ///
    /// Unlike a stateless decoder this one consumes partial frames from
    /// `src` and keeps them internally, so `Ok(None)` leaves `src` empty
    /// rather than untouched.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_next(&mut self.state, src, &self.limits)
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = CodecError;

    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            StompItem::Heartbeat => dst.put_u8(b'\n'),
            StompItem::Frame(frame) => encode_frame(&frame, dst),
        }
        Ok(())
    }
}

/// Serialize `frame` into `dst`: command line, headers in order, a blank
/// line, the body and a NUL terminator.
///
/// Header values are escaped except on CONNECT/CONNECTED, which STOMP 1.1
/// transmits verbatim. A body containing NUL cannot be NUL-delimited, so a
/// `content-length` header is appended when the frame lacks one.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    let escape = !matches!(frame.command.as_str(), "CONNECT" | "CONNECTED");

    dst.reserve(frame.command.len() + frame.body.len() + 64);
    dst.extend_from_slice(frame.command.as_bytes());
    dst.put_u8(b'\n');

    for (k, v) in &frame.headers {
        if escape {
            dst.extend_from_slice(escape_header_value(k).as_bytes());
            dst.put_u8(b':');
            dst.extend_from_slice(escape_header_value(v).as_bytes());
        } else {
            dst.extend_from_slice(k.as_bytes());
            dst.put_u8(b':');
            dst.extend_from_slice(v.as_bytes());
        }
        dst.put_u8(b'\n');
    }

    let has_cl = frame
        .headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case("content-length"));
    if !has_cl && frame.body.contains(&0) {
        dst.extend_from_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
    }

    dst.put_u8(b'\n');
    dst.extend_from_slice(&frame.body);
    dst.put_u8(0);
}
