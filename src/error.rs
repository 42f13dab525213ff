//! Error types for stompline.

use std::io;
use thiserror::Error;

use crate::client::StompClient;
use crate::frame::Frame;
use crate::parser::CodecError;

/// An ERROR frame reported by the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("broker error: {message}")]
pub struct ProtocolError {
    /// The `message` header (a short description)
    pub message: String,
    /// The frame body, usually a longer description
    pub detail: String,
}

impl ProtocolError {
    /// Build from an ERROR frame. A missing `message` header becomes
    /// "unknown error".
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            message: frame
                .get_header("message")
                .unwrap_or("unknown error")
                .to_string(),
            detail: frame.body_text().into_owned(),
        }
    }
}

/// An operation needed a live transport and there was none.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[error("not connected to a broker")]
pub struct DisconnectedError;

/// The connect loop hit its attempt limit and gave up.
#[derive(Error, Debug, Clone)]
#[error("giving up after {attempts} connection attempts")]
pub struct RetryExhaustedError {
    pub attempts: u32,
    /// The client that gave up; call `connect` on it to start over.
    pub client: StompClient,
}

/// Errors returned by client and session operations.
#[derive(Error, Debug)]
pub enum StompError {
    #[error(transparent)]
    Disconnected(#[from] DisconnectedError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    RetryExhausted(#[from] RetryExhaustedError),
    /// I/O-level error on the transport
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The inbound stream could not be decoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StompError>;
