//! An asynchronous STOMP 1.1 client.
//!
//! The crate is layered bottom-up: [`parser`] and [`codec`] turn bytes into
//! [`Frame`]s and back, [`session`] runs one connection (CONNECT handshake,
//! heartbeats, inbound dispatch) and [`client`] adds subscriptions and
//! automatic reconnection on top.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod parser;
pub mod session;
pub mod stats;
pub mod subscription;
pub mod transport;
mod util;

pub use client::{ClientBuilder, ErrorHandler, StompClient};
pub use codec::{StompCodec, StompItem};
pub use config::{ClientConfig, HeartbeatConfig};
pub use error::{DisconnectedError, ProtocolError, Result, RetryExhaustedError, StompError};
pub use frame::{Command, Frame};
pub use heartbeat::{Heartbeater, parse_heartbeat_header};
pub use parser::{CodecError, DecodeLimits};
pub use session::{ConnectionSession, SessionHandler, SessionPhase};
pub use stats::Stats;
pub use subscription::{AckMode, MessageHandler, Subscription, SubscriptionOptions};
pub use transport::{BoxedTransport, Connector, TcpConnector, Transport};
