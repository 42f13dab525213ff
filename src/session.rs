//! A single STOMP connection and its background tasks.
//!
//! [`ConnectionSession`] owns at most one transport at a time. Each connect
//! attempt opens a fresh transport through the [`Connector`], splits it
//! into a reader task (decoding and dispatching inbound frames) and a
//! writer task (draining an unbounded outbound queue), and then waits for
//! CONNECTED. Every attempt gets a new epoch number; tasks belonging to an
//! older epoch can no longer change the session's state.

use futures::{SinkExt, StreamExt};
use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{Instrument, Span, debug, error, info, trace, warn};

use crate::codec::{StompCodec, StompItem};
use crate::config::ClientConfig;
use crate::error::{DisconnectedError, ProtocolError, StompError};
use crate::frame::{Command, Frame};
use crate::heartbeat::{Heartbeater, parse_heartbeat_header};
use crate::stats::Stats;
use crate::subscription::{AckMode, Subscription};
use crate::transport::{BoxedTransport, Connector};
use crate::util::lock;

/// The side of a session that owns subscriptions and reacts to errors and
/// connection loss. Implemented by the client.
///
/// Callbacks run on the session's reader task (or the caller of
/// [`ConnectionSession::close`]) and must not block.
pub trait SessionHandler: Send + Sync {
    /// Subscription for the textual id in a MESSAGE's `subscription` header.
    fn subscription(&self, id: &str) -> Option<Arc<Subscription>>;

    /// An ERROR frame arrived.
    fn on_error(&self, error: StompError);

    /// The transport went away. `cause` is `None` for an explicit close.
    fn connection_lost(&self, cause: Option<StompError>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Connected,
    Closed,
    /// The transport dropped unexpectedly.
    Lost,
}

type ConnectWaiter = oneshot::Sender<Result<(), StompError>>;

struct SessionState {
    phase: SessionPhase,
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<StompItem>>,
    heartbeater: Option<Heartbeater>,
    reader: Option<JoinHandle<()>>,
    connect_waiter: Option<ConnectWaiter>,
}

impl SessionState {
    /// Drop everything tied to the current transport. The writer task
    /// flushes what is queued and closes its half once the last outbound
    /// sender is gone.
    fn teardown(&mut self) -> Option<ConnectWaiter> {
        self.heartbeater = None;
        self.outbound = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.connect_waiter.take()
    }
}

struct SessionShared {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    owner: Weak<dyn SessionHandler>,
    stats: Arc<Stats>,
    span: Span,
    state: Mutex<SessionState>,
}

/// Handle to a connection session. Clones share the same session.
#[derive(Clone)]
pub struct ConnectionSession {
    shared: Arc<SessionShared>,
}

impl ConnectionSession {
    pub fn new(
        config: Arc<ClientConfig>,
        connector: Arc<dyn Connector>,
        owner: Weak<dyn SessionHandler>,
        stats: Arc<Stats>,
        span: Span,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                config,
                connector,
                owner,
                stats,
                span,
                state: Mutex::new(SessionState {
                    phase: SessionPhase::Disconnected,
                    epoch: 0,
                    outbound: None,
                    heartbeater: None,
                    reader: None,
                    connect_waiter: None,
                }),
            }),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        lock(&self.shared.state).phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == SessionPhase::Connected
    }

    /// Open a transport, send CONNECT and wait for CONNECTED.
    ///
    /// Fails if the transport cannot be opened, if it closes before
    /// CONNECTED arrives, or if [`close`](Self::close) is called meanwhile.
    /// Any previous transport is dropped first.
    pub async fn connect(&self) -> Result<(), StompError> {
        self.open().instrument(self.shared.span.clone()).await
    }

    async fn open(&self) -> Result<(), StompError> {
        let shared = &self.shared;
        let epoch = {
            let mut st = lock(&shared.state);
            if let Some(waiter) = st.teardown() {
                let _ = waiter.send(Err(DisconnectedError.into()));
            }
            st.epoch += 1;
            st.phase = SessionPhase::Connecting;
            st.epoch
        };

        let transport = match shared.connector.connect().await {
            Ok(transport) => transport,
            Err(e) => {
                let mut st = lock(&shared.state);
                if st.epoch == epoch {
                    st.phase = SessionPhase::Disconnected;
                }
                return Err(e.into());
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut st = lock(&shared.state);
            if st.epoch != epoch || st.phase != SessionPhase::Connecting {
                debug!("session closed while the transport was opening");
                return Err(DisconnectedError.into());
            }
            let (read_half, write_half) = tokio::io::split(transport);
            let (out_tx, out_rx) = mpsc::unbounded_channel();

            let frames = FramedRead::new(
                read_half,
                StompCodec::with_limits(shared.config.decode_limits()),
            );
            let sink = FramedWrite::new(write_half, StompCodec::new());

            tokio::spawn(
                write_loop(Arc::downgrade(shared), epoch, sink, out_rx)
                    .instrument(shared.span.clone()),
            );
            let reader = tokio::spawn(
                read_loop(Arc::clone(shared), epoch, frames).instrument(shared.span.clone()),
            );

            st.outbound = Some(out_tx);
            st.reader = Some(reader);
            st.connect_waiter = Some(done_tx);
        }

        self.send_frame(connect_frame(&shared.config))?;
        debug!("CONNECT sent, waiting for CONNECTED");

        match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(DisconnectedError.into()),
        }
    }

    /// Drop the transport and stop the heartbeat.
    ///
    /// The owner is told about the loss (with no cause) if the session was
    /// connected. A pending [`connect`](Self::connect) fails with
    /// [`DisconnectedError`].
    pub fn close(&self) {
        let (was_connected, waiter) = {
            let mut st = lock(&self.shared.state);
            let was_connected = st.phase == SessionPhase::Connected;
            st.epoch += 1;
            st.phase = SessionPhase::Closed;
            (was_connected, st.teardown())
        };
        let _span = self.shared.span.enter();
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(DisconnectedError.into()));
        }
        if was_connected {
            info!("connection closed");
            if let Some(owner) = self.shared.owner.upgrade() {
                owner.connection_lost(None);
            }
        }
    }

    /// Queue `frame` for writing. Returns immediately.
    pub fn send_frame(&self, frame: Frame) -> Result<(), StompError> {
        self.shared.send_frame(frame)
    }

    pub fn subscribe(&self, subscription: &Subscription) -> Result<(), StompError> {
        self.send_frame(subscription.subscribe_frame())
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> Result<(), StompError> {
        self.send_frame(subscription.unsubscribe_frame())
    }

    /// Acknowledge a MESSAGE frame.
    pub fn ack(&self, message: &Frame) -> Result<(), StompError> {
        self.send_frame(ack_frame("ACK", message))
    }

    /// Reject a MESSAGE frame.
    pub fn nack(&self, message: &Frame) -> Result<(), StompError> {
        self.send_frame(ack_frame("NACK", message))
    }
}

impl SessionShared {
    fn send_frame(&self, frame: Frame) -> Result<(), StompError> {
        let st = lock(&self.state);
        let outbound = st.outbound.as_ref().ok_or(DisconnectedError)?;
        trace!(command = %frame.command, "queueing frame");
        outbound
            .send(StompItem::Frame(frame))
            .map_err(|_| DisconnectedError)?;
        Ok(())
    }

    fn dispatch(&self, epoch: u64, frame: Frame) {
        match frame.kind() {
            Command::Connected => self.on_connected(epoch, &frame),
            Command::Message => self.on_message(epoch, frame),
            Command::Error => self.on_error_frame(epoch, &frame),
            _ => warn!(command = %frame.command, "unhandled frame"),
        }
    }

    fn on_connected(&self, epoch: u64, frame: &Frame) {
        let waiter = {
            let mut st = lock(&self.state);
            if st.epoch != epoch {
                return;
            }
            st.phase = SessionPhase::Connected;

            let local = self.config.heartbeat;
            if let Some(value) = frame.get_header("heart-beat") {
                let (sx, sy) = parse_heartbeat_header(value);
                debug!(sx, sy, "broker heart-beat");
                let outbound = st.outbound.clone().filter(|_| local.enabled && local.cx > 0);
                if let Some(outbound) = outbound {
                    let mut hb = Heartbeater::new(Duration::from_millis(local.cx));
                    hb.start(outbound, Arc::clone(&self.stats), self.span.clone());
                    st.heartbeater = Some(hb);
                }
            }
            st.connect_waiter.take()
        };
        info!(
            version = frame.get_header("version").unwrap_or("1.0"),
            server = frame.get_header("server").unwrap_or(""),
            "connected"
        );
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Whether `epoch` is still the session's connection. Frames already
    /// buffered when the session was closed or replaced fail this.
    fn is_current(&self, epoch: u64) -> bool {
        lock(&self.state).epoch == epoch
    }

    fn on_message(&self, epoch: u64, frame: Frame) {
        let live = {
            let st = lock(&self.state);
            st.epoch == epoch && st.phase == SessionPhase::Connected
        };
        if !live {
            trace!("dropping message from a closed connection");
            return;
        }
        self.stats.increment("rec_msg");
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        let id = frame.get_header("subscription").unwrap_or("");
        let Some(subscription) = owner.subscription(id) else {
            debug!(subscription = id, "no subscription for message, dropping");
            return;
        };

        let processed = subscription.handle(&frame);
        if subscription.ack_mode() == AckMode::Auto || !subscription.auto_ack() {
            return;
        }
        let command = if processed { "ACK" } else { "NACK" };
        if let Err(e) = self.send_frame(ack_frame(command, &frame)) {
            debug!(error = %e, command, "could not acknowledge message");
        }
    }

    fn on_error_frame(&self, epoch: u64, frame: &Frame) {
        if !self.is_current(epoch) {
            return;
        }
        self.stats.increment("rec_error");
        let err = ProtocolError::from_frame(frame);
        error!("received error: {}", err.message);
        debug!("error details: {}", err.detail);
        if let Some(owner) = self.owner.upgrade() {
            owner.on_error(err.into());
        }
    }

    /// The transport of `epoch` failed. Stale epochs are ignored.
    fn transport_lost(&self, epoch: u64, cause: StompError) {
        let (was_connected, waiter) = {
            let mut st = lock(&self.state);
            let live = matches!(st.phase, SessionPhase::Connecting | SessionPhase::Connected);
            if st.epoch != epoch || !live {
                return;
            }
            let was_connected = st.phase == SessionPhase::Connected;
            st.phase = SessionPhase::Lost;
            (was_connected, st.teardown())
        };

        if let Some(waiter) = waiter {
            debug!(error = %cause, "transport closed before CONNECTED");
            let _ = waiter.send(Err(cause));
            return;
        }
        if was_connected {
            warn!(error = %cause, "connection lost");
            if let Some(owner) = self.owner.upgrade() {
                owner.connection_lost(Some(cause));
            }
        }
    }
}

async fn read_loop(
    shared: Arc<SessionShared>,
    epoch: u64,
    mut frames: FramedRead<ReadHalf<BoxedTransport>, StompCodec>,
) {
    let cause: StompError = loop {
        match frames.next().await {
            Some(Ok(StompItem::Heartbeat)) => trace!("heartbeat received"),
            Some(Ok(StompItem::Frame(frame))) => shared.dispatch(epoch, frame),
            Some(Err(e)) => break e.into(),
            None => {
                break io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by broker")
                    .into();
            }
        }
    };
    shared.transport_lost(epoch, cause);
}

async fn write_loop(
    shared: Weak<SessionShared>,
    epoch: u64,
    mut sink: FramedWrite<WriteHalf<BoxedTransport>, StompCodec>,
    mut outbound: mpsc::UnboundedReceiver<StompItem>,
) {
    while let Some(item) = outbound.recv().await {
        if let Err(e) = sink.send(item).await {
            if let Some(shared) = shared.upgrade() {
                shared.transport_lost(epoch, e.into());
            }
            return;
        }
    }
    if let Err(e) = sink.close().await {
        trace!(error = %e, "closing transport");
    }
}

/// CONNECT with `accept-version`, then `heart-beat` when enabled, then the
/// configured credentials and virtual host.
fn connect_frame(config: &ClientConfig) -> Frame {
    let mut frame = Frame::new("CONNECT").header("accept-version", "1.1");
    if config.heartbeat.enabled {
        frame = frame.header("heart-beat", config.heartbeat.header_value());
    }
    if let Some(login) = &config.login {
        frame = frame.header("login", login.as_str());
    }
    if let Some(passcode) = &config.passcode {
        frame = frame.header("passcode", passcode.as_str());
    }
    if let Some(host) = &config.host {
        frame = frame.header("host", host.as_str());
    }
    frame
}

/// ACK or NACK for `message`, carrying its `subscription` and `message-id`.
fn ack_frame(command: &str, message: &Frame) -> Frame {
    let mut frame = Frame::new(command);
    for key in ["subscription", "message-id"] {
        if let Some(value) = message.get_header(key) {
            frame = frame.header(key, value);
        }
    }
    frame
}
