//! Shared test helpers: an in-memory fake broker, a connector that can be
//! scripted to fail, and a tracing layer that captures log events.

#![allow(dead_code)]

use bytes::BytesMut;
use futures::StreamExt;
use futures::future::BoxFuture;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stompline::codec::encode_frame;
use stompline::{BoxedTransport, Connector, Frame, StompCodec, StompItem};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

pub const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Fake broker
// ============================================================================

/// How the fake broker answers CONNECT.
#[derive(Debug, Clone)]
pub enum Reply {
    /// CONNECTED, with the given `heart-beat` header if any
    Connected(Option<String>),
    /// CONNECTED without heartbeats, then close straight away
    ConnectedThenHangUp,
    /// Close the connection instead of answering
    HangUp,
}

fn connected_bytes(heart_beat: Option<&str>) -> BytesMut {
    let mut connected = Frame::new("CONNECTED").header("version", "1.1");
    if let Some(hb) = heart_beat {
        connected = connected.header("heart-beat", hb);
    }
    let mut buf = BytesMut::new();
    encode_frame(&connected, &mut buf);
    buf
}

enum BrokerCmd {
    Raw(Vec<u8>),
    HangUp,
}

/// The broker side of one accepted connection.
pub struct BrokerConn {
    received: mpsc::UnboundedReceiver<StompItem>,
    commands: mpsc::UnboundedSender<BrokerCmd>,
}

impl BrokerConn {
    /// Next item the client wrote, heartbeats included.
    pub async fn next_item(&mut self) -> StompItem {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("timed out waiting for client data")
            .expect("broker connection closed")
    }

    /// Next frame the client wrote, skipping heartbeats.
    pub async fn next_frame(&mut self) -> Frame {
        loop {
            if let StompItem::Frame(frame) = self.next_item().await {
                return frame;
            }
        }
    }

    /// Collect whatever arrives within `window`.
    pub async fn drain_for(&mut self, window: Duration) -> Vec<StompItem> {
        let mut items = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(item)) = tokio::time::timeout_at(deadline, self.received.recv()).await {
            items.push(item);
        }
        items
    }

    /// Write raw bytes to the client.
    pub fn inject(&self, bytes: &[u8]) {
        let _ = self.commands.send(BrokerCmd::Raw(bytes.to_vec()));
    }

    pub fn send_frame(&self, frame: &Frame) {
        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf);
        self.inject(&buf);
    }

    /// Drop the connection.
    pub fn hang_up(&self) {
        let _ = self.commands.send(BrokerCmd::HangUp);
    }

    /// Wait until the client side has gone away.
    pub async fn closed(&mut self) {
        tokio::time::timeout(WAIT, async {
            while self.received.recv().await.is_some() {}
        })
        .await
        .expect("client kept the connection open");
    }
}

async fn serve(
    stream: DuplexStream,
    reply: Reply,
    received: mpsc::UnboundedSender<StompItem>,
    mut commands: mpsc::UnboundedReceiver<BrokerCmd>,
) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut frames = FramedRead::new(read_half, StompCodec::new());
    loop {
        tokio::select! {
            item = frames.next() => {
                let Some(Ok(item)) = item else { return };
                let is_connect = matches!(&item, StompItem::Frame(f) if f.command == "CONNECT");
                let _ = received.send(item);
                if is_connect {
                    match &reply {
                        Reply::Connected(hb) => {
                            let buf = connected_bytes(hb.as_deref());
                            if write_half.write_all(&buf).await.is_err() {
                                return;
                            }
                        }
                        Reply::ConnectedThenHangUp => {
                            let _ = write_half.write_all(&connected_bytes(None)).await;
                            return;
                        }
                        Reply::HangUp => return,
                    }
                }
            }
            cmd = commands.recv() => match cmd {
                Some(BrokerCmd::Raw(bytes)) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Some(BrokerCmd::HangUp) | None => return,
            }
        }
    }
}

// ============================================================================
// Scripted connector
// ============================================================================

struct ConnectorShared {
    failures: AtomicU32,
    attempts: AtomicU32,
    reply: Mutex<Reply>,
    next_reply: Mutex<Option<Reply>>,
    accepted_tx: mpsc::UnboundedSender<BrokerConn>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<BrokerConn>>,
}

/// A [`Connector`] backed by in-memory pipes to a fake broker.
///
/// The first `failures` attempts are refused; later ones succeed and hand
/// the broker end to the test through [`ScriptedConnector::accept`].
#[derive(Clone)]
pub struct ScriptedConnector {
    shared: Arc<ConnectorShared>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(ConnectorShared {
                failures: AtomicU32::new(0),
                attempts: AtomicU32::new(0),
                reply: Mutex::new(Reply::Connected(None)),
                next_reply: Mutex::new(None),
                accepted_tx,
                accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            }),
        }
    }

    /// Refuse the next `n` attempts.
    pub fn failing(n: u32) -> Self {
        let connector = Self::new();
        connector.fail_next(n);
        connector
    }

    pub fn fail_next(&self, n: u32) {
        self.shared.failures.store(n, Ordering::SeqCst);
    }

    pub fn reply_with(&self, reply: Reply) {
        *self.shared.reply.lock().unwrap() = reply;
    }

    /// Answer only the next connection with `reply`.
    pub fn reply_next_with(&self, reply: Reply) {
        *self.shared.next_reply.lock().unwrap() = Some(reply);
    }

    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// The broker end of the next successful connection.
    pub async fn accept(&self) -> BrokerConn {
        let mut rx = self.shared.accepted_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// Assert that no connection is opened within `window`.
    pub async fn assert_no_connection(&self, window: Duration) {
        let mut rx = self.shared.accepted_rx.lock().await;
        if let Ok(Some(_)) = tokio::time::timeout(window, rx.recv()).await {
            panic!("unexpected connection");
        }
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedTransport>> {
        Box::pin(async move {
            self.shared.attempts.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .shared
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "scripted failure",
                ));
            }

            let (client, server) = tokio::io::duplex(64 * 1024);
            let (received_tx, received_rx) = mpsc::unbounded_channel();
            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            let next = self.shared.next_reply.lock().unwrap().take();
            let reply = next.unwrap_or_else(|| self.shared.reply.lock().unwrap().clone());
            tokio::spawn(serve(server, reply, received_tx, commands_rx));
            let _ = self.shared.accepted_tx.send(BrokerConn {
                received: received_rx,
                commands: commands_tx,
            });
            Ok(Box::new(client) as BoxedTransport)
        })
    }
}

/// A MESSAGE frame as a broker would deliver it.
pub fn message(subscription: u64, message_id: &str, body: &str) -> Frame {
    Frame::new("MESSAGE")
        .header("subscription", subscription.to_string())
        .header("message-id", message_id)
        .header("destination", "/queue/test")
        .set_body(body)
}

// ============================================================================
// Log capture
// ============================================================================

#[derive(Clone, Default)]
pub struct CapturedLogs {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

impl CapturedLogs {
    pub fn has_event(&self, level: Level, message_contains: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|(l, m)| *l == level && m.contains(message_contains))
    }

    pub fn count(&self, level: Level, message_contains: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, m)| *l == level && m.contains(message_contains))
            .count()
    }
}

struct CaptureLayer {
    logs: CapturedLogs,
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.logs
            .events
            .lock()
            .unwrap()
            .push((*event.metadata().level(), visitor.0));
    }
}

/// Capture events on the current thread until the guard is dropped.
///
/// `#[tokio::test]` runs spawned tasks on the test thread, so events from
/// background tasks are captured too.
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let guard = tracing_subscriber::registry()
        .with(CaptureLayer { logs: logs.clone() })
        .set_default();
    (logs, guard)
}
