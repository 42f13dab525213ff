//! The client facade.
//!
//! [`StompClient`] owns the subscription registry and the connection
//! session, reissues every subscription after each successful connect and
//! reconnects on its own when an established connection is lost.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::config::ClientConfig;
use crate::error::{DisconnectedError, Result, RetryExhaustedError, StompError};
use crate::frame::Frame;
use crate::session::{ConnectionSession, SessionHandler};
use crate::stats::Stats;
use crate::subscription::{
    AckMode, MessageHandler, Subscription, SubscriptionOptions, SubscriptionRegistry,
};
use crate::transport::{Connector, TcpConnector};
use crate::util::lock;

/// Receives broker ERROR frames and retry exhaustion.
pub type ErrorHandler = Arc<dyn Fn(StompError) + Send + Sync>;

#[derive(Debug, Default)]
struct ClientStatus {
    connected: bool,
    closed: bool,
    attempts: u32,
}

struct ClientInner {
    me: Weak<ClientInner>,
    config: Arc<ClientConfig>,
    session: ConnectionSession,
    registry: Mutex<SubscriptionRegistry>,
    status: Mutex<ClientStatus>,
    // serializes connect loops
    connect_lock: tokio::sync::Mutex<()>,
    error_handler: ErrorHandler,
    stats: Arc<Stats>,
    span: Span,
}

/// A STOMP 1.1 client.
///
/// Cheap to clone; clones share one connection and one set of
/// subscriptions. Dropping the last clone closes the connection.
///
/// ```ignore
/// let client = StompClient::new(ClientConfig::new("127.0.0.1:61613"));
/// client.subscribe("/queue/work", AckMode::Client, |frame, body| {
///     println!("{}", String::from_utf8_lossy(body));
///     true
/// });
/// client.connect().await?;
/// client.send("/queue/work", &[], "hello")?;
/// ```
#[derive(Clone)]
pub struct StompClient {
    inner: Arc<ClientInner>,
}

/// Builder for clients that need a custom transport, error handler,
/// logging span or shared stats.
pub struct ClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    error_handler: Option<ErrorHandler>,
    span: Option<Span>,
    stats: Option<Arc<Stats>>,
}

impl ClientBuilder {
    /// Open transports with `connector` instead of plain TCP to
    /// `config.address`.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(StompError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Span every log line of this client is recorded under.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn build(self) -> StompClient {
        let config = Arc::new(self.config);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(config.address.clone())));
        let span = self
            .span
            .unwrap_or_else(|| info_span!("stomp_client", address = %config.address));
        let stats = self.stats.unwrap_or_default();
        let error_handler = self.error_handler.unwrap_or_else(|| {
            Arc::new(|e: StompError| error!(error = %e, "stomp client error"))
        });

        let inner = Arc::new_cyclic(|me: &Weak<ClientInner>| {
            let owner: Weak<dyn SessionHandler> = me.clone();
            ClientInner {
                me: me.clone(),
                session: ConnectionSession::new(
                    Arc::clone(&config),
                    connector,
                    owner,
                    Arc::clone(&stats),
                    span.clone(),
                ),
                config,
                registry: Mutex::new(SubscriptionRegistry::new()),
                status: Mutex::new(ClientStatus::default()),
                connect_lock: tokio::sync::Mutex::new(()),
                error_handler,
                stats,
                span,
            }
        });
        StompClient { inner }
    }
}

impl StompClient {
    /// A client connecting over TCP to `config.address`.
    pub fn new(config: ClientConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            connector: None,
            error_handler: None,
            span: None,
            stats: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Connect, retrying failed attempts.
    ///
    /// Clears an earlier [`close`](Self::close). On success every
    /// registered subscription is sent again in registration order. With
    /// `max_reconnect_attempts` set, giving up reports a
    /// [`RetryExhaustedError`] to the error handler and returns it.
    pub async fn connect(&self) -> Result<()> {
        lock(&self.inner.status).closed = false;
        self.connect_loop().await
    }

    async fn connect_loop(&self) -> Result<()> {
        self.retry_until_connected()
            .instrument(self.inner.span.clone())
            .await
    }

    async fn retry_until_connected(&self) -> Result<()> {
        let inner = &self.inner;
        let _serial = inner.connect_lock.lock().await;
        loop {
            {
                let mut status = lock(&inner.status);
                if status.closed {
                    debug!("client closed, not connecting");
                    return Err(DisconnectedError.into());
                }
                if status.connected {
                    return Ok(());
                }
                status.attempts += 1;
            }
            inner.stats.increment("connection_attempts");

            let err = match inner.session.connect().await {
                Ok(()) if inner.on_connected() => return Ok(()),
                // the transport dropped between CONNECTED and here
                Ok(()) => DisconnectedError.into(),
                Err(e) => e,
            };

            let attempts = {
                let mut status = lock(&inner.status);
                if status.closed {
                    return Err(DisconnectedError.into());
                }
                let exhausted = inner
                    .config
                    .max_reconnect_attempts
                    .is_some_and(|max| status.attempts >= max);
                if exhausted {
                    let attempts = status.attempts;
                    status.attempts = 0;
                    Err(attempts)
                } else {
                    Ok(status.attempts)
                }
            };

            match attempts {
                Ok(attempt) => {
                    warn!(attempt, error = %err, "connection attempt failed");
                    let delay = inner.config.reconnect_delay;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(attempts) => {
                    warn!(attempt = attempts, error = %err, "connection attempt failed");
                    error!("all connection attempts failed");
                    let exhausted = RetryExhaustedError {
                        attempts,
                        client: self.clone(),
                    };
                    (inner.error_handler)(exhausted.clone().into());
                    return Err(exhausted.into());
                }
            }
        }
    }

    /// Close the connection and stop reconnecting.
    pub fn close(&self) {
        {
            let mut status = lock(&self.inner.status);
            status.closed = true;
            status.connected = false;
        }
        self.inner.session.close();
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.status).connected
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.inner.stats
    }

    /// Subscribe with default options for `ack`.
    pub fn subscribe<F>(&self, destination: &str, ack: AckMode, handler: F) -> Arc<Subscription>
    where
        F: Fn(&Frame, &[u8]) -> bool + Send + Sync + 'static,
    {
        self.subscribe_with_options(destination, SubscriptionOptions::new(ack), handler)
    }

    /// Register a subscription. SUBSCRIBE is sent now if connected,
    /// otherwise on the next successful connect.
    pub fn subscribe_with_options<F>(
        &self,
        destination: &str,
        options: SubscriptionOptions,
        handler: F,
    ) -> Arc<Subscription>
    where
        F: Fn(&Frame, &[u8]) -> bool + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(handler);
        let mut registry = lock(&self.inner.registry);
        let subscription = registry.register(destination, options, handler);
        debug!(
            parent: &self.inner.span,
            id = subscription.id(),
            destination,
            "subscription registered"
        );
        if self.is_connected() {
            if let Err(e) = self.inner.session.subscribe(&subscription) {
                debug!(parent: &self.inner.span, error = %e, "SUBSCRIBE deferred to next connect");
            }
        }
        subscription
    }

    /// Remove `subscription` if it is still the registered one for its id,
    /// sending UNSUBSCRIBE when connected. Stale handles are ignored.
    pub fn unsubscribe(&self, subscription: &Arc<Subscription>) {
        let mut registry = lock(&self.inner.registry);
        if !registry.remove_if_current(subscription) {
            debug!(
                parent: &self.inner.span,
                id = subscription.id(),
                "unsubscribe for a stale subscription ignored"
            );
            return;
        }
        if self.is_connected() {
            if let Err(e) = self.inner.session.unsubscribe(subscription) {
                debug!(parent: &self.inner.span, error = %e, "UNSUBSCRIBE not sent");
            }
        }
    }

    /// Registered subscription with `id`.
    pub fn get(&self, id: u64) -> Option<Arc<Subscription>> {
        lock(&self.inner.registry).get(id)
    }

    /// Send `body` to `destination`.
    ///
    /// Headers go out as `destination`, then `headers` in order, then
    /// `content-length` (the body's byte length).
    pub fn send(
        &self,
        destination: &str,
        headers: &[(&str, &str)],
        body: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.send_inner(destination, headers, body.into(), true)
    }

    /// Like [`send`](Self::send) but without a `content-length` header, so
    /// the broker reads the body up to the first NUL.
    pub fn send_without_content_length(
        &self,
        destination: &str,
        headers: &[(&str, &str)],
        body: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.send_inner(destination, headers, body.into(), false)
    }

    fn send_inner(
        &self,
        destination: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
        content_length: bool,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(DisconnectedError.into());
        }
        let mut frame = Frame::new("SEND")
            .header("destination", destination)
            .headers(headers.iter().copied());
        if content_length {
            frame = frame.header("content-length", body.len().to_string());
        }
        self.inner.session.send_frame(frame.set_body(body))?;
        self.inner.stats.increment("sent_msg");
        Ok(())
    }

    /// Acknowledge `message` on a `client` or `client-individual`
    /// subscription.
    pub fn ack(&self, message: &Frame) -> Result<()> {
        self.acknowledge(message, true)
    }

    /// Reject `message` on a `client` or `client-individual` subscription.
    pub fn nack(&self, message: &Frame) -> Result<()> {
        self.acknowledge(message, false)
    }

    fn acknowledge(&self, message: &Frame, accept: bool) -> Result<()> {
        let _span = self.inner.span.enter();
        let id = message.get_header("subscription").unwrap_or("");
        let Some(subscription) = lock(&self.inner.registry).lookup(id) else {
            warn!("subscription {} not found", id);
            return Ok(());
        };
        if subscription.ack_mode() == AckMode::Auto {
            warn!("auto ack/nack is enabled, ignoring call");
            return Ok(());
        }
        if accept {
            self.inner.session.ack(message)
        } else {
            self.inner.session.nack(message)
        }
    }

    /// Whether both handles refer to the same client.
    pub fn ptr_eq(&self, other: &StompClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for StompClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StompClient")
            .field("address", &self.inner.config.address)
            .field("connected", &self.is_connected())
            .field("subscriptions", &lock(&self.inner.registry).len())
            .finish()
    }
}

impl ClientInner {
    /// Mark the client connected and resubscribe. Returns false, changing
    /// nothing, if the session already lost the connection again.
    fn on_connected(&self) -> bool {
        let registry = lock(&self.registry);
        {
            let mut status = lock(&self.status);
            if !self.session.is_connected() {
                return false;
            }
            status.attempts = 0;
            status.connected = true;
        }
        self.stats.new_connection();
        self.stats.increment("connections");
        let subscriptions = registry.snapshot();
        if !subscriptions.is_empty() {
            info!(count = subscriptions.len(), "resubscribing");
        }
        for subscription in &subscriptions {
            if let Err(e) = self.session.subscribe(subscription) {
                warn!(id = subscription.id(), error = %e, "resubscribe failed");
                break;
            }
        }
        true
    }
}

impl SessionHandler for ClientInner {
    fn subscription(&self, id: &str) -> Option<Arc<Subscription>> {
        lock(&self.registry).lookup(id)
    }

    fn on_error(&self, error: StompError) {
        (self.error_handler)(error);
    }

    fn connection_lost(&self, cause: Option<StompError>) {
        let closed = {
            let mut status = lock(&self.status);
            status.connected = false;
            status.closed
        };
        if closed {
            return;
        }
        let Some(inner) = self.me.upgrade() else {
            return;
        };
        if let Some(cause) = &cause {
            info!(error = %cause, "reconnecting");
        }
        let client = StompClient { inner };
        tokio::spawn(
            async move {
                if let Err(e) = client.connect_loop().await {
                    debug!(error = %e, "reconnect stopped");
                }
            }
            .instrument(self.span.clone()),
        );
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.session.close();
    }
}
