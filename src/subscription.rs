use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::frame::Frame;

/// Subscription acknowledgement modes as defined by STOMP 1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// The broker considers a message delivered as soon as it is sent.
    #[default]
    Auto,
    /// Cumulative acknowledgements.
    Client,
    /// Each message is acknowledged on its own.
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(format!("unknown ack mode '{}'", other)),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message callback: receives the MESSAGE frame and its body and returns
/// whether the message was processed successfully. The result decides
/// between ACK and NACK for `client` and `client-individual` subscriptions.
pub type MessageHandler = Arc<dyn Fn(&Frame, &[u8]) -> bool + Send + Sync>;

/// Options for `StompClient::subscribe_with_options`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub ack: AckMode,
    /// Extra headers appended to SUBSCRIBE (and re-sent on reconnect)
    pub headers: Vec<(String, String)>,
    /// Acknowledge from the handler's return value. When false the
    /// application calls `ack`/`nack` itself.
    pub auto_ack: bool,
}

impl SubscriptionOptions {
    pub fn new(ack: AckMode) -> Self {
        Self {
            ack,
            ..Self::default()
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn manual_ack(mut self) -> Self {
        self.auto_ack = false;
        self
    }
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            ack: AckMode::Auto,
            headers: Vec::new(),
            auto_ack: true,
        }
    }
}

/// A registered subscription.
///
/// Handles are shared as `Arc<Subscription>`; identity (not the id alone)
/// decides whether a handle still refers to the registered entry.
pub struct Subscription {
    id: u64,
    destination: String,
    ack: AckMode,
    headers: Vec<(String, String)>,
    auto_ack: bool,
    handler: MessageHandler,
}

impl Subscription {
    pub fn new(
        id: u64,
        destination: impl Into<String>,
        options: SubscriptionOptions,
        handler: MessageHandler,
    ) -> Self {
        Self {
            id,
            destination: destination.into(),
            ack: options.ack,
            headers: options.headers,
            auto_ack: options.auto_ack,
            handler,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }

    /// Run the handler on `frame`.
    pub fn handle(&self, frame: &Frame) -> bool {
        (self.handler)(frame, &frame.body)
    }

    /// SUBSCRIBE frame: `id`, `destination`, `ack`, then the extra headers.
    pub fn subscribe_frame(&self) -> Frame {
        Frame::new("SUBSCRIBE")
            .header("id", self.id.to_string())
            .header("destination", self.destination.as_str())
            .header("ack", self.ack.as_str())
            .headers(self.headers.iter().cloned())
    }

    pub fn unsubscribe_frame(&self) -> Frame {
        Frame::new("UNSUBSCRIBE")
            .header("id", self.id.to_string())
            .header("destination", self.destination.as_str())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("ack", &self.ack)
            .field("headers", &self.headers)
            .field("auto_ack", &self.auto_ack)
            .finish_non_exhaustive()
    }
}

/// Active subscriptions keyed by id.
///
/// Ids come from a counter starting at 1 and are never reused, so iterating
/// in id order is iterating in registration order.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    next_id: u64,
    entries: BTreeMap<u64, Arc<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
        }
    }

    /// Allocate an id and store a new subscription.
    pub fn register(
        &mut self,
        destination: impl Into<String>,
        options: SubscriptionOptions,
        handler: MessageHandler,
    ) -> Arc<Subscription> {
        let id = self.next_id;
        self.next_id += 1;
        let sub = Arc::new(Subscription::new(id, destination, options, handler));
        self.entries.insert(id, Arc::clone(&sub));
        sub
    }

    pub fn get(&self, id: u64) -> Option<Arc<Subscription>> {
        self.entries.get(&id).cloned()
    }

    /// Look up by the textual id carried in a `subscription` header.
    pub fn lookup(&self, header: &str) -> Option<Arc<Subscription>> {
        header.trim().parse::<u64>().ok().and_then(|id| self.get(id))
    }

    /// Remove `sub` if it is the current entry for its id. Returns whether
    /// anything was removed.
    pub fn remove_if_current(&mut self, sub: &Arc<Subscription>) -> bool {
        match self.entries.get(&sub.id) {
            Some(current) if Arc::ptr_eq(current, sub) => {
                self.entries.remove(&sub.id);
                true
            }
            _ => false,
        }
    }

    /// All subscriptions in registration order.
    pub fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
