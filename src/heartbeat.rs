use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, Span, debug, trace};

use crate::codec::StompItem;
use crate::stats::Stats;

/// Parse the STOMP `heart-beat` header value (format: "cx,cy").
///
/// Parameters
/// - `header`: header string from the server or client (for example
///   "10000,10000"). The values represent milliseconds.
///
/// Returns a tuple `(cx, cy)` where each value is the heartbeat interval in
/// milliseconds. Missing or invalid fields default to `0`.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let cx = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let cy = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    (cx, cy)
}

/// Periodically writes a heartbeat (a bare LF) to the outbound queue of a
/// connection.
///
/// The task stops on its own once the connection's writer is gone;
/// [`Heartbeater::shutdown`] stops it right away and may be called any
/// number of times.
#[derive(Debug)]
pub struct Heartbeater {
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl Heartbeater {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Spawn the periodic task. The first beat is sent one interval from
    /// now. Restarting replaces any previous task.
    pub fn start(
        &mut self,
        outbound: mpsc::UnboundedSender<StompItem>,
        stats: Arc<Stats>,
        span: Span,
    ) {
        self.shutdown();
        let period = self.interval;
        debug!(interval_ms = period.as_millis() as u64, "starting heartbeat");
        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if outbound.send(StompItem::Heartbeat).is_err() {
                        trace!("outbound queue closed, heartbeat exiting");
                        break;
                    }
                    stats.increment("heartbeats_sent");
                }
            }
            .instrument(span),
        );
        self.task = Some(task);
    }

    /// Stop the periodic task if one is running.
    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("heartbeat stopped");
        }
    }
}

impl Drop for Heartbeater {
    fn drop(&mut self) {
        self.shutdown();
    }
}
