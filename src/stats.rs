//! Per-connection counters.
//!
//! Every successful connect opens a new epoch; increments always land in
//! the latest one. Nothing in the protocol path reads these values back.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::util::lock;

/// Counters for one connection epoch, keyed by name.
pub type Counters = BTreeMap<String, u64>;

#[derive(Debug)]
pub struct Stats {
    epochs: Mutex<Vec<Counters>>,
}

impl Stats {
    /// Start with a single, empty epoch.
    pub fn new() -> Self {
        Self {
            epochs: Mutex::new(vec![Counters::new()]),
        }
    }

    /// Add one to `field` in the current epoch, creating it if needed.
    pub fn increment(&self, field: &str) {
        let mut epochs = lock(&self.epochs);
        if let Some(current) = epochs.last_mut() {
            *current.entry(field.to_string()).or_insert(0) += 1;
        }
    }

    /// Open a new epoch.
    pub fn new_connection(&self) {
        lock(&self.epochs).push(Counters::new());
    }

    /// Snapshot of every epoch, oldest first.
    pub fn connection_stats(&self) -> Vec<Counters> {
        lock(&self.epochs).clone()
    }

    /// Value of `field` in the current epoch.
    pub fn current(&self, field: &str) -> u64 {
        lock(&self.epochs)
            .last()
            .and_then(|c| c.get(field).copied())
            .unwrap_or(0)
    }

    /// Log every epoch at info level.
    pub fn log_stats(&self) {
        let epochs = self.connection_stats();
        info!(epochs = epochs.len(), "connection stats");
        for (n, counters) in epochs.iter().enumerate() {
            for (field, value) in counters {
                info!(epoch = n, field = %field, value, "stat");
            }
        }
    }

    /// Log the stats every `period` until the returned task is aborted.
    ///
    /// A zero period is raised to one millisecond.
    pub fn spawn_reporter(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let stats = Arc::clone(self);
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stats.log_stats();
            }
        })
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
