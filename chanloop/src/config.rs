//! Loop configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// How often a channel without a readiness descriptor is polled while active.
///
/// This bounds the extra latency such channels see compared to descriptor-backed ones.
pub const POLL_TICK: Duration = Duration::from_millis(1);

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

pub const DEFAULT_PROCESS_BUDGET: usize = 64;

/// Tunables of a [`Loop`](crate::Loop).
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Readiness events collected per multiplexer wake.
    pub event_capacity: usize,
    /// Messages a channel may deliver per readable event before it is put on the backlog and
    /// revisited on the next turn.
    pub process_budget: usize,
    /// Serve Prometheus metrics on this address.
    pub metrics_listener: Option<SocketAddr>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            process_budget: DEFAULT_PROCESS_BUDGET,
            metrics_listener: None,
        }
    }
}

impl LoopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many readiness events one multiplexer wake collects. Zero is raised to one.
    ///
    /// # Examples
    ///
    /// ```
    /// use chanloop::LoopConfig;
    ///
    /// let config = LoopConfig::new().with_event_capacity(256);
    /// assert_eq!(config.event_capacity, 256);
    /// ```
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Sets how many messages one readable event may deliver. Zero is raised to one.
    pub fn with_process_budget(mut self, budget: usize) -> Self {
        self.process_budget = budget.max(1);
        self
    }

    /// Installs a Prometheus exporter on `addr` when the loop is created.
    pub fn with_metrics_listener(mut self, addr: SocketAddr) -> Self {
        self.metrics_listener = Some(addr);
        self
    }
}
