//! Heartbeat Monitor
//!
//! Application-level liveness probing. The monitor keeps the probe
//! bookkeeping and statistics; the controller owns the timers and the socket
//! and asks the monitor what each timer expiry or response means.
//!
//! At most one probe is outstanding. A probe is resolved either by a
//! response (RTT sample) or by its timeout (miss). `max_missed` consecutive
//! misses report the connection as lost.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::HeartbeatConfig;

/// Number of RTT samples the running average covers.
pub const RTT_WINDOW: usize = 100;

/// Snapshot of heartbeat counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStats {
    /// Probes sent since the monitor last started.
    pub total_sent: u64,
    /// Successful responses.
    pub total_received: u64,
    /// Probes that timed out or were answered with an error.
    pub total_timeouts: u64,
    /// Mean of the last [`RTT_WINDOW`] round trips, in milliseconds.
    pub average_rtt: f64,
    /// Most recent round trip, in milliseconds.
    pub last_rtt: u64,
    /// Time since the monitor last started.
    pub connection_uptime: Duration,
}

/// Bounded window of RTT samples.
#[derive(Debug, Clone, Default)]
pub struct RttWindow {
    samples: VecDeque<u64>,
    sum: u64,
}

impl RttWindow {
    /// Add a sample, evicting the oldest beyond [`RTT_WINDOW`].
    pub fn push(&mut self, rtt_ms: u64) {
        self.samples.push_back(rtt_ms);
        self.sum += rtt_ms;
        if self.samples.len() > RTT_WINDOW {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
    }

    /// Arithmetic mean of the retained samples, 0 when empty.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum as f64 / self.samples.len() as f64
        }
    }

    /// Retained sample count.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples are retained.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Result of a probe timing out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Miss {
    /// Consecutive misses so far.
    pub missed: u32,
    /// Configured threshold.
    pub max_missed: u32,
}

impl Miss {
    /// Whether the threshold has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.missed >= self.max_missed
    }
}

/// Result of a heartbeat response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Probe answered successfully.
    Received {
        /// Round trip of the answered probe.
        rtt: Duration,
    },
    /// Server answered with an error code; counted as a miss.
    Rejected(Miss),
    /// Response arrived with no probe outstanding.
    Unsolicited,
}

/// Heartbeat state.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    active: bool,
    missed: u32,
    outstanding: Option<Instant>,
    last_sent_at: Option<Instant>,
    started_at: Option<Instant>,
    counters: HeartbeatStats,
    rtts: RttWindow,
}

impl HeartbeatMonitor {
    /// Create an inactive monitor.
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            active: false,
            missed: 0,
            outstanding: None,
            last_sent_at: None,
            started_at: None,
            counters: HeartbeatStats::default(),
            rtts: RttWindow::default(),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> HeartbeatConfig {
        self.config
    }

    /// Replace the configuration. The caller restarts the monitor if active.
    pub fn set_config(&mut self, config: HeartbeatConfig) {
        self.config = config;
    }

    /// Whether probing is running.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Consecutive misses.
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// When the last probe was sent.
    pub fn last_sent_at(&self) -> Option<Instant> {
        self.last_sent_at
    }

    /// Whether a probe is awaiting its response.
    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Start probing, resetting statistics.
    pub fn start(&mut self, now: Instant) {
        self.active = true;
        self.missed = 0;
        self.outstanding = None;
        self.started_at = Some(now);
        self.counters = HeartbeatStats::default();
        self.rtts = RttWindow::default();
    }

    /// Stop probing. Statistics stay readable until the next start.
    pub fn stop(&mut self) {
        self.active = false;
        self.outstanding = None;
    }

    /// Record a probe going out. Returns `false` if one is already in flight.
    pub fn begin_probe(&mut self, now: Instant) -> bool {
        if self.outstanding.is_some() {
            return false;
        }
        self.outstanding = Some(now);
        self.last_sent_at = Some(now);
        self.counters.total_sent += 1;
        true
    }

    /// The outstanding probe's timeout fired.
    pub fn on_timeout(&mut self) -> Miss {
        self.outstanding = None;
        self.missed += 1;
        self.counters.total_timeouts += 1;
        Miss {
            missed: self.missed,
            max_missed: self.config.max_missed,
        }
    }

    /// A heartbeat response arrived with the given result code.
    pub fn on_response(&mut self, now: Instant, code: i64) -> ResponseOutcome {
        let Some(sent_at) = self.outstanding else {
            return ResponseOutcome::Unsolicited;
        };

        if code != 0 {
            return ResponseOutcome::Rejected(self.on_timeout());
        }

        self.outstanding = None;
        self.missed = 0;

        let rtt = now.saturating_duration_since(sent_at);
        let rtt_ms = rtt.as_millis() as u64;
        self.counters.total_received += 1;
        self.counters.last_rtt = rtt_ms;
        self.rtts.push(rtt_ms);
        self.counters.average_rtt = self.rtts.average();

        ResponseOutcome::Received { rtt }
    }

    /// Statistics snapshot.
    pub fn stats(&self, now: Instant) -> HeartbeatStats {
        let mut stats = self.counters.clone();
        if let Some(started) = self.started_at {
            stats.connection_uptime = now.saturating_duration_since(started);
        }
        stats
    }
}
