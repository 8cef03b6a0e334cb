//! Idle-link detection for the transport event loop
//!
//! The loop ticks once per interval. A tick that finds no inbound traffic
//! since the previous interval sends a ping and counts a miss; any inbound
//! frame (pongs included) resets the count. Too many consecutive misses
//! mark the link dead.

use std::time::Duration;
use tokio::time::Instant;

/// Heartbeat settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_missed: 3,
        }
    }
}

/// What the loop should do on a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Traffic seen recently
    Idle,
    SendPing,
    /// Too many missed intervals
    Dead,
}

/// Per-connection heartbeat tracker
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    missed: u32,
    last_activity: Instant,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            missed: 0,
            last_activity: Instant::now(),
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Record inbound traffic
    #[inline]
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
        self.missed = 0;
    }

    /// Evaluate link health at `now`
    pub fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        if now.saturating_duration_since(self.last_activity) < self.config.interval {
            return HeartbeatAction::Idle;
        }
        self.missed += 1;
        if self.missed >= self.config.max_missed {
            HeartbeatAction::Dead
        } else {
            HeartbeatAction::SendPing
        }
    }

    pub fn missed_count(&self) -> u32 {
        self.missed
    }
}
