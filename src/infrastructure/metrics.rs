//! Session counters
//!
//! Lock-free counters updated by the session engine and read through
//! snapshots by the facade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

/// Per-session metrics
#[derive(Debug)]
pub struct SessionMetrics {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    pushes_delivered: AtomicU64,
    unrecognized_frames: AtomicU64,
    parse_errors: AtomicU64,
    send_errors: AtomicU64,
    /// Unix millis of the last inbound frame
    last_frame_time: AtomicU64,
    start_time: Instant,
}

/// Point-in-time copy of [`SessionMetrics`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub pushes_delivered: u64,
    pub unrecognized_frames: u64,
    pub parse_errors: u64,
    pub send_errors: u64,
    pub last_frame_time_ms: u64,
    pub frame_rate: f64,
    pub uptime_seconds: u64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            pushes_delivered: AtomicU64::new(0),
            unrecognized_frames: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    #[inline]
    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_frame_time.store(now, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_push(&self) {
        self.pushes_delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unrecognized(&self) {
        self.unrecognized_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let frames_received = self.frames_received.load(Ordering::Relaxed);
        let uptime = self.start_time.elapsed().as_secs();
        let rate = if uptime > 0 {
            frames_received as f64 / uptime as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            frames_received,
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            pushes_delivered: self.pushes_delivered.load(Ordering::Relaxed),
            unrecognized_frames: self.unrecognized_frames.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            last_frame_time_ms: self.last_frame_time.load(Ordering::Relaxed),
            frame_rate: rate,
            uptime_seconds: uptime,
        }
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}
