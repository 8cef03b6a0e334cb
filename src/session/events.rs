//! Caller-visible session output: push data and lifecycle notifications

use crate::SessionError;
use serde_json::Value;

/// Streaming data for a subscribed channel
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub channel: String,
    pub data: Value,
}

/// Lifecycle and error notifications
///
/// Push payloads are not repeated here; they travel on the push stream.
#[derive(Debug)]
pub enum SessionEvent {
    /// Transport channel opened, handshake started
    Connected,
    /// Handshake accepted, token stored
    Authenticated,
    Subscribed(String),
    Unsubscribed(String),
    /// Frame that matched no pending request and no subscribed channel
    Unrecognized(String),
    /// Recoverable error, session continues
    Error(SessionError),
    /// Terminal failure, reported once
    Failed(SessionError),
    /// Session closed after disconnect
    Closed,
}

impl SessionEvent {
    /// Whether this event ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Failed(_) | SessionEvent::Closed)
    }
}
