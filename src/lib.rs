//! Authenticated streaming session for the Deribit JSON-RPC WebSocket API
//!
//! Core library: transport adapter, session state machine, frame dispatcher
//! and the public session facade.

pub mod engine;
pub mod infrastructure;
pub mod session;
pub mod ws;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types
pub use infrastructure::config::{Config, SessionConfig};
pub use infrastructure::credentials::Credentials;
pub use session::{
    FailureReason, Phase, PushEvent, SessionClient, SessionEvent, SessionOptions, SessionSnapshot,
};

use thiserror::Error;

/// Main error type for the streaming session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Transport could not be opened (malformed URI, refused, TLS setup)
    #[error("Connect error: {0}")]
    Connect(String),

    /// Authentication rejected by the venue
    #[error("Handshake rejected ({code}): {message}")]
    Handshake { code: i64, message: String },

    /// Malformed inbound frame
    #[error("Parse error: {0}")]
    Parse(String),

    /// Operation requires an authenticated session
    #[error("Session not ready (phase: {0})")]
    NotReady(session::Phase),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    /// Venue rejected a subscribe/unsubscribe request
    #[error("{method} rejected ({code}): {message}")]
    Rejected {
        method: String,
        code: i64,
        message: String,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Session closed before the operation could complete
    #[error("Session closed")]
    Closed,

    /// Session failed before the operation could complete
    #[error("Session failed: {0}")]
    Failed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound frame could not be handed to the transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("channel not open")]
    NotOpen,
    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    /// Whether the session keeps running after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::Parse(_)
                | SessionError::NotReady(_)
                | SessionError::Send(_)
                | SessionError::Rejected { .. }
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SessionError>;
