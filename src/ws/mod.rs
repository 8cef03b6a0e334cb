//! WebSocket transport for the session

pub mod connection;
pub mod heartbeat;
pub mod tls;

pub use connection::{
    ConnectionState, Outbound, Transport, TransportConfig, TransportEvent, TransportHandle,
};
pub use heartbeat::{Heartbeat, HeartbeatAction, HeartbeatConfig};
pub use tls::TlsVerification;
