//! Deribit session core
//!
//! - `state` - phase machine and request bookkeeping
//! - `dispatcher` - routes inbound frames to state transitions
//! - `messages` - JSON-RPC encoding and checked decoding
//! - `events` - caller-visible push and lifecycle events
//! - `client` - public facade over the engine task

pub mod client;
pub mod dispatcher;
pub mod events;
pub mod messages;
pub mod state;

pub use crate::engine::{FailureReason, SessionSnapshot};
pub use client::{SessionClient, SessionOptions};
pub use dispatcher::{dispatch, dispatch_text, Classification};
pub use events::{PushEvent, SessionEvent};
pub use messages::InboundFrame;
pub use state::{OutboundAction, OutboundRequest, Phase, RequestKind, Session, Transition};
