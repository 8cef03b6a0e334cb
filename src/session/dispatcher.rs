//! Inbound frame classification and routing
//!
//! Rules, first match wins:
//! 1. reply to the pending auth request (token or error)
//! 2. reply to a pending subscribe/unsubscribe
//! 3. id-less notification for a subscribed channel -> push
//! 4. anything else -> unrecognized, state untouched
//!
//! Malformed frames are reported and never end the session.

use crate::session::events::{PushEvent, SessionEvent};
use crate::session::messages::InboundFrame;
use crate::session::state::{RequestKind, Session, Transition};
use crate::SessionError;

/// How a frame was routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    HandshakeAccepted,
    HandshakeRejected,
    /// Subscribe/unsubscribe reply
    Reply,
    Push,
    Unrecognized,
    Malformed,
    /// Session already terminal
    Ignored,
}

/// Parse and dispatch a raw text frame
pub fn dispatch_text(session: &mut Session, text: &str) -> (Classification, Transition) {
    if session.phase().is_terminal() {
        return (Classification::Ignored, Transition::default());
    }
    match InboundFrame::parse(text) {
        Ok(frame) => dispatch(session, &frame),
        Err(e) => malformed(e),
    }
}

/// Dispatch one parsed frame against the session
pub fn dispatch(session: &mut Session, frame: &InboundFrame) -> (Classification, Transition) {
    if session.phase().is_terminal() {
        return (Classification::Ignored, Transition::default());
    }

    let id = match frame.id() {
        Ok(id) => id,
        Err(e) => return malformed(e),
    };

    if let Some(id) = id {
        match session.pending_kind(id) {
            Some(RequestKind::Auth) => return dispatch_auth_reply(session, id, frame),
            Some(RequestKind::Subscribe(_)) | Some(RequestKind::Unsubscribe(_)) => {
                return dispatch_channel_reply(session, id, frame)
            }
            None => return unrecognized(frame),
        }
    }

    match frame.notification() {
        Ok(Some(notification)) if session.is_subscribed(notification.channel) => {
            let transition = Transition {
                push: Some(PushEvent {
                    channel: notification.channel.to_string(),
                    data: notification.data.clone(),
                }),
                ..Default::default()
            };
            (Classification::Push, transition)
        }
        Ok(_) => unrecognized(frame),
        Err(e) => malformed(e),
    }
}

fn dispatch_auth_reply(
    session: &mut Session,
    id: u64,
    frame: &InboundFrame,
) -> (Classification, Transition) {
    if let Some(token) = frame.access_token() {
        return (
            Classification::HandshakeAccepted,
            session.accept_auth(id, token.to_string()),
        );
    }
    match frame.error() {
        Ok(Some(error)) => (
            Classification::HandshakeRejected,
            session.reject_auth(error.code, error.message),
        ),
        Ok(None) => malformed(SessionError::Parse(format!(
            "auth reply {id} carries neither access_token nor error"
        ))),
        Err(e) => malformed(e),
    }
}

fn dispatch_channel_reply(
    session: &mut Session,
    id: u64,
    frame: &InboundFrame,
) -> (Classification, Transition) {
    match frame.error() {
        Ok(Some(error)) => {
            return (
                Classification::Reply,
                session.reject_request(id, error.code, error.message),
            )
        }
        Ok(None) => {}
        Err(e) => return malformed(e),
    }
    if frame.result().is_some() {
        (Classification::Reply, session.confirm_request(id))
    } else {
        malformed(SessionError::Parse(format!(
            "reply {id} carries neither result nor error"
        )))
    }
}

fn unrecognized(frame: &InboundFrame) -> (Classification, Transition) {
    (
        Classification::Unrecognized,
        Transition::event(SessionEvent::Unrecognized(frame.raw().to_string())),
    )
}

fn malformed(error: SessionError) -> (Classification, Transition) {
    (Classification::Malformed, Transition::event(SessionEvent::Error(error)))
}
