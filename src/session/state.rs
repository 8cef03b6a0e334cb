//! Session state machine
//!
//! Tracks the connection phase, auth token, in-flight requests and confirmed
//! subscriptions. Every mutation goes through a method here and returns a
//! [`Transition`] describing what the owner has to send and report.
//!
//! Phases:
//!
//! ```text
//! Connecting -> Authenticating -> Authenticated -> Subscribing -> Streaming
//!      \              \                                              |
//!       +--------------+------------ Closing -> Closed <-------------+
//! any non-terminal --(transport failure | handshake rejected)--> Failed
//! ```

use crate::session::events::{PushEvent, SessionEvent};
use crate::SessionError;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Transport opening
    Connecting,
    /// Auth request in flight
    Authenticating,
    /// Token held, no subscription requested yet
    Authenticated,
    /// Subscribe request(s) in flight
    Subscribing,
    /// At least one subscription confirmed
    Streaming,
    /// Disconnect requested
    Closing,
    Closed,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Connecting => "connecting",
            Phase::Authenticating => "authenticating",
            Phase::Authenticated => "authenticated",
            Phase::Subscribing => "subscribing",
            Phase::Streaming => "streaming",
            Phase::Closing => "closing",
            Phase::Closed => "closed",
            Phase::Failed => "failed",
        }
    }

    /// No transition leaves a terminal phase
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Closed | Phase::Failed)
    }

    /// Phases in which the session holds a token and accepts (un)subscribe calls
    #[inline]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Phase::Authenticated | Phase::Subscribing | Phase::Streaming)
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        *self == Phase::Streaming
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a pending request id refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Auth,
    Subscribe(String),
    Unsubscribe(String),
}

/// Request to be encoded and sent by the session owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub id: u64,
    pub kind: RequestKind,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    Send(OutboundRequest),
    /// Close the transport
    Close,
}

/// Output of a single state change
#[derive(Debug, Default)]
pub struct Transition {
    pub actions: Vec<OutboundAction>,
    pub push: Option<PushEvent>,
    pub events: Vec<SessionEvent>,
}

impl Transition {
    pub(crate) fn event(event: SessionEvent) -> Self {
        Self {
            events: vec![event],
            ..Default::default()
        }
    }

    /// Outbound requests, in send order
    pub fn requests(&self) -> impl Iterator<Item = &OutboundRequest> {
        self.actions.iter().filter_map(|action| match action {
            OutboundAction::Send(request) => Some(request),
            OutboundAction::Close => None,
        })
    }

    pub fn closes(&self) -> bool {
        self.actions.contains(&OutboundAction::Close)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.push.is_none() && self.events.is_empty()
    }
}

/// Session state owned by a single writer
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    phase: Phase,
    auth_token: Option<String>,
    pending: BTreeMap<u64, RequestKind>,
    subscriptions: BTreeSet<String>,
    next_request_id: u64,
    default_channels: Vec<String>,
}

impl Session {
    /// New session in `Connecting`, auto-subscribing to `default_channels` after auth
    pub fn new(default_channels: Vec<String>) -> Self {
        Self {
            phase: Phase::Connecting,
            auth_token: None,
            pending: BTreeMap::new(),
            subscriptions: BTreeSet::new(),
            next_request_id: 1,
            default_channels,
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn subscriptions(&self) -> &BTreeSet<String> {
        &self.subscriptions
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.contains(channel)
    }

    pub fn pending(&self) -> &BTreeMap<u64, RequestKind> {
        &self.pending
    }

    pub fn pending_kind(&self, id: u64) -> Option<&RequestKind> {
        self.pending.get(&id)
    }

    pub fn default_channels(&self) -> &[String] {
        &self.default_channels
    }

    fn has_pending(&self, kind: &RequestKind) -> bool {
        self.pending.values().any(|pending| pending == kind)
    }

    fn has_pending_unsubscribes(&self) -> bool {
        self.pending
            .values()
            .any(|kind| matches!(kind, RequestKind::Unsubscribe(_)))
    }

    fn has_pending_subscribes(&self) -> bool {
        self.pending
            .values()
            .any(|kind| matches!(kind, RequestKind::Subscribe(_)))
    }

    /// Allocate a fresh id and record the request as pending
    fn issue(&mut self, kind: RequestKind) -> OutboundRequest {
        let id = self.next_request_id;
        self.next_request_id += 1;
        self.pending.insert(id, kind.clone());
        OutboundRequest { id, kind }
    }

    /// Enter a terminal phase, dropping token and in-flight requests
    fn terminate(&mut self, phase: Phase) {
        debug_assert!(phase.is_terminal());
        self.phase = phase;
        self.auth_token = None;
        self.pending.clear();
    }

    /// Transport opened: start the handshake
    pub fn on_opened(&mut self) -> Transition {
        if self.phase != Phase::Connecting {
            return Transition::default();
        }
        self.phase = Phase::Authenticating;
        let auth = self.issue(RequestKind::Auth);
        Transition {
            actions: vec![OutboundAction::Send(auth)],
            push: None,
            events: vec![SessionEvent::Connected],
        }
    }

    /// Transport reported a failure
    ///
    /// Before the link ever opened this is a connect failure.
    pub fn on_transport_failed(&mut self, reason: &str) -> Transition {
        if self.phase.is_terminal() {
            return Transition::default();
        }
        let error = if self.phase == Phase::Connecting {
            SessionError::Connect(reason.to_string())
        } else {
            SessionError::Failed(reason.to_string())
        };
        self.terminate(Phase::Failed);
        Transition::event(SessionEvent::Failed(error))
    }

    /// Transport reported closure
    ///
    /// Expected while `Closing`; anywhere else the peer dropped us and the
    /// session fails.
    pub fn on_transport_closed(&mut self) -> Transition {
        match self.phase {
            Phase::Closed | Phase::Failed => Transition::default(),
            Phase::Closing => {
                self.terminate(Phase::Closed);
                Transition::event(SessionEvent::Closed)
            }
            _ => {
                self.terminate(Phase::Failed);
                Transition::event(SessionEvent::Failed(SessionError::Failed(
                    "connection closed by peer".to_string(),
                )))
            }
        }
    }

    /// Disconnect requested
    ///
    /// Idempotent. The transport is closed right away unless unsubscribes are
    /// still in flight; those are flushed first.
    pub fn begin_close(&mut self) -> Transition {
        if self.phase.is_terminal() || self.phase == Phase::Closing {
            return Transition::default();
        }
        self.phase = Phase::Closing;
        self.auth_token = None;

        let mut transition = Transition::default();
        if !self.has_pending_unsubscribes() {
            transition.actions.push(OutboundAction::Close);
        }
        transition
    }

    /// Close grace period elapsed with unsubscribes still in flight
    pub fn force_close(&mut self) -> Transition {
        if self.phase != Phase::Closing {
            return Transition::default();
        }
        self.pending
            .retain(|_, kind| !matches!(kind, RequestKind::Unsubscribe(_)));
        Transition {
            actions: vec![OutboundAction::Close],
            ..Default::default()
        }
    }

    /// Caller asked to subscribe to `channel`
    ///
    /// Returns `Ok(None)` when the channel is already subscribed or a
    /// subscribe for it is in flight.
    pub fn request_subscribe(
        &mut self,
        channel: &str,
    ) -> Result<Option<OutboundRequest>, SessionError> {
        if !self.phase.is_authenticated() {
            return Err(SessionError::NotReady(self.phase));
        }
        let subscribe = RequestKind::Subscribe(channel.to_string());
        let unsubscribing = self.has_pending(&RequestKind::Unsubscribe(channel.to_string()));
        if self.has_pending(&subscribe) || (self.is_subscribed(channel) && !unsubscribing) {
            return Ok(None);
        }

        let request = self.issue(subscribe);
        if self.phase == Phase::Authenticated {
            self.phase = Phase::Subscribing;
        }
        Ok(Some(request))
    }

    /// Caller asked to unsubscribe from `channel`
    ///
    /// The channel stays in `subscriptions` until the venue confirms.
    pub fn request_unsubscribe(
        &mut self,
        channel: &str,
    ) -> Result<Option<OutboundRequest>, SessionError> {
        if !self.phase.is_authenticated() {
            return Err(SessionError::NotReady(self.phase));
        }
        let unsubscribe = RequestKind::Unsubscribe(channel.to_string());
        let subscribing = self.has_pending(&RequestKind::Subscribe(channel.to_string()));
        if self.has_pending(&unsubscribe) || (!self.is_subscribed(channel) && !subscribing) {
            return Ok(None);
        }
        Ok(Some(self.issue(unsubscribe)))
    }

    /// Forget a subscribe/unsubscribe that never reached the wire
    ///
    /// A later call for the same channel issues the request again.
    pub fn abandon(&mut self, id: u64) {
        if !matches!(
            self.pending.get(&id),
            Some(RequestKind::Subscribe(_) | RequestKind::Unsubscribe(_))
        ) {
            return;
        }
        self.pending.remove(&id);
        if self.phase == Phase::Subscribing
            && self.subscriptions.is_empty()
            && !self.has_pending_subscribes()
        {
            self.phase = Phase::Authenticated;
        }
    }

    /// Auth reply carrying a token
    pub(crate) fn accept_auth(&mut self, id: u64, token: String) -> Transition {
        self.pending.remove(&id);
        if self.phase != Phase::Authenticating {
            // Disconnect raced the handshake
            return Transition::default();
        }
        self.auth_token = Some(token);
        self.phase = Phase::Authenticated;

        let mut transition = Transition::event(SessionEvent::Authenticated);
        let defaults = self.default_channels.clone();
        for channel in &defaults {
            // Phase is Authenticated or Subscribing here, never NotReady
            if let Ok(Some(request)) = self.request_subscribe(channel) {
                transition.actions.push(OutboundAction::Send(request));
            }
        }
        transition
    }

    /// Auth reply carrying an error
    pub(crate) fn reject_auth(&mut self, code: i64, message: String) -> Transition {
        self.terminate(Phase::Failed);
        Transition {
            actions: vec![OutboundAction::Close],
            push: None,
            events: vec![SessionEvent::Failed(SessionError::Handshake { code, message })],
        }
    }

    /// Successful reply to a pending subscribe/unsubscribe
    pub(crate) fn confirm_request(&mut self, id: u64) -> Transition {
        let mut transition = Transition::default();
        match self.pending.remove(&id) {
            Some(RequestKind::Subscribe(channel)) => {
                self.subscriptions.insert(channel.clone());
                if matches!(self.phase, Phase::Authenticated | Phase::Subscribing) {
                    self.phase = Phase::Streaming;
                }
                transition.events.push(SessionEvent::Subscribed(channel));
            }
            Some(RequestKind::Unsubscribe(channel)) => {
                self.subscriptions.remove(&channel);
                transition.events.push(SessionEvent::Unsubscribed(channel));
                if self.phase == Phase::Closing && !self.has_pending_unsubscribes() {
                    transition.actions.push(OutboundAction::Close);
                }
            }
            Some(RequestKind::Auth) | None => {}
        }
        transition
    }

    /// Error reply to a pending subscribe/unsubscribe
    pub(crate) fn reject_request(&mut self, id: u64, code: i64, message: String) -> Transition {
        let mut transition = Transition::default();
        let method = match self.pending.remove(&id) {
            Some(RequestKind::Subscribe(_)) => {
                if self.phase == Phase::Subscribing
                    && self.subscriptions.is_empty()
                    && !self.has_pending_subscribes()
                {
                    self.phase = Phase::Authenticated;
                }
                crate::session::messages::METHOD_SUBSCRIBE
            }
            Some(RequestKind::Unsubscribe(_)) => {
                if self.phase == Phase::Closing && !self.has_pending_unsubscribes() {
                    transition.actions.push(OutboundAction::Close);
                }
                crate::session::messages::METHOD_UNSUBSCRIBE
            }
            Some(RequestKind::Auth) | None => return transition,
        };
        transition.events.push(SessionEvent::Error(SessionError::Rejected {
            method: method.to_string(),
            code,
            message,
        }));
        transition
    }
}
