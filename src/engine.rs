//! Session engine
//!
//! The engine task is the only writer of [`Session`]. Caller commands and
//! transport events are both funneled into it through channels (actor
//! model), so state changes are applied one at a time in arrival order.
//! Readers see the state through a `watch` snapshot.

use crate::infrastructure::credentials::Credentials;
use crate::infrastructure::metrics::SessionMetrics;
use crate::session::client::SessionOptions;
use crate::session::dispatcher::{dispatch_text, Classification};
use crate::session::events::{PushEvent, SessionEvent};
use crate::session::messages::encode_request;
use crate::session::state::{OutboundAction, OutboundRequest, Phase, Session, Transition};
use crate::ws::connection::{TransportEvent, TransportHandle};
use crate::{Result, SendError, SessionError};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::Level;

const COMMAND_CAPACITY: usize = 64;

/// Request from the facade to the engine
#[derive(Debug)]
pub(crate) enum Command {
    Subscribe {
        channel: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        channel: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Consistent view of the session published after every change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub phase: Phase,
    /// Confirmed subscriptions, sorted
    pub subscriptions: Vec<String>,
    pub pending_requests: usize,
    pub authenticated: bool,
    /// Reason of the terminal failure, if the session failed
    pub failure: Option<FailureReason>,
}

impl SessionSnapshot {
    fn capture(session: &Session, failure: Option<&FailureReason>) -> Self {
        Self {
            phase: session.phase(),
            subscriptions: session.subscriptions().iter().cloned().collect(),
            pending_requests: session.pending().len(),
            authenticated: session.auth_token().is_some(),
            failure: failure.cloned(),
        }
    }
}

/// Why a session ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The transport never opened
    Connect(String),
    /// The venue rejected the credentials
    Handshake { code: i64, message: String },
    /// The link dropped after it was open
    Transport(String),
}

impl FailureReason {
    fn of(error: &SessionError) -> Self {
        match error {
            SessionError::Connect(reason) => FailureReason::Connect(reason.clone()),
            SessionError::Handshake { code, message } => FailureReason::Handshake {
                code: *code,
                message: message.clone(),
            },
            SessionError::Failed(reason) => FailureReason::Transport(reason.clone()),
            other => FailureReason::Transport(other.to_string()),
        }
    }

    /// The error a caller gets for work against the failed session
    pub fn to_error(&self) -> SessionError {
        match self {
            FailureReason::Connect(reason) => SessionError::Connect(reason.clone()),
            FailureReason::Handshake { code, message } => SessionError::Handshake {
                code: *code,
                message: message.clone(),
            },
            FailureReason::Transport(reason) => SessionError::Failed(reason.clone()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_error())
    }
}

/// Caller commands, with room to set some aside while a delivery waits
struct Inbox {
    rx: mpsc::Receiver<Command>,
    open: bool,
    deferred: VecDeque<Command>,
    /// Channel closed while commands were being set aside
    hung_up: bool,
    /// A disconnect is under way or queued; deliveries stop waiting
    shutdown: bool,
}

impl Inbox {
    fn new(rx: mpsc::Receiver<Command>) -> Self {
        Self {
            rx,
            open: true,
            deferred: VecDeque::new(),
            hung_up: false,
            shutdown: false,
        }
    }

    /// Next command, set-aside ones first
    ///
    /// Yields `None` once when every handle is gone, then never resolves.
    async fn next(&mut self) -> Option<Command> {
        if let Some(command) = self.deferred.pop_front() {
            return Some(command);
        }
        if self.hung_up {
            self.hung_up = false;
            return None;
        }
        if !self.open {
            return std::future::pending().await;
        }
        let command = self.rx.recv().await;
        if command.is_none() {
            self.open = false;
        }
        command
    }

    fn set_aside(&mut self, command: Option<Command>) {
        match command {
            Some(command) => {
                if matches!(command, Command::Disconnect { .. }) {
                    self.shutdown = true;
                }
                self.deferred.push_back(command);
            }
            None => {
                self.open = false;
                self.hung_up = true;
                self.shutdown = true;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    ReceiverGone,
    /// Queue full during shutdown
    Dropped,
}

/// Hand `item` to a caller stream
///
/// A full queue is waited on so nothing is lost, but the wait keeps
/// reading commands and gives up once a disconnect arrives or the handle
/// is dropped.
async fn deliver<T>(tx: &mpsc::Sender<T>, inbox: &mut Inbox, item: T) -> Delivery {
    let item = match tx.try_send(item) {
        Ok(()) => return Delivery::Sent,
        Err(TrySendError::Closed(_)) => return Delivery::ReceiverGone,
        Err(TrySendError::Full(item)) => item,
    };
    loop {
        if inbox.shutdown {
            return Delivery::Dropped;
        }
        tokio::select! {
            permit = tx.reserve() => {
                return match permit {
                    Ok(permit) => {
                        permit.send(item);
                        Delivery::Sent
                    }
                    Err(_) => Delivery::ReceiverGone,
                };
            }
            command = inbox.rx.recv(), if inbox.open => inbox.set_aside(command),
        }
    }
}

/// Facade side of a running engine
pub(crate) struct EngineHandle {
    pub commands: mpsc::Sender<Command>,
    pub snapshot: watch::Receiver<SessionSnapshot>,
    pub pushes: mpsc::Receiver<PushEvent>,
    pub events: mpsc::Receiver<SessionEvent>,
    pub metrics: Arc<SessionMetrics>,
}

/// Spawn the engine task over an opened transport
pub(crate) fn spawn(
    transport: TransportHandle,
    transport_events: mpsc::Receiver<TransportEvent>,
    options: &SessionOptions,
) -> EngineHandle {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (push_tx, push_rx) = mpsc::channel(options.push_capacity.max(1));
    let (event_tx, event_rx) = mpsc::channel(options.event_capacity.max(1));

    let session = Session::new(options.default_channels.clone());
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::capture(&session, None));
    let metrics = Arc::new(SessionMetrics::new());

    let engine = SessionEngine {
        session,
        transport,
        transport_events,
        inbox: Inbox::new(command_rx),
        push_tx,
        event_tx,
        snapshot: snapshot_tx,
        credentials: options.credentials.clone(),
        metrics: metrics.clone(),
        close_grace: options.close_grace,
        close_deadline: None,
        disconnect_waiters: Vec::new(),
        failure: None,
    };
    tokio::spawn(engine.run());

    EngineHandle {
        commands: command_tx,
        snapshot: snapshot_rx,
        pushes: push_rx,
        events: event_rx,
        metrics,
    }
}

struct SessionEngine {
    session: Session,
    transport: TransportHandle,
    transport_events: mpsc::Receiver<TransportEvent>,
    inbox: Inbox,
    push_tx: mpsc::Sender<PushEvent>,
    event_tx: mpsc::Sender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    credentials: Credentials,
    metrics: Arc<SessionMetrics>,
    close_grace: Duration,
    /// Set while unsubscribes are flushed on disconnect
    close_deadline: Option<Instant>,
    disconnect_waiters: Vec<oneshot::Sender<()>>,
    failure: Option<FailureReason>,
}

impl SessionEngine {
    async fn run(mut self) {
        crate::log_session!(Level::DEBUG, "Session engine started");

        while !self.session.phase().is_terminal() {
            tokio::select! {
                event = self.transport_events.recv() => {
                    let event = event.unwrap_or_else(|| {
                        TransportEvent::Failed("transport task ended".to_string())
                    });
                    self.on_transport_event(event).await;
                }
                command = self.inbox.next() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        crate::log_session!(Level::INFO, "Session handle dropped, disconnecting");
                        self.begin_close().await;
                    }
                },
                _ = sleep_until(self.close_deadline) => {
                    self.close_deadline = None;
                    crate::log_session!(
                        Level::WARN,
                        grace = ?self.close_grace,
                        "Unsubscribes still pending after close grace, closing anyway"
                    );
                    let transition = self.session.force_close();
                    self.apply(transition).await;
                }
            }
        }

        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(());
        }
        crate::log_session!(Level::INFO, phase = %self.session.phase(), "Session engine stopped");
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        let transition = match event {
            TransportEvent::Opened => self.session.on_opened(),
            TransportEvent::Message(text) => {
                self.metrics.record_frame_received();
                let (classification, transition) = dispatch_text(&mut self.session, &text);
                match classification {
                    Classification::Unrecognized => self.metrics.record_unrecognized(),
                    Classification::Malformed => self.metrics.record_parse_error(),
                    _ => {}
                }
                crate::log_session!(Level::TRACE, ?classification, "Frame dispatched");
                transition
            }
            TransportEvent::Failed(reason) => self.session.on_transport_failed(&reason),
            TransportEvent::Closed => self.session.on_transport_closed(),
        };
        self.apply(transition).await;
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { channel, reply } => {
                let result = match self.session.request_subscribe(&channel) {
                    Ok(request) => self.send_issued(request).await,
                    Err(e) => Err(e),
                };
                self.publish();
                let _ = reply.send(result);
            }
            Command::Unsubscribe { channel, reply } => {
                let result = match self.session.request_unsubscribe(&channel) {
                    Ok(request) => self.send_issued(request).await,
                    Err(e) => Err(e),
                };
                self.publish();
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect_waiters.push(reply);
                self.begin_close().await;
            }
        }
    }

    async fn begin_close(&mut self) {
        self.inbox.shutdown = true;
        let already_closing = self.session.phase() == Phase::Closing;
        let transition = self.session.begin_close();
        if !already_closing && self.session.phase() == Phase::Closing && !transition.closes() {
            self.close_deadline = Some(Instant::now() + self.close_grace);
        }
        self.apply(transition).await;
    }

    /// Send a request the session just issued, rolling it back on failure
    async fn send_issued(&mut self, request: Option<OutboundRequest>) -> Result<()> {
        let Some(request) = request else {
            return Ok(());
        };
        if let Err(e) = self.send_request(&request).await {
            self.session.abandon(request.id);
            return Err(e.into());
        }
        Ok(())
    }

    async fn send_request(&mut self, request: &OutboundRequest) -> std::result::Result<(), SendError> {
        let text = encode_request(request, &self.credentials)
            .map_err(|e| SendError::Transport(e.to_string()))?;
        match self.transport.send(text).await {
            Ok(()) => {
                self.metrics.record_frame_sent();
                crate::log_session!(
                    Level::DEBUG,
                    id = request.id,
                    method = request.kind.method(),
                    "Request sent"
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.record_send_error();
                Err(e)
            }
        }
    }

    /// Carry out a transition: requests first, then push, then events
    async fn apply(&mut self, transition: Transition) {
        let Transition {
            actions,
            push,
            events,
        } = transition;

        for action in actions {
            match action {
                OutboundAction::Send(request) => {
                    if let Err(e) = self.send_request(&request).await {
                        self.session.abandon(request.id);
                        self.emit(SessionEvent::Error(SessionError::Send(e))).await;
                    }
                }
                OutboundAction::Close => {
                    self.close_deadline = None;
                    self.transport.close().await;
                }
            }
        }

        // Snapshot first, so a consumer reacting to an event sees the new phase
        if let Some(SessionEvent::Failed(error)) = events.iter().find(|e| e.is_terminal()) {
            self.failure = Some(FailureReason::of(error));
        }
        self.publish();

        if let Some(push) = push {
            match deliver(&self.push_tx, &mut self.inbox, push).await {
                Delivery::Sent => self.metrics.record_push(),
                Delivery::ReceiverGone => {
                    crate::log_session!(Level::TRACE, "Push receiver dropped");
                }
                Delivery::Dropped => {
                    crate::log_session!(Level::WARN, "Push queue full while disconnecting, push dropped");
                }
            }
        }

        for event in events {
            self.emit(event).await;
        }
    }

    async fn emit(&mut self, event: SessionEvent) {
        match &event {
            SessionEvent::Failed(error) => {
                crate::log_session!(Level::ERROR, error = %error, "Session failed");
            }
            SessionEvent::Error(error) => {
                crate::log_session!(Level::WARN, error = %error, "Session error");
            }
            SessionEvent::Unrecognized(raw) => {
                crate::log_session!(Level::DEBUG, frame = %raw, "Unrecognized frame");
            }
            other => {
                crate::log_session!(Level::INFO, event = ?other, phase = %self.session.phase(), "Session event");
            }
        }
        match deliver(&self.event_tx, &mut self.inbox, event).await {
            Delivery::Sent => {}
            Delivery::ReceiverGone => crate::log_session!(Level::TRACE, "Event receiver dropped"),
            Delivery::Dropped => {
                crate::log_session!(Level::WARN, "Event queue full while disconnecting, event dropped");
            }
        }
    }

    fn publish(&self) {
        let next = SessionSnapshot::capture(&self.session, self.failure.as_ref());
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
