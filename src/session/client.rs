//! Public session facade
//!
//! [`SessionClient`] opens the transport, starts the engine task and exposes
//! the caller-facing operations. All state changes go through the engine;
//! the client only sends commands and reads snapshots.

use crate::engine::{self, Command, SessionSnapshot};
use crate::infrastructure::config::SessionConfig;
use crate::infrastructure::credentials::Credentials;
use crate::infrastructure::metrics::{MetricsSnapshot, SessionMetrics};
use crate::session::events::{PushEvent, SessionEvent};
use crate::session::state::Phase;
use crate::ws::connection::{Transport, TransportConfig, TransportEvent, TransportHandle};
use crate::ws::heartbeat::HeartbeatConfig;
use crate::ws::tls::TlsVerification;
use crate::{Result, SessionError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Everything a session needs besides the URI
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub credentials: Credentials,
    /// Subscribed automatically once authenticated
    pub default_channels: Vec<String>,
    pub tls: TlsVerification,
    pub connect_timeout: Duration,
    /// How long disconnect waits for in-flight unsubscribes
    pub close_grace: Duration,
    pub push_capacity: usize,
    pub event_capacity: usize,
    pub heartbeat: Option<HeartbeatConfig>,
}

impl SessionOptions {
    /// Defaults from [`SessionConfig::default`]
    pub fn new(credentials: Credentials) -> Self {
        Self::from_config(&SessionConfig::default(), credentials)
    }

    pub fn from_config(config: &SessionConfig, credentials: Credentials) -> Self {
        Self {
            credentials,
            default_channels: config.default_channels.clone(),
            tls: config.tls_verification,
            connect_timeout: config.connect_timeout(),
            close_grace: config.close_grace(),
            push_capacity: config.push_capacity,
            event_capacity: config.event_capacity,
            heartbeat: config.heartbeat(),
        }
    }

    pub fn with_default_channels(mut self, channels: Vec<String>) -> Self {
        self.default_channels = channels;
        self
    }

    pub fn with_tls(mut self, tls: TlsVerification) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Option<HeartbeatConfig>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            tls: self.tls,
            connect_timeout: self.connect_timeout,
            close_timeout: self.close_grace,
            // Inbound frames share the push budget
            event_capacity: self.push_capacity,
            heartbeat: self.heartbeat,
            ..TransportConfig::default()
        }
    }
}

/// Handle to one streaming session
///
/// Dropping the client disconnects the session.
pub struct SessionClient {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    pushes: Option<mpsc::Receiver<PushEvent>>,
    events: Option<mpsc::Receiver<SessionEvent>>,
    metrics: Arc<SessionMetrics>,
}

impl SessionClient {
    /// Open the transport and start the session
    ///
    /// Returns as soon as the transport task exists; the handshake and the
    /// default subscriptions happen in the background. Use
    /// [`wait_ready`](Self::wait_ready) to wait for streaming.
    ///
    /// # Errors
    /// [`SessionError::Connect`] if the URI is malformed or TLS setup fails.
    pub fn connect(uri: &str, options: SessionOptions) -> Result<Self> {
        let (transport, transport_events) = Transport::open(uri, &options.transport_config())?;
        Ok(Self::start(transport, transport_events, options))
    }

    pub(crate) fn start(
        transport: TransportHandle,
        transport_events: mpsc::Receiver<TransportEvent>,
        options: SessionOptions,
    ) -> Self {
        let handle = engine::spawn(transport, transport_events, &options);
        Self {
            commands: handle.commands,
            snapshot: handle.snapshot,
            pushes: Some(handle.pushes),
            events: Some(handle.events),
            metrics: handle.metrics,
        }
    }

    /// Subscribe to `channel`
    ///
    /// Resolves once the request is sent; confirmation arrives as
    /// [`SessionEvent::Subscribed`]. Subscribing to a channel that is
    /// subscribed or pending sends nothing.
    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.request(Command::Subscribe { channel: channel.to_string(), reply }, response)
            .await
    }

    /// Unsubscribe from `channel`
    ///
    /// The channel keeps delivering pushes until the venue confirms.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.request(Command::Unsubscribe { channel: channel.to_string(), reply }, response)
            .await
    }

    async fn request(
        &self,
        command: Command,
        response: oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        if self.commands.send(command).await.is_err() {
            return Err(self.terminal_error());
        }
        response.await.map_err(|_| self.terminal_error())?
    }

    /// Close the session
    ///
    /// Idempotent and safe to call from several tasks; resolves once the
    /// session is closed or failed.
    pub async fn disconnect(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).await.is_ok() {
            // Sender dropped only when the engine has stopped
            let _ = done.await;
        }
    }

    /// Wait until the session is streaming
    ///
    /// # Errors
    /// [`SessionError::Timeout`] after `limit`; [`SessionError::Closed`] as
    /// soon as a disconnect begins. A failed session returns its failure:
    /// [`SessionError::Connect`] when the link never opened,
    /// [`SessionError::Handshake`] when the credentials were rejected,
    /// [`SessionError::Failed`] otherwise.
    pub async fn wait_ready(&self, limit: Duration) -> Result<()> {
        let mut snapshot = self.snapshot.clone();
        let wait = async move {
            loop {
                if let Some(outcome) = readiness(&snapshot.borrow_and_update()) {
                    return outcome;
                }
                if snapshot.changed().await.is_err() {
                    return readiness(&snapshot.borrow()).unwrap_or(Err(SessionError::Closed));
                }
            }
        };
        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| SessionError::Timeout(format!("session not ready after {limit:?}")))?
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.phase().is_ready()
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.snapshot.borrow().phase
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Push stream; `None` after the first call
    pub fn push_events(&mut self) -> Option<mpsc::Receiver<PushEvent>> {
        self.pushes.take()
    }

    /// Lifecycle event stream; `None` after the first call
    pub fn events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn terminal_error(&self) -> SessionError {
        let snapshot = self.snapshot.borrow();
        match (&snapshot.phase, &snapshot.failure) {
            (Phase::Failed, Some(reason)) => reason.to_error(),
            (Phase::Failed, None) => SessionError::Failed("session failed".to_string()),
            _ => SessionError::Closed,
        }
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("snapshot", &*self.snapshot.borrow())
            .finish_non_exhaustive()
    }
}

fn readiness(snapshot: &SessionSnapshot) -> Option<Result<()>> {
    match snapshot.phase {
        Phase::Streaming => Some(Ok(())),
        Phase::Closing | Phase::Closed => Some(Err(SessionError::Closed)),
        Phase::Failed => Some(Err(match &snapshot.failure {
            Some(reason) => reason.to_error(),
            None => SessionError::Failed("session failed".to_string()),
        })),
        Phase::Connecting | Phase::Authenticating | Phase::Authenticated | Phase::Subscribing => {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FailureReason;
    use crate::test_utils::{auth_ok, loopback_transport, push, rpc_error, LoopbackPeer};
    use crate::ws::connection::Outbound;
    use serde_json::json;

    const BTC_INDEX: &str = "deribit_price_index.btc_usd";

    fn options() -> SessionOptions {
        SessionOptions::new(Credentials::new("client", "secret"))
            .with_default_channels(vec![BTC_INDEX.to_string()])
    }

    fn start() -> (SessionClient, LoopbackPeer) {
        let (handle, events, peer) = loopback_transport();
        (SessionClient::start(handle, events, options()), peer)
    }

    async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended")
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_uri() {
        let result = SessionClient::connect("not a uri", options());
        assert!(matches!(result, Err(SessionError::Connect(_))));

        let result = SessionClient::connect("http://test.deribit.com/ws/api/v2", options());
        assert!(matches!(result, Err(SessionError::Connect(_))));
    }

    #[tokio::test]
    async fn test_subscribe_while_connecting_is_not_ready() {
        let (client, mut peer) = start();
        let result = client.subscribe("book.BTC-PERPETUAL.raw").await;
        assert!(matches!(result, Err(SessionError::NotReady(Phase::Connecting))));
        assert!(peer.try_next_outbound().is_none());
    }

    #[tokio::test]
    async fn test_handshake_then_streaming() {
        let (mut client, mut peer) = start();
        let mut events = client.events().unwrap();
        let mut pushes = client.push_events().unwrap();
        assert!(client.push_events().is_none());
        assert!(client.events().is_none());

        peer.open().await;
        let auth = peer.next_request().await;
        assert_eq!(auth["jsonrpc"], "2.0");
        assert_eq!(auth["method"], "public/auth");
        assert_eq!(auth["params"]["grant_type"], "client_credentials");
        assert_eq!(auth["params"]["client_id"], "client");
        assert_eq!(auth["params"]["client_secret"], "secret");
        assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));

        peer.deliver(auth_ok(&auth["id"])).await;
        assert!(matches!(next_event(&mut events).await, SessionEvent::Authenticated));
        assert!(client.snapshot().authenticated);

        let subscribe = peer.next_request().await;
        assert_eq!(subscribe["method"], "public/subscribe");
        assert_eq!(subscribe["params"]["channels"], json!([BTC_INDEX]));
        assert_ne!(subscribe["id"], auth["id"]);
        assert!(!client.is_ready());

        peer.deliver(json!({"jsonrpc": "2.0", "id": subscribe["id"], "result": [BTC_INDEX]}).to_string())
            .await;
        client.wait_ready(Duration::from_secs(2)).await.unwrap();
        assert!(client.is_ready());
        assert!(matches!(next_event(&mut events).await, SessionEvent::Subscribed(c) if c == BTC_INDEX));
        assert_eq!(client.snapshot().subscriptions, vec![BTC_INDEX.to_string()]);

        peer.deliver(push(BTC_INDEX, json!({"price": 65000.5}))).await;
        let received = pushes.recv().await.unwrap();
        assert_eq!(received, PushEvent { channel: BTC_INDEX.to_string(), data: json!({"price": 65000.5}) });
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let (mut client, mut peer) = start();
        let mut events = client.events().unwrap();

        peer.open().await;
        let auth = peer.next_request().await;
        peer.deliver(rpc_error(&auth["id"], 13009, "invalid_credentials")).await;

        let result = client.wait_ready(Duration::from_secs(2)).await;
        assert!(matches!(result, Err(SessionError::Handshake { code: 13009, .. })));
        assert_eq!(client.phase(), Phase::Failed);
        assert!(!client.snapshot().authenticated);

        assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
        match next_event(&mut events).await {
            SessionEvent::Failed(SessionError::Handshake { code, message }) => {
                assert_eq!(code, 13009);
                assert_eq!(message, "invalid_credentials");
            }
            other => panic!("unexpected event {other:?}"),
        }
        // Only a close follows, never a subscribe
        assert_eq!(peer.next_outbound().await, Outbound::Close);
        assert!(peer.try_next_outbound().is_none());

        let result = client.subscribe(BTC_INDEX).await;
        assert!(matches!(result, Err(SessionError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_failure_before_open_is_connect_error() {
        let (mut client, peer) = start();
        let mut events = client.events().unwrap();
        peer.fail("connection refused").await;

        let result = client.wait_ready(Duration::from_secs(2)).await;
        assert!(matches!(result, Err(SessionError::Connect(ref reason)) if reason == "connection refused"));
        assert_eq!(
            client.snapshot().failure,
            Some(FailureReason::Connect("connection refused".to_string()))
        );
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Failed(SessionError::Connect(_))
        ));
        assert!(matches!(client.subscribe(BTC_INDEX).await, Err(SessionError::Connect(_))));
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let (client, _peer) = start();
        let result = client.wait_ready(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(SessionError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_disconnect_unblocks_wait_ready() {
        let (client, mut peer) = start();
        let client = Arc::new(client);

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.wait_ready(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        let disconnect = client.disconnect();
        let peer_side = async {
            assert_eq!(peer.next_outbound().await, Outbound::Close);
            peer.closed().await;
        };
        tokio::join!(disconnect, peer_side);

        assert!(matches!(waiter.await.unwrap(), Err(SessionError::Closed)));
        assert_eq!(client.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_disconnect_sends_one_close() {
        let (client, mut peer) = start();
        let client = Arc::new(client);
        peer.authenticate().await;
        peer.confirm_next_subscribe().await;
        client.wait_ready(Duration::from_secs(2)).await.unwrap();

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.disconnect().await }
        });
        let second = tokio::spawn({
            let client = client.clone();
            async move { client.disconnect().await }
        });

        assert_eq!(peer.next_outbound().await, Outbound::Close);
        peer.closed().await;
        first.await.unwrap();
        second.await.unwrap();
        client.disconnect().await;

        assert_eq!(peer.count_closes(), 0);
        assert_eq!(client.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn test_unexpected_close_fails_session() {
        let (mut client, mut peer) = start();
        let mut events = client.events().unwrap();
        peer.authenticate().await;
        peer.confirm_next_subscribe().await;
        client.wait_ready(Duration::from_secs(2)).await.unwrap();

        peer.closed().await;
        loop {
            if let SessionEvent::Failed(error) = next_event(&mut events).await {
                assert!(matches!(error, SessionError::Failed(_)));
                break;
            }
        }
        assert_eq!(client.phase(), Phase::Failed);
        assert!(client.snapshot().failure.is_some());
    }

    #[tokio::test]
    async fn test_transport_failure_reported_once() {
        let (mut client, mut peer) = start();
        let mut events = client.events().unwrap();
        peer.open().await;
        peer.next_request().await;
        peer.fail("connection reset").await;

        assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
        match next_event(&mut events).await {
            SessionEvent::Failed(SessionError::Failed(reason)) => {
                assert_eq!(reason, "connection reset")
            }
            other => panic!("unexpected event {other:?}"),
        }
        // Engine stopped: the stream ends without a second failure
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_resubscribe() {
        let (mut client, mut peer) = start();
        let mut events = client.events().unwrap();
        peer.authenticate().await;
        peer.confirm_next_subscribe().await;
        client.wait_ready(Duration::from_secs(2)).await.unwrap();

        client.unsubscribe(BTC_INDEX).await.unwrap();
        // Duplicate while pending: nothing sent
        client.unsubscribe(BTC_INDEX).await.unwrap();
        let unsubscribe = peer.next_request().await;
        assert_eq!(unsubscribe["method"], "public/unsubscribe");
        assert!(peer.try_next_outbound().is_none());

        peer.deliver(json!({"id": unsubscribe["id"], "result": [BTC_INDEX]}).to_string())
            .await;
        while !matches!(next_event(&mut events).await, SessionEvent::Unsubscribed(_)) {}
        assert!(client.snapshot().subscriptions.is_empty());
        // Streaming persists with no subscriptions left
        assert_eq!(client.phase(), Phase::Streaming);

        client.subscribe(BTC_INDEX).await.unwrap();
        let subscribe = peer.next_request().await;
        assert_eq!(subscribe["method"], "public/subscribe");
        assert_eq!(subscribe["params"]["channels"], json!([BTC_INDEX]));
    }

    #[test]
    fn test_options_from_config() {
        let config = SessionConfig {
            default_channels: vec!["a".into(), "b".into()],
            close_grace_ms: 500,
            heartbeat_interval_secs: 0,
            tls_verification: TlsVerification::Insecure,
            ..SessionConfig::default()
        };
        let options = SessionOptions::from_config(&config, Credentials::new("x", "y"));
        assert_eq!(options.default_channels, vec!["a", "b"]);
        assert_eq!(options.close_grace, Duration::from_millis(500));
        assert_eq!(options.heartbeat, None);
        assert_eq!(options.tls, TlsVerification::Insecure);
        assert_eq!(options.transport_config().event_capacity, 1024);
    }
}
