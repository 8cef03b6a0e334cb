//! WebSocket transport
//!
//! One spawned task owns the socket. The session engine talks to it through
//! a [`TransportHandle`] (outbound text and close) and receives
//! [`TransportEvent`]s in arrival order. Sends issued while the socket is
//! still opening are buffered and flushed once it is open.

use crate::ws::heartbeat::{Heartbeat, HeartbeatAction, HeartbeatConfig};
use crate::ws::tls::{self, TlsVerification};
use crate::{SendError, SessionError};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::Level;
use url::Url;

/// Socket state as seen by the transport task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Failed,
}

impl ConnectionState {
    #[inline(always)]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// Notification from the transport task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    /// Inbound text frame
    Message(String),
    Failed(String),
    Closed,
}

/// Command to the transport task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsVerification,
    pub connect_timeout: Duration,
    /// Wait for the peer's close frame after sending ours
    pub close_timeout: Duration,
    pub event_capacity: usize,
    pub outbound_capacity: usize,
    pub heartbeat: Option<HeartbeatConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsVerification::Verify,
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
            event_capacity: 1024,
            outbound_capacity: 64,
            heartbeat: Some(HeartbeatConfig::default()),
        }
    }
}

/// Check that `uri` is an absolute ws:// or wss:// URL with a host
pub fn validate_uri(uri: &str) -> Result<Url, SessionError> {
    let url = Url::parse(uri).map_err(|e| SessionError::Connect(format!("invalid URI {uri:?}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => {}
        scheme => {
            return Err(SessionError::Connect(format!(
                "unsupported scheme {scheme:?} in {uri:?}"
            )))
        }
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(SessionError::Connect(format!("missing host in {uri:?}")));
    }
    Ok(url)
}

/// Exclusive handle to a transport task
#[derive(Debug)]
pub struct TransportHandle {
    tx: mpsc::Sender<Outbound>,
    state: watch::Receiver<ConnectionState>,
    close_requested: bool,
}

impl TransportHandle {
    pub(crate) fn from_parts(
        tx: mpsc::Sender<Outbound>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            tx,
            state,
            close_requested: false,
        }
    }

    /// Queue a text frame
    ///
    /// Frames sent before the socket opens are delivered after it opens.
    /// Fails once a close was requested or the socket is gone.
    pub async fn send(&self, text: String) -> Result<(), SendError> {
        if self.close_requested || self.state().is_terminal() {
            return Err(SendError::NotOpen);
        }
        self.tx
            .send(Outbound::Text(text))
            .await
            .map_err(|_| SendError::NotOpen)
    }

    /// Request a graceful close; later calls are no-ops
    pub async fn close(&mut self) {
        if std::mem::replace(&mut self.close_requested, true) {
            return;
        }
        // Task already gone if this fails
        let _ = self.tx.send(Outbound::Close).await;
    }

    #[inline(always)]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[inline(always)]
    pub fn is_close_requested(&self) -> bool {
        self.close_requested
    }
}

/// Transport factory
pub struct Transport;

impl Transport {
    /// Validate `uri` and spawn the socket task
    ///
    /// Connection failures after validation arrive as
    /// [`TransportEvent::Failed`]. Must be called inside a tokio runtime.
    pub fn open(
        uri: &str,
        config: &TransportConfig,
    ) -> Result<(TransportHandle, mpsc::Receiver<TransportEvent>), SessionError> {
        let url = validate_uri(uri)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SessionError::Connect(format!("no tokio runtime: {e}")))?;
        let connector = match url.scheme() {
            "wss" => Some(tls::connector(config.tls)?),
            _ => None,
        };

        let (out_tx, out_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let event_loop = EventLoop {
            uri: url.to_string(),
            connector,
            connect_timeout: config.connect_timeout,
            close_timeout: config.close_timeout,
            heartbeat: config.heartbeat.map(Heartbeat::new),
            outbound: out_rx,
            events: event_tx,
            state: state_tx,
        };
        runtime.spawn(event_loop.run());

        crate::log_transport!(Level::INFO, uri = %url, "Transport opening");
        Ok((TransportHandle::from_parts(out_tx, state_rx), event_rx))
    }
}

struct EventLoop {
    uri: String,
    connector: Option<Connector>,
    connect_timeout: Duration,
    close_timeout: Duration,
    heartbeat: Option<Heartbeat>,
    outbound: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<TransportEvent>,
    state: watch::Sender<ConnectionState>,
}

impl EventLoop {
    async fn run(mut self) {
        let mut queued: VecDeque<String> = VecDeque::new();

        let connect = timeout(
            self.connect_timeout,
            connect_async_tls_with_config(self.uri.clone(), None, true, self.connector.take()),
        );
        tokio::pin!(connect);

        let stream = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(Ok((stream, _response))) => break stream,
                    Ok(Err(e)) => return self.fail(format!("connect failed: {e}")).await,
                    Err(_) => {
                        let reason = format!("connect timed out after {:?}", self.connect_timeout);
                        return self.fail(reason).await;
                    }
                },
                command = self.outbound.recv() => match command {
                    Some(Outbound::Text(text)) => queued.push_back(text),
                    Some(Outbound::Close) | None => return self.finish_closed().await,
                },
            }
        };

        self.state.send_replace(ConnectionState::Open);
        crate::log_transport!(Level::INFO, uri = %self.uri, queued = queued.len(), "Transport open");
        if !self.emit(TransportEvent::Opened).await {
            return;
        }

        let (mut sink, mut source) = stream.split();
        while let Some(text) = queued.pop_front() {
            if let Err(e) = sink.send(Message::text(text)).await {
                return self.fail(format!("send failed: {e}")).await;
            }
        }

        let mut ticker = self.heartbeat.as_ref().map(|heartbeat| {
            let mut ticker = interval_at(Instant::now() + heartbeat.interval(), heartbeat.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                biased;

                command = self.outbound.recv() => match command {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = sink.send(Message::text(text)).await {
                            return self.fail(format!("send failed: {e}")).await;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        if let Err(e) = sink.send(Message::Close(None)).await {
                            crate::log_transport!(Level::DEBUG, error = %e, "Close frame not sent");
                        } else {
                            self.await_peer_close(&mut source).await;
                        }
                        return self.finish_closed().await;
                    }
                },

                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.record_activity();
                        if !self.emit(TransportEvent::Message(text.as_str().to_owned())).await {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        crate::log_transport!(Level::INFO, frame = ?frame, "Peer closed connection");
                        return self.finish_closed().await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.record_activity();
                        crate::log_transport!(Level::DEBUG, len = data.len(), "Ignoring binary frame");
                    }
                    Some(Ok(_)) => self.record_activity(),
                    Some(Err(e)) => return self.fail(format!("receive failed: {e}")).await,
                    None => return self.finish_closed().await,
                },

                now = next_tick(&mut ticker) => {
                    let action = self
                        .heartbeat
                        .as_mut()
                        .map_or(HeartbeatAction::Idle, |heartbeat| heartbeat.on_tick(now));
                    match action {
                        HeartbeatAction::Idle => {}
                        HeartbeatAction::SendPing => {
                            if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                                return self.fail(format!("ping failed: {e}")).await;
                            }
                        }
                        HeartbeatAction::Dead => {
                            return self.fail("heartbeat timed out".to_string()).await;
                        }
                    }
                }
            }
        }
    }

    fn record_activity(&mut self) {
        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.record_activity();
        }
    }

    async fn await_peer_close<S>(&self, source: &mut S)
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let drain = async {
            while let Some(Ok(frame)) = source.next().await {
                if frame.is_close() {
                    break;
                }
            }
        };
        if timeout(self.close_timeout, drain).await.is_err() {
            crate::log_transport!(Level::DEBUG, "Peer did not acknowledge close");
        }
    }

    /// Deliver an event; false when nobody is listening anymore
    async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn fail(self, reason: String) {
        crate::log_transport!(Level::WARN, uri = %self.uri, reason = %reason, "Transport failed");
        self.state.send_replace(ConnectionState::Failed);
        self.emit(TransportEvent::Failed(reason)).await;
    }

    async fn finish_closed(self) {
        crate::log_transport!(Level::INFO, uri = %self.uri, "Transport closed");
        self.state.send_replace(ConnectionState::Closed);
        self.emit(TransportEvent::Closed).await;
    }
}

async fn next_tick(ticker: &mut Option<Interval>) -> Instant {
    match ticker {
        Some(ticker) => ticker.tick().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn plain_config() -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_millis(500),
            heartbeat: None,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn test_validate_uri() {
        assert!(validate_uri("wss://test.deribit.com/ws/api/v2").is_ok());
        assert!(validate_uri("ws://127.0.0.1:9000").is_ok());
        assert!(matches!(validate_uri("not a uri"), Err(SessionError::Connect(_))));
        assert!(matches!(validate_uri("https://test.deribit.com"), Err(SessionError::Connect(_))));
        assert!(matches!(validate_uri(""), Err(SessionError::Connect(_))));
    }

    #[test]
    fn test_connection_state_terminal() {
        assert!(!ConnectionState::Connecting.is_terminal());
        assert!(!ConnectionState::Open.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
    }

    #[tokio::test]
    async fn test_open_rejects_malformed_uri() {
        let result = Transport::open("ftp://example.com", &plain_config());
        assert!(matches!(result, Err(SessionError::Connect(_))));
    }

    #[tokio::test]
    async fn test_refused_connection_reports_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (handle, mut events) =
            Transport::open(&format!("ws://{addr}"), &plain_config()).unwrap();
        assert!(matches!(events.recv().await, Some(TransportEvent::Failed(_))));
        assert_eq!(handle.state(), ConnectionState::Failed);
        assert_eq!(handle.send("late".into()).await, Err(SendError::NotOpen));
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        // Accepts TCP but never answers the upgrade request
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(tcp);
        });

        let config = TransportConfig {
            connect_timeout: Duration::from_millis(100),
            ..plain_config()
        };
        let (handle, mut events) = Transport::open(&format!("ws://{addr}"), &config).unwrap();
        match events.recv().await {
            Some(TransportEvent::Failed(reason)) => assert!(reason.contains("timed out")),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(handle.state(), ConnectionState::Failed);
        server.abort();
    }

    #[tokio::test]
    async fn test_echo_with_buffered_send_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if message.is_text() {
                    ws.send(message).await.unwrap();
                }
            }
        });

        let (mut handle, mut events) =
            Transport::open(&format!("ws://{addr}"), &plain_config()).unwrap();
        // Sent before the socket is open
        handle.send("hello".into()).await.unwrap();

        assert_eq!(events.recv().await, Some(TransportEvent::Opened));
        assert_eq!(events.recv().await, Some(TransportEvent::Message("hello".into())));

        handle.close().await;
        handle.close().await;
        assert_eq!(handle.send("after close".into()).await, Err(SendError::NotOpen));
        assert_eq!(events.recv().await, Some(TransportEvent::Closed));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_before_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (mut handle, mut events) =
            Transport::open(&format!("ws://{addr}"), &plain_config()).unwrap();
        handle.close().await;
        assert_eq!(events.recv().await, Some(TransportEvent::Closed));
        drop(listener);
    }
}
