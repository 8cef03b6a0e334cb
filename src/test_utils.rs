//! Test helpers: an in-memory transport the tests drive by hand

use crate::ws::connection::{ConnectionState, Outbound, TransportEvent, TransportHandle};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// The far end of a loopback transport
///
/// Everything the engine sends shows up in `outbound`; the test injects
/// transport events as if they came from the socket task.
pub struct LoopbackPeer {
    outbound: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<TransportEvent>,
    state: watch::Sender<ConnectionState>,
}

/// Create a connected handle/peer pair
pub fn loopback_transport() -> (TransportHandle, mpsc::Receiver<TransportEvent>, LoopbackPeer) {
    let (out_tx, out_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
    let handle = TransportHandle::from_parts(out_tx, state_rx);
    let peer = LoopbackPeer {
        outbound: out_rx,
        events: event_tx,
        state: state_tx,
    };
    (handle, event_rx, peer)
}

impl LoopbackPeer {
    pub async fn open(&self) {
        self.state.send_replace(ConnectionState::Open);
        self.events.send(TransportEvent::Opened).await.unwrap();
    }

    pub async fn deliver(&self, text: impl Into<String>) {
        self.events.send(TransportEvent::Message(text.into())).await.unwrap();
    }

    pub async fn fail(&self, reason: &str) {
        self.state.send_replace(ConnectionState::Failed);
        self.events.send(TransportEvent::Failed(reason.to_string())).await.unwrap();
    }

    /// Change the state the handle sees without emitting an event
    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Answer a close request: skip everything up to it, then report closed
    pub async fn acknowledge_close(&mut self) {
        while self.next_outbound().await != Outbound::Close {}
        self.closed().await;
    }

    /// Report the socket closed (peer side or after our close frame)
    pub async fn closed(&self) {
        self.state.send_replace(ConnectionState::Closed);
        // The engine may already be gone
        let _ = self.events.send(TransportEvent::Closed).await;
    }

    /// Next command from the engine; panics after a timeout
    pub async fn next_outbound(&mut self) -> Outbound {
        tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("transport handle dropped")
    }

    /// Next outbound text frame parsed as JSON
    pub async fn next_request(&mut self) -> Value {
        match self.next_outbound().await {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            Outbound::Close => panic!("expected a request, got close"),
        }
    }

    /// Anything already queued, without waiting
    pub fn try_next_outbound(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }

    /// Drain queued commands and count close requests
    pub fn count_closes(&mut self) -> usize {
        let mut closes = 0;
        while let Some(outbound) = self.try_next_outbound() {
            if outbound == Outbound::Close {
                closes += 1;
            }
        }
        closes
    }

    /// Open the link and answer the auth request with a token
    pub async fn authenticate(&mut self) {
        self.open().await;
        let auth = self.next_request().await;
        assert_eq!(auth["method"], "public/auth");
        self.deliver(auth_ok(&auth["id"])).await;
    }

    /// Answer the next subscribe request; returns its channel
    pub async fn confirm_next_subscribe(&mut self) -> String {
        let request = self.next_request().await;
        assert_eq!(request["method"], "public/subscribe");
        let channel = request["params"]["channels"][0].as_str().unwrap().to_string();
        self.deliver(json!({"jsonrpc": "2.0", "id": request["id"], "result": [channel]}).to_string())
            .await;
        channel
    }
}

pub fn auth_ok(id: &Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {"access_token": "tok123", "expires_in": 900, "token_type": "bearer"}
    })
    .to_string()
}

pub fn rpc_error(id: &Value, code: i64, message: &str) -> String {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}).to_string()
}

pub fn push(channel: &str, data: Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "method": "subscription",
        "params": {"channel": channel, "data": data}
    })
    .to_string()
}
