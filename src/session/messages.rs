//! JSON-RPC 2.0 wire messages
//!
//! Outbound requests are serialized from typed params; inbound frames are
//! kept as a `serde_json::Value` and read field by field so that a missing or
//! mistyped field becomes a [`SessionError::Parse`] instead of a panic.

use crate::infrastructure::credentials::Credentials;
use crate::session::state::{OutboundRequest, RequestKind};
use crate::SessionError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const METHOD_AUTH: &str = "public/auth";
pub const METHOD_SUBSCRIBE: &str = "public/subscribe";
pub const METHOD_UNSUBSCRIBE: &str = "public/unsubscribe";
pub const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";

/// JSON-RPC request envelope
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a, T> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: T,
}

impl<'a, T> JsonRpcRequest<'a, T> {
    pub fn new(id: u64, method: &'a str, params: T) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// `public/auth` params
#[derive(Debug, Clone, Serialize)]
pub struct AuthParams<'a> {
    pub grant_type: &'a str,
    pub client_id: &'a str,
    pub client_secret: &'a str,
}

/// `public/subscribe` and `public/unsubscribe` params
#[derive(Debug, Clone, Serialize)]
pub struct ChannelParams<'a> {
    pub channels: [&'a str; 1],
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RequestKind {
    /// JSON-RPC method name
    pub fn method(&self) -> &'static str {
        match self {
            RequestKind::Auth => METHOD_AUTH,
            RequestKind::Subscribe(_) => METHOD_SUBSCRIBE,
            RequestKind::Unsubscribe(_) => METHOD_UNSUBSCRIBE,
        }
    }
}

/// Serialize an outbound request into a text frame
pub fn encode_request(
    request: &OutboundRequest,
    credentials: &Credentials,
) -> Result<String, SessionError> {
    let method = request.kind.method();
    let encoded = match &request.kind {
        RequestKind::Auth => serde_json::to_string(&JsonRpcRequest::new(
            request.id,
            method,
            AuthParams {
                grant_type: GRANT_CLIENT_CREDENTIALS,
                client_id: credentials.client_id(),
                client_secret: credentials.client_secret(),
            },
        )),
        RequestKind::Subscribe(channel) | RequestKind::Unsubscribe(channel) => {
            serde_json::to_string(&JsonRpcRequest::new(
                request.id,
                method,
                ChannelParams {
                    channels: [channel.as_str()],
                },
            ))
        }
    };
    encoded.map_err(|e| SessionError::Parse(format!("failed to encode {method}: {e}")))
}

/// Channel notification borrowed from an inbound frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Notification<'a> {
    pub channel: &'a str,
    pub data: &'a Value,
}

/// Parsed inbound text frame
#[derive(Debug, Clone)]
pub struct InboundFrame {
    raw: String,
    value: Value,
}

impl InboundFrame {
    /// Parse a text frame; only JSON objects are accepted
    pub fn parse(raw: impl Into<String>) -> Result<Self, SessionError> {
        let raw = raw.into();
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| SessionError::Parse(format!("invalid JSON: {e}")))?;
        if !value.is_object() {
            return Err(SessionError::Parse("frame is not a JSON object".to_string()));
        }
        Ok(Self { raw, value })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Request id echoed by a reply
    ///
    /// `null` counts as absent; any other non-integer is malformed.
    pub fn id(&self) -> Result<Option<u64>, SessionError> {
        match self.value.get("id") {
            None | Some(Value::Null) => Ok(None),
            Some(id) => id
                .as_u64()
                .map(Some)
                .ok_or_else(|| SessionError::Parse(format!("id is not an unsigned integer: {id}"))),
        }
    }

    /// Non-null `result` member
    pub fn result(&self) -> Option<&Value> {
        self.value.get("result").filter(|result| !result.is_null())
    }

    /// `result.access_token` when it is a string
    pub fn access_token(&self) -> Option<&str> {
        self.result()?.get("access_token")?.as_str()
    }

    /// `error` member, if any
    pub fn error(&self) -> Result<Option<RpcError>, SessionError> {
        match self.value.get("error") {
            None | Some(Value::Null) => Ok(None),
            Some(error) => RpcError::deserialize(error)
                .map(Some)
                .map_err(|e| SessionError::Parse(format!("malformed error object: {e}"))),
        }
    }

    /// Channel notification, if the frame carries `params.channel`
    pub fn notification(&self) -> Result<Option<Notification<'_>>, SessionError> {
        let Some(params) = self.value.get("params") else {
            return Ok(None);
        };
        let Some(channel) = params.get("channel") else {
            return Ok(None);
        };
        let channel = channel
            .as_str()
            .ok_or_else(|| SessionError::Parse(format!("channel is not a string: {channel}")))?;
        let data = params
            .get("data")
            .ok_or_else(|| SessionError::Parse(format!("notification for {channel} has no data")))?;
        Ok(Some(Notification { channel, data }))
    }
}
