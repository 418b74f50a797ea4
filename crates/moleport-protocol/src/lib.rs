//! moleport-protocol: JSON-RPC 2.0 wire types and line-delimited framing.
//!
//! All three envelope shapes share `jsonrpc = "2.0"`. Requests carry an
//! `id`; a missing or null `id` means "notification from the client" and
//! gets no reply. Responses carry exactly one of `result`/`error`.
//! Notifications (server -> client) never serialize an `id` field at all --
//! that's a distinct Rust type, not an `Option<Id>` on the same struct, so
//! the invariant is enforced by the type system rather than by convention.

use serde::{Deserialize, Serialize};
use std::io;

pub const JSONRPC_VERSION: &str = "2.0";

/// Maximum size of a single framed line, per spec: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// A request `id`. `None` (serialized as `null`) is used only when echoing
/// back a parse error for an unparseable request.
pub type Id = Option<i64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: Id,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: Id, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// A request with no `id` is a client-to-server notification: the
    /// dispatcher must run it but never reply.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl Response {
    pub fn ok(id: Id, result: serde_json::Value) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Id, error: RpcErrorObject) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Server -> client push. Deliberately has no `id` field in its Rust shape
/// so it can never accidentally round-trip one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Notification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        RpcErrorObject {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The reserved JSON-RPC 2.0 error range, plus moleport's application codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    HostNotFound,
    AlreadyConnected,
    NotConnected,
    RuleNotFound,
    RuleAlreadyExists,
    PortConflict,
    AuthenticationFailed,
    CredentialTimeout,
    CredentialCancelled,
}

impl ErrorCode {
    pub const fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::HostNotFound => 1001,
            ErrorCode::AlreadyConnected => 1002,
            ErrorCode::NotConnected => 1003,
            ErrorCode::RuleNotFound => 1004,
            ErrorCode::RuleAlreadyExists => 1005,
            ErrorCode::PortConflict => 1006,
            ErrorCode::AuthenticationFailed => 1007,
            ErrorCode::CredentialTimeout => 1008,
            ErrorCode::CredentialCancelled => 1009,
        }
    }

    pub fn into_error(self, message: impl Into<String>) -> RpcErrorObject {
        RpcErrorObject::new(self.code(), message)
    }
}

/// Decoded incoming line: either a client request (possibly a notification)
/// or -- distinguished purely by the *presence* of the `id` key, per
/// spec -- a reply the RPC client's reader is waiting on, or a server
/// notification the client's reader should fan out.
#[derive(Debug, Clone)]
pub enum ClientInboundFrame {
    Response(Response),
    Notification(Notification),
}

/// Parse one already-read line into the shape a client reader expects.
/// A JSON object with an `id` key is a `Response` (even if `id` is `null`);
/// one without is a `Notification`.
pub fn parse_client_inbound(line: &str) -> Result<ClientInboundFrame, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    if value.get("id").is_some() {
        Ok(ClientInboundFrame::Response(serde_json::from_value(
            value,
        )?))
    } else {
        Ok(ClientInboundFrame::Notification(serde_json::from_value(
            value,
        )?))
    }
}

/// Framing error: the line exceeded `MAX_LINE_BYTES`, or the socket was
/// closed mid-frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("line exceeds {MAX_LINE_BYTES} byte limit")]
    TooLong,
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub fn serialize_line<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let mut s = serde_json::to_string(value)?;
    s.push('\n');
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_never_serializes_id() {
        let n = Notification::new("event.ssh", None);
        let s = serde_json::to_string(&n).unwrap();
        assert!(!s.contains("\"id\""));
    }

    #[test]
    fn response_always_serializes_id_even_when_null() {
        let r = Response::ok(None, serde_json::json!({"ok": true}));
        let s = serde_json::to_string(&r).unwrap();
        assert!(s.contains("\"id\":null"));
    }

    #[test]
    fn roundtrip_response_value() {
        let v = serde_json::json!({"hosts": ["a", "b"]});
        let r = Response::ok(Some(7), v.clone());
        let s = serialize_line(&r).unwrap();
        let parsed: Response = serde_json::from_str(s.trim_end()).unwrap();
        assert_eq!(parsed.id, Some(7));
        assert_eq!(parsed.result, Some(v));
    }

    #[test]
    fn distinguish_response_from_notification_by_id_presence() {
        let resp = r#"{"jsonrpc":"2.0","id":null,"result":{}}"#;
        let notif = r#"{"jsonrpc":"2.0","method":"event.ssh","params":{}}"#;
        assert!(matches!(
            parse_client_inbound(resp).unwrap(),
            ClientInboundFrame::Response(_)
        ));
        assert!(matches!(
            parse_client_inbound(notif).unwrap(),
            ClientInboundFrame::Notification(_)
        ));
    }

    #[test]
    fn notification_is_dropped_by_request_parsing_when_missing_id_field() {
        let req: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"daemon.status"}"#).unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn application_error_codes_match_spec() {
        assert_eq!(ErrorCode::HostNotFound.code(), 1001);
        assert_eq!(ErrorCode::AlreadyConnected.code(), 1002);
        assert_eq!(ErrorCode::NotConnected.code(), 1003);
        assert_eq!(ErrorCode::RuleNotFound.code(), 1004);
        assert_eq!(ErrorCode::RuleAlreadyExists.code(), 1005);
        assert_eq!(ErrorCode::PortConflict.code(), 1006);
        assert_eq!(ErrorCode::AuthenticationFailed.code(), 1007);
    }
}
