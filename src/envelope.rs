//! Wire envelopes exchanged over the broker socket.
//!
//! ```text
//! request      {"id": "<uuid>", "method": "register", "params": {...}}
//! response     {"id": "<uuid>", "result": ..., "error": null}
//!              {"id": "<uuid>", "result": null, "error": {"message": "...", "code": -32001, "data": ...}}
//! notification {"method": "signal", "params": {...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC version string
pub const JSONRPC_VERSION: &str = "2.0";

/// Error descriptor carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Human readable description.
    pub message: String,
    /// Numeric error code, see [`crate::error`].
    #[serde(default)]
    pub code: Option<i64>,
    /// Structured detail, e.g. the offending id.
    #[serde(default)]
    pub data: Option<Value>,
}

/// Outbound request or notification. A notification has no `id`.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEnvelope<'a> {
    /// Always [`JSONRPC_VERSION`].
    pub jsonrpc: &'static str,
    /// Correlation id; absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<&'a str>,
    /// Method name.
    pub method: &'a str,
    /// Method parameters.
    pub params: &'a Value,
}

impl<'a> RequestEnvelope<'a> {
    /// Request expecting a response correlated by `id`.
    pub fn request(id: &'a str, method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            method,
            params,
        }
    }

    /// One-way notification.
    pub fn notification(method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method,
            params,
        }
    }
}

/// Outbound response.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    /// Always [`JSONRPC_VERSION`].
    pub jsonrpc: &'static str,
    /// Id copied from the request.
    pub id: Value,
    /// Handler result, `null` on error.
    pub result: Value,
    /// Error descriptor, `null` on success.
    pub error: Option<RpcError>,
}

impl ResponseEnvelope {
    /// Successful response.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result,
            error: None,
        }
    }

    /// Failed response.
    pub fn error(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Value::Null,
            error: Some(error),
        }
    }
}

/// Any inbound envelope, decoded leniently.
///
/// Whether this is a response, request or notification is decided by the
/// receiver: an `id` matching a pending request makes it a response.
#[derive(Debug, Clone, Deserialize)]
pub struct Incoming {
    /// Correlation id, absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    /// Method name of a request or notification.
    #[serde(default)]
    pub method: Option<String>,
    /// Request parameters.
    #[serde(default)]
    pub params: Value,
    /// Response result.
    #[serde(default)]
    pub result: Value,
    /// Response error.
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl Incoming {
    /// Decode raw inbound data. Anything that is not a JSON object yields `None`.
    pub fn decode(data: &str) -> Option<Self> {
        if !data.trim_start().starts_with('{') {
            return None;
        }
        serde_json::from_str(data).ok()
    }

    /// Correlation id as a string key, if present.
    pub fn id_key(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

// ============================================================================
// Method-specific parameter types
// ============================================================================

/// Parameters for "register", "find" and "exists".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdParams {
    /// Peer id.
    pub id: String,
}

/// Parameters for "signal": an opaque payload addressed from one peer to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalParams {
    /// Sending peer.
    pub from: String,
    /// Target peer.
    pub to: String,
    /// Opaque handshake data.
    #[serde(alias = "signal", default)]
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signal_accepts_legacy_field_name() {
        let params: SignalParams =
            serde_json::from_value(json!({"from": "a", "to": "b", "signal": {"sdp": 1}})).unwrap();
        assert_eq!(params.payload, json!({"sdp": 1}));
    }

    #[test]
    fn notification_has_no_id() {
        let params = json!({ "from": "a" });
        let text = serde_json::to_string(&RequestEnvelope::notification("signal", &params)).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["method"], "signal");
    }

    #[test]
    fn error_response_shape() {
        let resp = ResponseEnvelope::error(
            json!("abc"),
            RpcError {
                message: "boom".into(),
                code: Some(-32603),
                data: None,
            },
        );
        let value = serde_json::to_value(resp).unwrap();
        assert_eq!(value["id"], "abc");
        assert_eq!(value["result"], Value::Null);
        assert_eq!(value["error"]["message"], "boom");
        assert_eq!(value["error"]["code"], -32603);
    }

    #[test]
    fn decode_ignores_non_objects() {
        assert!(Incoming::decode("pong").is_none());
        assert!(Incoming::decode("[1,2]").is_none());
        assert!(Incoming::decode("{not json").is_none());

        let msg = Incoming::decode(r#"{"id": 7, "result": true}"#).unwrap();
        assert_eq!(msg.id_key().as_deref(), Some("7"));
        assert_eq!(msg.result, Value::Bool(true));
    }
}
