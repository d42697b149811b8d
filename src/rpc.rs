//! JSON-RPC 2.0 framing for the block feed.

use serde::Serialize;
use serde_json::{Value, json};

/// Request id used by the heartbeat message. Responses carrying it are never treated as
/// subscription traffic.
pub const HEARTBEAT_ID: &str = "heartbeat";

pub const HEARTBEAT_MESSAGE: &str = r#"{"jsonrpc":"2.0","method":"eth_ping","id":"heartbeat"}"#;

pub fn heartbeat_message() -> String {
    HEARTBEAT_MESSAGE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub method: &'static str,
    pub params: Vec<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: &'static str, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.into(),
            method,
            params,
        }
    }
}

/// `eth_subscribe("newHeads")`, optionally asking for full transaction bodies.
pub fn new_heads_subscription(id: u64, include_transactions: bool) -> JsonRpcRequest {
    let mut params = vec![json!("newHeads")];
    if include_transactions {
        params.push(json!({ "includeTransactions": true }));
    }
    JsonRpcRequest::new(id, "eth_subscribe", params)
}

/// Inbound block feed message, classified in priority order.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// `eth_subscription` notification with a non-empty result.
    Notification {
        subscription: Option<String>,
        result: Value,
    },
    /// Any reply to the heartbeat message.
    Heartbeat,
    /// Reply to one of our requests with a non-empty result.
    Response { id: Value, result: Value },
    /// JSON-RPC error object.
    Error { message: Option<String> },
    Other(Value),
}

pub fn classify(mut value: Value) -> Incoming {
    if value.get("method").and_then(Value::as_str) == Some("eth_subscription") {
        if let Some(params) = value.get_mut("params") {
            if params.get("result").is_some_and(is_truthy) {
                let subscription = params
                    .get("subscription")
                    .filter(|id| is_truthy(id))
                    .map(id_to_string);
                let result = params
                    .get_mut("result")
                    .map(Value::take)
                    .unwrap_or_default();
                return Incoming::Notification {
                    subscription,
                    result,
                };
            }
        }
    }

    if value.get("id").and_then(Value::as_str) == Some(HEARTBEAT_ID) {
        return Incoming::Heartbeat;
    }

    let id = value.get("id").filter(|id| is_truthy(id)).cloned();
    let result = value.get("result").filter(|result| is_truthy(result));
    if let (Some(id), Some(result)) = (id, result) {
        return Incoming::Response {
            id,
            result: result.clone(),
        };
    }

    if let Some(error) = value.get("error").filter(|error| is_truthy(error)) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .filter(|message| !message.is_empty())
            .map(str::to_string);
        return Incoming::Error { message };
    }

    Incoming::Other(value)
}

/// Renders a JSON-RPC id or subscription id as a plain string.
pub fn id_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Loose truthiness: `null`, `false`, `0` and `""` count as absent.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_request_shape() {
        let request = serde_json::to_string(&new_heads_subscription(7, true)).unwrap();
        assert_eq!(
            request,
            r#"{"jsonrpc":"2.0","id":7,"method":"eth_subscribe","params":["newHeads",{"includeTransactions":true}]}"#
        );

        let fallback = serde_json::to_string(&new_heads_subscription(8, false)).unwrap();
        assert_eq!(
            fallback,
            r#"{"jsonrpc":"2.0","id":8,"method":"eth_subscribe","params":["newHeads"]}"#
        );
    }

    #[test]
    fn test_heartbeat_message_is_valid_json() {
        let value: Value = serde_json::from_str(&heartbeat_message()).unwrap();
        assert_eq!(value["method"], "eth_ping");
        assert_eq!(value["id"], HEARTBEAT_ID);
    }

    #[test]
    fn test_classify_notification() {
        let message = json!({
            "method": "eth_subscription",
            "params": {"subscription": "0x1", "result": {"hash": "0xabc"}}
        });
        assert_eq!(
            classify(message),
            Incoming::Notification {
                subscription: Some("0x1".to_string()),
                result: json!({"hash": "0xabc"}),
            }
        );
    }

    #[test]
    fn test_classify_notification_without_result_falls_through() {
        let message = json!({
            "method": "eth_subscription",
            "params": {"subscription": "0x1", "result": null}
        });
        assert!(matches!(classify(message), Incoming::Other(_)));
    }

    #[test]
    fn test_classify_response() {
        let message = json!({"jsonrpc": "2.0", "id": 3, "result": "0xdeadbeef"});
        assert_eq!(
            classify(message),
            Incoming::Response {
                id: json!(3),
                result: json!("0xdeadbeef"),
            }
        );

        // an empty result is not an acknowledgement
        let message = json!({"jsonrpc": "2.0", "id": 3, "result": ""});
        assert!(matches!(classify(message), Incoming::Other(_)));
    }

    #[test]
    fn test_classify_heartbeat() {
        let ok = json!({"jsonrpc": "2.0", "id": "heartbeat", "result": true});
        assert_eq!(classify(ok), Incoming::Heartbeat);

        let unsupported = json!({
            "jsonrpc": "2.0",
            "id": "heartbeat",
            "error": {"code": -32601, "message": "method not found"}
        });
        assert_eq!(classify(unsupported), Incoming::Heartbeat);
    }

    #[test]
    fn test_classify_error() {
        let message = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "boom"}});
        assert_eq!(
            classify(message),
            Incoming::Error {
                message: Some("boom".to_string())
            }
        );

        let message = json!({"error": {}});
        assert_eq!(classify(message), Incoming::Error { message: None });
    }

    #[test]
    fn test_id_to_string() {
        assert_eq!(id_to_string(&json!("0xabc")), "0xabc");
        assert_eq!(id_to_string(&json!(12)), "12");
    }
}
