//! Wire format of the automation link: one JSON envelope per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Correlation id; a response carries its request's id.
    #[serde(default)]
    pub id: String,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub payload: Value,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestPayload {
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponsePayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn now_unix() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl Envelope {
    pub fn request(action: impl Into<String>, params: Value) -> Self {
        let payload = RequestPayload {
            action: action.into(),
            params,
        };
        Self {
            version: default_version(),
            kind: MessageKind::Request,
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_unix(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    fn response(id: &str, payload: ResponsePayload) -> Self {
        Self {
            version: default_version(),
            kind: MessageKind::Response,
            id: id.to_string(),
            timestamp: now_unix(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    pub fn response_ok(id: &str, result: Value) -> Self {
        Self::response(
            id,
            ResponsePayload {
                success: true,
                result: Some(result),
                error: None,
            },
        )
    }

    pub fn response_err(id: &str, error: impl Into<String>) -> Self {
        Self::response(
            id,
            ResponsePayload {
                success: false,
                result: None,
                error: Some(error.into()),
            },
        )
    }

    pub fn request_payload(&self) -> Result<RequestPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn response_payload(&self) -> Result<ResponsePayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Single-line JSON encoding (no trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_request_decodes() {
        let env = Envelope::from_line(r#"{"type":"request","payload":{"action":"bogus"}}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Request);
        assert_eq!(env.version, PROTOCOL_VERSION);
        assert_eq!(env.id, "");
        let req = env.request_payload().unwrap();
        assert_eq!(req.action, "bogus");
        assert_eq!(req.params, Value::Null);
    }

    #[test]
    fn test_response_encoding() {
        let ok = Envelope::response_ok("abc", json!({"x": 1}));
        let line = ok.to_line().unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains("\"type\":\"response\""));
        assert!(!line.contains("\"error\""));

        let err = Envelope::response_err("abc", "Unknown action: bogus");
        let payload = err.response_payload().unwrap();
        assert!(!payload.success);
        assert_eq!(payload.error.as_deref(), Some("Unknown action: bogus"));
        assert!(payload.result.is_none());
    }

    #[test]
    fn test_request_has_id_and_timestamp() {
        let req = Envelope::request("ping", json!({}));
        assert!(!req.id.is_empty());
        assert!(req.timestamp > 1_600_000_000.0);
        assert_eq!(req.request_payload().unwrap().action, "ping");
    }
}
