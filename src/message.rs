use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use tungstenite::Message as WebSocketMessage;

use crate::error::{Error, Result};

/// A single JSON frame exchanged with the server.
///
/// Requests and their responses carry `action` and `requestId`; pushes carry
/// `action` and `subscriptionId`; error frames carry `code` and `error`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(transparent)]
pub struct Message(Value);

impl Message {
    pub fn new(value: Value) -> Self {
        Message(value)
    }

    /// Builds a request frame: `fields` merged with `action` and `requestId`.
    ///
    /// `fields` must be a JSON object or null.
    pub fn request(action: &str, request_id: u64, fields: Value) -> Result<Self> {
        let mut map = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::Json(format!(
                    "request fields must be an object, got {}",
                    other
                )))
            }
        };

        map.insert("action".to_string(), Value::from(action));
        map.insert("requestId".to_string(), Value::from(request_id));

        Ok(Message(Value::Object(map)))
    }

    pub fn action(&self) -> Option<&str> {
        self.0.get("action").and_then(Value::as_str)
    }

    pub fn request_id(&self) -> Option<u64> {
        self.0.get("requestId").and_then(Value::as_u64)
    }

    pub fn subscription_id(&self) -> Option<u64> {
        self.0.get("subscriptionId").and_then(Value::as_u64)
    }

    pub fn status(&self) -> Option<&str> {
        self.0.get("status").and_then(Value::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.status() == Some("success")
    }

    pub fn code(&self) -> Option<i64> {
        self.0.get("code").and_then(Value::as_i64)
    }

    pub fn error_text(&self) -> Option<&str> {
        self.0.get("error").and_then(Value::as_str)
    }

    /// True for `{code, error}` frames.
    pub fn is_error_frame(&self) -> bool {
        is_error_shape(&self.0)
    }

    /// True for server pushes produced by a subscription.
    pub fn is_push(&self) -> bool {
        self.subscription_id().is_some()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// True when `value` is an object carrying both `code` and `error`.
pub(crate) fn is_error_shape(value: &Value) -> bool {
    match value.as_object() {
        Some(map) => map.contains_key("code") && map.contains_key("error"),
        None => false,
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message(value)
    }
}

impl FromStr for Message {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Message(serde_json::from_str(s)?))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Message> for String {
    fn from(msg: Message) -> String {
        msg.0.to_string()
    }
}

impl From<Message> for WebSocketMessage {
    fn from(msg: Message) -> WebSocketMessage {
        WebSocketMessage::Text(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_merges_action_and_id() {
        let msg = Message::request("command/insert", 7, json!({ "deviceId": "d1" })).unwrap();

        assert_eq!(msg.action(), Some("command/insert"));
        assert_eq!(msg.request_id(), Some(7));
        assert_eq!(msg.get("deviceId"), Some(&json!("d1")));
    }

    #[test]
    fn request_rejects_non_object_fields() {
        assert!(Message::request("x", 1, json!([1, 2])).is_err());
    }

    #[test]
    fn error_frames_need_code_and_error() {
        let frame: Message = r#"{"code": 400, "error": "Malformed Json received."}"#
            .parse()
            .unwrap();
        assert!(frame.is_error_frame());
        assert_eq!(frame.code(), Some(400));

        let partial = Message::new(json!({ "error": "nope" }));
        assert!(!partial.is_error_frame());
    }
}
