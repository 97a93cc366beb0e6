use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{MqLinkError, Result};

/// JSON wrapper carried by every message: `{"body": <any>, "replyTo"?: "<queue>"}`.
///
/// `reply_to` is present only on RPC requests and names the queue the
/// responder should publish its answer to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Application payload. Required; `null` must be sent explicitly.
    pub body: JsonValue,
    /// Reply queue name for RPC requests
    #[serde(rename = "replyTo", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Envelope {
    /// Envelope for a one-way message.
    pub fn new(body: JsonValue) -> Self {
        Self {
            body,
            reply_to: None,
        }
    }

    /// Envelope for an RPC request answered on `reply_to`.
    pub fn with_reply_to(body: JsonValue, reply_to: impl Into<String>) -> Self {
        Self {
            body,
            reply_to: Some(reply_to.into()),
        }
    }

    /// Parse a raw message body. Anything that is not a JSON object with a
    /// `body` field is rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(raw)
            .map_err(|e| MqLinkError::DeserializationError(e.to_string()))?;
        if !value.is_object() {
            return Err(MqLinkError::DeserializationError(format!(
                "expected an envelope object, got {}",
                json_kind(&value)
            )));
        }
        serde_json::from_value(value).map_err(|e| MqLinkError::DeserializationError(e.to_string()))
    }

    /// Serialize to the wire representation.
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize the body into a concrete type.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.body).map_err(|e| MqLinkError::DeserializationError(e.to_string()))
    }

    /// Whether the sender expects an answer.
    pub fn expects_reply(&self) -> bool {
        self.reply_to.is_some()
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
