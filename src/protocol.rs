//! Wire envelope shared by every context.
//!
//! Requests look like `{ "type": "<PREFIX>CONNECT", "requestId": "...", ...payload }`
//! and responses echo the type with a `_RESULT` suffix plus
//! `{ "success": bool, "error"?: string, "code"?: number }`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Suffix appended to a request type to form its response type.
pub const RESULT_SUFFIX: &str = "_RESULT";

/// Default reserved prefix for protocol message types.
pub const DEFAULT_MESSAGE_PREFIX: &str = "SIWE_BRIDGE_";

pub const CONNECT: &str = "CONNECT";
pub const DISCONNECT: &str = "DISCONNECT";
pub const GET_SESSION: &str = "GET_SESSION";
pub const VALIDATE_SESSION: &str = "VALIDATE_SESSION";
pub const PING: &str = "PING";
pub const SESSION_CHANGED: &str = "SESSION_CHANGED";

/// Message-type names under a concrete protocol prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTypes {
    prefix: String,
}

impl MessageTypes {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full type name for an unprefixed operation name.
    pub fn name(&self, op: &str) -> String {
        format!("{}{}", self.prefix, op)
    }

    pub fn connect(&self) -> String {
        self.name(CONNECT)
    }

    pub fn disconnect(&self) -> String {
        self.name(DISCONNECT)
    }

    pub fn get_session(&self) -> String {
        self.name(GET_SESSION)
    }

    pub fn validate_session(&self) -> String {
        self.name(VALIDATE_SESSION)
    }

    pub fn ping(&self) -> String {
        self.name(PING)
    }

    pub fn session_changed(&self) -> String {
        self.name(SESSION_CHANGED)
    }
}

impl Default for MessageTypes {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE_PREFIX)
    }
}

/// Inbound cross-context message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl BridgeMessage {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            request_id: None,
            payload: Map::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// String payload field, if present.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Canonical payload text: top-level keys sorted so equal payloads
    /// always render identically.
    pub fn canonical_payload(&self) -> String {
        let sorted: BTreeMap<&String, &Value> = self.payload.iter().collect();
        serde_json::to_string(&sorted).unwrap_or_default()
    }
}

/// Response to a [`BridgeMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeResponse {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<crate::error::ErrorKind>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl BridgeResponse {
    /// Successful response. Object values are flattened into the envelope,
    /// anything else lands under `result`.
    pub fn ok(request: &BridgeMessage, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                map
            }
        };
        Self {
            message_type: result_type(&request.message_type),
            request_id: request.request_id.clone(),
            success: true,
            error: None,
            code: None,
            error_kind: None,
            data,
        }
    }

    pub fn failure(request: &BridgeMessage, err: &Error) -> Self {
        Self {
            message_type: result_type(&request.message_type),
            request_id: request.request_id.clone(),
            success: false,
            error: Some(err.to_string()),
            code: Some(err.code()),
            error_kind: Some(err.kind()),
            data: Map::new(),
        }
    }

    /// Typed error for a failure response, `None` on success.
    pub fn to_error(&self) -> Option<Error> {
        if self.success {
            return None;
        }
        Some(Error::Forwarded {
            kind: self.error_kind.unwrap_or(crate::error::ErrorKind::Internal),
            code: self.code,
            message: self
                .error
                .clone()
                .unwrap_or_else(|| "request failed".to_string()),
        })
    }

    /// Success data, or the typed failure.
    pub fn into_result(self) -> Result<Map<String, Value>, Error> {
        match self.to_error() {
            Some(err) => Err(err),
            None => Ok(self.data),
        }
    }

    /// Re-address a shared outcome to another caller's request id.
    pub fn for_request(mut self, request: &BridgeMessage) -> Self {
        self.request_id = request.request_id.clone();
        self
    }
}

/// Response type for a request type.
pub fn result_type(message_type: &str) -> String {
    format!("{message_type}{RESULT_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::error::{ErrorKind, WalletError};

    #[test]
    fn message_envelope_wire_shape() {
        let msg = BridgeMessage::new("SIWE_BRIDGE_CONNECT")
            .with_request_id("r-1")
            .with_field("accountMode", "demo");
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(
            value,
            json!({"type": "SIWE_BRIDGE_CONNECT", "requestId": "r-1", "accountMode": "demo"})
        );

        let parsed: BridgeMessage =
            serde_json::from_value(json!({"type": "SIWE_BRIDGE_PING"})).expect("parse");
        assert_eq!(parsed.request_id, None);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn failure_response_carries_code_and_kind() {
        let msg = BridgeMessage::new("SIWE_BRIDGE_CONNECT").with_request_id("r-2");
        let err = Error::from(WalletError::UserRejected {
            message: "denied".to_string(),
        });
        let resp = BridgeResponse::failure(&msg, &err);
        assert_eq!(resp.message_type, "SIWE_BRIDGE_CONNECT_RESULT");
        assert_eq!(resp.request_id.as_deref(), Some("r-2"));
        assert!(!resp.success);
        assert_eq!(resp.code, Some(4001));
        assert_eq!(resp.error_kind, Some(ErrorKind::UserRejected));
    }

    #[test]
    fn forwarded_failures_keep_code_and_kind() {
        let msg = BridgeMessage::new("SIWE_BRIDGE_CONNECT").with_request_id("r-3");
        let original = BridgeResponse::failure(
            &msg,
            &Error::from(WalletError::UserRejected {
                message: "denied".to_string(),
            }),
        );
        let err = original.clone().into_result().expect_err("failure");
        assert_eq!(err.kind(), ErrorKind::UserRejected);

        let relayed = BridgeResponse::failure(&msg, &err);
        assert_eq!(relayed, original);
    }

    #[test]
    fn canonical_payload_ignores_insertion_order() {
        let a = BridgeMessage::new("T").with_field("b", 1).with_field("a", 2);
        let b = BridgeMessage::new("T").with_field("a", 2).with_field("b", 1);
        assert_eq!(a.canonical_payload(), b.canonical_payload());
    }
}
