//! JSON wire envelopes exchanged over the session socket.
//!
//! Every frame is a single JSON object in a WebSocket text message:
//! ```text
//! client → server   {"type": "<action>", "payload": {...}, "requestId"?: "..."}
//! server → client   {"type": "state" | "ack" | "error" | "action",
//!                    "payload"?: {...}, "sourceClientId"?: "...", "requestId"?: "..."}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::storage::WorkspaceState;

/// Untyped action payload as received from a client.
pub type Payload = Map<String, Value>;

/// Key injected into relayed payloads naming the action that produced them.
pub const ACTION_TYPE_KEY: &str = "actionType";

/// Inbound action request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub action_type: String,
    /// Missing or `null` payloads decode as an empty map
    #[serde(default, deserialize_with = "null_as_empty")]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ClientMessage {
    pub fn new(action_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            action_type: action_type.into(),
            payload,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Payload, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Payload>::deserialize(deserializer)?.unwrap_or_default())
}

/// Server message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMessageType {
    /// Full workspace snapshot, sent once after connect
    State,
    /// Action persisted
    Ack,
    /// Action rejected
    Error,
    /// Action performed by another client
    Action,
}

/// Outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: ServerMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ServerMessage {
    pub fn state(state: &WorkspaceState) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_value(state).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            kind: ServerMessageType::State,
            payload: Some(payload),
            source_client_id: None,
            request_id: None,
        })
    }

    /// Acknowledgement. Carries no payload.
    pub fn ack(request_id: Option<String>) -> Self {
        Self {
            kind: ServerMessageType::Ack,
            payload: None,
            source_client_id: None,
            request_id,
        }
    }

    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("message".to_string(), Value::String(message.into()));
        Self {
            kind: ServerMessageType::Error,
            payload: Some(Value::Object(payload)),
            source_client_id: None,
            request_id,
        }
    }

    /// Relay of an applied action. `actionType` is written after the client's
    /// own fields, so it always names the action that was actually applied.
    pub fn action(
        action_type: &str,
        payload: &Payload,
        source: Uuid,
        request_id: Option<String>,
    ) -> Self {
        let mut relayed = payload.clone();
        relayed.insert(ACTION_TYPE_KEY.to_string(), Value::String(action_type.to_string()));
        Self {
            kind: ServerMessageType::Action,
            payload: Some(Value::Object(relayed)),
            source_client_id: Some(source.to_string()),
            request_id,
        }
    }

    /// The `message` field of an error payload.
    pub fn error_message(&self) -> Option<&str> {
        match self.kind {
            ServerMessageType::Error => self.payload.as_ref()?.get("message")?.as_str(),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_decode() {
        let msg = ClientMessage::decode(
            r##"{"type":"addLayer","payload":{"id":"l1","name":"X","color":"#fff"},"requestId":"r1"}"##,
        )
        .unwrap();
        assert_eq!(msg.action_type, "addLayer");
        assert_eq!(msg.payload["id"], json!("l1"));
        assert_eq!(msg.request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn test_client_message_missing_or_null_payload() {
        let msg = ClientMessage::decode(r#"{"type":"toggleLayerVisibility"}"#).unwrap();
        assert!(msg.payload.is_empty());
        assert!(msg.request_id.is_none());

        let msg = ClientMessage::decode(r#"{"type":"removeLayer","payload":null}"#).unwrap();
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_client_message_malformed() {
        assert!(ClientMessage::decode("not json").is_err());
        assert!(ClientMessage::decode(r#"{"payload":{}}"#).is_err());
        assert!(ClientMessage::decode(r#"{"type":"addLayer","payload":[1,2]}"#).is_err());
        assert!(matches!(
            ClientMessage::decode("{"),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_ack_wire_shape() {
        let text = ServerMessage::ack(Some("r1".into())).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "ack", "requestId": "r1"}));

        let text = ServerMessage::ack(None).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "ack"}));
    }

    #[test]
    fn test_error_wire_shape() {
        let msg = ServerMessage::error("Unknown action: bogus", Some("r9".into()));
        assert_eq!(msg.error_message(), Some("Unknown action: bogus"));
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "payload": {"message": "Unknown action: bogus"}, "requestId": "r9"})
        );
    }

    #[test]
    fn test_action_injects_action_type() {
        let source = Uuid::new_v4();
        let payload = json!({"id": "l1", "actionType": "spoofed"});
        let msg = ServerMessage::action("removeLayer", payload.as_object().unwrap(), source, None);

        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "action");
        assert_eq!(value["payload"]["actionType"], "removeLayer");
        assert_eq!(value["payload"]["id"], "l1");
        assert_eq!(value["sourceClientId"], source.to_string());
        assert!(value.get("requestId").is_none());
    }

    #[test]
    fn test_state_wire_shape() {
        let state = WorkspaceState {
            workspace_id: "ws1".into(),
            layers: vec![],
            editors: vec![crate::storage::Editor {
                index: 0,
                name: "Passage 1".into(),
                visible: true,
                content_json: None,
            }],
        };
        let msg = ServerMessage::state(&state).unwrap();
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "state",
                "payload": {
                    "workspaceId": "ws1",
                    "layers": [],
                    "editors": [{"index": 0, "name": "Passage 1", "visible": true, "contentJson": null}]
                }
            })
        );
    }

    #[test]
    fn test_server_message_decode() {
        let msg = ServerMessage::decode(r#"{"type":"ack","payload":{},"requestId":"x"}"#).unwrap();
        assert_eq!(msg.kind, ServerMessageType::Ack);
        assert_eq!(msg.request_id.as_deref(), Some("x"));
        assert!(msg.source_client_id.is_none());
        assert!(msg.error_message().is_none());
    }
}
