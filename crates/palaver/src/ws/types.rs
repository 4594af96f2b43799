//! Wire envelopes exchanged over the persistent connection.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound envelope: `{"action": ..., "room": ..., "message": ...}`.
///
/// The action set is closed. Adding an action means adding a variant here
/// and a matching arm in the dispatch table, both checked at compile time.
/// Frames carrying an unknown action fail to parse and are dropped by the
/// read loop without closing the connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum InboundMessage {
    /// Join the caller's personal room. The room name comes from the
    /// authenticated principal, never from the envelope.
    JoinUser,
    JoinGuild {
        room: String,
    },
    JoinChannel {
        room: String,
    },
    LeaveRoom {
        room: String,
    },
    LeaveGuild {
        room: String,
    },
    StartTyping {
        room: String,
        #[serde(default)]
        message: Option<String>,
    },
    StopTyping {
        room: String,
        #[serde(default)]
        message: Option<String>,
    },
    ToggleOnline,
    ToggleOffline,
    GetRequestCount,
}

/// Actions emitted to clients.
///
/// Most of these originate in the HTTP layer (message and channel CRUD,
/// friend requests); the hub itself emits the typing, presence, and
/// request-count events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewMessage,
    EditMessage,
    DeleteMessage,
    AddChannel,
    EditChannel,
    DeleteChannel,
    AddMember,
    RemoveMember,
    RemoveFromGuild,
    NewNotification,
    NewDmNotification,
    ToggleOnline,
    ToggleOffline,
    #[serde(rename = "addToTyping")]
    AddToTyping,
    #[serde(rename = "removeFromTyping")]
    RemoveFromTyping,
    SendRequest,
    AddRequest,
    AddFriend,
    RemoveFriend,
    #[serde(rename = "requestCount")]
    RequestCount,
}

/// Outbound envelope: `{"action": ..., "data": ...}`.
///
/// An envelope is encoded exactly once at emission; the broker and every
/// room that republishes it carry the encoded bytes verbatim, so members on
/// every instance receive byte-identical frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub action: EventKind,
    pub data: Value,
}

impl OutboundMessage {
    pub fn new(action: EventKind, data: impl Into<Value>) -> Self {
        Self {
            action,
            data: data.into(),
        }
    }

    /// Encode into the bytes handed to the broker and to outbound queues.
    pub fn encode(&self) -> Bytes {
        // Value payloads always have string keys, so this cannot fail.
        Bytes::from(serde_json::to_vec(self).expect("envelope serializes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_join_channel() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"action":"joinChannel","room":"chan-1","message":null}"#)
                .unwrap();
        assert_eq!(
            msg,
            InboundMessage::JoinChannel {
                room: "chan-1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_typing_with_payload() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"action":"startTyping","room":"chan-1","message":"alice"}"#)
                .unwrap();
        assert_eq!(
            msg,
            InboundMessage::StartTyping {
                room: "chan-1".to_string(),
                message: Some("alice".to_string())
            }
        );
    }

    #[test]
    fn test_parse_action_without_room() {
        // Presence toggles carry a room field on the wire; it is ignored.
        let msg: InboundMessage =
            serde_json::from_str(r#"{"action":"toggleOnline","room":"","message":null}"#).unwrap();
        assert_eq!(msg, InboundMessage::ToggleOnline);
    }

    #[test]
    fn test_unknown_action_is_an_error() {
        let result = serde_json::from_str::<InboundMessage>(
            r#"{"action":"selfDestruct","room":"x","message":null}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_event_kind_wire_names() {
        for (kind, expected) in [
            (EventKind::NewMessage, "\"new_message\""),
            (EventKind::NewDmNotification, "\"new_dm_notification\""),
            (EventKind::AddToTyping, "\"addToTyping\""),
            (EventKind::RemoveFromTyping, "\"removeFromTyping\""),
            (EventKind::ToggleOnline, "\"toggle_online\""),
            (EventKind::RequestCount, "\"requestCount\""),
        ] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), expected);
        }
    }

    #[test]
    fn test_outbound_encode_shape() {
        let msg = OutboundMessage::new(EventKind::AddToTyping, json!("alice"));
        let value: Value = serde_json::from_slice(&msg.encode()).unwrap();
        assert_eq!(value, json!({"action": "addToTyping", "data": "alice"}));
    }
}
