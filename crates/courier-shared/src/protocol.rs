//! JSON wire protocol spoken over a client connection.
//!
//! Every frame, in either direction, is an [`Envelope`]. Outbound frames are
//! built by the engine; inbound frames are decoded into the narrower
//! [`ClientFrame`] set, which is all a client is allowed to send.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::MAX_FRAME_SIZE;
use crate::error::ProtocolError;
use crate::types::{GroupId, MessageId, UserId};

/// Every event type that can appear in an envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Chat,
    Typing,
    StopTyping,
    UserJoined,
    UserLeft,
    MessageRead,
    MessageUpdate,
    MessageDelete,
    GroupDeleted,
    Delivered,
    Ping,
    Pong,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Chat => "chat",
            EventKind::Typing => "typing",
            EventKind::StopTyping => "stop_typing",
            EventKind::UserJoined => "user_joined",
            EventKind::UserLeft => "user_left",
            EventKind::MessageRead => "message_read",
            EventKind::MessageUpdate => "message_update",
            EventKind::MessageDelete => "message_delete",
            EventKind::GroupDeleted => "group_deleted",
            EventKind::Delivered => "delivered",
            EventKind::Ping => "ping",
            EventKind::Pong => "pong",
            EventKind::Error => "error",
        }
    }
}

impl FromStr for EventKind {
    type Err = ProtocolError;

    /// Accepts the canonical names plus the `typing_start` / `typing_stop`
    /// aliases older clients send.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "chat" => EventKind::Chat,
            "typing" | "typing_start" => EventKind::Typing,
            "stop_typing" | "typing_stop" => EventKind::StopTyping,
            "user_joined" => EventKind::UserJoined,
            "user_left" => EventKind::UserLeft,
            "message_read" => EventKind::MessageRead,
            "message_update" => EventKind::MessageUpdate,
            "message_delete" => EventKind::MessageDelete,
            "group_deleted" => EventKind::GroupDeleted,
            "delivered" => EventKind::Delivered,
            "ping" => EventKind::Ping,
            "pong" => EventKind::Pong,
            "error" => EventKind::Error,
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(kind)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The frame envelope shared by both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            group_id: None,
            user_email: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_group(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_user(mut self, user: UserId) -> Self {
        self.user_email = Some(user);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Serialise `payload` into `data`. Payloads are plain structs, so this
    /// only fails on non-string map keys, which none of ours have.
    pub fn with_payload<T: Serialize>(self, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(self.with_data(serde_json::to_value(payload)?))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Typing indicator broadcast to the rest of a group.
    pub fn typing(group_id: GroupId, user: &UserId, is_typing: bool) -> Self {
        let kind = if is_typing {
            EventKind::Typing
        } else {
            EventKind::StopTyping
        };
        Self::new(kind).with_group(group_id).with_data(serde_json::json!({
            "user_email": user,
            "is_typing": is_typing,
        }))
    }

    /// Presence change inside a group (`user_joined` / `user_left`).
    pub fn presence(kind: EventKind, group_id: GroupId, user: &UserId) -> Self {
        Self::new(kind).with_group(group_id).with_user(user.clone())
    }

    /// Error report sent back to a client whose frame was rejected.
    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(EventKind::Error).with_data(serde_json::json!({ "error": reason.into() }))
    }
}

/// Payload of a `message_read` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadReceiptPayload {
    pub message_ids: Vec<MessageId>,
    pub user_email: UserId,
    pub read_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Inbound frames
// ---------------------------------------------------------------------------

/// The subset of events a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Typing { group_id: GroupId },
    StopTyping { group_id: GroupId },
    /// Delivery acknowledgement; the group is resolved server-side.
    Delivered { message_ids: Vec<MessageId> },
    Read {
        group_id: GroupId,
        message_ids: Vec<MessageId>,
    },
    Ping,
    Pong,
}

/// Loose view of an inbound envelope: `type` stays a string so unknown event
/// types surface as [`ProtocolError::UnknownType`] rather than a serde error.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize, Default)]
struct AckData {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    message_ids: Vec<String>,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::TooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind: EventKind = raw.kind.parse()?;

        match kind {
            EventKind::Typing => Ok(ClientFrame::Typing {
                group_id: require_group(raw.group_id.as_deref())?,
            }),
            EventKind::StopTyping => Ok(ClientFrame::StopTyping {
                group_id: require_group(raw.group_id.as_deref())?,
            }),
            EventKind::Delivered => {
                let message_ids = ack_ids(raw.data)?;
                Ok(ClientFrame::Delivered { message_ids })
            }
            EventKind::MessageRead => {
                let group_id = require_group(raw.group_id.as_deref())?;
                let message_ids = ack_ids(raw.data)?;
                Ok(ClientFrame::Read {
                    group_id,
                    message_ids,
                })
            }
            EventKind::Ping => Ok(ClientFrame::Ping),
            EventKind::Pong => Ok(ClientFrame::Pong),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    /// Canonical wire form, as a well-behaved client would send it.
    pub fn to_wire(&self) -> Value {
        match self {
            ClientFrame::Typing { group_id } => {
                serde_json::json!({ "type": "typing", "group_id": group_id })
            }
            ClientFrame::StopTyping { group_id } => {
                serde_json::json!({ "type": "stop_typing", "group_id": group_id })
            }
            ClientFrame::Delivered { message_ids } => serde_json::json!({
                "type": "delivered",
                "data": { "message_ids": message_ids },
            }),
            ClientFrame::Read {
                group_id,
                message_ids,
            } => serde_json::json!({
                "type": "message_read",
                "group_id": group_id,
                "data": { "message_ids": message_ids },
            }),
            ClientFrame::Ping => serde_json::json!({ "type": "ping" }),
            ClientFrame::Pong => serde_json::json!({ "type": "pong" }),
        }
    }
}

fn require_group(group_id: Option<&str>) -> Result<GroupId, ProtocolError> {
    let raw = group_id.ok_or(ProtocolError::MissingField("group_id"))?;
    GroupId::parse(raw).map_err(|e| ProtocolError::Malformed(format!("group_id: {e}")))
}

/// Acks carry `{"message_id": ..}` or `{"message_ids": [..]}`; some clients
/// send the object JSON-encoded inside a string.
fn ack_ids(data: Option<Value>) -> Result<Vec<MessageId>, ProtocolError> {
    let data = data.ok_or(ProtocolError::MissingField("data"))?;
    let ack: AckData = match data {
        Value::String(inner) => serde_json::from_str(&inner)
            .map_err(|e| ProtocolError::Malformed(format!("data: {e}")))?,
        other => serde_json::from_value(other)
            .map_err(|e| ProtocolError::Malformed(format!("data: {e}")))?,
    };

    let mut ids = Vec::with_capacity(ack.message_ids.len() + 1);
    for raw in ack.message_id.iter().chain(ack.message_ids.iter()) {
        let id = MessageId::parse(raw)
            .map_err(|e| ProtocolError::Malformed(format!("message id {raw:?}: {e}")))?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    if ids.is_empty() {
        return Err(ProtocolError::MissingField("message_id"));
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_omits_empty_fields() {
        let env = Envelope::new(EventKind::Pong);
        let json: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "pong");
        assert!(json.get("group_id").is_none());
        assert!(json.get("user_email").is_none());
        assert!(json.get("data").is_none());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_typing_envelope_shape() {
        let gid = GroupId::new();
        let env = Envelope::typing(gid, &UserId::from("alice@example.com"), false);
        assert_eq!(env.kind, EventKind::StopTyping);
        let json: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "stop_typing");
        assert_eq!(json["group_id"], gid.to_string());
        assert_eq!(json["data"]["user_email"], "alice@example.com");
        assert_eq!(json["data"]["is_typing"], false);
    }

    #[test]
    fn test_parse_typing_aliases() {
        let gid = GroupId::new();
        for kind in ["typing", "typing_start"] {
            let text = format!(r#"{{"type":"{kind}","group_id":"{gid}"}}"#);
            assert_eq!(
                ClientFrame::parse(&text).unwrap(),
                ClientFrame::Typing { group_id: gid }
            );
        }
        let text = format!(r#"{{"type":"typing_stop","group_id":"{gid}"}}"#);
        assert_eq!(
            ClientFrame::parse(&text).unwrap(),
            ClientFrame::StopTyping { group_id: gid }
        );
    }

    #[test]
    fn test_parse_delivered_ack_forms() {
        let mid = MessageId::new();

        let object = format!(r#"{{"type":"delivered","data":{{"message_id":"{mid}"}}}}"#);
        assert_eq!(
            ClientFrame::parse(&object).unwrap(),
            ClientFrame::Delivered {
                message_ids: vec![mid]
            }
        );

        let encoded = serde_json::json!({
            "type": "delivered",
            "data": format!(r#"{{"message_id":"{mid}"}}"#),
        })
        .to_string();
        assert_eq!(
            ClientFrame::parse(&encoded).unwrap(),
            ClientFrame::Delivered {
                message_ids: vec![mid]
            }
        );
    }

    #[test]
    fn test_parse_read_ack_dedups_ids() {
        let gid = GroupId::new();
        let mid = MessageId::new();
        let text = format!(
            r#"{{"type":"message_read","group_id":"{gid}","data":{{"message_ids":["{mid}","{mid}"]}}}}"#
        );
        assert_eq!(
            ClientFrame::parse(&text).unwrap(),
            ClientFrame::Read {
                group_id: gid,
                message_ids: vec![mid]
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        assert!(matches!(
            ClientFrame::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientFrame::parse(r#"{"type":"teleport"}"#),
            Err(ProtocolError::UnknownType(_))
        ));
        // Server-only events are refused from clients.
        assert!(matches!(
            ClientFrame::parse(r#"{"type":"user_joined"}"#),
            Err(ProtocolError::UnknownType(_))
        ));
        assert!(matches!(
            ClientFrame::parse(r#"{"type":"typing"}"#),
            Err(ProtocolError::MissingField("group_id"))
        ));
        assert!(matches!(
            ClientFrame::parse(r#"{"type":"delivered","data":{}}"#),
            Err(ProtocolError::MissingField("message_id"))
        ));
    }

    #[test]
    fn test_wire_form_parses_back() {
        let gid = GroupId::new();
        let frame = ClientFrame::Read {
            group_id: gid,
            message_ids: vec![MessageId::new(), MessageId::new()],
        };
        assert_eq!(ClientFrame::parse(&frame.to_wire().to_string()).unwrap(), frame);
        assert_eq!(
            ClientFrame::parse(&ClientFrame::Ping.to_wire().to_string()).unwrap(),
            ClientFrame::Ping
        );
    }

    #[test]
    fn test_parse_rejects_oversized_frame() {
        let text = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            ClientFrame::parse(&text),
            Err(ProtocolError::TooLarge { .. })
        ));
    }
}
