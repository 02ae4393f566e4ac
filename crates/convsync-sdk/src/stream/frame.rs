//! 推送帧解析
//!
//! 每个推送帧是一个 JSON 对象：
//! `{ type, conversationId?, payload | data, lastMessageId?, lastReadMessageId?, unreadCount?, resyncRecommended? }`
//!
//! 负载统一归一到 `payload`；旧版服务端使用的 `data` 仅在没有 `payload` 时才会被采用。

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ConvSyncError, Result};
use crate::read_receipt::ReadReceipt;
use crate::storage::entities::{Message, MessagePatch};

/// 传输层交付的原始帧（SSE 的 event 名 + data 文本）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub event: Option<String>,
    pub data: String,
}

impl RawFrame {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }
}

/// 解析后的推送帧
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    /// 帧所属会话，缺省表示当前会话
    pub conversation_id: Option<String>,
    pub event: StreamEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected {
        conversation_id: Option<String>,
        last_message_id: Option<String>,
        last_read_message_id: Option<String>,
        unread_count: Option<u32>,
        resync_recommended: bool,
    },
    MessageCreated(Message),
    MessageUpdated {
        id: String,
        patch: MessagePatch,
    },
    MessageDeleted {
        id: String,
        deleted_at: DateTime<Utc>,
    },
    TypingStarted {
        user_id: String,
        display_name: String,
    },
    TypingStopped {
        user_id: String,
    },
    ReadUpdated(ReadReceipt),
    /// ping / heartbeat 保活帧
    Heartbeat,
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::MessageCreated(_) => "message.created",
            StreamEvent::MessageUpdated { .. } => "message.updated",
            StreamEvent::MessageDeleted { .. } => "message.deleted",
            StreamEvent::TypingStarted { .. } => "typing.started",
            StreamEvent::TypingStopped { .. } => "typing.stopped",
            StreamEvent::ReadUpdated(_) => "read.updated",
            StreamEvent::Heartbeat => "heartbeat",
        }
    }

    /// 连接握手之后需要整体重同步
    pub fn wants_resync(&self) -> bool {
        match self {
            StreamEvent::Connected {
                last_message_id,
                last_read_message_id,
                resync_recommended,
                ..
            } => *resync_recommended || last_message_id.is_some() || last_read_message_id.is_some(),
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    last_message_id: Option<String>,
    #[serde(default)]
    last_read_message_id: Option<String>,
    #[serde(default)]
    unread_count: Option<u32>,
    #[serde(default)]
    resync_recommended: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedPayload {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    last_message_id: Option<String>,
    #[serde(default)]
    last_read_message_id: Option<String>,
    #[serde(default)]
    unread_count: Option<u32>,
    #[serde(default)]
    resync_recommended: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatedPayload {
    id: String,
    #[serde(flatten)]
    patch: MessagePatch,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeletedPayload {
    id: String,
    #[serde(default)]
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingPayload {
    user_id: String,
    #[serde(default)]
    display_name: Option<String>,
}

/// 解析一帧文本
///
/// `fallback_type` 为 SSE `event:` 字段，JSON 内没有 `type` 时使用。
pub fn parse_frame(text: &str, fallback_type: Option<&str>) -> Result<StreamFrame> {
    let wire: WireFrame = serde_json::from_str(text)
        .map_err(|e| ConvSyncError::InvalidFrame(format!("invalid json: {}", e)))?;

    let kind = wire
        .kind
        .clone()
        .or_else(|| fallback_type.map(str::to_string))
        .ok_or_else(|| ConvSyncError::InvalidFrame("missing frame type".to_string()))?;

    let conversation_id = wire.conversation_id.clone();
    let payload = unwrap_envelope(wire.payload.clone().or_else(|| wire.data.clone()));

    let event = match kind.as_str() {
        "connected" => {
            let nested: ConnectedPayload = match payload {
                Some(value @ Value::Object(_)) => decode(value, &kind)?,
                _ => ConnectedPayload::default(),
            };
            StreamEvent::Connected {
                conversation_id: wire.conversation_id.or(nested.conversation_id),
                last_message_id: wire.last_message_id.or(nested.last_message_id),
                last_read_message_id: wire.last_read_message_id.or(nested.last_read_message_id),
                unread_count: wire.unread_count.or(nested.unread_count),
                resync_recommended: wire
                    .resync_recommended
                    .or(nested.resync_recommended)
                    .unwrap_or(false),
            }
        }
        "message.created" => {
            let mut value = require_payload(payload, &kind)?;
            if let (Value::Object(map), Some(id)) = (&mut value, &conversation_id) {
                map.entry("conversationId")
                    .or_insert_with(|| Value::String(id.clone()));
            }
            StreamEvent::MessageCreated(decode(value, &kind)?)
        }
        "message.updated" => {
            let updated: UpdatedPayload = decode(require_payload(payload, &kind)?, &kind)?;
            StreamEvent::MessageUpdated {
                id: updated.id,
                patch: updated.patch,
            }
        }
        "message.deleted" => {
            let deleted: DeletedPayload = decode(require_payload(payload, &kind)?, &kind)?;
            StreamEvent::MessageDeleted {
                id: deleted.id,
                deleted_at: deleted.deleted_at.unwrap_or_else(Utc::now),
            }
        }
        "typing.started" => {
            let typing: TypingPayload = decode(require_payload(payload, &kind)?, &kind)?;
            StreamEvent::TypingStarted {
                display_name: typing.display_name.unwrap_or_else(|| typing.user_id.clone()),
                user_id: typing.user_id,
            }
        }
        "typing.stopped" => {
            let typing: TypingPayload = decode(require_payload(payload, &kind)?, &kind)?;
            StreamEvent::TypingStopped {
                user_id: typing.user_id,
            }
        }
        "read.updated" => StreamEvent::ReadUpdated(decode(require_payload(payload, &kind)?, &kind)?),
        "ping" | "heartbeat" => StreamEvent::Heartbeat,
        other => {
            return Err(ConvSyncError::InvalidFrame(format!(
                "unknown frame type: {}",
                other
            )))
        }
    };

    Ok(StreamFrame {
        conversation_id,
        event,
    })
}

/// `{ "message": {...} }` 形式的负载取出内层对象
fn unwrap_envelope(payload: Option<Value>) -> Option<Value> {
    match payload {
        Some(Value::Object(mut map))
            if map.len() == 1 && map.get("message").is_some_and(Value::is_object) =>
        {
            map.remove("message")
        }
        other => other,
    }
}

fn require_payload(payload: Option<Value>, kind: &str) -> Result<Value> {
    match payload {
        Some(value @ Value::Object(_)) => Ok(value),
        Some(_) | None => Err(ConvSyncError::InvalidFrame(format!(
            "{} frame without object payload",
            kind
        ))),
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, kind: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| ConvSyncError::InvalidFrame(format!("{} payload: {}", kind, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::SenderKind;

    #[test]
    fn test_parse_message_created_with_data_alias() {
        let frame = parse_frame(
            r#"{"type":"message.created","conversationId":"wf-1",
                "data":{"id":"m1","senderKind":"remote-party","senderId":"b1",
                        "body":"hi","createdAt":"2024-05-01T10:00:00Z"}}"#,
            None,
        )
        .unwrap();

        assert_eq!(frame.conversation_id.as_deref(), Some("wf-1"));
        match frame.event {
            StreamEvent::MessageCreated(message) => {
                assert_eq!(message.id.as_deref(), Some("m1"));
                assert_eq!(message.conversation_id, "wf-1");
                assert_eq!(message.sender_kind, SenderKind::RemoteParty);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_payload_wins_over_data() {
        let frame = parse_frame(
            r#"{"type":"typing.started",
                "payload":{"userId":"b1","displayName":"Bob"},
                "data":{"userId":"x9"}}"#,
            None,
        )
        .unwrap();
        assert_eq!(
            frame.event,
            StreamEvent::TypingStarted {
                user_id: "b1".to_string(),
                display_name: "Bob".to_string()
            }
        );
    }

    #[test]
    fn test_message_envelope_and_fallback_type() {
        let frame = parse_frame(
            r#"{"conversationId":"wf-1","payload":{"message":{"id":"m2","correlationId":"c1",
                "senderKind":"local-party","senderId":"me","body":"yo",
                "createdAt":"2024-05-01T10:01:00Z"}}}"#,
            Some("message.created"),
        )
        .unwrap();
        match frame.event {
            StreamEvent::MessageCreated(message) => {
                assert_eq!(message.correlation_id.as_deref(), Some("c1"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_connected_hints() {
        let frame = parse_frame(
            r#"{"type":"connected","conversationId":"wf-1","lastMessageId":"m9","unreadCount":2}"#,
            None,
        )
        .unwrap();
        assert!(frame.event.wants_resync());
        match frame.event {
            StreamEvent::Connected {
                conversation_id,
                last_message_id,
                unread_count,
                resync_recommended,
                ..
            } => {
                assert_eq!(conversation_id.as_deref(), Some("wf-1"));
                assert_eq!(last_message_id.as_deref(), Some("m9"));
                assert_eq!(unread_count, Some(2));
                assert!(!resync_recommended);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let bare = parse_frame(r#"{"type":"connected"}"#, None).unwrap();
        assert!(!bare.event.wants_resync());
    }

    #[test]
    fn test_update_delete_and_heartbeat() {
        let updated = parse_frame(
            r#"{"type":"message.updated","payload":{"id":"m1","body":"edited",
                "editedAt":"2024-05-01T10:05:00Z"}}"#,
            None,
        )
        .unwrap();
        match updated.event {
            StreamEvent::MessageUpdated { id, patch } => {
                assert_eq!(id, "m1");
                assert_eq!(patch.body.as_deref(), Some("edited"));
                assert!(patch.edited_at.is_some());
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let deleted = parse_frame(r#"{"type":"message.deleted","payload":{"id":"m1"}}"#, None).unwrap();
        assert!(matches!(deleted.event, StreamEvent::MessageDeleted { ref id, .. } if id == "m1"));

        let ping = parse_frame(r#"{"type":"ping"}"#, None).unwrap();
        assert_eq!(ping.event, StreamEvent::Heartbeat);
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(matches!(parse_frame("not json", None), Err(ConvSyncError::InvalidFrame(_))));
        assert!(matches!(parse_frame(r#"{"payload":{}}"#, None), Err(ConvSyncError::InvalidFrame(_))));
        assert!(matches!(
            parse_frame(r#"{"type":"message.created"}"#, None),
            Err(ConvSyncError::InvalidFrame(_))
        ));
        assert!(matches!(
            parse_frame(r#"{"type":"workflow.exploded","payload":{}}"#, None),
            Err(ConvSyncError::InvalidFrame(_))
        ));
        assert!(matches!(
            parse_frame(r#"{"type":"message.updated","payload":{"body":"no id"}}"#, None),
            Err(ConvSyncError::InvalidFrame(_))
        ));
    }
}
