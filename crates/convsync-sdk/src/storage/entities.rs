//! 数据实体定义 - 对应 REST / 推送通道中的 JSON 结构
//!
//! 这里定义了同步引擎使用的所有数据结构，用于：
//! - 类型安全的数据传输
//! - 统一的数据表示（服务端字段统一为 camelCase）
//! - 序列化/反序列化支持

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 消息发送方类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SenderKind {
    /// 本端（当前租户用户）
    LocalParty,
    /// 对端（构建团队）
    RemoteParty,
    /// 系统消息，无 sender_id
    System,
}

impl fmt::Display for SenderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderKind::LocalParty => write!(f, "local-party"),
            SenderKind::RemoteParty => write!(f, "remote-party"),
            SenderKind::System => write!(f, "system"),
        }
    }
}

/// 投递状态，仅在消息尚未被服务端确认时有意义
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Sending => write!(f, "sending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// 附件描述（文件本身由外部文件服务上传，这里只保存引用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// 消息实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// 服务端消息ID，未确认的本地消息为 None
    #[serde(default)]
    pub id: Option<String>,
    /// 客户端生成的关联ID，用于把乐观消息与服务端确认匹配
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub conversation_id: String,
    pub sender_kind: SenderKind,
    #[serde(default)]
    pub sender_id: Option<String>,
    /// 删除后清空
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    /// 墓碑标记
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// None 表示已发送 / 服务端来源
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_status: Option<DeliveryStatus>,
}

impl Message {
    /// 是否已被服务端确认（持有服务端 id）
    pub fn is_confirmed(&self) -> bool {
        self.id.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// 是否为本地发起且仍在途 / 失败的占位消息
    pub fn is_pending(&self) -> bool {
        !self.is_confirmed()
            && matches!(
                self.delivery_status,
                Some(DeliveryStatus::Sending) | Some(DeliveryStatus::Failed)
            )
    }

    /// 用于日志的简短标识
    pub fn display_key(&self) -> String {
        match (&self.id, &self.correlation_id) {
            (Some(id), _) => id.clone(),
            (None, Some(cid)) => format!("cid:{}", cid),
            (None, None) => "<anonymous>".to_string(),
        }
    }
}

/// message.updated 携带的可变字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePatch {
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
}

impl MessagePatch {
    pub fn is_empty(&self) -> bool {
        self.body.is_none() && self.attachments.is_none() && self.edited_at.is_none()
    }
}

/// 会话读状态视图
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    /// 本端最后已读消息
    pub last_read_message_id: Option<String>,
    /// 对端最后已读消息（用于"已读"标识）
    pub remote_last_read_message_id: Option<String>,
    /// 服务端上报的未读数
    pub unread_count: u32,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// 当前登录用户（由宿主应用提供，引擎不负责认证）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub id: String,
    pub display_name: String,
    /// 可选的 Bearer token，附加到所有 REST / SSE 请求
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl CurrentUser {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}
