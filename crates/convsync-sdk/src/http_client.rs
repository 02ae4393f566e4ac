//! HTTP 客户端模块 - 会话 REST 接口
//!
//! 本模块定义同步引擎依赖的 REST 契约（`ConversationApi`），并提供基于 reqwest 的实现。
//! 引擎只依赖 trait，测试中可以替换为内存实现。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::SyncConfig;
use crate::error::{ConvSyncError, Result};
use crate::storage::entities::Message;

/// GET /conversations/{id}/messages 响应（messages 为从新到旧）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchMessagesResponse {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub last_read_message_id: Option<String>,
    #[serde(default)]
    pub unread_count: Option<u32>,
}

/// POST /conversations/{id}/messages 请求体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequest {
    pub body: String,
    pub correlation_id: String,
    /// 已上传附件的文件ID
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateMessageResponse {
    message: Message,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadRequest<'a> {
    last_read_message_id: &'a str,
}

/// 会话 REST 契约
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// 拉取会话快照
    async fn fetch_messages(&self, conversation_id: &str) -> Result<FetchMessagesResponse>;

    /// 创建消息，服务端会在返回的消息（及推送事件）中回显 correlation_id
    async fn create_message(
        &self,
        conversation_id: &str,
        request: &CreateMessageRequest,
    ) -> Result<Message>;

    /// 上报已读位置
    async fn mark_read(&self, conversation_id: &str, last_read_message_id: &str) -> Result<()>;
}

/// 基于 reqwest 的 REST 客户端
pub struct HttpConversationApi {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpConversationApi {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let mut builder = Client::builder();

        if let Some(timeout) = config.http_client_config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.http_client_config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| ConvSyncError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ HTTP 客户端已创建 (base_url: {})", config.base_url);

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            auth_token: config.current_user.auth_token.clone(),
        })
    }

    fn messages_url(&self, conversation_id: &str) -> String {
        format!("{}/conversations/{}/messages", self.base_url, conversation_id)
    }

    fn read_url(&self, conversation_id: &str) -> String {
        format!("{}/conversations/{}/read", self.base_url, conversation_id)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// 非 2xx 转为 `ConvSyncError::Http`
pub(crate) async fn ensure_success(response: Response, action: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "无法读取错误信息".to_string());
    error!("❌ {}失败，HTTP 状态码: {}, 错误: {}", action, status, body);
    Err(ConvSyncError::Http {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn fetch_messages(&self, conversation_id: &str) -> Result<FetchMessagesResponse> {
        debug!("📥 拉取会话消息: {}", conversation_id);
        let response = self
            .authorized(self.client.get(self.messages_url(conversation_id)))
            .send()
            .await?;
        let response = ensure_success(response, "拉取会话消息").await?;
        let mut snapshot: FetchMessagesResponse = response.json().await?;
        if snapshot.conversation_id.is_empty() {
            snapshot.conversation_id = conversation_id.to_string();
        }
        Ok(snapshot)
    }

    async fn create_message(
        &self,
        conversation_id: &str,
        request: &CreateMessageRequest,
    ) -> Result<Message> {
        debug!("📤 创建消息: conversation={}, cid={}", conversation_id, request.correlation_id);
        let response = self
            .authorized(self.client.post(self.messages_url(conversation_id)))
            .json(request)
            .send()
            .await?;
        let response = ensure_success(response, "发送消息").await?;
        let created: CreateMessageResponse = response.json().await?;
        Ok(created.message)
    }

    async fn mark_read(&self, conversation_id: &str, last_read_message_id: &str) -> Result<()> {
        debug!("👁 上报已读: conversation={}, message={}", conversation_id, last_read_message_id);
        let response = self
            .authorized(self.client.post(self.read_url(conversation_id)))
            .json(&MarkReadRequest { last_read_message_id })
            .send()
            .await?;
        ensure_success(response, "上报已读").await?;
        Ok(())
    }
}
