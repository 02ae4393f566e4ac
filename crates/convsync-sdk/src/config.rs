//! 同步引擎配置

use serde::{Deserialize, Serialize};

use crate::error::{ConvSyncError, Result};
use crate::reconnect::ReconnectPolicy;
use crate::storage::entities::CurrentUser;

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// REST 请求超时（秒），不作用于长连接的推送通道
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

/// 同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// REST / 推送通道的基础 URL，例如 https://api.example.com/v1
    pub base_url: String,
    /// 会话ID（每个工作流一个会话）
    pub conversation_id: String,
    pub current_user: CurrentUser,
    pub reconnect: ReconnectPolicy,
    /// 输入状态自动过期时间（毫秒）
    pub typing_expiry_ms: u64,
    pub http_client_config: HttpClientConfig,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    pub fn typing_expiry(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.typing_expiry_ms)
    }
}

#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    base_url: Option<String>,
    conversation_id: Option<String>,
    current_user: Option<CurrentUser>,
    reconnect: Option<ReconnectPolicy>,
    typing_expiry_ms: Option<u64>,
    http_client_config: Option<HttpClientConfig>,
    event_buffer_size: Option<usize>,
}

impl SyncConfigBuilder {
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn current_user(mut self, current_user: CurrentUser) -> Self {
        self.current_user = Some(current_user);
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    pub fn typing_expiry_ms(mut self, typing_expiry_ms: u64) -> Self {
        self.typing_expiry_ms = Some(typing_expiry_ms);
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.http_client_config = Some(config);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    pub fn build(self) -> Result<SyncConfig> {
        let base_url = self
            .base_url
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ConvSyncError::Config("base_url is required".to_string()))?;
        let conversation_id = self
            .conversation_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ConvSyncError::Config("conversation_id is required".to_string()))?;
        let current_user = self
            .current_user
            .filter(|user| !user.id.is_empty())
            .ok_or_else(|| ConvSyncError::Config("current_user is required".to_string()))?;

        let typing_expiry_ms = self.typing_expiry_ms.unwrap_or(3_000);
        if typing_expiry_ms == 0 {
            return Err(ConvSyncError::Config(
                "typing_expiry_ms must be greater than zero".to_string(),
            ));
        }

        Ok(SyncConfig {
            base_url,
            conversation_id,
            current_user,
            reconnect: self.reconnect.unwrap_or_default(),
            typing_expiry_ms,
            http_client_config: self.http_client_config.unwrap_or_default(),
            event_buffer_size: self.event_buffer_size.unwrap_or(256),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = SyncConfig::builder()
            .base_url("https://api.example.com/v1/")
            .conversation_id("wf-42")
            .current_user(CurrentUser::new("u1", "Ann"))
            .build()
            .unwrap();

        assert_eq!(config.base_url, "https://api.example.com/v1");
        assert_eq!(config.reconnect, ReconnectPolicy::Fixed { delay_ms: 5_000 });
        assert_eq!(config.typing_expiry(), std::time::Duration::from_secs(3));
        assert_eq!(config.event_buffer_size, 256);
    }

    #[test]
    fn test_builder_rejects_missing_fields() {
        let missing_url = SyncConfig::builder()
            .conversation_id("wf-42")
            .current_user(CurrentUser::new("u1", "Ann"))
            .build();
        assert!(matches!(missing_url, Err(ConvSyncError::Config(_))));

        let empty_user = SyncConfig::builder()
            .base_url("https://api.example.com")
            .conversation_id("wf-42")
            .current_user(CurrentUser::new("", "Ann"))
            .build();
        assert!(matches!(empty_user, Err(ConvSyncError::Config(_))));

        let zero_expiry = SyncConfig::builder()
            .base_url("https://api.example.com")
            .conversation_id("wf-42")
            .current_user(CurrentUser::new("u1", "Ann"))
            .typing_expiry_ms(0)
            .build();
        assert!(zero_expiry.is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = SyncConfig::builder()
            .base_url("https://api.example.com")
            .conversation_id("wf-42")
            .current_user(CurrentUser::new("u1", "Ann").with_auth_token("t0k"))
            .reconnect(ReconnectPolicy::exponential())
            .build()
            .unwrap();

        let json = serde_json::to_string(&config).unwrap();
        let decoded: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.current_user.auth_token.as_deref(), Some("t0k"));
        assert_eq!(decoded.reconnect, config.reconnect);
    }
}
