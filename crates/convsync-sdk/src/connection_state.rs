//! 推送通道连接状态
//!
//! 提供连接状态及统计信息，包括：
//! - 当前状态（未连接 / 连接中 / 已连接）
//! - 连接建立时间、重连次数、最后一次错误
//! - 已接收帧数 / 丢弃帧数

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::events::{event_builders, EventManager};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "未连接"),
            ConnectionStatus::Connecting => write!(f, "连接中"),
            ConnectionStatus::Connected => write!(f, "已连接"),
        }
    }
}

/// 连接状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// 服务端在 connected 帧中确认的会话 ID
    pub conversation_id: Option<String>,
    /// 连接建立时间（UTC毫秒时间戳）
    pub connected_at: Option<i64>,
    /// 累计重连次数
    pub reconnect_count: u64,
    pub frames_received: u64,
    /// 解析失败被丢弃的帧
    pub frames_dropped: u64,
    pub last_error: Option<String>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            conversation_id: None,
            connected_at: None,
            reconnect_count: 0,
            frames_received: 0,
            frames_dropped: 0,
            last_error: None,
        }
    }

    /// 获取连接持续时间（秒）
    pub fn connection_duration_secs(&self) -> Option<i64> {
        self.connected_at
            .map(|connected_at| (Utc::now().timestamp_millis() - connected_at) / 1000)
    }

    /// 生成状态摘要（用于日志打印）
    pub fn summary(&self) -> String {
        format!(
            "【推送通道】状态: {}, 会话: {}, 重连: {} 次, 接收帧: {}, 丢弃帧: {}",
            self.status,
            self.conversation_id.as_deref().unwrap_or("-"),
            self.reconnect_count,
            self.frames_received,
            self.frames_dropped,
        )
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// 连接状态管理器（线程安全）
///
/// 每次状态切换都会广播 `ConnectionStateChanged`。
#[derive(Clone)]
pub struct ConnectionStateManager {
    state: Arc<RwLock<ConnectionState>>,
    event_manager: Arc<EventManager>,
}

impl ConnectionStateManager {
    pub fn new(event_manager: Arc<EventManager>) -> Self {
        Self {
            state: Arc::new(RwLock::new(ConnectionState::new())),
            event_manager,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.read().status
    }

    pub fn mark_connecting(&self, is_reconnect: bool) {
        {
            let mut state = self.state.write();
            if is_reconnect {
                state.reconnect_count += 1;
            }
        }
        self.transition(ConnectionStatus::Connecting);
    }

    /// 标记连接成功
    pub fn mark_connected(&self) {
        {
            let mut state = self.state.write();
            state.connected_at = Some(Utc::now().timestamp_millis());
            state.last_error = None;
        }
        self.transition(ConnectionStatus::Connected);
    }

    /// 标记断开连接
    pub fn mark_disconnected(&self, error: Option<String>) {
        {
            let mut state = self.state.write();
            state.connected_at = None;
            if error.is_some() {
                state.last_error = error;
            }
        }
        self.transition(ConnectionStatus::Disconnected);
    }

    pub fn set_conversation_id(&self, conversation_id: String) {
        self.state.write().conversation_id = Some(conversation_id);
    }

    pub fn increment_received(&self) {
        self.state.write().frames_received += 1;
    }

    pub fn increment_dropped(&self) {
        self.state.write().frames_dropped += 1;
    }

    pub fn get_state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn log_state(&self) {
        info!("{}", self.state.read().summary());
    }

    fn transition(&self, new_status: ConnectionStatus) {
        let old_status = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.status, new_status)
        };
        if old_status != new_status {
            info!("🔌 推送通道状态: {} -> {}", old_status, new_status);
            self.event_manager
                .emit(event_builders::connection_state_changed(old_status, new_status));
        }
    }
}
