//! 事件系统模块 - 向 UI 层广播同步引擎的状态变化
//!
//! 功能包括：
//! - 消息时间线变更事件
//! - 发送状态变更事件
//! - 自动滚动 / 新消息提示决策
//! - 输入状态、连接状态、已读位置、未读数变更
//! - 事件广播和订阅机制

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::connection_state::ConnectionStatus;
use crate::storage::entities::DeliveryStatus;
use crate::typing::TypingState;

/// 同步引擎事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 消息快照发生变化，UI 应重新读取 `snapshot()`
    TimelineChanged {
        conversation_id: String,
        timestamp: i64,
    },
    /// 本地发送的消息状态变化
    SendStatusChanged {
        correlation_id: String,
        message_id: Option<String>,
        status: DeliveryStatus,
        error: Option<String>,
        timestamp: i64,
    },
    /// 视口停在底部时收到新消息
    ScrollToBottom {
        conversation_id: String,
        timestamp: i64,
    },
    /// 视口不在底部时收到新消息
    NewMessagesAvailable {
        conversation_id: String,
        count: usize,
        timestamp: i64,
    },
    /// 正在输入的远端用户集合变化
    TypingChanged {
        conversation_id: String,
        users: Vec<TypingState>,
        timestamp: i64,
    },
    ConnectionStateChanged {
        old_state: ConnectionStatus,
        new_state: ConnectionStatus,
        timestamp: i64,
    },
    /// 已读位置变化，remote 为 true 表示对端的已读位置
    ReadPositionChanged {
        conversation_id: String,
        last_read_message_id: Option<String>,
        remote: bool,
        timestamp: i64,
    },
    UnreadCountChanged {
        conversation_id: String,
        unread_count: u32,
        timestamp: i64,
    },
    /// 断线重同步完成
    ResyncCompleted {
        conversation_id: String,
        inserted: usize,
        updated: usize,
        timestamp: i64,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::TimelineChanged { .. } => "timeline_changed",
            SyncEvent::SendStatusChanged { .. } => "send_status_changed",
            SyncEvent::ScrollToBottom { .. } => "scroll_to_bottom",
            SyncEvent::NewMessagesAvailable { .. } => "new_messages_available",
            SyncEvent::TypingChanged { .. } => "typing_changed",
            SyncEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            SyncEvent::ReadPositionChanged { .. } => "read_position_changed",
            SyncEvent::UnreadCountChanged { .. } => "unread_count_changed",
            SyncEvent::ResyncCompleted { .. } => "resync_completed",
        }
    }

    /// 获取事件时间戳（UTC 毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::TimelineChanged { timestamp, .. }
            | SyncEvent::SendStatusChanged { timestamp, .. }
            | SyncEvent::ScrollToBottom { timestamp, .. }
            | SyncEvent::NewMessagesAvailable { timestamp, .. }
            | SyncEvent::TypingChanged { timestamp, .. }
            | SyncEvent::ConnectionStateChanged { timestamp, .. }
            | SyncEvent::ReadPositionChanged { timestamp, .. }
            | SyncEvent::UnreadCountChanged { timestamp, .. }
            | SyncEvent::ResyncCompleted { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

/// 事件管理器
///
/// `emit` 是同步的，可以在定时器回调和持锁之外的任意位置调用。
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: RwLock<HashMap<String, Vec<EventListener>>>,
    stats: Mutex<EventStats>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            stats: Mutex::new(EventStats::default()),
        }
    }

    pub fn shared(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.lock();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景（无 UI 的测试 / 后台模式）
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read();
        for key in [event.event_type(), "*"] {
            if let Some(event_listeners) = listeners.get(key) {
                for listener in event_listeners {
                    listener(&event);
                }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 添加事件监听器，`"*"` 监听全部事件
    pub fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write();
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Box::new(listener));
        self.stats.lock().listener_count = listeners.values().map(Vec::len).sum();

        info!("Added listener for event type: {}", event_type);
    }

    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.lock().listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 事件生成器 - 统一填充时间戳
pub mod event_builders {
    use super::*;

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn timeline_changed(conversation_id: &str) -> SyncEvent {
        SyncEvent::TimelineChanged {
            conversation_id: conversation_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn send_status_changed(
        correlation_id: &str,
        message_id: Option<String>,
        status: DeliveryStatus,
        error: Option<String>,
    ) -> SyncEvent {
        SyncEvent::SendStatusChanged {
            correlation_id: correlation_id.to_string(),
            message_id,
            status,
            error,
            timestamp: now_millis(),
        }
    }

    pub fn scroll_to_bottom(conversation_id: &str) -> SyncEvent {
        SyncEvent::ScrollToBottom {
            conversation_id: conversation_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn new_messages_available(conversation_id: &str, count: usize) -> SyncEvent {
        SyncEvent::NewMessagesAvailable {
            conversation_id: conversation_id.to_string(),
            count,
            timestamp: now_millis(),
        }
    }

    pub fn typing_changed(conversation_id: &str, users: Vec<TypingState>) -> SyncEvent {
        SyncEvent::TypingChanged {
            conversation_id: conversation_id.to_string(),
            users,
            timestamp: now_millis(),
        }
    }

    pub fn connection_state_changed(
        old_state: ConnectionStatus,
        new_state: ConnectionStatus,
    ) -> SyncEvent {
        SyncEvent::ConnectionStateChanged {
            old_state,
            new_state,
            timestamp: now_millis(),
        }
    }

    pub fn read_position_changed(
        conversation_id: &str,
        last_read_message_id: Option<String>,
        remote: bool,
    ) -> SyncEvent {
        SyncEvent::ReadPositionChanged {
            conversation_id: conversation_id.to_string(),
            last_read_message_id,
            remote,
            timestamp: now_millis(),
        }
    }

    pub fn unread_count_changed(conversation_id: &str, unread_count: u32) -> SyncEvent {
        SyncEvent::UnreadCountChanged {
            conversation_id: conversation_id.to_string(),
            unread_count,
            timestamp: now_millis(),
        }
    }

    pub fn resync_completed(conversation_id: &str, inserted: usize, updated: usize) -> SyncEvent {
        SyncEvent::ResyncCompleted {
            conversation_id: conversation_id.to_string(),
            inserted,
            updated,
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_event_manager_basic_functionality() {
        let manager = EventManager::new(16);
        let mut receiver = manager.subscribe();

        manager.emit(event_builders::timeline_changed("wf-1"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "timeline_changed");

        let stats = manager.get_stats();
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.events_by_type.get("timeline_changed"), Some(&1));
    }

    #[test]
    fn test_event_listeners() {
        let manager = EventManager::new(16);
        let typed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let typed_clone = typed.clone();
        manager.add_listener("scroll_to_bottom", move |_| {
            typed_clone.fetch_add(1, Ordering::SeqCst);
        });
        let all_clone = all.clone();
        manager.add_listener("*", move |_| {
            all_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(manager.get_stats().listener_count, 2);

        manager.emit(event_builders::scroll_to_bottom("wf-1"));
        manager.emit(event_builders::new_messages_available("wf-1", 2));

        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);

        manager.clear_listeners();
        manager.emit(event_builders::scroll_to_bottom("wf-1"));
        assert_eq!(typed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let manager = EventManager::new(4);
        assert_eq!(manager.subscriber_count(), 0);
        manager.emit(event_builders::unread_count_changed("wf-1", 3));
        assert_eq!(manager.get_stats().total_events, 1);
    }
}
