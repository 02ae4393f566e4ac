//! 已读回执
//!
//! 本端已读位置乐观更新后再上报服务端，上报失败只记录日志，不回滚。
//! 本端已读位置只前进：上报串行执行，且按消息日志中的位置拒绝更旧的 id，
//! 服务端收到的已读位置序列因此单调。
//! 对端的已读位置来自 read.updated 推送，仅用于"已读"标识展示。

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::events::{event_builders, EventManager};
use crate::http_client::ConversationApi;
use crate::storage::entities::{Conversation, SenderKind};
use crate::storage::message_store::SharedMessageStore;

/// read.updated 推送负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    #[serde(default, alias = "senderKind")]
    pub reader_kind: Option<SenderKind>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub last_read_message_id: String,
    #[serde(default)]
    pub unread_count: Option<u32>,
}

pub struct ReadReceiptTracker {
    self_user_id: String,
    api: Arc<dyn ConversationApi>,
    state: Mutex<Conversation>,
    events: Arc<EventManager>,
    /// 用于判断已读位置先后的消息日志
    order: Option<SharedMessageStore>,
    /// 状态更新与上报在同一临界区内完成
    reporting: tokio::sync::Mutex<()>,
}

impl ReadReceiptTracker {
    pub fn new(
        conversation_id: impl Into<String>,
        self_user_id: impl Into<String>,
        api: Arc<dyn ConversationApi>,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            self_user_id: self_user_id.into(),
            api,
            state: Mutex::new(Conversation::new(conversation_id)),
            events,
            order: None,
            reporting: tokio::sync::Mutex::new(()),
        }
    }

    /// 按消息日志中的位置比较已读位置，拒绝回退
    pub fn with_message_order(mut self, store: SharedMessageStore) -> Self {
        self.order = Some(store);
        self
    }

    /// 标记已读到 `message_id`
    ///
    /// 与当前已读位置相同、或在消息日志中早于当前已读位置时直接返回 `false`，不发请求。
    /// 并发调用按获得上报锁的顺序依次执行。
    pub async fn mark_read(&self, message_id: &str) -> bool {
        let _reporting = self.reporting.lock().await;

        let (conversation_id, unread_reset) = {
            let mut state = self.state.lock();
            if state.last_read_message_id.as_deref() == Some(message_id) {
                return false;
            }
            if let Some(current) = state.last_read_message_id.as_deref() {
                if self.is_behind(message_id, current) {
                    debug!("忽略回退的已读位置: {} (当前 {})", message_id, current);
                    return false;
                }
            }
            state.last_read_message_id = Some(message_id.to_string());
            let unread_reset = state.unread_count != 0;
            state.unread_count = 0;
            (state.id.clone(), unread_reset)
        };

        self.events.emit(event_builders::read_position_changed(
            &conversation_id,
            Some(message_id.to_string()),
            false,
        ));
        if unread_reset {
            self.events
                .emit(event_builders::unread_count_changed(&conversation_id, 0));
        }

        match self.api.mark_read(&conversation_id, message_id).await {
            Ok(()) => debug!("✅ 已读上报成功: message={}", message_id),
            Err(e) => warn!("⚠️ 已读上报失败（保留本地已读位置）: message={}, error={}", message_id, e),
        }
        true
    }

    /// 应用推送的已读回执，只有对端的回执会生效
    pub fn apply_remote(&self, receipt: ReadReceipt) -> bool {
        let is_remote = match receipt.reader_kind {
            Some(kind) => kind == SenderKind::RemoteParty,
            None => receipt
                .user_id
                .as_deref()
                .map(|user_id| user_id != self.self_user_id)
                .unwrap_or(false),
        };
        if !is_remote {
            debug!("忽略非对端已读回执: {:?}", receipt.user_id);
            return false;
        }

        let conversation_id = {
            let mut state = self.state.lock();
            if state.remote_last_read_message_id.as_deref()
                == Some(receipt.last_read_message_id.as_str())
            {
                return false;
            }
            state.remote_last_read_message_id = Some(receipt.last_read_message_id.clone());
            state.id.clone()
        };

        self.events.emit(event_builders::read_position_changed(
            &conversation_id,
            Some(receipt.last_read_message_id),
            true,
        ));
        true
    }

    /// 用服务端提供的已读位置 / 未读数初始化本地状态（不上报）
    pub fn apply_server_hint(&self, last_read_message_id: Option<String>, unread_count: Option<u32>) {
        let (conversation_id, read_changed, unread_changed) = {
            let mut state = self.state.lock();
            let read_changed = match last_read_message_id {
                Some(id) if state.last_read_message_id.as_deref() != Some(id.as_str()) => {
                    state.last_read_message_id = Some(id.clone());
                    Some(id)
                }
                _ => None,
            };
            let unread_changed = match unread_count {
                Some(count) if count != state.unread_count => {
                    state.unread_count = count;
                    Some(count)
                }
                _ => None,
            };
            (state.id.clone(), read_changed, unread_changed)
        };

        if let Some(id) = read_changed {
            info!("📍 服务端已读位置: {}", id);
            self.events.emit(event_builders::read_position_changed(
                &conversation_id,
                Some(id),
                false,
            ));
        }
        if let Some(count) = unread_changed {
            self.events
                .emit(event_builders::unread_count_changed(&conversation_id, count));
        }
    }

    pub fn conversation(&self) -> Conversation {
        self.state.lock().clone()
    }

    /// `candidate` 是否在消息日志中早于 `current`；任一方不在日志中时不做判断
    fn is_behind(&self, candidate: &str, current: &str) -> bool {
        let Some(order) = &self.order else {
            return false;
        };
        let store = order.lock();
        match (store.position_of_id(candidate), store.position_of_id(current)) {
            (Some(candidate), Some(current)) => candidate < current,
            _ => false,
        }
    }
}
