//! 会话消息日志
//!
//! 单个会话的有序、去重消息列表，所有写入来源（首屏拉取、乐观发送、推送事件、
//! 断线重同步）都经过这里的去重入口。
//!
//! 不变量：
//! - 同一 correlation_id 至多出现一次
//! - 同一服务端 id 至多出现一次
//! - 按 created_at 非递减排列，相同时间按插入顺序
//! - 墓碑消息只原地修改，永不移除

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::storage::entities::{DeliveryStatus, Message, MessagePatch};

/// 引擎内部共享的消息日志
///
/// 使用同步锁：任何多步修改都在一次加锁内完成，临界区内不允许 `.await`。
pub type SharedMessageStore = Arc<Mutex<MessageStore>>;

/// 重同步合并结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// 新插入或完成对账的消息数
    pub inserted: usize,
    /// 被服务端快照修正（编辑 / 删除）的已有消息数
    pub updated: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.updated > 0
    }
}

/// 单条消息入库 / 对账的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// 作为新消息插入
    Appended,
    /// 占位被服务端消息原地替换
    Reconciled,
    /// 服务端消息已经通过其他路径入库，仅移除了重复的占位
    Merged,
    /// 重复到达，日志未变化
    Unchanged,
}

impl IngestOutcome {
    pub fn changed(self) -> bool {
        self != IngestOutcome::Unchanged
    }

    /// 该消息是否第一次以确认后的身份出现在日志中
    ///
    /// `Merged` 不算：对应的消息此前已经入库并被计数过。
    pub fn is_first_arrival(self) -> bool {
        matches!(self, IngestOutcome::Appended | IngestOutcome::Reconciled)
    }
}

#[derive(Debug, Default)]
pub struct MessageStore {
    entries: Vec<Message>,
    ids: HashSet<String>,
    correlation_ids: HashSet<String>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedMessageStore {
        Arc::new(Mutex::new(Self::new()))
    }

    /// 追加消息
    ///
    /// 若 id 或 correlation_id 已存在则为空操作并返回 false。
    pub fn append(&mut self, message: Message) -> bool {
        if self.contains_identity(&message) {
            debug!("🔄 忽略重复消息: {}", message.display_key());
            return false;
        }
        self.insert_sorted(message);
        true
    }

    /// 用服务端确认的消息替换同 correlation_id 的占位消息
    ///
    /// - 找不到占位：退化为 `append`
    /// - 占位已被确认（另一通道先到）：空操作
    /// - 确认消息的 id 已存在于另一条记录：丢弃重复的占位（`Merged`）
    pub fn upsert_by_correlation_id(
        &mut self,
        correlation_id: &str,
        final_message: Message,
    ) -> IngestOutcome {
        let mut message = final_message;
        message.correlation_id = Some(correlation_id.to_string());
        message.delivery_status = None;

        let Some(position) = self.position_by_correlation_id(correlation_id) else {
            return self.append_outcome(message);
        };

        if self.entries[position].is_confirmed() {
            debug!("🔄 占位消息已确认，忽略: cid={}", correlation_id);
            return IngestOutcome::Unchanged;
        }

        if let Some(id) = message.id.clone() {
            if self.ids.contains(&id) {
                let placeholder = self.entries.remove(position);
                self.unindex(&placeholder);
                if let Some(existing) = self
                    .entries
                    .iter_mut()
                    .find(|m| m.id.as_deref() == Some(id.as_str()))
                {
                    if existing.correlation_id.is_none() {
                        existing.correlation_id = Some(correlation_id.to_string());
                        self.correlation_ids.insert(correlation_id.to_string());
                    }
                }
                debug!("🧹 消息 {} 已通过其他路径入库，移除占位 cid={}", id, correlation_id);
                return IngestOutcome::Merged;
            }
        }

        let placeholder = std::mem::replace(&mut self.entries[position], message);
        self.unindex(&placeholder);
        let replaced = self.entries[position].clone();
        self.index(&replaced);

        if !self.is_ordered_at(position) {
            // 服务端时间戳与本地占位时间差异过大，重新定位
            let moved = self.entries.remove(position);
            let index = self.insertion_index(moved.created_at);
            self.entries.insert(index, moved);
        }

        debug!("✅ 占位消息已对账: cid={} -> {}", correlation_id, replaced.display_key());
        IngestOutcome::Reconciled
    }

    /// 按 id 修改已存在的消息
    pub fn apply_update(&mut self, id: &str, patch: MessagePatch) -> bool {
        if patch.is_empty() {
            return false;
        }
        let Some(message) = self.entries.iter_mut().find(|m| m.id.as_deref() == Some(id)) else {
            debug!("更新的消息不存在: {}", id);
            return false;
        };
        if message.is_deleted() {
            debug!("忽略对已删除消息的更新: {}", id);
            return false;
        }

        if let Some(body) = patch.body {
            message.body = body;
        }
        if let Some(attachments) = patch.attachments {
            message.attachments = attachments;
        }
        if patch.edited_at.is_some() {
            message.edited_at = patch.edited_at;
        }
        true
    }

    /// 墓碑化：清空内容、记录 deleted_at，位置不变。重复调用为空操作。
    pub fn apply_tombstone(&mut self, id: &str, deleted_at: DateTime<Utc>) -> bool {
        let Some(message) = self.entries.iter_mut().find(|m| m.id.as_deref() == Some(id)) else {
            debug!("删除的消息不存在: {}", id);
            return false;
        };
        if message.is_deleted() {
            return false;
        }
        message.body.clear();
        message.attachments.clear();
        message.deleted_at = Some(deleted_at);
        true
    }

    /// 带 correlation_id 感知的入库：已有占位则对账，否则追加
    pub fn ingest(&mut self, message: Message) -> IngestOutcome {
        match message.correlation_id.clone() {
            Some(cid) if self.correlation_ids.contains(&cid) => {
                self.upsert_by_correlation_id(&cid, message)
            }
            _ => self.append_outcome(message),
        }
    }

    /// 合并服务端快照（按从旧到新的顺序传入）
    ///
    /// 未知消息走 `ingest`；已知消息只接受删除与更新的编辑。
    pub fn merge_snapshot(&mut self, messages: Vec<Message>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for message in messages {
            let known = message.id.as_ref().map_or(false, |id| self.ids.contains(id));
            if !known {
                match self.ingest(message) {
                    IngestOutcome::Appended | IngestOutcome::Reconciled => outcome.inserted += 1,
                    IngestOutcome::Merged => outcome.updated += 1,
                    IngestOutcome::Unchanged => {}
                }
                continue;
            }

            let Some(id) = message.id.clone() else { continue };
            if let Some(deleted_at) = message.deleted_at {
                if self.apply_tombstone(&id, deleted_at) {
                    outcome.updated += 1;
                }
                continue;
            }

            let local_edited = self.get_by_id(&id).and_then(|m| m.edited_at);
            if message.edited_at.is_some() && message.edited_at > local_edited {
                let patch = MessagePatch {
                    body: Some(message.body),
                    attachments: Some(message.attachments),
                    edited_at: message.edited_at,
                };
                if self.apply_update(&id, patch) {
                    outcome.updated += 1;
                }
            }
        }
        outcome
    }

    /// 修改未确认消息的投递状态，已确认消息不受影响
    pub fn mark_delivery_status(&mut self, correlation_id: &str, status: DeliveryStatus) -> bool {
        let Some(position) = self.position_by_correlation_id(correlation_id) else {
            return false;
        };
        let message = &mut self.entries[position];
        if message.is_confirmed() || message.delivery_status == Some(status) {
            return false;
        }
        message.delivery_status = Some(status);
        true
    }

    pub fn get_by_id(&self, id: &str) -> Option<&Message> {
        self.entries.iter().find(|m| m.id.as_deref() == Some(id))
    }

    pub fn get_by_correlation_id(&self, correlation_id: &str) -> Option<&Message> {
        self.position_by_correlation_id(correlation_id)
            .map(|position| &self.entries[position])
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// 消息在日志中的位置，用于比较两条消息的先后
    pub fn position_of_id(&self, id: &str) -> Option<usize> {
        if !self.ids.contains(id) {
            return None;
        }
        self.entries.iter().position(|m| m.id.as_deref() == Some(id))
    }

    /// 最新一条已确认消息的 id
    pub fn newest_confirmed_id(&self) -> Option<&str> {
        self.entries.iter().rev().find_map(|m| m.id.as_deref())
    }

    /// 有序快照
    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn append_outcome(&mut self, message: Message) -> IngestOutcome {
        if self.append(message) {
            IngestOutcome::Appended
        } else {
            IngestOutcome::Unchanged
        }
    }

    fn contains_identity(&self, message: &Message) -> bool {
        message.id.as_ref().map_or(false, |id| self.ids.contains(id))
            || message
                .correlation_id
                .as_ref()
                .map_or(false, |cid| self.correlation_ids.contains(cid))
    }

    fn position_by_correlation_id(&self, correlation_id: &str) -> Option<usize> {
        if !self.correlation_ids.contains(correlation_id) {
            return None;
        }
        self.entries
            .iter()
            .position(|m| m.correlation_id.as_deref() == Some(correlation_id))
    }

    /// 新消息通常是最新的，先看尾部；乱序回填走二分（上界，保证同时间按插入顺序）
    fn insertion_index(&self, created_at: DateTime<Utc>) -> usize {
        match self.entries.last() {
            None => 0,
            Some(last) if last.created_at <= created_at => self.entries.len(),
            Some(_) => self.entries.partition_point(|m| m.created_at <= created_at),
        }
    }

    fn insert_sorted(&mut self, message: Message) {
        self.index(&message);
        let index = self.insertion_index(message.created_at);
        self.entries.insert(index, message);
    }

    fn is_ordered_at(&self, position: usize) -> bool {
        let current = self.entries[position].created_at;
        let after_prev = position == 0 || self.entries[position - 1].created_at <= current;
        let before_next = self
            .entries
            .get(position + 1)
            .map_or(true, |next| current <= next.created_at);
        after_prev && before_next
    }

    fn index(&mut self, message: &Message) {
        if let Some(id) = &message.id {
            self.ids.insert(id.clone());
        }
        if let Some(cid) = &message.correlation_id {
            self.correlation_ids.insert(cid.clone());
        }
    }

    fn unindex(&mut self, message: &Message) {
        if let Some(id) = &message.id {
            self.ids.remove(id);
        }
        if let Some(cid) = &message.correlation_id {
            self.correlation_ids.remove(cid);
        }
    }
}
