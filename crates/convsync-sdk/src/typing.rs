//! 输入状态管理模块 - 处理对端"正在输入"
//!
//! 功能包括：
//! - 接收 typing.started / typing.stopped 推送
//! - 每个用户一个自动过期定时器（默认 3 秒）
//! - 过滤当前用户自己的输入状态
//! - 状态变化时广播 `TypingChanged`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::{event_builders, EventManager};
use crate::utils::TimerRegistry;

/// 输入状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingState {
    pub user_id: String,
    pub display_name: String,
    /// 本轮输入的开始时间，续期时保持不变
    pub started_at: DateTime<Utc>,
}

/// 单个用户的输入状态及其所属的 started 轮次
struct Presence {
    state: TypingState,
    /// 每次 start 递增，过期回调只移除同一轮次的状态
    round: u64,
}

#[derive(Default)]
struct PresenceMap {
    users: HashMap<String, Presence>,
    next_round: u64,
}

impl PresenceMap {
    fn sorted_users(&self) -> Vec<TypingState> {
        let mut users: Vec<TypingState> = self.users.values().map(|p| p.state.clone()).collect();
        users.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        users
    }
}

type SharedPresence = Arc<Mutex<PresenceMap>>;

/// 输入状态跟踪器
pub struct TypingPresenceTracker {
    conversation_id: String,
    self_user_id: String,
    expiry: Duration,
    presence: SharedPresence,
    timers: TimerRegistry<String>,
    events: Arc<EventManager>,
}

impl TypingPresenceTracker {
    pub fn new(
        conversation_id: impl Into<String>,
        self_user_id: impl Into<String>,
        expiry: Duration,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            self_user_id: self_user_id.into(),
            expiry,
            presence: Arc::new(Mutex::new(PresenceMap::default())),
            timers: TimerRegistry::new(),
            events,
        }
    }

    /// 用户开始输入（或续期）
    ///
    /// 重复的 started 会重置过期定时器。当前用户自己的输入状态直接忽略。
    pub fn start(&self, user_id: &str, display_name: &str) {
        if user_id == self.self_user_id {
            return;
        }

        let (changed, round) = {
            let mut presence = self.presence.lock();
            presence.next_round += 1;
            let round = presence.next_round;
            let changed = match presence.users.get_mut(user_id) {
                Some(entry) => {
                    entry.round = round;
                    if entry.state.display_name == display_name {
                        false
                    } else {
                        entry.state.display_name = display_name.to_string();
                        true
                    }
                }
                None => {
                    presence.users.insert(
                        user_id.to_string(),
                        Presence {
                            state: TypingState {
                                user_id: user_id.to_string(),
                                display_name: display_name.to_string(),
                                started_at: Utc::now(),
                            },
                            round,
                        },
                    );
                    true
                }
            };
            (changed, round)
        };

        let presence = Arc::clone(&self.presence);
        let events = Arc::clone(&self.events);
        let conversation_id = self.conversation_id.clone();
        let expired_user = user_id.to_string();
        self.timers.set(user_id.to_string(), self.expiry, move || {
            expire(&presence, &events, &conversation_id, &expired_user, round);
        });

        if changed {
            debug!("✍️ 用户开始输入: user={}", user_id);
            self.notify();
        }
    }

    /// 用户停止输入，返回该用户之前是否处于输入状态
    pub fn stop(&self, user_id: &str) -> bool {
        self.timers.cancel(&user_id.to_string());
        let removed = self.presence.lock().users.remove(user_id).is_some();
        if removed {
            debug!("✋ 用户停止输入: user={}", user_id);
            self.notify();
        }
        removed
    }

    /// 当前正在输入的用户（不含自己），按开始时间排序
    pub fn active_users(&self) -> Vec<TypingState> {
        self.presence.lock().sorted_users()
    }

    pub fn is_typing(&self, user_id: &str) -> bool {
        self.presence.lock().users.contains_key(user_id)
    }

    /// 清空全部输入状态并取消所有定时器
    pub fn clear(&self) {
        self.timers.clear_all();
        let had_states = {
            let mut presence = self.presence.lock();
            let had_states = !presence.users.is_empty();
            presence.users.clear();
            had_states
        };
        if had_states {
            self.notify();
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    fn notify(&self) {
        self.events.emit(event_builders::typing_changed(
            &self.conversation_id,
            self.active_users(),
        ));
    }
}

/// 过期回调：只移除仍属于 `round` 这一轮的输入状态
///
/// 定时器确认自己仍有效之后、回调执行之前，同一用户可能已经再次 start。
fn expire(
    presence: &SharedPresence,
    events: &EventManager,
    conversation_id: &str,
    user_id: &str,
    round: u64,
) -> bool {
    let users = {
        let mut presence = presence.lock();
        if presence.users.get(user_id).map(|entry| entry.round) != Some(round) {
            return false;
        }
        presence.users.remove(user_id);
        presence.sorted_users()
    };
    debug!("⌛ 输入状态过期: user={}", user_id);
    events.emit(event_builders::typing_changed(conversation_id, users));
    true
}
