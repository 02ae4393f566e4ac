//! 按 key 管理的一次性定时器
//!
//! 每个 key 同时只有一个有效定时器：重复 `set` 会替换旧定时器，
//! `cancel` 取消单个，`clear_all` 一次性取消全部（会话卸载时调用）。

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

struct RegistryState<K> {
    timers: HashMap<K, TimerEntry>,
    next_generation: u64,
}

pub struct TimerRegistry<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    state: Arc<Mutex<RegistryState<K>>>,
}

impl<K> TimerRegistry<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                timers: HashMap::new(),
                next_generation: 0,
            })),
        }
    }

    /// 为 key 设置定时器，到期后执行 `on_fire`
    ///
    /// 旧定时器会被取消。到期回调只在该定时器仍是 key 的当前定时器时执行，
    /// 已被替换或取消的定时器即使已经醒来也不会触发。
    pub fn set<F>(&self, key: K, delay: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;

        let registry = Arc::clone(&self.state);
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_current = {
                let mut state = registry.lock();
                match state.timers.get(&timer_key) {
                    Some(entry) if entry.generation == generation => {
                        state.timers.remove(&timer_key);
                        true
                    }
                    _ => false,
                }
            };
            if still_current {
                on_fire();
            }
        });

        if let Some(previous) = state.timers.insert(key, TimerEntry { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// 取消 key 的定时器，返回是否存在待触发的定时器
    pub fn cancel(&self, key: &K) -> bool {
        match self.state.lock().timers.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn clear_all(&self) {
        let mut state = self.state.lock();
        for (_, entry) in state.timers.drain() {
            entry.handle.abort();
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().timers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for TimerRegistry<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for TimerRegistry<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.clear_all();
    }
}
