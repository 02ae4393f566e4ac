//! 生命周期管理
//!
//! 宿主页面前后台切换时统一通知各同步引擎：后台时断开推送通道，回到前台时重同步并重连。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{ConvSyncError, Result};

/// 生命周期回调 Hook
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// 切换到后台时调用
    async fn on_background(&self) -> Result<()>;

    /// 切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Background,
    Foreground,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Background => "后台",
            Phase::Foreground => "前台",
        }
    }
}

/// 生命周期管理器
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 通知所有 Hook：切换到后台
    ///
    /// 按注册顺序执行，某个 Hook 失败时记录错误并继续执行其余 Hook，最后返回第一个错误。
    pub async fn notify_background(&self) -> Result<()> {
        self.notify(Phase::Background).await
    }

    /// 通知所有 Hook：切换到前台
    pub async fn notify_foreground(&self) -> Result<()> {
        self.notify(Phase::Foreground).await
    }

    async fn notify(&self, phase: Phase) -> Result<()> {
        info!("🔄 通知所有会话：切换到{}", phase.label());

        let mut first_error: Option<ConvSyncError> = None;
        let mut failures = 0usize;

        for (index, hook) in self.hooks.iter().enumerate() {
            let result = match phase {
                Phase::Background => hook.on_background().await,
                Phase::Foreground => hook.on_foreground().await,
            };
            if let Err(e) = result {
                warn!("⚠️ Hook #{} {}切换失败: {}", index, phase.label(), e);
                failures += 1;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => {
                warn!("⚠️ {} 个会话{}切换失败，其余会话已执行", failures, phase.label());
                Err(e)
            }
            None => {
                info!("✅ 所有会话{}切换完成", phase.label());
                Ok(())
            }
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingHook {
        name: &'static str,
        fail: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl LifecycleHook for RecordingHook {
        async fn on_background(&self) -> Result<()> {
            self.calls.lock().push(format!("{}:bg", self.name));
            if self.fail {
                return Err(ConvSyncError::Transport(format!("{} failed", self.name)));
            }
            Ok(())
        }

        async fn on_foreground(&self) -> Result<()> {
            self.calls.lock().push(format!("{}:fg", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_hooks() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut manager = LifecycleManager::new();
        for (name, fail) in [("a", true), ("b", false), ("c", true)] {
            manager.register_hook(Arc::new(RecordingHook {
                name,
                fail,
                calls: calls.clone(),
            }));
        }
        assert_eq!(manager.hook_count(), 3);

        match manager.notify_background().await {
            Err(ConvSyncError::Transport(message)) => assert_eq!(message, "a failed"),
            other => panic!("unexpected result: {:?}", other),
        }
        tokio_test::assert_ok!(manager.notify_foreground().await);

        assert_eq!(
            *calls.lock(),
            vec!["a:bg", "b:bg", "c:bg", "a:fg", "b:fg", "c:fg"]
        );
    }
}
