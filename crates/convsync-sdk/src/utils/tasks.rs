//! 后台任务登记
//!
//! 引擎派生的发送 / 已读回执任务都登记在这里，卸载时统一中止。

use std::future::Future;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct BackgroundTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// 仍在运行的任务数
    pub fn active(&self) -> usize {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    pub fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_abort_all_stops_pending_tasks() {
        let tasks = BackgroundTasks::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<u32>();

        let sender = tx.clone();
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let _ = sender.send(1);
        });
        assert_eq!(tasks.active(), 1);

        tasks.abort_all();
        drop(tx);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(rx.recv().await.is_none());
        assert_eq!(tasks.active(), 0);
    }
}
