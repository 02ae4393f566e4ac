//! 推送通道模块
//!
//! - `frame`：推送帧 JSON 解析与归一化
//! - `sse`：text/event-stream 解码与基于 reqwest 的事件源
//! - `EventStreamManager`：连接状态机与自动重连
//!
//! 状态机：未连接 → 连接中 → 已连接 →（出错 / 结束）→ 未连接 →（等待）→ 连接中 …
//! 重连不设上限，每次失败只安排一次重连；连接成功后重连计数归零。

pub mod frame;
pub mod sse;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection_state::{ConnectionState, ConnectionStateManager, ConnectionStatus};
use crate::error::Result;
use crate::reconnect::ReconnectPolicy;

pub use frame::{parse_frame, RawFrame, StreamEvent, StreamFrame};
pub use sse::{SseDecoder, SseEventSource};

/// 原始帧流
pub type FrameStream = BoxStream<'static, Result<RawFrame>>;

/// 推送通道传输层
#[async_trait]
pub trait EventSource: Send + Sync {
    /// 建立连接，返回原始帧流；流结束或产出错误即视为断线
    async fn connect(&self, conversation_id: &str) -> Result<FrameStream>;
}

/// 推送事件的消费者（由同步引擎实现）
#[async_trait]
pub trait StreamEventHandler: Send + Sync {
    async fn handle(&self, frame: StreamFrame);
}

struct StreamWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// 推送通道管理器
pub struct EventStreamManager {
    conversation_id: String,
    source: Arc<dyn EventSource>,
    policy: ReconnectPolicy,
    state: ConnectionStateManager,
    worker: Mutex<Option<StreamWorker>>,
}

impl EventStreamManager {
    pub fn new(
        conversation_id: impl Into<String>,
        source: Arc<dyn EventSource>,
        policy: ReconnectPolicy,
        state: ConnectionStateManager,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            source,
            policy,
            state,
            worker: Mutex::new(None),
        }
    }

    /// 启动推送通道，已在运行时返回 `false`
    pub fn connect(&self, handler: Arc<dyn StreamEventHandler>) -> bool {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            debug!("推送通道已在运行，忽略重复 connect");
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_stream_loop(
            self.conversation_id.clone(),
            Arc::clone(&self.source),
            self.policy.clone(),
            self.state.clone(),
            handler,
            cancel.clone(),
        ));
        *worker = Some(StreamWorker { cancel, handle });
        true
    }

    /// 关闭推送通道并取消待执行的重连
    pub fn close(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            worker.handle.abort();
            info!("🔌 推送通道已关闭: {}", self.conversation_id);
        }
        self.state.mark_disconnected(None);
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.get_state()
    }
}

impl Drop for EventStreamManager {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.cancel.cancel();
            worker.handle.abort();
        }
    }
}

async fn run_stream_loop(
    conversation_id: String,
    source: Arc<dyn EventSource>,
    policy: ReconnectPolicy,
    state: ConnectionStateManager,
    handler: Arc<dyn StreamEventHandler>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut is_reconnect = false;

    'outer: loop {
        state.mark_connecting(is_reconnect);
        is_reconnect = true;

        let connected = tokio::select! {
            _ = cancel.cancelled() => break 'outer,
            result = source.connect(&conversation_id) => result,
        };

        let failure = match connected {
            Ok(mut frames) => {
                state.mark_connected();
                attempt = 0;
                info!("✅ 推送通道已连接: {}", conversation_id);

                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break 'outer,
                        next = frames.next() => next,
                    };
                    match next {
                        Some(Ok(raw)) => {
                            state.increment_received();
                            dispatch_raw(&conversation_id, &state, handler.as_ref(), raw).await;
                        }
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break None,
                    }
                }
            }
            Err(e) => Some(e.to_string()),
        };

        match &failure {
            Some(error) => warn!("⚠️ 推送通道异常: {}", error),
            None => info!("推送通道被服务端关闭"),
        }
        state.mark_disconnected(failure);

        let delay = policy.delay_for(attempt);
        attempt = attempt.saturating_add(1);
        info!("🔄 {}ms 后重连推送通道（第 {} 次）", delay.as_millis(), attempt);

        tokio::select! {
            _ = cancel.cancelled() => break 'outer,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("推送通道任务退出: {}", conversation_id);
}

async fn dispatch_raw(
    conversation_id: &str,
    state: &ConnectionStateManager,
    handler: &dyn StreamEventHandler,
    raw: RawFrame,
) {
    let frame = match parse_frame(&raw.data, raw.event.as_deref()) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("⚠️ 丢弃无法解析的推送帧: {}", e);
            state.increment_dropped();
            return;
        }
    };

    if let Some(target) = frame.conversation_id.as_deref() {
        if target != conversation_id {
            debug!("丢弃其他会话的推送帧: {} ({})", target, frame.event.name());
            return;
        }
    }

    match &frame.event {
        StreamEvent::Heartbeat => {
            debug!("💓 收到心跳");
            return;
        }
        StreamEvent::Connected {
            conversation_id: Some(confirmed),
            ..
        } => state.set_conversation_id(confirmed.clone()),
        _ => {}
    }

    handler.handle(frame).await;
}


#[cfg(test)]
mod tests {
    use super::test_helpers::{ChannelEventSource, ForwardingHandler};
    use super::*;
    use crate::events::EventManager;
    use std::time::Duration;

    fn manager(source: Arc<ChannelEventSource>) -> EventStreamManager {
        EventStreamManager::new(
            "wf-1",
            source,
            ReconnectPolicy::default(),
            ConnectionStateManager::new(EventManager::shared(64)),
        )
    }

    #[tokio::test]
    async fn test_frames_are_routed_and_filtered() {
        let source = ChannelEventSource::new();
        let tx = source.push_connection();
        let manager = manager(source.clone());
        let (handler, mut frames) = ForwardingHandler::new();

        assert!(manager.connect(handler.clone()));
        assert!(!manager.connect(handler));

        tx.send(Ok(RawFrame::new(r#"{"type":"connected","conversationId":"wf-1"}"#))).unwrap();
        tx.send(Ok(RawFrame::new("{broken"))).unwrap();
        tx.send(Ok(RawFrame::new(r#"{"type":"ping"}"#))).unwrap();
        tx.send(Ok(RawFrame::new(
            r#"{"type":"typing.started","conversationId":"wf-2","payload":{"userId":"x"}}"#,
        )))
        .unwrap();
        tx.send(Ok(RawFrame::new(
            r#"{"type":"typing.stopped","payload":{"userId":"b1"}}"#,
        )))
        .unwrap();

        let first = frames.recv().await.unwrap();
        assert_eq!(first.event.name(), "connected");
        let second = frames.recv().await.unwrap();
        assert_eq!(
            second.event,
            StreamEvent::TypingStopped {
                user_id: "b1".to_string()
            }
        );

        let state = manager.connection_state();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.conversation_id.as_deref(), Some("wf-1"));
        assert_eq!(state.frames_received, 5);
        assert_eq!(state.frames_dropped, 1);

        manager.close();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(!manager.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_fixed_delay() {
        let source = ChannelEventSource::new();
        let first = source.push_connection();
        source.push_failure();
        let second = source.push_connection();
        let manager = manager(source.clone());
        let (handler, mut frames) = ForwardingHandler::new();

        let started = tokio::time::Instant::now();
        manager.connect(handler);

        first.send(Ok(RawFrame::new(r#"{"type":"connected"}"#))).unwrap();
        frames.recv().await.unwrap();
        drop(first);

        second.send(Ok(RawFrame::new(r#"{"type":"connected"}"#))).unwrap();
        frames.recv().await.unwrap();

        // 断开 → 5s → 失败 → 5s → 成功
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(source.connects(), 3);

        let state = manager.connection_state();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.reconnect_count, 2);

        manager.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_schedules_single_reconnect() {
        let source = ChannelEventSource::new();
        let first = source.push_connection();
        let second = source.push_connection();
        let manager = manager(source.clone());
        let (handler, mut frames) = ForwardingHandler::new();
        manager.connect(handler);

        first
            .send(Err(crate::error::ConvSyncError::Transport("reset".to_string())))
            .unwrap();

        second.send(Ok(RawFrame::new(r#"{"type":"connected"}"#))).unwrap();
        frames.recv().await.unwrap();
        assert_eq!(source.connects(), 2);

        manager.close();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.connects(), 2);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }
}
