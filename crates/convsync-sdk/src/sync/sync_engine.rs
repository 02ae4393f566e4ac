//! 会话同步引擎
//!
//! 把三路数据源合并到同一份消息日志：
//! - 首屏拉取（REST 快照）
//! - 本地乐观发送
//! - 服务端推送事件
//!
//! 同时负责已读位置、输入状态、断线重同步，以及"自动滚动 / 新消息提示"的判定。
//! `start()` / `stop()` 是唯一的资源获取与释放入口。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connection_state::{ConnectionState, ConnectionStateManager, ConnectionStatus};
use crate::error::Result;
use crate::events::{event_builders, EventManager, SyncEvent};
use crate::http_client::{ConversationApi, HttpConversationApi};
use crate::lifecycle::LifecycleHook;
use crate::read_receipt::ReadReceiptTracker;
use crate::storage::entities::{Attachment, Conversation, Message, SenderKind};
use crate::storage::message_store::{MergeOutcome, MessageStore, SharedMessageStore};
use crate::stream::{
    EventSource, EventStreamManager, SseEventSource, StreamEvent, StreamEventHandler, StreamFrame,
};
use crate::sync::optimistic_send::OptimisticSendController;
use crate::typing::{TypingPresenceTracker, TypingState};
use crate::utils::BackgroundTasks;

/// 视口状态
#[derive(Debug, Clone, Copy)]
struct Viewport {
    at_bottom: bool,
    /// 视口不在底部期间到达的新消息数
    unseen: usize,
}

struct EngineInner {
    config: SyncConfig,
    api: Arc<dyn ConversationApi>,
    store: SharedMessageStore,
    events: Arc<EventManager>,
    stream: EventStreamManager,
    sender: OptimisticSendController,
    receipts: Arc<ReadReceiptTracker>,
    typing: TypingPresenceTracker,
    viewport: Mutex<Viewport>,
    tasks: BackgroundTasks,
    started: AtomicBool,
}

/// 会话同步引擎
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// 使用 HTTP REST + SSE 推送通道创建引擎
    pub fn new(config: SyncConfig) -> Result<Self> {
        let api: Arc<dyn ConversationApi> = Arc::new(HttpConversationApi::new(&config)?);
        let source: Arc<dyn EventSource> = Arc::new(SseEventSource::new(&config)?);
        Ok(Self::with_transport(config, api, source))
    }

    /// 使用自定义传输层创建引擎
    pub fn with_transport(
        config: SyncConfig,
        api: Arc<dyn ConversationApi>,
        source: Arc<dyn EventSource>,
    ) -> Self {
        let conversation_id = config.conversation_id.clone();
        let events = EventManager::shared(config.event_buffer_size);
        let store = MessageStore::shared();

        let connection = ConnectionStateManager::new(Arc::clone(&events));
        let stream = EventStreamManager::new(
            conversation_id.clone(),
            source,
            config.reconnect.clone(),
            connection,
        );
        let sender = OptimisticSendController::new(
            conversation_id.clone(),
            config.current_user.clone(),
            Arc::clone(&store),
            Arc::clone(&api),
            Arc::clone(&events),
        );
        let receipts = Arc::new(
            ReadReceiptTracker::new(
                conversation_id.clone(),
                config.current_user.id.clone(),
                Arc::clone(&api),
                Arc::clone(&events),
            )
            .with_message_order(Arc::clone(&store)),
        );
        let typing = TypingPresenceTracker::new(
            conversation_id,
            config.current_user.id.clone(),
            config.typing_expiry(),
            Arc::clone(&events),
        );

        let inner = Arc::new(EngineInner {
            config,
            api,
            store,
            events,
            stream,
            sender,
            receipts,
            typing,
            viewport: Mutex::new(Viewport {
                at_bottom: true,
                unseen: 0,
            }),
            tasks: BackgroundTasks::new(),
            started: AtomicBool::new(false),
        });

        let weak: Weak<EngineInner> = Arc::downgrade(&inner);
        inner.sender.set_observer(Arc::new(move |_message: &Message| {
            if let Some(engine) = weak.upgrade() {
                engine.on_new_messages(1);
            }
        }));

        info!("🚀 同步引擎已创建: conversation={}", inner.config.conversation_id);
        Self { inner }
    }

    /// 首屏拉取：服务端按从新到旧返回，入库前翻转为从旧到新
    pub async fn fetch_initial(&self) -> Result<usize> {
        let outcome = self.inner.load_snapshot().await?;
        if self.inner.viewport.lock().at_bottom {
            self.inner.mark_newest_read();
        }
        Ok(outcome.inserted)
    }

    /// 启动：首屏拉取成功后打开推送通道
    ///
    /// 重复或并发调用只有第一次生效。拉取失败时直接返回错误，不自动重试，之后可再次调用。
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("同步引擎已启动");
            return Ok(());
        }

        let loaded = match self.fetch_initial().await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        info!("📥 首屏加载 {} 条消息", loaded);

        if !self.inner.started.load(Ordering::SeqCst) {
            debug!("首屏加载期间引擎已停止，不再打开推送通道");
            return Ok(());
        }
        self.inner.connect_stream();
        Ok(())
    }

    /// 停止：关闭推送通道、清空输入状态定时器、中止在途任务
    pub fn stop(&self) {
        self.inner.shutdown();
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// 发送消息，立即返回 correlation_id
    pub fn send(&self, body: &str, attachments: Vec<Attachment>) -> Result<String> {
        self.inner.sender.send(body, attachments)
    }

    pub fn retry(&self, correlation_id: &str) -> Result<()> {
        self.inner.sender.retry(correlation_id)
    }

    /// 在途发送请求数
    pub fn pending_sends(&self) -> usize {
        self.inner.sender.in_flight()
    }

    /// 按时间排序的消息快照（含未确认占位与墓碑）
    pub fn snapshot(&self) -> Vec<Message> {
        self.inner.store.lock().snapshot()
    }

    /// UI 报告视口是否停在底部
    ///
    /// 从上方滚回底部时，把最新消息标记为已读并清零新消息计数。
    pub fn set_viewport_at_bottom(&self, at_bottom: bool) {
        let (became_bottom, had_unseen) = {
            let mut viewport = self.inner.viewport.lock();
            let was_at_bottom = viewport.at_bottom;
            let had_unseen = viewport.unseen > 0;
            viewport.at_bottom = at_bottom;
            if at_bottom {
                viewport.unseen = 0;
            }
            (at_bottom && !was_at_bottom, had_unseen)
        };

        if became_bottom {
            if had_unseen {
                self.inner.events.emit(event_builders::new_messages_available(
                    &self.inner.config.conversation_id,
                    0,
                ));
            }
            self.inner.mark_newest_read();
        }
    }

    pub fn is_at_bottom(&self) -> bool {
        self.inner.viewport.lock().at_bottom
    }

    pub fn unseen_count(&self) -> usize {
        self.inner.viewport.lock().unseen
    }

    pub fn typing_users(&self) -> Vec<TypingState> {
        self.inner.typing.active_users()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.stream.status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.stream.connection_state()
    }

    pub fn conversation(&self) -> Conversation {
        self.inner.receipts.conversation()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> Arc<EventManager> {
        Arc::clone(&self.inner.events)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl EngineInner {
    fn connect_stream(self: &Arc<Self>) {
        let handler = Arc::new(EngineStreamHandler {
            engine: Arc::downgrade(self),
        });
        self.stream.connect(handler);
    }

    fn shutdown(&self) {
        let was_started = self.started.swap(false, Ordering::SeqCst);
        self.stream.close();
        self.typing.clear();
        self.sender.abort_all();
        self.tasks.abort_all();
        if was_started {
            info!("🛑 同步引擎已停止: conversation={}", self.config.conversation_id);
        }
    }

    /// 拉取快照并经去重入口合并
    async fn load_snapshot(&self) -> Result<MergeOutcome> {
        let conversation_id = &self.config.conversation_id;
        let response = self.api.fetch_messages(conversation_id).await?;

        let mut messages = response.messages;
        messages.reverse();

        let outcome = self.store.lock().merge_snapshot(messages);
        self.receipts
            .apply_server_hint(response.last_read_message_id, response.unread_count);

        if outcome.changed() {
            self.events
                .emit(event_builders::timeline_changed(conversation_id));
        }
        debug!(
            "📦 快照合并完成: inserted={}, updated={}",
            outcome.inserted, outcome.updated
        );
        Ok(outcome)
    }

    /// 断线重连后的整体重同步
    async fn resync(&self) -> Result<()> {
        let outcome = self.load_snapshot().await?;
        info!(
            "🔄 重同步完成: inserted={}, updated={}",
            outcome.inserted, outcome.updated
        );
        self.events.emit(event_builders::resync_completed(
            &self.config.conversation_id,
            outcome.inserted,
            outcome.updated,
        ));
        if outcome.inserted > 0 {
            self.on_new_messages(outcome.inserted);
        }
        Ok(())
    }

    /// 新消息已确认：视口在底部则滚动并标记已读，否则累计新消息提示
    fn on_new_messages(&self, count: usize) {
        let unseen = {
            let mut viewport = self.viewport.lock();
            if viewport.at_bottom {
                None
            } else {
                viewport.unseen += count;
                Some(viewport.unseen)
            }
        };

        match unseen {
            None => {
                self.events
                    .emit(event_builders::scroll_to_bottom(&self.config.conversation_id));
                self.mark_newest_read();
            }
            Some(unseen) => {
                self.events.emit(event_builders::new_messages_available(
                    &self.config.conversation_id,
                    unseen,
                ));
            }
        }
    }

    fn mark_newest_read(&self) {
        let newest = self.store.lock().newest_confirmed_id().map(str::to_string);
        let Some(message_id) = newest else {
            return;
        };
        let receipts = Arc::clone(&self.receipts);
        self.tasks.spawn(async move {
            receipts.mark_read(&message_id).await;
        });
    }

    fn ingest_pushed(&self, message: Message) {
        if message.sender_kind == SenderKind::RemoteParty {
            if let Some(sender_id) = message.sender_id.as_deref() {
                self.typing.stop(sender_id);
            }
        }

        let confirmed = message.is_confirmed();
        let outcome = match message.correlation_id.as_deref() {
            Some(cid) if self.sender.has_pending(cid) => self.sender.reconcile(message),
            _ => {
                let outcome = self.store.lock().ingest(message);
                if outcome.changed() {
                    self.events
                        .emit(event_builders::timeline_changed(&self.config.conversation_id));
                }
                outcome
            }
        };

        if confirmed && outcome.is_first_arrival() {
            self.on_new_messages(1);
        }
    }

    async fn handle_frame(&self, frame: StreamFrame) {
        let wants_resync = frame.event.wants_resync();
        debug!("📨 推送事件: {}", frame.event.name());

        match frame.event {
            StreamEvent::Connected {
                last_read_message_id,
                unread_count,
                ..
            } => {
                self.receipts
                    .apply_server_hint(last_read_message_id, unread_count);
                if wants_resync {
                    if let Err(e) = self.resync().await {
                        warn!("⚠️ 重同步失败: {}", e);
                    }
                }
            }
            StreamEvent::MessageCreated(message) => self.ingest_pushed(message),
            StreamEvent::MessageUpdated { id, patch } => {
                if self.store.lock().apply_update(&id, patch) {
                    self.events
                        .emit(event_builders::timeline_changed(&self.config.conversation_id));
                }
            }
            StreamEvent::MessageDeleted { id, deleted_at } => {
                if self.store.lock().apply_tombstone(&id, deleted_at) {
                    self.events
                        .emit(event_builders::timeline_changed(&self.config.conversation_id));
                }
            }
            StreamEvent::TypingStarted {
                user_id,
                display_name,
            } => self.typing.start(&user_id, &display_name),
            StreamEvent::TypingStopped { user_id } => {
                self.typing.stop(&user_id);
            }
            StreamEvent::ReadUpdated(receipt) => {
                self.receipts.apply_remote(receipt);
            }
            StreamEvent::Heartbeat => {}
        }
    }
}

/// 推送事件路由，持有弱引用避免与引擎形成循环引用
struct EngineStreamHandler {
    engine: Weak<EngineInner>,
}

#[async_trait]
impl StreamEventHandler for EngineStreamHandler {
    async fn handle(&self, frame: StreamFrame) {
        if let Some(engine) = self.engine.upgrade() {
            engine.handle_frame(frame).await;
        }
    }
}

#[async_trait]
impl LifecycleHook for SyncEngine {
    async fn on_background(&self) -> Result<()> {
        if !self.is_started() {
            return Ok(());
        }
        info!("🌙 会话进入后台，断开推送通道: {}", self.inner.config.conversation_id);
        self.inner.stream.close();
        self.inner.typing.clear();
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        if !self.is_started() {
            return Ok(());
        }
        info!("☀️ 会话回到前台，重同步并重连: {}", self.inner.config.conversation_id);
        let resynced = self.inner.resync().await;
        self.inner.connect_stream();
        resynced
    }
}
