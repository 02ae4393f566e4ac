//! 乐观发送
//!
//! 发送流程：
//! 1. 生成 correlation_id（不需要网络往返）
//! 2. 立即插入状态为 sending 的占位消息
//! 3. 异步调用创建消息接口
//! 4. 成功：按 correlation_id 用服务端消息替换占位
//! 5. 失败：占位原地标记为 failed，可通过 `retry` 用同一 correlation_id 重发
//!
//! HTTP 响应与推送事件谁先到谁生效，后到的一方为空操作。

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConvSyncError, Result};
use crate::events::{event_builders, EventManager};
use crate::http_client::{ConversationApi, CreateMessageRequest};
use crate::storage::entities::{Attachment, CurrentUser, DeliveryStatus, Message, SenderKind};
use crate::storage::message_store::{IngestOutcome, SharedMessageStore};
use crate::utils::BackgroundTasks;

/// 发送确认回调（由引擎用于自动滚动 / 已读上报）
pub type ConfirmationObserver = Arc<dyn Fn(&Message) + Send + Sync>;

/// 生成 correlation_id：`<unix 毫秒>-<12 位随机十六进制>`
pub fn generate_correlation_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &random[..12])
}

struct SendInner {
    conversation_id: String,
    current_user: CurrentUser,
    store: SharedMessageStore,
    api: Arc<dyn ConversationApi>,
    events: Arc<EventManager>,
    tasks: BackgroundTasks,
    observer: RwLock<Option<ConfirmationObserver>>,
}

/// 乐观发送控制器
#[derive(Clone)]
pub struct OptimisticSendController {
    inner: Arc<SendInner>,
}

impl OptimisticSendController {
    pub fn new(
        conversation_id: impl Into<String>,
        current_user: CurrentUser,
        store: SharedMessageStore,
        api: Arc<dyn ConversationApi>,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            inner: Arc::new(SendInner {
                conversation_id: conversation_id.into(),
                current_user,
                store,
                api,
                events,
                tasks: BackgroundTasks::new(),
                observer: RwLock::new(None),
            }),
        }
    }

    pub fn set_observer(&self, observer: ConfirmationObserver) {
        *self.inner.observer.write() = Some(observer);
    }

    /// 发送消息，立即返回 correlation_id；网络请求在后台执行
    pub fn send(&self, body: &str, attachments: Vec<Attachment>) -> Result<String> {
        let correlation_id = self.begin_send(body, attachments)?;
        self.spawn_dispatch(correlation_id.clone());
        Ok(correlation_id)
    }

    /// 重发失败的消息（沿用原 correlation_id）
    pub fn retry(&self, correlation_id: &str) -> Result<()> {
        {
            let mut store = self.inner.store.lock();
            let status = match store.get_by_correlation_id(correlation_id) {
                None => {
                    return Err(ConvSyncError::NotFound(format!(
                        "message with correlation id {}",
                        correlation_id
                    )))
                }
                Some(message) if message.is_confirmed() => None,
                Some(message) => message.delivery_status,
            };
            if status != Some(DeliveryStatus::Failed) {
                return Err(ConvSyncError::InvalidOperation(format!(
                    "message {} is not in failed state",
                    correlation_id
                )));
            }
            store.mark_delivery_status(correlation_id, DeliveryStatus::Sending);
        }

        info!("🔁 重发消息: cid={}", correlation_id);
        self.emit_status(correlation_id, None, DeliveryStatus::Sending, None);
        self.inner
            .events
            .emit(event_builders::timeline_changed(&self.inner.conversation_id));
        self.spawn_dispatch(correlation_id.to_string());
        Ok(())
    }

    /// 生成 correlation_id 并插入 sending 状态的占位消息
    pub fn begin_send(&self, body: &str, attachments: Vec<Attachment>) -> Result<String> {
        if body.trim().is_empty() && attachments.is_empty() {
            return Err(ConvSyncError::InvalidArgument(
                "message body and attachments are both empty".to_string(),
            ));
        }

        let correlation_id = generate_correlation_id();
        let placeholder = Message {
            id: None,
            correlation_id: Some(correlation_id.clone()),
            conversation_id: self.inner.conversation_id.clone(),
            sender_kind: SenderKind::LocalParty,
            sender_id: Some(self.inner.current_user.id.clone()),
            body: body.to_string(),
            attachments,
            created_at: Utc::now(),
            edited_at: None,
            deleted_at: None,
            delivery_status: Some(DeliveryStatus::Sending),
        };

        self.inner.store.lock().append(placeholder);
        debug!("📝 插入占位消息: cid={}", correlation_id);

        self.emit_status(&correlation_id, None, DeliveryStatus::Sending, None);
        self.inner
            .events
            .emit(event_builders::timeline_changed(&self.inner.conversation_id));
        Ok(correlation_id)
    }

    /// 调用创建消息接口并对账
    ///
    /// 返回服务端确认的消息；占位在请求前已被确认时返回 `Ok(None)`。
    pub async fn dispatch(&self, correlation_id: &str) -> Result<Option<Message>> {
        let request = {
            let store = self.inner.store.lock();
            let message = store.get_by_correlation_id(correlation_id).ok_or_else(|| {
                ConvSyncError::NotFound(format!("message with correlation id {}", correlation_id))
            })?;
            if message.is_confirmed() {
                return Ok(None);
            }
            CreateMessageRequest {
                body: message.body.clone(),
                correlation_id: correlation_id.to_string(),
                attachment_ids: message.attachments.iter().map(|a| a.file_id.clone()).collect(),
            }
        };

        match self
            .inner
            .api
            .create_message(&self.inner.conversation_id, &request)
            .await
        {
            Ok(mut message) => {
                message.correlation_id = Some(correlation_id.to_string());
                let confirmed = message.clone();
                if self.reconcile(message).is_first_arrival() {
                    let observer = self.inner.observer.read().clone();
                    if let Some(observer) = observer {
                        observer(&confirmed);
                    }
                }
                Ok(Some(confirmed))
            }
            Err(e) => {
                let marked = self
                    .inner
                    .store
                    .lock()
                    .mark_delivery_status(correlation_id, DeliveryStatus::Failed);
                if marked {
                    warn!("❌ 消息发送失败: cid={}, error={}", correlation_id, e);
                    self.emit_status(correlation_id, None, DeliveryStatus::Failed, Some(e.to_string()));
                    self.inner
                        .events
                        .emit(event_builders::timeline_changed(&self.inner.conversation_id));
                } else {
                    debug!("发送请求失败但消息已通过推送确认: cid={}", correlation_id);
                }
                Err(e)
            }
        }
    }

    /// 用服务端消息对账占位
    ///
    /// HTTP 响应与推送事件都走这里，后到的一方得到 `Unchanged`。
    /// 推送未带 correlation_id 而先行入库时，后到的 HTTP 响应得到 `Merged`。
    pub fn reconcile(&self, message: Message) -> IngestOutcome {
        let Some(correlation_id) = message.correlation_id.clone() else {
            return IngestOutcome::Unchanged;
        };
        let message_id = message.id.clone();

        let outcome = self
            .inner
            .store
            .lock()
            .upsert_by_correlation_id(&correlation_id, message);
        if outcome.changed() {
            info!("✅ 消息已确认: cid={} -> {:?} ({:?})", correlation_id, message_id, outcome);
            self.emit_status(&correlation_id, message_id, DeliveryStatus::Sent, None);
            self.inner
                .events
                .emit(event_builders::timeline_changed(&self.inner.conversation_id));
        }
        outcome
    }

    /// 是否存在该 correlation_id 的未确认占位
    pub fn has_pending(&self, correlation_id: &str) -> bool {
        self.inner
            .store
            .lock()
            .get_by_correlation_id(correlation_id)
            .is_some_and(|m| !m.is_confirmed())
    }

    /// 在途发送任务数
    pub fn in_flight(&self) -> usize {
        self.inner.tasks.active()
    }

    /// 中止所有在途发送
    pub fn abort_all(&self) {
        self.inner.tasks.abort_all();
    }

    fn spawn_dispatch(&self, correlation_id: String) {
        let controller = self.clone();
        self.inner.tasks.spawn(async move {
            if let Err(e) = controller.dispatch(&correlation_id).await {
                debug!("发送任务结束（失败）: cid={}, error={}", correlation_id, e);
            }
        });
    }

    fn emit_status(
        &self,
        correlation_id: &str,
        message_id: Option<String>,
        status: DeliveryStatus,
        error: Option<String>,
    ) {
        self.inner.events.emit(event_builders::send_status_changed(
            correlation_id,
            message_id,
            status,
            error,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncEvent;
    use crate::http_client::test_helpers::MockConversationApi;
    use crate::storage::message_store::MessageStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn controller(api: Arc<MockConversationApi>) -> (OptimisticSendController, SharedMessageStore, Arc<EventManager>) {
        let store = MessageStore::shared();
        let events = EventManager::shared(64);
        let controller = OptimisticSendController::new(
            "wf-1",
            CurrentUser::new("me", "Me"),
            store.clone(),
            api,
            events.clone(),
        );
        (controller, store, events)
    }

    fn server_copy(store: &SharedMessageStore, cid: &str, id: &str) -> Message {
        let mut message = store.lock().get_by_correlation_id(cid).unwrap().clone();
        message.id = Some(id.to_string());
        message.delivery_status = None;
        message
    }

    #[test]
    fn test_correlation_id_format() {
        let cid = generate_correlation_id();
        let (millis, suffix) = cid.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 12);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(cid, generate_correlation_id());
    }

    #[tokio::test]
    async fn test_optimistic_round_trip() {
        let api = MockConversationApi::new();
        let (controller, store, _events) = controller(api.clone());

        let cid = controller.begin_send("hello", Vec::new()).unwrap();
        {
            let store = store.lock();
            let placeholder = store.get_by_correlation_id(&cid).unwrap();
            assert_eq!(placeholder.delivery_status, Some(DeliveryStatus::Sending));
            assert!(placeholder.id.is_none());
        }

        let confirmed = controller.dispatch(&cid).await.unwrap().unwrap();
        assert_eq!(confirmed.id.as_deref(), Some("srv-1"));

        let snapshot = store.lock().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id.as_deref(), Some("srv-1"));
        assert_eq!(snapshot[0].correlation_id.as_deref(), Some(cid.as_str()));
        assert_eq!(snapshot[0].delivery_status, None);
        assert_eq!(api.create_requests.lock()[0].correlation_id, cid);
    }

    #[tokio::test]
    async fn test_failure_then_retry() {
        let api = MockConversationApi::new();
        api.push_create_result(Err(ConvSyncError::Transport("offline".to_string())));
        let (controller, store, events) = controller(api.clone());
        let mut receiver = events.subscribe();

        let cid = controller.begin_send("hello", Vec::new()).unwrap();
        assert!(controller.dispatch(&cid).await.is_err());
        assert_eq!(
            store.lock().get_by_correlation_id(&cid).unwrap().delivery_status,
            Some(DeliveryStatus::Failed)
        );

        controller.retry(&cid).unwrap();
        loop {
            if let SyncEvent::SendStatusChanged { status: DeliveryStatus::Sent, correlation_id, .. } =
                receiver.recv().await.unwrap()
            {
                assert_eq!(correlation_id, cid);
                break;
            }
        }

        let snapshot = store.lock().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].is_confirmed());
        let requests = api.create_requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].correlation_id, requests[1].correlation_id);
    }

    #[tokio::test]
    async fn test_retry_rejects_unknown_and_in_flight() {
        let api = MockConversationApi::new();
        let (controller, _store, _events) = controller(api);

        assert!(matches!(controller.retry("nope"), Err(ConvSyncError::NotFound(_))));

        let cid = controller.begin_send("hello", Vec::new()).unwrap();
        assert!(matches!(controller.retry(&cid), Err(ConvSyncError::InvalidOperation(_))));
        assert!(matches!(
            controller.begin_send("   ", Vec::new()),
            Err(ConvSyncError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_push_confirmation_before_http_response() {
        let api = MockConversationApi::new();
        api.hold_creates();
        let (controller, store, _events) = controller(api.clone());

        let observed = Arc::new(AtomicUsize::new(0));
        let counter = observed.clone();
        controller.set_observer(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let cid = controller.begin_send("race", Vec::new()).unwrap();
        let worker = controller.clone();
        let dispatch_cid = cid.clone();
        let pending = tokio::spawn(async move { worker.dispatch(&dispatch_cid).await });
        while api.create_requests.lock().is_empty() {
            tokio::task::yield_now().await;
        }

        // 推送先到
        assert_eq!(
            controller.reconcile(server_copy(&store, &cid, "srv-1")),
            IngestOutcome::Reconciled
        );
        assert!(!controller.has_pending(&cid));

        api.release_creates();
        pending.await.unwrap().unwrap();

        let snapshot = store.lock().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id.as_deref(), Some("srv-1"));
        // HTTP 后到，不再触发确认回调
        assert_eq!(observed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_http_response_after_push_without_correlation_id_is_merged() {
        let api = MockConversationApi::new();
        api.hold_creates();
        let (controller, store, events) = controller(api.clone());
        let mut receiver = events.subscribe();

        let observed = Arc::new(AtomicUsize::new(0));
        let counter = observed.clone();
        controller.set_observer(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let cid = controller.begin_send("hi", Vec::new()).unwrap();
        let worker = controller.clone();
        let dispatch_cid = cid.clone();
        let pending = tokio::spawn(async move { worker.dispatch(&dispatch_cid).await });
        while api.create_requests.lock().is_empty() {
            tokio::task::yield_now().await;
        }

        // 推送带来同一条消息，但没有回显 correlation_id
        let mut pushed = server_copy(&store, &cid, "srv-1");
        pushed.correlation_id = None;
        assert!(store.lock().append(pushed));
        assert_eq!(store.lock().len(), 2);

        api.release_creates();
        let confirmed = pending.await.unwrap().unwrap().unwrap();
        assert_eq!(confirmed.id.as_deref(), Some("srv-1"));

        let snapshot = store.lock().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].correlation_id.as_deref(), Some(cid.as_str()));
        assert_eq!(observed.load(Ordering::SeqCst), 0);

        // 占位仍会收到 sent 状态，UI 可以移除发送中的标记
        loop {
            if let SyncEvent::SendStatusChanged { status: DeliveryStatus::Sent, correlation_id, .. } =
                receiver.recv().await.unwrap()
            {
                assert_eq!(correlation_id, cid);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_late_failure_does_not_override_push_confirmation() {
        let api = MockConversationApi::new();
        api.hold_creates();
        api.push_create_result(Err(ConvSyncError::Http { status: 502, body: "bad gateway".into() }));
        let (controller, store, _events) = controller(api.clone());

        let cid = controller.begin_send("late", Vec::new()).unwrap();
        let worker = controller.clone();
        let dispatch_cid = cid.clone();
        let pending = tokio::spawn(async move { worker.dispatch(&dispatch_cid).await });
        while api.create_requests.lock().is_empty() {
            tokio::task::yield_now().await;
        }

        controller.reconcile(server_copy(&store, &cid, "srv-9"));
        api.release_creates();
        assert!(pending.await.unwrap().is_err());

        let store = store.lock();
        let message = store.get_by_correlation_id(&cid).unwrap();
        assert_eq!(message.id.as_deref(), Some("srv-9"));
        assert_eq!(message.delivery_status, None);
    }

    #[tokio::test]
    async fn test_send_spawns_dispatch_with_attachments() {
        let api = MockConversationApi::new();
        let (controller, store, events) = controller(api.clone());
        let mut receiver = events.subscribe();

        let attachment = Attachment {
            file_id: "f1".to_string(),
            filename: "brief.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: 2048,
            url: None,
        };
        let cid = controller.send("", vec![attachment]).unwrap();

        loop {
            if let SyncEvent::SendStatusChanged { status: DeliveryStatus::Sent, .. } =
                receiver.recv().await.unwrap()
            {
                break;
            }
        }
        assert_eq!(api.create_requests.lock()[0].attachment_ids, vec!["f1".to_string()]);
        assert!(store.lock().get_by_correlation_id(&cid).unwrap().is_confirmed());
    }
}
