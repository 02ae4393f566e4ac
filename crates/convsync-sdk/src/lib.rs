//! ConvSync SDK - 工作流会话同步引擎
//!
//! 为每个工作流的对话面板维护一份一致的消息日志，合并三路并发数据源：
//! - 📥 首屏批量拉取（REST 快照）
//! - 📤 本地乐观发送（占位消息 + correlation_id 对账）
//! - 📡 服务端推送（SSE），断线自动重连并重同步
//!
//! 同时提供：
//! - 👁 已读回执：乐观更新本端已读位置，跟踪对端已读位置
//! - ✍️ 输入状态：对端"正在输入"，自动过期
//! - ⚙️ 事件系统：时间线变化、自动滚动 / 新消息提示、连接状态
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use convsync_sdk::{CurrentUser, SyncConfig, SyncEngine, SyncEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .base_url("https://api.example.com/v1")
//!         .conversation_id("wf-42")
//!         .current_user(CurrentUser::new("u1", "Ann").with_auth_token("token"))
//!         .build()?;
//!
//!     let engine = SyncEngine::new(config)?;
//!     let mut events = engine.subscribe();
//!     engine.start().await?;
//!
//!     let correlation_id = engine.send("Hello, World!", Vec::new())?;
//!     println!("已发送: {}", correlation_id);
//!
//!     while let Ok(event) = events.recv().await {
//!         if let SyncEvent::TimelineChanged { .. } = event {
//!             println!("当前消息数: {}", engine.snapshot().len());
//!         }
//!     }
//!
//!     engine.stop();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection_state;
pub mod error;
pub mod events;
pub mod http_client;
pub mod lifecycle;
pub mod read_receipt;
pub mod reconnect;
pub mod storage;
pub mod stream;
pub mod sync;
pub mod typing;
pub mod utils;

pub use config::{HttpClientConfig, SyncConfig, SyncConfigBuilder};
pub use connection_state::{ConnectionState, ConnectionStateManager, ConnectionStatus};
pub use error::{ConvSyncError, Result};
pub use events::{event_builders, EventManager, EventStats, SyncEvent};
pub use http_client::{ConversationApi, CreateMessageRequest, FetchMessagesResponse, HttpConversationApi};
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use read_receipt::{ReadReceipt, ReadReceiptTracker};
pub use reconnect::ReconnectPolicy;
pub use storage::{
    Attachment, Conversation, CurrentUser, DeliveryStatus, IngestOutcome, MergeOutcome, Message,
    MessagePatch, MessageStore, SenderKind, SharedMessageStore,
};
pub use stream::{
    EventSource, EventStreamManager, FrameStream, RawFrame, SseDecoder, SseEventSource, StreamEvent,
    StreamEventHandler, StreamFrame,
};
pub use sync::{OptimisticSendController, SyncEngine};
pub use typing::{TypingPresenceTracker, TypingState};
pub use utils::{BackgroundTasks, TimerRegistry};
