//! 存储层
//!
//! 会话消息日志只在内存中维护，生命周期与一次会话挂载相同。

pub mod entities;
pub mod message_store;

pub use entities::{
    Attachment, Conversation, CurrentUser, DeliveryStatus, Message, MessagePatch, SenderKind,
};
pub use message_store::{IngestOutcome, MergeOutcome, MessageStore, SharedMessageStore};
