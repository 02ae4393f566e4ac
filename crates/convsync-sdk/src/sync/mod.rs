//! 同步模块
//!
//! - `optimistic_send`：乐观发送与对账
//! - `sync_engine`：组合各组件的同步引擎

pub mod optimistic_send;
pub mod sync_engine;

pub use optimistic_send::{generate_correlation_id, ConfirmationObserver, OptimisticSendController};
pub use sync_engine::SyncEngine;
