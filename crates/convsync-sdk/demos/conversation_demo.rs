//! 会话同步演示
//!
//! 连接到一个真实的会话服务，打印时间线 / 输入状态 / 连接状态变化，并发送一条消息。
//!
//! 环境变量：
//! - `CONVSYNC_BASE_URL`（默认 http://127.0.0.1:8080/v1）
//! - `CONVSYNC_CONVERSATION`（默认 wf-demo）
//! - `CONVSYNC_TOKEN`（可选）

use std::time::Duration;

use convsync_sdk::{CurrentUser, ReconnectPolicy, SyncConfig, SyncEngine, SyncEvent};
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("\n🚀 会话同步演示\n");
    println!("====================================\n");

    let base_url = std::env::var("CONVSYNC_BASE_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8080/v1".to_string());
    let conversation_id =
        std::env::var("CONVSYNC_CONVERSATION").unwrap_or_else(|_| "wf-demo".to_string());

    let mut user = CurrentUser::new("demo-user", "Demo");
    if let Ok(token) = std::env::var("CONVSYNC_TOKEN") {
        user = user.with_auth_token(token);
    }

    let config = SyncConfig::builder()
        .base_url(base_url)
        .conversation_id(conversation_id)
        .current_user(user)
        .reconnect(ReconnectPolicy::exponential())
        .build()?;

    let engine = SyncEngine::new(config)?;
    let mut events = engine.subscribe();

    println!("📦 正在加载会话...");
    engine.start().await?;
    println!("✅ 已加载 {} 条消息\n", engine.snapshot().len());

    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::SendStatusChanged {
                    correlation_id,
                    status,
                    error,
                    ..
                } => println!("📤 {} -> {} {}", correlation_id, status, error.unwrap_or_default()),
                SyncEvent::TypingChanged { users, .. } => {
                    let names: Vec<String> = users.into_iter().map(|u| u.display_name).collect();
                    println!("✍️ 正在输入: {:?}", names);
                }
                SyncEvent::ConnectionStateChanged { new_state, .. } => {
                    println!("🔌 连接状态: {}", new_state)
                }
                SyncEvent::NewMessagesAvailable { count, .. } => println!("🔔 {} 条新消息", count),
                other => println!("📨 {}", other.event_type()),
            }
        }
    });

    let correlation_id = engine.send("Hello from convsync demo 👋", Vec::new())?;
    println!("📝 已提交消息: {}", correlation_id);

    sleep(Duration::from_secs(30)).await;

    println!("\n【最终时间线】");
    for message in engine.snapshot() {
        println!(
            "  [{}] {} {}: {}",
            message.created_at.format("%H:%M:%S"),
            message.display_key(),
            message.sender_kind,
            if message.is_deleted() { "<已删除>" } else { message.body.as_str() }
        );
    }
    println!("\n{}", engine.connection_state().summary());

    engine.stop();
    printer.abort();
    Ok(())
}
