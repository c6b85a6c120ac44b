//! ArenaSync - 实时会话同步引擎
//!
//! 面向赛事社区客户端的实时同步层，功能包括：
//! - 🔗 传输句柄：令牌绑定连接、有界退避重连、房间自动重加入
//! - ⚙️ 事件分发：类型化订阅/退订，按 (事件, 处理器) 去重
//! - 🚦 请求节流：按操作键冷却，切换目标立即放行
//! - 💬 状态调和：会话/消息的唯一合并点，去重 + 排序不变式
//! - 🔔 未读跟踪：激活同步清零，已读状态单调落地
//! - ✅ 通知动作：accept/decline 幂等状态机，连点只打一次网络
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use arena_sync::{SyncConfig, SyncEngine, MessageKind};
//! use std::sync::Arc;
//!
//! # async fn demo(transport: Arc<dyn arena_sync::Transport>) -> arena_sync::Result<()> {
//! // 配置引擎
//! let config = SyncConfig::builder()
//!     .rest_base_url("https://api.example.com")
//!     .connect_timeout_secs(10)
//!     .build();
//!
//! // 组装引擎（传输实现由平台层注入）
//! let engine = SyncEngine::with_rest(config, transport, "session-token")?;
//!
//! // 建立连接并拉取会话列表
//! engine.connect("session-token").await?;
//! let chats = engine.fetch_chats().await?;
//!
//! // 激活会话（本地未读立即清零）并发送消息
//! engine.mark_chat_active(chats[0].id).await?;
//! engine.send_message(chats[0].id, "GLHF!", MessageKind::Text).await?;
//!
//! // 订阅引擎事件供 UI 层消费
//! let mut events = engine.events();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("状态变更: {}", event.event_type());
//!     }
//! });
//!
//! // 登出时关闭并丢弃会话内状态
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

// 导出核心模块
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod notification;
pub mod reconciler;
pub mod rest_client;
pub mod throttle;
pub mod transport;
pub mod unread;
pub mod version;

// 重新导出核心类型，方便使用
pub use dispatcher::{DispatcherStats, EventDispatcher, Handler};
pub use engine::{Room, SyncConfig, SyncConfigBuilder, SyncEngine};
pub use error::{Result, SyncError};
pub use events::{now_ms, ClientEvent, PushEvent, SyncEvent, TournamentUpdatePayload};
pub use models::{ActionKind, Chat, ChatInfo, Message, MessageKind};
pub use notification::{
    ActionOutcome, ActionStatus, ActionSubmitter, NotificationProcessor, NotificationStats,
};
pub use reconciler::{ChatReconciler, MergeOutcome};
pub use rest_client::{ChatApi, RestClient, RestConfig};
pub use throttle::{CooldownConfig, OperationKey, ThrottleError, ThrottleGuard, ThrottleStats};
pub use transport::{
    BackoffConfig, ConnectionStats, ConnectionStatus, LifecycleEvent, ReconnectBackoff, RejoinHook,
    Transport, TransportHandle, TransportSignal,
};
pub use unread::UnreadTracker;
pub use version::{full_version, SDK_VERSION};
