//! 同步引擎 - ArenaSync 主入口
//!
//! 分层架构：
//! ```text
//! SyncEngine (装配层)
//!   ├── TransportHandle (传输句柄：连接/重连/生命周期)
//!   ├── EventDispatcher (推送事件分发)
//!   ├── ThrottleGuard (客户端节流)
//!   ├── ChatReconciler (状态调和，唯一合并点)
//!   ├── UnreadTracker (未读计数/已读回执)
//!   └── NotificationProcessor (通知动作状态机)
//! ```
//!
//! 数据流：传输句柄 → 分发器 → {调和器, 未读跟踪, 通知处理}；
//! 用户操作反向经节流闸门到 REST 调用或传输发射。

use crate::dispatcher::EventDispatcher;
use crate::error::Result;
use crate::events::{ClientEvent, PushEvent, SyncEvent};
use crate::models::{ActionKind, Chat, ChatInfo, Message, MessageKind};
use crate::notification::{ActionOutcome, ActionSubmitter, NotificationProcessor};
use crate::reconciler::{ChatReconciler, MergeOutcome};
use crate::rest_client::{ChatApi, RestClient, RestConfig};
use crate::throttle::{CooldownConfig, OperationKey, ThrottleGuard};
use crate::transport::{
    BackoffConfig, ConnectionStats, ConnectionStatus, LifecycleEvent, Transport, TransportHandle,
};
use crate::unread::UnreadTracker;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// 房间成员身份（服务端按房间过滤推送）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    Chat(u64),
    Tournament(u64),
}

/// 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// REST 协作方配置
    pub rest: RestConfig,
    /// 节流冷却表
    pub cooldowns: CooldownConfig,
    /// 重连退避配置
    pub backoff: BackoffConfig,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 引擎事件广播缓冲大小
    pub event_buffer_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rest: RestConfig::default(),
            cooldowns: CooldownConfig::default(),
            backoff: BackoffConfig::default(),
            connect_timeout_secs: 10,
            event_buffer_size: 256,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder {
            config: SyncConfig::default(),
        }
    }
}

/// 引擎配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn rest_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.rest.base_url = base_url.into();
        self
    }

    pub fn cooldowns(mut self, cooldowns: CooldownConfig) -> Self {
        self.config.cooldowns = cooldowns;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

/// 实时同步引擎
///
/// 每个已认证会话一个实例；连接对象显式注入、显式 teardown，
/// 不依赖模块加载顺序。
pub struct SyncEngine {
    handle: Arc<TransportHandle>,
    dispatcher: Arc<EventDispatcher>,
    throttle: ThrottleGuard,
    unread: Arc<UnreadTracker>,
    reconciler: Arc<ChatReconciler>,
    notifications: Arc<NotificationProcessor>,
    api: Arc<dyn ChatApi>,
    /// 当前持有的房间成员身份（重连后恢复）
    rooms: Arc<RwLock<HashSet<Room>>>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    /// 组装引擎（传输与协作方均为注入）
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        api: Arc<dyn ChatApi>,
        submitter: Arc<dyn ActionSubmitter>,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(EventDispatcher::new());
        let handle = TransportHandle::new(
            transport,
            dispatcher.clone(),
            config.backoff.clone(),
            Duration::from_secs(config.connect_timeout_secs),
        );
        let (events_tx, _) = broadcast::channel(config.event_buffer_size);
        let unread = Arc::new(UnreadTracker::new(events_tx.clone()));
        let reconciler = Arc::new(ChatReconciler::new(unread.clone(), events_tx.clone()));
        let notifications = Arc::new(NotificationProcessor::new(submitter));

        let engine = Arc::new(Self {
            handle,
            dispatcher,
            throttle: ThrottleGuard::new(config.cooldowns),
            unread,
            reconciler,
            notifications,
            api,
            rooms: Arc::new(RwLock::new(HashSet::new())),
            events_tx,
        });

        engine.register_handlers();
        engine.install_rejoin_hook();
        engine.spawn_event_pump();
        engine
    }

    /// 组装引擎并用内置 REST 客户端充当协作方
    pub fn with_rest(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        token: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let rest = Arc::new(RestClient::new(&config.rest, token)?);
        Ok(Self::new(config, transport, rest.clone(), rest))
    }

    // ---- 连接生命周期 ----

    /// 建立连接（幂等）
    ///
    /// 断开会清空分发器，重连前重新挂载处理器；
    /// 分发器按 (事件, 处理器 ID) 去重，重复 connect 不会造成重复处理。
    pub async fn connect(&self, token: &str) -> Result<()> {
        self.register_handlers();
        self.handle.connect(token).await
    }

    /// 断开连接并丢弃全部会话内状态（登出/页面卸载）
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.disconnect().await?;
        self.throttle.reset();
        self.unread.reset();
        self.reconciler.reset();
        self.notifications.reset();
        self.rooms.write().clear();
        info!("引擎已关闭，会话内状态已丢弃");
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.handle.status()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.handle.stats()
    }

    /// 订阅引擎事件（UI 层消费）
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events_tx.subscribe()
    }

    /// 订阅连接生命周期事件
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.handle.lifecycle()
    }

    // ---- 用户操作（经节流闸门） ----

    /// 拉取会话列表并应用快照
    pub async fn fetch_chats(&self) -> Result<Vec<Chat>> {
        self.throttle.check(OperationKey::FetchChats, None)?;
        let chats = self.api.fetch_chats().await?;
        self.reconciler.apply_snapshot(chats);
        Ok(self.reconciler.chats())
    }

    /// 拉取某会话的消息（切换会话不受冷却限制）
    pub async fn fetch_messages(&self, chat_id: u64) -> Result<Vec<Message>> {
        self.throttle
            .check(OperationKey::FetchMessages, Some(chat_id))?;
        let messages = self.api.fetch_messages(chat_id).await?;
        self.reconciler.set_messages(chat_id, messages);
        Ok(self.reconciler.messages(chat_id))
    }

    /// 拉取会话详情
    pub async fn fetch_chat_info(&self, chat_id: u64) -> Result<ChatInfo> {
        self.throttle
            .check(OperationKey::FetchUserInfo, Some(chat_id))?;
        self.api.chat_info(chat_id).await
    }

    /// 创建会话并加入其房间
    pub async fn create_chat(&self, name: &str) -> Result<Chat> {
        self.throttle.check(OperationKey::CreateChat, None)?;
        let chat = self.api.create_chat(name).await?;
        self.reconciler.upsert_chat(chat.clone());
        self.join_chat(chat.id).await?;
        Ok(chat)
    }

    /// 激活会话
    ///
    /// 本地未读清零是同步且无条件的；服务端已读上报经节流闸门，
    /// 被拦截或失败都不回滚本地状态（下一次激活会再补报）。
    pub async fn mark_chat_active(&self, chat_id: u64) -> Result<()> {
        self.unread.mark_chat_active(chat_id);

        match self.throttle.check(OperationKey::MarkAsRead, Some(chat_id)) {
            Ok(()) => {
                if let Err(e) = self.api.mark_read(chat_id).await {
                    warn!("服务端已读上报失败（本地状态保留）: {}", e);
                }
            }
            Err(e) => debug!("已读上报被节流: {}", e),
        }
        Ok(())
    }

    /// 发送消息（经传输通道，回显由 new_message 推送并入）
    pub async fn send_message(
        &self,
        chat_id: u64,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Result<()> {
        self.handle
            .emit(ClientEvent::SendMessage {
                chat_id,
                content: content.into(),
                kind,
            })
            .await
    }

    /// 上报单条消息已读（回执经 read_status 回显落地）
    pub async fn acknowledge_message_read(&self, message_id: u64) -> Result<()> {
        self.handle
            .emit(ClientEvent::ReadStatus { message_id })
            .await
    }

    /// 提交通知动作（accept/decline）
    ///
    /// 成功时命令对象已交给调和器乐观落地；
    /// 已处理目标返回良性的 ActionConflict（无网络调用）。
    pub async fn submit_notification_action(
        &self,
        message_id: u64,
        kind: ActionKind,
    ) -> Result<ActionOutcome> {
        let outcome = self.notifications.submit_action(message_id, kind).await?;
        self.reconciler.apply_action_outcome(&outcome);
        Ok(outcome)
    }

    // ---- 房间成员身份 ----

    pub async fn join_chat(&self, chat_id: u64) -> Result<()> {
        self.rooms.write().insert(Room::Chat(chat_id));
        self.handle.emit(ClientEvent::JoinChat { chat_id }).await
    }

    pub async fn join_tournament(&self, tournament_id: u64) -> Result<()> {
        self.rooms.write().insert(Room::Tournament(tournament_id));
        self.handle
            .emit(ClientEvent::JoinTournament { tournament_id })
            .await
    }

    pub async fn leave_tournament(&self, tournament_id: u64) -> Result<()> {
        self.rooms.write().remove(&Room::Tournament(tournament_id));
        self.handle
            .emit(ClientEvent::LeaveTournament { tournament_id })
            .await
    }

    // ---- 本地状态读取 ----

    pub fn chats(&self) -> Vec<Chat> {
        self.reconciler.chats()
    }

    pub fn messages(&self, chat_id: u64) -> Vec<Message> {
        self.reconciler.messages(chat_id)
    }

    pub fn unread_count(&self, chat_id: u64) -> u32 {
        self.unread.count(chat_id)
    }

    pub fn unread_counters(&self) -> HashMap<u64, u32> {
        self.unread.counters()
    }

    // ---- 内部装配 ----

    /// 在分发器上挂载推送事件处理器
    ///
    /// 处理器 ID 固定，分发器按 (事件, ID) 去重，重复调用安全。
    fn register_handlers(&self) {
        // new_message：合并消息；活跃会话触发已读回执上报
        {
            let reconciler = self.reconciler.clone();
            let handle = self.handle.clone();
            self.dispatcher
                .on("new_message", "engine:new_message", move |event| {
                    if let PushEvent::NewMessage(msg) = event {
                        let message_id = msg.id;
                        let outcome = reconciler.apply_incoming_message(msg.clone());
                        if outcome == MergeOutcome::AppliedActive {
                            let handle = handle.clone();
                            tokio::spawn(async move {
                                // emit 内部校验连接仍然有效，断开后静默丢弃
                                if let Err(e) =
                                    handle.emit(ClientEvent::ReadStatus { message_id }).await
                                {
                                    debug!("已读回执上报失败: {}", e);
                                }
                            });
                        }
                    }
                });
        }

        // read_status 回显：单调落地已读状态
        {
            let reconciler = self.reconciler.clone();
            self.dispatcher
                .on("read_status", "engine:read_status", move |event| {
                    if let PushEvent::ReadStatus {
                        chat_id,
                        message_id,
                        read_at,
                    } = event
                    {
                        reconciler.mark_message_read(*chat_id, *message_id, *read_at);
                    }
                });
        }

        // notification_update：幂等合并终态
        {
            let notifications = self.notifications.clone();
            let reconciler = self.reconciler.clone();
            self.dispatcher.on(
                "notification_update",
                "engine:notification_update",
                move |event| {
                    if let PushEvent::NotificationUpdate {
                        id,
                        action,
                        processed,
                    } = event
                    {
                        if let Some(outcome) =
                            notifications.merge_push_update(*id, *action, *processed)
                        {
                            reconciler.apply_action_outcome(&outcome);
                        }
                    }
                },
            );
        }

        // 赛事事件：透传给 UI
        {
            let events_tx = self.events_tx.clone();
            self.dispatcher.on(
                "tournament_message",
                "engine:tournament_message",
                move |event| {
                    if let PushEvent::TournamentMessage {
                        tournament_id,
                        content,
                    } = event
                    {
                        let _ = events_tx.send(SyncEvent::TournamentMessage {
                            tournament_id: *tournament_id,
                            content: content.clone(),
                        });
                    }
                },
            );
        }
        {
            let events_tx = self.events_tx.clone();
            self.dispatcher.on(
                "tournament_updated",
                "engine:tournament_updated",
                move |event| {
                    if let PushEvent::TournamentUpdated(payload) = event {
                        let _ = events_tx.send(SyncEvent::TournamentUpdated {
                            tournament_id: payload.tournament_id,
                            update_type: payload.metadata.update_type.clone(),
                        });
                    }
                },
            );
        }
    }

    /// 重连成功后恢复掉线前持有的房间成员身份
    fn install_rejoin_hook(&self) {
        let handle = self.handle.clone();
        let rooms = self.rooms.clone();
        self.handle.set_rejoin_hook(Arc::new(move |attempt| {
            let held: Vec<Room> = rooms.read().iter().copied().collect();
            let handle = handle.clone();
            tokio::spawn(async move {
                info!("重连成功（第 {} 次尝试），恢复 {} 个房间", attempt, held.len());
                for room in held {
                    let event = match room {
                        Room::Chat(chat_id) => ClientEvent::JoinChat { chat_id },
                        Room::Tournament(tournament_id) => {
                            ClientEvent::JoinTournament { tournament_id }
                        }
                    };
                    if let Err(e) = handle.emit(event).await {
                        warn!("恢复房间失败: {}", e);
                    }
                }
            });
        }));
    }

    /// 推送事件泵：传输 → 分发器
    fn spawn_event_pump(&self) {
        let handle = self.handle.clone();
        let dispatcher = self.dispatcher.clone();
        let mut incoming = self.handle.incoming();
        tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(event) => {
                        handle.note_received();
                        dispatcher.dispatch(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("推送流滞后，丢失 {} 条事件", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::transport::test_helpers::MockTransport;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// 测试用 REST 替身
    struct MockApi {
        chats: Mutex<Vec<Chat>>,
        messages: Mutex<HashMap<u64, Vec<Message>>>,
        mark_read_calls: AtomicUsize,
        next_chat_id: AtomicU64,
    }

    impl MockApi {
        fn new(chats: Vec<Chat>) -> Arc<Self> {
            Arc::new(Self {
                chats: Mutex::new(chats),
                messages: Mutex::new(HashMap::new()),
                mark_read_calls: AtomicUsize::new(0),
                next_chat_id: AtomicU64::new(1000),
            })
        }
    }

    #[async_trait::async_trait]
    impl ChatApi for MockApi {
        async fn fetch_chats(&self) -> Result<Vec<Chat>> {
            Ok(self.chats.lock().clone())
        }

        async fn fetch_messages(&self, chat_id: u64) -> Result<Vec<Message>> {
            Ok(self.messages.lock().get(&chat_id).cloned().unwrap_or_default())
        }

        async fn mark_read(&self, _chat_id: u64) -> Result<()> {
            self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn chat_info(&self, chat_id: u64) -> Result<ChatInfo> {
            Ok(ChatInfo {
                id: chat_id,
                name: format!("chat-{}", chat_id),
                member_count: 2,
                topic: None,
            })
        }

        async fn create_chat(&self, name: &str) -> Result<Chat> {
            let id = self.next_chat_id.fetch_add(1, Ordering::SeqCst);
            let chat = mk_chat(id, false, 1);
            let mut named = chat.clone();
            named.name = name.to_string();
            self.chats.lock().push(named.clone());
            Ok(named)
        }
    }

    struct NoopSubmitter {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ActionSubmitter for NoopSubmitter {
        async fn submit_action(&self, _message_id: u64, _kind: ActionKind) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn mk_chat(id: u64, pinned: bool, updated_at: i64) -> Chat {
        Chat {
            id,
            name: format!("chat-{}", id),
            last_message: None,
            is_pinned: pinned,
            is_muted: false,
            updated_at,
        }
    }

    fn mk_msg(chat_id: u64, id: u64, created_at: i64) -> Message {
        Message {
            id,
            chat_id,
            sender_id: 100,
            kind: MessageKind::Text,
            content: format!("msg-{}", id),
            created_at,
            is_read: false,
            read_at: None,
            processed: false,
            action: None,
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig::builder()
            .backoff(BackoffConfig {
                base_ms: 5,
                max_ms: 20,
                multiplier: 2.0,
                max_attempts: 5,
                jitter_ms: 0,
            })
            .build()
    }

    async fn setup(
        chats: Vec<Chat>,
    ) -> (Arc<SyncEngine>, Arc<MockTransport>, Arc<MockApi>) {
        let transport = MockTransport::new();
        let api = MockApi::new(chats);
        let submitter = Arc::new(NoopSubmitter {
            calls: AtomicUsize::new(0),
        });
        let engine = SyncEngine::new(fast_config(), transport.clone(), api.clone(), submitter);
        engine.connect("token-1").await.unwrap();
        engine.fetch_chats().await.unwrap();
        (engine, transport, api)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if condition() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("条件等待超时");
    }

    #[tokio::test]
    async fn test_active_chat_message_scenario() {
        let (engine, transport, _api) = setup(vec![mk_chat(1, false, 100), mk_chat(2, false, 50)]).await;
        engine.mark_chat_active(1).await.unwrap();

        // 活跃会话收到 new_message：追加、更新 last_message、上报回执、未读不变
        transport.push(PushEvent::NewMessage(mk_msg(1, 42, 200)));
        wait_until(|| engine.messages(1).len() == 1).await;

        assert_eq!(engine.chats()[0].last_message.as_ref().unwrap().id, 42);
        assert_eq!(engine.unread_count(1), 0);
        wait_until(|| {
            transport
                .emitted()
                .contains(&ClientEvent::ReadStatus { message_id: 42 })
        })
        .await;

        // 同一事件再投递：不重复追加、不重复上报回执
        transport.push(PushEvent::NewMessage(mk_msg(1, 42, 200)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.messages(1).len(), 1);
        let receipts = transport
            .emitted()
            .iter()
            .filter(|e| matches!(e, ClientEvent::ReadStatus { message_id: 42 }))
            .count();
        assert_eq!(receipts, 1);
    }

    #[tokio::test]
    async fn test_inactive_chat_unread_increment() {
        let (engine, transport, _api) = setup(vec![mk_chat(1, false, 300), mk_chat(2, false, 100)]).await;
        engine.mark_chat_active(1).await.unwrap();

        transport.push(PushEvent::NewMessage(mk_msg(2, 7, 500)));
        wait_until(|| engine.unread_count(2) == 1).await;

        // 会话 2 升到分组顶部
        assert_eq!(engine.chats()[0].id, 2);
    }

    #[tokio::test]
    async fn test_read_status_echo_lands_monotonically() {
        let (engine, transport, _api) = setup(vec![mk_chat(1, false, 100)]).await;
        engine.mark_chat_active(1).await.unwrap();
        transport.push(PushEvent::NewMessage(mk_msg(1, 42, 200)));
        wait_until(|| engine.messages(1).len() == 1).await;

        transport.push(PushEvent::ReadStatus {
            chat_id: 1,
            message_id: 42,
            read_at: 300,
        });
        wait_until(|| engine.messages(1)[0].is_read).await;
        assert_eq!(engine.messages(1)[0].read_at, Some(300));

        // 重复回显不改变已落地的时间
        transport.push(PushEvent::ReadStatus {
            chat_id: 1,
            message_id: 42,
            read_at: 999,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.messages(1)[0].read_at, Some(300));
    }

    #[tokio::test]
    async fn test_notification_update_merges_idempotently() {
        let (engine, transport, _api) = setup(vec![mk_chat(1, false, 100)]).await;
        engine.mark_chat_active(1).await.unwrap();
        transport.push(PushEvent::NewMessage(mk_msg(1, 42, 200)));
        wait_until(|| engine.messages(1).len() == 1).await;

        // 本地乐观应用
        let outcome = engine
            .submit_notification_action(42, ActionKind::Accept)
            .await
            .unwrap();
        assert!(outcome.processed);
        assert!(engine.messages(1)[0].processed);

        // 迟到的推送回显：no-op，不是错误
        transport.push(PushEvent::NotificationUpdate {
            id: 42,
            action: ActionKind::Accept,
            processed: true,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.messages(1)[0].action, Some(ActionKind::Accept));

        // 再次提交被幂等拒绝
        let result = engine.submit_notification_action(42, ActionKind::Accept).await;
        assert!(matches!(result, Err(SyncError::ActionConflict(_))));
    }

    #[tokio::test]
    async fn test_rooms_rejoined_after_reconnect() {
        let (engine, transport, _api) = setup(vec![mk_chat(1, false, 100)]).await;
        engine.join_chat(1).await.unwrap();
        engine.join_tournament(5).await.unwrap();

        transport.drop_connection("网络抖动");
        wait_until(|| {
            let joins = transport
                .emitted()
                .iter()
                .filter(|e| {
                    matches!(e, ClientEvent::JoinTournament { tournament_id: 5 })
                })
                .count();
            joins == 2
        })
        .await;

        let chat_joins = transport
            .emitted()
            .iter()
            .filter(|e| matches!(e, ClientEvent::JoinChat { chat_id: 1 }))
            .count();
        assert_eq!(chat_joins, 2);
    }

    #[tokio::test]
    async fn test_repeated_connect_does_not_duplicate_handlers() {
        let (engine, transport, _api) = setup(vec![mk_chat(1, false, 100)]).await;
        let handlers_before = engine.dispatcher.handler_count();

        // 再次 connect（热重载/重挂载场景）
        engine.connect("token-1").await.unwrap();
        assert_eq!(engine.dispatcher.handler_count(), handlers_before);

        engine.mark_chat_active(1).await.unwrap();
        transport.push(PushEvent::NewMessage(mk_msg(1, 42, 200)));
        wait_until(|| !engine.messages(1).is_empty()).await;
        assert_eq!(engine.messages(1).len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_chats_is_throttled() {
        let (engine, _transport, _api) = setup(vec![mk_chat(1, false, 100)]).await;

        // setup 里已经成功拉取过一次，冷却内的第二次被拦截
        let result = engine.fetch_chats().await;
        match result {
            Err(e @ SyncError::Throttled { .. }) => assert!(e.is_benign()),
            other => panic!("期望 Throttled，得到 {:?}", other.map(|v| v.len())),
        }
    }

    #[tokio::test]
    async fn test_fetch_messages_target_switch_bypass() {
        let (engine, _transport, _api) =
            setup(vec![mk_chat(1, false, 100), mk_chat(2, false, 50)]).await;

        // 切换会话：两次都立即放行
        engine.fetch_messages(1).await.unwrap();
        engine.fetch_messages(2).await.unwrap();
        // 同一会话冷却内的第三次被拦截
        assert!(matches!(
            engine.fetch_messages(2).await,
            Err(SyncError::Throttled { .. })
        ));
    }

    #[tokio::test]
    async fn test_tournament_events_passthrough() {
        let (engine, transport, _api) = setup(vec![]).await;
        let mut events = engine.events();

        transport.push(PushEvent::TournamentMessage {
            tournament_id: 9,
            content: "第一轮开始".to_string(),
        });

        let event = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(e) = events.recv().await {
                    if matches!(e, SyncEvent::TournamentMessage { .. }) {
                        return e;
                    }
                }
            }
        })
        .await
        .unwrap();
        match event {
            SyncEvent::TournamentMessage {
                tournament_id,
                content,
            } => {
                assert_eq!(tournament_id, 9);
                assert_eq!(content, "第一轮开始");
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_shutdown_discards_session_state() {
        let (engine, transport, _api) = setup(vec![mk_chat(1, false, 100)]).await;
        engine.mark_chat_active(1).await.unwrap();
        transport.push(PushEvent::NewMessage(mk_msg(1, 42, 200)));
        wait_until(|| !engine.messages(1).is_empty()).await;

        engine.shutdown().await.unwrap();
        assert!(engine.chats().is_empty());
        assert!(engine.messages(1).is_empty());
        assert_eq!(engine.status(), ConnectionStatus::Disconnected);
    }
}
