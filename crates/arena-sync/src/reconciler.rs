//! 会话状态调和器 - 所有会话/消息变更的唯一合并点
//!
//! 三个真相来源（用户输入、REST 快照、服务端推送）都汇到这里，
//! 合并成一份有序、去重的本地状态：
//!
//! - `apply_snapshot`：用 REST 拉到的列表替换会话集，**保留**本地未读计数
//! - `apply_incoming_message`：按 ID 去重 → 活跃会话追加 → 更新 last_message
//!   并按不变式重排（置顶在前，组内按最近活跃降序）
//! - 指向未知会话的消息不丢弃，先缓冲，等下一次快照引入该会话后按到达
//!   顺序重放（乱序到达时的刻意设计，不是权宜之计）
//!
//! 调和器信任传输层的到达顺序，不按时间戳重排消息。

use crate::events::{now_ms, SyncEvent};
use crate::models::{Chat, Message};
use crate::notification::ActionOutcome;
use crate::unread::UnreadTracker;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// 单个未知会话最多缓冲的消息数
const UNKNOWN_CHAT_BUFFER_CAP: usize = 256;

/// 一次消息合并的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// 重复投递，已丢弃
    Duplicate,
    /// 会话未知，已缓冲等待下一次快照
    BufferedUnknownChat,
    /// 已并入活跃会话（调用方应触发已读回执上报）
    AppliedActive,
    /// 已并入非活跃会话（未读数已 +1）
    AppliedInactive,
}

/// 已处理消息的去重记忆（有界，按时间清退）
struct DedupMemory {
    seen: HashMap<(u64, u64), Instant>,
    retention: Duration,
    cleanup_threshold: usize,
}

impl DedupMemory {
    fn new(retention: Duration, max_entries: usize) -> Self {
        Self {
            seen: HashMap::new(),
            retention,
            cleanup_threshold: max_entries * 4 / 5,
        }
    }

    fn contains(&self, chat_id: u64, message_id: u64) -> bool {
        self.seen.contains_key(&(chat_id, message_id))
    }

    fn mark(&mut self, chat_id: u64, message_id: u64) {
        self.seen.insert((chat_id, message_id), Instant::now());
        if self.seen.len() > self.cleanup_threshold {
            self.cleanup();
        }
    }

    fn cleanup(&mut self) {
        let now = Instant::now();
        let before = self.seen.len();
        let retention = self.retention;
        self.seen
            .retain(|_, at| now.duration_since(*at) <= retention);
        let removed = before - self.seen.len();
        if removed > 0 {
            info!("清理去重记忆: 移除 {} 条，剩余 {} 条", removed, self.seen.len());
        }
    }
}

struct ReconcilerState {
    /// 会话列表，始终满足排序不变式
    chats: Vec<Chat>,
    /// 已加载会话的消息序列（到达顺序）
    messages: HashMap<u64, Vec<Message>>,
    /// 未知会话的缓冲消息，等待快照引入
    pending_unknown: HashMap<u64, Vec<Message>>,
    dedup: DedupMemory,
}

/// 会话状态调和器
pub struct ChatReconciler {
    state: RwLock<ReconcilerState>,
    unread: Arc<UnreadTracker>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl ChatReconciler {
    pub fn new(unread: Arc<UnreadTracker>, events_tx: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            state: RwLock::new(ReconcilerState {
                chats: Vec::new(),
                messages: HashMap::new(),
                pending_unknown: HashMap::new(),
                dedup: DedupMemory::new(Duration::from_secs(3600), 10_000),
            }),
            unread,
            events_tx,
        }
    }

    /// 应用 REST 快照：替换会话集，保留本地未读计数，重放缓冲消息
    pub fn apply_snapshot(&self, chats: Vec<Chat>) {
        let replayed = {
            let mut state = self.state.write();
            let known: HashSet<u64> = chats.iter().map(|c| c.id).collect();

            state.chats = chats;
            Self::sort_chats(&mut state.chats);
            state.messages.retain(|id, _| known.contains(id));

            // 快照里已存在的会话保留其本地未读数，其余清退
            self.unread.retain(&known);

            // 重放此前指向未知会话、现在已被快照引入的缓冲消息
            let ready: Vec<u64> = state
                .pending_unknown
                .keys()
                .filter(|id| known.contains(id))
                .copied()
                .collect();
            let mut replayed = 0usize;
            for chat_id in ready {
                if let Some(buffered) = state.pending_unknown.remove(&chat_id) {
                    for msg in buffered {
                        // 缓冲时已做过去重标记，重放时跳过去重检查
                        self.merge_known_chat(&mut state, msg);
                        replayed += 1;
                    }
                }
            }
            replayed
        };

        if replayed > 0 {
            info!("快照引入了缓冲中的 {} 条消息", replayed);
        }
        self.emit_list_updated();
    }

    /// 合并一条入站消息（推送或本地乐观发送的回显）
    pub fn apply_incoming_message(&self, message: Message) -> MergeOutcome {
        let outcome = {
            let mut state = self.state.write();

            // 1. 按 (chat_id, message_id) 去重，吸收重复投递
            if state.dedup.contains(message.chat_id, message.id) {
                debug!(
                    "丢弃重复消息: chat={} message={}",
                    message.chat_id, message.id
                );
                return MergeOutcome::Duplicate;
            }
            state.dedup.mark(message.chat_id, message.id);

            // 2. 未知会话：缓冲而非丢弃（会话创建与房间加入存在竞态）
            if !state.chats.iter().any(|c| c.id == message.chat_id) {
                let buffer = state.pending_unknown.entry(message.chat_id).or_default();
                if buffer.len() >= UNKNOWN_CHAT_BUFFER_CAP {
                    warn!(
                        "未知会话 {} 的缓冲已满，丢弃消息 {}",
                        message.chat_id, message.id
                    );
                    return MergeOutcome::BufferedUnknownChat;
                }
                debug!(
                    "缓冲未知会话消息: chat={} message={}",
                    message.chat_id, message.id
                );
                buffer.push(message);
                return MergeOutcome::BufferedUnknownChat;
            }

            self.merge_known_chat(&mut state, message)
        };

        self.emit_list_updated();
        outcome
    }

    /// 已知会话的合并路径（调用前必须已完成去重标记）
    fn merge_known_chat(&self, state: &mut ReconcilerState, message: Message) -> MergeOutcome {
        let chat_id = message.chat_id;
        let message_id = message.id;

        // 无论活跃与否都更新 last_message 并重排
        if let Some(chat) = state.chats.iter_mut().find(|c| c.id == chat_id) {
            chat.updated_at = chat.updated_at.max(message.created_at);
            chat.last_message = Some(message.clone());
        }
        Self::sort_chats(&mut state.chats);

        let active = self.unread.active_chat() == Some(chat_id);
        if active {
            // 追加到可见消息序列
            state.messages.entry(chat_id).or_default().push(message);
            let _ = self.events_tx.send(SyncEvent::MessageAppended {
                chat_id,
                message_id,
            });
            MergeOutcome::AppliedActive
        } else {
            self.unread.increment(chat_id);
            MergeOutcome::AppliedInactive
        }
    }

    /// 用 REST 拉到的消息列表替换某会话的消息序列
    pub fn set_messages(&self, chat_id: u64, messages: Vec<Message>) {
        let mut state = self.state.write();
        for msg in &messages {
            state.dedup.mark(chat_id, msg.id);
        }
        state.messages.insert(chat_id, messages);
    }

    /// 新建/更新单个会话（create_chat 成功后调用）
    ///
    /// 同样会触发该会话缓冲消息的重放。
    pub fn upsert_chat(&self, chat: Chat) {
        {
            let mut state = self.state.write();
            let chat_id = chat.id;
            match state.chats.iter_mut().find(|c| c.id == chat_id) {
                Some(existing) => *existing = chat,
                None => state.chats.push(chat),
            }
            Self::sort_chats(&mut state.chats);

            if let Some(buffered) = state.pending_unknown.remove(&chat_id) {
                info!("会话 {} 已就绪，重放缓冲的 {} 条消息", chat_id, buffered.len());
                for msg in buffered {
                    self.merge_known_chat(&mut state, msg);
                }
            }
        }
        self.emit_list_updated();
    }

    /// 已读回执落地（单调：一旦已读永不回退）
    ///
    /// 返回是否发生了状态变化。
    pub fn mark_message_read(&self, chat_id: u64, message_id: u64, read_at: i64) -> bool {
        let changed = {
            let mut state = self.state.write();
            let mut changed = false;

            if let Some(messages) = state.messages.get_mut(&chat_id) {
                if let Some(msg) = messages.iter_mut().find(|m| m.id == message_id) {
                    if !msg.is_read {
                        msg.is_read = true;
                        msg.read_at = Some(read_at);
                        changed = true;
                    }
                }
            }
            // last_message 是按值保存的副本，需要一并更新
            if let Some(chat) = state.chats.iter_mut().find(|c| c.id == chat_id) {
                if let Some(last) = chat.last_message.as_mut() {
                    if last.id == message_id && !last.is_read {
                        last.is_read = true;
                        last.read_at = Some(read_at);
                        changed = true;
                    }
                }
            }
            changed
        };

        if changed {
            let _ = self.events_tx.send(SyncEvent::MessageRead {
                chat_id,
                message_id,
                read_at,
            });
        }
        changed
    }

    /// 应用通知动作的命令对象（乐观写入或推送合并）
    ///
    /// 对同一 (action, processed=true) 重复应用是 no-op，不是错误。
    pub fn apply_action_outcome(&self, outcome: &ActionOutcome) {
        let changed = {
            let mut state = self.state.write();
            let mut changed = false;
            for messages in state.messages.values_mut() {
                if let Some(msg) = messages.iter_mut().find(|m| m.id == outcome.message_id) {
                    if !msg.processed {
                        msg.processed = true;
                        msg.action = Some(outcome.action);
                        changed = true;
                    }
                }
            }
            for chat in state.chats.iter_mut() {
                if let Some(last) = chat.last_message.as_mut() {
                    if last.id == outcome.message_id && !last.processed {
                        last.processed = true;
                        last.action = Some(outcome.action);
                        changed = true;
                    }
                }
            }
            changed
        };

        if changed {
            let _ = self.events_tx.send(SyncEvent::NotificationApplied {
                message_id: outcome.message_id,
                action: outcome.action,
            });
        }
    }

    /// 会话列表快照（已按不变式排序）
    pub fn chats(&self) -> Vec<Chat> {
        self.state.read().chats.clone()
    }

    /// 某会话的消息序列快照
    pub fn messages(&self, chat_id: u64) -> Vec<Message> {
        self.state
            .read()
            .messages
            .get(&chat_id)
            .cloned()
            .unwrap_or_default()
    }

    /// 当前缓冲中的未知会话消息总数（观测用）
    pub fn pending_unknown_count(&self) -> usize {
        self.state
            .read()
            .pending_unknown
            .values()
            .map(|v| v.len())
            .sum()
    }

    /// 清空全部状态（登出）
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.chats.clear();
        state.messages.clear();
        state.pending_unknown.clear();
        state.dedup.seen.clear();
    }

    /// 排序不变式：置顶组在前；组内按最近活跃时间降序
    fn sort_chats(chats: &mut [Chat]) {
        chats.sort_by(|a, b| {
            b.is_pinned
                .cmp(&a.is_pinned)
                .then(b.last_activity_at().cmp(&a.last_activity_at()))
        });
    }

    fn emit_list_updated(&self) {
        let _ = self.events_tx.send(SyncEvent::ChatListUpdated {
            timestamp: now_ms(),
        });
    }
}
