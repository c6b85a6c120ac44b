//! 未读计数与已读回执跟踪
//!
//! 职责：
//! - 维护 chat_id → 未读数 的映射（非负）
//! - 维护活跃会话指针；会话激活时**同步、无条件**清零本地计数（乐观），
//!   服务端 mark-as-read 调用由引擎经节流闸门另行发起
//! - 计数只在这里变更，避免推送与 REST 刷新在同一拍里互相覆盖

use crate::events::{now_ms, SyncEvent};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;
use tracing::debug;

pub struct UnreadTracker {
    active_chat: RwLock<Option<u64>>,
    counters: RwLock<HashMap<u64, u32>>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl UnreadTracker {
    pub fn new(events_tx: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            active_chat: RwLock::new(None),
            counters: RwLock::new(HashMap::new()),
            events_tx,
        }
    }

    /// 激活会话：设置活跃指针并立即清零其未读数
    ///
    /// 本地清零不等待任何网络调用，网络延迟不影响 UI 上的未读角标。
    pub fn mark_chat_active(&self, chat_id: u64) {
        *self.active_chat.write() = Some(chat_id);
        let previous = self.counters.write().insert(chat_id, 0).unwrap_or(0);
        if previous > 0 {
            debug!("会话 {} 激活，未读 {} → 0", chat_id, previous);
        }
        self.emit_changed(chat_id, 0);
    }

    /// 取消活跃会话（离开聊天页）
    pub fn clear_active(&self) {
        *self.active_chat.write() = None;
    }

    pub fn active_chat(&self) -> Option<u64> {
        *self.active_chat.read()
    }

    /// 未读数 +1（非活跃会话收到新消息时由 Reconciler 调用）
    pub fn increment(&self, chat_id: u64) -> u32 {
        let count = {
            let mut counters = self.counters.write();
            let entry = counters.entry(chat_id).or_insert(0);
            *entry += 1;
            *entry
        };
        self.emit_changed(chat_id, count);
        count
    }

    pub fn count(&self, chat_id: u64) -> u32 {
        self.counters.read().get(&chat_id).copied().unwrap_or(0)
    }

    /// 计数快照
    pub fn counters(&self) -> HashMap<u64, u32> {
        self.counters.read().clone()
    }

    /// 只保留快照中仍存在的会话的计数（快照刷新后由 Reconciler 调用）
    pub fn retain(&self, chat_ids: &HashSet<u64>) {
        self.counters.write().retain(|id, _| chat_ids.contains(id));
    }

    /// 清空全部状态（登出）
    pub fn reset(&self) {
        *self.active_chat.write() = None;
        self.counters.write().clear();
    }

    fn emit_changed(&self, chat_id: u64, unread_count: u32) {
        let _ = self.events_tx.send(SyncEvent::UnreadChanged {
            chat_id,
            unread_count,
            timestamp: now_ms(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_tracker() -> UnreadTracker {
        let (tx, _) = broadcast::channel(64);
        UnreadTracker::new(tx)
    }

    #[test]
    fn test_activation_resets_counter_synchronously() {
        let tracker = new_tracker();
        tracker.increment(1);
        tracker.increment(1);
        tracker.increment(1);
        assert_eq!(tracker.count(1), 3);
        assert_eq!(tracker.count(2), 0);

        // 激活后立即为 0，与网络延迟无关
        tracker.mark_chat_active(1);
        assert_eq!(tracker.count(1), 0);
        assert_eq!(tracker.count(2), 0);
        assert_eq!(tracker.active_chat(), Some(1));
    }

    #[test]
    fn test_increment_returns_new_count() {
        let tracker = new_tracker();
        assert_eq!(tracker.increment(7), 1);
        assert_eq!(tracker.increment(7), 2);
    }

    #[test]
    fn test_retain_prunes_absent_chats() {
        let tracker = new_tracker();
        tracker.increment(1);
        tracker.increment(2);

        let keep: HashSet<u64> = [1].into_iter().collect();
        tracker.retain(&keep);

        assert_eq!(tracker.count(1), 1);
        assert_eq!(tracker.count(2), 0);
        assert!(!tracker.counters().contains_key(&2));
    }

    #[tokio::test]
    async fn test_changes_are_broadcast() {
        let (tx, mut rx) = broadcast::channel(64);
        let tracker = UnreadTracker::new(tx);

        tracker.increment(5);
        match rx.recv().await.unwrap() {
            SyncEvent::UnreadChanged {
                chat_id,
                unread_count,
                ..
            } => {
                assert_eq!(chat_id, 5);
                assert_eq!(unread_count, 1);
            }
            other => panic!("期望 UnreadChanged，收到 {:?}", other),
        }
    }
}
