//! 通知动作处理器 - 交互式/公告消息的 accept / decline
//!
//! 每个目标消息一台状态机：`pending → applied`（成功终态）或
//! `pending → failed → 可再次操作`（可重试）。
//!
//! 幂等保障：目标已是 `applied` 时，重复提交在**发起任何网络调用之前**
//! 就被拒绝——连点、重复事件投递都只会产生一次网络请求。
//!
//! 乐观更新走命令对象（`ActionOutcome`）：处理器返回命令，
//! 由调用方交给 Reconciler 应用，UI 层不直接改引擎状态。

use crate::error::{Result, SyncError};
use crate::models::ActionKind;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 动作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    /// 请求已发出，等待结果
    Pending,
    /// 已成功应用（终态，之后的提交全部拒绝）
    Applied,
    /// 上次失败，可再次操作
    Failed,
}

/// 动作结果命令对象
///
/// 成功（乐观）或推送合并后产出；由 Reconciler 写入消息元数据。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionOutcome {
    pub message_id: u64,
    pub action: ActionKind,
    pub processed: bool,
}

/// 动作提交协作方（REST accept/decline 端点）
#[async_trait]
pub trait ActionSubmitter: Send + Sync {
    async fn submit_action(&self, message_id: u64, kind: ActionKind) -> Result<()>;
}

/// 处理器统计信息
#[derive(Debug, Clone, Default)]
pub struct NotificationStats {
    pub submitted: u64,
    pub applied: u64,
    pub failed: u64,
    pub conflicts_rejected: u64,
}

/// 通知动作处理器
pub struct NotificationProcessor {
    states: RwLock<HashMap<u64, ActionStatus>>,
    submitter: Arc<dyn ActionSubmitter>,
    stats: RwLock<NotificationStats>,
}

impl NotificationProcessor {
    pub fn new(submitter: Arc<dyn ActionSubmitter>) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            submitter,
            stats: RwLock::new(NotificationStats::default()),
        }
    }

    /// 提交动作
    ///
    /// 返回：
    /// - Ok(ActionOutcome) - 成功，调用方把命令对象交给 Reconciler
    /// - Err(ActionConflict) - 目标已处理或请求在途（良性拒绝，无网络调用）
    /// - Err(Request) - 服务端拒绝，目标回到可操作状态
    pub async fn submit_action(&self, message_id: u64, kind: ActionKind) -> Result<ActionOutcome> {
        {
            let mut states = self.states.write();
            match states.get(&message_id) {
                Some(ActionStatus::Applied) => {
                    self.stats.write().conflicts_rejected += 1;
                    debug!("拒绝重复动作: 消息 {} 已处理", message_id);
                    return Err(SyncError::ActionConflict(format!(
                        "消息 {} 已处理过",
                        message_id
                    )));
                }
                Some(ActionStatus::Pending) => {
                    self.stats.write().conflicts_rejected += 1;
                    debug!("拒绝重复动作: 消息 {} 的请求仍在途", message_id);
                    return Err(SyncError::ActionConflict(format!(
                        "消息 {} 的请求仍在途",
                        message_id
                    )));
                }
                _ => {}
            }
            states.insert(message_id, ActionStatus::Pending);
        }
        self.stats.write().submitted += 1;

        match self.submitter.submit_action(message_id, kind).await {
            Ok(()) => {
                self.states.write().insert(message_id, ActionStatus::Applied);
                self.stats.write().applied += 1;
                info!("通知动作已应用: message={} action={}", message_id, kind);
                Ok(ActionOutcome {
                    message_id,
                    action: kind,
                    processed: true,
                })
            }
            Err(e) => {
                // 失败回到可操作状态，不写消息元数据
                self.states.write().insert(message_id, ActionStatus::Failed);
                self.stats.write().failed += 1;
                warn!("通知动作失败: message={} action={}: {}", message_id, kind, e);
                Err(e)
            }
        }
    }

    /// 合并服务端推送的 notification_update
    ///
    /// 本地乐观应用之后到达的同一目标回显是 no-op；
    /// 仅当推送带来新的终态时返回命令对象供 Reconciler 应用。
    pub fn merge_push_update(
        &self,
        message_id: u64,
        action: ActionKind,
        processed: bool,
    ) -> Option<ActionOutcome> {
        if !processed {
            return None;
        }
        let mut states = self.states.write();
        if states.get(&message_id) == Some(&ActionStatus::Applied) {
            debug!("推送回显与本地终态一致，忽略: message={}", message_id);
            return None;
        }
        states.insert(message_id, ActionStatus::Applied);
        info!(
            "推送确定通知终态: message={} action={}",
            message_id, action
        );
        Some(ActionOutcome {
            message_id,
            action,
            processed: true,
        })
    }

    /// 某目标当前状态
    pub fn status(&self, message_id: u64) -> Option<ActionStatus> {
        self.states.read().get(&message_id).copied()
    }

    /// 获取统计信息
    pub fn stats(&self) -> NotificationStats {
        self.stats.read().clone()
    }

    /// 清空全部状态（登出）
    pub fn reset(&self) {
        self.states.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 测试用提交替身：统计调用次数，可配置失败
    struct MockSubmitter {
        calls: AtomicUsize,
        fail_next: AtomicUsize,
    }

    impl MockSubmitter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_next: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ActionSubmitter for MockSubmitter {
        async fn submit_action(&self, _message_id: u64, _kind: ActionKind) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
                return Err(SyncError::Request {
                    status: Some(500),
                    message: "模拟服务端错误".to_string(),
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_idempotent_submit_single_network_call() {
        let submitter = MockSubmitter::new();
        let processor = NotificationProcessor::new(submitter.clone());

        let outcome = processor.submit_action(42, ActionKind::Accept).await.unwrap();
        assert!(outcome.processed);
        assert_eq!(outcome.action, ActionKind::Accept);

        // 第二次提交在网络调用前被拒绝
        let result = processor.submit_action(42, ActionKind::Accept).await;
        assert!(matches!(result, Err(SyncError::ActionConflict(_))));
        assert!(result.unwrap_err().is_benign());

        assert_eq!(submitter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(processor.status(42), Some(ActionStatus::Applied));
        assert_eq!(processor.stats().conflicts_rejected, 1);
    }

    #[tokio::test]
    async fn test_failure_is_retryable() {
        let submitter = MockSubmitter::new();
        submitter.fail_next.store(1, Ordering::SeqCst);
        let processor = NotificationProcessor::new(submitter.clone());

        let result = processor.submit_action(7, ActionKind::Decline).await;
        assert!(matches!(result, Err(SyncError::Request { .. })));
        assert_eq!(processor.status(7), Some(ActionStatus::Failed));

        // 失败后可以重试，重试成功进入终态
        let outcome = processor.submit_action(7, ActionKind::Decline).await.unwrap();
        assert_eq!(outcome.action, ActionKind::Decline);
        assert_eq!(processor.status(7), Some(ActionStatus::Applied));
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_push_merge_after_local_apply_is_noop() {
        let submitter = MockSubmitter::new();
        let processor = NotificationProcessor::new(submitter.clone());

        processor.submit_action(42, ActionKind::Accept).await.unwrap();
        // 同一目标的推送回显：幂等合并，无新命令
        assert!(processor
            .merge_push_update(42, ActionKind::Accept, true)
            .is_none());
    }

    #[tokio::test]
    async fn test_push_merge_establishes_terminal_state() {
        let submitter = MockSubmitter::new();
        let processor = NotificationProcessor::new(submitter.clone());

        // 另一端处理了该通知，本地先收到推送
        let outcome = processor
            .merge_push_update(9, ActionKind::Decline, true)
            .unwrap();
        assert_eq!(outcome.message_id, 9);
        assert_eq!(processor.status(9), Some(ActionStatus::Applied));

        // 之后的本地提交被幂等拒绝，不打网络
        let result = processor.submit_action(9, ActionKind::Decline).await;
        assert!(matches!(result, Err(SyncError::ActionConflict(_))));
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unprocessed_push_is_ignored() {
        let submitter = MockSubmitter::new();
        let processor = NotificationProcessor::new(submitter.clone());
        assert!(processor
            .merge_push_update(5, ActionKind::Accept, false)
            .is_none());
        assert_eq!(processor.status(5), None);
    }
}
