//! 客户端请求节流模块
//!
//! 本模块提供按操作键的冷却窗口拦截，是服务端限流的客户端侧补充。
//!
//! ## 核心规则
//!
//! `check(key, target)` 在以下任一情况放行并记录本次时间戳：
//!
//! 1. 该操作键从未调用过
//! 2. 距上次放行已超过该键的冷却时间
//! 3. 目标 ID 与上次不同（切换会话必须立即拿到数据，不受冷却限制）
//!
//! 否则拒绝，且**不**更新已记录的时间戳——被拒绝的风暴不会顺延冷却窗口。
//!
//! ## 冷却参数（默认值）
//!
//! | 操作 | 冷却 | 说明 |
//! |------|------|------|
//! | fetch_messages | 300ms | 拉取会话消息 |
//! | mark_as_read | 200ms | 上报已读 |
//! | fetch_user_info | 10s | 拉取会话详情 |
//! | fetch_chats | 1s | 拉取会话列表 |
//! | create_chat | 10s | 创建会话 |
//!
//! 这只是**软性**限流：减少冗余流量，不能替代服务端保护，
//! 调用方仍须处理服务端 429。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// 受节流保护的操作键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKey {
    FetchMessages,
    MarkAsRead,
    FetchUserInfo,
    FetchChats,
    CreateChat,
}

impl std::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKey::FetchMessages => "fetch_messages",
            OperationKey::MarkAsRead => "mark_as_read",
            OperationKey::FetchUserInfo => "fetch_user_info",
            OperationKey::FetchChats => "fetch_chats",
            OperationKey::CreateChat => "create_chat",
        };
        write!(f, "{}", name)
    }
}

/// 冷却时间配置（配置即数据，不写死在代码里）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    /// 拉取消息冷却（毫秒）
    pub fetch_messages_ms: u64,
    /// 标记已读冷却（毫秒）
    pub mark_as_read_ms: u64,
    /// 拉取会话详情冷却（毫秒）
    pub fetch_user_info_ms: u64,
    /// 拉取会话列表冷却（毫秒）
    pub fetch_chats_ms: u64,
    /// 创建会话冷却（毫秒）
    pub create_chat_ms: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            fetch_messages_ms: 300,
            mark_as_read_ms: 200,
            fetch_user_info_ms: 10_000,
            fetch_chats_ms: 1_000,
            create_chat_ms: 10_000,
        }
    }
}

impl CooldownConfig {
    /// 取某个操作键的冷却时长
    pub fn cooldown(&self, key: OperationKey) -> Duration {
        let ms = match key {
            OperationKey::FetchMessages => self.fetch_messages_ms,
            OperationKey::MarkAsRead => self.mark_as_read_ms,
            OperationKey::FetchUserInfo => self.fetch_user_info_ms,
            OperationKey::FetchChats => self.fetch_chats_ms,
            OperationKey::CreateChat => self.create_chat_ms,
        };
        Duration::from_millis(ms)
    }
}

/// 节流拒绝错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum ThrottleError {
    #[error("操作 {operation} 处于冷却中，还需等待 {retry_after:?}")]
    Cooldown {
        operation: OperationKey,
        retry_after: Duration,
    },
}

impl From<ThrottleError> for crate::error::SyncError {
    fn from(error: ThrottleError) -> Self {
        match error {
            ThrottleError::Cooldown {
                operation,
                retry_after,
            } => crate::error::SyncError::Throttled {
                operation: operation.to_string(),
                retry_after_ms: retry_after.as_millis() as u64,
            },
        }
    }
}

/// 单个操作键的记录
#[derive(Debug, Clone)]
struct ThrottleEntry {
    /// 上次放行时间
    last_invocation: Instant,
    /// 上次放行的目标 ID（按目标区分的操作才有值）
    last_target: Option<u64>,
}

/// 节流统计信息
#[derive(Debug, Clone, Default)]
pub struct ThrottleStats {
    pub admitted: u64,
    pub suppressed: u64,
    pub target_switch_bypass: u64,
}

/// 请求节流闸门
///
/// 冷却表是显式持有的 `HashMap<OperationKey, ThrottleEntry>`，
/// 不藏在闭包变量里，可独立单测。
#[derive(Debug)]
pub struct ThrottleGuard {
    config: CooldownConfig,
    entries: RwLock<HashMap<OperationKey, ThrottleEntry>>,
    stats: RwLock<ThrottleStats>,
}

impl ThrottleGuard {
    pub fn new(config: CooldownConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(ThrottleStats::default()),
        }
    }

    /// 检查操作是否放行
    ///
    /// 返回：
    /// - Ok(()) - 放行，并已记录本次时间戳/目标
    /// - Err(ThrottleError::Cooldown) - 拦截，已记录的时间戳保持不变
    pub fn check(&self, key: OperationKey, target: Option<u64>) -> Result<(), ThrottleError> {
        let now = Instant::now();
        let cooldown = self.config.cooldown(key);
        let mut entries = self.entries.write();

        if let Some(entry) = entries.get(&key) {
            let elapsed = now.duration_since(entry.last_invocation);
            let target_switched = target.is_some() && target != entry.last_target;

            if elapsed < cooldown && !target_switched {
                let retry_after = cooldown - elapsed;
                self.stats.write().suppressed += 1;
                debug!(
                    "节流拦截: {} target={:?}，还需等待 {}ms",
                    key,
                    target,
                    retry_after.as_millis()
                );
                return Err(ThrottleError::Cooldown {
                    operation: key,
                    retry_after,
                });
            }

            if target_switched && elapsed < cooldown {
                self.stats.write().target_switch_bypass += 1;
                debug!("目标切换旁路: {} {:?} -> {:?}", key, entry.last_target, target);
            }
        }

        entries.insert(
            key,
            ThrottleEntry {
                last_invocation: now,
                last_target: target,
            },
        );
        self.stats.write().admitted += 1;
        Ok(())
    }

    /// 布尔形式的检查（给不关心等待时长的调用方）
    pub fn can_proceed(&self, key: OperationKey, target: Option<u64>) -> bool {
        self.check(key, target).is_ok()
    }

    /// 清空全部记录（登出时调用）
    pub fn reset(&self) {
        self.entries.write().clear();
        debug!("节流记录已清空");
    }

    /// 获取统计信息
    pub fn stats(&self) -> ThrottleStats {
        self.stats.read().clone()
    }
}

impl Default for ThrottleGuard {
    fn default() -> Self {
        Self::new(CooldownConfig::default())
    }
}
