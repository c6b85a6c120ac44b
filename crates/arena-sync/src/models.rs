//! 数据模型 - 会话、消息与通知动作
//!
//! 本模块只定义纯数据结构；全部变更必须经由 Reconciler / UnreadTracker，
//! 其它组件不得直接改写共享状态。

use serde::{Deserialize, Serialize};

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// 普通文本消息
    Text,
    /// 系统消息（入群、改名等）
    System,
    /// 公告/交互式通知消息（可 accept / decline）
    Interactive,
    /// 赛事广播消息
    Tournament,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

/// 通知动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Accept,
    Decline,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Accept => write!(f, "accept"),
            ActionKind::Decline => write!(f, "decline"),
        }
    }
}

/// 消息实体
///
/// 创建后除已读状态（is_read/read_at，单向 false→true）与
/// 通知元数据（processed/action，由动作处理器的命令对象写入）外不可变。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// 消息 ID（会话内唯一）
    pub id: u64,
    /// 所属会话 ID
    pub chat_id: u64,
    /// 发送者 ID
    pub sender_id: u64,
    /// 消息类型
    #[serde(default)]
    pub kind: MessageKind,
    /// 消息内容
    pub content: String,
    /// 创建时间（UTC 毫秒时间戳）
    pub created_at: i64,
    /// 是否已读（单调：一旦 true 永不回退）
    #[serde(default)]
    pub is_read: bool,
    /// 已读时间（UTC 毫秒时间戳）
    #[serde(default)]
    pub read_at: Option<i64>,
    /// 通知是否已被处理（accept/decline 之后为 true）
    #[serde(default)]
    pub processed: bool,
    /// 已执行的通知动作
    #[serde(default)]
    pub action: Option<ActionKind>,
}

/// 会话实体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    /// 会话 ID（唯一且稳定）
    pub id: u64,
    /// 会话名称
    pub name: String,
    /// 最后一条消息（按值保存，可为空）
    #[serde(default)]
    pub last_message: Option<Message>,
    /// 是否置顶
    #[serde(default)]
    pub is_pinned: bool,
    /// 是否免打扰
    #[serde(default)]
    pub is_muted: bool,
    /// 更新时间（UTC 毫秒时间戳）
    pub updated_at: i64,
}

impl Chat {
    /// 会话的最近活跃时间：优先取最后一条消息的创建时间
    ///
    /// 会话列表排序键：置顶组在前，组内按此值降序。
    pub fn last_activity_at(&self) -> i64 {
        self.last_message
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or(self.updated_at)
    }
}

/// 会话详情（GET /chats/:id/info 返回）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub member_count: u32,
    #[serde(default)]
    pub topic: Option<String>,
}
