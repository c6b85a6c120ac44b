//! 事件系统模块 - 推送通道事件与引擎侧事件
//!
//! 分三类：
//! - `PushEvent`：服务端 → 客户端的推送事件（线上负载形状必须保持）
//! - `ClientEvent`：客户端 → 服务端的发射事件（房间成员、发消息、已读）
//! - `SyncEvent`：引擎 → UI 层的本地状态变更广播

use crate::models::{ActionKind, Message, MessageKind};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// 当前 UTC 毫秒时间戳
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// 赛事更新元数据（服务端以 `_metadata.updateType` 下发）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TournamentUpdateMetadata {
    #[serde(rename = "updateType")]
    pub update_type: String,
}

/// 赛事更新负载
///
/// 服务端在不同路径下发的 ID 字段不统一（`tournamentId` 或 `id`），
/// 这里用 alias 统一吸收。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TournamentUpdatePayload {
    #[serde(rename = "tournamentId", alias = "id")]
    pub tournament_id: u64,
    #[serde(rename = "_metadata")]
    pub metadata: TournamentUpdateMetadata,
    /// 其余业务字段原样透传，引擎不解释
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// 服务端推送事件（push channel，server → client）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PushEvent {
    /// 新消息
    #[serde(rename = "new_message")]
    NewMessage(Message),
    /// 已读回执回显
    #[serde(rename = "read_status")]
    ReadStatus {
        chat_id: u64,
        message_id: u64,
        read_at: i64,
    },
    /// 赛事频道广播消息
    #[serde(rename = "tournament_message")]
    TournamentMessage {
        #[serde(rename = "tournamentId")]
        tournament_id: u64,
        content: String,
    },
    /// 赛事状态更新
    #[serde(rename = "tournament_updated")]
    TournamentUpdated(TournamentUpdatePayload),
    /// 通知动作结果（accept/decline 之后服务端广播）
    #[serde(rename = "notification_update")]
    NotificationUpdate {
        id: u64,
        action: ActionKind,
        processed: bool,
    },
}

impl PushEvent {
    /// 获取事件类型字符串（分发器的订阅键）
    pub fn event_type(&self) -> &'static str {
        match self {
            PushEvent::NewMessage(_) => "new_message",
            PushEvent::ReadStatus { .. } => "read_status",
            PushEvent::TournamentMessage { .. } => "tournament_message",
            PushEvent::TournamentUpdated(_) => "tournament_updated",
            PushEvent::NotificationUpdate { .. } => "notification_update",
        }
    }
}

/// 客户端发射事件（client → server）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// 加入赛事房间
    #[serde(rename = "join_tournament")]
    JoinTournament {
        #[serde(rename = "tournamentId")]
        tournament_id: u64,
    },
    /// 退出赛事房间
    #[serde(rename = "leave_tournament")]
    LeaveTournament {
        #[serde(rename = "tournamentId")]
        tournament_id: u64,
    },
    /// 加入会话房间
    #[serde(rename = "join_chat")]
    JoinChat {
        #[serde(rename = "chatId")]
        chat_id: u64,
    },
    /// 发送消息
    #[serde(rename = "send_message")]
    SendMessage {
        #[serde(rename = "chatId")]
        chat_id: u64,
        content: String,
        #[serde(rename = "type")]
        kind: MessageKind,
    },
    /// 上报已读
    #[serde(rename = "read_status")]
    ReadStatus { message_id: u64 },
}

impl ClientEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::JoinTournament { .. } => "join_tournament",
            ClientEvent::LeaveTournament { .. } => "leave_tournament",
            ClientEvent::JoinChat { .. } => "join_chat",
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::ReadStatus { .. } => "read_status",
        }
    }
}

/// 引擎侧事件（广播给 UI 层）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 会话列表已重排/更新
    ChatListUpdated { timestamp: i64 },
    /// 活跃会话追加了一条可见消息
    MessageAppended { chat_id: u64, message_id: u64 },
    /// 某会话未读数变更
    UnreadChanged {
        chat_id: u64,
        unread_count: u32,
        timestamp: i64,
    },
    /// 消息已读状态落地（回显确认后）
    MessageRead {
        chat_id: u64,
        message_id: u64,
        read_at: i64,
    },
    /// 通知动作已进入终态
    NotificationApplied {
        message_id: u64,
        action: ActionKind,
    },
    /// 赛事广播（透传给 UI）
    TournamentMessage {
        tournament_id: u64,
        content: String,
    },
    /// 赛事状态更新（透传给 UI）
    TournamentUpdated {
        tournament_id: u64,
        update_type: String,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ChatListUpdated { .. } => "chat_list_updated",
            SyncEvent::MessageAppended { .. } => "message_appended",
            SyncEvent::UnreadChanged { .. } => "unread_changed",
            SyncEvent::MessageRead { .. } => "message_read",
            SyncEvent::NotificationApplied { .. } => "notification_applied",
            SyncEvent::TournamentMessage { .. } => "tournament_message",
            SyncEvent::TournamentUpdated { .. } => "tournament_updated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_event_wire_shape() {
        let json = r#"{"event":"read_status","data":{"chat_id":1,"message_id":42,"read_at":1700000000000}}"#;
        let event: PushEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type(), "read_status");
        match event {
            PushEvent::ReadStatus {
                chat_id,
                message_id,
                read_at,
            } => {
                assert_eq!(chat_id, 1);
                assert_eq!(message_id, 42);
                assert_eq!(read_at, 1_700_000_000_000);
            }
            _ => panic!("期望 read_status 事件"),
        }
    }

    #[test]
    fn test_tournament_updated_id_alias() {
        // 服务端两种 ID 字段都必须能解析
        let a: PushEvent = serde_json::from_str(
            r#"{"event":"tournament_updated","data":{"tournamentId":9,"_metadata":{"updateType":"bracket"}}}"#,
        )
        .unwrap();
        let b: PushEvent = serde_json::from_str(
            r#"{"event":"tournament_updated","data":{"id":9,"_metadata":{"updateType":"bracket"}}}"#,
        )
        .unwrap();
        for event in [a, b] {
            match event {
                PushEvent::TournamentUpdated(payload) => {
                    assert_eq!(payload.tournament_id, 9);
                    assert_eq!(payload.metadata.update_type, "bracket");
                }
                _ => panic!("期望 tournament_updated 事件"),
            }
        }
    }

    #[test]
    fn test_client_event_serialize() {
        let event = ClientEvent::SendMessage {
            chat_id: 3,
            content: "gg".to_string(),
            kind: MessageKind::Text,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "send_message");
        assert_eq!(json["data"]["chatId"], 3);
        assert_eq!(json["data"]["type"], "text");

        let event = ClientEvent::JoinChat { chat_id: 5 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["data"]["chatId"], 5);
    }

    #[test]
    fn test_notification_update_roundtrip() {
        let json = r#"{"event":"notification_update","data":{"id":7,"action":"accept","processed":true}}"#;
        let event: PushEvent = serde_json::from_str(json).unwrap();
        match event {
            PushEvent::NotificationUpdate {
                id,
                action,
                processed,
            } => {
                assert_eq!(id, 7);
                assert_eq!(action, ActionKind::Accept);
                assert!(processed);
            }
            _ => panic!("期望 notification_update 事件"),
        }
    }
}
