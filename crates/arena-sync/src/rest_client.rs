//! REST 协作方客户端
//!
//! 引擎消费的 REST 契约（业务逻辑在服务端，这里只是客户端）：
//!
//! - `GET  /chats`                拉取会话列表
//! - `GET  /chats/:id/messages`   拉取会话消息
//! - `POST /chats/:id/read`       上报整会话已读
//! - `GET  /chats/:id/info`       拉取会话详情
//! - `POST /chats`                创建会话
//! - `POST /notifications/:id/{accept|decline}` 通知动作
//!
//! 全部请求带 Bearer 令牌；非 2xx 响应尽量取出服务端的 message 字段，
//! 取不到时退回通用文案。

use crate::error::{Result, SyncError};
use crate::models::{ActionKind, Chat, ChatInfo, Message};
use crate::notification::ActionSubmitter;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// REST 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// REST 基础 URL（如 https://api.example.com）
    pub base_url: String,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

/// 会话数据 REST 协作方接口（可注入测试替身）
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_chats(&self) -> Result<Vec<Chat>>;
    async fn fetch_messages(&self, chat_id: u64) -> Result<Vec<Message>>;
    async fn mark_read(&self, chat_id: u64) -> Result<()>;
    async fn chat_info(&self, chat_id: u64) -> Result<ChatInfo>;
    async fn create_chat(&self, name: &str) -> Result<Chat>;
}

/// 从错误响应体里提取服务端给的 message，取不到退回状态行文案
fn extract_server_message(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
        if let Some(error) = value.get("error").and_then(|m| m.as_str()) {
            return error.to_string();
        }
    }
    if body.trim().is_empty() {
        format!("请求失败（HTTP {}）", status)
    } else {
        body.trim().to_string()
    }
}

/// 基于 reqwest 的 REST 客户端
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    /// 会话令牌（由外部认证协作方提供，可在刷新后更新）
    token: RwLock<String>,
}

impl RestClient {
    pub fn new(config: &RestConfig, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        info!("REST 客户端已创建 (base_url: {})", base_url);
        Ok(Self {
            client,
            base_url,
            token: RwLock::new(token.into()),
        })
    }

    /// 更新会话令牌（令牌刷新后调用）
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = token.into();
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(&self) -> String {
        self.token.read().clone()
    }

    /// 统一的响应检查：非 2xx 转为携带服务端 message 的请求错误
    async fn check<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = extract_server_message(status.as_u16(), &body);
            debug!("REST 请求失败: HTTP {} - {}", status, message);
            return Err(SyncError::Request {
                status: Some(status.as_u16()),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::JsonError(format!("解析响应失败: {}", e)))
    }

    async fn check_empty(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = extract_server_message(status.as_u16(), &body);
            return Err(SyncError::Request {
                status: Some(status.as_u16()),
                message,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatApi for RestClient {
    async fn fetch_chats(&self) -> Result<Vec<Chat>> {
        let response = self
            .client
            .get(self.url("/chats"))
            .bearer_auth(self.bearer())
            .send()
            .await?;
        Self::check(response).await
    }

    async fn fetch_messages(&self, chat_id: u64) -> Result<Vec<Message>> {
        let response = self
            .client
            .get(self.url(&format!("/chats/{}/messages", chat_id)))
            .bearer_auth(self.bearer())
            .send()
            .await?;
        Self::check(response).await
    }

    async fn mark_read(&self, chat_id: u64) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/chats/{}/read", chat_id)))
            .bearer_auth(self.bearer())
            .json(&serde_json::json!({}))
            .send()
            .await?;
        Self::check_empty(response).await
    }

    async fn chat_info(&self, chat_id: u64) -> Result<ChatInfo> {
        let response = self
            .client
            .get(self.url(&format!("/chats/{}/info", chat_id)))
            .bearer_auth(self.bearer())
            .send()
            .await?;
        Self::check(response).await
    }

    async fn create_chat(&self, name: &str) -> Result<Chat> {
        let response = self
            .client
            .post(self.url("/chats"))
            .bearer_auth(self.bearer())
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        Self::check(response).await
    }
}

#[async_trait]
impl ActionSubmitter for RestClient {
    async fn submit_action(&self, message_id: u64, kind: ActionKind) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/notifications/{}/{}", message_id, kind)))
            .bearer_auth(self.bearer())
            .json(&serde_json::json!({}))
            .send()
            .await?;
        Self::check_empty(response).await
    }
}
