//! 传输句柄 - 每个会话恰好一条逻辑连接
//!
//! 功能包括：
//! - 令牌绑定的 connect / disconnect（均幂等）
//! - 非主动断开时的有界指数退避重连（基础 1s，封顶 5s，有限次数）
//! - 重连成功后的房间重加入回调（由持有方注册）
//! - 生命周期事件广播：connect / disconnect / reconnect / error
//!
//! 引擎把底层传输当作不透明的双向事件通道（`Transport` trait），
//! 生产实现（WebSocket/QUIC 等）由平台层注入，测试用内存通道替身。

use crate::dispatcher::EventDispatcher;
use crate::error::{Result, SyncError};
use crate::events::{now_ms, ClientEvent, PushEvent};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// 传输层原始信号（由具体传输实现上报）
#[derive(Debug, Clone)]
pub enum TransportSignal {
    /// 物理连接已建立
    Up,
    /// 物理连接已断开（含原因）
    Down { reason: String },
}

/// 不透明双向事件通道
///
/// 由平台层实现（类似网络状态监听器由 Android/iOS 提供），
/// 引擎只依赖这个 trait。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 建立物理连接（携带会话令牌做认证绑定）
    async fn connect(&self, token: &str) -> Result<()>;

    /// 关闭物理连接
    async fn disconnect(&self) -> Result<()>;

    /// 向服务端发射一个事件
    async fn emit(&self, event: ClientEvent) -> Result<()>;

    /// 订阅服务端推送事件流
    fn incoming(&self) -> broadcast::Receiver<PushEvent>;

    /// 订阅传输层信号（连接建立/断开）
    fn signals(&self) -> broadcast::Receiver<TransportSignal>;
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
    /// 重连中
    Reconnecting,
    /// 重连已放弃（终态，需显式再次 connect）
    ReconnectFailed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "未连接"),
            ConnectionStatus::Connecting => write!(f, "连接中"),
            ConnectionStatus::Connected => write!(f, "已连接"),
            ConnectionStatus::Reconnecting => write!(f, "重连中"),
            ConnectionStatus::ReconnectFailed => write!(f, "重连失败"),
        }
    }
}

/// 生命周期事件（携带原因字符串，供用户侧提示）
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Connected,
    Disconnected { reason: String },
    Error { reason: String },
    Reconnected { attempt: u32 },
    ReconnectFailed { attempts: u32 },
}

/// 重连退避配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// 初始重连间隔（毫秒）
    pub base_ms: u64,
    /// 最大重连间隔（毫秒）
    pub max_ms: u64,
    /// 退避倍数
    pub multiplier: f64,
    /// 最大尝试次数，用尽后进入 ReconnectFailed 终态
    pub max_attempts: u32,
    /// 抖动上限（毫秒），避免大量客户端同一时刻重连
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,  // 初始 1 秒
            max_ms: 5_000,   // 封顶 5 秒
            multiplier: 2.0, // 指数退避：1s → 2s → 4s → 5s 封顶
            max_attempts: 10,
            jitter_ms: 250,
        }
    }
}

/// 重连退避器（指数退避 + 抖动 + 有限次数）
#[derive(Debug)]
pub struct ReconnectBackoff {
    config: BackoffConfig,
    current_ms: u64,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current_ms: config.base_ms,
            attempts: 0,
            config,
        }
    }

    /// 取下一次等待时长；次数用尽返回 None
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;

        let jitter = if self.config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.config.jitter_ms)
        } else {
            0
        };
        let delay = Duration::from_millis(self.current_ms + jitter);

        self.current_ms = ((self.current_ms as f64) * self.config.multiplier) as u64;
        if self.current_ms > self.config.max_ms {
            self.current_ms = self.config.max_ms;
        }
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 重置退避（连接成功后调用）
    pub fn reset(&mut self) {
        self.current_ms = self.config.base_ms;
        self.attempts = 0;
    }
}

/// 连接统计信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// 已发射事件数
    pub messages_sent: u64,
    /// 已接收推送数
    pub messages_received: u64,
    /// 连接建立时间（UTC 毫秒时间戳）
    pub connected_at: Option<i64>,
    /// 最后活动时间（UTC 毫秒时间戳）
    pub last_activity_at: Option<i64>,
}

/// 房间重加入回调（参数为重连尝试序号）
pub type RejoinHook = Arc<dyn Fn(u32) + Send + Sync>;

/// 传输句柄
///
/// 进程内每个会话一个实例，被所有功能模块共享。
pub struct TransportHandle {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<EventDispatcher>,
    status: RwLock<ConnectionStatus>,
    token: RwLock<Option<String>>,
    /// 是否由客户端主动断开（主动断开不触发重连）
    user_disconnect: AtomicBool,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    rejoin_hook: RwLock<Option<RejoinHook>>,
    backoff_config: BackoffConfig,
    connect_timeout: Duration,
    stats: RwLock<ConnectionStats>,
}

impl TransportHandle {
    pub fn new(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<EventDispatcher>,
        backoff_config: BackoffConfig,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let (lifecycle_tx, _) = broadcast::channel(64);
        let handle = Arc::new(Self {
            transport,
            dispatcher,
            status: RwLock::new(ConnectionStatus::Disconnected),
            token: RwLock::new(None),
            user_disconnect: AtomicBool::new(false),
            lifecycle_tx,
            rejoin_hook: RwLock::new(None),
            backoff_config,
            connect_timeout,
            stats: RwLock::new(ConnectionStats::default()),
        });

        // 监听传输层信号，驱动重连
        handle.clone().spawn_signal_watcher();
        handle
    }

    /// 建立连接
    ///
    /// - 已连接/连接中且令牌相同：no-op，直接返回成功
    /// - 令牌为空：发出 Error 生命周期事件后返回成功（静默但可观测）
    pub async fn connect(&self, token: &str) -> Result<()> {
        if token.is_empty() {
            warn!("连接被跳过：会话令牌为空");
            self.emit_lifecycle(LifecycleEvent::Error {
                reason: "缺少会话令牌".to_string(),
            });
            return Ok(());
        }

        {
            let status = *self.status.read();
            let same_token = self.token.read().as_deref() == Some(token);
            if same_token
                && matches!(
                    status,
                    ConnectionStatus::Connected | ConnectionStatus::Connecting
                )
            {
                debug!("连接已存在（相同令牌），跳过");
                return Ok(());
            }
        }

        *self.token.write() = Some(token.to_string());
        self.user_disconnect.store(false, Ordering::SeqCst);
        *self.status.write() = ConnectionStatus::Connecting;

        match tokio::time::timeout(self.connect_timeout, self.transport.connect(token)).await {
            Ok(Ok(())) => {
                *self.status.write() = ConnectionStatus::Connected;
                {
                    let mut stats = self.stats.write();
                    stats.connected_at = Some(now_ms());
                    stats.last_activity_at = Some(now_ms());
                }
                self.emit_lifecycle(LifecycleEvent::Connected);
                info!("连接已建立");
                Ok(())
            }
            Ok(Err(e)) => {
                *self.status.write() = ConnectionStatus::Disconnected;
                self.emit_lifecycle(LifecycleEvent::Error {
                    reason: e.to_string(),
                });
                Err(e)
            }
            Err(_) => {
                *self.status.write() = ConnectionStatus::Disconnected;
                let reason = format!("连接超时（{}ms）", self.connect_timeout.as_millis());
                self.emit_lifecycle(LifecycleEvent::Error {
                    reason: reason.clone(),
                });
                Err(SyncError::Timeout(reason))
            }
        }
    }

    /// 主动断开（幂等）
    ///
    /// 同时清掉分发器里本句柄名下的全部订阅。
    pub async fn disconnect(&self) -> Result<()> {
        if *self.status.read() == ConnectionStatus::Disconnected && self.token.read().is_none() {
            return Ok(());
        }

        self.user_disconnect.store(true, Ordering::SeqCst);
        if let Err(e) = self.transport.disconnect().await {
            debug!("断开底层传输时出错（忽略）: {}", e);
        }
        *self.status.write() = ConnectionStatus::Disconnected;
        *self.token.write() = None;
        {
            let mut stats = self.stats.write();
            stats.connected_at = None;
        }
        self.dispatcher.clear();
        self.emit_lifecycle(LifecycleEvent::Disconnected {
            reason: "客户端主动断开".to_string(),
        });
        info!("连接已断开（客户端主动）");
        Ok(())
    }

    /// 向服务端发射事件
    pub async fn emit(&self, event: ClientEvent) -> Result<()> {
        if *self.status.read() != ConnectionStatus::Connected {
            return Err(SyncError::NotConnected);
        }
        self.transport.emit(event).await?;
        let mut stats = self.stats.write();
        stats.messages_sent += 1;
        stats.last_activity_at = Some(now_ms());
        Ok(())
    }

    /// 订阅服务端推送流
    pub fn incoming(&self) -> broadcast::Receiver<PushEvent> {
        self.transport.incoming()
    }

    /// 订阅生命周期事件
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    /// 注册房间重加入回调（每次重连成功后触发）
    pub fn set_rejoin_hook(&self, hook: RejoinHook) {
        *self.rejoin_hook.write() = Some(hook);
    }

    /// 记录一次接收（由引擎泵在每个推送上调用）
    pub fn note_received(&self) {
        let mut stats = self.stats.write();
        stats.messages_received += 1;
        stats.last_activity_at = Some(now_ms());
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.read().clone()
    }

    /// 生命周期事件只广播，发射路径永不 panic
    fn emit_lifecycle(&self, event: LifecycleEvent) {
        if self.lifecycle_tx.send(event).is_err() {
            debug!("生命周期事件无订阅者，已丢弃");
        }
    }

    fn spawn_signal_watcher(self: Arc<Self>) {
        let mut signals = self.transport.signals();
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(TransportSignal::Up) => {
                        let mut stats = self.stats.write();
                        stats.last_activity_at = Some(now_ms());
                    }
                    Ok(TransportSignal::Down { reason }) => {
                        info!("传输层断开: {}", reason);
                        self.emit_lifecycle(LifecycleEvent::Disconnected {
                            reason: reason.clone(),
                        });
                        if self.user_disconnect.load(Ordering::SeqCst) {
                            *self.status.write() = ConnectionStatus::Disconnected;
                            continue;
                        }
                        self.run_reconnect_loop().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("传输信号滞后，丢失 {} 条", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// 有界退避重连；成功后触发房间重加入回调
    async fn run_reconnect_loop(&self) {
        let token = match self.token.read().clone() {
            Some(t) => t,
            None => return,
        };
        *self.status.write() = ConnectionStatus::Reconnecting;
        let mut backoff = ReconnectBackoff::new(self.backoff_config.clone());

        loop {
            let delay = match backoff.next_delay() {
                Some(d) => d,
                None => {
                    *self.status.write() = ConnectionStatus::ReconnectFailed;
                    error!("重连已放弃（尝试了 {} 次）", backoff.attempts());
                    self.emit_lifecycle(LifecycleEvent::ReconnectFailed {
                        attempts: backoff.attempts(),
                    });
                    return;
                }
            };
            tokio::time::sleep(delay).await;

            // 等待期间用户可能已登出
            if self.user_disconnect.load(Ordering::SeqCst) {
                *self.status.write() = ConnectionStatus::Disconnected;
                return;
            }

            let attempt = backoff.attempts();
            info!("重连尝试 #{}", attempt);
            match self.transport.connect(&token).await {
                Ok(()) => {
                    *self.status.write() = ConnectionStatus::Connected;
                    {
                        let mut stats = self.stats.write();
                        stats.connected_at = Some(now_ms());
                        stats.last_activity_at = Some(now_ms());
                    }
                    info!("重连成功（第 {} 次尝试）", attempt);
                    self.emit_lifecycle(LifecycleEvent::Reconnected { attempt });

                    // 恢复掉线前持有的房间成员身份
                    let hook = self.rejoin_hook.read().clone();
                    if let Some(hook) = hook {
                        hook(attempt);
                    }
                    return;
                }
                Err(e) => {
                    warn!("重连失败（第 {} 次）: {}", attempt, e);
                }
            }
        }
    }
}
