//! 事件分发器 - 推送事件的类型化订阅/退订注册表
//!
//! 叠在传输句柄之上，保证同一 (事件, 逻辑处理器) 至多一个活跃绑定：
//! 热重载/组件重挂载后重复调用 `on` 不会造成每个推送被处理两次。
//!
//! 投递顺序：同一事件名下的处理器按注册顺序触发；
//! 不同事件名之间只依赖传输层单连接的 FIFO，不做额外保证。

use crate::events::PushEvent;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// 事件处理器
pub type Handler = Arc<dyn Fn(&PushEvent) + Send + Sync>;

/// 单个绑定：(逻辑处理器 ID, 处理器)
struct Binding {
    handler_id: String,
    handler: Handler,
}

/// 分发统计信息
#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    /// 投递的事件总数
    pub events_dispatched: u64,
    /// 按事件类型分组的投递数
    pub events_by_type: HashMap<String, u64>,
    /// 被去重拦截的注册次数
    pub duplicate_registrations: u64,
}

/// 事件分发器（线程安全，可独立于任何传输单测）
pub struct EventDispatcher {
    bindings: RwLock<HashMap<String, Vec<Binding>>>,
    stats: RwLock<DispatcherStats>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            stats: RwLock::new(DispatcherStats::default()),
        }
    }

    /// 注册处理器
    ///
    /// 同一 (event, handler_id) 已存在时不会创建第二个物理绑定。
    /// 返回是否真正新增了绑定。
    pub fn on<F>(&self, event: &str, handler_id: &str, handler: F) -> bool
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let mut bindings = self.bindings.write();
        let entry = bindings.entry(event.to_string()).or_default();

        if entry.iter().any(|b| b.handler_id == handler_id) {
            self.stats.write().duplicate_registrations += 1;
            warn!("重复注册被忽略: event={} handler={}", event, handler_id);
            return false;
        }

        entry.push(Binding {
            handler_id: handler_id.to_string(),
            handler: Arc::new(handler),
        });
        debug!("注册处理器: event={} handler={}", event, handler_id);
        true
    }

    /// 移除绑定
    ///
    /// 精确移除匹配的那一个；移除不存在的绑定是 no-op。
    /// 返回是否真的移除了。
    pub fn off(&self, event: &str, handler_id: &str) -> bool {
        let mut bindings = self.bindings.write();
        let removed = match bindings.get_mut(event) {
            Some(entry) => {
                let before = entry.len();
                entry.retain(|b| b.handler_id != handler_id);
                before != entry.len()
            }
            None => false,
        };
        if removed {
            if bindings.get(event).map(|e| e.is_empty()).unwrap_or(false) {
                bindings.remove(event);
            }
            debug!("移除处理器: event={} handler={}", event, handler_id);
        }
        removed
    }

    /// 移除某个所有者的全部绑定（handler_id 前缀匹配）
    ///
    /// 传输句柄 disconnect 时用它清掉自己名下的订阅。
    pub fn clear_owner(&self, owner_prefix: &str) {
        let mut bindings = self.bindings.write();
        for entry in bindings.values_mut() {
            entry.retain(|b| !b.handler_id.starts_with(owner_prefix));
        }
        bindings.retain(|_, entry| !entry.is_empty());
        debug!("已清除所有者订阅: prefix={}", owner_prefix);
    }

    /// 清空全部绑定
    pub fn clear(&self) {
        self.bindings.write().clear();
        debug!("分发器已清空");
    }

    /// 投递一个推送事件
    ///
    /// 同步调用全部匹配处理器（按注册顺序）；处理器不得 panic 回传。
    pub fn dispatch(&self, event: &PushEvent) {
        let handlers: Vec<Handler> = {
            let bindings = self.bindings.read();
            match bindings.get(event.event_type()) {
                Some(entry) => entry.iter().map(|b| b.handler.clone()).collect(),
                None => Vec::new(),
            }
        };

        {
            let mut stats = self.stats.write();
            stats.events_dispatched += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
        }

        for handler in handlers {
            handler(event);
        }
    }

    /// 当前绑定总数
    pub fn handler_count(&self) -> usize {
        self.bindings.read().values().map(|v| v.len()).sum()
    }

    /// 获取统计信息
    pub fn stats(&self) -> DispatcherStats {
        self.stats.read().clone()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
