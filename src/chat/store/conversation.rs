//! 会话存储
//!
//! 有序消息日志加上加载/错误标记。聊天客户端是唯一的写入方，
//! UI 侧通过克隆句柄读取，或注册 [`ConversationListener`] 接收变更。

use crate::chat::store::listener::ConversationListener;
use crate::chat::store::models::{ConversationMessage, MessagePatch};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 存储变更事件（按变更顺序投递给监听器）
#[derive(Debug, Clone)]
enum StoreEvent {
    Appended(ConversationMessage),
    Updated(ConversationMessage),
    Cleared,
    LoadingChanged(bool),
    ErrorChanged(Option<String>),
}

#[derive(Default)]
struct StoreState {
    messages: Vec<ConversationMessage>,
    loading: bool,
    error: Option<String>,
    /// 每次变更递增
    revision: u64,
    subscribers: Vec<mpsc::UnboundedSender<StoreEvent>>,
}

impl StoreState {
    fn emit(&mut self, event: StoreEvent) {
        self.revision += 1;
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// 会话存储句柄，克隆后共享同一份数据
#[derive(Clone, Default)]
pub struct ConversationStore {
    inner: Arc<RwLock<StoreState>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 注册监听器
    ///
    /// 每个监听器拥有独立的分发任务，必须在 tokio 运行时内调用。
    pub fn add_listener(&self, listener: Arc<dyn ConversationListener>) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("[Store] ⚠️ 当前不在 tokio 运行时内，忽略监听器注册");
                return;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.write().subscribers.push(tx);
        handle.spawn(dispatch_events(listener, rx));
    }

    /// 用历史记录预填充消息列表，不通知监听器
    pub fn restore(&self, messages: Vec<ConversationMessage>) {
        let mut state = self.write();
        debug!("[Store] 恢复 {} 条历史消息", messages.len());
        state.messages = messages;
        state.revision += 1;
    }

    /// 追加消息
    pub fn append(&self, message: ConversationMessage) {
        let mut state = self.write();
        debug!(
            "[Store] ➕ 追加消息 id={} sender={}",
            message.id,
            message.sender.as_str()
        );
        state.messages.push(message.clone());
        state.emit(StoreEvent::Appended(message));
    }

    /// 按 ID 局部更新消息，返回是否找到目标
    pub fn update_by_id(&self, id: &str, patch: MessagePatch) -> bool {
        let mut state = self.write();
        let updated = match state.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                patch.apply(message);
                message.clone()
            }
            None => {
                debug!("[Store] 未找到待更新的消息 id={}", id);
                return false;
            }
        };
        state.emit(StoreEvent::Updated(updated));
        true
    }

    /// 清空消息列表与错误状态
    pub fn clear(&self) {
        let mut state = self.write();
        state.messages.clear();
        state.error = None;
        state.emit(StoreEvent::Cleared);
    }

    pub fn set_loading(&self, loading: bool) {
        let mut state = self.write();
        state.loading = loading;
        state.emit(StoreEvent::LoadingChanged(loading));
    }

    pub fn set_error(&self, error: Option<String>) {
        let mut state = self.write();
        state.error = error.clone();
        state.emit(StoreEvent::ErrorChanged(error));
    }

    /// 当前消息列表快照（插入顺序）
    pub fn messages(&self) -> Vec<ConversationMessage> {
        self.read().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().messages.is_empty()
    }

    pub fn is_loading(&self) -> bool {
        self.read().loading
    }

    pub fn error(&self) -> Option<String> {
        self.read().error.clone()
    }

    /// 变更计数，用于判断存储是否被修改过
    pub fn revision(&self) -> u64 {
        self.read().revision
    }
}

async fn dispatch_events(
    listener: Arc<dyn ConversationListener>,
    mut rx: mpsc::UnboundedReceiver<StoreEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            StoreEvent::Appended(message) => listener.on_message_appended(message).await,
            StoreEvent::Updated(message) => listener.on_message_updated(message).await,
            StoreEvent::Cleared => listener.on_messages_cleared().await,
            StoreEvent::LoadingChanged(loading) => listener.on_loading_changed(loading).await,
            StoreEvent::ErrorChanged(error) => listener.on_error_changed(error).await,
        }
    }
}
