//! 会话存储监听器回调接口

use crate::chat::store::models::ConversationMessage;
use async_trait::async_trait;

/// 会话存储监听器
///
/// 回调在存储的事件分发任务上按变更顺序依次执行，
/// 实现方应避免长时间阻塞。
#[async_trait]
pub trait ConversationListener: Send + Sync {
    /// 追加了一条消息
    async fn on_message_appended(&self, message: ConversationMessage);

    /// 某条消息被 `update_by_id` 修改，参数为修改后的完整消息
    async fn on_message_updated(&self, message: ConversationMessage);

    /// 消息列表被清空
    async fn on_messages_cleared(&self);

    /// 加载状态变化
    async fn on_loading_changed(&self, loading: bool);

    /// 错误状态变化（`None` 表示已清除）
    async fn on_error_changed(&self, error: Option<String>);
}

/// 空实现（默认监听器）
pub struct EmptyConversationListener;

#[async_trait]
impl ConversationListener for EmptyConversationListener {
    async fn on_message_appended(&self, _message: ConversationMessage) {}
    async fn on_message_updated(&self, _message: ConversationMessage) {}
    async fn on_messages_cleared(&self) {}
    async fn on_loading_changed(&self, _loading: bool) {}
    async fn on_error_changed(&self, _error: Option<String>) {}
}
