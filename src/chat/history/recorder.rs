//! 把会话存储的变更写入历史库的监听器

use crate::chat::history::dao::ChatLogDao;
use crate::chat::store::{ConversationListener, ConversationMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

/// 历史记录监听器
///
/// 写库失败只记录日志，不影响会话本身。
pub struct HistoryRecorder {
    dao: Arc<ChatLogDao>,
}

impl HistoryRecorder {
    pub fn new(dao: Arc<ChatLogDao>) -> Self {
        Self { dao }
    }
}

#[async_trait]
impl ConversationListener for HistoryRecorder {
    async fn on_message_appended(&self, message: ConversationMessage) {
        if let Err(e) = self.dao.insert(&message).await {
            error!("[History] 写入消息失败 id={}: {:#}", message.id, e);
        }
    }

    async fn on_message_updated(&self, message: ConversationMessage) {
        if let Err(e) = self.dao.update(&message).await {
            error!("[History] 更新消息失败 id={}: {:#}", message.id, e);
        }
    }

    async fn on_messages_cleared(&self) {
        if let Err(e) = self.dao.clear().await {
            error!("[History] 清空历史失败: {:#}", e);
        }
    }

    async fn on_loading_changed(&self, _loading: bool) {}

    async fn on_error_changed(&self, _error: Option<String>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::store::{ConversationStore, MessageMetadata, MessagePatch};
    use std::time::Duration;

    /// 监听器异步落库，轮询直到条件满足
    async fn wait_until(
        dao: &ChatLogDao,
        done: impl Fn(&[ConversationMessage]) -> bool,
    ) -> Vec<ConversationMessage> {
        for _ in 0..200 {
            let rows = dao.load_all().await.unwrap();
            if done(&rows) {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("历史库始终未达到预期状态");
    }

    #[tokio::test]
    async fn mirrors_store_changes_and_restores() {
        let dao = Arc::new(ChatLogDao::new("sqlite::memory:").await.unwrap());
        let store = ConversationStore::new();
        store.add_listener(Arc::new(HistoryRecorder::new(dao.clone())));

        store.append(ConversationMessage::user("Sa Pa mùa nào đẹp?"));
        let answer = ConversationMessage::assistant("Mùa lúa chín", None);
        let answer_id = answer.id.clone();
        store.append(answer);
        store.update_by_id(
            &answer_id,
            MessagePatch::metadata(MessageMetadata::new(Some("season".into()), None)),
        );
        store.set_loading(true);

        let rows = wait_until(&dao, |rows| {
            rows.len() == 2 && rows[1].metadata.is_some()
        })
        .await;
        assert_eq!(rows[0].content, "Sa Pa mùa nào đẹp?");
        assert_eq!(
            rows[1].metadata.as_ref().and_then(|m| m.intent.as_deref()),
            Some("season")
        );

        let restored = ConversationStore::new();
        restored.restore(rows);
        let ids: Vec<_> = restored.messages().into_iter().map(|m| m.id).collect();
        let expected: Vec<_> = store.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, expected);

        store.clear();
        wait_until(&dao, |rows| rows.is_empty()).await;
    }
}
