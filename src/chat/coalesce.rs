//! 回复片段聚合缓冲
//!
//! 服务端把一条回复拆成多个 `message` 帧推送，客户端在静默期结束后
//! 一次性提交为一条助手消息。

use crate::chat::store::{ConversationMessage, MessageMetadata};
use serde_json::Value;

#[derive(Debug, Default)]
pub struct ReplyBuffer {
    content: String,
    metadata: MessageMetadata,
}

impl ReplyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个片段，intent/data 逐字段覆盖
    pub fn push(&mut self, content: Option<&str>, intent: Option<String>, data: Option<Value>) {
        if let Some(content) = content {
            self.content.push_str(content);
        }
        self.metadata.merge(intent, data);
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// 静默期结束时调用
    ///
    /// 有内容时取出为一条助手消息并重置缓冲；没有内容时不提交，
    /// 已收到的元数据保留给后续片段。
    pub fn take(&mut self) -> Option<ConversationMessage> {
        if self.content.is_empty() {
            return None;
        }
        let content = std::mem::take(&mut self.content);
        let metadata = std::mem::take(&mut self.metadata);
        Some(ConversationMessage::assistant(content, metadata.into_option()))
    }

    /// 丢弃未提交的内容，返回丢弃的字节数
    pub fn discard(&mut self) -> usize {
        let dropped = self.content.len();
        self.content.clear();
        self.metadata = MessageMetadata::default();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::store::Sender;
    use serde_json::json;

    #[test]
    fn fragments_join_into_one_message() {
        let mut buffer = ReplyBuffer::new();
        buffer.push(Some("Hel"), None, None);
        buffer.push(Some("lo"), Some("greet".into()), None);
        buffer.push(Some(" there"), None, Some(json!({"lang": "en"})));
        assert_eq!(buffer.len(), "Hello there".len());

        let msg = buffer.take().unwrap();
        assert_eq!(msg.sender, Sender::Assistant);
        assert_eq!(msg.content, "Hello there");
        let meta = msg.metadata.unwrap();
        assert_eq!(meta.intent.as_deref(), Some("greet"));
        assert_eq!(meta.data, Some(json!({"lang": "en"})));
        assert!(buffer.is_empty());
        assert!(buffer.take().is_none());
    }

    #[test]
    fn reply_without_metadata_commits_with_none() {
        let mut buffer = ReplyBuffer::new();
        buffer.push(Some("ok"), None, None);
        assert!(buffer.take().unwrap().metadata.is_none());
    }

    #[test]
    fn metadata_only_fragment_waits_for_content() {
        let mut buffer = ReplyBuffer::new();
        buffer.push(None, Some("show_tours".into()), None);
        assert!(buffer.take().is_none());

        buffer.push(Some("Here are some tours"), None, None);
        let msg = buffer.take().unwrap();
        assert_eq!(
            msg.metadata.and_then(|m| m.intent).as_deref(),
            Some("show_tours")
        );
    }

    #[test]
    fn discard_clears_everything() {
        let mut buffer = ReplyBuffer::new();
        buffer.push(Some("partial"), Some("x".into()), None);
        assert_eq!(buffer.discard(), 7);
        buffer.push(Some("next"), None, None);
        assert!(buffer.take().unwrap().metadata.is_none());
    }
}
