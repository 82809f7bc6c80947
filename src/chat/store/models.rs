//! 会话消息模型定义

use crate::chat::serialization::generate_msg_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息发送方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sender {
    #[serde(rename = "user")]
    User,
    /// 助手回复，线上名称沿用聊天挂件的 `bot`
    #[serde(rename = "bot")]
    Assistant,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Assistant => "bot",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Sender::User),
            "bot" | "assistant" => Some(Sender::Assistant),
            _ => None,
        }
    }
}

/// 助手消息附带的结构化信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl MessageMetadata {
    pub fn new(intent: Option<String>, data: Option<Value>) -> Self {
        Self { intent, data }
    }

    pub fn is_empty(&self) -> bool {
        self.intent.is_none() && self.data.is_none()
    }

    /// 逐字段合并，后到的值覆盖先前的值
    ///
    /// 空字符串 intent 与 `null` data 视为未携带。
    pub fn merge(&mut self, intent: Option<String>, data: Option<Value>) {
        if let Some(intent) = intent.filter(|i| !i.is_empty()) {
            self.intent = Some(intent);
        }
        if let Some(data) = data.filter(|d| !d.is_null()) {
            self.data = Some(data);
        }
    }

    /// 空元数据折叠为 `None`
    pub fn into_option(self) -> Option<Self> {
        if self.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

/// 会话消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub sender: Sender,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl ConversationMessage {
    /// 用户消息（发送时立即创建）
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: generate_msg_id(),
            sender: Sender::User,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    /// 助手消息（聚合窗口关闭或 HTTP 回复到达时创建）
    pub fn assistant(content: impl Into<String>, metadata: Option<MessageMetadata>) -> Self {
        Self {
            id: generate_msg_id(),
            sender: Sender::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.sender == Sender::Assistant
    }
}

/// `update_by_id` 使用的局部更新
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub metadata: Option<MessageMetadata>,
}

impl MessagePatch {
    pub fn metadata(metadata: MessageMetadata) -> Self {
        Self {
            content: None,
            metadata: Some(metadata),
        }
    }

    pub(crate) fn apply(self, message: &mut ConversationMessage) {
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(metadata) = self.metadata {
            message.metadata = metadata.into_option();
        }
    }
}
