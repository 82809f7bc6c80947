pub mod client;
pub mod coalesce;
pub mod driver;
pub mod history;
pub mod reconnect;
pub mod serialization;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// 重新导出客户端相关类型
pub use client::{ChatClient, ClientConfig, ConnectionStatus, Delivery, SkipReason};

// 重新导出会话存储相关类型
pub use store::{
    ConversationListener, ConversationMessage, ConversationStore, EmptyConversationListener,
    MessageMetadata, MessagePatch, Sender,
};
