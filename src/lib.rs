pub mod chat;

// 重新导出常用类型，方便外部使用
pub use chat::{
    client::{ChatClient, ClientConfig, ConnectionStatus, Delivery, SkipReason},
    history::{ChatLogDao, HistoryRecorder},
    store::{ConversationListener, ConversationMessage, ConversationStore, Sender},
};
