//! 会话存储模块

pub mod conversation;
pub mod listener;
pub mod models;

pub use conversation::ConversationStore;
pub use listener::{ConversationListener, EmptyConversationListener};
pub use models::{ConversationMessage, MessageMetadata, MessagePatch, Sender};
