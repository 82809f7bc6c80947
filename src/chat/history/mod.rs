//! 会话历史持久化
//!
//! 把会话存储的变更镜像到 SQLite，启动时可以恢复上次的对话。

pub mod dao;
pub mod recorder;

pub use dao::ChatLogDao;
pub use recorder::HistoryRecorder;
