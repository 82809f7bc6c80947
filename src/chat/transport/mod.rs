//! 传输层
//!
//! 持久连接（WebSocket）与无状态回退通道（HTTP）的抽象，
//! 客户端只依赖这里的 trait，具体实现可替换。

pub mod http;
pub mod ws;

use crate::chat::types::ChatReply;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use http::HttpFallback;
pub use ws::WsConnector;

/// 持久连接上收到的事件
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// 文本帧
    Text(String),
    /// 连接已关闭（正常关闭或出错）
    Closed { reason: Option<String> },
}

/// 一条已打开的持久连接
///
/// 出站文本经 `outbound` 写入，入站事件从 `inbound` 读取。
/// 丢弃 `SocketLink` 即关闭连接。
pub struct SocketLink {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SocketLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<SocketEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// 发送一帧文本（不等待写出）
    pub fn send_text(&self, text: String) -> Result<()> {
        self.outbound
            .send(text)
            .map_err(|_| anyhow::anyhow!("连接写入端已关闭"))
    }

    /// 等待下一个入站事件，事件通道结束视为连接关闭
    pub async fn next_event(&mut self) -> SocketEvent {
        self.inbound
            .recv()
            .await
            .unwrap_or(SocketEvent::Closed { reason: None })
    }
}

/// 持久连接建立器
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// 打开到 `url` 的连接
    async fn open(&self, url: &str) -> Result<SocketLink>;
}

/// 无状态请求/响应回退通道
#[async_trait]
pub trait FallbackChannel: Send + Sync {
    /// 发送一条消息并等待完整回复
    ///
    /// `Ok(None)` 表示服务端未返回回复数据。
    async fn ask(&self, message: &str) -> Result<Option<ChatReply>>;
}
