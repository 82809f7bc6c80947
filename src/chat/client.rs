//! 聊天传输客户端
//!
//! 对外暴露的句柄。连接状态全部由后台驱动任务（见 [`crate::chat::driver`]）持有，
//! 句柄只负责投递命令、读取状态。

use crate::chat::driver::{ClientEvent, ConnectionDriver};
use crate::chat::reconnect::ReconnectPolicy;
use crate::chat::store::ConversationStore;
use crate::chat::transport::{FallbackChannel, HttpFallback, SocketConnector, WsConnector};
use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// WebSocket 服务地址（不含 `/ws/chat` 路径）
    pub ws_url: String,
    /// HTTP API 基础地址（回退通道请求 `<api_base_url>/chat`）
    pub api_base_url: String,
    /// 回退通道使用的 Bearer token
    pub auth_token: Option<String>,
    /// 回复片段聚合的静默期
    pub quiet_period: Duration,
    /// 首次重连等待时长
    pub reconnect_base: Duration,
    /// 重连等待上限
    pub reconnect_cap: Duration,
    /// 最大重连次数
    pub max_reconnect_attempts: u32,
    /// 协议层心跳间隔
    pub heartbeat_interval: Duration,
    /// HTTP 请求超时
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self {
            ws_url: "ws://localhost:8000".to_string(),
            api_base_url: "http://localhost:8000/api/v1".to_string(),
            auth_token: None,
            quiet_period: Duration::from_millis(500),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(25),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// 默认配置，再用环境变量覆盖
    ///
    /// - `TRAVELBOT_WS_URL`
    /// - `TRAVELBOT_API_URL`
    /// - `TRAVELBOT_AUTH_TOKEN`
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Ok(url) = std::env::var("TRAVELBOT_WS_URL") {
            config.ws_url = url;
        }
        if let Ok(url) = std::env::var("TRAVELBOT_API_URL") {
            config.api_base_url = url;
        }
        if let Ok(token) = std::env::var("TRAVELBOT_AUTH_TOKEN") {
            config.auth_token = Some(token).filter(|t| !t.is_empty());
        }
        config
    }

    /// 持久连接的完整地址
    pub fn socket_url(&self) -> String {
        format!("{}/ws/chat", self.ws_url.trim_end_matches('/'))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: self.reconnect_base,
            cap: self.reconnect_cap,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

/// 连接阶段（仅供 UI 展示）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Open,
    /// 等待第 `attempt` 次重连
    Reconnecting { attempt: u32, delay: Duration },
    /// 重连次数用尽，需要外部触发 `reconnect()`
    Exhausted,
    /// 客户端已关闭
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Open => write!(f, "open"),
            ConnectionStatus::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {} in {}ms)", attempt, delay.as_millis())
            }
            ConnectionStatus::Exhausted => write!(f, "unavailable"),
            ConnectionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// 跳过发送的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// 内容为空或只有空白
    EmptyContent,
    /// 上一条消息仍在发送中
    Busy,
}

/// `send_message` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// 已写入持久连接，回复将以片段形式异步到达
    Socket,
    /// 走了 HTTP 回退通道；`replied` 表示是否追加了助手消息
    Fallback { replied: bool },
    /// 回退请求失败，错误已写入存储
    Failed,
    /// 未发送
    Skipped(SkipReason),
}

/// 聊天客户端句柄，可克隆
#[derive(Clone)]
pub struct ChatClient {
    commands: mpsc::UnboundedSender<ClientEvent>,
    status: watch::Receiver<ConnectionStatus>,
    store: ConversationStore,
}

impl ChatClient {
    /// 使用 WebSocket + HTTP 默认传输启动客户端，并立即开始连接
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn start(config: ClientConfig, store: ConversationStore) -> Result<Self> {
        let connector = Arc::new(WsConnector::new(config.heartbeat_interval));
        let fallback = Arc::new(HttpFallback::from_config(&config)?);
        Ok(Self::with_transports(config, store, connector, fallback))
    }

    /// 使用自定义传输启动客户端
    pub fn with_transports(
        config: ClientConfig,
        store: ConversationStore,
        connector: Arc<dyn SocketConnector>,
        fallback: Arc<dyn FallbackChannel>,
    ) -> Self {
        info!("[Client] 🚀 启动聊天客户端, 服务地址: {}", config.socket_url());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let driver = ConnectionDriver::new(
            &config,
            store.clone(),
            connector,
            fallback,
            commands_rx,
            status_tx,
        );
        tokio::spawn(driver.run());

        Self {
            commands: commands_tx,
            status: status_rx,
            store,
        }
    }

    fn post(&self, event: ClientEvent) -> Result<()> {
        self.commands
            .send(event)
            .map_err(|_| anyhow::anyhow!("聊天客户端已关闭"))
    }

    /// 建立持久连接；已连接或正在连接时不做任何事
    pub fn connect(&self) -> Result<()> {
        self.post(ClientEvent::Connect)
    }

    /// 重置重连计数并立即重新连接
    pub fn reconnect(&self) -> Result<()> {
        self.post(ClientEvent::Reconnect)
    }

    /// 发送一条用户消息
    ///
    /// 用户消息在任何网络 I/O 之前写入存储。传输失败不会以 `Err` 返回，
    /// 而是写入存储的错误状态；`Err` 仅表示客户端已关闭。
    pub async fn send_message(&self, content: impl Into<String>) -> Result<Delivery> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(ClientEvent::Send {
            content: content.into(),
            reply: reply_tx,
        })?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("聊天客户端已关闭"))
    }

    /// 关闭客户端：取消所有定时器、断开连接，之后不再修改存储
    ///
    /// 重复调用是安全的。
    pub async fn close(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(ClientEvent::Close {
                done: Some(done_tx),
            })
            .is_err()
        {
            debug!("[Client] 客户端已关闭，忽略重复关闭");
            return Ok(());
        }
        let _ = done_rx.await;
        Ok(())
    }

    /// 当前连接阶段
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// 订阅连接阶段变化
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_appends_chat_path_once() {
        let mut config = ClientConfig::new();
        assert_eq!(config.socket_url(), "ws://localhost:8000/ws/chat");
        config.ws_url = "wss://travelbot.vn/".to_string();
        assert_eq!(config.socket_url(), "wss://travelbot.vn/ws/chat");
    }

    #[test]
    fn reconnect_policy_follows_config() {
        let mut config = ClientConfig::new();
        config.max_reconnect_attempts = 3;
        config.reconnect_cap = Duration::from_secs(2);
        let policy = config.reconnect_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(4), Duration::from_secs(2));
    }

    #[test]
    fn status_display_is_human_readable() {
        let status = ConnectionStatus::Reconnecting {
            attempt: 2,
            delay: Duration::from_secs(2),
        };
        assert_eq!(status.to_string(), "reconnecting (attempt 2 in 2000ms)");
        assert_eq!(ConnectionStatus::Exhausted.to_string(), "unavailable");
    }

    /// 连接真实后端的冒烟测试
    ///
    /// 运行: TRAVELBOT_WS_URL=ws://... cargo test -- --ignored live_backend
    #[tokio::test]
    #[ignore]
    async fn live_backend_round_trip() {
        crate::chat::testing::init_test_logger();
        let store = ConversationStore::new();
        let client = ChatClient::start(ClientConfig::from_env(), store.clone()).unwrap();

        let mut status = client.subscribe_status();
        let opened = tokio::time::timeout(
            Duration::from_secs(10),
            status.wait_for(|s| *s == ConnectionStatus::Open),
        )
        .await
        .is_ok();
        info!("[Test] 连接结果: {}", opened);

        let delivery = client.send_message("Xin chào").await.unwrap();
        info!("[Test] 发送结果: {:?}", delivery);

        for _ in 0..60 {
            if store.messages().iter().any(|m| m.is_assistant()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        let replies: Vec<_> = store
            .messages()
            .into_iter()
            .filter(|m| m.is_assistant())
            .collect();
        assert!(!replies.is_empty(), "没有收到助手回复: {:?}", store.error());
        info!("[Test] 🤖 {}", replies[0].content);

        client.close().await.unwrap();
    }
}
