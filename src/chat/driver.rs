//! 连接驱动
//!
//! 聊天客户端的全部连接状态都归这个后台任务所有。公开命令、连接事件、
//! 定时器到期、回退请求完成都会变成 [`ClientEvent`]，由 `handle_event`
//! 逐个串行处理，因此不需要加锁。
//!
//! 状态流转：`Disconnected → Connecting → Open → Disconnected（重试）… →
//! Disconnected（次数用尽）`。关闭（teardown）后任何事件都不再生效。

use crate::chat::client::{ClientConfig, ConnectionStatus, Delivery, SkipReason};
use crate::chat::coalesce::ReplyBuffer;
use crate::chat::reconnect::ReconnectPolicy;
use crate::chat::store::{ConversationMessage, ConversationStore, MessageMetadata};
use crate::chat::transport::{FallbackChannel, SocketConnector, SocketEvent, SocketLink};
use crate::chat::types::{ChatReply, InboundFrame, OutboundFrame};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 首次重连时展示的提示
pub const RECONNECTING_NOTICE: &str = "Chat service unavailable. Attempting to reconnect...";
/// 重连次数用尽后的提示
pub const UNAVAILABLE_NOTICE: &str =
    "Chat service unavailable. Please refresh the page or try again later.";
/// `error` 帧未携带内容时的提示
pub const DEFAULT_BACKEND_ERROR: &str = "An error occurred";
/// 回退请求失败且没有具体原因时的提示
pub const DEFAULT_SEND_ERROR: &str = "Failed to send message";

/// 驱动任务处理的事件
pub(crate) enum ClientEvent {
    Connect,
    Reconnect,
    Send {
        content: String,
        reply: oneshot::Sender<Delivery>,
    },
    Close {
        done: Option<oneshot::Sender<()>>,
    },
    LinkOpened {
        attempt_id: u64,
        link: SocketLink,
    },
    LinkFailed {
        attempt_id: u64,
        error: anyhow::Error,
    },
    Socket(SocketEvent),
    CoalesceElapsed {
        timer_id: u64,
    },
    ReconnectElapsed {
        timer_id: u64,
    },
    FallbackFinished {
        result: Result<Option<ChatReply>>,
        reply: oneshot::Sender<Delivery>,
    },
}

/// 一次性定时器：到期后向驱动投递带编号的事件
struct Timer {
    id: u64,
    handle: JoinHandle<()>,
}

impl Timer {
    fn cancel(self) {
        self.handle.abort();
    }
}

pub(crate) struct ConnectionDriver {
    socket_url: String,
    quiet_period: Duration,
    policy: ReconnectPolicy,
    store: ConversationStore,
    connector: Arc<dyn SocketConnector>,
    fallback: Arc<dyn FallbackChannel>,
    commands: mpsc::UnboundedReceiver<ClientEvent>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: mpsc::UnboundedReceiver<ClientEvent>,
    status: watch::Sender<ConnectionStatus>,
    /// 当前打开的连接（至多一条）
    link: Option<SocketLink>,
    /// 正在进行的连接尝试编号
    connecting: Option<u64>,
    open_task: Option<JoinHandle<()>>,
    reconnect_attempts: u32,
    reply_buffer: ReplyBuffer,
    coalesce_timer: Option<Timer>,
    reconnect_timer: Option<Timer>,
    fallback_tasks: Vec<JoinHandle<()>>,
    next_id: u64,
    mounted: bool,
}

impl ConnectionDriver {
    pub(crate) fn new(
        config: &ClientConfig,
        store: ConversationStore,
        connector: Arc<dyn SocketConnector>,
        fallback: Arc<dyn FallbackChannel>,
        commands: mpsc::UnboundedReceiver<ClientEvent>,
        status: watch::Sender<ConnectionStatus>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            socket_url: config.socket_url(),
            quiet_period: config.quiet_period,
            policy: config.reconnect_policy(),
            store,
            connector,
            fallback,
            commands,
            events_tx,
            events_rx,
            status,
            link: None,
            connecting: None,
            open_task: None,
            reconnect_attempts: 0,
            reply_buffer: ReplyBuffer::new(),
            coalesce_timer: None,
            reconnect_timer: None,
            fallback_tasks: Vec::new(),
            next_id: 0,
            mounted: true,
        }
    }

    /// 事件循环，直到客户端关闭
    pub(crate) async fn run(mut self) {
        self.connect();
        while self.mounted {
            let event = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => {
                        debug!("[Client] 所有句柄已释放，关闭客户端");
                        ClientEvent::Close { done: None }
                    }
                },
                Some(event) = self.events_rx.recv() => event,
                event = next_socket_event(&mut self.link) => ClientEvent::Socket(event),
            };
            self.handle_event(event);
        }
        debug!("[Client] 驱动任务退出");
    }

    /// 唯一的事件入口
    pub(crate) fn handle_event(&mut self, event: ClientEvent) {
        if !self.mounted {
            debug!("[Client] 客户端已关闭，忽略事件");
            return;
        }
        match event {
            ClientEvent::Connect => self.connect(),
            ClientEvent::Reconnect => self.reconnect(),
            ClientEvent::Send { content, reply } => self.send_message(content, reply),
            ClientEvent::Close { done } => self.teardown(done),
            ClientEvent::LinkOpened { attempt_id, link } => self.on_link_opened(attempt_id, link),
            ClientEvent::LinkFailed { attempt_id, error } => self.on_link_failed(attempt_id, error),
            ClientEvent::Socket(SocketEvent::Text(text)) => self.receive_frame(&text),
            ClientEvent::Socket(SocketEvent::Closed { reason }) => self.on_link_closed(reason),
            ClientEvent::CoalesceElapsed { timer_id } => self.on_coalesce_elapsed(timer_id),
            ClientEvent::ReconnectElapsed { timer_id } => self.on_reconnect_elapsed(timer_id),
            ClientEvent::FallbackFinished { result, reply } => {
                self.on_fallback_finished(result, reply)
            }
        }
    }

    fn publish(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    fn start_timer(&mut self, delay: Duration, make_event: fn(u64) -> ClientEvent) -> Timer {
        self.next_id += 1;
        let id = self.next_id;
        let events = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(make_event(id));
        });
        Timer { id, handle }
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.coalesce_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.reconnect_timer.take() {
            timer.cancel();
        }
    }

    // ========== 连接生命周期 ==========

    fn connect(&mut self) {
        if self.connecting.is_some() || self.link.is_some() {
            debug!("[Client] ⏭️ 跳过连接：已连接或正在连接");
            return;
        }
        if let Some(timer) = self.reconnect_timer.take() {
            timer.cancel();
        }

        self.next_id += 1;
        let attempt_id = self.next_id;
        self.connecting = Some(attempt_id);
        self.publish(ConnectionStatus::Connecting);
        info!("[Client] 🔗 连接到 {}", self.socket_url);

        let connector = self.connector.clone();
        let url = self.socket_url.clone();
        let events = self.events_tx.clone();
        self.open_task = Some(tokio::spawn(async move {
            let event = match connector.open(&url).await {
                Ok(link) => ClientEvent::LinkOpened { attempt_id, link },
                Err(error) => ClientEvent::LinkFailed { attempt_id, error },
            };
            let _ = events.send(event);
        }));
    }

    fn reconnect(&mut self) {
        info!("[Client] 🔄 手动重连，重置重连计数");
        self.reconnect_attempts = 0;
        self.connect();
    }

    fn on_link_opened(&mut self, attempt_id: u64, link: SocketLink) {
        if self.connecting != Some(attempt_id) {
            debug!("[Client] 丢弃过期的连接 attempt={}", attempt_id);
            return;
        }
        self.connecting = None;
        self.open_task = None;

        info!("[Client] ✅ 连接已建立");
        self.reconnect_attempts = 0;
        self.store.set_error(None);
        self.link = Some(link);
        self.publish(ConnectionStatus::Open);
        self.send_frame(&OutboundFrame::Init);
    }

    fn on_link_failed(&mut self, attempt_id: u64, error: anyhow::Error) {
        if self.connecting != Some(attempt_id) {
            return;
        }
        self.connecting = None;
        self.open_task = None;
        warn!("[Client] 💥 连接失败: {:#}", error);
        self.schedule_reconnect();
    }

    fn on_link_closed(&mut self, reason: Option<String>) {
        if self.link.take().is_none() {
            return;
        }
        warn!(
            "[Client] 🔻 连接关闭: {}",
            reason.as_deref().unwrap_or("无原因")
        );
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        match self.policy.next_delay(self.reconnect_attempts) {
            Some(delay) => {
                self.reconnect_attempts += 1;
                let attempt = self.reconnect_attempts;
                if attempt == 1 {
                    self.store.set_error(Some(RECONNECTING_NOTICE.to_string()));
                }
                info!(
                    "[Client] ⏳ {}ms 后重连（第 {} 次）",
                    delay.as_millis(),
                    attempt
                );
                self.publish(ConnectionStatus::Reconnecting { attempt, delay });
                self.reconnect_timer = Some(
                    self.start_timer(delay, |timer_id| ClientEvent::ReconnectElapsed { timer_id }),
                );
            }
            None => {
                error!(
                    "[Client] ❌ 已重连 {} 次仍失败，停止重连",
                    self.reconnect_attempts
                );
                self.store.set_error(Some(UNAVAILABLE_NOTICE.to_string()));
                self.publish(ConnectionStatus::Exhausted);
            }
        }
    }

    fn on_reconnect_elapsed(&mut self, timer_id: u64) {
        match &self.reconnect_timer {
            Some(timer) if timer.id == timer_id => {
                self.reconnect_timer = None;
                self.connect();
            }
            _ => debug!("[Client] 忽略过期的重连定时器 id={}", timer_id),
        }
    }

    fn teardown(&mut self, done: Option<oneshot::Sender<()>>) {
        info!("[Client] 🧹 关闭客户端");
        self.mounted = false;
        self.connecting = None;
        self.cancel_timers();
        if let Some(task) = self.open_task.take() {
            task.abort();
        }
        for task in self.fallback_tasks.drain(..) {
            task.abort();
        }

        // 连接已断开，不会再有后续片段补全它
        let dropped = self.reply_buffer.discard();
        if dropped > 0 {
            debug!("[Client] 丢弃未提交的回复片段 {} 字节", dropped);
        }

        // 丢弃 SocketLink 即关闭连接
        self.link = None;
        self.publish(ConnectionStatus::Closed);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    // ========== 收发 ==========

    /// 写入一帧，失败返回 `false`
    fn send_frame(&mut self, frame: &OutboundFrame) -> bool {
        let link = match &self.link {
            Some(link) => link,
            None => return false,
        };
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!("[Client] {:#}", e);
                return false;
            }
        };
        match link.send_text(text) {
            Ok(()) => true,
            Err(e) => {
                warn!("[Client] 帧写入失败: {}", e);
                false
            }
        }
    }

    fn receive_frame(&mut self, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[Client] ⚠️ 丢弃无法解析的帧: {:#}, 原始数据: {}", e, text);
                return;
            }
        };

        match frame {
            InboundFrame::Ping => {
                self.send_frame(&OutboundFrame::Pong);
            }
            InboundFrame::InitAck { content } => {
                info!(
                    "[Client] ✅ 握手确认: {}",
                    content.as_deref().unwrap_or_default()
                );
            }
            InboundFrame::Error { content } => {
                let message = content
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| DEFAULT_BACKEND_ERROR.to_string());
                warn!("[Client] 服务端报告错误: {}", message);
                self.store.set_error(Some(message));
            }
            InboundFrame::Message {
                content,
                intent,
                data,
            } => {
                self.reply_buffer.push(content.as_deref(), intent, data);
                if let Some(timer) = self.coalesce_timer.take() {
                    timer.cancel();
                }
                self.coalesce_timer = Some(self.start_timer(self.quiet_period, |timer_id| {
                    ClientEvent::CoalesceElapsed { timer_id }
                }));
            }
            InboundFrame::Unrecognized { kind } => {
                debug!("[Client] 忽略未知帧类型: {}", kind);
            }
        }
    }

    fn on_coalesce_elapsed(&mut self, timer_id: u64) {
        match &self.coalesce_timer {
            Some(timer) if timer.id == timer_id => self.coalesce_timer = None,
            _ => {
                debug!("[Client] 忽略过期的聚合定时器 id={}", timer_id);
                return;
            }
        }
        if let Some(message) = self.reply_buffer.take() {
            info!("[Client] 🤖 提交助手消息 ({} 字节)", message.content.len());
            self.store.append(message);
        }
    }

    fn send_message(&mut self, content: String, reply: oneshot::Sender<Delivery>) {
        if content.trim().is_empty() {
            let _ = reply.send(Delivery::Skipped(SkipReason::EmptyContent));
            return;
        }
        if self.store.is_loading() {
            debug!("[Client] 上一条消息仍在发送，跳过");
            let _ = reply.send(Delivery::Skipped(SkipReason::Busy));
            return;
        }

        self.store.set_error(None);
        self.store.set_loading(true);
        self.store.append(ConversationMessage::user(content.clone()));

        if self.link.is_some() {
            if self.send_frame(&OutboundFrame::message(content.clone())) {
                debug!("[Client] 📤 消息已通过 WebSocket 发送");
                self.store.set_loading(false);
                let _ = reply.send(Delivery::Socket);
                return;
            }
            self.on_link_closed(Some("写入失败".to_string()));
        }

        warn!("[Client] WebSocket 未连接，回退到 HTTP");
        let fallback = self.fallback.clone();
        let events = self.events_tx.clone();
        self.fallback_tasks.retain(|task| !task.is_finished());
        self.fallback_tasks.push(tokio::spawn(async move {
            let result = fallback.ask(&content).await;
            let _ = events.send(ClientEvent::FallbackFinished { result, reply });
        }));
    }

    fn on_fallback_finished(
        &mut self,
        result: Result<Option<ChatReply>>,
        reply: oneshot::Sender<Delivery>,
    ) {
        let delivery = match result {
            Ok(Some(chat_reply)) => {
                let metadata = MessageMetadata::new(chat_reply.intent, chat_reply.data);
                self.store.append(ConversationMessage::assistant(
                    chat_reply.reply.unwrap_or_default(),
                    metadata.into_option(),
                ));
                Delivery::Fallback { replied: true }
            }
            Ok(None) => {
                debug!("[Client] HTTP 回复中没有数据");
                Delivery::Fallback { replied: false }
            }
            Err(e) => {
                error!("[Client] HTTP 回退失败: {:#}", e);
                let message = e.to_string();
                let message = if message.is_empty() {
                    DEFAULT_SEND_ERROR.to_string()
                } else {
                    message
                };
                self.store.set_error(Some(message));
                Delivery::Failed
            }
        };
        self.store.set_loading(false);
        let _ = reply.send(delivery);
    }
}

async fn next_socket_event(link: &mut Option<SocketLink>) -> SocketEvent {
    match link {
        Some(link) => link.next_event().await,
        None => std::future::pending().await,
    }
}
