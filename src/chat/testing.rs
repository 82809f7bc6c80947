//! 测试辅助：可控的假传输与测试日志

use crate::chat::transport::{FallbackChannel, SocketConnector, SocketEvent, SocketLink};
use crate::chat::types::ChatReply;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

static INIT_LOGGER: Once = Once::new();

pub(crate) fn init_test_logger() {
    INIT_LOGGER.call_once(|| {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        let filter_layer = EnvFilter::new("info,travelbot_chat_sdk=debug");

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .with_test_writer();

        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .try_init();
    });
}

/// 假连接的打开行为
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenMode {
    Accept,
    Refuse,
    /// 永不完成
    Hang,
}

/// 服务端视角的一条假连接
pub(crate) struct FakeServer {
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<SocketEvent>,
}

impl FakeServer {
    pub(crate) fn push(&self, frame: Value) {
        let _ = self.inbound.send(SocketEvent::Text(frame.to_string()));
    }

    pub(crate) fn push_raw(&self, text: &str) {
        let _ = self.inbound.send(SocketEvent::Text(text.to_string()));
    }

    pub(crate) fn close(&self) {
        let _ = self.inbound.send(SocketEvent::Closed {
            reason: Some("1006 abnormal".into()),
        });
    }

    /// 下一条客户端发出的帧；连接被客户端丢弃时返回 `None`
    pub(crate) async fn next_frame(&mut self) -> Option<Value> {
        self.outbound
            .recv()
            .await
            .map(|text| serde_json::from_str(&text).expect("客户端发出了非 JSON 帧"))
    }

    pub(crate) fn try_next_frame(&mut self) -> Option<Value> {
        self.outbound
            .try_recv()
            .ok()
            .map(|text| serde_json::from_str(&text).expect("客户端发出了非 JSON 帧"))
    }

    pub(crate) fn is_dropped_by_client(&self) -> bool {
        self.inbound.is_closed()
    }
}

pub(crate) struct FakeConnector {
    mode: Mutex<OpenMode>,
    opens: Mutex<Vec<Instant>>,
    accepted: mpsc::UnboundedSender<FakeServer>,
}

impl FakeConnector {
    pub(crate) fn new(mode: OpenMode) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeServer>) {
        let (accepted, servers) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            mode: Mutex::new(mode),
            opens: Mutex::new(Vec::new()),
            accepted,
        });
        (connector, servers)
    }

    pub(crate) fn set_mode(&self, mode: OpenMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// 每次 `open` 被调用的时刻
    pub(crate) fn opens(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait]
impl SocketConnector for FakeConnector {
    async fn open(&self, _url: &str) -> Result<SocketLink> {
        self.opens.lock().unwrap().push(Instant::now());
        let mode = *self.mode.lock().unwrap();
        match mode {
            OpenMode::Accept => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                let _ = self.accepted.send(FakeServer {
                    outbound: outbound_rx,
                    inbound: inbound_tx,
                });
                Ok(SocketLink::new(outbound_tx, inbound_rx))
            }
            OpenMode::Refuse => Err(anyhow::anyhow!("connection refused")),
            OpenMode::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeFallback {
    replies: Mutex<VecDeque<Result<Option<ChatReply>>>>,
    calls: Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
}

impl FakeFallback {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 每次 `ask` 都要等 `gate` 放行
    pub(crate) fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub(crate) fn queue(&self, reply: Result<Option<ChatReply>>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FallbackChannel for FakeFallback {
    async fn ask(&self, message: &str) -> Result<Option<ChatReply>> {
        self.calls.lock().unwrap().push(message.to_string());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.replies.lock().unwrap().pop_front().unwrap_or(Ok(None))
    }
}
