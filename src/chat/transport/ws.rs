//! WebSocket 持久连接实现（tokio-tungstenite）

use crate::chat::transport::{SocketConnector, SocketEvent, SocketLink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 基于 tokio-tungstenite 的连接建立器
pub struct WsConnector {
    heartbeat_interval: Duration,
}

impl WsConnector {
    /// `heartbeat_interval`: 协议层 Ping 的发送间隔
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self { heartbeat_interval }
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn open(&self, url: &str) -> Result<SocketLink> {
        info!("[WS] 🔗 连接到聊天服务: {}", url);
        let (ws_stream, response) = connect_async(url)
            .await
            .with_context(|| format!("WebSocket 连接失败: {}", url))?;
        info!("[WS] ✅ WebSocket 连接成功, 状态: {}", response.status());

        let (write, read) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(
            write,
            outbound_rx,
            inbound_tx.clone(),
            self.heartbeat_interval,
        ));
        tokio::spawn(read_loop(read, inbound_tx));

        Ok(SocketLink::new(outbound_tx, inbound_rx))
    }
}

/// 写循环：转发出站文本并定时发送心跳
///
/// 出站通道关闭（`SocketLink` 被丢弃）时发送 Close 帧后退出；
/// 写入失败时向入站通道报告 `Closed`，驱动据此进入重连流程。
async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<SocketEvent>,
    heartbeat_interval: Duration,
) where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display,
{
    let mut ticker = interval(heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 第一次 tick 立即完成，跳过
    ticker.tick().await;

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(text) => {
                    debug!("[WS] 📤 发送: {}", text);
                    if let Err(e) = writer.send(WsMessage::Text(text)).await {
                        warn!("[WS] 写入失败: {}", e);
                        let _ = inbound.send(SocketEvent::Closed {
                            reason: Some(format!("写入失败: {}", e)),
                        });
                        break;
                    }
                }
                None => {
                    debug!("[WS] 👋 连接被本地关闭");
                    let _ = writer.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = writer.send(WsMessage::Ping(vec![])).await {
                    warn!("[WS] 💓 心跳发送失败: {}", e);
                    let _ = inbound.send(SocketEvent::Closed {
                        reason: Some(format!("心跳发送失败: {}", e)),
                    });
                    break;
                }
            }
        }
    }
}

/// 读循环：把文本帧与关闭事件转发给客户端
async fn read_loop(mut reader: WsReader, inbound: mpsc::UnboundedSender<SocketEvent>) {
    while let Some(msg_result) = reader.next().await {
        match msg_result {
            Ok(WsMessage::Text(text)) => {
                debug!("[WS] 📥 收到: {}", text);
                if inbound.send(SocketEvent::Text(text)).is_err() {
                    return;
                }
            }
            Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => {
                    if inbound.send(SocketEvent::Text(text)).is_err() {
                        return;
                    }
                }
                Err(e) => warn!("[WS] 丢弃非 UTF-8 二进制帧: {}", e),
            },
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(WsMessage::Close(frame)) => {
                warn!("[WS] 🔻 连接关闭: {:?}", frame);
                let reason = frame.map(|f| format!("{} {}", f.code, f.reason));
                let _ = inbound.send(SocketEvent::Closed { reason });
                return;
            }
            Err(e) => {
                error!("[WS] WebSocket 错误: {}", e);
                let _ = inbound.send(SocketEvent::Closed {
                    reason: Some(e.to_string()),
                });
                return;
            }
            _ => {}
        }
    }
    let _ = inbound.send(SocketEvent::Closed { reason: None });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::client::{ChatClient, ClientConfig, ConnectionStatus, Delivery};
    use crate::chat::store::{ConversationStore, Sender};
    use crate::chat::transport::HttpFallback;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn next_json(server: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            let msg = timeout(Duration::from_secs(5), server.next())
                .await
                .expect("等待客户端帧超时")
                .expect("连接已结束")
                .expect("读取失败");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn loopback_handshake_ping_and_coalesced_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            assert_eq!(next_json(&mut ws).await, json!({"type": "init"}));
            ws.send(WsMessage::Text(json!({"type": "init_ack", "content": "ready"}).to_string()))
                .await
                .unwrap();

            ws.send(WsMessage::Text(json!({"type": "ping"}).to_string()))
                .await
                .unwrap();
            assert_eq!(next_json(&mut ws).await, json!({"type": "pong"}));

            let sent = next_json(&mut ws).await;
            assert_eq!(sent["type"], "message");
            assert_eq!(sent["content"], "Hội An có gì?");

            for part in ["Phố cổ ", "và ", "đèn lồng"] {
                ws.send(WsMessage::Text(
                    json!({"type": "message", "content": part, "intent": "explore"}).to_string(),
                ))
                .await
                .unwrap();
            }
            // 等客户端主动关闭
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });

        let mut config = ClientConfig::new();
        config.ws_url = format!("ws://{}/", addr);
        config.api_base_url = "http://127.0.0.1:9".to_string();
        config.quiet_period = Duration::from_millis(100);

        let store = ConversationStore::new();
        let client = ChatClient::with_transports(
            config.clone(),
            store.clone(),
            Arc::new(WsConnector::new(config.heartbeat_interval)),
            Arc::new(HttpFallback::from_config(&config).unwrap()),
        );

        let mut status = client.subscribe_status();
        timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == ConnectionStatus::Open),
        )
        .await
        .unwrap()
        .unwrap();

        // 让 ping/pong 先走完
        tokio::time::sleep(Duration::from_millis(100)).await;
        let delivery = client.send_message("Hội An có gì?").await.unwrap();
        assert_eq!(delivery, Delivery::Socket);

        timeout(Duration::from_secs(5), async {
            while store.len() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let messages = store.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[1].sender, Sender::Assistant);
        assert_eq!(messages[1].content, "Phố cổ và đèn lồng");
        assert_eq!(
            messages[1].metadata.as_ref().and_then(|m| m.intent.as_deref()),
            Some("explore")
        );

        client.close().await.unwrap();
        timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_heartbeat_reports_closed_link() {
        let broken = Box::pin(futures_util::sink::unfold((), |_, _msg: WsMessage| async {
            Err::<(), _>(anyhow::anyhow!("broken pipe"))
        }));
        let (_outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(
            broken,
            outbound_rx,
            inbound_tx,
            Duration::from_secs(25),
        ));

        match inbound_rx.recv().await {
            Some(SocketEvent::Closed { reason }) => {
                assert!(reason.unwrap().contains("broken pipe"));
            }
            other => panic!("期望 Closed 事件，实际: {:?}", other),
        }
        writer.await.unwrap();
    }
}
