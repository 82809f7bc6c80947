//! 旅行助手聊天 CLI
//!
//! 交互式终端客户端：从 stdin 读取消息发送给旅行助手，助手回复与错误通过日志输出。
//! 以 `/` 开头的行是本地命令：`/clear`、`/reconnect`、`/status`、`/quit`。

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use travelbot_chat_sdk::chat::history::{ChatLogDao, HistoryRecorder};
use travelbot_chat_sdk::chat::store::{ConversationListener, ConversationMessage};
use travelbot_chat_sdk::{ChatClient, ClientConfig, ConversationStore, Delivery};
use tracing::{error, info, warn};

/// 旅行助手聊天 CLI
#[derive(Parser, Debug)]
#[command(name = "travelbot-chat")]
#[command(about = "旅行助手聊天客户端 - WebSocket 优先，HTTP 回退", long_about = None)]
struct Args {
    /// WebSocket 服务地址（默认读取 TRAVELBOT_WS_URL）
    #[arg(long)]
    ws_url: Option<String>,

    /// HTTP API 基础地址（默认读取 TRAVELBOT_API_URL）
    #[arg(long)]
    api_url: Option<String>,

    /// 回退请求使用的 Bearer token（默认读取 TRAVELBOT_AUTH_TOKEN）
    #[arg(long)]
    token: Option<String>,

    /// 会话历史库，例如 sqlite://chat.db?mode=rwc；不指定则不持久化
    #[arg(long)]
    history_db: Option<String>,

    /// 日志级别（默认: info,travelbot_chat_sdk=debug）
    #[arg(long, default_value = "info,travelbot_chat_sdk=debug")]
    log_level: String,

    /// 日志文件
    #[arg(long, default_value = "travelbot-chat.log")]
    log_file: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str, log_path: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("无法创建日志文件 {}", log_path))?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("日志初始化失败")?;

    info!("[CLI] 📝 日志已同时输出到控制台和文件: {}", log_path);
    Ok(())
}

/// 把存储变更渲染到终端
struct CliConversationListener;

#[async_trait]
impl ConversationListener for CliConversationListener {
    async fn on_message_appended(&self, message: ConversationMessage) {
        if !message.is_assistant() {
            return;
        }
        info!("[CLI/Bot] 🤖 {}", message.content);
        if let Some(metadata) = &message.metadata {
            if let Some(intent) = &metadata.intent {
                info!("[CLI/Bot]   intent: {}", intent);
            }
            if let Some(data) = &metadata.data {
                info!("[CLI/Bot]   data: {}", data);
            }
        }
    }

    async fn on_message_updated(&self, message: ConversationMessage) {
        info!("[CLI/Bot] ✏️ 消息更新 {}: {}", message.id, message.content);
    }

    async fn on_messages_cleared(&self) {
        info!("[CLI] 🧹 会话已清空");
    }

    async fn on_loading_changed(&self, loading: bool) {
        if loading {
            info!("[CLI] ⏳ 等待回复...");
        }
    }

    async fn on_error_changed(&self, error: Option<String>) {
        if let Some(error) = error {
            error!("[CLI] ❌ {}", error);
        }
    }
}

fn build_config(args: &Args) -> ClientConfig {
    let mut config = ClientConfig::from_env();
    if let Some(url) = &args.ws_url {
        config.ws_url = url.clone();
    }
    if let Some(url) = &args.api_url {
        config.api_base_url = url.clone();
    }
    if let Some(token) = &args.token {
        config.auth_token = Some(token.clone());
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level, &args.log_file)?;

    let config = build_config(&args);
    info!("[CLI] 🚀 旅行助手聊天客户端");
    info!("[CLI] 🔗 WebSocket: {}", config.socket_url());
    info!("[CLI] 🌐 HTTP API: {}", config.api_base_url);

    let store = ConversationStore::new();
    if let Some(db_url) = &args.history_db {
        let dao = Arc::new(ChatLogDao::new(db_url).await?);
        let history = dao.load_all().await?;
        info!("[CLI] 📜 恢复 {} 条历史消息", history.len());
        for message in &history {
            info!("[CLI]   {}: {}", message.sender.as_str(), message.content);
        }
        store.restore(history);
        store.add_listener(Arc::new(HistoryRecorder::new(dao)));
    }
    store.add_listener(Arc::new(CliConversationListener));

    let client = ChatClient::start(config, store)?;

    let mut status = client.subscribe_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            info!("[CLI] 📶 连接状态: {}", current);
        }
    });

    info!("[CLI] 💡 输入消息后回车发送；/clear /reconnect /status /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("读取 stdin 失败")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/clear" => client.store().clear(),
            "/reconnect" => client.reconnect()?,
            "/status" => info!(
                "[CLI] 📶 {} | 消息 {} 条 | loading={}",
                client.status(),
                client.store().len(),
                client.store().is_loading()
            ),
            _ => match client.send_message(line).await? {
                Delivery::Socket => {}
                Delivery::Fallback { replied: false } => warn!("[CLI] 回退通道没有返回回复"),
                Delivery::Fallback { replied: true } | Delivery::Failed => {}
                Delivery::Skipped(reason) => warn!("[CLI] 未发送: {:?}", reason),
            },
        }
    }

    client.close().await?;
    info!("[CLI] 👋 程序退出");
    Ok(())
}
