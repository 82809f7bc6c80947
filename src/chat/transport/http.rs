//! HTTP 回退通道
//!
//! 持久连接不可用时，通过一次 POST 请求获取完整回复。

use crate::chat::client::ClientConfig;
use crate::chat::transport::FallbackChannel;
use crate::chat::types::{handle_http_response, ApiResponse, ChatReply, ChatRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 基于 reqwest 的回退通道
pub struct HttpFallback {
    client: reqwest::Client,
    api_base_url: String,
    /// Bearer token，收到 401 后丢弃
    auth_token: Mutex<Option<String>>,
}

impl HttpFallback {
    pub fn new(
        api_base_url: String,
        auth_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .timeout(request_timeout)
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self {
            client,
            api_base_url,
            auth_token: Mutex::new(auth_token.filter(|t| !t.is_empty())),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(
            config.api_base_url.clone(),
            config.auth_token.clone(),
            config.request_timeout,
        )
    }

    fn chat_url(&self) -> String {
        format!("{}/chat", self.api_base_url.trim_end_matches('/'))
    }

    fn current_token(&self) -> Option<String> {
        self.auth_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn forget_token(&self) {
        let mut token = self.auth_token.lock().unwrap_or_else(|e| e.into_inner());
        if token.take().is_some() {
            warn!("[HTTP] 🔑 收到 401，已丢弃本地 token");
        }
    }

    /// 当前是否携带认证 token
    pub fn has_token(&self) -> bool {
        self.current_token().is_some()
    }
}

#[async_trait]
impl FallbackChannel for HttpFallback {
    async fn ask(&self, message: &str) -> Result<Option<ChatReply>> {
        let operation_id = Uuid::new_v4().to_string();
        let url = self.chat_url();

        info!("[HTTP] 📡 通过 HTTP 回退通道发送消息");
        debug!("[HTTP]   请求URL: {}, 操作ID: {}", url, operation_id);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("operationID", &operation_id)
            .json(&ChatRequest { message });
        if let Some(token) = self.current_token() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            error!("[HTTP] 请求失败: {}", e);
            if e.is_timeout() {
                anyhow::anyhow!("Request timed out")
            } else {
                anyhow::anyhow!("Network Error")
            }
        })?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.forget_token();
        }

        let api_resp: ApiResponse<ChatReply> = handle_http_response(response, "聊天").await?;
        if api_resp.data.is_none() {
            debug!(
                "[HTTP] 回复中没有 data 字段, message={:?}",
                api_resp.message
            );
        }
        Ok(api_resp.data)
    }
}
