use crate::chat::serialization::now_iso;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

/// 发往服务端的帧
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// 连接建立后的握手帧
    Init,
    /// 用户消息
    Message { content: String, timestamp: String },
    /// 对 `ping` 的应答
    Pong,
}

impl OutboundFrame {
    pub fn message(content: impl Into<String>) -> Self {
        OutboundFrame::Message {
            content: content.into(),
            timestamp: now_iso(),
        }
    }

    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).context("序列化发送帧失败")
    }
}

/// 服务端推送的帧
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Ping,
    /// 握手确认
    InitAck { content: Option<String> },
    /// 服务端报告的错误，连接保持打开
    Error { content: Option<String> },
    /// 回复片段，一条逻辑回复可能拆成多帧
    Message {
        content: Option<String>,
        intent: Option<String>,
        data: Option<Value>,
    },
    /// 无法识别的 `type`
    Unrecognized { kind: String },
}

impl InboundFrame {
    /// 解析文本帧
    ///
    /// 非 JSON、不是对象或 `type` 不是字符串时返回错误；
    /// 未知 `type` 返回 [`InboundFrame::Unrecognized`]。
    /// 每种帧只读取自己用到的字段，类型不符的字段按缺失处理。
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).context("帧解析失败")?;
        let Value::Object(fields) = value else {
            return Err(anyhow::anyhow!("帧不是 JSON 对象"));
        };
        let kind = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("帧缺少字符串类型的 type 字段"))?;

        let text_field = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_string);
        let frame = match kind {
            "ping" => InboundFrame::Ping,
            "init_ack" => InboundFrame::InitAck {
                content: text_field("content"),
            },
            "error" => InboundFrame::Error {
                content: text_field("content"),
            },
            "message" => InboundFrame::Message {
                content: text_field("content"),
                intent: text_field("intent"),
                data: fields.get("data").filter(|d| !d.is_null()).cloned(),
            },
            other => InboundFrame::Unrecognized {
                kind: other.to_string(),
            },
        };
        Ok(frame)
    }
}

/// HTTP 回退通道请求体
#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub message: &'a str,
}

/// HTTP 回退通道的回复内容
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChatReply {
    #[serde(default)]
    pub reply: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// 统一的 API 响应包装结构体
/// data 字段可能为 null 或缺失，因此使用 Option<T>
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

/// 通用 HTTP 响应处理函数：读取 body 并交给 [`decode_api_response`]
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> Result<ApiResponse<T>> {
    let status = response.status();
    let body_bytes = response.bytes().await.context("读取响应 body 失败")?;
    decode_api_response(status, &body_bytes, operation_name)
}

/// 按 HTTP 状态和 body 解码统一响应
///
/// 非 2xx 时返回可直接展示给用户的错误：优先取 body 中的 `detail`/`message`，
/// 否则为 `Request failed with status code <code>`。
pub fn decode_api_response<T: serde::de::DeserializeOwned>(
    status: reqwest::StatusCode,
    body: &[u8],
    operation_name: &str,
) -> Result<ApiResponse<T>> {
    let body_str = String::from_utf8_lossy(body);
    info!("[HTTP] {}响应 Body: {}", operation_name, body_str);

    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        let reported = serde_json::from_slice::<Value>(body).ok().and_then(|json| {
            ["detail", "message"]
                .iter()
                .find_map(|key| json.get(*key).and_then(|v| v.as_str()).map(str::to_string))
        });
        let message = reported
            .unwrap_or_else(|| format!("Request failed with status code {}", status.as_u16()));
        return Err(anyhow::anyhow!(message));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    serde_json::from_slice::<ApiResponse<T>>(body).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name, e, body_str
        );
        anyhow::anyhow!("Invalid response from chat service")
    })
}
