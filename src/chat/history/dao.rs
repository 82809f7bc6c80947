//! 会话历史数据访问层（DAO）

use crate::chat::serialization::iso_timestamp;
use crate::chat::store::{ConversationMessage, MessageMetadata, Sender};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use tracing::{debug, warn};

/// 本地会话历史（sqlx / SQLite）
///
/// 单表 `chat_log`，`seq` 自增列保存插入顺序。
pub struct ChatLogDao {
    pool: Pool<Sqlite>,
}

impl ChatLogDao {
    /// 打开（或创建）历史库，例如 `sqlite://history.db?mode=rwc` 或 `sqlite::memory:`
    pub async fn new(db_url: &str) -> Result<Self> {
        let mut options = SqlitePoolOptions::new().max_connections(5);
        if db_url.contains(":memory:") {
            // 内存库每条连接各自独立，只能保留一条长连接
            options = options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = options
            .connect(db_url)
            .await
            .with_context(|| format!("打开历史库失败: {}", db_url))?;
        let dao = Self { pool };
        dao.ensure_table().await?;
        debug!("[History] 历史库已就绪: {}", db_url);
        Ok(dao)
    }

    async fn ensure_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_log (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                msg_id      TEXT NOT NULL UNIQUE,
                sender      TEXT NOT NULL,
                content     TEXT NOT NULL,
                timestamp   TEXT NOT NULL,
                intent      TEXT,
                data        TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 写入一条消息；同 ID 已存在时忽略
    pub async fn insert(&self, message: &ConversationMessage) -> Result<()> {
        let (intent, data) = Self::metadata_columns(message)?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO chat_log (msg_id, sender, content, timestamp, intent, data)
            VALUES (?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(&message.id)
        .bind(message.sender.as_str())
        .bind(&message.content)
        .bind(iso_timestamp(message.timestamp))
        .bind(intent)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 覆盖内容与元数据，返回是否命中
    pub async fn update(&self, message: &ConversationMessage) -> Result<bool> {
        let (intent, data) = Self::metadata_columns(message)?;
        let res = sqlx::query("UPDATE chat_log SET content = ?, intent = ?, data = ? WHERE msg_id = ?;")
            .bind(&message.content)
            .bind(intent)
            .bind(data)
            .bind(&message.id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn clear(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM chat_log;")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// 按插入顺序读取全部历史
    pub async fn load_all(&self) -> Result<Vec<ConversationMessage>> {
        let rows = sqlx::query("SELECT * FROM chat_log ORDER BY seq ASC;")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().filter_map(Self::row_to_message).collect())
    }

    fn metadata_columns(message: &ConversationMessage) -> Result<(Option<String>, Option<String>)> {
        let Some(metadata) = &message.metadata else {
            return Ok((None, None));
        };
        let data = metadata
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("序列化消息 data 失败")?;
        Ok((metadata.intent.clone(), data))
    }

    fn row_to_message(row: sqlx::sqlite::SqliteRow) -> Option<ConversationMessage> {
        let id = row.try_get::<String, _>("msg_id").unwrap_or_default();
        let sender_raw = row.try_get::<String, _>("sender").unwrap_or_default();
        let Some(sender) = Sender::parse(&sender_raw) else {
            warn!("[History] 跳过未知发送方的记录 id={} sender={}", id, sender_raw);
            return None;
        };
        let timestamp = row
            .try_get::<String, _>("timestamp")
            .ok()
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let intent = row.try_get::<Option<String>, _>("intent").unwrap_or_default();
        let data = row
            .try_get::<Option<String>, _>("data")
            .unwrap_or_default()
            .and_then(|raw| serde_json::from_str(&raw).ok());

        Some(ConversationMessage {
            id,
            sender,
            content: row.try_get::<String, _>("content").unwrap_or_default(),
            timestamp,
            metadata: MessageMetadata::new(intent, data).into_option(),
        })
    }
}
