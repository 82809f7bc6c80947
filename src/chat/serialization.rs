use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

static MSG_SEQ: AtomicU64 = AtomicU64::new(0);

/// 生成消息 ID
///
/// 格式为 `<毫秒时间戳>-<进程内序号>`，同一毫秒内创建的消息依靠序号区分，
/// 保证不会覆盖已有条目。
pub fn generate_msg_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let seq = MSG_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", millis, seq)
}

/// ISO-8601 时间字符串（UTC，毫秒精度）
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 当前时间的 ISO-8601 字符串
pub fn now_iso() -> String {
    iso_timestamp(Utc::now())
}
