//! 时间工具
//!
//! 存储层所有时间字段统一使用 UTC 毫秒时间戳（INTEGER），
//! 只有写回实体的 `created_at`/`updated_at` 字段才使用 RFC 3339 字符串。

use chrono::{DateTime, TimeZone, Utc};

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 当前时间的 RFC 3339 字符串
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// 毫秒时间戳转 UTC 时间；超出范围返回 None
pub fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// 距离某个毫秒时间戳过去了多少秒（未来时间返回 0）
pub fn elapsed_secs_since(millis: i64) -> i64 {
    ((now_millis() - millis) / 1000).max(0)
}
