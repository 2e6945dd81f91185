//! 上游事件信封解码
//!
//! 每条记录是一个 JSON 对象：
//!
//! ```json
//! {"time": "2024-01-01T00:00:00Z", "detail": {"any": "payload"}}
//! ```
//!
//! `time` 必须是 RFC3339 字符串，`detail` 可以是任意 JSON 值。
//! 输出的负载是 `detail` 的紧凑重新序列化（对象键按字典序）。

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// 时间字段名
pub const TIME_FIELD: &str = "time";

/// 负载字段名
pub const DETAIL_FIELD: &str = "detail";

/// 解码成功的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    pub payload: Bytes,
}

/// 记录被跳过的原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("un-parseable JSON: {0}")]
    InvalidJson(String),

    #[error("missing \"time\" key")]
    MissingTime,

    #[error("un-parseable \"time\" key: {0}")]
    InvalidTime(String),

    #[error("missing \"detail\" key")]
    MissingDetail,

    #[error("unable to re-encode \"detail\": {0}")]
    Encode(String),
}

impl SkipReason {
    /// 指标标签
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::InvalidJson(_) => "invalid_json",
            SkipReason::MissingTime => "missing_time",
            SkipReason::InvalidTime(_) => "invalid_time",
            SkipReason::MissingDetail => "missing_detail",
            SkipReason::Encode(_) => "encode",
        }
    }
}

/// 解码一条原始记录
pub fn decode(data: &[u8]) -> Result<Envelope, SkipReason> {
    let value: Value =
        serde_json::from_slice(data).map_err(|e| SkipReason::InvalidJson(e.to_string()))?;

    let object = match value {
        Value::Object(object) => object,
        other => {
            return Err(SkipReason::InvalidJson(format!(
                "expected an object, got {}",
                json_kind(&other)
            )))
        }
    };

    // 非字符串的 time 视同缺失
    let time = object
        .get(TIME_FIELD)
        .and_then(Value::as_str)
        .ok_or(SkipReason::MissingTime)?;

    let timestamp = DateTime::parse_from_rfc3339(time)
        .map_err(|e| SkipReason::InvalidTime(e.to_string()))?
        .with_timezone(&Utc);

    let detail = object.get(DETAIL_FIELD).ok_or(SkipReason::MissingDetail)?;
    let payload = serde_json::to_vec(detail).map_err(|e| SkipReason::Encode(e.to_string()))?;

    Ok(Envelope {
        timestamp,
        payload: Bytes::from(payload),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_good_event() {
        let envelope =
            decode(br#"{"time":"1970-01-01T00:00:00.001Z","detail":{"good":true,"event":1}}"#)
                .unwrap();
        assert_eq!(envelope.timestamp, Utc.timestamp_millis_opt(1).unwrap());
        assert_eq!(envelope.payload, r#"{"event":1,"good":true}"#);
    }

    #[test]
    fn test_decode_offset_timestamp_normalized() {
        let envelope = decode(br#"{"time":"2024-05-01T12:00:00+02:00","detail":"x"}"#).unwrap();
        assert_eq!(
            envelope.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(envelope.payload, r#""x""#);
    }

    #[test]
    fn test_skip_reasons() {
        assert!(matches!(decode(b"bogus"), Err(SkipReason::InvalidJson(_))));
        assert!(matches!(decode(b"[1,2]"), Err(SkipReason::InvalidJson(_))));
        assert_eq!(decode(br#"{"detail":{}}"#), Err(SkipReason::MissingTime));
        assert_eq!(
            decode(br#"{"time":12,"detail":{}}"#),
            Err(SkipReason::MissingTime)
        );
        assert!(matches!(
            decode(br#"{"time":"yesterday","detail":{}}"#),
            Err(SkipReason::InvalidTime(_))
        ));
        assert_eq!(
            decode(br#"{"time":"1970-01-01T00:00:00.000Z"}"#),
            Err(SkipReason::MissingDetail)
        );
    }

    #[test]
    fn test_null_detail_is_kept() {
        let envelope = decode(br#"{"time":"1970-01-01T00:00:00Z","detail":null}"#).unwrap();
        assert_eq!(envelope.payload, "null");
        assert_eq!(SkipReason::MissingDetail.label(), "missing_detail");
    }
}
