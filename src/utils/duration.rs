//! 时长与时间点解析
//!
//! 时长字面量采用 Go 风格：可选符号，后接一个或多个 `数字[.小数]单位`，
//! 单位为 `ns`、`us`/`µs`、`ms`、`s`、`m`、`h`，例如 `"90s"`、`"1h30m"`、
//! `"1.5h"`、`"-5m"`。单独的 `"0"` 表示零。

use chrono::{DateTime, Duration, Utc};

/// 时长解析错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurationError {
    #[error("invalid duration: empty string")]
    Empty,

    #[error("invalid duration {0:?}")]
    Invalid(String),

    #[error("missing unit in duration {0:?}")]
    MissingUnit(String),

    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { unit: String, input: String },

    #[error("duration {0:?} is out of range")]
    Overflow(String),
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(1_000_000_000),
        "m" => Some(60 * 1_000_000_000),
        "h" => Some(3_600 * 1_000_000_000),
        _ => None,
    }
}

/// 解析 Go 风格时长
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    if input.is_empty() {
        return Err(DurationError::Empty);
    }

    let invalid = || DurationError::Invalid(input.to_string());

    let (negative, mut rest) = match input.as_bytes()[0] {
        b'-' => (true, &input[1..]),
        b'+' => (false, &input[1..]),
        _ => (false, input),
    };

    if rest == "0" {
        return Ok(Duration::zero());
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;

    while !rest.is_empty() {
        // 整数部分
        let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let int_part = &rest[..int_len];
        rest = &rest[int_len..];

        // 小数部分
        let mut frac_part = "";
        if let Some(after_dot) = rest.strip_prefix('.') {
            let frac_len = after_dot.bytes().take_while(u8::is_ascii_digit).count();
            frac_part = &after_dot[..frac_len];
            rest = &after_dot[frac_len..];
        }

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }

        // 单位
        let unit_len = rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() || *c == '.')
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if unit_len == 0 {
            return Err(DurationError::MissingUnit(input.to_string()));
        }
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let scale = unit_nanos(unit).ok_or_else(|| DurationError::UnknownUnit {
            unit: unit.to_string(),
            input: input.to_string(),
        })?;

        let overflow = || DurationError::Overflow(input.to_string());

        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| overflow())?
        };
        let mut nanos = whole.checked_mul(scale).ok_or_else(overflow)?;

        if !frac_part.is_empty() {
            let fraction: f64 = format!("0.{}", frac_part).parse().map_err(|_| invalid())?;
            nanos = nanos
                .checked_add((fraction * scale as f64) as u128)
                .ok_or_else(overflow)?;
        }

        total = total.checked_add(nanos).ok_or_else(overflow)?;
    }

    let total = i64::try_from(total).map_err(|_| DurationError::Overflow(input.to_string()))?;
    let duration = Duration::nanoseconds(total);
    Ok(if negative { -duration } else { duration })
}

/// 解析时间点：RFC3339 时间戳，或一个从 `now` 往前推的时长
///
/// `"1h"` 表示一小时前；负时长会得到未来时间。
pub fn parse_point_in_time(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, DurationError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }

    let ago = parse_duration(input)?;
    now.checked_sub_signed(ago)
        .ok_or_else(|| DurationError::Overflow(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("0").unwrap(), Duration::zero());
        assert_eq!(parse_duration("90s").unwrap(), Duration::seconds(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::minutes(5));
        assert_eq!(parse_duration("1h").unwrap(), Duration::hours(1));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::milliseconds(250));
        assert_eq!(parse_duration("10us").unwrap(), Duration::microseconds(10));
        assert_eq!(parse_duration("10µs").unwrap(), Duration::microseconds(10));
        assert_eq!(parse_duration("7ns").unwrap(), Duration::nanoseconds(7));
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::minutes(90)
        );
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration(".5s").unwrap(), Duration::milliseconds(500));
        assert_eq!(parse_duration("-5m").unwrap(), Duration::minutes(-5));
        assert_eq!(parse_duration("+2s").unwrap(), Duration::seconds(2));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert_eq!(parse_duration(""), Err(DurationError::Empty));
        assert!(matches!(parse_duration("-"), Err(DurationError::Invalid(_))));
        assert!(matches!(parse_duration("."), Err(DurationError::Invalid(_))));
        assert!(matches!(parse_duration("10"), Err(DurationError::MissingUnit(_))));
        assert!(matches!(
            parse_duration("3d"),
            Err(DurationError::UnknownUnit { .. })
        ));
        assert!(matches!(parse_duration("abc"), Err(DurationError::Invalid(_))));
        assert!(matches!(
            parse_duration("99999999999999h"),
            Err(DurationError::Overflow(_))
        ));
    }

    #[test]
    fn test_parse_point_in_time() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        assert_eq!(
            parse_point_in_time("1970-01-01T00:00:00Z", now).unwrap(),
            Utc.timestamp_opt(0, 0).unwrap()
        );
        assert_eq!(
            parse_point_in_time("2024-01-01T00:00:00.000+01:00", now).unwrap(),
            Utc.with_ymd_and_hms(2023, 12, 31, 23, 0, 0).unwrap()
        );
        assert_eq!(
            parse_point_in_time("1h", now).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()
        );
        assert!(parse_point_in_time("yesterday", now).is_err());
    }
}
