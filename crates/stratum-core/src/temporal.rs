//! Temporal normalization
//!
//! Write-side conversion of date/timestamp inputs into their stored
//! representation and read-side hydration back into the declared mode.
//! Timestamps are stored as epoch milliseconds in every mode; dates are
//! stored per their mode (`YYYY-MM-DD` string or midnight-UTC millis).

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde_json::Value;

use crate::schema::{ColumnKind, DateMode, TimestampMode};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// The current time in the stored representation of `kind`.
/// Non-temporal kinds get the raw epoch-ms number (callers guard this).
pub fn now_value(kind: &ColumnKind) -> Value {
    let now = Utc::now();
    match kind {
        ColumnKind::Date(DateMode::Iso) => Value::String(now.format(DATE_FORMAT).to_string()),
        ColumnKind::Date(DateMode::Millis) => midnight_ms(now.date_naive()).into(),
        _ => (now.timestamp_millis() as f64).into(),
    }
}

/// Normalize a written value to the stored representation. Accepts the
/// native representation as well as its counterpart (RFC 3339 string for
/// timestamps, `YYYY-MM-DD` for dates) and converts. `null` passes
/// through; nullability is the validator's concern.
pub fn normalize(kind: &ColumnKind, value: &Value) -> Result<Value, String> {
    match kind {
        ColumnKind::Timestamp(_) => match value {
            Value::Null => Ok(Value::Null),
            Value::Number(n) => Ok(Value::Number(n.clone())),
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| (dt.timestamp_millis() as f64).into())
                .map_err(|_| format!("'{s}' is not an RFC 3339 timestamp")),
            other => Err(format!("expected timestamp, got {other}")),
        },
        ColumnKind::Date(mode) => match value {
            Value::Null => Ok(Value::Null),
            Value::String(s) => {
                let parsed = NaiveDate::parse_from_str(s, DATE_FORMAT)
                    .map_err(|_| format!("'{s}' is not a YYYY-MM-DD date"))?;
                Ok(match mode {
                    DateMode::Iso => Value::String(s.clone()),
                    DateMode::Millis => midnight_ms(parsed).into(),
                })
            }
            Value::Number(n) => {
                let ms = n.as_f64().ok_or_else(|| "invalid date number".to_string())?;
                let dt = DateTime::<Utc>::from_timestamp_millis(ms as i64)
                    .ok_or_else(|| format!("{ms} is out of range for a date"))?;
                Ok(match mode {
                    DateMode::Iso => Value::String(dt.format(DATE_FORMAT).to_string()),
                    DateMode::Millis => midnight_ms(dt.date_naive()).into(),
                })
            }
            other => Err(format!("expected date, got {other}")),
        },
        _ => Ok(value.clone()),
    }
}

/// Hydrate a stored value back into the column's declared mode.
pub fn hydrate(kind: &ColumnKind, value: Value) -> Value {
    match (kind, &value) {
        (ColumnKind::Timestamp(TimestampMode::Rfc3339), Value::Number(n)) => {
            match n.as_f64().and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms as i64)) {
                Some(dt) => Value::String(dt.to_rfc3339()),
                None => value,
            }
        }
        _ => value,
    }
}

fn midnight_ms(date: NaiveDate) -> f64 {
    let midnight = Utc
        .with_ymd_and_hms(date.year(), date.month(), date.day(), 0, 0, 0)
        .single()
        .expect("midnight UTC is always unambiguous");
    midnight.timestamp_millis() as f64
}
