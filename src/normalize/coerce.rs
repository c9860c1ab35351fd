//! JSON → column value coercion.
//!
//! The API has changed field representations over time (numbers sent as
//! strings, seasons sent as `"2023-24"`, minutes sent as `"34:12"`).
//! Every accepted representation is listed here; anything else is a
//! schema mismatch.

use serde_json::Value;

use super::schema::ColumnKind;
use crate::types::SqlValue;

/// Coerce `value` into a column of `kind`.
///
/// Returns `Some(SqlValue::Null)` for JSON null and for blank strings in
/// non-text columns, `None` when the value cannot be represented.
pub fn coerce(kind: ColumnKind, value: &Value) -> Option<SqlValue> {
    if value.is_null() {
        return Some(SqlValue::Null);
    }
    if kind != ColumnKind::Text {
        if let Value::String(s) = value {
            if s.trim().is_empty() {
                return Some(SqlValue::Null);
            }
        }
    }

    match kind {
        ColumnKind::Integer => to_integer(value).map(SqlValue::Integer),
        ColumnKind::Real => to_real(value).map(SqlValue::Real),
        ColumnKind::Text => to_text(value).map(SqlValue::Text),
        ColumnKind::Bool => to_bool(value).map(SqlValue::Bool),
        ColumnKind::Season => to_season(value).map(SqlValue::Integer),
        ColumnKind::Minutes => to_minutes(value).map(SqlValue::Real),
    }
}

/// Short description of a JSON value for error messages.
pub fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => {
            let shown: String = s.chars().take(32).collect();
            format!("string {shown:?}")
        }
        Value::Array(a) => format!("array of {}", a.len()),
        Value::Object(_) => "object".to_string(),
    }
}

fn to_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_real(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// `2023`, `"2023"` and `"2023-24"` all mean the season starting in 2023.
fn to_season(value: &Value) -> Option<i64> {
    match value {
        Value::Number(_) => to_integer(value),
        Value::String(s) => {
            let s = s.trim();
            let start = s.get(..4)?;
            let rest = s.get(4..)?;
            if !start.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let suffix_ok = rest.is_empty()
                || (rest.len() == 3
                    && rest.starts_with('-')
                    && rest[1..].bytes().all(|b| b.is_ascii_digit()));
            if suffix_ok {
                start.parse().ok()
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Minutes as a number, a numeric string, or an `"MM:SS"` clock.
fn to_minutes(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            match s.split_once(':') {
                Some((mm, ss)) => {
                    let minutes: u32 = mm.parse().ok()?;
                    let seconds: u32 = ss.parse().ok()?;
                    if seconds >= 60 {
                        return None;
                    }
                    Some(f64::from(minutes) + f64::from(seconds) / 60.0)
                }
                None => s.parse::<f64>().ok().filter(|f| f.is_finite()),
            }
        }
        _ => None,
    }
}
