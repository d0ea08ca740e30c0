// ABOUTME: Remote-to-local type mapping and JSON cell conversion for DuckDB
// ABOUTME: Maps BigQuery type names to DuckDB column types and converts wire values

use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use duckdb::types::{TimeUnit, Value};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Column types used in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LocalType {
    Bigint,
    Double,
    Boolean,
    Varchar,
    Timestamp,
    Date,
    Time,
}

impl LocalType {
    /// DuckDB type name used in `CREATE TABLE`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            LocalType::Bigint => "BIGINT",
            LocalType::Double => "DOUBLE",
            LocalType::Boolean => "BOOLEAN",
            LocalType::Varchar => "VARCHAR",
            LocalType::Timestamp => "TIMESTAMP",
            LocalType::Date => "DATE",
            LocalType::Time => "TIME",
        }
    }

    /// Map a BigQuery type name to a local type.
    ///
    /// Types without a lossless DuckDB counterpart (NUMERIC, BIGNUMERIC, BYTES,
    /// JSON, GEOGRAPHY, INTERVAL, ...) are stored as their text form.
    ///
    /// # Examples
    ///
    /// ```
    /// # use bq_syncer::store::LocalType;
    /// assert_eq!(LocalType::from_remote("INT64"), LocalType::Bigint);
    /// assert_eq!(LocalType::from_remote("FLOAT"), LocalType::Double);
    /// assert_eq!(LocalType::from_remote("NUMERIC"), LocalType::Varchar);
    /// ```
    pub fn from_remote(field_type: &str) -> Self {
        match field_type.to_ascii_uppercase().as_str() {
            "INTEGER" | "INT64" => LocalType::Bigint,
            "FLOAT" | "FLOAT64" => LocalType::Double,
            "BOOLEAN" | "BOOL" => LocalType::Boolean,
            "TIMESTAMP" | "DATETIME" => LocalType::Timestamp,
            "DATE" => LocalType::Date,
            "TIME" => LocalType::Time,
            _ => LocalType::Varchar,
        }
    }
}

impl std::fmt::Display for LocalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Convert a JSON cell from the remote wire format into a DuckDB value.
///
/// BigQuery's REST API returns scalars as strings: integers as decimal text,
/// TIMESTAMP as fractional epoch seconds, DATETIME as ISO-8601 without zone.
/// Numbers and booleans are also accepted in their native JSON form. Nested or
/// repeated values are stored as JSON text.
///
/// # Errors
///
/// Returns an error when a cell cannot be parsed as the column's type.
pub fn cell_to_value(cell: &JsonValue, ty: LocalType) -> Result<Value> {
    if cell.is_null() {
        return Ok(Value::Null);
    }

    let value = match ty {
        LocalType::Bigint => Value::BigInt(parse_i64(cell)?),
        LocalType::Double => Value::Double(parse_f64(cell)?),
        LocalType::Boolean => match cell {
            JsonValue::Bool(b) => Value::Boolean(*b),
            JsonValue::String(s) if s.eq_ignore_ascii_case("true") => Value::Boolean(true),
            JsonValue::String(s) if s.eq_ignore_ascii_case("false") => Value::Boolean(false),
            other => bail!("expected boolean, got {}", other),
        },
        LocalType::Varchar => match cell {
            JsonValue::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        },
        LocalType::Timestamp => Value::Timestamp(TimeUnit::Microsecond, parse_timestamp_micros(cell)?),
        LocalType::Date => {
            let text = expect_str(cell)?;
            let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .with_context(|| format!("invalid DATE '{}'", text))?;
            let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
                .ok_or_else(|| anyhow!("invalid epoch date"))?;
            Value::Date32((date - epoch).num_days() as i32)
        }
        LocalType::Time => {
            let text = expect_str(cell)?;
            let time = NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                .with_context(|| format!("invalid TIME '{}'", text))?;
            let micros = time.num_seconds_from_midnight() as i64 * 1_000_000
                + (time.nanosecond() / 1_000) as i64;
            Value::Time64(TimeUnit::Microsecond, micros)
        }
    };

    Ok(value)
}

fn expect_str(cell: &JsonValue) -> Result<&str> {
    cell.as_str()
        .ok_or_else(|| anyhow!("expected string, got {}", cell))
}

fn parse_i64(cell: &JsonValue) -> Result<i64> {
    match cell {
        JsonValue::Number(n) => n
            .as_i64()
            .ok_or_else(|| anyhow!("number {} is not a 64-bit integer", n)),
        JsonValue::String(s) => s
            .parse::<i64>()
            .with_context(|| format!("invalid integer '{}'", s)),
        other => bail!("expected integer, got {}", other),
    }
}

fn parse_f64(cell: &JsonValue) -> Result<f64> {
    match cell {
        JsonValue::Number(n) => n
            .as_f64()
            .ok_or_else(|| anyhow!("number {} is not a float", n)),
        JsonValue::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("invalid float '{}'", s)),
        other => bail!("expected float, got {}", other),
    }
}

/// TIMESTAMP cells are epoch seconds (possibly fractional or in exponent form);
/// DATETIME cells are ISO-8601 strings.
fn parse_timestamp_micros(cell: &JsonValue) -> Result<i64> {
    let seconds = match cell {
        JsonValue::String(s) => match s.parse::<f64>() {
            Ok(seconds) => seconds,
            Err(_) => {
                let parsed = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                    .with_context(|| format!("invalid TIMESTAMP or DATETIME '{}'", s))?;
                return Ok(parsed.and_utc().timestamp_micros());
            }
        },
        other => parse_f64(other)?,
    };

    if !seconds.is_finite() {
        bail!("timestamp {} is not a finite number of seconds", seconds);
    }
    Ok((seconds * 1_000_000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_remote_mapping() {
        assert_eq!(LocalType::from_remote("STRING"), LocalType::Varchar);
        assert_eq!(LocalType::from_remote("INTEGER"), LocalType::Bigint);
        assert_eq!(LocalType::from_remote("float64"), LocalType::Double);
        assert_eq!(LocalType::from_remote("BOOL"), LocalType::Boolean);
        assert_eq!(LocalType::from_remote("DATETIME"), LocalType::Timestamp);
        assert_eq!(LocalType::from_remote("DATE"), LocalType::Date);
        assert_eq!(LocalType::from_remote("GEOGRAPHY"), LocalType::Varchar);
    }

    #[test]
    fn test_integer_cells() {
        assert_eq!(cell_to_value(&json!("42"), LocalType::Bigint).unwrap(), Value::BigInt(42));
        assert_eq!(cell_to_value(&json!(-7), LocalType::Bigint).unwrap(), Value::BigInt(-7));
        assert!(cell_to_value(&json!("4.2"), LocalType::Bigint).is_err());
    }

    #[test]
    fn test_null_cells_for_any_type() {
        assert_eq!(cell_to_value(&JsonValue::Null, LocalType::Date).unwrap(), Value::Null);
        assert_eq!(cell_to_value(&JsonValue::Null, LocalType::Bigint).unwrap(), Value::Null);
    }

    #[test]
    fn test_boolean_cells() {
        assert_eq!(cell_to_value(&json!("TRUE"), LocalType::Boolean).unwrap(), Value::Boolean(true));
        assert_eq!(cell_to_value(&json!(false), LocalType::Boolean).unwrap(), Value::Boolean(false));
        assert!(cell_to_value(&json!("yes"), LocalType::Boolean).is_err());
    }

    #[test]
    fn test_timestamp_cells() {
        assert_eq!(
            cell_to_value(&json!("1.7E9"), LocalType::Timestamp).unwrap(),
            Value::Timestamp(TimeUnit::Microsecond, 1_700_000_000_000_000)
        );
        assert_eq!(
            cell_to_value(&json!("1970-01-01T00:00:01.5"), LocalType::Timestamp).unwrap(),
            Value::Timestamp(TimeUnit::Microsecond, 1_500_000)
        );
    }

    #[test]
    fn test_timestamp_cells_with_negative_exponent_or_sign() {
        assert_eq!(
            cell_to_value(&json!("1.0E-3"), LocalType::Timestamp).unwrap(),
            Value::Timestamp(TimeUnit::Microsecond, 1_000)
        );
        assert_eq!(
            cell_to_value(&json!("-1.5"), LocalType::Timestamp).unwrap(),
            Value::Timestamp(TimeUnit::Microsecond, -1_500_000)
        );
        assert!(cell_to_value(&json!("NaN"), LocalType::Timestamp).is_err());
        assert!(cell_to_value(&json!("2024-13-01T00:00:00"), LocalType::Timestamp).is_err());
    }

    #[test]
    fn test_date_and_time_cells() {
        assert_eq!(cell_to_value(&json!("1970-01-11"), LocalType::Date).unwrap(), Value::Date32(10));
        assert_eq!(
            cell_to_value(&json!("00:00:02.25"), LocalType::Time).unwrap(),
            Value::Time64(TimeUnit::Microsecond, 2_250_000)
        );
    }

    #[test]
    fn test_nested_values_become_text() {
        let value = cell_to_value(&json!([{"v": "1"}]), LocalType::Varchar).unwrap();
        assert_eq!(value, Value::Text("[{\"v\":\"1\"}]".to_string()));
    }
}
