use chrono::NaiveDate;
use polars::prelude::AnyValue;
use serde_json::{Value, json};

use crate::parse::days_since_epoch;

/// Simplified view of a ClickHouse column type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnType {
    pub base: BaseType,
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    String,
    Int,
    Float,
    Date,
    DateTime,
    Array,
    Map,
    Other,
}

/// Parse a `system.columns` type string (e.g. `Nullable(Float64)`,
/// `LowCardinality(String)`, `DateTime64(3)`).
pub fn parse_column_type(raw: &str) -> ColumnType {
    let mut inner = raw.trim();
    let mut nullable = false;

    loop {
        let lower = inner.to_lowercase();
        if lower.starts_with("nullable(") && lower.ends_with(')') {
            nullable = true;
            inner = &inner["nullable(".len()..inner.len() - 1];
            continue;
        }
        if lower.starts_with("lowcardinality(") && lower.ends_with(')') {
            inner = &inner["lowcardinality(".len()..inner.len() - 1];
            continue;
        }
        break;
    }

    let lower = inner.to_lowercase();
    let base = if lower.starts_with("map") {
        BaseType::Map
    } else if lower.starts_with("array") {
        BaseType::Array
    } else if lower.starts_with("datetime") || lower.starts_with("timestamp") {
        BaseType::DateTime
    } else if lower.starts_with("date") {
        BaseType::Date
    } else if lower.starts_with("int") || lower.starts_with("uint") {
        BaseType::Int
    } else if lower.starts_with("float") || lower.starts_with("decimal") {
        BaseType::Float
    } else if lower.starts_with("string") || lower.starts_with("fixedstring") {
        BaseType::String
    } else {
        BaseType::Other
    };

    ColumnType { base, nullable }
}

/// Default value for a non-nullable column with no source data.
pub fn default_for(column_type: &ColumnType) -> Value {
    match column_type.base {
        BaseType::String => json!(""),
        BaseType::Int | BaseType::Date | BaseType::DateTime => json!(0),
        BaseType::Float => json!(0.0),
        BaseType::Array => json!([]),
        BaseType::Map => json!({}),
        BaseType::Other => Value::Null,
    }
}

/// Coerce one frame cell into the JSON value ClickHouse expects for the
/// column type.
///
/// - Integers truncate floats; floats null out NaN.
/// - Dates accept native dates, ISO strings and `YYYYMMDD` integers and
///   emit days-since-epoch.
/// - Datetimes accept epoch integers (heuristic: > 10^12 is ms, > 10^9
///   is s) and ISO strings and emit milliseconds-since-epoch.
/// - Arrays and maps accept JSON strings and native containers.
///
/// Nullable columns receive `null` for missing data; non-nullable
/// columns receive the type's default instead.
pub fn coerce_value(value: &AnyValue, column_type: &ColumnType) -> Value {
    let missing = || {
        if column_type.nullable {
            Value::Null
        } else {
            default_for(column_type)
        }
    };

    if matches!(value, AnyValue::Null) {
        return missing();
    }

    match column_type.base {
        BaseType::String => match value {
            AnyValue::String(s) => json!(s),
            AnyValue::StringOwned(s) => json!(s.as_str()),
            other => json!(format_any(other)),
        },
        BaseType::Int => match value {
            AnyValue::Int64(v) => json!(v),
            AnyValue::Int32(v) => json!(v),
            AnyValue::UInt32(v) => json!(v),
            AnyValue::UInt64(v) => json!(v),
            AnyValue::Float64(v) => json!(v.trunc() as i64),
            AnyValue::Float32(v) => json!(v.trunc() as i64),
            AnyValue::Boolean(v) => json!(*v as i64),
            AnyValue::String(s) => s
                .trim()
                .parse::<f64>()
                .map(|v| json!(v.trunc() as i64))
                .unwrap_or_else(|_| missing()),
            _ => missing(),
        },
        BaseType::Float => match value {
            AnyValue::Float64(v) if v.is_nan() => missing(),
            AnyValue::Float64(v) => json!(v),
            AnyValue::Float32(v) if v.is_nan() => missing(),
            AnyValue::Float32(v) => json!(v),
            AnyValue::Int64(v) => json!(*v as f64),
            AnyValue::Int32(v) => json!(*v as f64),
            AnyValue::String(s) => s
                .trim()
                .parse::<f64>()
                .map(|v| json!(v))
                .unwrap_or_else(|_| missing()),
            _ => missing(),
        },
        BaseType::Date => coerce_date(value).unwrap_or_else(missing),
        BaseType::DateTime => coerce_datetime(value).unwrap_or_else(missing),
        BaseType::Array => match value {
            AnyValue::String(s) => serde_json::from_str::<Value>(s)
                .ok()
                .filter(Value::is_array)
                .unwrap_or_else(|| missing()),
            _ => missing(),
        },
        BaseType::Map => match value {
            AnyValue::String(s) => serde_json::from_str::<Value>(s)
                .ok()
                .filter(Value::is_object)
                .unwrap_or_else(|| missing()),
            _ => missing(),
        },
        BaseType::Other => missing(),
    }
}

/// Days-since-epoch from a date-shaped value.
fn coerce_date(value: &AnyValue) -> Option<Value> {
    match value {
        AnyValue::Date(days) => Some(json!(days)),
        AnyValue::Int32(v) => int_to_date_days(*v as i64).map(|d| json!(d)),
        AnyValue::Int64(v) => int_to_date_days(*v).map(|d| json!(d)),
        AnyValue::String(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .ok()
            .map(|d| json!(days_since_epoch(d))),
        _ => None,
    }
}

/// `YYYYMMDD` integers and small values already in days.
fn int_to_date_days(v: i64) -> Option<i32> {
    if (19000101..=29991231).contains(&v) {
        let year = (v / 10_000) as i32;
        let month = ((v / 100) % 100) as u32;
        let day = (v % 100) as u32;
        NaiveDate::from_ymd_opt(year, month, day).map(days_since_epoch)
    } else if (0..200_000).contains(&v) {
        Some(v as i32)
    } else {
        None
    }
}

/// Milliseconds-since-epoch from a datetime-shaped value.
fn coerce_datetime(value: &AnyValue) -> Option<Value> {
    match value {
        AnyValue::Int64(v) => Some(json!(epoch_to_ms(*v))),
        AnyValue::Int32(v) => Some(json!(epoch_to_ms(*v as i64))),
        AnyValue::Date(days) => Some(json!(*days as i64 * 86_400_000)),
        AnyValue::String(s) => {
            let s = s.trim();
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
                .ok()
                .map(|dt| json!(dt.and_utc().timestamp_millis()))
                .or_else(|| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .ok()
                        .map(|d| json!(days_since_epoch(d) as i64 * 86_400_000))
                })
        }
        _ => None,
    }
}

/// Values above 10^12 are already milliseconds; above 10^9, seconds.
fn epoch_to_ms(v: i64) -> i64 {
    if v > 1_000_000_000_000 {
        v
    } else if v > 1_000_000_000 {
        v * 1000
    } else {
        v
    }
}

fn format_any(value: &AnyValue) -> String {
    match value {
        AnyValue::Float64(v) => v.to_string(),
        AnyValue::Int64(v) => v.to_string(),
        AnyValue::Boolean(v) => v.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(raw: &str) -> ColumnType {
        parse_column_type(raw)
    }

    #[test]
    fn type_parsing_unwraps_nullable_and_lowcardinality() {
        assert_eq!(
            t("Nullable(Float64)"),
            ColumnType {
                base: BaseType::Float,
                nullable: true
            }
        );
        assert_eq!(
            t("LowCardinality(String)"),
            ColumnType {
                base: BaseType::String,
                nullable: false
            }
        );
        assert_eq!(t("DateTime64(3)").base, BaseType::DateTime);
        assert_eq!(t("Date").base, BaseType::Date);
        assert_eq!(t("Array(String)").base, BaseType::Array);
        assert_eq!(t("Map(String, String)").base, BaseType::Map);
        assert_eq!(t("UInt64").base, BaseType::Int);
    }

    #[test]
    fn integers_truncate_floats() {
        let ty = t("Int64");
        assert_eq!(coerce_value(&AnyValue::Float64(12.9), &ty), json!(12));
        assert_eq!(coerce_value(&AnyValue::Float64(-3.7), &ty), json!(-3));
    }

    #[test]
    fn nan_becomes_null_or_zero() {
        assert_eq!(
            coerce_value(&AnyValue::Float64(f64::NAN), &t("Nullable(Float64)")),
            Value::Null
        );
        assert_eq!(
            coerce_value(&AnyValue::Float64(f64::NAN), &t("Float64")),
            json!(0.0)
        );
    }

    #[test]
    fn missing_values_respect_nullability() {
        assert_eq!(coerce_value(&AnyValue::Null, &t("Nullable(Int64)")), Value::Null);
        assert_eq!(coerce_value(&AnyValue::Null, &t("Int64")), json!(0));
        assert_eq!(coerce_value(&AnyValue::Null, &t("String")), json!(""));
        assert_eq!(coerce_value(&AnyValue::Null, &t("Array(String)")), json!([]));
        assert_eq!(coerce_value(&AnyValue::Null, &t("Map(String,String)")), json!({}));
    }

    #[test]
    fn dates_accept_three_representations() {
        let ty = t("Date");
        // Native date (already days).
        assert_eq!(coerce_value(&AnyValue::Date(19737), &ty), json!(19737));
        // ISO string.
        assert_eq!(coerce_value(&AnyValue::String("2024-01-15"), &ty), json!(19737));
        // YYYYMMDD integer.
        assert_eq!(coerce_value(&AnyValue::Int64(20240115), &ty), json!(19737));
    }

    #[test]
    fn datetimes_use_the_epoch_heuristic() {
        let ty = t("DateTime64(3)");
        // Already milliseconds.
        assert_eq!(
            coerce_value(&AnyValue::Int64(1_705_276_800_000), &ty),
            json!(1_705_276_800_000i64)
        );
        // Seconds are promoted.
        assert_eq!(
            coerce_value(&AnyValue::Int64(1_705_276_800), &ty),
            json!(1_705_276_800_000i64)
        );
        // ISO string.
        assert_eq!(
            coerce_value(&AnyValue::String("2024-01-15T00:00:00"), &ty),
            json!(1_705_276_800_000i64)
        );
    }

    #[test]
    fn containers_parse_from_json_strings() {
        assert_eq!(
            coerce_value(&AnyValue::String(r#"[1, 2]"#), &t("Array(Int64)")),
            json!([1, 2])
        );
        assert_eq!(
            coerce_value(&AnyValue::String(r#"{"k": "v"}"#), &t("Map(String,String)")),
            json!({"k": "v"})
        );
        // Malformed container strings fall back to the default.
        assert_eq!(
            coerce_value(&AnyValue::String("not json"), &t("Array(Int64)")),
            json!([])
        );
    }

    #[test]
    fn strings_render_scalars() {
        let ty = t("String");
        assert_eq!(coerce_value(&AnyValue::Int64(42), &ty), json!("42"));
        assert_eq!(coerce_value(&AnyValue::Boolean(true), &ty), json!("true"));
    }
}
