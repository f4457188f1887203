//! PostgreSQL 텍스트 값 변환
//!
//! pgoutput은 타입 OID, test_decoding은 타입 이름으로 값을 넘겨줍니다.
//! 둘 다 [`PgType`]으로 모은 뒤 같은 규칙으로 [`ColumnValue`]를 만듭니다.

use crate::error::{CdcError, Result};
use crate::value::{ColumnValue, DateTimeValue, DateValue, TimeValue};
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::str::FromStr;
use uuid::Uuid;

/// 변환을 아는 PostgreSQL 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgType {
    Bool,
    Bytea,
    Int2,
    Int4,
    Int8,
    Oid,
    Float4,
    Float8,
    Numeric,
    Text,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Json,
    Jsonb,
    Uuid,
    /// 그 밖의 타입은 텍스트 그대로
    Unknown,
}

impl PgType {
    pub fn from_oid(oid: u32) -> Self {
        match oid {
            16 => PgType::Bool,
            17 => PgType::Bytea,
            20 => PgType::Int8,
            21 => PgType::Int2,
            23 => PgType::Int4,
            26 => PgType::Oid,
            18 | 19 | 25 | 1042 | 1043 => PgType::Text,
            114 => PgType::Json,
            700 => PgType::Float4,
            701 => PgType::Float8,
            1082 => PgType::Date,
            1083 => PgType::Time,
            1114 => PgType::Timestamp,
            1184 => PgType::TimestampTz,
            1700 => PgType::Numeric,
            2950 => PgType::Uuid,
            3802 => PgType::Jsonb,
            _ => PgType::Unknown,
        }
    }

    /// `character varying(20)`, `numeric(10,2)` 같은 typmod는 무시
    pub fn from_name(name: &str) -> Self {
        let base = match name.find('(') {
            Some(index) if !name.ends_with("[]") => {
                let close = name[index..].find(')').map(|i| index + i + 1).unwrap_or(name.len());
                format!("{}{}", name[..index].trim_end(), &name[close..])
            }
            _ => name.to_string(),
        };
        match base.trim() {
            "boolean" | "bool" => PgType::Bool,
            "bytea" => PgType::Bytea,
            "smallint" | "int2" => PgType::Int2,
            "integer" | "int" | "int4" => PgType::Int4,
            "bigint" | "int8" => PgType::Int8,
            "oid" => PgType::Oid,
            "real" | "float4" => PgType::Float4,
            "double precision" | "float8" => PgType::Float8,
            "numeric" | "decimal" => PgType::Numeric,
            "text" | "character varying" | "varchar" | "character" | "char" | "bpchar" | "name"
            | "\"char\"" => PgType::Text,
            "date" => PgType::Date,
            "time" | "time without time zone" => PgType::Time,
            "timestamp" | "timestamp without time zone" => PgType::Timestamp,
            "timestamptz" | "timestamp with time zone" => PgType::TimestampTz,
            "json" => PgType::Json,
            "jsonb" => PgType::Jsonb,
            "uuid" => PgType::Uuid,
            _ => PgType::Unknown,
        }
    }
}

/// 텍스트 표현을 컬럼 값으로 변환
pub fn convert_text(pg_type: PgType, column: &str, text: &str) -> Result<ColumnValue> {
    let invalid = |detail: String| {
        CdcError::ValueError(format!("column {} ({:?}): {}", column, pg_type, detail))
    };

    let value = match pg_type {
        PgType::Bool => match text {
            "t" | "true" => ColumnValue::Bool(true),
            "f" | "false" => ColumnValue::Bool(false),
            other => return Err(invalid(format!("invalid boolean {:?}", other))),
        },
        PgType::Int2 | PgType::Int4 | PgType::Int8 => ColumnValue::Int(
            text.parse()
                .map_err(|e| invalid(format!("{:?}: {}", text, e)))?,
        ),
        PgType::Oid => ColumnValue::UInt(
            text.parse()
                .map_err(|e| invalid(format!("{:?}: {}", text, e)))?,
        ),
        PgType::Float4 => ColumnValue::Float(
            text.parse()
                .map_err(|e| invalid(format!("{:?}: {}", text, e)))?,
        ),
        PgType::Float8 => ColumnValue::Double(
            text.parse()
                .map_err(|e| invalid(format!("{:?}: {}", text, e)))?,
        ),
        PgType::Numeric => {
            if text.eq_ignore_ascii_case("NaN") || text.ends_with("Infinity") {
                ColumnValue::String(text.to_string())
            } else {
                ColumnValue::Decimal(
                    BigDecimal::from_str(text).map_err(|e| invalid(format!("{:?}: {}", text, e)))?,
                )
            }
        }
        PgType::Bytea => {
            let hex_text = text
                .strip_prefix("\\x")
                .ok_or_else(|| invalid("bytea is not in hex format".to_string()))?;
            ColumnValue::Bytes(hex::decode(hex_text).map_err(|e| invalid(e.to_string()))?)
        }
        PgType::Date if is_special_temporal(text) => ColumnValue::String(text.to_string()),
        PgType::Date => {
            let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map_err(|e| invalid(format!("{:?}: {}", text, e)))?;
            ColumnValue::Date(DateValue::from_naive(date))
        }
        PgType::Time => {
            let time = NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                .map_err(|e| invalid(format!("{:?}: {}", text, e)))?;
            ColumnValue::Time(TimeValue {
                negative: false,
                hours: time.hour(),
                minutes: time.minute() as u8,
                seconds: time.second() as u8,
                nanos: time.nanosecond(),
            })
        }
        PgType::Timestamp if is_special_temporal(text) => ColumnValue::String(text.to_string()),
        PgType::Timestamp => {
            let datetime = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|e| invalid(format!("{:?}: {}", text, e)))?;
            ColumnValue::DateTime(DateTimeValue::from_naive(datetime))
        }
        PgType::TimestampTz if is_special_temporal(text) => ColumnValue::String(text.to_string()),
        PgType::TimestampTz => ColumnValue::TimestampTz(
            DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
                .map_err(|e| invalid(format!("{:?}: {}", text, e)))?,
        ),
        PgType::Json | PgType::Jsonb => ColumnValue::Json(
            serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?,
        ),
        PgType::Uuid => ColumnValue::Uuid(
            Uuid::parse_str(text).map_err(|e| invalid(e.to_string()))?,
        ),
        PgType::Text | PgType::Unknown => ColumnValue::String(text.to_string()),
    };
    Ok(value)
}

/// infinity, BC 날짜는 값 타입으로 표현하지 않음
fn is_special_temporal(text: &str) -> bool {
    text.ends_with("infinity") || text.ends_with(" BC")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_lookup() {
        assert_eq!(PgType::from_oid(23), PgType::Int4);
        assert_eq!(PgType::from_oid(1043), PgType::Text);
        assert_eq!(PgType::from_oid(600), PgType::Unknown);
        assert_eq!(PgType::from_name("character varying(20)"), PgType::Text);
        assert_eq!(PgType::from_name("numeric(10,2)"), PgType::Numeric);
        assert_eq!(
            PgType::from_name("timestamp(3) without time zone"),
            PgType::Timestamp
        );
        assert_eq!(PgType::from_name("integer[]"), PgType::Unknown);
    }

    #[test]
    fn test_convert_scalars() {
        assert_eq!(convert_text(PgType::Bool, "c", "t").unwrap(), ColumnValue::Bool(true));
        assert_eq!(convert_text(PgType::Int8, "c", "-42").unwrap(), ColumnValue::Int(-42));
        assert_eq!(convert_text(PgType::Oid, "c", "16384").unwrap(), ColumnValue::UInt(16384));
        assert_eq!(convert_text(PgType::Float8, "c", "1.5").unwrap(), ColumnValue::Double(1.5));
        assert_eq!(
            convert_text(PgType::Numeric, "c", "1234567890.1234").unwrap(),
            ColumnValue::Decimal(BigDecimal::from_str("1234567890.1234").unwrap())
        );
        assert_eq!(
            convert_text(PgType::Numeric, "c", "NaN").unwrap(),
            ColumnValue::String("NaN".into())
        );
        assert_eq!(
            convert_text(PgType::Bytea, "c", "\\xdeadbeef").unwrap(),
            ColumnValue::Bytes(vec![0xDE, 0xAD, 0xBE, 0xEF])
        );
        assert_eq!(
            convert_text(PgType::Unknown, "c", "(1,2)").unwrap(),
            ColumnValue::String("(1,2)".into())
        );
    }

    #[test]
    fn test_convert_temporal() {
        assert_eq!(
            convert_text(PgType::Date, "c", "2019-10-17").unwrap().to_string(),
            "2019-10-17"
        );
        assert_eq!(
            convert_text(PgType::Time, "c", "10:15:31").unwrap(),
            ColumnValue::Time(TimeValue::new(10, 15, 31))
        );
        assert_eq!(
            convert_text(PgType::Timestamp, "c", "2019-10-16 16:48:37").unwrap(),
            ColumnValue::DateTime(DateTimeValue::new(2019, 10, 16, 16, 48, 37))
        );
        match convert_text(PgType::TimestampTz, "c", "2019-10-16 08:32:13.5+08").unwrap() {
            ColumnValue::TimestampTz(ts) => {
                assert_eq!(ts.timestamp(), 1_571_185_933);
                assert_eq!(ts.timestamp_subsec_millis(), 500);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            convert_text(PgType::Timestamp, "c", "infinity").unwrap(),
            ColumnValue::String("infinity".into())
        );
    }

    #[test]
    fn test_convert_json_and_uuid() {
        assert_eq!(
            convert_text(PgType::Jsonb, "c", r#"{"a": [1, 2]}"#).unwrap(),
            ColumnValue::Json(serde_json::json!({"a": [1, 2]}))
        );
        assert!(matches!(
            convert_text(PgType::Uuid, "c", "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11").unwrap(),
            ColumnValue::Uuid(_)
        ));
    }

    #[test]
    fn test_conversion_error_names_column() {
        let err = convert_text(PgType::Int4, "order_id", "abc").unwrap_err();
        assert!(err.to_string().contains("order_id"));
        assert!(convert_text(PgType::Bool, "flag", "maybe").is_err());
    }
}
