//! openGauss mppdb_decoding 출력 디코더
//!
//! 트랜잭션 경계는 텍스트, 행 변경은 JSON 한 줄로 옵니다. 병렬 디코딩이면 경계 형식이 다릅니다.
//!
//! ```text
//! BEGIN 1
//! {"table_name":"public.t_order","op_type":"INSERT","columns_name":["order_id"],"columns_type":["integer"],"columns_val":["1"],...}
//! COMMIT 1 (at 2022-10-27 04:19:39.476261+00) CSN 3468
//!
//! BEGIN CSN: 951909 first_lsn: 5/59825858
//! commit xid: 1006076
//! ```

use crate::error::{CdcError, Result};
use crate::pg_value::{convert_text, PgType};
use crate::record::{Operation, RecordColumn};
use crate::test_decoding::parse_commit_time;
use crate::value::ColumnValue;
use crate::wal::{WalMessage, WalScope};
use serde::Deserialize;
use tracing::debug;

/// JSON 행 변경 한 건
#[derive(Debug, Deserialize)]
struct MppTableData {
    table_name: String,
    op_type: String,
    #[serde(default)]
    columns_name: Option<Vec<String>>,
    #[serde(default)]
    columns_type: Option<Vec<String>>,
    #[serde(default)]
    columns_val: Option<Vec<String>>,
    #[serde(default)]
    old_keys_name: Option<Vec<String>>,
    #[serde(default)]
    old_keys_type: Option<Vec<String>>,
    #[serde(default)]
    old_keys_val: Option<Vec<String>>,
}

#[derive(Debug, Default)]
pub struct MppdbDecodingDecoder;

impl MppdbDecodingDecoder {
    pub fn new() -> Self {
        MppdbDecodingDecoder
    }

    pub fn decode(&mut self, data: &[u8], scope: &WalScope) -> Result<WalMessage> {
        let text = std::str::from_utf8(data)
            .map_err(|e| CdcError::decode(0, format!("mppdb_decoding output is not UTF-8: {}", e)))?;

        if text.starts_with('{') {
            let row: MppTableData = serde_json::from_str(text)
                .map_err(|e| CdcError::decode(0, format!("invalid mppdb_decoding row: {}", e)))?;
            return decode_row(row, scope);
        }
        if starts_with_ignore_case(text, "BEGIN") {
            // 병렬 디코딩의 "BEGIN CSN: ..."에는 xid가 없음
            return Ok(WalMessage::Begin {
                xid: text[5..].trim().parse().ok(),
                commit_time: None,
            });
        }
        if starts_with_ignore_case(text, "COMMIT") {
            return Ok(WalMessage::Commit {
                end_lsn: None,
                commit_time: parse_commit_time(&text[6..]),
            });
        }
        debug!("Ignoring mppdb_decoding output: {}", text);
        Ok(WalMessage::Ignored)
    }
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.get(..prefix.len())
        .map_or(false, |head| head.eq_ignore_ascii_case(prefix))
}

fn decode_row(row: MppTableData, scope: &WalScope) -> Result<WalMessage> {
    let operation = match row.op_type.as_str() {
        "INSERT" => Operation::Insert,
        "UPDATE" => Operation::Update,
        "DELETE" => Operation::Delete,
        other => {
            return Err(CdcError::decode(0, format!("unknown mppdb_decoding op_type {}", other)));
        }
    };
    let (schema, table_name) = row.table_name.split_once('.').ok_or_else(|| {
        CdcError::decode(0, format!("table name without schema: {}", row.table_name))
    })?;

    let Some(table) = scope.resolve(schema, table_name) else {
        debug!("Skipping unmapped table {}", row.table_name);
        return Ok(WalMessage::Ignored);
    };

    let before = columns(row.old_keys_name, row.old_keys_type, row.old_keys_val, true)?;
    let mut after = match operation {
        Operation::Delete => Vec::new(),
        _ => columns(row.columns_name, row.columns_type, row.columns_val, false)?,
    };
    for column in &mut after {
        column.updated = match before.iter().find(|b| b.name == column.name) {
            Some(old) => {
                column.unique_key = true;
                old.value != column.value
            }
            None => operation == Operation::Update,
        };
    }

    Ok(WalMessage::Row {
        operation,
        table,
        before: if operation == Operation::Insert {
            Vec::new()
        } else {
            before
        },
        after,
    })
}

fn columns(
    names: Option<Vec<String>>,
    types: Option<Vec<String>>,
    values: Option<Vec<String>>,
    key: bool,
) -> Result<Vec<RecordColumn>> {
    let names = names.unwrap_or_default();
    let types = types.unwrap_or_default();
    let values = values.unwrap_or_default();
    if names.len() != types.len() || names.len() != values.len() {
        return Err(CdcError::decode(
            0,
            format!(
                "column arrays differ in length: {} names, {} types, {} values",
                names.len(),
                types.len(),
                values.len()
            ),
        ));
    }

    names
        .into_iter()
        .zip(types)
        .zip(values)
        .map(|((name, type_name), raw)| {
            let value = column_value(&type_name, &name, &raw)?;
            Ok(RecordColumn {
                name,
                value,
                unique_key: key,
                updated: false,
            })
        })
        .collect()
}

/// 값은 문자열이면 작은따옴표로 감싸고 '' 이스케이프, NULL은 따옴표 없는 null
fn column_value(type_name: &str, column: &str, raw: &str) -> Result<ColumnValue> {
    if raw == "null" {
        return Ok(ColumnValue::Null);
    }
    let text = unquote(raw);
    match base_type(type_name) {
        // "$1,234.08" 통화 기호와 자리 구분자는 버림
        "money" => Ok(ColumnValue::String(text.replace(['$', ','], ""))),
        base => convert_text(pg_type(base, type_name), column, &text),
    }
}

fn unquote(raw: &str) -> String {
    match raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
        Some(inner) => inner.replace("''", "'"),
        None => raw.to_string(),
    }
}

fn base_type(type_name: &str) -> &str {
    type_name.split('(').next().unwrap_or(type_name).trim()
}

/// openGauss 전용 타입 이름을 PostgreSQL 타입으로 맞춤
fn pg_type(base: &str, type_name: &str) -> PgType {
    match base {
        "tinyint" => PgType::Int2,
        "binary_integer" => PgType::Int4,
        "nchar" | "varchar2" | "nvarchar2" | "clob" => PgType::Text,
        "smalldatetime" => PgType::Timestamp,
        _ => PgType::from_name(type_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TableMapping;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn scope() -> WalScope {
        WalScope::new(TableMapping::new(), None)
    }

    fn decode(text: &str) -> Result<WalMessage> {
        MppdbDecodingDecoder::new().decode(text.as_bytes(), &scope())
    }

    fn insert(types: &[&str], values: &[&str]) -> String {
        let names: Vec<String> = (0..types.len()).map(|i| format!("data{}", i)).collect();
        json!({
            "table_name": "public.test",
            "op_type": "INSERT",
            "columns_name": names,
            "columns_type": types,
            "columns_val": values,
            "old_keys_name": null,
            "old_keys_type": null,
            "old_keys_val": null,
        })
        .to_string()
    }

    fn after(message: WalMessage) -> Vec<RecordColumn> {
        match message {
            WalMessage::Row {
                operation: Operation::Insert,
                table,
                after,
                ..
            } => {
                assert_eq!(table.schema.as_deref(), Some("public"));
                assert_eq!(table.table, "test");
                after
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_transaction_boundaries() {
        assert_eq!(
            decode("BEGIN 1").unwrap(),
            WalMessage::Begin {
                xid: Some(1),
                commit_time: None
            }
        );
        assert_eq!(
            decode("COMMIT 1 (at 2022-10-27 04:19:39.476261+00) CSN 3468").unwrap(),
            WalMessage::Commit {
                end_lsn: None,
                commit_time: Some(
                    Utc.with_ymd_and_hms(2022, 10, 27, 4, 19, 39).unwrap()
                        + chrono::Duration::microseconds(476_261)
                ),
            }
        );

        // 병렬 디코딩 형식
        assert_eq!(
            decode("BEGIN CSN: 951909 first_lsn: 5/59825858").unwrap(),
            WalMessage::Begin {
                xid: None,
                commit_time: None
            }
        );
        assert_eq!(
            decode("commit xid: 1006076").unwrap(),
            WalMessage::Commit {
                end_lsn: None,
                commit_time: None
            }
        );
    }

    #[test]
    fn test_insert_character_types() {
        let types = [
            "character varying",
            "text",
            "char",
            "character",
            "nchar",
            "varchar2",
            "nvarchar2(20)",
            "clob",
        ];
        let columns = after(decode(&insert(&types, &["'1 2 3'"; 8])).unwrap());
        assert_eq!(columns.len(), 8);
        for column in &columns {
            assert_eq!(column.value, ColumnValue::String("1 2 3".into()));
            assert!(!column.unique_key);
        }
        assert_eq!(columns[7].name, "data7");
    }

    #[test]
    fn test_special_values() {
        let columns = after(
            decode(&insert(
                &["money", "boolean", "bytea", "raw", "tsquery", "tsrange", "tinyint", "text"],
                &[
                    "'$1,001.08'",
                    "true",
                    "'\\xff00ab'",
                    "'7D'",
                    "'''fff'' | ''faa'''",
                    "'[\"2020-01-01 00:00:00\",\"2021-01-01 00:00:00\")'",
                    "255",
                    "null",
                ],
            ))
            .unwrap(),
        );
        assert_eq!(columns[0].value, ColumnValue::String("1001.08".into()));
        assert_eq!(columns[1].value, ColumnValue::Bool(true));
        assert_eq!(columns[2].value, ColumnValue::Bytes(vec![0xFF, 0x00, 0xAB]));
        assert_eq!(columns[3].value, ColumnValue::String("7D".into()));
        assert_eq!(columns[4].value, ColumnValue::String("'fff' | 'faa'".into()));
        assert_eq!(
            columns[5].value,
            ColumnValue::String("[\"2020-01-01 00:00:00\",\"2021-01-01 00:00:00\")".into())
        );
        assert_eq!(columns[6].value, ColumnValue::Int(255));
        assert_eq!(columns[7].value, ColumnValue::Null);
    }

    #[test]
    fn test_temporal_values() {
        let columns = after(
            decode(&insert(
                &["time without time zone", "smalldatetime", "date", "interval"],
                &["'21:21:21'", "'2003-04-12 04:05:06'", "'2021-10-10'", "'3 days'"],
            ))
            .unwrap(),
        );
        assert_eq!(columns[0].value.to_string(), "21:21:21");
        assert_eq!(columns[1].value.to_string(), "2003-04-12 04:05:06");
        assert_eq!(columns[2].value.to_string(), "2021-10-10");
        assert_eq!(columns[3].value, ColumnValue::String("3 days".into()));

        let err = decode(&insert(&["time without time zone"], &["'1 2 3'"])).unwrap_err();
        assert!(err.to_string().contains("data0"));
    }

    #[test]
    fn test_delete_uses_old_keys() {
        let row = json!({
            "table_name": "public.test",
            "op_type": "DELETE",
            "old_keys_name": ["data0", "data1", "data2", "data3", "data4"],
            "old_keys_type": ["tinyint", "smallint", "integer", "binary_integer", "bigint"],
            "old_keys_val": ["46", "30000", "2147483645", "2147483646", "9223372036854775806"],
        });
        match decode(&row.to_string()).unwrap() {
            WalMessage::Row {
                operation,
                before,
                after,
                ..
            } => {
                assert_eq!(operation, Operation::Delete);
                assert!(after.is_empty());
                assert_eq!(before.len(), 5);
                assert!(before.iter().all(|c| c.unique_key));
                assert_eq!(before[0].value, ColumnValue::Int(46));
                assert_eq!(before[3].value, ColumnValue::Int(2_147_483_646));
                assert_eq!(before[4].value, ColumnValue::Int(9_223_372_036_854_775_806));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_update_marks_changed_columns() {
        let row = json!({
            "table_name": "public.test",
            "op_type": "UPDATE",
            "columns_name": ["id", "status"],
            "columns_type": ["integer", "character varying"],
            "columns_val": ["1", "'PAID'"],
            "old_keys_name": ["id"],
            "old_keys_type": ["integer"],
            "old_keys_val": ["1"],
        });
        match decode(&row.to_string()).unwrap() {
            WalMessage::Row {
                operation,
                before,
                after,
                ..
            } => {
                assert_eq!(operation, Operation::Update);
                assert_eq!(before.len(), 1);
                assert!(after[0].unique_key);
                assert!(!after[0].updated);
                assert!(!after[1].unique_key);
                assert!(after[1].updated);
                assert_eq!(after[1].value, ColumnValue::String("PAID".into()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert_eq!(decode("unknown").unwrap(), WalMessage::Ignored);

        let unknown_op = json!({
            "table_name": "public.test",
            "op_type": "UNKNOWN",
            "columns_name": ["data"],
            "columns_type": ["character varying"],
            "columns_val": ["1 2 3"],
        });
        assert!(matches!(
            decode(&unknown_op.to_string()),
            Err(CdcError::ProtocolDecode { .. })
        ));

        let short = json!({
            "table_name": "public.test",
            "op_type": "INSERT",
            "columns_name": ["a", "b"],
            "columns_type": ["integer"],
            "columns_val": ["1", "2"],
        });
        assert!(decode(&short.to_string()).is_err());
        assert!(decode("{\"table_name\": ").is_err());
    }

    #[test]
    fn test_unmapped_table_is_ignored() {
        let scope = WalScope::new(TableMapping::new().with("t_user", "user"), None);
        let mut decoder = MppdbDecodingDecoder::new();
        assert_eq!(
            decoder
                .decode(insert(&["integer"], &["oops"]).as_bytes(), &scope)
                .unwrap(),
            WalMessage::Ignored
        );
    }
}
