//! 정규화된 변경 레코드
//!
//! 덤퍼가 만들어 채널로 넘기는 단위입니다. 생성 후에는 바뀌지 않습니다.

use crate::position::IngestPosition;
use crate::value::ColumnValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Ddl,
    /// 위치만 전달하는 레코드 (트랜잭션 경계 등)
    Placeholder,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Ddl => "DDL",
            Operation::Placeholder => "PLACEHOLDER",
        }
    }
}

/// 물리 테이블과 논리 테이블 이름
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: Option<String>,
    pub table: String,
    pub logical: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordColumn {
    pub name: String,
    pub value: ColumnValue,
    pub unique_key: bool,
    pub updated: bool,
}

impl RecordColumn {
    pub fn new(name: impl Into<String>, value: ColumnValue) -> Self {
        RecordColumn {
            name: name.into(),
            value,
            unique_key: false,
            updated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub operation: Operation,
    pub table: Option<TableRef>,
    pub before: Vec<RecordColumn>,
    pub after: Vec<RecordColumn>,
    pub ddl: Option<String>,
    pub commit_time: Option<DateTime<Utc>>,
    pub position: IngestPosition,
}

impl ChangeRecord {
    pub fn placeholder(position: IngestPosition) -> Self {
        ChangeRecord {
            operation: Operation::Placeholder,
            table: None,
            before: Vec::new(),
            after: Vec::new(),
            ddl: None,
            commit_time: None,
            position,
        }
    }

    pub fn row(
        operation: Operation,
        table: TableRef,
        before: Vec<RecordColumn>,
        after: Vec<RecordColumn>,
        position: IngestPosition,
    ) -> Self {
        ChangeRecord {
            operation,
            table: Some(table),
            before,
            after,
            ddl: None,
            commit_time: None,
            position,
        }
    }

    pub fn ddl(table: Option<TableRef>, sql: impl Into<String>, position: IngestPosition) -> Self {
        ChangeRecord {
            operation: Operation::Ddl,
            table,
            before: Vec::new(),
            after: Vec::new(),
            ddl: Some(sql.into()),
            commit_time: None,
            position,
        }
    }

    pub fn with_commit_time(mut self, commit_time: Option<DateTime<Utc>>) -> Self {
        self.commit_time = commit_time;
        self
    }

    pub fn is_placeholder(&self) -> bool {
        self.operation == Operation::Placeholder
    }

    /// after 이미지 우선, 없으면 before 이미지에서 찾기
    pub fn column(&self, name: &str) -> Option<&RecordColumn> {
        self.after
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.before.iter().find(|c| c.name == name))
    }

    pub fn unique_key_values(&self) -> Vec<&ColumnValue> {
        let image = if self.operation == Operation::Delete {
            &self.before
        } else {
            &self.after
        };
        image.iter().filter(|c| c.unique_key).map(|c| &c.value).collect()
    }
}

/// 실제 테이블 -> 논리 테이블 매핑 (대소문자 무시)
///
/// "schema.table" 키가 "table" 키보다 우선합니다. 매핑이 비어 있으면 모든 테이블을
/// 실제 이름 그대로 수집합니다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    entries: HashMap<String, String>,
}

impl TableMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, actual: &str, logical: impl Into<String>) {
        self.entries.insert(actual.to_lowercase(), logical.into());
    }

    pub fn with(mut self, actual: &str, logical: impl Into<String>) -> Self {
        self.insert(actual, logical);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolve(&self, schema: Option<&str>, table: &str) -> Option<TableRef> {
        let logical = if self.entries.is_empty() {
            table.to_string()
        } else {
            let qualified = schema.map(|s| format!("{}.{}", s, table).to_lowercase());
            qualified
                .and_then(|key| self.entries.get(&key))
                .or_else(|| self.entries.get(&table.to_lowercase()))?
                .clone()
        };
        Some(TableRef {
            schema: schema.map(str::to_string),
            table: table.to_string(),
            logical,
        })
    }

    pub fn contains(&self, schema: Option<&str>, table: &str) -> bool {
        self.resolve(schema, table).is_some()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for TableMapping {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut mapping = TableMapping::new();
        for (actual, logical) in iter {
            mapping.insert(actual.as_ref(), logical);
        }
        mapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Lsn;

    #[test]
    fn test_table_mapping_resolution() {
        let mapping = TableMapping::new()
            .with("shop.t_order_0", "t_order")
            .with("T_ORDER_1", "t_order");

        let resolved = mapping.resolve(Some("SHOP"), "T_Order_0").unwrap();
        assert_eq!(resolved.logical, "t_order");
        assert_eq!(resolved.table, "T_Order_0");
        assert!(mapping.contains(Some("other"), "t_order_1"));
        assert!(!mapping.contains(Some("other"), "t_order_0"));
        assert!(!mapping.contains(None, "t_user"));
    }

    #[test]
    fn test_empty_mapping_captures_everything() {
        let mapping = TableMapping::new();
        let resolved = mapping.resolve(Some("db"), "t_user").unwrap();
        assert_eq!(resolved.logical, "t_user");
    }

    #[test]
    fn test_record_accessors() {
        let table = TableRef {
            schema: None,
            table: "t".into(),
            logical: "t".into(),
        };
        let mut id = RecordColumn::new("id", ColumnValue::Int(7));
        id.unique_key = true;
        let record = ChangeRecord::row(
            Operation::Delete,
            table,
            vec![id, RecordColumn::new("name", ColumnValue::String("a".into()))],
            Vec::new(),
            IngestPosition::Wal(Lsn(1)),
        );
        assert_eq!(record.column("name").unwrap().value, ColumnValue::String("a".into()));
        assert_eq!(record.unique_key_values(), vec![&ColumnValue::Int(7)]);
        assert!(!record.is_placeholder());
        assert!(ChangeRecord::placeholder(IngestPosition::Wal(Lsn(2))).is_placeholder());
    }

    #[test]
    fn test_record_serializes() {
        let record = ChangeRecord::ddl(None, "CREATE TABLE t (id INT)", IngestPosition::Wal(Lsn(9)));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["operation"], "Ddl");
        assert_eq!(json["ddl"], "CREATE TABLE t (id INT)");
    }
}
