//! pgoutput 논리 복제 메시지 디코더
//!
//! Relation 메시지로 받은 테이블 정의를 relation id 별로 캐시하고, 이후
//! INSERT / UPDATE / DELETE 튜플을 그 정의로 해석합니다. 캐시는 디코더 하나가 소유합니다.

use crate::error::{CdcError, Result};
use crate::pg_protocol::{from_pg_timestamp, MessageReader};
use crate::pg_value::{convert_text, PgType};
use crate::position::Lsn;
use crate::record::{Operation, RecordColumn, TableRef};
use crate::value::ColumnValue;
use crate::wal::{WalMessage, WalScope};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, trace};

/// 컬럼 flags의 키 비트
const COLUMN_FLAG_KEY: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
    pub key: bool,
}

/// Relation 메시지로 받은 테이블 정의
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    /// 'd' default, 'n' nothing, 'f' full, 'i' index
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug, Clone, PartialEq)]
enum TupleValue {
    Null,
    /// 바뀌지 않은 TOAST 값 (내용 없음)
    Unchanged,
    Text(Bytes),
    Binary(Bytes),
}

#[derive(Debug, Default)]
pub struct PgOutputDecoder {
    relations: HashMap<u32, Relation>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(&self, id: u32) -> Option<&Relation> {
        self.relations.get(&id)
    }

    /// 새 세션에서는 서버가 Relation 메시지를 다시 보냄
    pub fn clear(&mut self) {
        self.relations.clear();
    }

    pub fn decode(&mut self, data: Bytes, scope: &WalScope) -> Result<WalMessage> {
        let mut reader = MessageReader::new(data);
        let tag = reader.u8()?;
        match tag {
            b'B' => {
                let _final_lsn = reader.lsn()?;
                let commit_time = from_pg_timestamp(reader.i64()?);
                let xid = reader.u32()?;
                Ok(WalMessage::Begin {
                    xid: Some(xid),
                    commit_time,
                })
            }
            b'C' => {
                let _flags = reader.u8()?;
                let _commit_lsn = reader.lsn()?;
                let end_lsn = reader.lsn()?;
                let commit_time = from_pg_timestamp(reader.i64()?);
                Ok(WalMessage::Commit {
                    end_lsn: Some(end_lsn),
                    commit_time,
                })
            }
            b'R' => {
                let relation = read_relation(&mut reader)?;
                debug!(
                    "Relation {} -> {}.{} ({} columns)",
                    relation.id,
                    relation.namespace,
                    relation.name,
                    relation.columns.len()
                );
                self.relations.insert(relation.id, relation);
                Ok(WalMessage::Ignored)
            }
            b'Y' => {
                let type_id = reader.u32()?;
                let namespace = reader.cstr()?;
                let name = reader.cstr()?;
                trace!("Type {} -> {}.{}", type_id, namespace, name);
                Ok(WalMessage::Ignored)
            }
            b'O' => {
                let origin_lsn: Lsn = reader.lsn()?;
                let origin = reader.cstr()?;
                trace!("Origin {} at {}", origin, origin_lsn);
                Ok(WalMessage::Ignored)
            }
            b'M' => Ok(WalMessage::Ignored),
            b'I' => self.decode_insert(&mut reader, scope),
            b'U' => self.decode_update(&mut reader, scope),
            b'D' => self.decode_delete(&mut reader, scope),
            b'T' => self.decode_truncate(&mut reader, scope),
            other => Err(CdcError::decode(
                0,
                format!("unknown pgoutput message type '{}' (0x{:02X})", other as char, other),
            )),
        }
    }

    /// 매핑 밖 테이블이면 `None` (튜플은 읽지 않음)
    fn target(&self, relation_id: u32, scope: &WalScope) -> Result<Option<(&Relation, TableRef)>> {
        let relation = self.relations.get(&relation_id).ok_or_else(|| {
            CdcError::MissingTableMetadata(format!("no Relation message for relation id {}", relation_id))
        })?;
        match scope.resolve(&relation.namespace, &relation.name) {
            Some(table) => Ok(Some((relation, table))),
            None => {
                debug!("Skipping unmapped table {}.{}", relation.namespace, relation.name);
                Ok(None)
            }
        }
    }

    fn decode_insert(&self, reader: &mut MessageReader, scope: &WalScope) -> Result<WalMessage> {
        let relation_id = reader.u32()?;
        let Some((relation, table)) = self.target(relation_id, scope)? else {
            return Ok(WalMessage::Ignored);
        };
        expect_tag(reader, b'N')?;
        let after = to_columns(relation, read_tuple(reader)?, false)?;
        Ok(WalMessage::Row {
            operation: Operation::Insert,
            table,
            before: Vec::new(),
            after,
        })
    }

    fn decode_update(&self, reader: &mut MessageReader, scope: &WalScope) -> Result<WalMessage> {
        let relation_id = reader.u32()?;
        let Some((relation, table)) = self.target(relation_id, scope)? else {
            return Ok(WalMessage::Ignored);
        };

        let before = match reader.u8()? {
            tag @ (b'K' | b'O') => {
                let before = to_columns(relation, read_tuple(reader)?, tag == b'K')?;
                expect_tag(reader, b'N')?;
                before
            }
            b'N' => Vec::new(),
            other => return Err(unexpected_tag(other)),
        };

        let mut after = to_columns(relation, read_tuple(reader)?, false)?;
        for column in &mut after {
            column.updated = match before.iter().find(|b| b.name == column.name) {
                Some(old) => old.value != column.value,
                None => true,
            };
        }

        Ok(WalMessage::Row {
            operation: Operation::Update,
            table,
            before,
            after,
        })
    }

    fn decode_delete(&self, reader: &mut MessageReader, scope: &WalScope) -> Result<WalMessage> {
        let relation_id = reader.u32()?;
        let Some((relation, table)) = self.target(relation_id, scope)? else {
            return Ok(WalMessage::Ignored);
        };
        let key_only = match reader.u8()? {
            b'K' => true,
            b'O' => false,
            other => return Err(unexpected_tag(other)),
        };
        let before = to_columns(relation, read_tuple(reader)?, key_only)?;
        Ok(WalMessage::Row {
            operation: Operation::Delete,
            table,
            before,
            after: Vec::new(),
        })
    }

    fn decode_truncate(&self, reader: &mut MessageReader, scope: &WalScope) -> Result<WalMessage> {
        let count = reader.i32()?;
        let _options = reader.u8()?;
        let mut tables = Vec::new();
        for _ in 0..count.max(0) {
            if let Some((_, table)) = self.target(reader.u32()?, scope)? {
                tables.push(table);
            }
        }
        Ok(WalMessage::Truncate { tables })
    }
}

fn read_relation(reader: &mut MessageReader) -> Result<Relation> {
    let id = reader.u32()?;
    let namespace = reader.cstr()?;
    let name = reader.cstr()?;
    let replica_identity = reader.u8()?;
    let count = reader.i16()?;
    let mut columns = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count.max(0) {
        let flags = reader.u8()?;
        columns.push(RelationColumn {
            name: reader.cstr()?,
            type_oid: reader.u32()?,
            type_modifier: reader.i32()?,
            key: flags & COLUMN_FLAG_KEY != 0,
        });
    }
    Ok(Relation {
        id,
        // pg_catalog는 빈 문자열로 옴
        namespace: if namespace.is_empty() {
            "pg_catalog".to_string()
        } else {
            namespace
        },
        name,
        replica_identity,
        columns,
    })
}

fn read_tuple(reader: &mut MessageReader) -> Result<Vec<TupleValue>> {
    let count = reader.i16()?;
    let mut values = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count.max(0) {
        let value = match reader.u8()? {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::Unchanged,
            b't' => {
                let length = reader.i32()?;
                TupleValue::Text(reader.bytes(length.max(0) as usize)?)
            }
            b'b' => {
                let length = reader.i32()?;
                TupleValue::Binary(reader.bytes(length.max(0) as usize)?)
            }
            other => {
                return Err(CdcError::decode(
                    reader.offset() as u64,
                    format!("unknown tuple value kind '{}'", other as char),
                ))
            }
        };
        values.push(value);
    }
    Ok(values)
}

/// `key_only`면 키 컬럼만 (REPLICA IDENTITY 키 튜플은 나머지가 NULL로 옴)
fn to_columns(relation: &Relation, tuple: Vec<TupleValue>, key_only: bool) -> Result<Vec<RecordColumn>> {
    if tuple.len() != relation.columns.len() {
        return Err(CdcError::decode(
            0,
            format!(
                "tuple has {} columns but relation {}.{} has {}",
                tuple.len(),
                relation.namespace,
                relation.name,
                relation.columns.len()
            ),
        ));
    }

    let mut columns = Vec::with_capacity(tuple.len());
    for (definition, value) in relation.columns.iter().zip(tuple) {
        if key_only && !definition.key {
            continue;
        }
        let value = match value {
            TupleValue::Unchanged => continue,
            TupleValue::Null => ColumnValue::Null,
            TupleValue::Binary(raw) => ColumnValue::Bytes(raw.to_vec()),
            TupleValue::Text(raw) => {
                let text = std::str::from_utf8(&raw).map_err(|e| {
                    CdcError::ValueError(format!("column {}: invalid UTF-8: {}", definition.name, e))
                })?;
                convert_text(PgType::from_oid(definition.type_oid), &definition.name, text)?
            }
        };
        columns.push(RecordColumn {
            name: definition.name.clone(),
            value,
            unique_key: definition.key,
            updated: false,
        });
    }
    Ok(columns)
}

fn expect_tag(reader: &mut MessageReader, expected: u8) -> Result<()> {
    match reader.u8()? {
        tag if tag == expected => Ok(()),
        other => Err(unexpected_tag(other)),
    }
}

fn unexpected_tag(tag: u8) -> CdcError {
    CdcError::decode(0, format!("unexpected tuple tag '{}'", tag as char))
}
