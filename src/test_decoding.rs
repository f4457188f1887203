//! test_decoding 텍스트 출력 디코더
//!
//! ```text
//! BEGIN 529
//! table public.t_order: INSERT: order_id[integer]:1 status[character varying]:'NEW'
//! table public.t_order: UPDATE: old-key: order_id[integer]:1 new-tuple: order_id[integer]:2 ...
//! table public.t_order: DELETE: order_id[integer]:2
//! COMMIT 529 (at 2019-10-16 08:32:13.123456+08)
//! ```

use crate::error::{CdcError, Result};
use crate::pg_value::{convert_text, PgType};
use crate::record::{Operation, RecordColumn};
use crate::value::ColumnValue;
use crate::wal::{WalMessage, WalScope};
use chrono::{DateTime, Utc};
use tracing::debug;

const UNCHANGED_TOAST: &str = "unchanged-toast-datum";

#[derive(Debug, Default)]
pub struct TestDecodingDecoder;

impl TestDecodingDecoder {
    pub fn new() -> Self {
        TestDecodingDecoder
    }

    pub fn decode(&mut self, data: &[u8], scope: &WalScope) -> Result<WalMessage> {
        let text = std::str::from_utf8(data)
            .map_err(|e| CdcError::decode(0, format!("test_decoding output is not UTF-8: {}", e)))?;

        if let Some(rest) = text.strip_prefix("BEGIN") {
            return Ok(WalMessage::Begin {
                xid: rest.trim().parse().ok(),
                commit_time: None,
            });
        }
        if let Some(rest) = text.strip_prefix("COMMIT") {
            return Ok(WalMessage::Commit {
                end_lsn: None,
                commit_time: parse_commit_time(rest),
            });
        }
        if text.starts_with("message:") {
            return Ok(WalMessage::Ignored);
        }
        match text.strip_prefix("table ") {
            Some(rest) => decode_table_change(rest, scope),
            None => Err(CdcError::decode(0, format!("unrecognized test_decoding output: {}", text))),
        }
    }
}

/// "529 (at 2019-10-16 08:32:13.123456+08)"
pub(crate) fn parse_commit_time(rest: &str) -> Option<DateTime<Utc>> {
    let start = rest.find("(at ")? + 4;
    let end = rest[start..].find(')')? + start;
    DateTime::parse_from_str(&rest[start..end], "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

fn decode_table_change(text: &str, scope: &WalScope) -> Result<WalMessage> {
    let mut cursor = Cursor::new(text);
    let schema = cursor.identifier()?;
    cursor.expect(".")?;
    let table_name = cursor.identifier()?;
    cursor.expect(": ")?;
    let action = cursor.until(':')?;
    cursor.expect(":")?;

    let Some(table) = scope.resolve(&schema, &table_name) else {
        debug!("Skipping unmapped table {}.{}", schema, table_name);
        return Ok(WalMessage::Ignored);
    };

    match action.as_str() {
        "INSERT" => Ok(WalMessage::Row {
            operation: Operation::Insert,
            table,
            before: Vec::new(),
            after: cursor.columns(false)?,
        }),
        "UPDATE" => {
            let before = if cursor.consume("old-key:") {
                cursor.columns(true)?
            } else {
                Vec::new()
            };
            cursor.consume("new-tuple:");
            let mut after = cursor.columns(false)?;
            for column in &mut after {
                column.updated = match before.iter().find(|b| b.name == column.name) {
                    Some(old) => {
                        column.unique_key = true;
                        old.value != column.value
                    }
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
        "DELETE" => {
            let before = if cursor.consume("(no-tuple-data)") {
                Vec::new()
            } else {
                cursor.columns(true)?
            };
            Ok(WalMessage::Row {
                operation: Operation::Delete,
                table,
                before,
                after: Vec::new(),
            })
        }
        "TRUNCATE" => Ok(WalMessage::Truncate { tables: vec![table] }),
        other => Err(CdcError::decode(0, format!("unknown test_decoding action {}", other))),
    }
}

struct Cursor<'a> {
    text: &'a str,
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Cursor { text, offset: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.offset..]
    }

    fn error(&self, message: impl Into<String>) -> CdcError {
        CdcError::decode(self.offset as u64, message)
    }

    fn skip_spaces(&mut self) {
        let rest = self.rest();
        self.offset += rest.len() - rest.trim_start_matches(' ').len();
    }

    fn consume(&mut self, token: &str) -> bool {
        self.skip_spaces();
        if self.rest().starts_with(token) {
            self.offset += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<()> {
        if self.rest().starts_with(token) {
            self.offset += token.len();
            Ok(())
        } else {
            Err(self.error(format!("expected {:?} in {:?}", token, self.text)))
        }
    }

    fn until(&mut self, delimiter: char) -> Result<String> {
        let end = self
            .rest()
            .find(delimiter)
            .ok_or_else(|| self.error(format!("missing {:?}", delimiter)))?;
        let value = self.rest()[..end].to_string();
        self.offset += end;
        Ok(value)
    }

    /// 따옴표 식별자("a""b")도 처리
    fn identifier(&mut self) -> Result<String> {
        if self.rest().starts_with('"') {
            self.offset += 1;
            return self.quoted('"');
        }
        let end = self
            .rest()
            .find(|c| matches!(c, '.' | ':' | '['))
            .ok_or_else(|| self.error("unterminated identifier"))?;
        let value = self.rest()[..end].to_string();
        self.offset += end;
        Ok(value)
    }

    /// 여는 따옴표 다음부터 읽음. 연속 따옴표는 이스케이프
    fn quoted(&mut self, quote: char) -> Result<String> {
        let mut value = String::new();
        let mut chars = self.rest().char_indices().peekable();
        while let Some((index, c)) = chars.next() {
            if c == quote {
                if let Some((_, next)) = chars.peek() {
                    if *next == quote {
                        value.push(quote);
                        chars.next();
                        continue;
                    }
                }
                self.offset += index + 1;
                return Ok(value);
            }
            value.push(c);
        }
        Err(self.error("unterminated quoted value"))
    }

    /// `name[type]:value` 나열. "new-tuple:" 또는 끝에서 멈춤
    fn columns(&mut self, key: bool) -> Result<Vec<RecordColumn>> {
        let mut columns = Vec::new();
        loop {
            self.skip_spaces();
            if self.rest().is_empty() || self.rest().starts_with("new-tuple:") {
                return Ok(columns);
            }

            let name = self.identifier()?;
            self.expect("[")?;
            let type_end = self
                .rest()
                .find("]:")
                .ok_or_else(|| self.error(format!("missing type for column {}", name)))?;
            let type_name = self.rest()[..type_end].to_string();
            self.offset += type_end + 2;

            let raw = if self.rest().starts_with('\'') {
                self.offset += 1;
                Some(self.quoted('\'')?)
            } else {
                let end = self.rest().find(' ').unwrap_or(self.rest().len());
                let token = &self.rest()[..end];
                self.offset += end;
                match token {
                    "null" => None,
                    UNCHANGED_TOAST => continue,
                    other => Some(other.to_string()),
                }
            };

            let value = match raw {
                None => ColumnValue::Null,
                Some(text) => convert_text(PgType::from_name(&type_name), &name, &text)?,
            };
            columns.push(RecordColumn {
                name,
                value,
                unique_key: key,
                updated: false,
            });
        }
    }
}
