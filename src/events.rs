//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의
//!
//! 각 이벤트:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!   - Checksum (CRC32 4 bytes, FORMAT_DESCRIPTION에서 켜진 경우)

use crate::error::{CdcError, Result};
use crate::payload::PacketPayload;
use crate::value::{read_binlog_value, read_column_meta, ColumnDefinition, ColumnType, ColumnValue};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const EVENT_HEADER_SIZE: usize = 19;
pub const CHECKSUM_SIZE: usize = 4;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (BEGIN, COMMIT, DDL)
    QueryEvent = 2,
    Stop = 3,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    FormatDescription = 15,
    /// 트랜잭션 커밋
    Xid = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    WriteRowsV1 = 23,
    UpdateRowsV1 = 24,
    DeleteRowsV1 = 25,
    Heartbeat = 27,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQuery = 29,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEvent = 30,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEvent = 31,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEvent = 32,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent = 33,
    /// 익명 GTID 이벤트
    AnonymousGtidEvent = 34,
    PreviousGtids = 35,
    XaPrepare = 38,
    /// 트랜잭션 페이로드 이벤트
    TransactionPayloadEvent = 40,
    HeartbeatV2 = 41,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            3 => EventType::Stop,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescription,
            16 => EventType::Xid,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsV1,
            24 => EventType::UpdateRowsV1,
            25 => EventType::DeleteRowsV1,
            27 => EventType::Heartbeat,
            29 => EventType::RowsQuery,
            30 => EventType::WriteRowsEvent,
            31 => EventType::UpdateRowsEvent,
            32 => EventType::DeleteRowsEvent,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            35 => EventType::PreviousGtids,
            38 => EventType::XaPrepare,
            40 => EventType::TransactionPayloadEvent,
            41 => EventType::HeartbeatV2,
            _ => EventType::Unknown,
        }
    }

    /// (행 이벤트 종류, v2 여부)
    pub fn rows_kind(&self) -> Option<(RowsKind, bool)> {
        match self {
            EventType::WriteRowsV1 => Some((RowsKind::Write, false)),
            EventType::UpdateRowsV1 => Some((RowsKind::Update, false)),
            EventType::DeleteRowsV1 => Some((RowsKind::Delete, false)),
            EventType::WriteRowsEvent => Some((RowsKind::Write, true)),
            EventType::UpdateRowsEvent => Some((RowsKind::Update, true)),
            EventType::DeleteRowsEvent => Some((RowsKind::Delete, true)),
            _ => None,
        }
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    pub type_code: u8,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (바이트)
    pub event_length: u32,
    /// 다음 이벤트 위치 (artificial 이벤트는 0)
    pub next_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

impl EventHeader {
    pub fn parse(payload: &mut PacketPayload) -> Result<Self> {
        let timestamp = payload.read_int4()?;
        let type_code = payload.read_int1()?;
        let server_id = payload.read_int4()?;
        let event_length = payload.read_int4()?;
        let next_pos = payload.read_int4()?;
        let flags = payload.read_int2()?;
        Ok(EventHeader {
            timestamp,
            event_type: EventType::from_u8(type_code),
            type_code,
            server_id,
            event_length,
            next_pos,
            flags,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumType {
    None,
    Crc32,
}

impl ChecksumType {
    pub fn trailer_len(&self) -> usize {
        match self {
            ChecksumType::None => 0,
            ChecksumType::Crc32 => CHECKSUM_SIZE,
        }
    }
}

/// FORMAT_DESCRIPTION 이벤트 (15)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
    pub header_length: u8,
    pub checksum: ChecksumType,
}

impl FormatDescriptionEvent {
    /// `body`는 헤더 이후 전체 (체크섬 trailer 포함)
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut payload = PacketPayload::from_bytes(body);
        let binlog_version = payload.read_int2()?;
        let raw_version = payload.read_string_fix_bytes(50)?;
        let end = raw_version.iter().position(|b| *b == 0).unwrap_or(raw_version.len());
        let server_version = String::from_utf8_lossy(&raw_version[..end]).to_string();
        payload.read_int4()?;
        let header_length = payload.read_int1()?;

        // alg 1바이트 + CRC 4바이트가 맨 끝에 붙음 (5.6.1+)
        let checksum = match body.len().checked_sub(CHECKSUM_SIZE + 1).map(|i| body[i]) {
            Some(1) if supports_checksum(&server_version) => ChecksumType::Crc32,
            _ => ChecksumType::None,
        };
        Ok(FormatDescriptionEvent {
            binlog_version,
            server_version,
            header_length,
            checksum,
        })
    }
}

fn supports_checksum(server_version: &str) -> bool {
    let mut parts = server_version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().unwrap_or(0));
    let version = (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    );
    version >= (5, 6, 1)
}

/// 회전 이벤트 데이터 (4)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateEvent {
    /// 새 파일의 시작 위치
    pub position: u64,
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
}

impl RotateEvent {
    pub fn parse(payload: &mut PacketPayload) -> Result<Self> {
        let position = payload.read_int8()?;
        let next_binlog_name = payload.read_string_eof()?;
        Ok(RotateEvent {
            position,
            next_binlog_name,
        })
    }
}

/// 쿼리 이벤트 데이터 (2)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEvent {
    /// 스레드 ID
    pub thread_id: u32,
    /// 실행 시간 (초)
    pub exec_time: u32,
    pub error_code: u16,
    /// 데이터베이스명
    pub schema: String,
    /// 쿼리 문자열
    pub query: String,
}

impl QueryEvent {
    pub fn parse(payload: &mut PacketPayload) -> Result<Self> {
        let thread_id = payload.read_int4()?;
        let exec_time = payload.read_int4()?;
        let schema_len = payload.read_int1()? as usize;
        let error_code = payload.read_int2()?;
        let status_len = payload.read_int2()? as usize;
        // Status variables skip
        payload.skip_reserved(status_len)?;
        let schema = payload.read_string_fix(schema_len)?;
        // null terminator skip
        payload.skip_reserved(1)?;
        let query = String::from_utf8_lossy(&payload.read_string_eof_bytes()?).to_string();
        Ok(QueryEvent {
            thread_id,
            exec_time,
            error_code,
            schema,
            query,
        })
    }

    pub fn is_begin(&self) -> bool {
        self.query.trim().eq_ignore_ascii_case("BEGIN")
    }

    pub fn is_commit(&self) -> bool {
        self.query.trim().eq_ignore_ascii_case("COMMIT")
    }
}

/// XID 이벤트 (16)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XidEvent {
    pub xid: u64,
}

impl XidEvent {
    pub fn parse(payload: &mut PacketPayload) -> Result<Self> {
        Ok(XidEvent {
            xid: payload.read_int8()?,
        })
    }
}

/// GTID 이벤트 데이터 (33)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidEvent {
    pub flags: u8,
    pub sid: Uuid,
    pub gno: u64,
}

impl GtidEvent {
    pub fn parse(payload: &mut PacketPayload) -> Result<Self> {
        let flags = payload.read_int1()?;
        let sid_bytes = payload.read_string_fix_bytes(16)?;
        let sid = Uuid::from_slice(&sid_bytes).map_err(|e| CdcError::GtidError(e.to_string()))?;
        let gno = payload.read_int8()?;
        Ok(GtidEvent { flags, sid, gno })
    }
}

/// HEARTBEAT 이벤트 (27). 본문은 현재 binlog 파일명
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub binlog_name: String,
}

impl HeartbeatEvent {
    pub fn parse(payload: &mut PacketPayload) -> Result<Self> {
        Ok(HeartbeatEvent {
            binlog_name: payload.read_string_eof()?,
        })
    }
}

/// TABLE_MAP optional metadata 타입
mod optional_metadata {
    pub const SIGNEDNESS: u8 = 1;
    pub const COLUMN_NAME: u8 = 4;
    pub const SIMPLE_PRIMARY_KEY: u8 = 8;
    pub const PRIMARY_KEY_WITH_PREFIX: u8 = 9;
}

/// 테이블 맵 정보 (19)
///
/// 컬럼 메타데이터 블록은 원본 그대로 두었다가 `column_definitions`에서 해석합니다.
/// 수집 대상이 아닌 테이블은 타입 해석 없이 넘어갈 수 있습니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapEvent {
    /// 테이블 ID
    pub table_id: u64,
    pub flags: u16,
    /// 데이터베이스명
    pub schema: String,
    /// 테이블명
    pub table: String,
    /// 컬럼 타입들
    pub column_types: Vec<u8>,
    metadata: Bytes,
    /// nullable 비트맵
    pub null_bitmap: Vec<u8>,
    optional: Bytes,
}

impl TableMapEvent {
    pub fn parse(payload: &mut PacketPayload) -> Result<Self> {
        let table_id = payload.read_int6()?;
        let flags = payload.read_int2()?;

        // 데이터베이스명 길이
        let schema_len = payload.read_int1()? as usize;
        let schema = payload.read_string_fix(schema_len)?;
        payload.skip_reserved(1)?;

        // 테이블명 길이
        let table_len = payload.read_int1()? as usize;
        let table = payload.read_string_fix(table_len)?;
        payload.skip_reserved(1)?;

        // 컬럼 개수
        let column_count = payload.read_int_lenenc()? as usize;
        let column_types = payload.read_string_fix_bytes(column_count)?.to_vec();
        let metadata = payload.read_string_lenenc_bytes()?;
        let null_bitmap = payload.read_string_fix_bytes((column_count + 7) / 8)?.to_vec();
        let optional = payload.read_string_eof_bytes()?;

        Ok(TableMapEvent {
            table_id,
            flags,
            schema,
            table,
            column_types,
            metadata,
            null_bitmap,
            optional,
        })
    }

    pub fn column_count(&self) -> usize {
        self.column_types.len()
    }

    /// 컬럼 정의 (이름은 optional metadata에 있을 때만 채워짐)
    pub fn column_definitions(&self) -> Result<Vec<ColumnDefinition>> {
        let optional = self.optional_metadata()?;
        let mut meta = PacketPayload::from_bytes(&self.metadata);
        let mut numeric_index = 0usize;
        let mut columns = Vec::with_capacity(self.column_count());

        for (i, code) in self.column_types.iter().enumerate() {
            let name = optional
                .names
                .as_ref()
                .and_then(|names| names.get(i).cloned())
                .unwrap_or_default();
            let column_type = ColumnType::from_code(*code).ok_or_else(|| {
                CdcError::UnsupportedColumnType {
                    column: if name.is_empty() { format!("#{}", i) } else { name.clone() },
                    type_code: *code,
                }
            })?;
            let unsigned = if column_type.is_numeric() {
                let bit = optional
                    .signedness
                    .as_ref()
                    .and_then(|bits| bits.get(numeric_index / 8))
                    .map(|b| b & (0x80 >> (numeric_index % 8)) != 0)
                    .unwrap_or(false);
                numeric_index += 1;
                bit
            } else {
                false
            };
            columns.push(ColumnDefinition {
                name,
                type_code: *code,
                meta: read_column_meta(column_type, &mut meta)?,
                unsigned,
                nullable: self.null_bitmap[i / 8] & (1 << (i % 8)) != 0,
            });
        }
        Ok(columns)
    }

    /// 기본 키 컬럼 인덱스 (optional metadata에 있을 때)
    pub fn primary_key(&self) -> Result<Option<Vec<usize>>> {
        Ok(self.optional_metadata()?.primary_key)
    }

    fn optional_metadata(&self) -> Result<OptionalMetadata> {
        let mut result = OptionalMetadata::default();
        let mut payload = PacketPayload::from_bytes(&self.optional);
        while payload.has_remaining() {
            let kind = payload.read_int1()?;
            let value = payload.read_string_lenenc_bytes()?;
            let mut field = PacketPayload::from_bytes(&value);
            match kind {
                optional_metadata::SIGNEDNESS => result.signedness = Some(value.to_vec()),
                optional_metadata::COLUMN_NAME => {
                    let mut names = Vec::with_capacity(self.column_count());
                    while field.has_remaining() {
                        names.push(field.read_string_lenenc()?);
                    }
                    result.names = Some(names);
                }
                optional_metadata::SIMPLE_PRIMARY_KEY => {
                    let mut keys = Vec::new();
                    while field.has_remaining() {
                        keys.push(field.read_int_lenenc()? as usize);
                    }
                    result.primary_key = Some(keys);
                }
                optional_metadata::PRIMARY_KEY_WITH_PREFIX => {
                    let mut keys = Vec::new();
                    while field.has_remaining() {
                        keys.push(field.read_int_lenenc()? as usize);
                        field.read_int_lenenc()?;
                    }
                    result.primary_key = Some(keys);
                }
                _ => {}
            }
        }
        Ok(result)
    }
}

#[derive(Debug, Default)]
struct OptionalMetadata {
    signedness: Option<Vec<u8>>,
    names: Option<Vec<String>>,
    primary_key: Option<Vec<usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowsKind {
    Write,
    Update,
    Delete,
}

/// 행 이미지. 이미지에 포함되지 않은 컬럼은 None
pub type RowImage = Vec<Option<ColumnValue>>;

/// WRITE/UPDATE/DELETE_ROWS 이벤트 데이터
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    /// 테이블 ID
    pub table_id: u64,
    /// 플래그
    pub flags: u16,
    pub kind: RowsKind,
    /// (before, after). WRITE는 before가, DELETE는 after가 None
    pub rows: Vec<(Option<RowImage>, Option<RowImage>)>,
}

impl RowsEvent {
    /// table_id만 먼저 읽기 (수집 대상 판별용)
    pub fn peek_table_id(body: &[u8]) -> Result<u64> {
        PacketPayload::from_bytes(body).read_int6()
    }

    pub fn parse(
        payload: &mut PacketPayload,
        kind: RowsKind,
        v2: bool,
        columns: &[ColumnDefinition],
    ) -> Result<Self> {
        let table_id = payload.read_int6()?;
        let flags = payload.read_int2()?;
        if v2 {
            let extra_len = payload.read_int2()? as usize;
            payload.skip_reserved(extra_len.saturating_sub(2))?;
        }

        // 컬럼 개수
        let column_count = payload.read_int_lenenc()? as usize;
        if column_count != columns.len() {
            return Err(CdcError::decode(
                payload.position(),
                format!(
                    "rows event has {} columns but table map has {}",
                    column_count,
                    columns.len()
                ),
            ));
        }

        // 컬럼 존재 비트맵
        let bitmap_len = (column_count + 7) / 8;
        let present = payload.read_string_fix_bytes(bitmap_len)?.to_vec();
        let present_after = if kind == RowsKind::Update {
            payload.read_string_fix_bytes(bitmap_len)?.to_vec()
        } else {
            present.clone()
        };

        let mut rows = Vec::new();
        while payload.has_remaining() {
            let row = match kind {
                RowsKind::Write => (None, Some(read_row_image(payload, columns, &present_after)?)),
                RowsKind::Delete => (Some(read_row_image(payload, columns, &present)?), None),
                RowsKind::Update => {
                    let before = read_row_image(payload, columns, &present)?;
                    let after = read_row_image(payload, columns, &present_after)?;
                    (Some(before), Some(after))
                }
            };
            rows.push(row);
        }

        Ok(RowsEvent {
            table_id,
            flags,
            kind,
            rows,
        })
    }
}

fn bit_set(bitmap: &[u8], index: usize) -> bool {
    bitmap
        .get(index / 8)
        .map(|b| b & (1 << (index % 8)) != 0)
        .unwrap_or(false)
}

/// 행 데이터 파싱: 포함된 컬럼 수만큼의 NULL 비트맵 뒤에 값들이 이어짐
fn read_row_image(
    payload: &mut PacketPayload,
    columns: &[ColumnDefinition],
    present: &[u8],
) -> Result<RowImage> {
    let present_count = (0..columns.len()).filter(|i| bit_set(present, *i)).count();
    let null_bitmap = payload.read_string_fix_bytes((present_count + 7) / 8)?;

    let mut image = Vec::with_capacity(columns.len());
    let mut present_index = 0;
    for (i, column) in columns.iter().enumerate() {
        if !bit_set(present, i) {
            image.push(None);
            continue;
        }
        let value = if bit_set(&null_bitmap, present_index) {
            ColumnValue::Null
        } else {
            read_binlog_value(column, payload)?
        };
        present_index += 1;
        image.push(Some(value));
    }
    Ok(image)
}
