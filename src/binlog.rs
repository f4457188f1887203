//! Binlog 이벤트 스트림 디코더
//!
//! `COM_BINLOG_DUMP`로 받은 이벤트를 [`StreamEvent`]로 바꿉니다.
//!
//! - FORMAT_DESCRIPTION에서 체크섬 알고리즘을 읽고 이후 이벤트의 CRC32 trailer를 떼어냄
//! - TABLE_MAP 캐시는 디코더가 소유하며 수집 대상 테이블만 담음
//! - 행 레코드는 직전 트랜잭션 경계 위치를 가지고, XID / COMMIT에서 새 경계가 정해짐
//!
//! 재시작하면 마지막 경계부터 다시 읽으므로 트랜잭션 단위로 at-least-once가 보장됩니다.

use crate::connection::{ConnectionConfig, MySqlConnection};
use crate::dumper::{StreamDecoder, StreamEvent};
use crate::error::{CdcError, Result};
use crate::events::*;
use crate::gtid::GtidSet;
use crate::payload::PacketPayload;
use crate::position::{BinlogPosition, IngestPosition};
use crate::record::{ChangeRecord, Operation, RecordColumn, TableMapping, TableRef};
use crate::value::ColumnDefinition;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 테이블 컬럼 이름과 기본 키
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
}

/// TABLE_MAP에 컬럼 이름이 없을 때 사용할 스키마 조회
#[async_trait]
pub trait TableMetadataLoader: Send + Sync {
    async fn load(&self, schema: &str, table: &str) -> Result<Option<TableSchema>>;
}

/// `information_schema`에서 조회하는 로더. 연결은 처음 필요할 때 열고 재사용
pub struct MySqlTableMetadataLoader {
    config: ConnectionConfig,
    conn: Mutex<Option<MySqlConnection>>,
}

impl MySqlTableMetadataLoader {
    pub fn new(config: ConnectionConfig) -> Self {
        MySqlTableMetadataLoader {
            config,
            conn: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TableMetadataLoader for MySqlTableMetadataLoader {
    async fn load(&self, schema: &str, table: &str) -> Result<Option<TableSchema>> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(MySqlConnection::connect(&self.config).await?);
        }
        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => return Err(CdcError::ConnectionError("metadata connection unavailable".into())),
        };

        let columns = match conn.get_table_schema(schema, table).await {
            Ok(columns) => columns,
            Err(e) => {
                // 다음 조회 때 새로 연결
                guard.take();
                return Err(e);
            }
        };
        if columns.is_empty() {
            return Ok(None);
        }
        debug!("Loaded {} columns for {}.{}", columns.len(), schema, table);
        Ok(Some(TableSchema {
            primary_key: columns
                .iter()
                .filter(|c| c.primary_key)
                .map(|c| c.name.clone())
                .collect(),
            columns: columns.into_iter().map(|c| c.name).collect(),
        }))
    }
}

/// 미리 주어진 스키마만 돌려주는 로더 ("schema.table" 키, 대소문자 무시)
#[derive(Debug, Clone, Default)]
pub struct StaticTableMetadataLoader {
    tables: HashMap<String, TableSchema>,
}

impl StaticTableMetadataLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, qualified_name: &str, schema: TableSchema) -> Self {
        self.tables.insert(qualified_name.to_lowercase(), schema);
        self
    }
}

#[async_trait]
impl TableMetadataLoader for StaticTableMetadataLoader {
    async fn load(&self, schema: &str, table: &str) -> Result<Option<TableSchema>> {
        Ok(self.tables.get(&qualified(schema, table)).cloned())
    }
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, table).to_lowercase()
}

/// 캐시된 수집 대상 테이블
#[derive(Debug, Clone)]
struct CachedTable {
    table: TableRef,
    columns: Vec<ColumnDefinition>,
    unique_keys: Vec<bool>,
}

/// MySQL binlog 디코더
pub struct BinlogStreamDecoder<L = MySqlTableMetadataLoader> {
    table_mapping: TableMapping,
    ddl_enabled: bool,
    loader: L,
    checksum: Option<ChecksumType>,
    pending_rotate: Option<Bytes>,
    filename: String,
    gtid_mode: bool,
    executed: GtidSet,
    pending_gtid: Option<(Uuid, u64)>,
    in_transaction: bool,
    boundary: IngestPosition,
    tables: HashMap<u64, CachedTable>,
    /// 수집 대상이 아니라서 건너뛰는 table_id
    skipped: HashSet<u64>,
    schemas: HashMap<String, Option<TableSchema>>,
}

impl<L: TableMetadataLoader> BinlogStreamDecoder<L> {
    pub fn new(table_mapping: TableMapping, ddl_enabled: bool, loader: L) -> Self {
        BinlogStreamDecoder {
            table_mapping,
            ddl_enabled,
            loader,
            checksum: None,
            pending_rotate: None,
            filename: String::new(),
            gtid_mode: false,
            executed: GtidSet::new(),
            pending_gtid: None,
            in_transaction: false,
            boundary: IngestPosition::Binlog(BinlogPosition::new("", 0)),
            tables: HashMap::new(),
            skipped: HashSet::new(),
            schemas: HashMap::new(),
        }
    }

    /// 현재 트랜잭션 경계 위치
    pub fn boundary(&self) -> &IngestPosition {
        &self.boundary
    }

    async fn decode_event(&mut self, frame: Bytes) -> Result<Vec<StreamEvent>> {
        let header = parse_header(&frame)?;

        if header.event_type == EventType::FormatDescription {
            let format = FormatDescriptionEvent::parse(&frame[EVENT_HEADER_SIZE..])?;
            debug!(
                "Format description: server {}, checksum {:?}",
                format.server_version, format.checksum
            );
            self.checksum = Some(format.checksum);
            return match self.pending_rotate.take() {
                Some(rotate) => {
                    let header = parse_header(&rotate)?;
                    self.handle_framed(&header, rotate).await
                }
                None => Ok(Vec::new()),
            };
        }

        // FORMAT_DESCRIPTION보다 먼저 오는 가짜 ROTATE는 체크섬을 알고 나서 처리
        if self.checksum.is_none() && header.event_type == EventType::RotateEvent {
            self.pending_rotate = Some(frame);
            return Ok(Vec::new());
        }
        self.handle_framed(&header, frame).await
    }

    async fn handle_framed(&mut self, header: &EventHeader, frame: Bytes) -> Result<Vec<StreamEvent>> {
        let trailer = self.checksum.unwrap_or(ChecksumType::None).trailer_len();
        let body_end = frame
            .len()
            .checked_sub(trailer)
            .filter(|end| *end >= EVENT_HEADER_SIZE)
            .ok_or_else(|| CdcError::decode(0, "event shorter than checksum trailer"))?;
        self.handle_event(header, frame.slice(EVENT_HEADER_SIZE..body_end)).await
    }

    async fn handle_event(&mut self, header: &EventHeader, body: Bytes) -> Result<Vec<StreamEvent>> {
        let mut payload = PacketPayload::from_bytes(&body).with_base_offset(EVENT_HEADER_SIZE as u64);
        let commit_time = commit_time(header);

        if let Some((kind, v2)) = header.event_type.rows_kind() {
            return self.handle_rows(&body, kind, v2, commit_time);
        }

        match header.event_type {
            EventType::RotateEvent => {
                let rotate = RotateEvent::parse(&mut payload)?;
                info!("Rotating to {}:{}", rotate.next_binlog_name, rotate.position);
                self.filename = rotate.next_binlog_name;
                if self.gtid_mode {
                    return Ok(Vec::new());
                }
                let position = IngestPosition::Binlog(BinlogPosition::new(self.filename.clone(), rotate.position));
                Ok(self.progress(position))
            }
            EventType::QueryEvent => {
                let query = QueryEvent::parse(&mut payload)?;
                if query.is_begin() {
                    self.in_transaction = true;
                    return Ok(Vec::new());
                }
                if query.is_commit() || query.query.trim().eq_ignore_ascii_case("ROLLBACK") {
                    let position = self.end_transaction(header)?;
                    return Ok(vec![StreamEvent::Record(
                        ChangeRecord::placeholder(position).with_commit_time(commit_time),
                    )]);
                }
                if self.in_transaction {
                    debug!("Ignoring statement inside transaction: {}", query.query);
                    return Ok(Vec::new());
                }

                // DDL은 자체 트랜잭션. 이후 TABLE_MAP은 새 스키마로 다시 해석
                self.schemas.clear();
                self.tables.clear();
                self.skipped.clear();
                let position = self.end_transaction(header)?;
                if self.ddl_enabled {
                    debug!("DDL on {}: {}", query.schema, query.query);
                    Ok(vec![StreamEvent::Record(
                        ChangeRecord::ddl(None, query.query, position).with_commit_time(commit_time),
                    )])
                } else {
                    Ok(vec![StreamEvent::Progress(position)])
                }
            }
            EventType::Xid | EventType::XaPrepare => {
                let position = self.end_transaction(header)?;
                Ok(vec![StreamEvent::Record(
                    ChangeRecord::placeholder(position).with_commit_time(commit_time),
                )])
            }
            EventType::TableMapEvent => {
                let table_map = TableMapEvent::parse(&mut payload)?;
                self.handle_table_map(table_map).await?;
                Ok(Vec::new())
            }
            EventType::GtidEvent => {
                let gtid = GtidEvent::parse(&mut payload)?;
                self.pending_gtid = Some((gtid.sid, gtid.gno));
                Ok(Vec::new())
            }
            EventType::AnonymousGtidEvent => {
                self.pending_gtid = None;
                Ok(Vec::new())
            }
            EventType::Heartbeat => {
                let heartbeat = HeartbeatEvent::parse(&mut payload)?;
                let position = if self.in_transaction || self.gtid_mode || header.next_pos == 0 {
                    None
                } else {
                    let position = IngestPosition::Binlog(BinlogPosition::new(
                        heartbeat.binlog_name,
                        header.next_pos as u64,
                    ));
                    self.boundary = self.boundary.clone().max(position);
                    Some(self.boundary.clone())
                };
                Ok(vec![StreamEvent::Heartbeat {
                    position,
                    reply_requested: false,
                }])
            }
            EventType::HeartbeatV2 => Ok(vec![StreamEvent::Heartbeat {
                position: None,
                reply_requested: false,
            }]),
            EventType::TransactionPayloadEvent => Err(CdcError::decode(
                payload.position(),
                "compressed transaction payloads are not supported",
            )),
            _ => {
                if self.in_transaction || self.gtid_mode || header.next_pos == 0 {
                    return Ok(Vec::new());
                }
                let position = IngestPosition::Binlog(BinlogPosition::new(
                    self.filename.clone(),
                    header.next_pos as u64,
                ));
                Ok(self.progress(position))
            }
        }
    }

    /// 트랜잭션 밖에서 경계를 앞으로 옮김
    fn progress(&mut self, position: IngestPosition) -> Vec<StreamEvent> {
        match position.partial_cmp(&self.boundary) {
            Some(std::cmp::Ordering::Greater) => {
                self.boundary = position.clone();
                vec![StreamEvent::Progress(position)]
            }
            _ if self.boundary.is_initial() => {
                self.boundary = position.clone();
                vec![StreamEvent::Progress(position)]
            }
            _ => Vec::new(),
        }
    }

    fn end_transaction(&mut self, header: &EventHeader) -> Result<IngestPosition> {
        self.in_transaction = false;
        if self.gtid_mode {
            if let Some((sid, gno)) = self.pending_gtid.take() {
                self.executed.add(sid, gno)?;
            }
            self.boundary = IngestPosition::Gtid(self.executed.clone());
        } else if header.next_pos > 0 {
            self.boundary = IngestPosition::Binlog(BinlogPosition::new(
                self.filename.clone(),
                header.next_pos as u64,
            ));
        }
        Ok(self.boundary.clone())
    }

    async fn handle_table_map(&mut self, table_map: TableMapEvent) -> Result<()> {
        let table = match self.table_mapping.resolve(Some(&table_map.schema), &table_map.table) {
            Some(table) => table,
            None => {
                debug!("Skipping unmapped table {}.{}", table_map.schema, table_map.table);
                self.tables.remove(&table_map.table_id);
                self.skipped.insert(table_map.table_id);
                return Ok(());
            }
        };

        self.skipped.remove(&table_map.table_id);
        let mut columns = table_map.column_definitions()?;
        let primary_key = table_map.primary_key()?;
        let names_present = columns.iter().all(|c| !c.name.is_empty());

        let unique_keys = if names_present && primary_key.is_some() {
            let indexes = primary_key.unwrap_or_default();
            (0..columns.len()).map(|i| indexes.contains(&i)).collect()
        } else {
            let missing = || CdcError::MissingTableMetadata(qualified(&table_map.schema, &table_map.table));
            let schema = match self.table_schema(&table_map.schema, &table_map.table).await? {
                Some(schema) => schema,
                None if names_present => TableSchema::default(),
                None => return Err(missing()),
            };
            if !names_present {
                if schema.columns.len() != columns.len() {
                    warn!(
                        "Table {}.{} has {} columns in binlog but {} in metadata",
                        table_map.schema,
                        table_map.table,
                        columns.len(),
                        schema.columns.len()
                    );
                    return Err(missing());
                }
                for (column, name) in columns.iter_mut().zip(&schema.columns) {
                    column.name = name.clone();
                }
            }
            match primary_key {
                Some(indexes) => (0..columns.len()).map(|i| indexes.contains(&i)).collect(),
                None => columns
                    .iter()
                    .map(|c| schema.primary_key.iter().any(|k| k.eq_ignore_ascii_case(&c.name)))
                    .collect(),
            }
        };

        self.tables.insert(
            table_map.table_id,
            CachedTable {
                table,
                columns,
                unique_keys,
            },
        );
        Ok(())
    }

    async fn table_schema(&mut self, schema: &str, table: &str) -> Result<Option<TableSchema>> {
        let key = qualified(schema, table);
        if let Some(cached) = self.schemas.get(&key) {
            return Ok(cached.clone());
        }
        let loaded = self.loader.load(schema, table).await?;
        self.schemas.insert(key, loaded.clone());
        Ok(loaded)
    }

    fn handle_rows(
        &mut self,
        body: &[u8],
        kind: RowsKind,
        v2: bool,
        commit_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<StreamEvent>> {
        let table_id = RowsEvent::peek_table_id(body)?;
        let cached = match self.tables.get(&table_id) {
            Some(cached) => cached,
            None if self.skipped.contains(&table_id) => return Ok(Vec::new()),
            None => {
                return Err(CdcError::MissingTableMetadata(format!(
                    "no TABLE_MAP for table_id {}",
                    table_id
                )))
            }
        };
        let mut payload = PacketPayload::from_bytes(body).with_base_offset(EVENT_HEADER_SIZE as u64);
        let rows = RowsEvent::parse(&mut payload, kind, v2, &cached.columns)?;
        self.in_transaction = true;

        let operation = match kind {
            RowsKind::Write => Operation::Insert,
            RowsKind::Update => Operation::Update,
            RowsKind::Delete => Operation::Delete,
        };
        let records = rows
            .rows
            .into_iter()
            .map(|(before, after)| {
                let before_columns = to_record_columns(cached, before.as_ref());
                let mut after_columns = to_record_columns(cached, after.as_ref());
                if kind == RowsKind::Update {
                    for column in after_columns.iter_mut() {
                        column.updated = before_columns
                            .iter()
                            .find(|b| b.name == column.name)
                            .map_or(true, |b| b.value != column.value);
                    }
                }
                StreamEvent::Record(
                    ChangeRecord::row(
                        operation,
                        cached.table.clone(),
                        before_columns,
                        after_columns,
                        self.boundary.clone(),
                    )
                    .with_commit_time(commit_time),
                )
            })
            .collect();
        Ok(records)
    }
}

fn to_record_columns(table: &CachedTable, image: Option<&RowImage>) -> Vec<RecordColumn> {
    let image = match image {
        Some(image) => image,
        None => return Vec::new(),
    };
    image
        .iter()
        .enumerate()
        .filter_map(|(i, value)| {
            let value = value.clone()?;
            Some(RecordColumn {
                name: table.columns[i].name.clone(),
                value,
                unique_key: table.unique_keys[i],
                updated: false,
            })
        })
        .collect()
}

fn parse_header(frame: &[u8]) -> Result<EventHeader> {
    if frame.len() < EVENT_HEADER_SIZE {
        return Err(CdcError::decode(
            0,
            format!("event of {} bytes is shorter than its header", frame.len()),
        ));
    }
    EventHeader::parse(&mut PacketPayload::from_bytes(&frame[..EVENT_HEADER_SIZE]))
}

fn commit_time(header: &EventHeader) -> Option<DateTime<Utc>> {
    if header.timestamp == 0 {
        return None;
    }
    DateTime::from_timestamp(header.timestamp as i64, 0)
}

#[async_trait]
impl<L: TableMetadataLoader> StreamDecoder for BinlogStreamDecoder<L> {
    fn reset(&mut self, resume: &IngestPosition) -> Result<()> {
        match resume {
            IngestPosition::Binlog(position) => {
                self.gtid_mode = false;
                self.filename = position.filename.clone();
            }
            IngestPosition::Gtid(set) => {
                self.gtid_mode = true;
                self.executed = set.clone();
                self.filename.clear();
            }
            IngestPosition::Wal(lsn) => {
                return Err(CdcError::InvalidPosition(format!(
                    "WAL position {} cannot resume a binlog stream",
                    lsn
                )))
            }
        }
        self.boundary = resume.clone();
        self.checksum = None;
        self.pending_rotate = None;
        self.pending_gtid = None;
        self.in_transaction = false;
        self.tables.clear();
        self.skipped.clear();
        Ok(())
    }

    async fn decode(&mut self, frame: Bytes) -> Result<Vec<StreamEvent>> {
        let header = parse_header(&frame).ok();
        self.decode_event(frame).await.map_err(|e| {
            // 메타데이터 연결 끊김 등은 재연결 대상
            if e.is_retryable() {
                return e;
            }
            CdcError::EventDecode {
                position: match &header {
                    Some(header) => format!("{}:{}", self.filename, header.next_pos),
                    None => format!("{}:?", self.filename),
                },
                source: Box::new(e),
            }
        })
    }
}
