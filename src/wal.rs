//! WAL 논리 복제 스트림 디코더
//!
//! CopyData 프레임을 [`ReplicationMessage`]로 풀고, XLogData 본문은 선택한 출력 플러그인
//! 디코더에 넘깁니다. 플러그인 디코더는 [`WalMessage`]만 만들고 위치는 여기서 붙입니다.
//!
//! - 행 레코드는 직전 COMMIT의 end LSN을 가짐
//! - COMMIT은 새 경계를 가진 Placeholder 레코드가 됨
//! - keepalive의 wal_end는 트랜잭션 밖일 때만 위치로 쓰임

use crate::dumper::{StreamDecoder, StreamEvent};
use crate::error::{CdcError, Result};
use crate::mppdb_decoding::MppdbDecodingDecoder;
use crate::pg_protocol::ReplicationMessage;
use crate::pgoutput::PgOutputDecoder;
use crate::position::{IngestPosition, Lsn};
use crate::record::{ChangeRecord, Operation, RecordColumn, TableMapping, TableRef};
use crate::test_decoding::TestDecodingDecoder;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// 논리 디코딩 출력 플러그인
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecodingPlugin {
    #[serde(rename = "pgoutput")]
    PgOutput,
    #[serde(rename = "test_decoding")]
    TestDecoding,
    /// openGauss
    #[serde(rename = "mppdb_decoding")]
    MppdbDecoding,
}

impl DecodingPlugin {
    pub fn name(&self) -> &'static str {
        match self {
            DecodingPlugin::PgOutput => "pgoutput",
            DecodingPlugin::TestDecoding => "test_decoding",
            DecodingPlugin::MppdbDecoding => "mppdb_decoding",
        }
    }

    /// START_REPLICATION 옵션 목록
    pub fn start_options(&self, publication: &str) -> String {
        match self {
            DecodingPlugin::PgOutput => format!(
                "\"proto_version\" '1', \"publication_names\" '{}'",
                publication.replace('\'', "''")
            ),
            DecodingPlugin::TestDecoding | DecodingPlugin::MppdbDecoding => {
                "\"include-xids\" 'true', \"include-timestamp\" 'true', \"skip-empty-xacts\" 'true'"
                    .to_string()
            }
        }
    }

    fn create_decoder(&self) -> PluginDecoder {
        match self {
            DecodingPlugin::PgOutput => PluginDecoder::PgOutput(PgOutputDecoder::new()),
            DecodingPlugin::TestDecoding => PluginDecoder::TestDecoding(TestDecodingDecoder::new()),
            DecodingPlugin::MppdbDecoding => PluginDecoder::MppdbDecoding(MppdbDecodingDecoder::new()),
        }
    }
}

impl fmt::Display for DecodingPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DecodingPlugin {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pgoutput" => Ok(DecodingPlugin::PgOutput),
            "test_decoding" => Ok(DecodingPlugin::TestDecoding),
            "mppdb_decoding" => Ok(DecodingPlugin::MppdbDecoding),
            other => Err(CdcError::ConfigError(format!("unsupported decoding plugin: {}", other))),
        }
    }
}

/// 플러그인 디코더가 XLogData 하나에서 만든 결과
#[derive(Debug, Clone, PartialEq)]
pub enum WalMessage {
    Begin {
        xid: Option<u32>,
        commit_time: Option<DateTime<Utc>>,
    },
    /// test_decoding은 end LSN을 주지 않으므로 XLogData의 wal_start를 씀
    Commit {
        end_lsn: Option<Lsn>,
        commit_time: Option<DateTime<Utc>>,
    },
    Row {
        operation: Operation,
        table: TableRef,
        before: Vec<RecordColumn>,
        after: Vec<RecordColumn>,
    },
    Truncate {
        tables: Vec<TableRef>,
    },
    Ignored,
}

/// 수집 대상 테이블 판별
#[derive(Debug, Clone, Default)]
pub struct WalScope {
    mapping: TableMapping,
    schema: Option<String>,
}

impl WalScope {
    pub fn new(mapping: TableMapping, schema: Option<String>) -> Self {
        WalScope { mapping, schema }
    }

    /// 스키마가 지정돼 있으면 그 스키마만
    pub fn resolve(&self, schema: &str, table: &str) -> Option<TableRef> {
        if let Some(expected) = &self.schema {
            if !expected.eq_ignore_ascii_case(schema) {
                return None;
            }
        }
        self.mapping.resolve(Some(schema), table)
    }
}

enum PluginDecoder {
    PgOutput(PgOutputDecoder),
    TestDecoding(TestDecodingDecoder),
    MppdbDecoding(MppdbDecodingDecoder),
}

impl PluginDecoder {
    fn decode(&mut self, data: Bytes, scope: &WalScope) -> Result<WalMessage> {
        match self {
            PluginDecoder::PgOutput(decoder) => decoder.decode(data, scope),
            PluginDecoder::TestDecoding(decoder) => decoder.decode(&data, scope),
            PluginDecoder::MppdbDecoding(decoder) => decoder.decode(&data, scope),
        }
    }

    fn reset(&mut self) {
        if let PluginDecoder::PgOutput(decoder) = self {
            decoder.clear();
        }
    }
}

pub struct WalStreamDecoder {
    plugin: PluginDecoder,
    scope: WalScope,
    ddl_enabled: bool,
    boundary: Lsn,
    in_transaction: bool,
    commit_time: Option<DateTime<Utc>>,
}

impl WalStreamDecoder {
    pub fn new(
        plugin: DecodingPlugin,
        mapping: TableMapping,
        schema: Option<String>,
        ddl_enabled: bool,
    ) -> Self {
        WalStreamDecoder {
            plugin: plugin.create_decoder(),
            scope: WalScope::new(mapping, schema),
            ddl_enabled,
            boundary: Lsn::INVALID,
            in_transaction: false,
            commit_time: None,
        }
    }

    pub fn boundary(&self) -> Lsn {
        self.boundary
    }

    fn handle_wal(&mut self, wal_start: Lsn, data: Bytes) -> Result<Vec<StreamEvent>> {
        let position = IngestPosition::Wal(self.boundary);
        match self.plugin.decode(data, &self.scope)? {
            WalMessage::Begin { xid, commit_time } => {
                debug!("BEGIN xid={:?} at {}", xid, wal_start);
                self.in_transaction = true;
                self.commit_time = commit_time;
                Ok(Vec::new())
            }
            WalMessage::Commit {
                end_lsn,
                commit_time,
            } => {
                self.in_transaction = false;
                let end = end_lsn.unwrap_or(wal_start).max(wal_start);
                self.boundary = self.boundary.max(end);
                let commit_time = commit_time.or(self.commit_time.take());
                Ok(vec![StreamEvent::Record(
                    ChangeRecord::placeholder(IngestPosition::Wal(self.boundary))
                        .with_commit_time(commit_time),
                )])
            }
            WalMessage::Row {
                operation,
                table,
                before,
                after,
            } => Ok(vec![StreamEvent::Record(
                ChangeRecord::row(operation, table, before, after, position)
                    .with_commit_time(self.commit_time),
            )]),
            WalMessage::Truncate { tables } if self.ddl_enabled => Ok(tables
                .into_iter()
                .map(|table| {
                    let sql = match &table.schema {
                        Some(schema) => format!("TRUNCATE TABLE {}.{}", schema, table.table),
                        None => format!("TRUNCATE TABLE {}", table.table),
                    };
                    StreamEvent::Record(
                        ChangeRecord::ddl(Some(table), sql, position.clone())
                            .with_commit_time(self.commit_time),
                    )
                })
                .collect()),
            WalMessage::Truncate { tables } => {
                debug!("Ignoring TRUNCATE of {} tables (DDL disabled)", tables.len());
                Ok(Vec::new())
            }
            WalMessage::Ignored => Ok(Vec::new()),
        }
    }

    fn keepalive(&mut self, wal_end: Lsn, reply_requested: bool) -> StreamEvent {
        let position = if self.in_transaction {
            None
        } else {
            self.boundary = self.boundary.max(wal_end);
            Some(IngestPosition::Wal(self.boundary))
        };
        StreamEvent::Heartbeat {
            position,
            reply_requested,
        }
    }
}

#[async_trait]
impl StreamDecoder for WalStreamDecoder {
    fn reset(&mut self, resume: &IngestPosition) -> Result<()> {
        let lsn = resume.as_lsn().ok_or_else(|| {
            CdcError::InvalidPosition(format!("{} cannot resume a WAL stream", resume))
        })?;
        self.boundary = lsn;
        self.in_transaction = false;
        self.commit_time = None;
        self.plugin.reset();
        Ok(())
    }

    async fn decode(&mut self, frame: Bytes) -> Result<Vec<StreamEvent>> {
        match ReplicationMessage::parse(frame)? {
            ReplicationMessage::XLogData {
                wal_start, data, ..
            } => self
                .handle_wal(wal_start, data)
                .map_err(|e| CdcError::EventDecode {
                    position: wal_start.to_string(),
                    source: Box::new(e),
                }),
            ReplicationMessage::PrimaryKeepalive {
                wal_end,
                reply_requested,
                ..
            } => Ok(vec![self.keepalive(wal_end, reply_requested)]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::dumper::tests::{FakeConnector, Script, Step};
    use crate::dumper::{DumperContext, IncrementalDumper};
    use crate::pg_protocol::tests::{keepalive, xlog_data};
    use crate::pgoutput::tests::{begin_message, commit_message, insert_message, relation_message};
    use crate::value::ColumnValue;
    use std::sync::Arc;
    use std::time::Duration;

    fn wal(n: u64) -> IngestPosition {
        IngestPosition::Wal(Lsn(n))
    }

    fn xlog(wal_start: u64, data: Bytes) -> Bytes {
        Bytes::from(xlog_data(wal_start, wal_start, &data))
    }

    fn text(wal_start: u64, line: &str) -> Bytes {
        Bytes::from(xlog_data(wal_start, wal_start, line.as_bytes()))
    }

    fn pgoutput_stream() -> Vec<Bytes> {
        vec![
            Bytes::from(keepalive(0x100, false)),
            xlog(0x110, begin_message(0x150, 700)),
            xlog(0x110, relation_message(16384)),
            xlog(0x120, insert_message(16384, "1", "NEW")),
            xlog(0x130, insert_message(16384, "2", "NEW")),
            Bytes::from(keepalive(0x140, true)),
            xlog(0x158, commit_message(0x150, 0x158)),
            Bytes::from(keepalive(0x200, false)),
            xlog(0x210, begin_message(0x250, 701)),
            xlog(0x220, insert_message(16384, "3", "NEW")),
            xlog(0x258, commit_message(0x250, 0x258)),
        ]
    }

    async fn decode_all(decoder: &mut WalStreamDecoder, frames: Vec<Bytes>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for frame in frames {
            events.extend(decoder.decode(frame).await.unwrap());
        }
        events
    }

    fn records(events: &[StreamEvent]) -> Vec<ChangeRecord> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Record(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_plugin_registry() {
        assert_eq!("pgoutput".parse::<DecodingPlugin>().unwrap(), DecodingPlugin::PgOutput);
        assert_eq!(
            "TEST_DECODING".parse::<DecodingPlugin>().unwrap(),
            DecodingPlugin::TestDecoding
        );
        assert_eq!(
            "mppdb_decoding".parse::<DecodingPlugin>().unwrap(),
            DecodingPlugin::MppdbDecoding
        );
        assert!("wal2json".parse::<DecodingPlugin>().is_err());
        assert_eq!(
            DecodingPlugin::PgOutput.start_options("pub_a"),
            "\"proto_version\" '1', \"publication_names\" 'pub_a'"
        );
        assert_eq!(
            serde_json::to_string(&DecodingPlugin::TestDecoding).unwrap(),
            "\"test_decoding\""
        );
    }

    #[tokio::test]
    async fn test_pgoutput_boundaries_and_keepalive() {
        let mut decoder = WalStreamDecoder::new(DecodingPlugin::PgOutput, TableMapping::new(), None, false);
        decoder.reset(&wal(0x80)).unwrap();
        let events = decode_all(&mut decoder, pgoutput_stream()).await;

        assert_eq!(
            events[0],
            StreamEvent::Heartbeat {
                position: Some(wal(0x100)),
                reply_requested: false
            }
        );
        assert!(events.contains(&StreamEvent::Heartbeat {
            position: None,
            reply_requested: true
        }));

        let records = records(&events);
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].position, wal(0x100));
        assert_eq!(records[1].position, wal(0x100));
        assert!(records[2].is_placeholder());
        assert_eq!(records[2].position, wal(0x158));
        assert_eq!(records[3].position, wal(0x200));
        assert_eq!(records[3].column("order_id").unwrap().value, ColumnValue::Int(3));
        assert_eq!(records[4].position, wal(0x258));
        assert_eq!(decoder.boundary(), Lsn(0x258));
    }

    #[tokio::test]
    async fn test_test_decoding_commit_uses_wal_start() {
        let mut decoder =
            WalStreamDecoder::new(DecodingPlugin::TestDecoding, TableMapping::new(), Some("public".into()), true);
        decoder.reset(&wal(0x10)).unwrap();
        let events = decode_all(
            &mut decoder,
            vec![
                text(0x20, "BEGIN 5"),
                text(0x28, "table public.t_order: INSERT: order_id[integer]:1"),
                text(0x29, "table audit.t_log: INSERT: id[integer]:1"),
                text(0x2A, "table public.t_order: TRUNCATE: (no-flags)"),
                text(0x40, "COMMIT 5"),
            ],
        )
        .await;

        let records = records(&events);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].position, wal(0x10));
        assert_eq!(records[1].operation, Operation::Ddl);
        assert_eq!(records[1].ddl.as_deref(), Some("TRUNCATE TABLE public.t_order"));
        assert_eq!(records[2].position, wal(0x40));
    }

    #[tokio::test]
    async fn test_mppdb_decoding_stream() {
        let mut decoder = WalStreamDecoder::new(
            DecodingPlugin::MppdbDecoding,
            TableMapping::new().with("public.t_order", "t_order"),
            None,
            false,
        );
        decoder.reset(&wal(0x10)).unwrap();
        let row = r#"{"table_name":"public.t_order","op_type":"INSERT","columns_name":["order_id","status"],"columns_type":["integer","character varying(32)"],"columns_val":["7","'NEW'"],"old_keys_name":null,"old_keys_type":null,"old_keys_val":null}"#;
        let events = decode_all(
            &mut decoder,
            vec![
                text(0x20, "BEGIN CSN: 951909 first_lsn: 0/20"),
                text(0x28, row),
                text(0x30, "commit xid: 1006076"),
                text(0x38, "BEGIN 2"),
                text(0x40, row),
                text(0x50, "COMMIT 2 (at 2022-10-27 04:19:39.476261+00) CSN 3468"),
            ],
        )
        .await;

        let records = records(&events);
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].operation, Operation::Insert);
        assert_eq!(records[0].position, wal(0x10));
        assert_eq!(records[0].table.as_ref().unwrap().logical, "t_order");
        assert_eq!(records[0].column("status").unwrap().value, ColumnValue::String("NEW".into()));
        assert!(records[1].is_placeholder());
        assert_eq!(records[1].position, wal(0x30));
        assert_eq!(records[2].position, wal(0x30));
        assert_eq!(records[3].position, wal(0x50));
        assert!(records[3].commit_time.is_some());
    }

    #[tokio::test]
    async fn test_decode_error_carries_lsn() {
        let mut decoder = WalStreamDecoder::new(DecodingPlugin::PgOutput, TableMapping::new(), None, false);
        decoder.reset(&wal(1)).unwrap();
        match decoder.decode(xlog(0x99, insert_message(5, "1", "x"))).await {
            Err(CdcError::EventDecode { position, source }) => {
                assert_eq!(position, "0/99");
                assert!(matches!(*source, CdcError::MissingTableMetadata(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(decoder
            .reset(&IngestPosition::Binlog(crate::position::BinlogPosition::new("f.1", 4)))
            .is_err());
    }

    #[tokio::test]
    async fn test_wal_stream_through_dumper() {
        let mut steps: Vec<Step> = pgoutput_stream().into_iter().map(Step::Frame).collect();
        steps.push(Step::Hang);
        let connector = FakeConnector::new(vec![Script::Frames(steps)]);
        let recorder = connector.recorder.clone();
        let channel = Arc::new(MemoryChannel::new(2));
        let context = DumperContext {
            poll_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let decoder = WalStreamDecoder::new(DecodingPlugin::PgOutput, TableMapping::new(), None, false);
        let dumper = IncrementalDumper::new(connector, decoder, &context, wal(0x80), channel.clone());
        let control = dumper.control();
        let handle = tokio::spawn(dumper.start());

        let mut received = Vec::new();
        while received.len() < 5 {
            let batch = channel.fetch(5, Duration::from_millis(500)).await;
            assert!(!batch.is_empty());
            received.extend(batch);
        }
        let positions: Vec<_> = received.iter().map(|r| r.position.clone()).collect();
        let mut sorted = positions.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(positions, sorted);

        channel.ack(&received);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(control.position(), wal(0x258));
        assert_eq!(control.acknowledged(), Some(wal(0x258)));
        // reply 요청 keepalive에 대한 즉시 보고
        assert!(!recorder.feedback.lock().is_empty());

        control.stop();
        handle.await.unwrap().unwrap();
    }
}
