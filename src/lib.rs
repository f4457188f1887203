//! MySQL binlog / PostgreSQL WAL 증분 수집(CDC) 핵심 구현
//!
//! 복제 스트림을 읽어 행 변경을 [`ChangeRecord`]로 바꾸고, 재시작 가능한 위치와 함께
//! bounded [`MemoryChannel`]에 넣습니다.
//!
//! 주요 구성:
//! - MySQL binlog 프로토콜과 이벤트 파싱 (`protocol`, `binlog_client`, `binlog`, `events`)
//! - PostgreSQL 복제 프로토콜과 논리 디코딩 (`pg_protocol`, `pg_client`, `pgoutput`, `test_decoding`, `mppdb_decoding`, `wal`)
//! - 위치와 슬롯 관리 (`position`, `position_manager`, `slot`)
//! - 재연결과 상태 보고를 맡는 증분 덤퍼 (`dumper`)

pub mod auth;
pub mod binlog;
pub mod binlog_client;
pub mod channel;
pub mod config;
pub mod connection;
pub mod decimal;
pub mod dialect;
pub mod dumper;
pub mod error;
pub mod events;
pub mod gtid;
pub mod json;
pub mod mppdb_decoding;
pub mod payload;
pub mod pg_client;
pub mod pg_protocol;
pub mod pg_value;
pub mod pgoutput;
pub mod position;
pub mod position_manager;
pub mod protocol;
pub mod record;
pub mod slot;
pub mod test_decoding;
pub mod value;
pub mod wal;

pub use channel::MemoryChannel;
pub use config::PipelineConfig;
pub use connection::{ConnectionConfig, MySqlConnection};
pub use dialect::{create_dumper, position_manager, DatabaseType, DialectDumper};
pub use dumper::{DumperContext, DumperControl, DumperState, IncrementalDumper, RetryPolicy};
pub use error::{CdcError, Result};
pub use gtid::GtidSet;
pub use position::{BinlogPosition, IngestPosition, Lsn};
pub use position_manager::PositionManager;
pub use record::{ChangeRecord, Operation, TableMapping, TableRef};
pub use value::ColumnValue;
pub use wal::DecodingPlugin;
