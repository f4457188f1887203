//! 데이터베이스 방언 등록부
//!
//! [`DatabaseType`] 하나로 덤퍼와 위치 관리자를 고릅니다.

use crate::binlog::{BinlogStreamDecoder, MySqlTableMetadataLoader};
use crate::binlog_client::MySqlReplicationConnector;
use crate::channel::MemoryChannel;
use crate::dumper::{DumperContext, DumperControl, IncrementalDumper};
use crate::error::{CdcError, Result};
use crate::pg_client::PgReplicationConnector;
use crate::position::IngestPosition;
use crate::position_manager::{MySqlPositionManager, PgPositionManager, PositionManager};
use crate::slot::slot_name;
use crate::wal::WalStreamDecoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseType {
    #[serde(rename = "MySQL", alias = "mysql")]
    MySql,
    #[serde(rename = "PostgreSQL", alias = "postgresql", alias = "postgres")]
    PostgreSql,
}

impl DatabaseType {
    pub fn name(&self) -> &'static str {
        match self {
            DatabaseType::MySql => "MySQL",
            DatabaseType::PostgreSql => "PostgreSQL",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseType::MySql => 3306,
            DatabaseType::PostgreSql => 5432,
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatabaseType {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" => Ok(DatabaseType::MySql),
            "postgresql" | "postgres" => Ok(DatabaseType::PostgreSql),
            other => Err(CdcError::ConfigError(format!("unsupported database type: {}", other))),
        }
    }
}

pub type MySqlDumper = IncrementalDumper<MySqlReplicationConnector, BinlogStreamDecoder>;
pub type PgDumper = IncrementalDumper<PgReplicationConnector, WalStreamDecoder>;

/// 방언별 덤퍼
pub enum DialectDumper {
    MySql(MySqlDumper),
    PostgreSql(PgDumper),
}

impl DialectDumper {
    pub fn control(&self) -> DumperControl {
        match self {
            DialectDumper::MySql(dumper) => dumper.control(),
            DialectDumper::PostgreSql(dumper) => dumper.control(),
        }
    }

    pub async fn start(self) -> Result<()> {
        match self {
            DialectDumper::MySql(dumper) => dumper.start().await,
            DialectDumper::PostgreSql(dumper) => dumper.start().await,
        }
    }
}

/// 설정된 방언의 덤퍼 생성
pub fn create_dumper(
    context: &DumperContext,
    position: IngestPosition,
    channel: Arc<MemoryChannel>,
) -> Result<DialectDumper> {
    match context.database_type {
        DatabaseType::MySql => {
            if position.as_lsn().is_some() {
                return Err(CdcError::InvalidPosition(format!(
                    "{} cannot start a MySQL dumper",
                    position
                )));
            }
            let connector =
                MySqlReplicationConnector::new(context.connection.clone(), context.heartbeat_interval);
            let decoder = BinlogStreamDecoder::new(
                context.table_mapping.clone(),
                context.ddl_enabled,
                MySqlTableMetadataLoader::new(context.connection.clone()),
            );
            Ok(DialectDumper::MySql(IncrementalDumper::new(
                connector, decoder, context, position, channel,
            )))
        }
        DatabaseType::PostgreSql => {
            if position.as_lsn().is_none() {
                return Err(CdcError::InvalidPosition(format!(
                    "{} cannot start a PostgreSQL dumper",
                    position
                )));
            }
            let database = context.connection.database.as_deref().ok_or_else(|| {
                CdcError::ConfigError("PostgreSQL requires a database name".to_string())
            })?;
            let connector = PgReplicationConnector::new(
                context.connection.clone(),
                slot_name(database, &context.job_id),
                context.decoding_plugin,
                context.publication.clone(),
            );
            let decoder = WalStreamDecoder::new(
                context.decoding_plugin,
                context.table_mapping.clone(),
                context.schema.clone(),
                context.ddl_enabled,
            );
            Ok(DialectDumper::PostgreSql(IncrementalDumper::new(
                connector, decoder, context, position, channel,
            )))
        }
    }
}

/// 설정된 방언의 위치 관리자
pub fn position_manager(database_type: DatabaseType) -> Box<dyn PositionManager> {
    match database_type {
        DatabaseType::MySql => Box::new(MySqlPositionManager),
        DatabaseType::PostgreSql => Box::new(PgPositionManager),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::dumper::DumperState;
    use crate::position::{BinlogPosition, Lsn};

    #[test]
    fn test_database_type_names() {
        assert_eq!("MySQL".parse::<DatabaseType>().unwrap(), DatabaseType::MySql);
        assert_eq!("postgres".parse::<DatabaseType>().unwrap(), DatabaseType::PostgreSql);
        assert!("oracle".parse::<DatabaseType>().is_err());
        assert_eq!(
            serde_json::from_str::<DatabaseType>("\"PostgreSQL\"").unwrap(),
            DatabaseType::PostgreSql
        );
        assert_eq!(DatabaseType::PostgreSql.default_port(), 5432);
    }

    #[test]
    fn test_create_dumper_per_dialect() {
        let channel = Arc::new(MemoryChannel::new(4));
        let mysql = DumperContext::default();
        let dumper = create_dumper(
            &mysql,
            IngestPosition::Binlog(BinlogPosition::new("mysql-bin.000001", 4)),
            channel.clone(),
        )
        .unwrap();
        assert!(matches!(dumper, DialectDumper::MySql(_)));
        assert_eq!(dumper.control().state(), DumperState::Idle);
        assert!(create_dumper(&mysql, IngestPosition::Wal(Lsn(1)), channel.clone()).is_err());

        let mut pg = DumperContext {
            database_type: DatabaseType::PostgreSql,
            connection: ConnectionConfig::new("localhost", "postgres")
                .with_port(5432)
                .with_database("shop"),
            ..Default::default()
        };
        assert!(matches!(
            create_dumper(&pg, IngestPosition::Wal(Lsn(1)), channel.clone()).unwrap(),
            DialectDumper::PostgreSql(_)
        ));
        pg.connection.database = None;
        assert!(matches!(
            create_dumper(&pg, IngestPosition::Wal(Lsn(1)), channel),
            Err(CdcError::ConfigError(_))
        ));
    }

    #[test]
    fn test_position_manager_registry() {
        let manager = position_manager(DatabaseType::PostgreSql);
        assert!(manager.init_from_text("0/10").is_ok());
        assert!(manager.init_from_text("mysql-bin.000001:4").is_err());
        assert!(position_manager(DatabaseType::MySql)
            .init_from_text("mysql-bin.000001:4")
            .is_ok());
    }
}
