//! 데이터베이스 연결 설정 및 MySQL 메타데이터 연결 관리

use crate::error::{CdcError, Result};
use crate::gtid::GtidSet;
use crate::position::BinlogPosition;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Row};
use std::time::Duration;
use tracing::{debug, warn};

/// 연결 설정 (MySQL / PostgreSQL 공용)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// MySQL replica server id
    pub server_id: u32,
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            server_id: 1,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone())
            .into()
    }
}

/// mysql_async 에러를 CDC 에러로
pub(crate) fn map_mysql_error(context: &str, err: mysql_async::Error) -> CdcError {
    match err {
        mysql_async::Error::Server(e) => CdcError::QueryError {
            message: format!("{}: {}", context, e.message),
            sql_state: Some(e.state),
        },
        mysql_async::Error::Io(e) => CdcError::ConnectionError(format!("{}: {}", context, e)),
        other => CdcError::query(format!("{}: {}", context, other)),
    }
}

/// MySQL 연결 래퍼 (위치 조회, 스키마 조회용 일반 연결)
pub struct MySqlConnection {
    conn: Conn,
}

impl MySqlConnection {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let connect = Conn::new(config.build_opts());
        let conn = tokio::time::timeout(config.timeout, connect)
            .await
            .map_err(|_| CdcError::Timeout)?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;
        debug!("Connected to MySQL {}", config.address());
        Ok(MySqlConnection { conn })
    }

    /// 현재 binlog 위치 조회
    ///
    /// 8.2+ 의 `SHOW BINARY LOG STATUS`를 먼저 시도하고 실패하면 `SHOW MASTER STATUS`
    pub async fn get_binlog_status(&mut self) -> Result<BinlogStatus> {
        let rows: Vec<Row> = match self.conn.query("SHOW BINARY LOG STATUS").await {
            Ok(rows) => rows,
            Err(mysql_async::Error::Server(e)) => {
                debug!("SHOW BINARY LOG STATUS unsupported ({}), falling back", e.message);
                self.conn
                    .query("SHOW MASTER STATUS")
                    .await
                    .map_err(|e| map_mysql_error("Failed to query binlog status", e))?
            }
            Err(e) => return Err(map_mysql_error("Failed to query binlog status", e)),
        };

        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| CdcError::query("No binlog status available (is log_bin enabled?)"))?;
        let file: String = column(&row, 0)?;
        let position: u64 = column(&row, 1)?;
        let executed_gtid_set = match row.get_opt::<String, _>(4) {
            Some(Ok(text)) => text.parse().unwrap_or_else(|e| {
                warn!("Ignoring unparsable Executed_Gtid_Set: {}", e);
                GtidSet::new()
            }),
            _ => GtidSet::new(),
        };

        Ok(BinlogStatus {
            position: BinlogPosition::new(file, position),
            executed_gtid_set,
        })
    }

    /// GTID 모드 활성 여부 확인
    pub async fn is_gtid_mode_enabled(&mut self) -> Result<bool> {
        Ok(self
            .get_variable("gtid_mode")
            .await?
            .map(|v| v.eq_ignore_ascii_case("ON"))
            .unwrap_or(false))
    }

    /// 현재 실행된 GTID 집합 조회
    pub async fn get_executed_gtid_set(&mut self) -> Result<GtidSet> {
        let result: Option<String> = self
            .conn
            .query_first("SELECT @@global.gtid_executed")
            .await
            .map_err(|e| map_mysql_error("Failed to query gtid_executed", e))?;
        match result {
            Some(text) => text.parse(),
            None => Ok(GtidSet::new()),
        }
    }

    /// 변수 조회
    pub async fn get_variable(&mut self, name: &str) -> Result<Option<String>> {
        let result: Option<(String, String)> = self
            .conn
            .exec_first("SHOW GLOBAL VARIABLES LIKE ?", (name,))
            .await
            .map_err(|e| map_mysql_error(&format!("Failed to query {}", name), e))?;
        Ok(result.map(|(_, v)| v))
    }

    /// 테이블 스키마 조회
    pub async fn get_table_schema(&mut self, database: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let result: Vec<(String, String, String)> = self
            .conn
            .exec(
                "SELECT COLUMN_NAME, IS_NULLABLE, COLUMN_KEY \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (database, table),
            )
            .await
            .map_err(|e| map_mysql_error("Failed to query table schema", e))?;

        Ok(result
            .into_iter()
            .map(|(name, is_nullable, column_key)| ColumnInfo {
                name,
                nullable: is_nullable == "YES",
                primary_key: column_key == "PRI",
            })
            .collect())
    }

    pub async fn close(self) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| map_mysql_error("Failed to disconnect", e))
    }
}

fn column<T: FromValue>(row: &Row, index: usize) -> Result<T> {
    match row.get_opt::<T, _>(index) {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(CdcError::query(format!("column {}: {}", index, e))),
        None => Err(CdcError::query(format!("column {} missing", index))),
    }
}

/// Binlog 상태
#[derive(Debug, Clone)]
pub struct BinlogStatus {
    pub position: BinlogPosition,
    pub executed_gtid_set: GtidSet,
}

/// 테이블 컬럼 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub nullable: bool,
    pub primary_key: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_connection_config_builder() {
        let config = ConnectionConfig::new("127.0.0.1", "repl")
            .with_port(13306)
            .with_password("pw")
            .with_database("shop")
            .with_server_id(77);
        assert_eq!(config.address(), "127.0.0.1:13306");
        assert_eq!(config.username, "repl");
        assert_eq!(config.database.as_deref(), Some("shop"));
        assert_eq!(config.server_id, 77);
    }

    #[test]
    fn test_map_mysql_error_keeps_sql_state() {
        let err = map_mysql_error(
            "probe",
            mysql_async::Error::Server(mysql_async::ServerError {
                code: 1064,
                message: "syntax".into(),
                state: "42000".into(),
            }),
        );
        assert_eq!(err.sql_state(), Some("42000"));
        assert!(!err.is_retryable());
    }
}
