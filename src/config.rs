//! 파이프라인 설정 (JSON 파일 또는 환경 변수)
//!
//! 시간 값은 모두 밀리초입니다. [`PipelineConfig::into_context`]가 검증 후
//! [`DumperContext`]로 바꿉니다.

use crate::connection::ConnectionConfig;
use crate::dialect::DatabaseType;
use crate::dumper::{DumperContext, RetryPolicy};
use crate::error::{CdcError, Result};
use crate::record::TableMapping;
use crate::wal::DecodingPlugin;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "CDC_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub job_id: String,
    pub database_type: DatabaseType,
    pub hostname: String,
    /// 없으면 방언 기본 포트
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    pub server_id: u32,
    pub schema: Option<String>,
    /// 실제 테이블 -> 논리 테이블. 비어 있으면 전체 수집
    pub tables: HashMap<String, String>,
    pub ddl_enabled: bool,
    pub prefer_gtid: bool,
    pub decoding_plugin: DecodingPlugin,
    pub publication: String,
    pub connect_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub status_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let context = DumperContext::default();
        PipelineConfig {
            job_id: context.job_id,
            database_type: context.database_type,
            hostname: context.connection.hostname,
            port: None,
            username: context.connection.username,
            password: context.connection.password,
            database: None,
            server_id: context.connection.server_id,
            schema: None,
            tables: HashMap::new(),
            ddl_enabled: context.ddl_enabled,
            prefer_gtid: context.prefer_gtid,
            decoding_plugin: context.decoding_plugin,
            publication: context.publication,
            connect_timeout_ms: millis(context.connection.timeout),
            poll_timeout_ms: millis(context.poll_timeout),
            status_interval_ms: millis(context.status_interval),
            heartbeat_interval_ms: millis(context.heartbeat_interval),
            retry_max_attempts: context.retry.max_attempts,
            retry_initial_backoff_ms: millis(context.retry.initial_backoff),
            retry_max_backoff_ms: millis(context.retry.max_backoff),
            channel_capacity: context.channel_capacity,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl PipelineConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CdcError::ConfigError(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// `CDC_` 접두사 환경 변수 (CDC_HOST, CDC_PORT, CDC_TABLES="t_order_0=t_order,..." 등)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = PipelineConfig::default();

        if let Some(v) = get("JOB_ID") {
            config.job_id = v;
        }
        if let Some(v) = get("DATABASE_TYPE") {
            config.database_type = v.parse()?;
        }
        if let Some(v) = get("HOST") {
            config.hostname = v;
        }
        if let Some(v) = get("PORT") {
            config.port = Some(parse_env("PORT", &v)?);
        }
        if let Some(v) = get("USER") {
            config.username = v;
        }
        if let Some(v) = get("PASSWORD") {
            config.password = v;
        }
        config.database = get("DATABASE").or(config.database);
        config.schema = get("SCHEMA").or(config.schema);
        if let Some(v) = get("SERVER_ID") {
            config.server_id = parse_env("SERVER_ID", &v)?;
        }
        if let Some(v) = get("TABLES") {
            config.tables = parse_tables(&v)?;
        }
        if let Some(v) = get("DDL_ENABLED") {
            config.ddl_enabled = parse_env("DDL_ENABLED", &v)?;
        }
        if let Some(v) = get("PREFER_GTID") {
            config.prefer_gtid = parse_env("PREFER_GTID", &v)?;
        }
        if let Some(v) = get("DECODING_PLUGIN") {
            config.decoding_plugin = v.parse()?;
        }
        if let Some(v) = get("PUBLICATION") {
            config.publication = v;
        }
        if let Some(v) = get("CHANNEL_CAPACITY") {
            config.channel_capacity = parse_env("CHANNEL_CAPACITY", &v)?;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_id.trim().is_empty() {
            return Err(CdcError::ConfigError("job_id must not be empty".to_string()));
        }
        if self.hostname.trim().is_empty() {
            return Err(CdcError::ConfigError("hostname must not be empty".to_string()));
        }
        if self.port == Some(0) {
            return Err(CdcError::ConfigError("port must not be 0".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(CdcError::ConfigError("channel_capacity must be positive".to_string()));
        }
        if self.retry_max_attempts == 0 {
            return Err(CdcError::ConfigError("retry_max_attempts must be positive".to_string()));
        }
        if self.database_type == DatabaseType::PostgreSql && self.database.is_none() {
            return Err(CdcError::ConfigError("PostgreSQL requires a database name".to_string()));
        }
        if self.database_type == DatabaseType::MySql && self.server_id == 0 {
            return Err(CdcError::ConfigError("server_id must not be 0 for MySQL".to_string()));
        }
        Ok(())
    }

    pub fn into_context(self) -> Result<DumperContext> {
        self.validate()?;
        let connection = ConnectionConfig {
            hostname: self.hostname,
            port: self.port.unwrap_or_else(|| self.database_type.default_port()),
            username: self.username,
            password: self.password,
            database: self.database,
            server_id: self.server_id,
            timeout: Duration::from_millis(self.connect_timeout_ms),
        };

        Ok(DumperContext {
            job_id: self.job_id,
            database_type: self.database_type,
            connection,
            schema: self.schema,
            table_mapping: self.tables.iter().collect::<TableMapping>(),
            ddl_enabled: self.ddl_enabled,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            },
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            status_interval: Duration::from_millis(self.status_interval_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            decoding_plugin: self.decoding_plugin,
            publication: self.publication,
            prefer_gtid: self.prefer_gtid,
            channel_capacity: self.channel_capacity,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CdcError::ConfigError(format!("invalid {}{}: {}", ENV_PREFIX, name, value)))
}

/// "actual=logical,actual2" (논리 이름이 없으면 실제 이름 그대로)
fn parse_tables(text: &str) -> Result<HashMap<String, String>> {
    let mut tables = HashMap::new();
    for entry in text.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (actual, logical) = match entry.split_once('=') {
            Some((actual, logical)) => (actual.trim(), logical.trim()),
            None => (entry, entry.rsplit('.').next().unwrap_or(entry)),
        };
        if actual.is_empty() || logical.is_empty() {
            return Err(CdcError::ConfigError(format!("invalid table mapping entry: {}", entry)));
        }
        tables.insert(actual.to_string(), logical.to_string());
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_context() {
        let context = PipelineConfig {
            database: Some("shop".into()),
            ..Default::default()
        }
        .into_context()
        .unwrap();
        assert_eq!(context.retry, RetryPolicy::default());
        assert_eq!(context.poll_timeout, Duration::from_secs(1));
        assert_eq!(context.connection.port, 3306);
        assert!(context.table_mapping.is_empty());
    }

    #[test]
    fn test_from_json() {
        let config = PipelineConfig::from_json(
            r#"{
                "job_id": "j1",
                "database_type": "PostgreSQL",
                "hostname": "pg.local",
                "username": "repl",
                "database": "shop",
                "schema": "public",
                "tables": {"public.t_order_0": "t_order"},
                "decoding_plugin": "test_decoding",
                "status_interval_ms": 2500
            }"#,
        )
        .unwrap();
        let context = config.into_context().unwrap();
        assert_eq!(context.database_type, DatabaseType::PostgreSql);
        assert_eq!(context.connection.port, 5432);
        assert_eq!(context.decoding_plugin, DecodingPlugin::TestDecoding);
        assert_eq!(context.status_interval, Duration::from_millis(2500));
        assert_eq!(
            context
                .table_mapping
                .resolve(Some("public"), "t_order_0")
                .unwrap()
                .logical,
            "t_order"
        );

        assert!(PipelineConfig::from_json("{\"port\": \"x\"}").is_err());
    }

    #[test]
    fn test_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("CDC_DATABASE_TYPE", "mysql"),
            ("CDC_HOST", "mysql.local"),
            ("CDC_PORT", "13306"),
            ("CDC_SERVER_ID", "42"),
            ("CDC_TABLES", "shop.t_order_0=t_order, t_user"),
            ("CDC_PREFER_GTID", "true"),
        ]
        .into_iter()
        .collect();
        let config = PipelineConfig::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.hostname, "mysql.local");
        assert_eq!(config.port, Some(13306));
        assert_eq!(config.server_id, 42);
        assert!(config.prefer_gtid);
        assert_eq!(config.tables.get("t_user").map(String::as_str), Some("t_user"));

        let bad = PipelineConfig::from_lookup(|key| (key == "CDC_PORT").then(|| "abc".to_string()));
        assert!(matches!(bad, Err(CdcError::ConfigError(_))));
    }

    #[test]
    fn test_validation() {
        let pg = PipelineConfig {
            database_type: DatabaseType::PostgreSql,
            ..Default::default()
        };
        assert!(pg.into_context().is_err());

        let empty_capacity = PipelineConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(empty_capacity.validate(), Err(CdcError::ConfigError(_))));
    }
}
