//! PostgreSQL 논리 복제 슬롯 관리
//!
//! 슬롯 이름은 데이터베이스와 작업 ID로 정해지므로 재연결해도 같은 슬롯을 씁니다.
//! 동시에 같은 슬롯을 만들다 SQLSTATE 42710(duplicate_object)이 나면 이미 있는 것으로 봅니다.

use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::position::Lsn;
use crate::wal::DecodingPlugin;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

const SLOT_NAME_PREFIX: &str = "pipeline_";

/// `pipeline_` + md5("{database}_{job_id}")
pub fn slot_name(database: &str, job_id: &str) -> String {
    format!(
        "{}{:x}",
        SLOT_NAME_PREFIX,
        md5::compute(format!("{}_{}", database, job_id))
    )
}

/// 슬롯 생성 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotCreation {
    Created,
    AlreadyExists,
    /// 다른 데이터베이스에 남아 있던 슬롯을 지우고 새로 만듦
    Recreated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub name: String,
    pub database: Option<String>,
    pub plugin: Option<String>,
    pub active: bool,
}

/// `pg_replication_slots` 조회와 슬롯 생성 / 삭제
#[async_trait]
pub trait SlotCatalog: Send + Sync {
    async fn find_slot(&self, name: &str) -> Result<Option<SlotInfo>>;

    /// 이미 있으면 SQLSTATE 42710 에러
    async fn create_slot(&self, name: &str, plugin: DecodingPlugin) -> Result<()>;

    async fn drop_slot(&self, name: &str) -> Result<()>;

    async fn current_wal_lsn(&self) -> Result<Lsn>;
}

#[async_trait]
impl<T: SlotCatalog + ?Sized> SlotCatalog for Arc<T> {
    async fn find_slot(&self, name: &str) -> Result<Option<SlotInfo>> {
        (**self).find_slot(name).await
    }

    async fn create_slot(&self, name: &str, plugin: DecodingPlugin) -> Result<()> {
        (**self).create_slot(name, plugin).await
    }

    async fn drop_slot(&self, name: &str) -> Result<()> {
        (**self).drop_slot(name).await
    }

    async fn current_wal_lsn(&self) -> Result<Lsn> {
        (**self).current_wal_lsn().await
    }
}

/// tokio_postgres 에러를 CDC 에러로 (서버 에러는 SQLSTATE 유지)
pub(crate) fn map_pg_error(context: &str, err: tokio_postgres::Error) -> CdcError {
    match err.as_db_error() {
        Some(db) => CdcError::QueryError {
            message: format!("{}: {}", context, db.message()),
            sql_state: Some(db.code().code().to_string()),
        },
        None => CdcError::ConnectionError(format!("{}: {}", context, err)),
    }
}

/// 일반 SQL 연결 위의 카탈로그
pub struct PgSlotCatalog {
    client: Client,
    server_version: i32,
}

impl PgSlotCatalog {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&config.hostname)
            .port(config.port)
            .user(&config.username)
            .password(&config.password)
            .connect_timeout(config.timeout);
        if let Some(database) = &config.database {
            pg_config.dbname(database);
        }

        let (client, connection) = pg_config
            .connect(NoTls)
            .await
            .map_err(|e| map_pg_error("Failed to connect to PostgreSQL", e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        let version: String = client
            .query_one("SHOW server_version_num", &[])
            .await
            .map_err(|e| map_pg_error("Failed to query server_version_num", e))?
            .try_get(0)
            .map_err(|e| map_pg_error("Failed to read server_version_num", e))?;
        let server_version = version
            .trim()
            .parse()
            .map_err(|_| CdcError::query(format!("invalid server_version_num {}", version)))?;
        debug!("Connected to PostgreSQL {} (version {})", config.address(), server_version);

        Ok(PgSlotCatalog {
            client,
            server_version,
        })
    }

    pub fn server_version(&self) -> i32 {
        self.server_version
    }
}

#[async_trait]
impl SlotCatalog for PgSlotCatalog {
    async fn find_slot(&self, name: &str) -> Result<Option<SlotInfo>> {
        let row = self
            .client
            .query_opt(
                "SELECT slot_name::text, database::text, plugin::text, active \
                 FROM pg_replication_slots WHERE slot_name = $1",
                &[&name],
            )
            .await
            .map_err(|e| map_pg_error("Failed to query replication slots", e))?;

        row.map(|row| {
            let read = |e| map_pg_error("Failed to read replication slot", e);
            Ok(SlotInfo {
                name: row.try_get(0).map_err(read)?,
                database: row.try_get(1).map_err(read)?,
                plugin: row.try_get(2).map_err(read)?,
                active: row.try_get(3).map_err(read)?,
            })
        })
        .transpose()
    }

    async fn create_slot(&self, name: &str, plugin: DecodingPlugin) -> Result<()> {
        self.client
            .query(
                "SELECT * FROM pg_create_logical_replication_slot($1, $2)",
                &[&name, &plugin.name()],
            )
            .await
            .map_err(|e| map_pg_error("Failed to create replication slot", e))?;
        Ok(())
    }

    async fn drop_slot(&self, name: &str) -> Result<()> {
        self.client
            .query("SELECT pg_drop_replication_slot($1)", &[&name])
            .await
            .map_err(|e| map_pg_error("Failed to drop replication slot", e))?;
        Ok(())
    }

    async fn current_wal_lsn(&self) -> Result<Lsn> {
        let sql = if self.server_version >= 100_000 {
            "SELECT pg_current_wal_lsn()::text"
        } else {
            "SELECT pg_current_xlog_location()::text"
        };
        let text: String = self
            .client
            .query_one(sql, &[])
            .await
            .map_err(|e| map_pg_error("Failed to query current WAL position", e))?
            .try_get(0)
            .map_err(|e| map_pg_error("Failed to read current WAL position", e))?;
        text.parse()
    }
}

/// 슬롯 수명 관리
pub struct SlotManager<C> {
    catalog: C,
    database: String,
}

impl<C: SlotCatalog> SlotManager<C> {
    pub fn new(catalog: C, database: impl Into<String>) -> Self {
        SlotManager {
            catalog,
            database: database.into(),
        }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// 없으면 만들고, 다른 데이터베이스의 슬롯이면 다시 만듦
    pub async fn create(&self, name: &str, plugin: DecodingPlugin) -> Result<SlotCreation> {
        match self.catalog.find_slot(name).await? {
            Some(existing) if existing.database.as_deref() == Some(self.database.as_str()) => {
                if existing.plugin.as_deref() != Some(plugin.name()) {
                    warn!(
                        "Slot {} uses plugin {:?}, expected {}",
                        name,
                        existing.plugin,
                        plugin.name()
                    );
                }
                info!("Replication slot {} already exists", name);
                Ok(SlotCreation::AlreadyExists)
            }
            Some(stale) => {
                warn!(
                    "Replication slot {} belongs to database {:?}, recreating for {}",
                    name, stale.database, self.database
                );
                self.catalog.drop_slot(name).await?;
                Ok(match self.try_create(name, plugin).await? {
                    SlotCreation::Created => SlotCreation::Recreated,
                    other => other,
                })
            }
            None => self.try_create(name, plugin).await,
        }
    }

    async fn try_create(&self, name: &str, plugin: DecodingPlugin) -> Result<SlotCreation> {
        match self.catalog.create_slot(name, plugin).await {
            Ok(()) => {
                info!("Created replication slot {} with {}", name, plugin);
                Ok(SlotCreation::Created)
            }
            Err(e) if e.sql_state() == Some(SqlState::DUPLICATE_OBJECT.code()) => {
                info!("Replication slot {} was created concurrently", name);
                Ok(SlotCreation::AlreadyExists)
            }
            Err(e) => Err(e),
        }
    }

    /// 슬롯이 있으면 삭제. 삭제했으면 `true`
    pub async fn destroy(&self, name: &str) -> Result<bool> {
        if self.catalog.find_slot(name).await?.is_none() {
            return Ok(false);
        }
        match self.catalog.drop_slot(name).await {
            Ok(()) => {
                info!("Dropped replication slot {}", name);
                Ok(true)
            }
            Err(e) if e.sql_state() == Some(SqlState::UNDEFINED_OBJECT.code()) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
