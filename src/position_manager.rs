//! 증분 수집 시작 위치 관리
//!
//! 저장된 위치 텍스트가 있으면 그대로 파싱하고, 없으면 데이터 소스의 현재 위치를 조회합니다.
//! PostgreSQL은 위치를 정하기 전에 복제 슬롯을 만들어 둡니다.

use crate::connection::MySqlConnection;
use crate::dumper::DumperContext;
use crate::error::{CdcError, Result};
use crate::position::IngestPosition;
use crate::slot::{slot_name, PgSlotCatalog, SlotCatalog, SlotCreation, SlotManager};
use async_trait::async_trait;
use tracing::{info, warn};

#[async_trait]
pub trait PositionManager: Send + Sync {
    /// 데이터 소스의 현재 위치
    async fn init_from_data_source(&self, context: &DumperContext) -> Result<IngestPosition>;

    /// 저장해 둔 위치 텍스트
    fn init_from_text(&self, text: &str) -> Result<IngestPosition>;

    /// 작업이 남긴 서버 자원 정리
    async fn destroy(&self, context: &DumperContext) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlPositionManager;

#[async_trait]
impl PositionManager for MySqlPositionManager {
    async fn init_from_data_source(&self, context: &DumperContext) -> Result<IngestPosition> {
        let mut connection = MySqlConnection::connect(&context.connection).await?;
        let position = if context.prefer_gtid && connection.is_gtid_mode_enabled().await? {
            IngestPosition::Gtid(connection.get_executed_gtid_set().await?)
        } else {
            if context.prefer_gtid {
                warn!("GTID position requested but gtid_mode is OFF, using binlog file position");
            }
            IngestPosition::Binlog(connection.get_binlog_status().await?.position)
        };
        connection.close().await?;
        info!("Initial MySQL position for job {}: {}", context.job_id, position);
        Ok(position)
    }

    fn init_from_text(&self, text: &str) -> Result<IngestPosition> {
        match text.parse()? {
            IngestPosition::Wal(lsn) => Err(CdcError::InvalidPosition(format!(
                "{} is a WAL position, expected binlog file:offset or GTID set",
                lsn
            ))),
            position => Ok(position),
        }
    }

    async fn destroy(&self, _context: &DumperContext) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PgPositionManager;

impl PgPositionManager {
    fn database(context: &DumperContext) -> Result<&str> {
        context
            .connection
            .database
            .as_deref()
            .ok_or_else(|| CdcError::ConfigError("PostgreSQL requires a database name".to_string()))
    }

    /// 슬롯을 준비한 뒤 현재 WAL 위치
    pub async fn init_with_catalog<C: SlotCatalog>(
        catalog: C,
        context: &DumperContext,
    ) -> Result<IngestPosition> {
        let database = Self::database(context)?;
        let name = slot_name(database, &context.job_id);
        let manager = SlotManager::new(catalog, database);
        match manager.create(&name, context.decoding_plugin).await? {
            SlotCreation::Recreated => warn!("Replication slot {} was recreated", name),
            creation => info!("Replication slot {}: {:?}", name, creation),
        }
        let lsn = manager.catalog().current_wal_lsn().await?;
        info!("Initial WAL position for job {}: {}", context.job_id, lsn);
        Ok(IngestPosition::Wal(lsn))
    }

    pub async fn destroy_with_catalog<C: SlotCatalog>(catalog: C, context: &DumperContext) -> Result<()> {
        let database = Self::database(context)?;
        let name = slot_name(database, &context.job_id);
        SlotManager::new(catalog, database).destroy(&name).await?;
        Ok(())
    }
}

#[async_trait]
impl PositionManager for PgPositionManager {
    async fn init_from_data_source(&self, context: &DumperContext) -> Result<IngestPosition> {
        let catalog = PgSlotCatalog::connect(&context.connection).await?;
        Self::init_with_catalog(catalog, context).await
    }

    fn init_from_text(&self, text: &str) -> Result<IngestPosition> {
        match text.parse()? {
            IngestPosition::Wal(lsn) => Ok(IngestPosition::Wal(lsn)),
            other => Err(CdcError::InvalidPosition(format!(
                "{} is not a WAL LSN",
                other
            ))),
        }
    }

    async fn destroy(&self, context: &DumperContext) -> Result<()> {
        let catalog = PgSlotCatalog::connect(&context.connection).await?;
        Self::destroy_with_catalog(catalog, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::dialect::DatabaseType;
    use crate::position::Lsn;
    use crate::slot::tests::InMemorySlotCatalog;
    use std::sync::Arc;

    fn pg_context() -> DumperContext {
        DumperContext {
            job_id: "j1".into(),
            database_type: DatabaseType::PostgreSql,
            connection: ConnectionConfig::new("localhost", "postgres")
                .with_port(5432)
                .with_database("shop"),
            ..Default::default()
        }
    }

    #[test]
    fn test_init_from_text_checks_dialect() {
        let mysql = MySqlPositionManager;
        assert_eq!(
            mysql.init_from_text("mysql-bin.000002:120").unwrap().to_string(),
            "mysql-bin.000002:120"
        );
        assert!(matches!(
            mysql
                .init_from_text("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5")
                .unwrap(),
            IngestPosition::Gtid(_)
        ));
        assert!(mysql.init_from_text("0/16B3748").is_err());

        let pg = PgPositionManager;
        assert_eq!(
            pg.init_from_text("0/16B3748").unwrap(),
            IngestPosition::Wal(Lsn(0x16B_3748))
        );
        assert!(pg.init_from_text("mysql-bin.000002:120").is_err());
        assert!(pg.init_from_text("").is_err());
    }

    #[tokio::test]
    async fn test_pg_init_creates_slot_and_reads_lsn() {
        let catalog = Arc::new(InMemorySlotCatalog {
            wal_lsn: Lsn(0x3000),
            ..Default::default()
        });
        let context = pg_context();

        let position = PgPositionManager::init_with_catalog(catalog.clone(), &context)
            .await
            .unwrap();
        assert_eq!(position, IngestPosition::Wal(Lsn(0x3000)));
        let name = slot_name("shop", "j1");
        assert!(catalog.slots.lock().contains_key(&name));

        // 두 번째 초기화는 기존 슬롯 재사용
        PgPositionManager::init_with_catalog(catalog.clone(), &context)
            .await
            .unwrap();
        assert_eq!(catalog.slots.lock().len(), 1);

        PgPositionManager::destroy_with_catalog(catalog.clone(), &context)
            .await
            .unwrap();
        assert!(catalog.slots.lock().is_empty());
    }

    #[tokio::test]
    async fn test_pg_requires_database() {
        let mut context = pg_context();
        context.connection.database = None;
        let catalog = InMemorySlotCatalog::default();
        assert!(matches!(
            PgPositionManager::init_with_catalog(catalog, &context).await,
            Err(CdcError::ConfigError(_))
        ));
    }
}
